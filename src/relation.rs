//! Relation resolution
//!
//! A connection field is classified by `linkType:linkViaType` (seen from the
//! object owning the field, `A`, towards the linked object, `B`):
//!
//! | shape       | where the link lives                                   |
//! |-------------|--------------------------------------------------------|
//! | one:many    | `A` holds the foreign key in the field's own column    |
//! | many:one    | `B` holds the foreign key in the reverse field column  |
//! | one:one     | the `isSource` side holds the foreign key              |
//! | many:many   | a junction table with one column per side              |
//!
//! Join keys default to each side's primary key column; `indexField` and
//! `indexField2` replace the key of whichever object owns the named field.

use futures::future::try_join_all;
use std::collections::{HashMap, HashSet};

use crate::config::EngineConfig;
use crate::db::{Database, fetch_with_retry};
use crate::error::Result;
use crate::notify::{DeveloperNotifier, NoticeKind};
use crate::record::{Populate, Record};
use crate::schema::{ObjectDefinition, PrimaryKey};
use crate::sql::sanitize::{
    literal, quote_identifier, quote_qualified, truncate_identifier, value_text,
};
use crate::tenant::{MetadataSnapshot, TenantContext};
use crate::types::{ConnectSettings, FieldDefinition, LinkType};

/// Column added to junction batch reads to carry the owning row's key
const PARENT_KEY: &str = "__parent";

/// Relation shape, by `linkType:linkViaType`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Shape {
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
}

impl Shape {
    pub fn of(settings: &ConnectSettings) -> Self {
        match (settings.link_type, settings.link_via_type) {
            (LinkType::One, LinkType::One) => Shape::OneToOne,
            (LinkType::One, LinkType::Many) => Shape::OneToMany,
            (LinkType::Many, LinkType::One) => Shape::ManyToOne,
            (LinkType::Many, LinkType::Many) => Shape::ManyToMany,
        }
    }
}

/// How the base table reaches the linked table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinSpec {
    /// The base table's `fk` column holds the linked `target_key`
    OwnColumn { fk: String, target_key: String },
    /// The linked table's `fk` column holds the base `source_key`
    LinkedColumn { fk: String, source_key: String },
    /// A junction row pairs `source_column` (base key) with `target_column` (linked key)
    Junction {
        table: String,
        source_column: String,
        target_column: String,
        source_key: String,
        target_key: String,
    },
}

impl JoinSpec {
    /// Column of the base table the relation is keyed by
    pub fn base_column(&self) -> &str {
        match self {
            JoinSpec::OwnColumn { fk, .. } => fk,
            JoinSpec::LinkedColumn { source_key, .. } => source_key,
            JoinSpec::Junction { source_key, .. } => source_key,
        }
    }

    /// Column of the linked table identifying a linked record
    pub fn linked_key<'a>(&'a self, linked: &'a ObjectDefinition) -> &'a str {
        match self {
            JoinSpec::OwnColumn { target_key, .. } => target_key,
            JoinSpec::LinkedColumn { .. } => linked.primary_column(),
            JoinSpec::Junction { target_key, .. } => target_key,
        }
    }
}

/// One resolved connection field
#[derive(Debug, Clone, PartialEq)]
pub struct RelationJoin {
    pub field_id: String,
    pub column: String,
    /// Property the populated value is attached under
    pub relation_name: String,
    pub shape: Shape,
    pub linked_object: String,
    pub linked_table: String,
    /// Whether a record links to many records through this field
    pub many: bool,
    pub spec: JoinSpec,
}

/// All resolvable connection fields of one object
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JoinMapping {
    pub object_id: String,
    joins: Vec<RelationJoin>,
}

impl JoinMapping {
    /// Join of a connection field, by field id or column name
    pub fn get(&self, key: &str) -> Option<&RelationJoin> {
        self.joins
            .iter()
            .find(|j| j.field_id == key)
            .or_else(|| self.joins.iter().find(|j| j.column == key))
    }

    pub fn by_relation_name(&self, name: &str) -> Option<&RelationJoin> {
        self.joins.iter().find(|j| j.relation_name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RelationJoin> {
        self.joins.iter()
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// Whether any join reaches the given object
    pub fn references(&self, object_id: &str) -> bool {
        self.joins.iter().any(|j| j.linked_object == object_id)
    }
}

/// Name of the many:many junction table
///
/// Every component is truncated to the same share of the identifier limit so
/// the name never exceeds it and depends only on its inputs.
pub fn junction_table_name(
    prefix: &str,
    source_table: &str,
    target_table: &str,
    column: &str,
    max_len: usize,
) -> String {
    let share = max_len.saturating_sub(prefix.chars().count() + 3) / 3;
    format!(
        "{}_{}_{}_{}",
        prefix,
        truncate_identifier(source_table, share),
        truncate_identifier(target_table, share),
        truncate_identifier(column, share)
    )
}

/// Build the join mapping of an object
///
/// Unresolvable connection fields are reported through the notifier and left
/// out of the mapping.
pub fn build_join_mapping(
    snapshot: &MetadataSnapshot,
    object: &ObjectDefinition,
    config: &EngineConfig,
    notifier: &dyn DeveloperNotifier,
) -> JoinMapping {
    let mut joins = Vec::new();

    for field in object.connection_fields() {
        let Some(settings) = field.connect() else {
            continue;
        };
        let Some(linked) = snapshot.object(&settings.linked_object) else {
            notifier.notify(
                NoticeKind::MissingLinkTarget,
                &format!(
                    "Connection field '{}' of '{}' links to unknown object '{}'",
                    field.column_name, object.name, settings.linked_object
                ),
                serde_json::json!({"object": object.id, "field": field.id}),
            );
            continue;
        };
        match resolve_join(object, field, settings, linked, config, notifier) {
            Some(spec) => joins.push(RelationJoin {
                field_id: field.id.clone(),
                column: field.column_name.clone(),
                relation_name: config.relation_name(&field.column_name),
                shape: Shape::of(settings),
                linked_object: linked.id.clone(),
                linked_table: linked.table_name.clone(),
                many: settings.link_type == LinkType::Many,
                spec,
            }),
            None => notifier.notify(
                NoticeKind::MissingLinkTarget,
                &format!(
                    "Connection field '{}' of '{}' has no usable reverse field on '{}'",
                    field.column_name, object.name, linked.name
                ),
                serde_json::json!({"object": object.id, "field": field.id}),
            ),
        }
    }

    JoinMapping {
        object_id: object.id.clone(),
        joins,
    }
}

fn resolve_join(
    object: &ObjectDefinition,
    field: &FieldDefinition,
    settings: &ConnectSettings,
    linked: &ObjectDefinition,
    config: &EngineConfig,
    notifier: &dyn DeveloperNotifier,
) -> Option<JoinSpec> {
    let reverse = settings
        .linked_field
        .as_deref()
        .and_then(|id| linked.field_by_id(id));
    let (source_key, target_key) = join_keys(object, settings, linked, notifier);

    match Shape::of(settings) {
        Shape::OneToMany => Some(JoinSpec::OwnColumn {
            fk: field.column_name.clone(),
            target_key,
        }),
        Shape::OneToOne if settings.is_source => Some(JoinSpec::OwnColumn {
            fk: field.column_name.clone(),
            target_key,
        }),
        Shape::ManyToOne | Shape::OneToOne => reverse.map(|reverse| JoinSpec::LinkedColumn {
            fk: reverse.column_name.clone(),
            source_key,
        }),
        Shape::ManyToMany => {
            let this_is_source = settings.is_source || reverse.is_none();
            let (source_table, target_table, column) = match reverse {
                Some(reverse) if !this_is_source => {
                    (&linked.table_name, &object.table_name, &reverse.column_name)
                }
                _ => (&object.table_name, &linked.table_name, &field.column_name),
            };
            let max = config.identifier_max_len;
            let table = junction_table_name(
                &config.junction_prefix,
                source_table,
                target_table,
                column,
                max,
            );
            let source_side = truncate_identifier(source_table, max);
            let target_side = if source_table == target_table {
                truncate_identifier(&format!("{}_{}", target_table, column), max)
            } else {
                truncate_identifier(target_table, max)
            };
            let (source_column, target_column) = if this_is_source {
                (source_side, target_side)
            } else {
                (target_side, source_side)
            };
            Some(JoinSpec::Junction {
                table,
                source_column,
                target_column,
                source_key,
                target_key,
            })
        }
    }
}

/// Key columns on (this object, linked object)
fn join_keys(
    object: &ObjectDefinition,
    settings: &ConnectSettings,
    linked: &ObjectDefinition,
    notifier: &dyn DeveloperNotifier,
) -> (String, String) {
    let mut source: Option<String> = None;
    let mut target: Option<String> = None;

    for id in [&settings.index_field, &settings.index_field2]
        .into_iter()
        .flatten()
    {
        let (owner, field, slot) = match (object.field_by_id(id), linked.field_by_id(id)) {
            (Some(f), _) if source.is_none() => (object, f, &mut source),
            (_, Some(f)) if target.is_none() => (linked, f, &mut target),
            _ => continue,
        };
        if !owner.is_unique_key(&field.id) {
            notifier.notify(
                NoticeKind::NonUniqueJoinKey,
                &format!(
                    "Join key '{}' of '{}' is not backed by a unique index",
                    field.column_name, owner.name
                ),
                serde_json::json!({"object": owner.id, "field": field.id}),
            );
        }
        *slot = Some(field.column_name.clone());
    }

    (
        source.unwrap_or_else(|| object.primary_column().to_string()),
        target.unwrap_or_else(|| linked.primary_column().to_string()),
    )
}

// ============================================================================
// SQL over a join
// ============================================================================

/// Correlated `FROM` and `WHERE` reaching the linked rows of the outer row `base`
///
/// The linked table is aliased `linked`; a junction, when needed, `linked__j`.
pub(crate) fn correlated(join: &RelationJoin, base: &str, linked: &str) -> (String, String) {
    let linked_table = format!(
        "{} AS {}",
        quote_identifier(&join.linked_table),
        quote_identifier(linked)
    );
    match &join.spec {
        JoinSpec::OwnColumn { fk, target_key } => (
            linked_table,
            format!(
                "{} = {}",
                quote_qualified(linked, target_key),
                quote_qualified(base, fk)
            ),
        ),
        JoinSpec::LinkedColumn { fk, source_key } => (
            linked_table,
            format!(
                "{} = {}",
                quote_qualified(linked, fk),
                quote_qualified(base, source_key)
            ),
        ),
        JoinSpec::Junction {
            table,
            source_column,
            target_column,
            source_key,
            target_key,
        } => {
            let junction = format!("{}__j", linked);
            (
                format!(
                    "{} AS {} INNER JOIN {} ON {} = {}",
                    quote_identifier(table),
                    quote_identifier(&junction),
                    linked_table,
                    quote_qualified(linked, target_key),
                    quote_qualified(&junction, target_column)
                ),
                format!(
                    "{} = {}",
                    quote_qualified(&junction, source_column),
                    quote_qualified(base, source_key)
                ),
            )
        }
    }
}

/// `LEFT JOIN` of the linked table under `alias`
pub(crate) fn left_join(join: &RelationJoin, base: &str, alias: &str) -> String {
    let linked_table = format!(
        "{} AS {}",
        quote_identifier(&join.linked_table),
        quote_identifier(alias)
    );
    match &join.spec {
        JoinSpec::OwnColumn { fk, target_key } => format!(
            "LEFT JOIN {} ON {} = {}",
            linked_table,
            quote_qualified(alias, target_key),
            quote_qualified(base, fk)
        ),
        JoinSpec::LinkedColumn { fk, source_key } => format!(
            "LEFT JOIN {} ON {} = {}",
            linked_table,
            quote_qualified(alias, fk),
            quote_qualified(base, source_key)
        ),
        JoinSpec::Junction {
            table,
            source_column,
            target_column,
            source_key,
            target_key,
        } => {
            let junction = format!("{}__j", alias);
            format!(
                "LEFT JOIN {} AS {} ON {} = {} LEFT JOIN {} ON {} = {}",
                quote_identifier(table),
                quote_identifier(&junction),
                quote_qualified(&junction, source_column),
                quote_qualified(base, source_key),
                linked_table,
                quote_qualified(alias, target_key),
                quote_qualified(&junction, target_column)
            )
        }
    }
}

/// Translation of linked rows into keys of the base object
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct KeyTranslation {
    /// Selects one key column, distinct
    pub sql: String,
    /// Base column the selected keys are compared with
    pub base_column: String,
}

/// Select the base-side keys related to linked rows matching `where_sql`
///
/// `from` is the linked object's `FROM` clause and `linked` the name its table
/// is referenced by.
pub(crate) fn base_keys(
    join: &RelationJoin,
    from: &str,
    linked: &str,
    where_sql: Option<&str>,
) -> KeyTranslation {
    let filter = where_sql
        .map(|w| format!(" WHERE {}", w))
        .unwrap_or_default();
    match &join.spec {
        JoinSpec::OwnColumn { fk, target_key } => KeyTranslation {
            sql: format!(
                "SELECT DISTINCT {} FROM {}{}",
                quote_qualified(linked, target_key),
                from,
                filter
            ),
            base_column: fk.clone(),
        },
        JoinSpec::LinkedColumn { fk, source_key } => KeyTranslation {
            sql: format!(
                "SELECT DISTINCT {} FROM {}{}",
                quote_qualified(linked, fk),
                from,
                filter
            ),
            base_column: source_key.clone(),
        },
        JoinSpec::Junction {
            table,
            source_column,
            target_column,
            source_key,
            target_key,
        } => {
            let junction = "__junction";
            KeyTranslation {
                sql: format!(
                    "SELECT DISTINCT {} FROM {} INNER JOIN {} AS {} ON {} = {}{}",
                    quote_qualified(junction, source_column),
                    from,
                    quote_identifier(table),
                    quote_identifier(junction),
                    quote_qualified(junction, target_column),
                    quote_qualified(linked, target_key),
                    filter
                ),
                base_column: source_key.clone(),
            }
        }
    }
}

// ============================================================================
// Population
// ============================================================================

/// Attach linked records to `rows` for every requested connection field
///
/// One read per populated field; sibling fields are read concurrently.
pub async fn populate(
    ctx: &TenantContext,
    db: &dyn Database,
    object: &ObjectDefinition,
    rows: &mut [Record],
    populate: &Populate,
    minimal: bool,
) -> Result<()> {
    if rows.is_empty() || *populate == Populate::None {
        return Ok(());
    }
    let snapshot = ctx.snapshot();
    let mapping = ctx.join_mapping(&object.id)?;

    let requested: Vec<&RelationJoin> = mapping
        .iter()
        .filter(|j| populate.includes(&j.field_id, &j.column))
        .collect();

    let shared: &[Record] = rows;
    let batches = requested.iter().map(|join| {
        let keys = parent_keys(shared, join.spec.base_column());
        let snapshot = &snapshot;
        async move {
            match snapshot.object(&join.linked_object) {
                Some(linked) => fetch_linked(ctx, db, linked, join, keys, minimal).await,
                None => Ok(HashMap::new()),
            }
        }
    });
    let grouped = try_join_all(batches).await?;

    for (join, linked) in requested.iter().zip(grouped) {
        let base_column = join.spec.base_column();
        for row in rows.iter_mut() {
            let related = row
                .get(base_column)
                .filter(|v| !is_blank(v))
                .and_then(|v| linked.get(&value_text(v)));
            let value = match (related, join.many) {
                (Some(records), true) => serde_json::Value::Array(
                    records.iter().cloned().map(serde_json::Value::Object).collect(),
                ),
                (None, true) => serde_json::Value::Array(Vec::new()),
                (Some(records), false) => records
                    .first()
                    .cloned()
                    .map(serde_json::Value::Object)
                    .unwrap_or(serde_json::Value::Null),
                (None, false) => serde_json::Value::Null,
            };
            row.insert(join.relation_name.clone(), value);
        }
    }

    Ok(())
}

fn is_blank(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Distinct non-empty values of `column` across the rows
fn parent_keys(rows: &[Record], column: &str) -> Vec<serde_json::Value> {
    let mut seen = HashSet::new();
    rows.iter()
        .filter_map(|row| row.get(column))
        .filter(|v| !is_blank(v))
        .filter(|v| seen.insert(value_text(v)))
        .cloned()
        .collect()
}

/// Read the linked records of a batch, grouped by the owning row's key
async fn fetch_linked(
    ctx: &TenantContext,
    db: &dyn Database,
    linked: &ObjectDefinition,
    join: &RelationJoin,
    keys: Vec<serde_json::Value>,
    minimal: bool,
) -> Result<HashMap<String, Vec<Record>>> {
    if keys.is_empty() {
        return Ok(HashMap::new());
    }
    let alias = "__linked";
    let list: Vec<String> = keys.iter().map(literal).collect();
    let table = format!(
        "{} AS {}",
        quote_identifier(&join.linked_table),
        quote_identifier(alias)
    );

    let (sql, group_column) = match &join.spec {
        JoinSpec::OwnColumn { target_key, .. } => (
            format!(
                "SELECT {}.* FROM {} WHERE {} IN ({})",
                quote_identifier(alias),
                table,
                quote_qualified(alias, target_key),
                list.join(", ")
            ),
            target_key.as_str(),
        ),
        JoinSpec::LinkedColumn { fk, .. } => (
            format!(
                "SELECT {}.* FROM {} WHERE {} IN ({})",
                quote_identifier(alias),
                table,
                quote_qualified(alias, fk),
                list.join(", ")
            ),
            fk.as_str(),
        ),
        JoinSpec::Junction {
            table: junction,
            source_column,
            target_column,
            target_key,
            ..
        } => (
            format!(
                "SELECT {}.*, {} AS {} FROM {} INNER JOIN {} AS `__j` ON {} = {} WHERE {} IN ({})",
                quote_identifier(alias),
                quote_qualified("__j", source_column),
                quote_identifier(PARENT_KEY),
                table,
                quote_identifier(junction),
                quote_qualified("__j", target_column),
                quote_qualified(alias, target_key),
                quote_qualified("__j", source_column),
                list.join(", ")
            ),
            PARENT_KEY,
        ),
    };

    let records = fetch_with_retry(db, &sql, ctx.config().read_retries).await?;
    tracing::debug!(
        field = %join.field_id,
        linked = %join.linked_object,
        count = records.len(),
        "Populated relation batch"
    );

    let mut grouped: HashMap<String, Vec<Record>> = HashMap::new();
    let mut shaped = Vec::with_capacity(records.len());
    for mut record in records {
        let Some(parent) = record.get(group_column).filter(|v| !is_blank(v)).map(value_text)
        else {
            continue;
        };
        record.remove(PARENT_KEY);
        shape_record(&mut record, linked, join, minimal, ctx.config());
        shaped.push((parent, record));
    }

    merge_user_names(ctx, db, linked, &mut shaped).await?;

    for (parent, record) in shaped {
        grouped.entry(parent).or_default().push(record);
    }
    Ok(grouped)
}

/// Drop surrogate keys, and in minimal mode everything but identity and label
///
/// Records are already grouped by their owner, so the join key may go.
fn shape_record(
    record: &mut Record,
    linked: &ObjectDefinition,
    join: &RelationJoin,
    minimal: bool,
    config: &EngineConfig,
) {
    let linked_key = join.spec.linked_key(linked).to_string();
    if minimal {
        let labels = linked.label_fields();
        let mut keep: HashSet<&str> = labels.iter().map(|f| f.column_name.as_str()).collect();
        keep.insert(linked.primary_column());
        keep.insert(linked_key.as_str());
        if labels.iter().any(|f| f.multilingual) {
            keep.insert(config.translations_column.as_str());
        }
        record.retain(|column, _| keep.contains(column.as_str()));
    }
    if linked.primary_key == PrimaryKey::Id {
        record.remove("id");
    }
}

/// Replace usernames in user fields with `{id, text}` pairs carrying the display name
async fn merge_user_names(
    ctx: &TenantContext,
    db: &dyn Database,
    linked: &ObjectDefinition,
    records: &mut [(String, Record)],
) -> Result<()> {
    let user_columns: Vec<&str> = linked
        .user_fields()
        .map(|f| f.column_name.as_str())
        .collect();
    if user_columns.is_empty() || records.is_empty() {
        return Ok(());
    }

    let mut usernames: Vec<String> = Vec::new();
    for (_, record) in records.iter() {
        for column in &user_columns {
            for name in usernames_in(record.get(*column)) {
                if !usernames.contains(&name) {
                    usernames.push(name);
                }
            }
        }
    }
    if usernames.is_empty() {
        return Ok(());
    }

    let names = ctx.users().display_names(db, &usernames).await?;
    let pair = |username: String| {
        let text = names.get(&username).cloned().unwrap_or_else(|| username.clone());
        serde_json::json!({ "id": username, "text": text })
    };

    for (_, record) in records.iter_mut() {
        for column in &user_columns {
            let Some(value) = record.get(*column) else {
                continue;
            };
            let merged = match value {
                serde_json::Value::Array(_) => {
                    serde_json::Value::Array(usernames_in(Some(value)).into_iter().map(pair).collect())
                }
                serde_json::Value::String(s) if s.trim_start().starts_with('[') => {
                    serde_json::Value::Array(usernames_in(Some(value)).into_iter().map(pair).collect())
                }
                serde_json::Value::String(s) if !s.is_empty() => pair(s.clone()),
                _ => continue,
            };
            record.insert(column.to_string(), merged);
        }
    }
    Ok(())
}

/// Usernames held by a user column (single, JSON array, or JSON array text)
pub(crate) fn usernames_in(value: Option<&serde_json::Value>) -> Vec<String> {
    fn from_items(items: &[serde_json::Value]) -> Vec<String> {
        items
            .iter()
            .filter_map(|i| match i {
                serde_json::Value::String(s) => Some(s.clone()),
                serde_json::Value::Object(o) => o.get("id").and_then(|v| v.as_str()).map(str::to_string),
                _ => None,
            })
            .collect()
    }
    match value {
        Some(serde_json::Value::Array(items)) => from_items(items),
        Some(serde_json::Value::String(s)) if s.trim_start().starts_with('[') => {
            match serde_json::from_str::<serde_json::Value>(s) {
                Ok(serde_json::Value::Array(items)) => from_items(&items),
                _ => Vec::new(),
            }
        }
        Some(serde_json::Value::String(s)) if !s.is_empty() => vec![s.clone()],
        _ => Vec::new(),
    }
}
