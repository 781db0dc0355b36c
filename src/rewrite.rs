//! Condition rewrite pipeline
//!
//! `reduce` turns a caller condition into one the rule compiler accepts: scope
//! filters are merged in for non-system callers, then every placeholder rule is
//! replaced by concrete keys. Passes run in a fixed order:
//!
//! 1. `in_query` / `not_in_query`
//! 2. `in_query_field` / `not_in_query_field`
//! 3. `in_data_collection` / `not_in_data_collection`
//! 4. `contain_current_user` / `not_contain_current_user`
//! 5. `same_as_user` / `not_same_as_user`
//!
//! Each pass takes the first occurrence of its operators depth-first, resolves
//! it (running at most one sub-query, or one per hop for `same_as_user`) and
//! replaces the rule in place with a placeholder-free node. The loop ends when
//! no occurrence is left, so the work is bounded by the number of placeholder
//! rules in the tree.

use futures::FutureExt;
use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::condition::condition_helpers::{always_false, always_true, or};
use crate::condition::{
    CONSTANT_KEY, Condition, ConditionGroup, Glue, Rule, RuleOp, THIS_OBJECT_KEY,
};
use crate::db::{Database, fetch_with_retry};
use crate::error::{QueryError, Result};
use crate::notify::NoticeKind;
use crate::relation;
use crate::schema::{DataSource, ObjectDefinition};
use crate::security::{Scope, UserContext, scopes_for_user};
use crate::sql::condition::{ConditionCompiler, FormulaFilters};
use crate::types::FieldType;
use crate::sql::fragment::ALWAYS_TRUE;
use crate::sql::sanitize::{quote_identifier, quote_qualified, value_text};
use crate::tenant::{MetadataSnapshot, TenantContext};

const PASSES: [[RuleOp; 2]; 5] = [
    [RuleOp::InQuery, RuleOp::NotInQuery],
    [RuleOp::InQueryField, RuleOp::NotInQueryField],
    [RuleOp::InDataCollection, RuleOp::NotInDataCollection],
    [RuleOp::ContainCurrentUser, RuleOp::NotContainCurrentUser],
    [RuleOp::SameAsUser, RuleOp::NotSameAsUser],
];

/// Resolve scopes and placeholders of `condition`, a filter over `object_id`
pub async fn reduce(
    ctx: &TenantContext,
    db: &dyn Database,
    object_id: &str,
    condition: Condition,
    user: &UserContext,
) -> Result<Condition> {
    let mut rewriter = Rewriter::new(ctx, db, user, true);
    rewriter.reduce_tree(object_id.to_string(), condition).await
}

/// Resolve the placeholders of formula filters on `objects`
///
/// Formula filters run over the formula's linked object and are not narrowed
/// by the caller's scopes. Only filters holding placeholders are returned;
/// formulas over an unresolvable connection are left to the compiler.
pub async fn reduce_formula_filters(
    ctx: &TenantContext,
    db: &dyn Database,
    objects: &[&ObjectDefinition],
    user: &UserContext,
) -> Result<FormulaFilters> {
    let mut rewriter = Rewriter::new(ctx, db, user, false);
    let mut reduced = FormulaFilters::new();
    for object in objects {
        let mapping = ctx.join_mapping(&object.id)?;
        for field in &object.fields {
            let FieldType::Formula(settings) = &field.field_type else {
                continue;
            };
            let Some(filter) = settings.filter.as_ref().filter(|f| f.placeholder_count() > 0)
            else {
                continue;
            };
            let Some(join) = mapping.get(&settings.field) else {
                continue;
            };
            let filter = rewriter
                .reduce_tree(join.linked_object.clone(), filter.clone())
                .await?;
            reduced.insert(field.id.clone(), filter);
        }
    }
    Ok(reduced)
}

/// A stored filter whose matching keys replace a membership rule
struct StoredSource {
    /// Id of the query or data collection, for cycle detection
    id: String,
    object_id: String,
    condition: Condition,
    joins: Vec<String>,
}

/// One step of a `same_as_user` path
#[derive(Debug, Clone, PartialEq)]
struct Hop {
    object_id: String,
    /// Connection field leading to the next hop; `None` on the user-owning object
    next_field: Option<String>,
}

struct Rewriter<'a> {
    ctx: &'a TenantContext,
    db: &'a dyn Database,
    user: &'a UserContext,
    /// Whether the caller's scopes are merged into every reduced tree
    include_scopes: bool,
    snapshot: Arc<MetadataSnapshot>,
    /// Scopes of the caller, loaded once per request
    scopes: Option<Vec<Scope>>,
    /// Stored definitions currently being expanded
    visiting: Vec<String>,
}

impl<'a> Rewriter<'a> {
    fn new(
        ctx: &'a TenantContext,
        db: &'a dyn Database,
        user: &'a UserContext,
        include_scopes: bool,
    ) -> Self {
        Self {
            ctx,
            db,
            user,
            include_scopes,
            snapshot: ctx.snapshot(),
            scopes: None,
            visiting: Vec::new(),
        }
    }

    fn reduce_tree(&mut self, object_id: String, tree: Condition) -> BoxFuture<'_, Result<Condition>> {
        async move {
            let snapshot = self.snapshot.clone();
            let object = snapshot.require_object(&object_id)?;
            let mut tree = self.apply_scopes(object, tree).await?;

            for pass in PASSES {
                let in_pass = |rule: &Rule| pass.contains(&rule.rule);
                while let Some(rule) = tree.find_rule(&in_pass).cloned() {
                    let replacement = self.resolve(object, &rule).await?;
                    match tree.find_node_mut(&|r| r == &rule) {
                        Some(node) => *node = replacement,
                        None => break,
                    }
                }
            }
            Ok(tree)
        }
        .boxed()
    }

    async fn resolve(&mut self, object: &ObjectDefinition, rule: &Rule) -> Result<Condition> {
        let resolved = match rule.rule {
            RuleOp::InQuery | RuleOp::NotInQuery => {
                let source = self.query_source(&value_text(&rule.value))?;
                self.membership(object, rule, source, None).await?
            }
            RuleOp::InQueryField | RuleOp::NotInQueryField => {
                let reference = value_text(&rule.value);
                let (query_id, field_id) = reference.split_once(':').ok_or_else(|| {
                    QueryError::invalid_condition(format!(
                        "'{}' expects 'queryId:fieldId', got '{}'",
                        rule.rule, reference
                    ))
                })?;
                let source = self.query_source(query_id)?;
                let snapshot = self.snapshot.clone();
                let linked = snapshot.require_object(&source.object_id)?;
                let field = linked
                    .field(field_id)
                    .filter(|f| !f.is_virtual())
                    .ok_or_else(|| QueryError::field_not_found(&linked.name, field_id))?;
                self.membership(object, rule, source, Some(field.column_name.clone()))
                    .await?
            }
            RuleOp::InDataCollection | RuleOp::NotInDataCollection => {
                let source = self.collection_source(&value_text(&rule.value))?;
                self.membership(object, rule, source, None).await?
            }
            RuleOp::ContainCurrentUser | RuleOp::NotContainCurrentUser => {
                self.contain_current_user(object, rule)?
            }
            RuleOp::SameAsUser | RuleOp::NotSameAsUser => self.same_as_user(object, rule).await?,
            other => {
                return Err(QueryError::invalid_condition(format!(
                    "'{}' is not a placeholder operator",
                    other
                )));
            }
        };
        tracing::debug!(key = %rule.key, rule = %rule.rule, "Resolved placeholder rule");
        Ok(resolved)
    }

    // ------------------------------------------------------------------
    // Scopes
    // ------------------------------------------------------------------

    async fn apply_scopes(&mut self, object: &ObjectDefinition, tree: Condition) -> Result<Condition> {
        let user = self.user;
        if user.is_system || !self.include_scopes {
            return Ok(tree);
        }
        let Some(username) = user.username.as_deref() else {
            return Ok(Condition::Rule(always_false()));
        };
        if self.scopes.is_none() {
            let scopes = scopes_for_user(self.ctx.users(), self.db, username).await?;
            self.scopes = Some(scopes);
        }
        let scopes = self.scopes.as_deref().unwrap_or_default();

        let covering: Vec<&Scope> = scopes.iter().filter(|s| s.covers(&object.id)).collect();
        if covering.is_empty() {
            tracing::debug!(object = %object.id, username, "No scope covers object");
            return Ok(Condition::Rule(always_false()));
        }

        let mut filters = Vec::with_capacity(covering.len());
        for scope in covering {
            let filter = scope.filter.clone().retain_rules(&|rule| owns_key(object, rule));
            if filter.is_empty() {
                // An unrestricted scope grants every record
                return Ok(tree);
            }
            filters.push(filter);
        }
        let scope_filter = match filters.len() {
            1 => filters.remove(0),
            _ => or(filters),
        };
        Ok(scope_filter.and(tree))
    }

    // ------------------------------------------------------------------
    // Stored queries and data collections
    // ------------------------------------------------------------------

    fn query_source(&self, query_id: &str) -> Result<StoredSource> {
        let query = self.snapshot.query(query_id).ok_or_else(|| {
            self.misconfigured(
                format!("Unknown query '{}'", query_id),
                serde_json::json!({"query": query_id}),
            )
        })?;
        Ok(StoredSource {
            id: query.id.clone(),
            object_id: query.object_id.clone(),
            condition: query.condition.clone(),
            joins: query.joins.clone(),
        })
    }

    fn collection_source(&self, collection_id: &str) -> Result<StoredSource> {
        let collection = self.snapshot.data_collection(collection_id).ok_or_else(|| {
            self.misconfigured(
                format!("Unknown data collection '{}'", collection_id),
                serde_json::json!({"dataCollection": collection_id}),
            )
        })?;
        match &collection.datasource {
            DataSource::Object(object_id) => Ok(StoredSource {
                id: collection.id.clone(),
                object_id: object_id.clone(),
                condition: collection.filter.clone(),
                joins: Vec::new(),
            }),
            DataSource::Query(query_id) => {
                let query = self.query_source(query_id)?;
                Ok(StoredSource {
                    id: collection.id.clone(),
                    object_id: query.object_id,
                    condition: query.condition.and(collection.filter.clone()),
                    joins: query.joins,
                })
            }
        }
    }

    /// Replace a membership rule by the keys of the stored source's rows
    ///
    /// With `column`, the rule's key is compared with that column of the
    /// source rows; otherwise with the source's primary key, or through the
    /// relation when the key is a connection to the source object.
    async fn membership(
        &mut self,
        object: &ObjectDefinition,
        rule: &Rule,
        source: StoredSource,
        column: Option<String>,
    ) -> Result<Condition> {
        if self.visiting.contains(&source.id) {
            let mut chain = self.visiting.clone();
            chain.push(source.id.clone());
            return Err(self.misconfigured(
                format!("Cyclic reference between stored filters: {}", chain.join(" -> ")),
                serde_json::json!({"chain": chain}),
            ));
        }
        self.visiting.push(source.id.clone());
        let reduced = self
            .reduce_tree(source.object_id.clone(), source.condition.clone())
            .await;
        self.visiting.pop();
        let reduced = reduced?;

        let op = if rule.rule.is_negative() {
            RuleOp::NotIn
        } else {
            RuleOp::In
        };
        let (sql, key) = self.membership_sql(object, rule, &source, &reduced, column)?;
        let keys = self.fetch_keys(&sql).await?;

        let mut replacement = Rule::new(key, op, serde_json::Value::Array(keys));
        replacement.alias = rule.alias.clone();
        Ok(Condition::Rule(replacement))
    }

    /// Key-selecting SQL of a membership rule and the key it is compared with
    fn membership_sql(
        &self,
        object: &ObjectDefinition,
        rule: &Rule,
        source: &StoredSource,
        reduced: &Condition,
        column: Option<String>,
    ) -> Result<(String, String)> {
        let snapshot = self.snapshot.clone();
        let linked = snapshot.require_object(&source.object_id)?;
        let (from, where_sql) = self.source_sql(&snapshot, linked, reduced, &source.joins)?;

        if column.is_none() && rule.alias.is_none() {
            let mapping = self.ctx.join_mapping(&object.id)?;
            let join = object
                .field(&rule.key)
                .filter(|f| f.is_connection())
                .and_then(|f| mapping.get(&f.id))
                .filter(|j| j.linked_object == linked.id);
            if let Some(join) = join {
                let translation =
                    relation::base_keys(join, &from, &linked.table_name, where_sql.as_deref());
                return Ok((translation.sql, translation.base_column));
            }
        }

        let column = column.unwrap_or_else(|| linked.primary_column().to_string());
        let filter = where_sql
            .map(|w| format!(" WHERE {}", w))
            .unwrap_or_default();
        let sql = format!(
            "SELECT DISTINCT {} FROM {}{}",
            quote_qualified(&linked.table_name, &column),
            from,
            filter
        );
        Ok((sql, rule.key.clone()))
    }

    /// `FROM` (with the source's joins) and compiled `WHERE` of a stored source
    fn source_sql(
        &self,
        snapshot: &MetadataSnapshot,
        linked: &ObjectDefinition,
        reduced: &Condition,
        joins: &[String],
    ) -> Result<(String, Option<String>)> {
        let mut from = quote_identifier(&linked.table_name);
        let mut compiler =
            ConditionCompiler::new(self.ctx, snapshot, linked, &self.user.language_code);
        if !joins.is_empty() {
            let mapping = self.ctx.join_mapping(&linked.id)?;
            for field in joins {
                let join = mapping.get(field).ok_or_else(|| {
                    self.misconfigured(
                        format!("Join '{}' of '{}' is not a resolvable connection", field, linked.name),
                        serde_json::json!({"object": linked.id, "field": field}),
                    )
                })?;
                let joined = snapshot.require_object(&join.linked_object)?;
                from.push(' ');
                from.push_str(&relation::left_join(join, &linked.table_name, &join.column));
                compiler = compiler.with_alias(join.column.clone(), joined);
            }
        }
        let where_sql = compiler.build_condition_clause(reduced)?;
        Ok((from, where_sql))
    }

    // ------------------------------------------------------------------
    // Current user
    // ------------------------------------------------------------------

    fn contain_current_user(&self, object: &ObjectDefinition, rule: &Rule) -> Result<Condition> {
        let negated = rule.rule == RuleOp::NotContainCurrentUser;
        let Some(username) = self.user.username.as_deref() else {
            return Ok(constant(negated));
        };
        let field = object
            .field(&rule.key)
            .ok_or_else(|| QueryError::field_not_found(&object.name, &rule.key))?;

        if !field.is_connection() {
            return Ok(Condition::Rule(user_rule(
                field.column_name.clone(),
                field.is_multi_valued(),
                username,
                negated,
            )));
        }

        let mapping = self.ctx.join_mapping(&object.id)?;
        let join = mapping
            .get(&field.id)
            .ok_or_else(|| self.ctx.unresolved_connection(object, &field.id))?;
        let linked = self.snapshot.require_object(&join.linked_object)?;
        let Some(inner) = user_match(linked, username, false) else {
            return Ok(constant(negated));
        };
        let op = if negated {
            RuleOp::HaveNoRelation
        } else {
            RuleOp::HaveRelation
        };
        let mut replacement = Rule::new(rule.key.clone(), op, serde_json::to_value(&inner)?);
        replacement.alias = rule.alias.clone();
        Ok(Condition::Rule(replacement))
    }

    async fn same_as_user(&mut self, object: &ObjectDefinition, rule: &Rule) -> Result<Condition> {
        let negated = rule.rule == RuleOp::NotSameAsUser;
        let Some(username) = self.user.username.clone() else {
            return Ok(constant(negated));
        };
        let snapshot = self.snapshot.clone();

        let (start, start_key) = if rule.key == THIS_OBJECT_KEY {
            (object, object.primary_column().to_string())
        } else {
            let field = object
                .field(&rule.key)
                .ok_or_else(|| QueryError::field_not_found(&object.name, &rule.key))?;
            if !field.is_connection() {
                return Ok(Condition::Rule(user_rule(
                    field.column_name.clone(),
                    field.is_multi_valued(),
                    &username,
                    negated,
                )));
            }
            let mapping = self.ctx.join_mapping(&object.id)?;
            let join = mapping
                .get(&field.id)
                .ok_or_else(|| self.ctx.unresolved_connection(object, &field.id))?;
            let linked = snapshot.require_object(&join.linked_object)?;
            (linked, join.spec.linked_key(linked).to_string())
        };

        let Some(path) = self.user_path(&snapshot, start)? else {
            tracing::debug!(object = %start.id, "No user field reachable for same_as_user");
            return Ok(constant(negated));
        };

        if path.len() == 1 && rule.key == THIS_OBJECT_KEY {
            return Ok(user_match(start, &username, negated)
                .unwrap_or_else(|| constant(negated)));
        }

        // Walk back from the user-owning object; each hop's keys seed the previous one
        let mut keys: Vec<serde_json::Value> = Vec::new();
        for index in (0..path.len()).rev() {
            let sql = self.hop_sql(&snapshot, &path, index, &start_key, &username, &keys)?;
            keys = self.fetch_keys(&sql).await?;
            if keys.is_empty() {
                break;
            }
        }

        let op = if negated { RuleOp::NotIn } else { RuleOp::In };
        let mut replacement = Rule::new(rule.key.clone(), op, serde_json::Value::Array(keys));
        replacement.alias = rule.alias.clone();
        Ok(Condition::Rule(replacement))
    }

    /// Shortest path of connections from `start` to an object with a user field
    fn user_path(
        &self,
        snapshot: &MetadataSnapshot,
        start: &ObjectDefinition,
    ) -> Result<Option<Vec<Hop>>> {
        let mut parents: HashMap<String, (String, String)> = HashMap::new();
        let mut seen: HashSet<String> = HashSet::from([start.id.clone()]);
        let mut queue = VecDeque::from([start.id.clone()]);

        while let Some(current) = queue.pop_front() {
            let object = snapshot.require_object(&current)?;
            if object.user_fields().next().is_some() {
                let mut path = vec![Hop {
                    object_id: current.clone(),
                    next_field: None,
                }];
                let mut cursor = current;
                while let Some((parent, field)) = parents.get(&cursor) {
                    path.push(Hop {
                        object_id: parent.clone(),
                        next_field: Some(field.clone()),
                    });
                    cursor = parent.clone();
                }
                path.reverse();
                return Ok(Some(path));
            }
            let mapping = self.ctx.join_mapping(&object.id)?;
            for join in mapping.iter() {
                if seen.insert(join.linked_object.clone()) {
                    parents.insert(
                        join.linked_object.clone(),
                        (object.id.clone(), join.field_id.clone()),
                    );
                    queue.push_back(join.linked_object.clone());
                }
            }
        }
        Ok(None)
    }

    /// Key lookup for one hop of a `same_as_user` path
    fn hop_sql(
        &self,
        snapshot: &MetadataSnapshot,
        path: &[Hop],
        index: usize,
        start_key: &str,
        username: &str,
        next_keys: &[serde_json::Value],
    ) -> Result<String> {
        let hop = &path[index];
        let object = snapshot.require_object(&hop.object_id)?;

        let key_column = if index == 0 {
            start_key.to_string()
        } else {
            let previous = &path[index - 1];
            let field = previous.next_field.as_deref().unwrap_or_default();
            let mapping = self.ctx.join_mapping(&previous.object_id)?;
            let join = mapping.get(field).ok_or_else(|| {
                QueryError::configuration(format!(
                    "Connection '{}' of '{}' vanished while resolving same_as_user",
                    field, previous.object_id
                ))
            })?;
            join.spec.linked_key(object).to_string()
        };

        let condition = match &hop.next_field {
            None => user_match(object, username, false).unwrap_or_else(|| constant(false)),
            Some(field) => Condition::Rule(Rule::new(
                field.clone(),
                RuleOp::In,
                serde_json::Value::Array(next_keys.to_vec()),
            )),
        };
        let where_sql = ConditionCompiler::new(self.ctx, snapshot, object, &self.user.language_code)
            .build_condition_clause(&condition)?
            .unwrap_or_else(|| ALWAYS_TRUE.to_string());

        Ok(format!(
            "SELECT DISTINCT {} FROM {} WHERE {}",
            quote_qualified(&object.table_name, &key_column),
            quote_identifier(&object.table_name),
            where_sql
        ))
    }

    // ------------------------------------------------------------------

    /// First column of every row, deduplicated, nulls dropped
    async fn fetch_keys(&self, sql: &str) -> Result<Vec<serde_json::Value>> {
        let rows = fetch_with_retry(self.db, sql, self.ctx.config().read_retries).await?;
        let mut seen = HashSet::new();
        let keys: Vec<serde_json::Value> = rows
            .into_iter()
            .filter_map(|row| row.into_iter().next().map(|(_, value)| value))
            .filter(|value| !value.is_null())
            .filter(|value| seen.insert(value_text(value)))
            .collect();
        tracing::debug!(count = keys.len(), "Resolved key set");
        Ok(keys)
    }

    fn misconfigured(&self, message: String, context: serde_json::Value) -> QueryError {
        self.ctx
            .notifier()
            .notify(NoticeKind::InvalidDefinition, &message, context);
        QueryError::configuration(message)
    }
}

/// Whether a scope rule can be evaluated against `object`
fn owns_key(object: &ObjectDefinition, rule: &Rule) -> bool {
    rule.key == CONSTANT_KEY
        || rule.key == THIS_OBJECT_KEY
        || rule.key == object.primary_column()
        || object.field(&rule.key).is_some()
}

/// `1 = 1` or `1 = 0`
fn constant(value: bool) -> Condition {
    if value {
        Condition::Rule(always_true())
    } else {
        Condition::Rule(always_false())
    }
}

/// Rule matching `username` in one user-holding column
fn user_rule(column: String, multi_valued: bool, username: &str, negated: bool) -> Rule {
    let op = match (multi_valued, negated) {
        (true, false) => RuleOp::Contains,
        (true, true) => RuleOp::NotContains,
        (false, false) => RuleOp::Equals,
        (false, true) => RuleOp::NotEqual,
    };
    Rule::new(column, op, serde_json::Value::String(username.to_string()))
}

/// Records of `object` naming `username` in any user field
///
/// `None` when the object has no user field.
fn user_match(object: &ObjectDefinition, username: &str, negated: bool) -> Option<Condition> {
    let rules: Vec<Condition> = object
        .user_fields()
        .map(|f| {
            Condition::Rule(user_rule(
                f.column_name.clone(),
                f.is_multi_valued(),
                username,
                negated,
            ))
        })
        .collect();
    if rules.is_empty() {
        return None;
    }
    Some(Condition::Group(ConditionGroup {
        glue: if negated { Glue::And } else { Glue::Or },
        rules,
    }))
}
