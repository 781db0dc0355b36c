//! Mutation coordination
//!
//! A save splits the caller's values into base columns, written with one
//! `INSERT`/`UPDATE`, and connection values, written afterwards as relate and
//! unrelate statements on whichever table holds the link. Updates only touch
//! the links that changed.

use futures::future::try_join_all;
use std::collections::HashSet;

use crate::db::fetch_with_retry;
use crate::error::{FieldError, QueryError, Result};
use crate::record::{Populate, Record, SaveOutcome};
use crate::relation::{JoinMapping, JoinSpec, RelationJoin, Shape, usernames_in};
use crate::schema::{ObjectDefinition, PrimaryKey};
use crate::security::{UserContext, truthy};
use crate::sql::condition::connection_keys;
use crate::sql::sanitize::{literal, quote_identifier, value_text};
use crate::store::ObjectQuery;
use crate::tenant::MetadataSnapshot;
use crate::types::{FieldDefinition, FieldType, option_id};

/// Column the current keys of a relation are selected as
const KEY_ALIAS: &str = "__key";

/// Keys a save links through one connection field
struct RelationValues<'m> {
    join: &'m RelationJoin,
    /// Column of the linked table the keys refer to
    linked_key: String,
    keys: Vec<serde_json::Value>,
}

/// Caller values split by where they are stored
#[derive(Default)]
struct Prepared<'m> {
    columns: Vec<(String, serde_json::Value)>,
    relations: Vec<RelationValues<'m>>,
    errors: Vec<FieldError>,
}

impl<'t> ObjectQuery<'t> {
    /// Create a record
    ///
    /// Returns [`SaveOutcome::Invalid`] without writing anything when a value
    /// fails validation. Otherwise the row is inserted, its links are written
    /// one after another and the stored record is read back.
    pub async fn create(
        &self,
        object_id: &str,
        values: &serde_json::Value,
        user: &UserContext,
    ) -> Result<SaveOutcome> {
        let snapshot = self.ctx.snapshot();
        let object = snapshot.require_object(object_id)?;
        let mapping = self.ctx.join_mapping(object_id)?;
        let input = input_map(values)?;

        let prepared = self.prepare(&snapshot, object, &mapping, input, true)?;
        if !prepared.errors.is_empty() {
            return Ok(SaveOutcome::Invalid(prepared.errors));
        }

        let mut columns = Vec::new();
        let mut row = Record::new();
        if object.primary_key == PrimaryKey::Uuid {
            let key = input
                .get(object.primary_column())
                .filter(|v| !is_blank(v))
                .cloned()
                .unwrap_or_else(|| serde_json::Value::String(uuid::Uuid::new_v4().to_string()));
            columns.push((object.primary_column().to_string(), literal(&key)));
            row.insert(object.primary_column().to_string(), key);
        }
        for (column, value) in &prepared.columns {
            columns.push((column.clone(), literal(value)));
            row.insert(column.clone(), value.clone());
        }
        let auto = &self.ctx.config().auto_columns;
        if auto.created_at {
            columns.push(("created_at".to_string(), "NOW()".to_string()));
        }
        if auto.updated_at {
            columns.push(("updated_at".to_string(), "NOW()".to_string()));
        }

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_identifier(&object.table_name),
            columns
                .iter()
                .map(|(c, _)| quote_identifier(c))
                .collect::<Vec<_>>()
                .join(", "),
            columns
                .iter()
                .map(|(_, v)| v.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        tracing::debug!(object = %object.id, sql = %sql, "Executing insert");
        let result = self.db().execute(&sql).await?;

        let key = match object.primary_key {
            PrimaryKey::Uuid => row
                .get(object.primary_column())
                .cloned()
                .unwrap_or(serde_json::Value::Null),
            PrimaryKey::Id => serde_json::Value::from(result.last_insert_id),
        };
        row.insert(object.primary_column().to_string(), key.clone());

        for relation in &prepared.relations {
            for target in &relation.keys {
                self.relate_one(object, relation.join, &relation.linked_key, &row, &key, target)
                    .await?;
            }
        }

        tracing::info!(object = %object.id, key = %value_text(&key), "Created record");
        self.saved(object, &key, user).await
    }

    /// Update a record the caller may see
    ///
    /// Only the supplied values are written. For each supplied connection the
    /// stored key set is diffed against the new one and just the difference is
    /// unrelated and related.
    pub async fn update(
        &self,
        object_id: &str,
        key: &serde_json::Value,
        values: &serde_json::Value,
        user: &UserContext,
    ) -> Result<SaveOutcome> {
        let snapshot = self.ctx.snapshot();
        let object = snapshot.require_object(object_id)?;
        let mapping = self.ctx.join_mapping(object_id)?;
        let input = input_map(values)?;

        let prepared = self.prepare(&snapshot, object, &mapping, input, false)?;
        if !prepared.errors.is_empty() {
            return Ok(SaveOutcome::Invalid(prepared.errors));
        }

        let _guard = self.ctx.lock_record(object_id, &value_text(key)).await;
        let prior = self
            .find_one(object_id, key, Populate::None, user)
            .await?
            .ok_or_else(|| QueryError::record_not_found(record_ref(object, key)))?;
        let key = prior
            .get(object.primary_column())
            .filter(|v| !is_blank(v))
            .cloned()
            .unwrap_or_else(|| key.clone());

        let current = try_join_all(
            prepared
                .relations
                .iter()
                .map(|relation| self.current_keys(relation, &prior, &key)),
        )
        .await?;

        let mut assignments: Vec<String> = prepared
            .columns
            .iter()
            .map(|(column, value)| format!("{} = {}", quote_identifier(column), literal(value)))
            .collect();
        if self.ctx.config().auto_columns.updated_at {
            assignments.push(format!("{} = NOW()", quote_identifier("updated_at")));
        }
        if !assignments.is_empty() {
            let sql = format!(
                "UPDATE {} SET {} WHERE {} = {}",
                quote_identifier(&object.table_name),
                assignments.join(", "),
                quote_identifier(object.primary_column()),
                literal(&key)
            );
            tracing::debug!(object = %object.id, sql = %sql, "Executing update");
            self.db().execute(&sql).await?;
        }

        for (relation, stored) in prepared.relations.iter().zip(current) {
            let wanted: HashSet<String> = relation.keys.iter().map(value_text).collect();
            let held: HashSet<String> = stored.iter().map(value_text).collect();

            for target in stored.iter().filter(|k| !wanted.contains(&value_text(k))) {
                self.unrelate_one(object, relation.join, &relation.linked_key, &prior, &key, target)
                    .await?;
            }
            for target in relation.keys.iter().filter(|k| !held.contains(&value_text(k))) {
                self.relate_one(object, relation.join, &relation.linked_key, &prior, &key, target)
                    .await?;
            }
        }

        tracing::info!(object = %object.id, key = %value_text(&key), "Updated record");
        self.saved(object, &key, user).await
    }

    /// Delete a record the caller may see
    ///
    /// Junction rows of many:many connections are removed before the row itself.
    pub async fn delete(
        &self,
        object_id: &str,
        key: &serde_json::Value,
        user: &UserContext,
    ) -> Result<()> {
        let snapshot = self.ctx.snapshot();
        let object = snapshot.require_object(object_id)?;
        let mapping = self.ctx.join_mapping(object_id)?;

        let _guard = self.ctx.lock_record(object_id, &value_text(key)).await;
        let row = self
            .find_one(object_id, key, Populate::None, user)
            .await?
            .ok_or_else(|| QueryError::record_not_found(record_ref(object, key)))?;
        let key = row
            .get(object.primary_column())
            .filter(|v| !is_blank(v))
            .cloned()
            .unwrap_or_else(|| key.clone());

        for join in mapping.iter() {
            let JoinSpec::Junction {
                table,
                source_column,
                ..
            } = &join.spec
            else {
                continue;
            };
            let sql = format!(
                "DELETE FROM {} WHERE {} = {}",
                quote_identifier(table),
                quote_identifier(source_column),
                literal(&base_value(join, &row, &key))
            );
            self.db().execute(&sql).await?;
        }

        let sql = format!(
            "DELETE FROM {} WHERE {} = {}",
            quote_identifier(&object.table_name),
            quote_identifier(object.primary_column()),
            literal(&key)
        );
        tracing::debug!(object = %object.id, sql = %sql, "Executing delete");
        let result = self.db().execute(&sql).await?;
        tracing::info!(
            object = %object.id,
            key = %value_text(&key),
            rows = result.rows_affected,
            "Deleted record"
        );
        Ok(())
    }

    /// Link a record to the given linked records
    ///
    /// `linked` holds linked keys or linked records, single or as a list.
    pub async fn relate(
        &self,
        object_id: &str,
        key: &serde_json::Value,
        field: &str,
        linked: &serde_json::Value,
        user: &UserContext,
    ) -> Result<()> {
        self.change_links(object_id, key, field, linked, user, true)
            .await
    }

    /// Remove links between a record and the given linked records
    pub async fn unrelate(
        &self,
        object_id: &str,
        key: &serde_json::Value,
        field: &str,
        linked: &serde_json::Value,
        user: &UserContext,
    ) -> Result<()> {
        self.change_links(object_id, key, field, linked, user, false)
            .await
    }

    async fn change_links(
        &self,
        object_id: &str,
        key: &serde_json::Value,
        field: &str,
        linked: &serde_json::Value,
        user: &UserContext,
        link: bool,
    ) -> Result<()> {
        let snapshot = self.ctx.snapshot();
        let object = snapshot.require_object(object_id)?;
        let mapping = self.ctx.join_mapping(object_id)?;
        let join = mapping.get(field).ok_or_else(|| {
            QueryError::invalid_input(format!(
                "'{}' is not a connection of '{}'",
                field, object.name
            ))
        })?;
        let linked_object = snapshot.require_object(&join.linked_object)?;
        let linked_key = join.spec.linked_key(linked_object).to_string();

        let _guard = self.ctx.lock_record(object_id, &value_text(key)).await;
        let row = self
            .find_one(object_id, key, Populate::None, user)
            .await?
            .ok_or_else(|| QueryError::record_not_found(record_ref(object, key)))?;
        let key = row
            .get(object.primary_column())
            .filter(|v| !is_blank(v))
            .cloned()
            .unwrap_or_else(|| key.clone());

        for target in distinct(connection_keys(linked, &linked_key)) {
            if link {
                self.relate_one(object, join, &linked_key, &row, &key, &target)
                    .await?;
            } else {
                self.unrelate_one(object, join, &linked_key, &row, &key, &target)
                    .await?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Statements
    // =========================================================================

    async fn relate_one(
        &self,
        object: &ObjectDefinition,
        join: &RelationJoin,
        linked_key: &str,
        row: &Record,
        key: &serde_json::Value,
        target: &serde_json::Value,
    ) -> Result<()> {
        let table = quote_identifier(&object.table_name);
        let pk = quote_identifier(object.primary_column());
        let statements = match &join.spec {
            JoinSpec::OwnColumn { fk, target_key } if is_self_one_to_one(object, join) => {
                let fk = quote_identifier(fk);
                let own = own_link_value(row, target_key, key);
                vec![
                    format!(
                        "UPDATE {} SET {} = NULL WHERE {} IN ({}, {})",
                        table,
                        fk,
                        fk,
                        literal(&own),
                        literal(target)
                    ),
                    format!(
                        "UPDATE {} SET {} = {} WHERE {} = {}",
                        table,
                        fk,
                        literal(target),
                        pk,
                        literal(key)
                    ),
                    format!(
                        "UPDATE {} SET {} = {} WHERE {} = {}",
                        table,
                        fk,
                        literal(&own),
                        quote_identifier(target_key),
                        literal(target)
                    ),
                ]
            }
            JoinSpec::OwnColumn { fk, .. } => vec![format!(
                "UPDATE {} SET {} = {} WHERE {} = {}",
                table,
                quote_identifier(fk),
                literal(target),
                pk,
                literal(key)
            )],
            JoinSpec::LinkedColumn { fk, .. } => {
                let linked_table = quote_identifier(&join.linked_table);
                let fk = quote_identifier(fk);
                let base = literal(&base_value(join, row, key));
                let mut statements = Vec::with_capacity(2);
                if join.shape == Shape::OneToOne {
                    statements.push(format!(
                        "UPDATE {} SET {} = NULL WHERE {} = {}",
                        linked_table, fk, fk, base
                    ));
                }
                statements.push(format!(
                    "UPDATE {} SET {} = {} WHERE {} = {}",
                    linked_table,
                    fk,
                    base,
                    quote_identifier(linked_key),
                    literal(target)
                ));
                statements
            }
            JoinSpec::Junction {
                table: junction,
                source_column,
                target_column,
                ..
            } => {
                let junction = quote_identifier(junction);
                let source_column = quote_identifier(source_column);
                let target_column = quote_identifier(target_column);
                let base = literal(&base_value(join, row, key));
                let target = literal(target);
                vec![format!(
                    "INSERT INTO {} ({}, {}) SELECT {}, {} FROM DUAL WHERE NOT EXISTS \
                     (SELECT 1 FROM {} WHERE {} = {} AND {} = {})",
                    junction,
                    source_column,
                    target_column,
                    base,
                    target,
                    junction,
                    source_column,
                    base,
                    target_column,
                    target
                )]
            }
        };
        self.execute_all(join, &statements).await
    }

    async fn unrelate_one(
        &self,
        object: &ObjectDefinition,
        join: &RelationJoin,
        linked_key: &str,
        row: &Record,
        key: &serde_json::Value,
        target: &serde_json::Value,
    ) -> Result<()> {
        let table = quote_identifier(&object.table_name);
        let pk = quote_identifier(object.primary_column());
        let statements = match &join.spec {
            JoinSpec::OwnColumn { fk, target_key } if is_self_one_to_one(object, join) => {
                let fk = quote_identifier(fk);
                let own = own_link_value(row, target_key, key);
                vec![
                    format!(
                        "UPDATE {} SET {} = NULL WHERE {} = {} AND {} = {}",
                        table,
                        fk,
                        pk,
                        literal(key),
                        fk,
                        literal(target)
                    ),
                    format!(
                        "UPDATE {} SET {} = NULL WHERE {} = {} AND {} = {}",
                        table,
                        fk,
                        quote_identifier(target_key),
                        literal(target),
                        fk,
                        literal(&own)
                    ),
                ]
            }
            JoinSpec::OwnColumn { fk, .. } => {
                let fk = quote_identifier(fk);
                vec![format!(
                    "UPDATE {} SET {} = NULL WHERE {} = {} AND {} = {}",
                    table,
                    fk,
                    pk,
                    literal(key),
                    fk,
                    literal(target)
                )]
            }
            JoinSpec::LinkedColumn { fk, .. } => {
                let fk = quote_identifier(fk);
                vec![format!(
                    "UPDATE {} SET {} = NULL WHERE {} = {} AND {} = {}",
                    quote_identifier(&join.linked_table),
                    fk,
                    quote_identifier(linked_key),
                    literal(target),
                    fk,
                    literal(&base_value(join, row, key))
                )]
            }
            JoinSpec::Junction {
                table: junction,
                source_column,
                target_column,
                ..
            } => vec![format!(
                "DELETE FROM {} WHERE {} = {} AND {} = {}",
                quote_identifier(junction),
                quote_identifier(source_column),
                literal(&base_value(join, row, key)),
                quote_identifier(target_column),
                literal(target)
            )],
        };
        self.execute_all(join, &statements).await
    }

    /// Run dependent link statements in order; writes are never retried
    async fn execute_all(&self, join: &RelationJoin, statements: &[String]) -> Result<()> {
        for sql in statements {
            tracing::debug!(field = %join.field_id, sql = %sql, "Executing link statement");
            self.db().execute(sql).await?;
        }
        Ok(())
    }

    /// Keys a stored record currently links through a connection
    async fn current_keys(
        &self,
        relation: &RelationValues<'_>,
        row: &Record,
        key: &serde_json::Value,
    ) -> Result<Vec<serde_json::Value>> {
        let join = relation.join;
        let sql = match &join.spec {
            JoinSpec::OwnColumn { fk, .. } => {
                return Ok(row
                    .get(fk)
                    .filter(|v| !is_blank(v))
                    .cloned()
                    .into_iter()
                    .collect());
            }
            JoinSpec::LinkedColumn { fk, .. } => format!(
                "SELECT {} AS {} FROM {} WHERE {} = {}",
                quote_identifier(&relation.linked_key),
                quote_identifier(KEY_ALIAS),
                quote_identifier(&join.linked_table),
                quote_identifier(fk),
                literal(&base_value(join, row, key))
            ),
            JoinSpec::Junction {
                table,
                source_column,
                target_column,
                ..
            } => format!(
                "SELECT {} AS {} FROM {} WHERE {} = {}",
                quote_identifier(target_column),
                quote_identifier(KEY_ALIAS),
                quote_identifier(table),
                quote_identifier(source_column),
                literal(&base_value(join, row, key))
            ),
        };
        let rows = fetch_with_retry(self.db(), &sql, self.ctx.config().read_retries).await?;
        Ok(distinct(
            rows.into_iter()
                .filter_map(|mut r| r.remove(KEY_ALIAS))
                .filter(|v| !is_blank(v))
                .collect(),
        ))
    }

    /// Read back a written record
    async fn saved(
        &self,
        object: &ObjectDefinition,
        key: &serde_json::Value,
        user: &UserContext,
    ) -> Result<SaveOutcome> {
        self.read_row(object, key, user)
            .await?
            .map(SaveOutcome::Saved)
            .ok_or_else(|| QueryError::record_not_found(record_ref(object, key)))
    }

    // =========================================================================
    // Values
    // =========================================================================

    /// Validate the caller's values and split them into columns and links
    ///
    /// On create, missing values fall back to field defaults and missing
    /// required values are errors; on update only supplied values are checked.
    fn prepare<'m>(
        &self,
        snapshot: &MetadataSnapshot,
        object: &ObjectDefinition,
        mapping: &'m JoinMapping,
        input: &serde_json::Map<String, serde_json::Value>,
        creating: bool,
    ) -> Result<Prepared<'m>> {
        let mut prepared = Prepared::default();

        for field in &object.fields {
            let supplied = input
                .get(&field.column_name)
                .or_else(|| input.get(&field.id));
            if field.is_virtual() {
                if supplied.is_some_and(|v| !v.is_null()) {
                    prepared
                        .errors
                        .push(FieldError::new(&field.column_name, "Computed fields are read-only"));
                }
                continue;
            }
            if field.multilingual {
                continue;
            }

            let value = match supplied {
                Some(value) => value.clone(),
                None if creating => match &field.default_value {
                    Some(default) => default.clone(),
                    None => {
                        if field.required {
                            prepared
                                .errors
                                .push(FieldError::new(&field.column_name, "Value is required"));
                        }
                        continue;
                    }
                },
                None => continue,
            };
            if field.required && is_blank(&value) {
                prepared
                    .errors
                    .push(FieldError::new(&field.column_name, "Value is required"));
                continue;
            }
            if let Err(message) = field.field_type.validate_value(&value) {
                prepared
                    .errors
                    .push(FieldError::new(&field.column_name, message));
                continue;
            }

            if field.is_connection() {
                // Unresolvable connections were reported when the mapping was built
                let Some(join) = mapping.get(&field.id) else {
                    continue;
                };
                let linked = snapshot.require_object(&join.linked_object)?;
                let linked_key = join.spec.linked_key(linked).to_string();
                let keys = distinct(connection_keys(&value, &linked_key));
                prepared.relations.push(RelationValues {
                    join,
                    linked_key,
                    keys,
                });
                continue;
            }
            prepared
                .columns
                .push((field.column_name.clone(), stored_value(field, &value)?));
        }

        let translations = &self.ctx.config().translations_column;
        if object.has_multilingual() {
            if let Some(value) = input.get(translations) {
                let stored = match value {
                    serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
                        serde_json::Value::String(serde_json::to_string(value)?)
                    }
                    other => other.clone(),
                };
                prepared.columns.push((translations.clone(), stored));
            }
        }
        Ok(prepared)
    }
}

fn input_map(values: &serde_json::Value) -> Result<&serde_json::Map<String, serde_json::Value>> {
    values.as_object().ok_or_else(|| {
        QueryError::invalid_input(format!("Record values must be a JSON object, got {}", values))
    })
}

/// Value as stored in the field's column
fn stored_value(field: &FieldDefinition, value: &serde_json::Value) -> Result<serde_json::Value> {
    let stored = match &field.field_type {
        FieldType::User { is_multiple: true } => json_text(&usernames_in(Some(value)))?,
        FieldType::User { .. } => match value {
            serde_json::Value::Object(user) => user
                .get("id")
                .cloned()
                .unwrap_or(serde_json::Value::Null),
            other => other.clone(),
        },
        FieldType::List { options, is_multiple } => {
            let id = |v: &serde_json::Value| match v.as_str() {
                Some(s) => option_id(options, s).unwrap_or(s).to_string(),
                None => value_text(v),
            };
            match value {
                serde_json::Value::Array(items) if *is_multiple => {
                    json_text(&items.iter().map(id).collect::<Vec<_>>())?
                }
                serde_json::Value::Null => serde_json::Value::Null,
                single => serde_json::Value::String(id(single)),
            }
        }
        FieldType::Boolean if !value.is_null() => {
            serde_json::Value::from(i64::from(truthy(Some(value))))
        }
        FieldType::Json => match value {
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
                serde_json::Value::String(serde_json::to_string(value)?)
            }
            other => other.clone(),
        },
        _ => value.clone(),
    };
    Ok(stored)
}

fn json_text(items: &[String]) -> Result<serde_json::Value> {
    Ok(serde_json::Value::String(serde_json::to_string(items)?))
}

fn is_blank(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::String(s) => s.is_empty(),
        serde_json::Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

fn distinct(keys: Vec<serde_json::Value>) -> Vec<serde_json::Value> {
    let mut seen = HashSet::new();
    keys.into_iter()
        .filter(|k| seen.insert(value_text(k)))
        .collect()
}

fn is_self_one_to_one(object: &ObjectDefinition, join: &RelationJoin) -> bool {
    join.shape == Shape::OneToOne && join.linked_object == object.id
}

/// Value of the base row the relation is keyed by
fn base_value(join: &RelationJoin, row: &Record, key: &serde_json::Value) -> serde_json::Value {
    row.get(join.spec.base_column())
        .filter(|v| !is_blank(v))
        .cloned()
        .unwrap_or_else(|| key.clone())
}

/// Value a partner row stores to point back at this row
fn own_link_value(row: &Record, target_key: &str, key: &serde_json::Value) -> serde_json::Value {
    row.get(target_key)
        .filter(|v| !is_blank(v))
        .cloned()
        .unwrap_or_else(|| key.clone())
}

fn record_ref(object: &ObjectDefinition, key: &serde_json::Value) -> String {
    format!("{} '{}'", object.name, value_text(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeDatabase, record, sample_context};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    const TAGS: &str = "`JOINMN_AB_Invoice_AB_Tag_tags`";

    fn query() -> (ObjectQuery<'static>, Arc<FakeDatabase>) {
        let (ctx, db) = sample_context();
        (ObjectQuery::new(Arc::new(ctx)), db)
    }

    #[tokio::test]
    async fn test_create_inserts_then_relates() {
        let (store, db) = query();
        db.respond("SELECT `AB_Invoice`.*", vec![record(json!({"uuid": "i1"}))]);

        let outcome = store
            .create(
                "obj_invoice",
                &json!({
                    "uuid": "i1",
                    "number": "A-1",
                    "status": "Closed",
                    "paid": true,
                    "owner": {"id": "alice", "text": "Alice"},
                    "watchers": ["bob", "carol"],
                    "tags": ["t1", {"uuid": "t2"}],
                    "customer": 7
                }),
                &UserContext::system(),
            )
            .await
            .unwrap();

        assert!(outcome.record().is_some());
        assert_eq!(
            db.writes(),
            vec![
                "INSERT INTO `AB_Invoice` (`uuid`, `number`, `status`, `paid`, `owner`, `watchers`, `created_at`, `updated_at`) \
                 VALUES ('i1', 'A-1', 'opt_closed', 1, 'alice', '[\"bob\",\"carol\"]', NOW(), NOW())"
                    .to_string(),
                format!(
                    "INSERT INTO {t} (`AB_Invoice`, `AB_Tag`) SELECT 'i1', 't1' FROM DUAL WHERE NOT EXISTS \
                     (SELECT 1 FROM {t} WHERE `AB_Invoice` = 'i1' AND `AB_Tag` = 't1')",
                    t = TAGS
                ),
                format!(
                    "INSERT INTO {t} (`AB_Invoice`, `AB_Tag`) SELECT 'i1', 't2' FROM DUAL WHERE NOT EXISTS \
                     (SELECT 1 FROM {t} WHERE `AB_Invoice` = 'i1' AND `AB_Tag` = 't2')",
                    t = TAGS
                ),
                "UPDATE `AB_Invoice` SET `customer` = 7 WHERE `uuid` = 'i1'".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_create_generates_uuid_and_reads_back_by_it() {
        let (store, db) = query();
        store
            .create("obj_tag", &json!({"name": "urgent"}), &UserContext::system())
            .await
            .unwrap_err();

        let insert = &db.writes()[0];
        let key = insert
            .split("VALUES ('")
            .nth(1)
            .and_then(|rest| rest.split('\'').next())
            .unwrap()
            .to_string();
        assert!(uuid::Uuid::parse_str(&key).is_ok());
        assert!(db.statements()[1].contains(&format!("WHERE `AB_Tag`.`uuid` = '{}'", key)));
    }

    #[tokio::test]
    async fn test_create_with_auto_increment_key() {
        let (store, db) = query();
        db.set_insert_id(9);
        db.respond("FROM `AB_Customer`", vec![record(json!({"id": 9, "name": "ACME"}))]);

        let outcome = store
            .create("obj_customer", &json!({"name": "ACME"}), &UserContext::system())
            .await
            .unwrap();

        assert_eq!(outcome.record().unwrap()["name"], json!("ACME"));
        assert_eq!(
            db.statements(),
            vec![
                "INSERT INTO `AB_Customer` (`name`, `created_at`, `updated_at`) VALUES ('ACME', NOW(), NOW())",
                "SELECT `AB_Customer`.* FROM `AB_Customer` WHERE `AB_Customer`.`id` = 9 LIMIT 1",
            ]
        );
    }

    #[tokio::test]
    async fn test_validation_errors_write_nothing() {
        let (store, db) = query();

        let missing = store
            .create("obj_person", &json!({}), &UserContext::system())
            .await
            .unwrap();
        assert_eq!(
            missing.errors(),
            &[FieldError::new("name", "Value is required")]
        );

        let invalid = store
            .create(
                "obj_invoice",
                &json!({"status": "Bogus", "line_total": 5, "total": "many"}),
                &UserContext::system(),
            )
            .await
            .unwrap();
        let fields: Vec<&str> = invalid.errors().iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["status", "total", "line_total"]);

        assert!(db.statements().is_empty());
    }

    #[tokio::test]
    async fn test_update_issues_only_the_relation_delta() {
        let (store, db) = query();
        db.respond("SELECT `AB_Invoice`.*", vec![record(json!({"uuid": "i1", "number": "A-1"}))]);
        db.respond(
            "SELECT `AB_Tag` AS `__key`",
            vec![record(json!({"__key": "t1"})), record(json!({"__key": "t2"}))],
        );

        store
            .update(
                "obj_invoice",
                &json!("i1"),
                &json!({"tags": ["t2", "t3"]}),
                &UserContext::system(),
            )
            .await
            .unwrap();

        let link_writes: Vec<String> = db
            .writes()
            .into_iter()
            .filter(|s| s.contains(TAGS))
            .collect();
        assert_eq!(
            link_writes,
            vec![
                format!("DELETE FROM {} WHERE `AB_Invoice` = 'i1' AND `AB_Tag` = 't1'", TAGS),
                format!(
                    "INSERT INTO {t} (`AB_Invoice`, `AB_Tag`) SELECT 'i1', 't3' FROM DUAL WHERE NOT EXISTS \
                     (SELECT 1 FROM {t} WHERE `AB_Invoice` = 'i1' AND `AB_Tag` = 't3')",
                    t = TAGS
                ),
            ]
        );
        assert_eq!(
            db.matching("AS `__key`"),
            vec![format!("SELECT `AB_Tag` AS `__key` FROM {} WHERE `AB_Invoice` = 'i1'", TAGS)]
        );
    }

    #[tokio::test]
    async fn test_update_columns_and_own_column_link() {
        let (store, db) = query();
        db.respond(
            "SELECT `AB_Invoice`.*",
            vec![record(json!({"uuid": "i1", "customer": 7}))],
        );

        store
            .update(
                "obj_invoice",
                &json!("i1"),
                &json!({"number": "A-2", "customer": {"id": 8}}),
                &UserContext::system(),
            )
            .await
            .unwrap();

        assert_eq!(
            db.writes(),
            vec![
                "UPDATE `AB_Invoice` SET `number` = 'A-2', `updated_at` = NOW() WHERE `uuid` = 'i1'",
                "UPDATE `AB_Invoice` SET `customer` = NULL WHERE `uuid` = 'i1' AND `customer` = 7",
                "UPDATE `AB_Invoice` SET `customer` = 8 WHERE `uuid` = 'i1'",
            ]
        );
    }

    #[tokio::test]
    async fn test_update_missing_record() {
        let (store, db) = query();
        let err = store
            .update("obj_invoice", &json!("nope"), &json!({"number": "x"}), &UserContext::system())
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::RecordNotFound(_)));
        assert!(db.writes().is_empty());
    }

    #[tokio::test]
    async fn test_self_referential_partner_links_both_rows() {
        let (store, db) = query();
        db.respond("SELECT `AB_Person`.*", vec![record(json!({"uuid": "p1", "name": "Ann"}))]);

        store
            .relate("obj_person", &json!("p1"), "partner", &json!("p2"), &UserContext::system())
            .await
            .unwrap();
        store
            .unrelate("obj_person", &json!("p1"), "partner", &json!("p2"), &UserContext::system())
            .await
            .unwrap();

        assert_eq!(
            db.writes(),
            vec![
                "UPDATE `AB_Person` SET `partner` = NULL WHERE `partner` IN ('p1', 'p2')",
                "UPDATE `AB_Person` SET `partner` = 'p2' WHERE `uuid` = 'p1'",
                "UPDATE `AB_Person` SET `partner` = 'p1' WHERE `uuid` = 'p2'",
                "UPDATE `AB_Person` SET `partner` = NULL WHERE `uuid` = 'p1' AND `partner` = 'p2'",
                "UPDATE `AB_Person` SET `partner` = NULL WHERE `uuid` = 'p2' AND `partner` = 'p1'",
            ]
        );
    }

    #[tokio::test]
    async fn test_relate_through_linked_column() {
        let (store, db) = query();
        db.respond("SELECT `AB_Customer`.*", vec![record(json!({"id": 3, "name": "ACME"}))]);

        store
            .relate(
                "obj_customer",
                &json!(3),
                "invoices",
                &json!([{"uuid": "i1"}, "i1"]),
                &UserContext::system(),
            )
            .await
            .unwrap();

        assert_eq!(
            db.writes(),
            vec!["UPDATE `AB_Invoice` SET `customer` = 3 WHERE `uuid` = 'i1'"]
        );
    }

    #[tokio::test]
    async fn test_customer_link_round_trip() {
        let (store, db) = query();
        let system = UserContext::system();
        let customer = Populate::Fields(vec!["customer".into()]);
        db.respond("SELECT `AB_Invoice`.*", vec![record(json!({"uuid": "i1", "customer": 7}))]);
        db.respond(
            "FROM `AB_Customer` AS `__linked`",
            vec![record(json!({"id": 7, "name": "ACME"}))],
        );

        store
            .create("obj_invoice", &json!({"uuid": "i1", "customer": 7}), &system)
            .await
            .unwrap();
        assert_eq!(
            db.writes().last().unwrap(),
            "UPDATE `AB_Invoice` SET `customer` = 7 WHERE `uuid` = 'i1'"
        );

        let linked = store
            .find_one("obj_invoice", &json!("i1"), customer.clone(), &system)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(linked["customer"], json!(7));
        assert_eq!(linked["customer__relation"]["name"], json!("ACME"));

        store
            .update("obj_invoice", &json!("i1"), &json!({"customer": null}), &system)
            .await
            .unwrap();
        assert_eq!(
            db.writes().last().unwrap(),
            "UPDATE `AB_Invoice` SET `customer` = NULL WHERE `uuid` = 'i1' AND `customer` = 7"
        );

        db.respond("SELECT `AB_Invoice`.*", vec![record(json!({"uuid": "i1", "customer": null}))]);
        let unlinked = store
            .find_one("obj_invoice", &json!("i1"), customer, &system)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(unlinked["customer__relation"], serde_json::Value::Null);
        assert_eq!(db.matching("AS `__linked`").len(), 1);
    }

    #[tokio::test]
    async fn test_one_to_one_link_held_by_linked_row_round_trip() {
        let (ctx, db, _) = crate::testing::context_with(crate::testing::badge_objects());
        let store = ObjectQuery::new(Arc::new(ctx));
        let system = UserContext::system();
        let badge = Populate::Fields(vec!["badge".into()]);
        db.respond("SELECT `AB_Employee`.*", vec![record(json!({"uuid": "e1", "name": "Eve"}))]);
        db.respond(
            "FROM `AB_Badge` AS `__linked`",
            vec![record(json!({"uuid": "b1", "code": "B-1", "employee": "e1"}))],
        );

        store
            .create("obj_employee", &json!({"uuid": "e1", "name": "Eve", "badge": "b1"}), &system)
            .await
            .unwrap();
        assert_eq!(
            db.writes(),
            vec![
                "INSERT INTO `AB_Employee` (`uuid`, `name`, `created_at`, `updated_at`) VALUES ('e1', 'Eve', NOW(), NOW())",
                "UPDATE `AB_Badge` SET `employee` = NULL WHERE `employee` = 'e1'",
                "UPDATE `AB_Badge` SET `employee` = 'e1' WHERE `uuid` = 'b1'",
            ]
        );

        let linked = store
            .find_one("obj_employee", &json!("e1"), badge.clone(), &system)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(linked["badge__relation"]["uuid"], json!("b1"));
        assert_eq!(
            db.matching("AS `__linked`"),
            vec!["SELECT `__linked`.* FROM `AB_Badge` AS `__linked` WHERE `__linked`.`employee` IN ('e1')"]
        );

        db.respond("AS `__key`", vec![record(json!({"__key": "b1"}))]);
        store
            .update("obj_employee", &json!("e1"), &json!({"badge": null}), &system)
            .await
            .unwrap();
        assert_eq!(
            db.writes()[3..].to_vec(),
            vec![
                "UPDATE `AB_Employee` SET `updated_at` = NOW() WHERE `uuid` = 'e1'",
                "UPDATE `AB_Badge` SET `employee` = NULL WHERE `uuid` = 'b1' AND `employee` = 'e1'",
            ]
        );

        db.respond("FROM `AB_Badge` AS `__linked`", Vec::new());
        let unlinked = store
            .find_one("obj_employee", &json!("e1"), badge, &system)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(unlinked["badge__relation"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn test_relate_unknown_connection() {
        let (store, _) = query();
        let err = store
            .relate("obj_invoice", &json!("i1"), "number", &json!("x"), &UserContext::system())
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_delete_removes_junction_rows_first() {
        let (store, db) = query();
        db.respond("SELECT `AB_Invoice`.*", vec![record(json!({"uuid": "i1"}))]);

        store
            .delete("obj_invoice", &json!("i1"), &UserContext::system())
            .await
            .unwrap();

        assert_eq!(
            db.writes(),
            vec![
                format!("DELETE FROM {} WHERE `AB_Invoice` = 'i1'", TAGS),
                "DELETE FROM `AB_Invoice` WHERE `uuid` = 'i1'".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_delete_outside_scope_is_not_found() {
        let (store, db) = query();
        let err = store
            .delete("obj_invoice", &json!("i1"), &UserContext::anonymous())
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::RecordNotFound(_)));
        assert!(db.statements()[0].contains("WHERE 1 = 0"));
        assert!(db.writes().is_empty());
    }

    #[tokio::test]
    async fn test_mutation_joins_transaction() {
        let (store, db) = query();
        let tx = FakeDatabase::new();
        tx.respond("SELECT `AB_Tag`.*", vec![record(json!({"uuid": "t1"}))]);

        store
            .with_transaction(&tx)
            .create("obj_tag", &json!({"uuid": "t1", "name": "x"}), &UserContext::system())
            .await
            .unwrap();

        assert!(db.statements().is_empty());
        assert_eq!(tx.writes().len(), 1);
    }
}
