//! ObjectQuery - main entry point for querying metadata-defined objects
//!
//! Reads flow through the rewrite pipeline (scopes and placeholders), the rule
//! compiler and the relation resolver:
//!
//! ```text
//! FindOptions -> rewrite::reduce -> ConditionCompiler -> SELECT -> relation::populate
//! ```
//!
//! Mutations live in `mutation.rs` on the same type.

use std::sync::Arc;

use crate::condition::{Condition, Rule, RuleOp, THIS_OBJECT_KEY};
use crate::db::{Database, fetch_with_retry};
use crate::error::{QueryError, Result};
use crate::record::{FindOptions, Populate, Record};
use crate::relation;
use crate::rewrite;
use crate::schema::ObjectDefinition;
use crate::security::UserContext;
use crate::sql::condition::{ConditionCompiler, FormulaFilters};
use crate::sql::sanitize::{quote_identifier, quote_qualified};
use crate::tenant::{MetadataSnapshot, TenantContext};

/// Query executor and mutation coordinator for one tenant
///
/// Statements run against the tenant database unless a transaction was
/// attached with [`ObjectQuery::with_transaction`], in which case every
/// statement joins it.
#[derive(Clone)]
pub struct ObjectQuery<'t> {
    pub(crate) ctx: Arc<TenantContext>,
    tx: Option<&'t dyn Database>,
}

impl ObjectQuery<'static> {
    pub fn new(ctx: Arc<TenantContext>) -> Self {
        Self { ctx, tx: None }
    }
}

impl<'t> ObjectQuery<'t> {
    /// Same executor with every statement joining `tx`
    pub fn with_transaction<'u>(&self, tx: &'u dyn Database) -> ObjectQuery<'u> {
        ObjectQuery {
            ctx: self.ctx.clone(),
            tx: Some(tx),
        }
    }

    pub fn context(&self) -> &TenantContext {
        &self.ctx
    }

    /// Handle statements run against
    pub(crate) fn db(&self) -> &dyn Database {
        match self.tx {
            Some(tx) => tx,
            None => self.ctx.database(),
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Find records of an object
    ///
    /// The condition is reduced for `user` (scopes, placeholders), compiled and
    /// run; requested connection fields are then populated.
    pub async fn find(
        &self,
        object_id: &str,
        options: &FindOptions,
        user: &UserContext,
    ) -> Result<Vec<Record>> {
        let snapshot = self.ctx.snapshot();
        let object = snapshot.require_object(object_id)?;
        let db = self.db();

        let condition =
            rewrite::reduce(&self.ctx, db, object_id, options.condition.clone(), user).await?;
        let formulas = self.formula_filters(&snapshot, object, options, user).await?;
        let sql = self.select_sql(
            &snapshot,
            object,
            options,
            &condition,
            &formulas,
            &user.language_code,
        )?;
        tracing::debug!(object = %object.id, sql = %sql, "Executing find");

        let mut rows = fetch_with_retry(db, &sql, self.ctx.config().read_retries).await?;
        relation::populate(
            &self.ctx,
            db,
            object,
            &mut rows,
            &options.populate,
            options.minimal,
        )
        .await?;
        Ok(rows)
    }

    /// Find records from caller input in expanded or shorthand form
    pub async fn find_json(
        &self,
        object_id: &str,
        input: &serde_json::Value,
        user: &UserContext,
    ) -> Result<Vec<Record>> {
        let options = FindOptions::from_json(input)?;
        self.find(object_id, &options, user).await
    }

    /// Number of records matching the options' condition
    ///
    /// Sort, paging and population are ignored.
    pub async fn count(
        &self,
        object_id: &str,
        options: &FindOptions,
        user: &UserContext,
    ) -> Result<i64> {
        let snapshot = self.ctx.snapshot();
        let object = snapshot.require_object(object_id)?;
        let db = self.db();

        let condition =
            rewrite::reduce(&self.ctx, db, object_id, options.condition.clone(), user).await?;
        let formulas = self.formula_filters(&snapshot, object, options, user).await?;
        let (compiler, joins) =
            self.compiler(&snapshot, object, options, &formulas, &user.language_code)?;

        let mut sql = format!(
            "SELECT COUNT(DISTINCT {}) AS `count` FROM {}{}",
            quote_qualified(&object.table_name, object.primary_column()),
            quote_identifier(&object.table_name),
            joins
        );
        if let Some(where_sql) = compiler.build_condition_clause(&condition)? {
            sql.push_str(" WHERE ");
            sql.push_str(&where_sql);
        }
        tracing::debug!(object = %object.id, sql = %sql, "Executing count");

        let rows = fetch_with_retry(db, &sql, self.ctx.config().read_retries).await?;
        let count = rows
            .first()
            .and_then(|row| row.get("count"))
            .and_then(|v| v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
            .unwrap_or(0);
        Ok(count)
    }

    /// Record by primary key, if the caller may see it
    pub async fn find_one(
        &self,
        object_id: &str,
        key: &serde_json::Value,
        populate: Populate,
        user: &UserContext,
    ) -> Result<Option<Record>> {
        let options = FindOptions::new()
            .with_condition(by_key(key))
            .populate(populate)
            .paginate(0, 1);
        let rows = self.find(object_id, &options, user).await?;
        Ok(rows.into_iter().next())
    }

    /// Stored row by primary key, without scope filtering or population
    pub(crate) async fn read_row(
        &self,
        object: &ObjectDefinition,
        key: &serde_json::Value,
        user: &UserContext,
    ) -> Result<Option<Record>> {
        let snapshot = self.ctx.snapshot();
        let options = FindOptions::new().with_condition(by_key(key)).paginate(0, 1);
        let formulas = self.formula_filters(&snapshot, object, &options, user).await?;
        let sql = self.select_sql(
            &snapshot,
            object,
            &options,
            &options.condition,
            &formulas,
            &user.language_code,
        )?;
        let rows = fetch_with_retry(self.db(), &sql, self.ctx.config().read_retries).await?;
        Ok(rows.into_iter().next())
    }

    /// Formula filters of the base object and the joined objects, reduced for `user`
    async fn formula_filters(
        &self,
        snapshot: &MetadataSnapshot,
        object: &ObjectDefinition,
        options: &FindOptions,
        user: &UserContext,
    ) -> Result<FormulaFilters> {
        let mut objects = vec![object];
        if !options.joins.is_empty() {
            let mapping = self.ctx.join_mapping(&object.id)?;
            objects.extend(
                options
                    .joins
                    .iter()
                    .filter_map(|request| mapping.get(&request.field))
                    .filter_map(|join| snapshot.object(&join.linked_object)),
            );
        }
        rewrite::reduce_formula_filters(&self.ctx, self.db(), &objects, user).await
    }

    // =========================================================================
    // SQL building
    // =========================================================================

    /// Compiler with the requested join aliases, and the matching `LEFT JOIN`s
    fn compiler<'a>(
        &'a self,
        snapshot: &'a MetadataSnapshot,
        object: &'a ObjectDefinition,
        options: &FindOptions,
        formulas: &'a FormulaFilters,
        language: &'a str,
    ) -> Result<(ConditionCompiler<'a>, String)> {
        let mut compiler = ConditionCompiler::new(&self.ctx, snapshot, object, language)
            .with_formula_filters(formulas);
        let mut joins = String::new();
        if options.joins.is_empty() {
            return Ok((compiler, joins));
        }

        let mapping = self.ctx.join_mapping(&object.id)?;
        for request in &options.joins {
            let join = mapping.get(&request.field).ok_or_else(|| {
                QueryError::invalid_input(format!(
                    "'{}' is not a connection of '{}'",
                    request.field, object.name
                ))
            })?;
            let linked = snapshot.require_object(&join.linked_object)?;
            joins.push(' ');
            joins.push_str(&relation::left_join(join, &object.table_name, &request.alias));
            compiler = compiler.with_alias(request.alias.clone(), linked);
        }
        Ok((compiler, joins))
    }

    /// Full `SELECT` of a find request over an already reduced condition
    pub(crate) fn select_sql(
        &self,
        snapshot: &MetadataSnapshot,
        object: &ObjectDefinition,
        options: &FindOptions,
        condition: &Condition,
        formulas: &FormulaFilters,
        language: &str,
    ) -> Result<String> {
        let (compiler, joins) = self.compiler(snapshot, object, options, formulas, language)?;

        let mut columns = vec![format!("{}.*", quote_identifier(&object.table_name))];
        columns.extend(compiler.virtual_columns()?);
        let distinct = if options.joins.is_empty() { "" } else { "DISTINCT " };

        let mut sql = format!(
            "SELECT {}{} FROM {}{}",
            distinct,
            columns.join(", "),
            quote_identifier(&object.table_name),
            joins
        );
        if let Some(where_sql) = compiler.build_condition_clause(condition)? {
            sql.push_str(" WHERE ");
            sql.push_str(&where_sql);
        }
        if let Some(order_by) = compiler.build_order_by_clause(&options.sort)? {
            sql.push_str(" ORDER BY ");
            sql.push_str(&order_by);
        }
        let limit = options
            .limit
            .filter(|l| *l >= 0)
            .unwrap_or(self.ctx.config().default_limit);
        sql.push_str(&format!(" LIMIT {}", limit));
        if let Some(offset) = options.offset.filter(|o| *o > 0) {
            sql.push_str(&format!(" OFFSET {}", offset));
        }
        Ok(sql)
    }
}

impl std::fmt::Debug for ObjectQuery<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectQuery")
            .field("ctx", &self.ctx)
            .field("in_transaction", &self.tx.is_some())
            .finish()
    }
}

/// `this_object = key`
pub(crate) fn by_key(key: &serde_json::Value) -> Condition {
    Condition::Rule(Rule::new(THIS_OBJECT_KEY, RuleOp::Equals, key.clone()))
}
