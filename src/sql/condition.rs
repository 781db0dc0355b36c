//! Condition building for SQL WHERE and ORDER BY clauses
//!
//! Compiles a fully rewritten condition tree against one object. Keys are
//! resolved to fields (or the primary key), values are escaped by
//! `sql::sanitize`, and every operator maps to a `sql::fragment` constructor.

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

use crate::condition::{CONSTANT_KEY, Condition, Rule, RuleOp, THIS_OBJECT_KEY};
use crate::error::{QueryError, Result};
use crate::record::SortSpec;
use crate::relation::{self, JoinSpec};
use crate::schema::ObjectDefinition;
use crate::security::truthy;
use crate::sql::fragment::{self, Operator, Pattern};
use crate::sql::sanitize::{literal, quote_identifier, quote_qualified, value_text};
use crate::tenant::{MetadataSnapshot, TenantContext};
use crate::types::{Aggregate, FieldDefinition, FieldType, FormulaSettings, option_id};

static CALCULATE_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([^{}]+)\}").expect("calculate placeholder pattern"));

static ARITHMETIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9\s.+\-*/()%]*$").expect("arithmetic pattern"));

/// Auto-managed columns that may be filtered and sorted on
const AUTO_COLUMNS: [&str; 2] = ["created_at", "updated_at"];

/// Formula filters with their placeholders already resolved, by field id
pub type FormulaFilters = HashMap<String, Condition>;

/// Resolved rule key
struct Resolved<'a> {
    object: &'a ObjectDefinition,
    /// Name the owning table is referenced by
    table: String,
    field: Option<&'a FieldDefinition>,
    column: String,
}

/// Compiles conditions and sort specs against one object
pub struct ConditionCompiler<'a> {
    ctx: &'a TenantContext,
    snapshot: &'a MetadataSnapshot,
    object: &'a ObjectDefinition,
    table: String,
    aliases: HashMap<String, &'a ObjectDefinition>,
    formula_filters: Option<&'a FormulaFilters>,
    language: &'a str,
    depth: usize,
}

impl<'a> ConditionCompiler<'a> {
    pub fn new(
        ctx: &'a TenantContext,
        snapshot: &'a MetadataSnapshot,
        object: &'a ObjectDefinition,
        language: &'a str,
    ) -> Self {
        Self {
            ctx,
            snapshot,
            object,
            table: object.table_name.clone(),
            aliases: HashMap::new(),
            formula_filters: None,
            language,
            depth: 0,
        }
    }

    /// Use reduced filters for the formula fields they are keyed by
    pub fn with_formula_filters(mut self, filters: &'a FormulaFilters) -> Self {
        self.formula_filters = Some(filters);
        self
    }

    /// Reference the base table by another name
    pub fn with_table_ref(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// Make a joined object addressable through `Rule::alias`
    pub fn with_alias(mut self, alias: impl Into<String>, object: &'a ObjectDefinition) -> Self {
        self.aliases.insert(alias.into(), object);
        self
    }

    /// Name the base table is referenced by
    pub fn table_ref(&self) -> &str {
        &self.table
    }

    /// Compiler for a linked object inside a correlated sub-select
    fn nested(&self, object: &'a ObjectDefinition, prefix: &str) -> ConditionCompiler<'a> {
        let depth = self.depth + 1;
        ConditionCompiler {
            ctx: self.ctx,
            snapshot: self.snapshot,
            object,
            table: format!("{}{}", prefix, depth),
            aliases: HashMap::new(),
            formula_filters: self.formula_filters,
            language: self.language,
            depth,
        }
    }

    /// Compile a condition tree
    ///
    /// Returns `None` when nothing restricts the result.
    pub fn build_condition_clause(&self, condition: &Condition) -> Result<Option<String>> {
        match condition {
            Condition::Rule(rule) => self.compile_rule(rule),
            Condition::Group(group) => {
                let mut parts = Vec::with_capacity(group.rules.len());
                for child in &group.rules {
                    if let Some(part) = self.build_condition_clause(child)? {
                        parts.push(part);
                    }
                }
                Ok(fragment::glue(parts, group.glue))
            }
            Condition::Malformed(node) => Err(QueryError::invalid_condition(format!(
                "Malformed condition node: {}",
                node
            ))),
        }
    }

    /// Compile a single rule; `None` when the rule does not restrict anything
    pub fn compile_rule(&self, rule: &Rule) -> Result<Option<String>> {
        if rule.rule.is_placeholder() {
            return Err(QueryError::invalid_condition(format!(
                "Unresolved '{}' rule on key '{}'",
                rule.rule, rule.key
            )));
        }
        if rule.key == CONSTANT_KEY {
            return constant(rule).map(Some);
        }

        let resolved = self.resolve(&rule.key, rule.alias.as_deref())?;
        match resolved.field {
            Some(field) if field.is_connection() => self.compile_connection(rule, &resolved, field),
            Some(field) => self.compile_field(rule, &resolved, field),
            None => compile_scalar(
                rule.rule,
                &quote_qualified(&resolved.table, &resolved.column),
                &rule.value,
                false,
            ),
        }
    }

    /// Compile sort specs into an ORDER BY list
    pub fn build_order_by_clause(&self, sort: &[SortSpec]) -> Result<Option<String>> {
        let mut parts = Vec::with_capacity(sort.len());
        for spec in sort {
            let resolved = self.resolve(&spec.key, None)?;
            let expr = match resolved.field {
                Some(field) => match &field.field_type {
                    FieldType::List { .. } if !spec.order.is_empty() => {
                        let column = quote_qualified(&resolved.table, &resolved.column);
                        fragment::find_in_set(&column, &spec.order)
                    }
                    _ => self.field_expression(&resolved, field)?,
                },
                None => quote_qualified(&resolved.table, &resolved.column),
            };
            parts.push(format!("{} {}", expr, spec.direction.as_sql()));
        }
        Ok(if parts.is_empty() {
            None
        } else {
            Some(parts.join(", "))
        })
    }

    /// Select-list entries for formula and calculate fields of the base object
    pub fn virtual_columns(&self) -> Result<Vec<String>> {
        let mut columns = Vec::new();
        let mapping = self.ctx.join_mapping(&self.object.id)?;
        for field in self.object.fields.iter().filter(|f| f.is_virtual()) {
            let resolved = Resolved {
                object: self.object,
                table: self.table.clone(),
                field: Some(field),
                column: field.column_name.clone(),
            };
            let expr = match &field.field_type {
                FieldType::Formula(settings) if mapping.get(&settings.field).is_none() => {
                    // Reported; the column reads as NULL until the connection is fixed
                    self.ctx.report_unresolved(self.object, &settings.field);
                    "NULL".to_string()
                }
                _ => self.field_expression(&resolved, field)?,
            };
            columns.push(format!("{} AS {}", expr, quote_identifier(&field.column_name)));
        }
        Ok(columns)
    }

    fn resolve(&self, key: &str, alias: Option<&str>) -> Result<Resolved<'a>> {
        let (object, table) = match alias {
            Some(alias) => {
                let object = self.aliases.get(alias).copied().ok_or_else(|| {
                    QueryError::invalid_condition(format!("Unknown join alias '{}'", alias))
                })?;
                (object, alias.to_string())
            }
            None => (self.object, self.table.clone()),
        };

        if key == THIS_OBJECT_KEY || key == object.primary_column() {
            return Ok(Resolved {
                object,
                table,
                field: None,
                column: object.primary_column().to_string(),
            });
        }
        if let Some(field) = object.field(key) {
            return Ok(Resolved {
                object,
                table,
                field: Some(field),
                column: field.column_name.clone(),
            });
        }
        if AUTO_COLUMNS.contains(&key) {
            return Ok(Resolved {
                object,
                table,
                field: None,
                column: key.to_string(),
            });
        }
        Err(QueryError::field_not_found(&object.name, key))
    }

    /// SQL expression producing a field's value
    fn field_expression(&self, resolved: &Resolved<'a>, field: &FieldDefinition) -> Result<String> {
        match &field.field_type {
            FieldType::Formula(settings) => {
                self.formula_expression(resolved.object, &resolved.table, field, settings)
            }
            FieldType::Calculate { formula } => {
                calculate_expression(resolved.object, &resolved.table, formula)
            }
            _ if field.multilingual => Ok(fragment::multilingual(
                &quote_qualified(&resolved.table, &self.ctx.config().translations_column),
                self.language,
                &field.column_name,
            )),
            _ => Ok(quote_qualified(&resolved.table, &field.column_name)),
        }
    }

    fn compile_field(
        &self,
        rule: &Rule,
        resolved: &Resolved<'a>,
        field: &FieldDefinition,
    ) -> Result<Option<String>> {
        let expr = self.field_expression(resolved, field)?;
        let value = normalize_value(field, &rule.value);

        if field.is_multi_valued() {
            return compile_multi(rule.rule, &expr, &value);
        }
        let by_day = matches!(field.field_type, FieldType::Date);
        compile_scalar(rule.rule, &expr, &value, by_day)
    }

    fn compile_connection(
        &self,
        rule: &Rule,
        resolved: &Resolved<'a>,
        field: &FieldDefinition,
    ) -> Result<Option<String>> {
        let mapping = self.ctx.join_mapping(&resolved.object.id)?;
        let join = mapping
            .get(&field.id)
            .ok_or_else(|| self.ctx.unresolved_connection(resolved.object, &field.id))?;
        let linked = self.snapshot.require_object(&join.linked_object)?;
        let inner = self.nested(linked, "__r");
        let (from, correlation) = relation::correlated(join, &resolved.table, inner.table_ref());
        let linked_key = quote_qualified(inner.table_ref(), join.spec.linked_key(linked));

        let exists = |predicate: Option<String>, negated: bool| {
            let predicate = predicate
                .map(|p| format!(" AND {}", p))
                .unwrap_or_default();
            Some(fragment::exists(
                &format!("SELECT 1 FROM {} WHERE {}{}", from, correlation, predicate),
                negated,
            ))
        };

        match rule.rule {
            RuleOp::HaveRelation | RuleOp::HaveNoRelation => {
                let predicate = match relation_filter(&rule.value)? {
                    Some(filter) => inner.build_condition_clause(&filter)?,
                    None => None,
                };
                return Ok(exists(predicate, rule.rule == RuleOp::HaveNoRelation));
            }
            _ => {}
        }

        let keys = connection_keys(&rule.value, join.spec.linked_key(linked));
        if let JoinSpec::OwnColumn { fk, .. } = &join.spec {
            let column = quote_qualified(&resolved.table, fk);
            return compile_scalar(rule.rule, &column, &serde_json::Value::Array(keys), false);
        }

        let negated = rule.rule.is_negative();
        let predicate = match rule.rule {
            RuleOp::Equals | RuleOp::NotEqual | RuleOp::In | RuleOp::NotIn => {
                Some(fragment::in_list(&linked_key, &keys, false))
            }
            RuleOp::Contains | RuleOp::NotContains => {
                Some(fragment::like(&linked_key, Pattern::Contains, &rule.value, false))
            }
            RuleOp::IsNull | RuleOp::IsEmpty => return Ok(exists(None, true)),
            RuleOp::IsNotNull | RuleOp::IsNotEmpty => return Ok(exists(None, false)),
            other => {
                return Err(QueryError::invalid_condition(format!(
                    "Operator '{}' is not supported on connection field '{}'",
                    other, field.column_name
                )));
            }
        };
        Ok(exists(predicate, negated))
    }

    /// Correlated scalar sub-select computing a formula field
    fn formula_expression(
        &self,
        object: &'a ObjectDefinition,
        table: &str,
        field: &FieldDefinition,
        settings: &FormulaSettings,
    ) -> Result<String> {
        let mapping = self.ctx.join_mapping(&object.id)?;
        let join = mapping
            .get(&settings.field)
            .ok_or_else(|| self.ctx.unresolved_connection(object, &settings.field))?;
        let linked = self.snapshot.require_object(&join.linked_object)?;
        let target = linked
            .field(&settings.target_field)
            .ok_or_else(|| QueryError::field_not_found(&linked.name, &settings.target_field))?;

        let inner = self.nested(linked, "__f");
        let (from, correlation) = relation::correlated(join, table, inner.table_ref());
        let column = quote_qualified(inner.table_ref(), &target.column_name);
        let aggregate = match settings.aggregate {
            Aggregate::Sum | Aggregate::Count => {
                format!("COALESCE({}({}), 0)", settings.aggregate.as_sql(), column)
            }
            other => format!("{}({})", other.as_sql(), column),
        };
        let reduced = self.formula_filters.and_then(|f| f.get(&field.id));
        let filter = match reduced.or(settings.filter.as_ref()) {
            Some(filter) => inner
                .build_condition_clause(filter)?
                .map(|f| format!(" AND {}", f))
                .unwrap_or_default(),
            None => String::new(),
        };
        Ok(format!(
            "(SELECT {} FROM {} WHERE {}{})",
            aggregate, from, correlation, filter
        ))
    }
}

/// `"1"` rules: equals 1 is always true, equals 0 always false
fn constant(rule: &Rule) -> Result<String> {
    let truth = truthy(Some(&rule.value));
    let truth = match rule.rule {
        RuleOp::Equals => truth,
        RuleOp::NotEqual => !truth,
        other => {
            return Err(QueryError::invalid_condition(format!(
                "Operator '{}' cannot be used with constant key",
                other
            )));
        }
    };
    Ok(if truth {
        fragment::ALWAYS_TRUE
    } else {
        fragment::ALWAYS_FALSE
    }
    .to_string())
}

/// Substitute `{Column}` references of a calculate formula
fn calculate_expression(object: &ObjectDefinition, table: &str, formula: &str) -> Result<String> {
    let mut expr = String::with_capacity(formula.len());
    let mut rest = String::new();
    let mut last = 0;
    for cap in CALCULATE_PLACEHOLDER.captures_iter(formula) {
        let Some(whole) = cap.get(0) else { continue };
        let name = cap[1].trim();
        let field = object
            .fields
            .iter()
            .find(|f| !f.is_virtual() && (f.column_name == name || f.label == name || f.id == name))
            .ok_or_else(|| {
                QueryError::configuration(format!(
                    "Calculate formula on '{}' references unknown field '{}'",
                    object.name, name
                ))
            })?;
        let between = &formula[last..whole.start()];
        rest.push_str(between);
        expr.push_str(between);
        expr.push_str(&quote_qualified(table, &field.column_name));
        last = whole.end();
    }
    rest.push_str(&formula[last..]);
    expr.push_str(&formula[last..]);

    if !ARITHMETIC.is_match(&rest) {
        return Err(QueryError::configuration(format!(
            "Calculate formula '{}' on '{}' is not plain arithmetic",
            formula, object.name
        )));
    }
    Ok(format!("({})", expr))
}

/// Map list labels to option ids and booleans to 1/0
fn normalize_value(field: &FieldDefinition, value: &serde_json::Value) -> serde_json::Value {
    match &field.field_type {
        FieldType::List { options, .. } => {
            let map = |v: &serde_json::Value| match v {
                serde_json::Value::String(s) => option_id(options, s)
                    .map(|id| serde_json::Value::String(id.to_string()))
                    .unwrap_or_else(|| v.clone()),
                other => other.clone(),
            };
            match value {
                serde_json::Value::Array(items) => {
                    serde_json::Value::Array(items.iter().map(map).collect())
                }
                single => map(single),
            }
        }
        FieldType::Boolean if !value.is_null() => {
            serde_json::Value::from(i64::from(truthy(Some(value))))
        }
        _ => value.clone(),
    }
}

/// The rule's value as a list
fn values_of(value: &serde_json::Value) -> Vec<serde_json::Value> {
    match value {
        serde_json::Value::Array(items) => items.clone(),
        serde_json::Value::Null => Vec::new(),
        single => vec![single.clone()],
    }
}

/// Keys of linked records named by a rule value (keys or record objects)
pub(crate) fn connection_keys(value: &serde_json::Value, key_column: &str) -> Vec<serde_json::Value> {
    values_of(value)
        .into_iter()
        .filter_map(|v| match v {
            serde_json::Value::Object(record) => record
                .get(key_column)
                .or_else(|| record.get("uuid"))
                .or_else(|| record.get("id"))
                .cloned(),
            serde_json::Value::Null => None,
            other => Some(other),
        })
        .collect()
}

/// Inner filter carried by a `have_relation` rule, if any
fn relation_filter(value: &serde_json::Value) -> Result<Option<Condition>> {
    match value {
        serde_json::Value::Object(map) if map.contains_key("rules") || map.contains_key("key") => {
            Ok(Some(serde_json::from_value(value.clone())?))
        }
        _ => Ok(None),
    }
}

fn pattern_of(op: RuleOp) -> Option<Pattern> {
    match op {
        RuleOp::Contains | RuleOp::NotContains => Some(Pattern::Contains),
        RuleOp::BeginsWith | RuleOp::NotBeginsWith => Some(Pattern::BeginsWith),
        RuleOp::EndsWith | RuleOp::NotEndsWith => Some(Pattern::EndsWith),
        _ => None,
    }
}

fn operator_of(op: RuleOp) -> Option<Operator> {
    match op {
        RuleOp::Equals => Some(Operator::Eq),
        RuleOp::NotEqual => Some(Operator::Ne),
        RuleOp::Less => Some(Operator::Lt),
        RuleOp::Greater => Some(Operator::Gt),
        RuleOp::LessOrEqual => Some(Operator::Le),
        RuleOp::GreaterOrEqual => Some(Operator::Ge),
        _ => None,
    }
}

/// Compile an operator over a single-valued expression
///
/// With `by_day` both sides of comparisons are reduced to their date.
fn compile_scalar(
    op: RuleOp,
    expr: &str,
    value: &serde_json::Value,
    by_day: bool,
) -> Result<Option<String>> {
    let lhs = if by_day {
        fragment::date(expr)
    } else {
        expr.to_string()
    };
    let rhs = |v: &serde_json::Value| {
        if by_day {
            fragment::date(&literal(v))
        } else {
            literal(v)
        }
    };

    if let Some(operator) = operator_of(op) {
        return Ok(match (operator, value) {
            (Operator::Eq | Operator::Ne, serde_json::Value::Null) => {
                Some(fragment::compare(expr, operator, value))
            }
            (_, serde_json::Value::Null) => None,
            (_, serde_json::Value::Array(items)) if matches!(operator, Operator::Eq | Operator::Ne) => {
                let items: Vec<String> = items.iter().map(rhs).collect();
                Some(fragment::in_raw(&lhs, &items, operator == Operator::Ne))
            }
            _ => Some(fragment::compare_raw(&lhs, operator, &rhs(value))),
        });
    }

    if let Some(pattern) = pattern_of(op) {
        if value.is_null() || value_text(value).is_empty() {
            return Ok(None);
        }
        return Ok(Some(fragment::like(expr, pattern, value, op.is_negative())));
    }

    match op {
        RuleOp::Between | RuleOp::NotBetween => {
            let bounds = values_of(value);
            match bounds.as_slice() {
                [low, high] => Ok(Some(fragment::between(
                    &lhs,
                    &rhs(low),
                    &rhs(high),
                    op == RuleOp::NotBetween,
                ))),
                _ => Err(QueryError::invalid_condition(format!(
                    "'{}' needs two bounds, got {}",
                    op, value
                ))),
            }
        }
        RuleOp::IsEmpty | RuleOp::IsNotEmpty => {
            Ok(Some(fragment::is_empty(expr, op == RuleOp::IsNotEmpty)))
        }
        RuleOp::IsNull | RuleOp::IsNotNull => {
            Ok(Some(fragment::is_null(expr, op == RuleOp::IsNotNull)))
        }
        RuleOp::In | RuleOp::NotIn => {
            let items: Vec<String> = values_of(value).iter().map(rhs).collect();
            Ok(Some(fragment::in_raw(&lhs, &items, op == RuleOp::NotIn)))
        }
        RuleOp::IsCurrentDate => Ok(Some(fragment::compare_raw(
            &fragment::date(expr),
            Operator::Eq,
            "CURDATE()",
        ))),
        other => Err(QueryError::invalid_condition(format!(
            "Operator '{}' is only valid on connection fields",
            other
        ))),
    }
}

/// Compile an operator over a column holding a JSON array of members
fn compile_multi(op: RuleOp, expr: &str, value: &serde_json::Value) -> Result<Option<String>> {
    let members: Vec<String> = values_of(value).iter().map(value_text).collect();
    match op {
        RuleOp::Equals | RuleOp::Contains | RuleOp::In => {
            let parts = members
                .iter()
                .map(|m| fragment::json_member(expr, m, false))
                .collect();
            Ok(Some(
                fragment::glue(parts, crate::condition::Glue::Or)
                    .unwrap_or_else(|| fragment::ALWAYS_FALSE.to_string()),
            ))
        }
        RuleOp::NotEqual | RuleOp::NotContains | RuleOp::NotIn => {
            let parts = members
                .iter()
                .map(|m| fragment::json_member(expr, m, true))
                .collect();
            Ok(fragment::glue(parts, crate::condition::Glue::And))
        }
        RuleOp::IsEmpty => Ok(Some(format!(
            "({} OR {} = '[]')",
            fragment::is_empty(expr, false),
            expr
        ))),
        RuleOp::IsNotEmpty => Ok(Some(format!(
            "({} AND {} <> '[]')",
            fragment::is_empty(expr, true),
            expr
        ))),
        other => compile_scalar(other, expr, value, false),
    }
}
