//! Typed SQL fragment builder
//!
//! Operators map to fragment constructors here; the rule compiler never formats
//! comparison SQL on its own. Dialect-specific functions (`JSON_EXTRACT`,
//! `FIND_IN_SET`) are exposed as raw-expression helpers.

use crate::condition::Glue;
use crate::sql::sanitize::{literal, quote_literal, value_text};

/// Predicate that is always satisfied
pub const ALWAYS_TRUE: &str = "1 = 1";

/// Predicate that is never satisfied
pub const ALWAYS_FALSE: &str = "1 = 0";

/// Binary comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl Operator {
    pub fn as_sql(self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "<>",
            Operator::Lt => "<",
            Operator::Gt => ">",
            Operator::Le => "<=",
            Operator::Ge => ">=",
        }
    }
}

/// Where the wildcard goes in a `LIKE` pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    Contains,
    BeginsWith,
    EndsWith,
}

/// `expr <op> literal`
pub fn compare(expr: &str, op: Operator, value: &serde_json::Value) -> String {
    if value.is_null() {
        return match op {
            Operator::Ne => format!("{} IS NOT NULL", expr),
            _ => format!("{} IS NULL", expr),
        };
    }
    format!("{} {} {}", expr, op.as_sql(), literal(value))
}

/// `expr <op> raw` where the right side is already valid SQL
pub fn compare_raw(expr: &str, op: Operator, raw: &str) -> String {
    format!("{} {} {}", expr, op.as_sql(), raw)
}

/// `expr [NOT] LIKE '%v%'`
pub fn like(expr: &str, pattern: Pattern, value: &serde_json::Value, negated: bool) -> String {
    let text = value_text(value);
    let pattern = match pattern {
        Pattern::Contains => format!("%{}%", text),
        Pattern::BeginsWith => format!("{}%", text),
        Pattern::EndsWith => format!("%{}", text),
    };
    let not = if negated { "NOT " } else { "" };
    format!("{} {}LIKE {}", expr, not, quote_literal(&pattern))
}

/// Membership test for values stored as a JSON array of strings
pub fn json_member(expr: &str, member: &str, negated: bool) -> String {
    let pattern = format!("%\"{}\"%", member);
    if negated {
        format!(
            "({} IS NULL OR {} NOT LIKE {})",
            expr,
            expr,
            quote_literal(&pattern)
        )
    } else {
        format!("{} LIKE {}", expr, quote_literal(&pattern))
    }
}

/// `expr [NOT] BETWEEN a AND b`
pub fn between(expr: &str, low: &str, high: &str, negated: bool) -> String {
    let not = if negated { "NOT " } else { "" };
    format!("{} {}BETWEEN {} AND {}", expr, not, low, high)
}

/// `expr [NOT] IN (...)`
///
/// An empty `IN` can never match and an empty `NOT IN` always matches.
pub fn in_list(expr: &str, values: &[serde_json::Value], negated: bool) -> String {
    let items: Vec<String> = values.iter().map(literal).collect();
    in_raw(expr, &items, negated)
}

/// `expr [NOT] IN (...)` over items that are already valid SQL
pub fn in_raw(expr: &str, items: &[String], negated: bool) -> String {
    if items.is_empty() {
        return if negated { ALWAYS_TRUE } else { ALWAYS_FALSE }.to_string();
    }
    let not = if negated { "NOT " } else { "" };
    format!("{} {}IN ({})", expr, not, items.join(", "))
}

/// `expr [NOT] IN (subquery)`
pub fn in_subquery(expr: &str, subquery: &str, negated: bool) -> String {
    let not = if negated { "NOT " } else { "" };
    format!("{} {}IN ({})", expr, not, subquery)
}

/// Empty means NULL or the empty string
pub fn is_empty(expr: &str, negated: bool) -> String {
    let not = if negated { "NOT " } else { "" };
    format!("NULLIF({}, '') IS {}NULL", expr, not)
}

pub fn is_null(expr: &str, negated: bool) -> String {
    let not = if negated { "NOT " } else { "" };
    format!("{} IS {}NULL", expr, not)
}

/// `[NOT] EXISTS (subquery)`
pub fn exists(subquery: &str, negated: bool) -> String {
    let not = if negated { "NOT " } else { "" };
    format!("{}EXISTS ({})", not, subquery)
}

/// Wrap an expression in `DATE(...)`
pub fn date(expr: &str) -> String {
    format!("DATE({})", expr)
}

/// Extract `column` for `language` from a translations JSON array
///
/// The array element whose `language_code` matches is located with `JSON_SEARCH`
/// and the column is read from that element.
pub fn multilingual(translations: &str, language: &str, column: &str) -> String {
    format!(
        "JSON_UNQUOTE(JSON_EXTRACT({tr}, CONCAT(SUBSTRING_INDEX(JSON_UNQUOTE(JSON_SEARCH({tr}, 'one', {lang})), '.', 1), {path})))",
        tr = translations,
        lang = quote_literal(language),
        path = quote_literal(&format!(".\"{}\"", column.replace('"', ""))),
    )
}

/// `FIND_IN_SET(expr, 'a,b,c')` for custom list ordering
pub fn find_in_set(expr: &str, ids: &[String]) -> String {
    let set: Vec<&str> = ids.iter().map(|id| id.as_str()).collect();
    format!("FIND_IN_SET({}, {})", expr, quote_literal(&set.join(",")))
}

/// Join compiled parts with a group's glue
///
/// No parts yields `None`; one part is returned as is; several parts are
/// parenthesised.
pub fn glue(parts: Vec<String>, glue: Glue) -> Option<String> {
    match parts.len() {
        0 => None,
        1 => parts.into_iter().next(),
        _ => Some(format!("({})", parts.join(glue.as_sql()))),
    }
}
