//! SQL Identifier and Literal Sanitization Utilities
//!
//! Every identifier and value that ends up in emitted SQL goes through this module.

use regex::Regex;
use std::sync::LazyLock;

static IDENTIFIER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern"));

static FUNCTION_CALL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*\(\s*\)$").expect("function call pattern")
});

/// Quote an identifier for MySQL
///
/// Wraps the identifier in backticks and escapes internal backticks by doubling them.
///
/// # Example
/// ```
/// use runtara_object_query::sql::quote_identifier;
///
/// assert_eq!(quote_identifier("my_table"), "`my_table`");
/// ```
pub fn quote_identifier(identifier: &str) -> String {
    let escaped = identifier.replace('`', "``");
    format!("`{}`", escaped)
}

/// Quote a `table.column` pair
pub fn quote_qualified(table: &str, column: &str) -> String {
    format!("{}.{}", quote_identifier(table), quote_identifier(column))
}

/// Quote a string literal, doubling quote characters and backslashes
pub fn quote_literal(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('\'', "''");
    format!("'{}'", escaped)
}

/// Whether a value is a bare function call such as `NOW()` that is passed through verbatim
pub fn is_function_call(value: &str) -> bool {
    FUNCTION_CALL_PATTERN.is_match(value.trim())
}

/// Render a JSON value as a SQL literal
///
/// Strings are escaped unless they are a bare function call, booleans become `1`/`0`,
/// and arrays or objects are stored as their JSON text.
pub fn literal(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => "NULL".to_string(),
        serde_json::Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) if is_function_call(s) => s.trim().to_string(),
        serde_json::Value::String(s) => quote_literal(s),
        other => quote_literal(&other.to_string()),
    }
}

/// Render a JSON value as text, without quoting
pub fn value_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Truncate an identifier to at most `max_len` characters on a char boundary
pub fn truncate_identifier(identifier: &str, max_len: usize) -> String {
    identifier.chars().take(max_len).collect()
}

/// Validate a table or column name coming from metadata
///
/// Rules:
/// - Must not be empty
/// - Must start with a letter or underscore and contain only letters, digits and underscores
/// - Must fit within the dialect identifier length limit
///
/// # Example
/// ```
/// use runtara_object_query::sql::validate_identifier;
///
/// assert!(validate_identifier("AB_Invoice", 64).is_ok());
/// assert!(validate_identifier("bad-name", 64).is_err());
/// ```
pub fn validate_identifier(name: &str, max_len: usize) -> Result<(), String> {
    if name.is_empty() {
        return Err("Identifier cannot be empty".to_string());
    }

    if !IDENTIFIER_PATTERN.is_match(name) {
        return Err(format!(
            "Identifier '{}' is invalid. Must start with a letter or underscore and contain only letters, numbers, and underscores.",
            name
        ));
    }

    if name.chars().count() > max_len {
        return Err(format!(
            "Identifier '{}' exceeds the {} character limit",
            name, max_len
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_quote_identifier_simple() {
        assert_eq!(quote_identifier("my_table"), "`my_table`");
        assert_eq!(quote_identifier("AB_Invoice"), "`AB_Invoice`");
    }

    #[test]
    fn test_quote_identifier_with_backticks() {
        assert_eq!(quote_identifier("bad`name"), "`bad``name`");
        assert_eq!(quote_identifier("`x`"), "```x```");
    }

    #[test]
    fn test_quote_qualified() {
        assert_eq!(quote_qualified("AB_Invoice", "uuid"), "`AB_Invoice`.`uuid`");
    }

    #[test]
    fn test_quote_literal_doubles_quotes() {
        assert_eq!(quote_literal("it's"), "'it''s'");
        assert_eq!(quote_literal("a\\'; DROP"), "'a\\\\''; DROP'");
    }

    #[test]
    fn test_function_call_passthrough() {
        assert!(is_function_call("NOW()"));
        assert!(is_function_call("CURRENT_DATE( )"));
        assert!(!is_function_call("NOW(); DROP TABLE x"));
        assert!(!is_function_call("SLEEP(10)"));
        assert_eq!(literal(&json!("NOW()")), "NOW()");
    }

    #[test]
    fn test_literal_rendering() {
        assert_eq!(literal(&json!(null)), "NULL");
        assert_eq!(literal(&json!(true)), "1");
        assert_eq!(literal(&json!(false)), "0");
        assert_eq!(literal(&json!(12.5)), "12.5");
        assert_eq!(literal(&json!("O'Neil")), "'O''Neil'");
        assert_eq!(literal(&json!(["a"])), "'[\"a\"]'");
    }

    #[test]
    fn test_truncate_identifier_char_boundary() {
        assert_eq!(truncate_identifier("abcdef", 3), "abc");
        assert_eq!(truncate_identifier("ab", 10), "ab");
        assert_eq!(truncate_identifier("日本語テーブル", 3), "日本語");
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("products", 64).is_ok());
        assert!(validate_identifier("_hidden", 64).is_ok());
        assert!(validate_identifier("", 64).unwrap_err().contains("cannot be empty"));
        assert!(validate_identifier("1products", 64).is_err());
        assert!(validate_identifier("my table", 64).is_err());
        assert!(validate_identifier("my`table", 64).is_err());
        assert!(
            validate_identifier(&"a".repeat(65), 64)
                .unwrap_err()
                .contains("64 character limit")
        );
    }
}
