//! Core type definitions for metadata-defined fields
//!
//! Includes field types, connection settings, field definitions and index definitions.

use serde::{Deserialize, Serialize};

use crate::condition::Condition;

// ============================================================================
// Field Types
// ============================================================================

/// How many records one side of a connection links to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LinkType {
    One,
    Many,
}

/// Settings of a connection field
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectSettings {
    /// Id of the linked object
    #[serde(rename = "linkObject")]
    pub linked_object: String,
    /// Id of the reverse connection field on the linked object
    #[serde(rename = "linkColumn", default, skip_serializing_if = "Option::is_none")]
    pub linked_field: Option<String>,
    /// How many linked records one record of this object points at
    #[serde(rename = "linkType")]
    pub link_type: LinkType,
    /// How many records of this object one linked record points back at
    #[serde(rename = "linkViaType")]
    pub link_via_type: LinkType,
    /// In a one:one link, whether this side owns the foreign key
    #[serde(rename = "isSource", default)]
    pub is_source: bool,
    /// Field whose column replaces a primary key as join key (on either side)
    #[serde(rename = "indexField", default, skip_serializing_if = "Option::is_none")]
    pub index_field: Option<String>,
    /// Second join-key override, used when both sides are overridden
    #[serde(rename = "indexField2", default, skip_serializing_if = "Option::is_none")]
    pub index_field2: Option<String>,
}

impl ConnectSettings {
    pub fn new(linked_object: impl Into<String>, link_type: LinkType, link_via_type: LinkType) -> Self {
        Self {
            linked_object: linked_object.into(),
            linked_field: None,
            link_type,
            link_via_type,
            is_source: false,
            index_field: None,
            index_field2: None,
        }
    }

    /// Set the reverse field on the linked object
    pub fn via(mut self, linked_field: impl Into<String>) -> Self {
        self.linked_field = Some(linked_field.into());
        self
    }

    /// Mark this side as the foreign key owner
    pub fn source(mut self) -> Self {
        self.is_source = true;
        self
    }

    /// Override a join key with the given field
    pub fn index(mut self, field_id: impl Into<String>) -> Self {
        if self.index_field.is_none() {
            self.index_field = Some(field_id.into());
        } else {
            self.index_field2 = Some(field_id.into());
        }
        self
    }
}

/// An option of a list field
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListOption {
    pub id: String,
    pub text: String,
}

impl ListOption {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
        }
    }
}

/// Aggregate computed by a formula field
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Aggregate {
    Sum,
    Average,
    Max,
    Min,
    Count,
}

impl Aggregate {
    pub fn as_sql(self) -> &'static str {
        match self {
            Aggregate::Sum => "SUM",
            Aggregate::Average => "AVG",
            Aggregate::Max => "MAX",
            Aggregate::Min => "MIN",
            Aggregate::Count => "COUNT",
        }
    }
}

/// Settings of a formula field: an aggregate over a connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FormulaSettings {
    /// Connection field (on this object) the aggregate runs across
    pub field: String,
    /// Field on the linked object being aggregated
    #[serde(rename = "fieldLink")]
    pub target_field: String,
    pub aggregate: Aggregate,
    /// Extra filter applied to the linked rows
    #[serde(rename = "where", default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Condition>,
}

/// Field type with validation rules
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FieldType {
    /// Short text
    String,
    /// Long text
    LongText,
    /// Numeric value
    Number,
    /// Calendar date, compared by day
    Date,
    /// Date and time
    DateTime,
    Boolean,
    /// Selection from fixed options; multiple selections are stored as a JSON array of ids
    List {
        options: Vec<ListOption>,
        #[serde(rename = "isMultiple", default)]
        is_multiple: bool,
    },
    /// Username(s); multiple users are stored as a JSON array
    User {
        #[serde(rename = "isMultiple", default)]
        is_multiple: bool,
    },
    /// Aggregate over linked records, computed at read time
    Formula(FormulaSettings),
    /// Arithmetic over columns of the same row, e.g. `{price} * {qty}`
    Calculate { formula: String },
    /// Relation to another object
    #[serde(rename = "connectObject")]
    Connect(ConnectSettings),
    Json,
    Uuid,
    AutoIndex,
}

impl FieldType {
    /// Validate that a JSON value is compatible with this field type
    pub fn validate_value(&self, value: &serde_json::Value) -> Result<(), String> {
        // Null is handled by the required flag, not type validation
        if value.is_null() {
            return Ok(());
        }

        match (self, value) {
            (FieldType::String | FieldType::LongText | FieldType::Uuid, serde_json::Value::String(_)) => Ok(()),
            (FieldType::Number | FieldType::AutoIndex, serde_json::Value::Number(_)) => Ok(()),
            // Allow string-to-number coercion (common with form posts)
            (FieldType::Number, serde_json::Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .map(|_| ())
                .map_err(|_| format!("Cannot convert '{}' to number", s)),
            (FieldType::Boolean, serde_json::Value::Bool(_)) => Ok(()),
            (FieldType::Boolean, serde_json::Value::Number(n)) => match n.as_i64() {
                Some(0 | 1) => Ok(()),
                _ => Err(format!("Cannot convert '{}' to boolean", n)),
            },
            (FieldType::Boolean, serde_json::Value::String(s)) => {
                match s.to_lowercase().as_str() {
                    "true" | "false" | "1" | "0" => Ok(()),
                    _ => Err(format!("Cannot convert '{}' to boolean", s)),
                }
            }
            (FieldType::Date, serde_json::Value::String(s)) => parse_date(s)
                .map(|_| ())
                .ok_or_else(|| format!("Invalid date format: '{}'", s)),
            (FieldType::DateTime, serde_json::Value::String(s)) => parse_datetime(s)
                .map(|_| ())
                .ok_or_else(|| format!("Invalid datetime format: '{}'", s)),
            (FieldType::List { options, is_multiple }, value) => {
                let ids: Vec<&serde_json::Value> = match value {
                    serde_json::Value::Array(items) if *is_multiple => items.iter().collect(),
                    serde_json::Value::Array(_) => {
                        return Err("List field accepts a single option".to_string());
                    }
                    single => vec![single],
                };
                for id in ids {
                    let id = id
                        .as_str()
                        .ok_or_else(|| format!("Option id must be a string, got {}", id))?;
                    if option_id(options, id).is_none() {
                        return Err(format!("Value '{}' is not a list option", id));
                    }
                }
                Ok(())
            }
            (FieldType::User { .. }, serde_json::Value::String(_)) => Ok(()),
            (FieldType::User { is_multiple: true }, serde_json::Value::Array(items)) => {
                if items.iter().all(|i| i.is_string() || i.get("id").is_some()) {
                    Ok(())
                } else {
                    Err("User list must contain usernames".to_string())
                }
            }
            (FieldType::User { .. }, serde_json::Value::Object(o)) if o.contains_key("id") => Ok(()),
            (FieldType::Connect(settings), serde_json::Value::Array(items)) => {
                if settings.link_type == LinkType::One && items.len() > 1 {
                    Err("Connection links a single record".to_string())
                } else {
                    Ok(())
                }
            }
            (FieldType::Connect(_), _) => Ok(()),
            (FieldType::Json, _) => Ok(()),
            (FieldType::Formula(_) | FieldType::Calculate { .. }, _) => {
                Err("Computed fields are read-only".to_string())
            }
            _ => Err(format!("Type mismatch: expected {}, got {}", self.key(), value)),
        }
    }

    /// Type key as stored in metadata
    pub fn key(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::LongText => "longtext",
            FieldType::Number => "number",
            FieldType::Date => "date",
            FieldType::DateTime => "datetime",
            FieldType::Boolean => "boolean",
            FieldType::List { .. } => "list",
            FieldType::User { .. } => "user",
            FieldType::Formula(_) => "formula",
            FieldType::Calculate { .. } => "calculate",
            FieldType::Connect(_) => "connectObject",
            FieldType::Json => "json",
            FieldType::Uuid => "uuid",
            FieldType::AutoIndex => "autoindex",
        }
    }
}

/// Resolve a list value that may be either an option id or an option label
pub fn option_id<'a>(options: &'a [ListOption], value: &str) -> Option<&'a str> {
    options
        .iter()
        .find(|o| o.id == value)
        .or_else(|| options.iter().find(|o| o.text.eq_ignore_ascii_case(value)))
        .map(|o| o.id.as_str())
}

fn parse_date(s: &str) -> Option<chrono::NaiveDate> {
    chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_datetime(s).map(|dt| dt.date()))
}

fn parse_datetime(s: &str) -> Option<chrono::NaiveDateTime> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.naive_utc())
        .ok()
        .or_else(|| chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").ok())
}

// ============================================================================
// Field Definitions
// ============================================================================

/// Field definition of a metadata-defined object
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldDefinition {
    /// Stable field id
    pub id: String,
    /// Column name in the object's table
    #[serde(rename = "columnName")]
    pub column_name: String,
    /// Human-readable label
    #[serde(default)]
    pub label: String,
    #[serde(flatten)]
    pub field_type: FieldType,
    /// Stored per language in the object's translations column
    #[serde(rename = "isMultilingual", default)]
    pub multilingual: bool,
    #[serde(default)]
    pub required: bool,
    /// Value used on create when none is supplied
    #[serde(rename = "default", default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<serde_json::Value>,
}

impl FieldDefinition {
    /// Create a new field definition
    pub fn new(id: impl Into<String>, column_name: impl Into<String>, field_type: FieldType) -> Self {
        let column_name = column_name.into();
        Self {
            id: id.into(),
            label: column_name.clone(),
            column_name,
            field_type,
            multilingual: false,
            required: false,
            default_value: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn multilingual(mut self) -> Self {
        self.multilingual = true;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn default(mut self, value: serde_json::Value) -> Self {
        self.default_value = Some(value);
        self
    }

    /// Connection settings when this is a connection field
    pub fn connect(&self) -> Option<&ConnectSettings> {
        match &self.field_type {
            FieldType::Connect(settings) => Some(settings),
            _ => None,
        }
    }

    pub fn is_connection(&self) -> bool {
        self.connect().is_some()
    }

    pub fn is_user(&self) -> bool {
        matches!(self.field_type, FieldType::User { .. })
    }

    /// Formula and calculate fields have no stored column
    pub fn is_virtual(&self) -> bool {
        matches!(
            self.field_type,
            FieldType::Formula(_) | FieldType::Calculate { .. }
        )
    }

    /// Values stored as a JSON array of members
    pub fn is_multi_valued(&self) -> bool {
        matches!(
            self.field_type,
            FieldType::List { is_multiple: true, .. } | FieldType::User { is_multiple: true }
        )
    }
}

/// Index definition of an object
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexDefinition {
    pub id: String,
    pub name: String,
    /// Field ids included in the index
    pub fields: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

impl IndexDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>, fields: Vec<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            fields,
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn status_list() -> FieldType {
        FieldType::List {
            options: vec![ListOption::new("opt_open", "Open"), ListOption::new("opt_closed", "Closed")],
            is_multiple: false,
        }
    }

    #[test]
    fn test_field_type_serialization() {
        let json = serde_json::to_string(&FieldType::String).unwrap();
        assert_eq!(json, r#"{"type":"string"}"#);

        let json = serde_json::to_string(&FieldType::DateTime).unwrap();
        assert_eq!(json, r#"{"type":"datetime"}"#);
    }

    #[test]
    fn test_connect_field_deserialization() {
        let json = r#"{
            "id": "f1", "columnName": "tags", "type": "connectObject",
            "linkObject": "obj_tag", "linkColumn": "f2",
            "linkType": "many", "linkViaType": "many", "isSource": true
        }"#;
        let field: FieldDefinition = serde_json::from_str(json).unwrap();
        let settings = field.connect().unwrap();
        assert_eq!(settings.linked_object, "obj_tag");
        assert_eq!(settings.linked_field.as_deref(), Some("f2"));
        assert_eq!(settings.link_type, LinkType::Many);
        assert!(settings.is_source);
        assert!(settings.index_field.is_none());
    }

    #[test]
    fn test_formula_field_deserialization() {
        let json = r#"{
            "id": "f9", "columnName": "total", "type": "formula",
            "field": "f_items", "fieldLink": "f_amount", "aggregate": "sum",
            "where": {"glue": "and", "rules": [{"key": "paid", "rule": "equals", "value": 1}]}
        }"#;
        let field: FieldDefinition = serde_json::from_str(json).unwrap();
        assert!(field.is_virtual());
        match &field.field_type {
            FieldType::Formula(settings) => {
                assert_eq!(settings.aggregate, Aggregate::Sum);
                assert_eq!(settings.target_field, "f_amount");
                assert!(settings.filter.is_some());
            }
            _ => panic!("Expected Formula"),
        }
        assert_eq!(Aggregate::Average.as_sql(), "AVG");
    }

    #[test]
    fn test_validate_string_and_number() {
        assert!(FieldType::String.validate_value(&json!("hello")).is_ok());
        assert!(FieldType::String.validate_value(&json!(12)).is_err());
        assert!(FieldType::Number.validate_value(&json!(12.5)).is_ok());
        assert!(FieldType::Number.validate_value(&json!("12.5")).is_ok());
        assert!(FieldType::Number.validate_value(&json!("abc")).is_err());
    }

    #[test]
    fn test_validate_boolean() {
        let t = FieldType::Boolean;
        assert!(t.validate_value(&json!(true)).is_ok());
        assert!(t.validate_value(&json!(1)).is_ok());
        assert!(t.validate_value(&json!("FALSE")).is_ok());
        assert!(t.validate_value(&json!(2)).is_err());
        assert!(t.validate_value(&json!("maybe")).is_err());
    }

    #[test]
    fn test_validate_dates() {
        assert!(FieldType::Date.validate_value(&json!("2024-01-15")).is_ok());
        assert!(FieldType::Date.validate_value(&json!("2024-01-15T10:00:00Z")).is_ok());
        assert!(FieldType::Date.validate_value(&json!("15/01/2024")).is_err());
        assert!(FieldType::DateTime.validate_value(&json!("2024-01-15 10:30:00")).is_ok());
        assert!(FieldType::DateTime.validate_value(&json!("2024-01-15T10:30:00+05:00")).is_ok());
        assert!(FieldType::DateTime.validate_value(&json!("tomorrow")).is_err());
    }

    #[test]
    fn test_validate_list_by_id_or_label() {
        let t = status_list();
        assert!(t.validate_value(&json!("opt_open")).is_ok());
        assert!(t.validate_value(&json!("closed")).is_ok());
        assert!(t.validate_value(&json!("pending")).is_err());
        assert!(t.validate_value(&json!(["opt_open"])).is_err());

        let multi = FieldType::List {
            options: vec![ListOption::new("a", "A"), ListOption::new("b", "B")],
            is_multiple: true,
        };
        assert!(multi.validate_value(&json!(["a", "B"])).is_ok());
        assert!(multi.validate_value(&json!(["a", "c"])).is_err());
    }

    #[test]
    fn test_validate_connect_cardinality() {
        let one = FieldType::Connect(ConnectSettings::new("o", LinkType::One, LinkType::Many));
        assert!(one.validate_value(&json!("k1")).is_ok());
        assert!(one.validate_value(&json!(["k1", "k2"])).is_err());

        let many = FieldType::Connect(ConnectSettings::new("o", LinkType::Many, LinkType::Many));
        assert!(many.validate_value(&json!(["k1", "k2"])).is_ok());
    }

    #[test]
    fn test_validate_computed_fields_are_read_only() {
        let t = FieldType::Calculate {
            formula: "{a} * 2".into(),
        };
        assert!(t.validate_value(&json!(3)).is_err());
        assert!(t.validate_value(&json!(null)).is_ok());
    }

    #[test]
    fn test_option_id_lookup() {
        let options = vec![ListOption::new("opt_open", "Open")];
        assert_eq!(option_id(&options, "opt_open"), Some("opt_open"));
        assert_eq!(option_id(&options, "OPEN"), Some("opt_open"));
        assert_eq!(option_id(&options, "other"), None);
    }

    #[test]
    fn test_field_definition_builders() {
        let field = FieldDefinition::new("f1", "name", FieldType::String)
            .with_label("Name")
            .multilingual()
            .required()
            .default(json!("n/a"));

        assert_eq!(field.label, "Name");
        assert!(field.multilingual);
        assert!(field.required);
        assert_eq!(field.default_value, Some(json!("n/a")));
        assert!(!field.is_connection());
    }

    #[test]
    fn test_connect_settings_index_overrides() {
        let settings = ConnectSettings::new("o", LinkType::One, LinkType::One)
            .source()
            .index("f_code")
            .index("f_ref");
        assert!(settings.is_source);
        assert_eq!(settings.index_field.as_deref(), Some("f_code"));
        assert_eq!(settings.index_field2.as_deref(), Some("f_ref"));
    }

    #[test]
    fn test_index_definition() {
        let idx = IndexDefinition::new("i1", "code_idx", vec!["f_code".into()]).unique();
        assert!(idx.unique);
        assert_eq!(idx.fields.len(), 1);
    }
}
