//! Object, query and data collection definitions
//!
//! These are handed to the engine by the tenant bootstrap and never mutated by it.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::condition::Condition;
use crate::types::{FieldDefinition, IndexDefinition};

static LABEL_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([^{}]+)\}").expect("label placeholder pattern"));

/// Kind of primary key an object's table uses
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PrimaryKey {
    /// UUID string in column `uuid`
    #[default]
    Uuid,
    /// Auto-increment integer in column `id`; not meaningful to clients
    Id,
}

impl PrimaryKey {
    pub fn column(self) -> &'static str {
        match self {
            PrimaryKey::Uuid => "uuid",
            PrimaryKey::Id => "id",
        }
    }
}

/// A metadata-defined logical table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectDefinition {
    /// Stable object id
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Database table holding the records
    #[serde(rename = "tableName")]
    pub table_name: String,
    #[serde(rename = "primaryKey", default)]
    pub primary_key: PrimaryKey,
    /// Table lives outside the platform-managed schema
    #[serde(rename = "isExternal", default)]
    pub is_external: bool,
    /// Table was imported from an existing database
    #[serde(rename = "isImported", default)]
    pub is_imported: bool,
    /// Named connection for external objects
    #[serde(rename = "connName", default, skip_serializing_if = "Option::is_none")]
    pub connection_name: Option<String>,
    pub fields: Vec<FieldDefinition>,
    #[serde(default)]
    pub indexes: Vec<IndexDefinition>,
    /// Display template, e.g. `"{Name} ({Code})"`
    #[serde(rename = "labelFormat", default, skip_serializing_if = "Option::is_none")]
    pub label_format: Option<String>,
}

impl ObjectDefinition {
    /// Create a new object definition with a UUID primary key
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        table_name: impl Into<String>,
        fields: Vec<FieldDefinition>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            table_name: table_name.into(),
            primary_key: PrimaryKey::Uuid,
            is_external: false,
            is_imported: false,
            connection_name: None,
            fields,
            indexes: Vec::new(),
            label_format: None,
        }
    }

    pub fn with_primary_key(mut self, primary_key: PrimaryKey) -> Self {
        self.primary_key = primary_key;
        self
    }

    pub fn with_indexes(mut self, indexes: Vec<IndexDefinition>) -> Self {
        self.indexes = indexes;
        self
    }

    pub fn with_label_format(mut self, format: impl Into<String>) -> Self {
        self.label_format = Some(format.into());
        self
    }

    /// Primary key column name
    pub fn primary_column(&self) -> &'static str {
        self.primary_key.column()
    }

    /// Look up a field by id, then by column name
    pub fn field(&self, key: &str) -> Option<&FieldDefinition> {
        self.field_by_id(key)
            .or_else(|| self.fields.iter().find(|f| f.column_name == key))
    }

    pub fn field_by_id(&self, id: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.id == id)
    }

    pub fn connection_fields(&self) -> impl Iterator<Item = &FieldDefinition> {
        self.fields.iter().filter(|f| f.is_connection())
    }

    pub fn user_fields(&self) -> impl Iterator<Item = &FieldDefinition> {
        self.fields.iter().filter(|f| f.is_user())
    }

    /// Whether any field stores its value in the translations column
    pub fn has_multilingual(&self) -> bool {
        self.fields.iter().any(|f| f.multilingual)
    }

    /// Whether the field is covered by a single-field unique index
    pub fn is_unique_key(&self, field_id: &str) -> bool {
        self.indexes
            .iter()
            .any(|i| i.unique && i.fields.len() == 1 && i.fields[0] == field_id)
    }

    /// Fields referenced by the label format, matched by label or column
    pub fn label_fields(&self) -> Vec<&FieldDefinition> {
        let Some(format) = &self.label_format else {
            return Vec::new();
        };
        LABEL_PLACEHOLDER
            .captures_iter(format)
            .filter_map(|cap| {
                let name = cap[1].trim();
                self.fields
                    .iter()
                    .find(|f| f.label == name || f.column_name == name || f.id == name)
            })
            .collect()
    }
}

/// A stored view over one object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryDefinition {
    pub id: String,
    pub name: String,
    /// Base object the query selects from
    #[serde(rename = "objectId")]
    pub object_id: String,
    #[serde(rename = "where", default)]
    pub condition: Condition,
    /// Connection fields joined so rules can filter by alias
    #[serde(default)]
    pub joins: Vec<String>,
}

impl QueryDefinition {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        object_id: impl Into<String>,
        condition: Condition,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            object_id: object_id.into(),
            condition,
            joins: Vec::new(),
        }
    }
}

/// Where a data collection reads from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum DataSource {
    Object(String),
    Query(String),
}

/// A stored, filtered datasource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataCollectionDefinition {
    pub id: String,
    pub name: String,
    pub datasource: DataSource,
    #[serde(default)]
    pub filter: Condition,
}

impl DataCollectionDefinition {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        datasource: DataSource,
        filter: Condition,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            datasource,
            filter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldType;

    fn invoice() -> ObjectDefinition {
        ObjectDefinition::new(
            "obj_invoice",
            "Invoice",
            "AB_Invoice",
            vec![
                FieldDefinition::new("f_number", "number", FieldType::String).with_label("Number"),
                FieldDefinition::new("f_customer", "customer", FieldType::String).with_label("Customer"),
                FieldDefinition::new("f_owner", "owner", FieldType::User { is_multiple: false }),
            ],
        )
        .with_label_format("{Number} - {customer}")
        .with_indexes(vec![
            IndexDefinition::new("i1", "number_idx", vec!["f_number".into()]).unique(),
        ])
    }

    #[test]
    fn test_field_lookup_by_id_and_column() {
        let obj = invoice();
        assert_eq!(obj.field("f_number").unwrap().column_name, "number");
        assert_eq!(obj.field("customer").unwrap().id, "f_customer");
        assert!(obj.field("missing").is_none());
    }

    #[test]
    fn test_primary_column() {
        let obj = invoice();
        assert_eq!(obj.primary_column(), "uuid");
        let obj = obj.with_primary_key(PrimaryKey::Id);
        assert_eq!(obj.primary_column(), "id");
    }

    #[test]
    fn test_label_fields() {
        let obj = invoice();
        let labels: Vec<&str> = obj.label_fields().iter().map(|f| f.id.as_str()).collect();
        assert_eq!(labels, vec!["f_number", "f_customer"]);
    }

    #[test]
    fn test_unique_key() {
        let obj = invoice();
        assert!(obj.is_unique_key("f_number"));
        assert!(!obj.is_unique_key("f_customer"));
    }

    #[test]
    fn test_user_fields() {
        assert_eq!(invoice().user_fields().count(), 1);
    }

    #[test]
    fn test_object_deserialization_defaults() {
        let json = r#"{
            "id": "o1", "name": "Tag", "tableName": "AB_Tag",
            "fields": [{"id": "f1", "columnName": "name", "type": "string"}]
        }"#;
        let obj: ObjectDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(obj.primary_key, PrimaryKey::Uuid);
        assert!(!obj.is_external);
        assert!(obj.indexes.is_empty());
    }

    #[test]
    fn test_data_source_serialization() {
        let json = serde_json::to_string(&DataSource::Query("q1".into())).unwrap();
        assert_eq!(json, r#"{"type":"query","id":"q1"}"#);
    }
}
