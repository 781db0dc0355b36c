//! Record-level request and result types
//!
//! Includes the find options accepted by the executor (in expanded or flat
//! shorthand form) and the outcome of a save.

use serde::{Deserialize, Serialize};

use crate::condition::{Condition, ConditionGroup, Glue, Rule, RuleOp};
use crate::error::{FieldError, QueryError, Result};

/// A plain record keyed by column name
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Sort direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_sql(self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

/// One ORDER BY entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortSpec {
    /// Field id or column name
    pub key: String,
    #[serde(default, alias = "dir")]
    pub direction: SortDirection,
    /// Custom option order for list fields
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub order: Vec<String>,
}

impl SortSpec {
    pub fn new(key: impl Into<String>, direction: SortDirection) -> Self {
        Self {
            key: key.into(),
            direction,
            order: Vec::new(),
        }
    }

    /// Sort a list field by the given option order
    pub fn with_order(mut self, order: Vec<String>) -> Self {
        self.order = order;
        self
    }
}

/// Which connection fields are populated on the result rows
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Populate {
    #[default]
    None,
    All,
    /// Field ids or column names
    Fields(Vec<String>),
}

impl Populate {
    fn from_json(value: &serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::Null | serde_json::Value::Bool(false) => Ok(Populate::None),
            serde_json::Value::Bool(true) => Ok(Populate::All),
            serde_json::Value::Array(items) => items
                .iter()
                .map(|i| {
                    i.as_str().map(str::to_string).ok_or_else(|| {
                        QueryError::invalid_input(format!("populate entries must be strings, got {}", i))
                    })
                })
                .collect::<Result<Vec<_>>>()
                .map(Populate::Fields),
            other => Err(QueryError::invalid_input(format!(
                "populate must be a boolean or a list of fields, got {}",
                other
            ))),
        }
    }

    /// Whether the given field (by id or column) is populated
    pub fn includes(&self, field_id: &str, column: &str) -> bool {
        match self {
            Populate::None => false,
            Populate::All => true,
            Populate::Fields(fields) => fields.iter().any(|f| f == field_id || f == column),
        }
    }
}

/// LEFT JOIN of a connection target under an alias
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    /// Connection field on the base object
    pub field: String,
    /// Alias rules refer to through `Rule::alias`
    pub alias: String,
}

/// Options for a find request
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub condition: Condition,
    pub sort: Vec<SortSpec>,
    pub offset: Option<i64>,
    pub limit: Option<i64>,
    pub populate: Populate,
    /// Trim populated sub-records to key and label fields
    pub minimal: bool,
    pub joins: Vec<JoinRequest>,
}

const EXPANDED_KEYS: [&str; 7] = ["where", "sort", "offset", "limit", "populate", "minimal", "joins"];

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse caller input in expanded or flat shorthand form
    ///
    /// A map carrying any of `where`, `sort`, `offset`, `limit`, `populate`,
    /// `minimal` or `joins` is read as expanded options. Any other map is a flat
    /// `{column: value}` filter: scalars become `equals` and arrays become `in`.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let map = match value {
            serde_json::Value::Null => return Ok(Self::default()),
            serde_json::Value::Object(map) => map,
            other => {
                return Err(QueryError::invalid_input(format!(
                    "Find options must be a JSON object, got {}",
                    other
                )));
            }
        };

        if !map.keys().any(|k| EXPANDED_KEYS.contains(&k.as_str())) {
            return Ok(Self::new().with_condition(shorthand_condition(map)));
        }

        let mut options = Self::new();
        if let Some(condition) = map.get("where") {
            options.condition = serde_json::from_value(condition.clone())?;
        }
        if let Some(sort) = map.get("sort") {
            options.sort = serde_json::from_value(sort.clone())?;
        }
        options.offset = read_count(map, "offset")?;
        options.limit = read_count(map, "limit")?;
        if let Some(populate) = map.get("populate") {
            options.populate = Populate::from_json(populate)?;
        }
        options.minimal = map
            .get("minimal")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        if let Some(joins) = map.get("joins") {
            options.joins = serde_json::from_value(joins.clone())?;
        }
        Ok(options)
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = condition;
        self
    }

    pub fn sort_by(mut self, sort: SortSpec) -> Self {
        self.sort.push(sort);
        self
    }

    /// Page of results; a negative limit keeps the default limit
    pub fn paginate(mut self, offset: i64, limit: i64) -> Self {
        self.offset = Some(offset.max(0));
        self.limit = (limit >= 0).then_some(limit);
        self
    }

    pub fn populate(mut self, populate: Populate) -> Self {
        self.populate = populate;
        self
    }

    pub fn minimal(mut self) -> Self {
        self.minimal = true;
        self
    }

    pub fn join(mut self, field: impl Into<String>, alias: impl Into<String>) -> Self {
        self.joins.push(JoinRequest {
            field: field.into(),
            alias: alias.into(),
        });
        self
    }
}

fn read_count(map: &serde_json::Map<String, serde_json::Value>, key: &str) -> Result<Option<i64>> {
    match map.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(value) => value
            .as_i64()
            .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
            .filter(|n| *n >= 0)
            .map(Some)
            .ok_or_else(|| QueryError::invalid_input(format!("{} must be a non-negative integer", key))),
    }
}

fn shorthand_condition(map: &serde_json::Map<String, serde_json::Value>) -> Condition {
    let rules = map
        .iter()
        .map(|(key, value)| {
            let op = if value.is_array() { RuleOp::In } else { RuleOp::Equals };
            Condition::Rule(Rule::new(key.clone(), op, value.clone()))
        })
        .collect();
    Condition::Group(ConditionGroup {
        glue: Glue::And,
        rules,
    })
}

/// Result of a create or update
#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    /// The record as read back after the write
    Saved(Record),
    /// Validation failed; nothing was written
    Invalid(Vec<FieldError>),
}

impl SaveOutcome {
    pub fn record(&self) -> Option<&Record> {
        match self {
            SaveOutcome::Saved(record) => Some(record),
            SaveOutcome::Invalid(_) => None,
        }
    }

    pub fn errors(&self) -> &[FieldError] {
        match self {
            SaveOutcome::Saved(_) => &[],
            SaveOutcome::Invalid(errors) => errors,
        }
    }
}
