//! Condition tree: rules, groups and the rule vocabulary
//!
//! The tree arrives as JSON from callers and stored definitions:
//!
//! ```json
//! { "glue": "and", "rules": [
//!     { "key": "status", "rule": "equals", "value": "open" },
//!     { "glue": "or", "rules": [ ... ] }
//! ] }
//! ```

use serde::{Deserialize, Serialize};

/// Key that compiles to a constant (`1 = 1` / `1 = 0`)
pub const CONSTANT_KEY: &str = "1";

/// Key that refers to the primary key of the object being queried
pub const THIS_OBJECT_KEY: &str = "this_object";

/// How the members of a group combine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Glue {
    #[default]
    And,
    Or,
}

impl Glue {
    pub fn as_sql(self) -> &'static str {
        match self {
            Glue::And => " AND ",
            Glue::Or => " OR ",
        }
    }
}

/// The fixed rule vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOp {
    #[serde(alias = "equal", alias = "is")]
    Equals,
    #[serde(alias = "not_equals", alias = "is_not")]
    NotEqual,
    #[serde(alias = "less_than")]
    Less,
    #[serde(alias = "greater_than")]
    Greater,
    LessOrEqual,
    GreaterOrEqual,
    Between,
    NotBetween,
    #[serde(alias = "contain")]
    Contains,
    #[serde(alias = "not_contain")]
    NotContains,
    BeginsWith,
    NotBeginsWith,
    EndsWith,
    NotEndsWith,
    IsEmpty,
    IsNotEmpty,
    IsNull,
    IsNotNull,
    In,
    NotIn,
    IsCurrentDate,
    HaveRelation,
    HaveNoRelation,

    // Placeholders, resolved by the rewrite pipeline
    InQuery,
    NotInQuery,
    InDataCollection,
    NotInDataCollection,
    InQueryField,
    NotInQueryField,
    SameAsUser,
    NotSameAsUser,
    ContainCurrentUser,
    NotContainCurrentUser,
}

impl RuleOp {
    /// Whether the operator must be rewritten before compilation
    pub fn is_placeholder(self) -> bool {
        matches!(
            self,
            RuleOp::InQuery
                | RuleOp::NotInQuery
                | RuleOp::InDataCollection
                | RuleOp::NotInDataCollection
                | RuleOp::InQueryField
                | RuleOp::NotInQueryField
                | RuleOp::SameAsUser
                | RuleOp::NotSameAsUser
                | RuleOp::ContainCurrentUser
                | RuleOp::NotContainCurrentUser
        )
    }

    /// Whether the operator is the negative half of its pair
    pub fn is_negative(self) -> bool {
        matches!(
            self,
            RuleOp::NotEqual
                | RuleOp::NotBetween
                | RuleOp::NotContains
                | RuleOp::NotBeginsWith
                | RuleOp::NotEndsWith
                | RuleOp::IsNotEmpty
                | RuleOp::IsNotNull
                | RuleOp::NotIn
                | RuleOp::HaveNoRelation
                | RuleOp::NotInQuery
                | RuleOp::NotInDataCollection
                | RuleOp::NotInQueryField
                | RuleOp::NotSameAsUser
                | RuleOp::NotContainCurrentUser
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RuleOp::Equals => "equals",
            RuleOp::NotEqual => "not_equal",
            RuleOp::Less => "less",
            RuleOp::Greater => "greater",
            RuleOp::LessOrEqual => "less_or_equal",
            RuleOp::GreaterOrEqual => "greater_or_equal",
            RuleOp::Between => "between",
            RuleOp::NotBetween => "not_between",
            RuleOp::Contains => "contains",
            RuleOp::NotContains => "not_contains",
            RuleOp::BeginsWith => "begins_with",
            RuleOp::NotBeginsWith => "not_begins_with",
            RuleOp::EndsWith => "ends_with",
            RuleOp::NotEndsWith => "not_ends_with",
            RuleOp::IsEmpty => "is_empty",
            RuleOp::IsNotEmpty => "is_not_empty",
            RuleOp::IsNull => "is_null",
            RuleOp::IsNotNull => "is_not_null",
            RuleOp::In => "in",
            RuleOp::NotIn => "not_in",
            RuleOp::IsCurrentDate => "is_current_date",
            RuleOp::HaveRelation => "have_relation",
            RuleOp::HaveNoRelation => "have_no_relation",
            RuleOp::InQuery => "in_query",
            RuleOp::NotInQuery => "not_in_query",
            RuleOp::InDataCollection => "in_data_collection",
            RuleOp::NotInDataCollection => "not_in_data_collection",
            RuleOp::InQueryField => "in_query_field",
            RuleOp::NotInQueryField => "not_in_query_field",
            RuleOp::SameAsUser => "same_as_user",
            RuleOp::NotSameAsUser => "not_same_as_user",
            RuleOp::ContainCurrentUser => "contain_current_user",
            RuleOp::NotContainCurrentUser => "not_contain_current_user",
        }
    }
}

impl std::fmt::Display for RuleOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An atomic condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Field id, column name, `"1"` or `"this_object"`
    pub key: String,
    pub rule: RuleOp,
    #[serde(default)]
    pub value: serde_json::Value,
    /// Join alias the key is resolved against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl Rule {
    pub fn new(key: impl Into<String>, rule: RuleOp, value: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            rule,
            value,
            alias: None,
        }
    }

    /// Resolve the key against a join alias instead of the base object
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }
}

/// A boolean combination of conditions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionGroup {
    #[serde(default)]
    pub glue: Glue,
    pub rules: Vec<Condition>,
}

/// A node of the condition tree
///
/// Anything that is neither a group nor a well-formed rule is kept as
/// `Malformed` so the compiler can report it with the offending fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    Group(ConditionGroup),
    Rule(Rule),
    Malformed(serde_json::Value),
}

impl Default for Condition {
    fn default() -> Self {
        Condition::empty()
    }
}

impl Condition {
    /// A group with no rules; compiles to nothing
    pub fn empty() -> Self {
        Condition::Group(ConditionGroup {
            glue: Glue::And,
            rules: Vec::new(),
        })
    }

    /// Whether the tree contains no rules at all
    pub fn is_empty(&self) -> bool {
        match self {
            Condition::Group(group) => group.rules.iter().all(Condition::is_empty),
            _ => false,
        }
    }

    /// Combine two conditions with AND, eliding empty sides
    pub fn and(self, other: Condition) -> Condition {
        match (self.is_empty(), other.is_empty()) {
            (true, _) => other,
            (_, true) => self,
            _ => Condition::Group(ConditionGroup {
                glue: Glue::And,
                rules: vec![self, other],
            }),
        }
    }

    /// First rule (depth-first, left to right) satisfying `pred`
    pub fn find_rule(&self, pred: &dyn Fn(&Rule) -> bool) -> Option<&Rule> {
        match self {
            Condition::Rule(rule) if pred(rule) => Some(rule),
            Condition::Group(group) => group.rules.iter().find_map(|c| c.find_rule(pred)),
            _ => None,
        }
    }

    /// Node holding the first rule satisfying `pred`, for in-place replacement
    pub fn find_node_mut(&mut self, pred: &dyn Fn(&Rule) -> bool) -> Option<&mut Condition> {
        if matches!(self, Condition::Rule(rule) if pred(rule)) {
            return Some(self);
        }
        match self {
            Condition::Group(group) => group.rules.iter_mut().find_map(|c| c.find_node_mut(pred)),
            _ => None,
        }
    }

    /// Number of rules satisfying `pred`
    pub fn count_rules(&self, pred: &dyn Fn(&Rule) -> bool) -> usize {
        match self {
            Condition::Rule(rule) => usize::from(pred(rule)),
            Condition::Group(group) => group.rules.iter().map(|c| c.count_rules(pred)).sum(),
            Condition::Malformed(_) => 0,
        }
    }

    /// Number of placeholder rules left in the tree
    pub fn placeholder_count(&self) -> usize {
        self.count_rules(&|rule| rule.rule.is_placeholder())
    }

    /// Visit every rule
    pub fn for_each_rule(&self, f: &mut dyn FnMut(&Rule)) {
        match self {
            Condition::Rule(rule) => f(rule),
            Condition::Group(group) => group.rules.iter().for_each(|c| c.for_each_rule(f)),
            Condition::Malformed(_) => {}
        }
    }

    /// Keep only the rules satisfying `keep`, dropping groups that become empty
    pub fn retain_rules(self, keep: &dyn Fn(&Rule) -> bool) -> Condition {
        match self {
            Condition::Group(group) => {
                let rules: Vec<Condition> = group
                    .rules
                    .into_iter()
                    .map(|c| c.retain_rules(keep))
                    .filter(|c| !c.is_empty())
                    .collect();
                Condition::Group(ConditionGroup {
                    glue: group.glue,
                    rules,
                })
            }
            Condition::Rule(rule) if keep(&rule) => Condition::Rule(rule),
            Condition::Rule(_) => Condition::empty(),
            other => other,
        }
    }
}

impl From<Rule> for Condition {
    fn from(rule: Rule) -> Self {
        Condition::Rule(rule)
    }
}

/// Helper functions to build condition trees
pub mod condition_helpers {
    use super::*;

    pub fn rule(key: impl Into<String>, op: RuleOp, value: serde_json::Value) -> Condition {
        Condition::Rule(Rule::new(key, op, value))
    }

    /// field == value
    pub fn eq(key: impl Into<String>, value: serde_json::Value) -> Condition {
        rule(key, RuleOp::Equals, value)
    }

    /// field IN (values)
    pub fn in_list(key: impl Into<String>, values: Vec<serde_json::Value>) -> Condition {
        rule(key, RuleOp::In, serde_json::Value::Array(values))
    }

    /// field NOT IN (values)
    pub fn not_in_list(key: impl Into<String>, values: Vec<serde_json::Value>) -> Condition {
        rule(key, RuleOp::NotIn, serde_json::Value::Array(values))
    }

    pub fn always_true() -> Rule {
        Rule::new(CONSTANT_KEY, RuleOp::Equals, serde_json::json!(1))
    }

    pub fn always_false() -> Rule {
        Rule::new(CONSTANT_KEY, RuleOp::Equals, serde_json::json!(0))
    }

    pub fn and(conditions: Vec<Condition>) -> Condition {
        Condition::Group(ConditionGroup {
            glue: Glue::And,
            rules: conditions,
        })
    }

    pub fn or(conditions: Vec<Condition>) -> Condition {
        Condition::Group(ConditionGroup {
            glue: Glue::Or,
            rules: conditions,
        })
    }
}
