//! Recording database, scripted user directory and sample metadata for unit tests

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

use crate::condition::RuleOp;
use crate::condition::condition_helpers::*;
use crate::config::EngineConfig;
use crate::db::{Database, ExecResult};
use crate::error::{QueryError, Result};
use crate::notify::recording::RecordingNotifier;
use crate::record::Record;
use crate::schema::{
    DataCollectionDefinition, DataSource, ObjectDefinition, PrimaryKey, QueryDefinition,
};
use crate::security::{Role, Scope, UserDirectory, UserRecord};
use crate::tenant::{MetadataSnapshot, TenantContext};
use crate::types::{
    Aggregate, ConnectSettings, FieldDefinition, FieldType, FormulaSettings, LinkType, ListOption,
};

/// Build a record from a JSON object literal
pub fn record(value: serde_json::Value) -> Record {
    match value {
        serde_json::Value::Object(map) => map,
        other => panic!("Expected JSON object, got {}", other),
    }
}

/// Records every statement and answers reads from scripted responses
///
/// A response is chosen by the first registered pattern the SQL contains;
/// unmatched reads return no rows.
#[derive(Debug, Default)]
pub struct FakeDatabase {
    statements: Mutex<Vec<String>>,
    responses: Mutex<Vec<(String, Vec<Record>)>>,
    failures: Mutex<Vec<String>>,
    next_insert_id: Mutex<u64>,
}

impl FakeDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer reads containing `pattern` with `rows`
    ///
    /// Responding again to the same pattern replaces its rows.
    pub fn respond(&self, pattern: &str, rows: Vec<Record>) {
        let mut responses = self.responses.lock();
        match responses.iter_mut().find(|(p, _)| p == pattern) {
            Some((_, existing)) => *existing = rows,
            None => responses.push((pattern.to_string(), rows)),
        }
    }

    /// Fail the next statement containing `pattern` with a transient error
    pub fn fail_once(&self, pattern: &str) {
        self.failures.lock().push(pattern.to_string());
    }

    pub fn set_insert_id(&self, id: u64) {
        *self.next_insert_id.lock() = id;
    }

    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().clone()
    }

    /// Statements containing `pattern`
    pub fn matching(&self, pattern: &str) -> Vec<String> {
        self.statements
            .lock()
            .iter()
            .filter(|s| s.contains(pattern))
            .cloned()
            .collect()
    }

    pub fn writes(&self) -> Vec<String> {
        self.statements
            .lock()
            .iter()
            .filter(|s| !s.starts_with("SELECT"))
            .cloned()
            .collect()
    }

    fn record_statement(&self, sql: &str) -> Result<()> {
        self.statements.lock().push(sql.to_string());
        let mut failures = self.failures.lock();
        if let Some(pos) = failures.iter().position(|p| sql.contains(p.as_str())) {
            failures.remove(pos);
            return Err(QueryError::sql(sql, sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

#[async_trait]
impl Database for FakeDatabase {
    async fn fetch(&self, sql: &str) -> Result<Vec<Record>> {
        self.record_statement(sql)?;
        let responses = self.responses.lock();
        Ok(responses
            .iter()
            .find(|(pattern, _)| sql.contains(pattern.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default())
    }

    async fn execute(&self, sql: &str) -> Result<ExecResult> {
        self.record_statement(sql)?;
        Ok(ExecResult {
            rows_affected: 1,
            last_insert_id: *self.next_insert_id.lock(),
        })
    }
}

/// In-memory users, roles and scopes
#[derive(Debug, Default)]
pub struct StaticDirectory {
    users: Vec<UserRecord>,
    roles: HashMap<String, Vec<Role>>,
    scopes: Vec<(String, Scope)>,
    lookups: Mutex<usize>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Active user holding the given role ids
    pub fn user(mut self, username: &str, roles: &[&str]) -> Self {
        self.users.push(UserRecord {
            username: username.to_string(),
            display_name: None,
            is_active: true,
        });
        self.roles.insert(
            username.to_string(),
            roles
                .iter()
                .map(|r| Role {
                    id: r.to_string(),
                    name: r.to_string(),
                })
                .collect(),
        );
        self
    }

    pub fn inactive_user(mut self, username: &str) -> Self {
        self.users.push(UserRecord {
            username: username.to_string(),
            display_name: None,
            is_active: false,
        });
        self
    }

    /// Grant a scope to a role
    pub fn scope(mut self, role: &str, scope: Scope) -> Self {
        self.scopes.push((role.to_string(), scope));
        self
    }

    /// Number of user lookups served
    pub fn lookups(&self) -> usize {
        *self.lookups.lock()
    }
}

#[async_trait]
impl UserDirectory for StaticDirectory {
    async fn user(&self, _db: &dyn Database, username: &str) -> Result<Option<UserRecord>> {
        *self.lookups.lock() += 1;
        Ok(self.users.iter().find(|u| u.username == username).cloned())
    }

    async fn roles(&self, _db: &dyn Database, username: &str) -> Result<Vec<Role>> {
        Ok(self.roles.get(username).cloned().unwrap_or_default())
    }

    async fn scopes(&self, _db: &dyn Database, roles: &[Role]) -> Result<Vec<Scope>> {
        let mut scopes: Vec<Scope> = Vec::new();
        for (role, scope) in &self.scopes {
            if roles.iter().any(|r| &r.id == role) && !scopes.iter().any(|s| s.id == scope.id) {
                scopes.push(scope.clone());
            }
        }
        Ok(scopes)
    }

    async fn display_names(
        &self,
        _db: &dyn Database,
        usernames: &[String],
    ) -> Result<HashMap<String, String>> {
        Ok(self
            .users
            .iter()
            .filter(|u| usernames.contains(&u.username))
            .filter_map(|u| u.display_name.clone().map(|d| (u.username.clone(), d)))
            .collect())
    }
}

fn connect(id: &str, column: &str, settings: ConnectSettings) -> FieldDefinition {
    FieldDefinition::new(id, column, FieldType::Connect(settings))
}

/// Invoices with tags (many:many), a customer (one:many), lines (many:one),
/// plus a self-referencing person object and a few stored queries
pub fn sample_snapshot() -> MetadataSnapshot {
    let invoice = ObjectDefinition::new(
        "obj_invoice",
        "Invoice",
        "AB_Invoice",
        vec![
            FieldDefinition::new("f_number", "number", FieldType::String).with_label("Number"),
            FieldDefinition::new(
                "f_status",
                "status",
                FieldType::List {
                    options: vec![
                        ListOption::new("opt_open", "Open"),
                        ListOption::new("opt_closed", "Closed"),
                    ],
                    is_multiple: false,
                },
            ),
            FieldDefinition::new("f_total", "total", FieldType::Number),
            FieldDefinition::new("f_due", "due", FieldType::Date),
            FieldDefinition::new("f_paid", "paid", FieldType::Boolean),
            FieldDefinition::new("f_owner", "owner", FieldType::User { is_multiple: false }),
            FieldDefinition::new("f_watchers", "watchers", FieldType::User { is_multiple: true }),
            FieldDefinition::new("f_title", "title", FieldType::String).multilingual(),
            connect(
                "f_tags",
                "tags",
                ConnectSettings::new("obj_tag", LinkType::Many, LinkType::Many)
                    .via("f_invoices")
                    .source(),
            ),
            connect(
                "f_customer",
                "customer",
                ConnectSettings::new("obj_customer", LinkType::One, LinkType::Many)
                    .via("f_invoices_of"),
            ),
            connect(
                "f_lines",
                "lines",
                ConnectSettings::new("obj_line", LinkType::Many, LinkType::One).via("f_invoice"),
            ),
            FieldDefinition::new(
                "f_line_total",
                "line_total",
                FieldType::Formula(FormulaSettings {
                    field: "f_lines".into(),
                    target_field: "amount".into(),
                    aggregate: Aggregate::Sum,
                    filter: Some(rule("amount", RuleOp::Greater, json!(0))),
                }),
            ),
            FieldDefinition::new(
                "f_double_total",
                "double_total",
                FieldType::Calculate {
                    formula: "{total} * 2".into(),
                },
            ),
        ],
    )
    .with_label_format("{Number}");

    let tag = ObjectDefinition::new(
        "obj_tag",
        "Tag",
        "AB_Tag",
        vec![
            FieldDefinition::new("f_name", "name", FieldType::String).with_label("Name"),
            connect(
                "f_invoices",
                "invoices",
                ConnectSettings::new("obj_invoice", LinkType::Many, LinkType::Many).via("f_tags"),
            ),
        ],
    )
    .with_label_format("{Name}");

    let customer = ObjectDefinition::new(
        "obj_customer",
        "Customer",
        "AB_Customer",
        vec![
            FieldDefinition::new("f_cname", "name", FieldType::String).with_label("Name"),
            FieldDefinition::new("f_manager", "manager", FieldType::User { is_multiple: false }),
            connect(
                "f_invoices_of",
                "invoices",
                ConnectSettings::new("obj_invoice", LinkType::Many, LinkType::One)
                    .via("f_customer"),
            ),
        ],
    )
    .with_primary_key(PrimaryKey::Id);

    let line = ObjectDefinition::new(
        "obj_line",
        "Line",
        "AB_Line",
        vec![
            FieldDefinition::new("f_amount", "amount", FieldType::Number),
            connect(
                "f_invoice",
                "invoice",
                ConnectSettings::new("obj_invoice", LinkType::One, LinkType::Many).via("f_lines"),
            ),
        ],
    );

    let person = ObjectDefinition::new(
        "obj_person",
        "Person",
        "AB_Person",
        vec![
            FieldDefinition::new("f_pname", "name", FieldType::String).required(),
            connect(
                "f_partner",
                "partner",
                ConnectSettings::new("obj_person", LinkType::One, LinkType::One)
                    .via("f_partner")
                    .source(),
            ),
        ],
    );

    MetadataSnapshot::new()
        .with_object(invoice)
        .with_object(tag)
        .with_object(customer)
        .with_object(line)
        .with_object(person)
        .with_query(QueryDefinition::new(
            "q_urgent_tags",
            "Urgent tags",
            "obj_tag",
            eq("name", json!("urgent")),
        ))
        .with_query(QueryDefinition::new(
            "q_open_invoices",
            "Open invoices",
            "obj_invoice",
            eq("status", json!("opt_open")),
        ))
        .with_query(QueryDefinition::new(
            "q_my_invoices",
            "My invoices",
            "obj_invoice",
            rule("owner", RuleOp::ContainCurrentUser, json!(null)),
        ))
        .with_query(QueryDefinition::new(
            "q_cycle_a",
            "Cycle A",
            "obj_invoice",
            rule("this_object", RuleOp::InQuery, json!("q_cycle_b")),
        ))
        .with_query(QueryDefinition::new(
            "q_cycle_b",
            "Cycle B",
            "obj_invoice",
            rule("this_object", RuleOp::InQuery, json!("q_cycle_a")),
        ))
        .with_data_collection(DataCollectionDefinition::new(
            "dc_big",
            "Big invoices",
            DataSource::Object("obj_invoice".into()),
            rule("total", RuleOp::Greater, json!(100)),
        ))
        .with_data_collection(DataCollectionDefinition::new(
            "dc_open_tagged",
            "Open invoices with tags",
            DataSource::Query("q_open_invoices".into()),
            rule("tags", RuleOp::HaveRelation, json!(null)),
        ))
}

pub fn test_config() -> EngineConfig {
    EngineConfig::builder("mysql://localhost/test").build()
}

/// Context over `sample_snapshot` with a recording database
pub fn sample_context() -> (TenantContext, Arc<FakeDatabase>) {
    let db = Arc::new(FakeDatabase::new());
    let ctx = TenantContext::new(db.clone(), sample_snapshot(), test_config());
    (ctx, db)
}

/// Document object whose `team` connection points at a deleted object
pub fn broken_doc() -> ObjectDefinition {
    ObjectDefinition::new(
        "obj_doc",
        "Doc",
        "AB_Doc",
        vec![
            FieldDefinition::new("f_title", "title", FieldType::String),
            connect(
                "f_team",
                "team",
                ConnectSettings::new("obj_deleted_team", LinkType::One, LinkType::Many),
            ),
            FieldDefinition::new(
                "f_team_size",
                "team_size",
                FieldType::Formula(FormulaSettings {
                    field: "f_team".into(),
                    target_field: "size".into(),
                    aggregate: Aggregate::Count,
                    filter: None,
                }),
            ),
        ],
    )
}

/// Employees with at most one badge; the badge row holds the link
pub fn badge_objects() -> [ObjectDefinition; 2] {
    let employee = ObjectDefinition::new(
        "obj_employee",
        "Employee",
        "AB_Employee",
        vec![
            FieldDefinition::new("f_ename", "name", FieldType::String),
            connect(
                "f_badge",
                "badge",
                ConnectSettings::new("obj_badge", LinkType::One, LinkType::One).via("f_holder"),
            ),
        ],
    );
    let badge = ObjectDefinition::new(
        "obj_badge",
        "Badge",
        "AB_Badge",
        vec![
            FieldDefinition::new("f_code", "code", FieldType::String),
            connect(
                "f_holder",
                "employee",
                ConnectSettings::new("obj_employee", LinkType::One, LinkType::One)
                    .via("f_badge")
                    .source(),
            ),
        ],
    );
    [employee, badge]
}

/// Customer with a formula totalling the caller's own open invoices
pub fn customer_with_filtered_formula() -> ObjectDefinition {
    let mut customer = sample_snapshot()
        .object("obj_customer")
        .cloned()
        .expect("sample snapshot has customers");
    customer.fields.push(FieldDefinition::new(
        "f_my_total",
        "my_total",
        FieldType::Formula(FormulaSettings {
            field: "f_invoices_of".into(),
            target_field: "total".into(),
            aggregate: Aggregate::Sum,
            filter: Some(and(vec![
                rule("owner", RuleOp::ContainCurrentUser, json!(null)),
                rule("this_object", RuleOp::InQuery, json!("q_open_invoices")),
            ])),
        }),
    ));
    customer
}

/// Context over `sample_snapshot` plus `objects`, with a recording notifier
pub fn context_with(
    objects: impl IntoIterator<Item = ObjectDefinition>,
) -> (TenantContext, Arc<FakeDatabase>, Arc<RecordingNotifier>) {
    let snapshot = objects
        .into_iter()
        .fold(sample_snapshot(), |snapshot, object| snapshot.with_object(object));
    let db = Arc::new(FakeDatabase::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let ctx = TenantContext::new(db.clone(), snapshot, test_config()).with_notifier(notifier.clone());
    (ctx, db, notifier)
}
