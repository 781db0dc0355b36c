//! Caller identity and scope lookup
//!
//! Scopes restrict which records of an object a role may see. A user's scopes
//! are reached through `user -> roles -> scopes`, read from the security tables
//! named in `SecurityTables`.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};

use crate::condition::Condition;
use crate::config::SecurityTables;
use crate::db::{Database, fetch_with_retry};
use crate::error::{QueryError, Result};
use crate::record::Record;
use crate::sql::sanitize::{quote_identifier, quote_literal, quote_qualified};

/// Who is asking
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserContext {
    /// Absent for anonymous callers
    pub username: Option<String>,
    /// Language used for multilingual fields
    pub language_code: String,
    /// System callers bypass scope filtering
    pub is_system: bool,
}

impl Default for UserContext {
    fn default() -> Self {
        Self {
            username: None,
            language_code: "en".to_string(),
            is_system: false,
        }
    }
}

impl UserContext {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            ..Self::default()
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn system() -> Self {
        Self {
            is_system: true,
            ..Self::default()
        }
    }

    pub fn with_language(mut self, language_code: impl Into<String>) -> Self {
        self.language_code = language_code.into();
        self
    }
}

/// A user row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub username: String,
    pub display_name: Option<String>,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Role {
    pub id: String,
    pub name: String,
}

/// A named filter granted to roles
#[derive(Debug, Clone, PartialEq)]
pub struct Scope {
    pub id: String,
    pub name: String,
    /// Applies to every object
    pub allow_all: bool,
    /// Objects the scope applies to when `allow_all` is false
    pub object_ids: Vec<String>,
    /// Empty means no restriction on covered objects
    pub filter: Condition,
}

impl Scope {
    pub fn covers(&self, object_id: &str) -> bool {
        self.allow_all || self.object_ids.iter().any(|id| id == object_id)
    }
}

/// Source of users, roles and scopes
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn user(&self, db: &dyn Database, username: &str) -> Result<Option<UserRecord>>;

    async fn roles(&self, db: &dyn Database, username: &str) -> Result<Vec<Role>>;

    /// Scopes granted to any of the roles, without duplicates
    async fn scopes(&self, db: &dyn Database, roles: &[Role]) -> Result<Vec<Scope>>;

    /// Display name per username, for users that have one
    async fn display_names(
        &self,
        db: &dyn Database,
        usernames: &[String],
    ) -> Result<HashMap<String, String>>;
}

/// Scopes of an active user
///
/// Unknown or inactive users are a security error.
pub async fn scopes_for_user(
    directory: &dyn UserDirectory,
    db: &dyn Database,
    username: &str,
) -> Result<Vec<Scope>> {
    let user = directory
        .user(db, username)
        .await?
        .ok_or_else(|| QueryError::security(format!("Unknown user '{}'", username)))?;
    if !user.is_active {
        return Err(QueryError::security(format!("User '{}' is not active", username)));
    }
    let roles = directory.roles(db, username).await?;
    if roles.is_empty() {
        return Ok(Vec::new());
    }
    directory.scopes(db, &roles).await
}

/// Directory backed by the security tables of the tenant database
#[derive(Debug, Clone)]
pub struct SqlUserDirectory {
    tables: SecurityTables,
    read_retries: u32,
}

impl SqlUserDirectory {
    pub fn new(tables: SecurityTables) -> Self {
        Self {
            tables,
            read_retries: 1,
        }
    }

    pub fn with_read_retries(mut self, retries: u32) -> Self {
        self.read_retries = retries;
        self
    }

    pub(crate) fn user_sql(&self, username: &str) -> String {
        format!(
            "SELECT `username`, `isActive`, {} AS `displayName` FROM {} WHERE `username` = {} LIMIT 1",
            quote_identifier(&self.tables.user_display_column),
            quote_identifier(&self.tables.users),
            quote_literal(username)
        )
    }

    pub(crate) fn roles_sql(&self, username: &str) -> String {
        format!(
            "SELECT {}, {} FROM {} INNER JOIN {} ON {} = {} WHERE {} = {}",
            quote_qualified("r", "uuid"),
            quote_qualified("r", "name"),
            alias(&self.tables.roles, "r"),
            alias(&self.tables.role_users, "ru"),
            quote_qualified("ru", "role"),
            quote_qualified("r", "uuid"),
            quote_qualified("ru", "username"),
            quote_literal(username)
        )
    }

    pub(crate) fn scopes_sql(&self, roles: &[Role]) -> String {
        let ids: Vec<String> = roles.iter().map(|r| quote_literal(&r.id)).collect();
        format!(
            "SELECT DISTINCT {}, {}, {}, {}, {} FROM {} INNER JOIN {} ON {} = {} WHERE {} IN ({})",
            quote_qualified("s", "uuid"),
            quote_qualified("s", "name"),
            quote_qualified("s", "allowAll"),
            quote_qualified("s", "objectIds"),
            quote_qualified("s", "filters"),
            alias(&self.tables.scopes, "s"),
            alias(&self.tables.role_scopes, "rs"),
            quote_qualified("rs", "scope"),
            quote_qualified("s", "uuid"),
            quote_qualified("rs", "role"),
            ids.join(", ")
        )
    }
}

fn alias(table: &str, alias: &str) -> String {
    format!("{} AS {}", quote_identifier(table), quote_identifier(alias))
}

fn text(record: &Record, key: &str) -> Option<String> {
    match record.get(key)? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Null => None,
        other => Some(other.to_string()),
    }
}

pub(crate) fn truthy(value: Option<&serde_json::Value>) -> bool {
    match value {
        Some(serde_json::Value::Bool(b)) => *b,
        Some(serde_json::Value::Number(n)) => n.as_i64().is_some_and(|n| n != 0),
        Some(serde_json::Value::String(s)) => matches!(s.to_lowercase().as_str(), "1" | "true"),
        _ => false,
    }
}

/// JSON columns may arrive decoded or as their text
fn json_column(value: Option<&serde_json::Value>) -> serde_json::Value {
    match value {
        Some(serde_json::Value::String(s)) => {
            serde_json::from_str(s).unwrap_or(serde_json::Value::Null)
        }
        Some(other) => other.clone(),
        None => serde_json::Value::Null,
    }
}

fn scope_from_record(record: &Record) -> Result<Scope> {
    let id = text(record, "uuid")
        .ok_or_else(|| QueryError::security("Scope row without uuid"))?;
    let object_ids = match json_column(record.get("objectIds")) {
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|i| i.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    };
    let filter = match json_column(record.get("filters")) {
        serde_json::Value::Null => Condition::empty(),
        value => serde_json::from_value(value).map_err(|e| {
            QueryError::security(format!("Scope '{}' has an unreadable filter: {}", id, e))
        })?,
    };
    Ok(Scope {
        name: text(record, "name").unwrap_or_default(),
        allow_all: truthy(record.get("allowAll")),
        object_ids,
        filter,
        id,
    })
}

#[async_trait]
impl UserDirectory for SqlUserDirectory {
    async fn user(&self, db: &dyn Database, username: &str) -> Result<Option<UserRecord>> {
        let rows = fetch_with_retry(db, &self.user_sql(username), self.read_retries).await?;
        Ok(rows.first().map(|row| UserRecord {
            username: text(row, "username").unwrap_or_else(|| username.to_string()),
            display_name: text(row, "displayName"),
            is_active: truthy(row.get("isActive")),
        }))
    }

    async fn roles(&self, db: &dyn Database, username: &str) -> Result<Vec<Role>> {
        let rows = fetch_with_retry(db, &self.roles_sql(username), self.read_retries).await?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                Some(Role {
                    id: text(row, "uuid")?,
                    name: text(row, "name").unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn scopes(&self, db: &dyn Database, roles: &[Role]) -> Result<Vec<Scope>> {
        if roles.is_empty() {
            return Ok(Vec::new());
        }
        let rows = fetch_with_retry(db, &self.scopes_sql(roles), self.read_retries).await?;
        let mut seen = HashSet::new();
        let mut scopes = Vec::new();
        for row in &rows {
            let scope = scope_from_record(row)?;
            if seen.insert(scope.id.clone()) {
                scopes.push(scope);
            }
        }
        Ok(scopes)
    }

    async fn display_names(
        &self,
        db: &dyn Database,
        usernames: &[String],
    ) -> Result<HashMap<String, String>> {
        if usernames.is_empty() {
            return Ok(HashMap::new());
        }
        let list: Vec<String> = usernames.iter().map(|u| quote_literal(u)).collect();
        let sql = format!(
            "SELECT `username`, {} AS `displayName` FROM {} WHERE `username` IN ({})",
            quote_identifier(&self.tables.user_display_column),
            quote_identifier(&self.tables.users),
            list.join(", ")
        );
        let rows = fetch_with_retry(db, &sql, self.read_retries).await?;
        Ok(rows
            .iter()
            .filter_map(|row| Some((text(row, "username")?, text(row, "displayName")?)))
            .collect())
    }
}
