//! Configuration for the query engine
//!
//! Provides a builder pattern for configuring dialect limits, naming conventions
//! and the security tables consulted by scope filtering.

/// Configuration for auto-managed timestamp columns
#[derive(Debug, Clone)]
pub struct AutoColumns {
    /// Whether inserts stamp the `created_at` column
    pub created_at: bool,
    /// Whether inserts and updates stamp the `updated_at` column
    pub updated_at: bool,
}

impl Default for AutoColumns {
    fn default() -> Self {
        Self {
            created_at: true,
            updated_at: true,
        }
    }
}

/// Table names used to resolve users, roles and scopes
#[derive(Debug, Clone)]
pub struct SecurityTables {
    /// Users table (`username`, `isActive`, display name column)
    pub users: String,
    /// Column holding a user's display name
    pub user_display_column: String,
    /// Roles table (`uuid`, `name`)
    pub roles: String,
    /// Role membership table (`role`, `username`)
    pub role_users: String,
    /// Scopes table (`uuid`, `name`, `allowAll`, `objectIds`, `filters`)
    pub scopes: String,
    /// Role to scope table (`role`, `scope`)
    pub role_scopes: String,
}

impl Default for SecurityTables {
    fn default() -> Self {
        Self {
            users: "SITE_USER".to_string(),
            user_display_column: "firstName".to_string(),
            roles: "SITE_ROLE".to_string(),
            role_users: "SITE_ROLE_USER".to_string(),
            scopes: "SITE_SCOPE".to_string(),
            role_scopes: "SITE_ROLE_SCOPE".to_string(),
        }
    }
}

/// Configuration for the query engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// MySQL database URL
    pub database_url: String,
    /// Dialect identifier length limit (default: 64)
    pub identifier_max_len: usize,
    /// Namespace token prefixed to many:many junction tables (default: "JOINMN")
    pub junction_prefix: String,
    /// JSON column holding multilingual values (default: "translations")
    pub translations_column: String,
    /// Suffix appended to a connection column for its populated property
    pub relation_suffix: String,
    /// Auto-managed columns configuration
    pub auto_columns: AutoColumns,
    /// Row limit applied when a find request carries none (default: 1000)
    pub default_limit: i64,
    /// How many times a failed read is re-issued on a transient error (default: 1)
    pub read_retries: u32,
    /// Security table names
    pub security: SecurityTables,
}

impl EngineConfig {
    /// Create a new configuration builder
    pub fn builder(database_url: impl Into<String>) -> EngineConfigBuilder {
        EngineConfigBuilder::new(database_url)
    }

    /// Property name a populated connection column is attached under
    pub fn relation_name(&self, column: &str) -> String {
        format!("{}{}", column, self.relation_suffix)
    }
}

/// Builder for EngineConfig
#[derive(Debug)]
pub struct EngineConfigBuilder {
    database_url: String,
    identifier_max_len: usize,
    junction_prefix: String,
    translations_column: String,
    relation_suffix: String,
    auto_columns: AutoColumns,
    default_limit: i64,
    read_retries: u32,
    security: SecurityTables,
}

impl EngineConfigBuilder {
    /// Create a new builder with the database URL
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            identifier_max_len: 64,
            junction_prefix: "JOINMN".to_string(),
            translations_column: "translations".to_string(),
            relation_suffix: "__relation".to_string(),
            auto_columns: AutoColumns::default(),
            default_limit: 1000,
            read_retries: 1,
            security: SecurityTables::default(),
        }
    }

    /// Set the identifier length limit (default: 64)
    pub fn identifier_max_len(mut self, len: usize) -> Self {
        self.identifier_max_len = len;
        self
    }

    /// Set the junction table namespace token (default: "JOINMN")
    pub fn junction_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.junction_prefix = prefix.into();
        self
    }

    /// Set the multilingual JSON column name (default: "translations")
    pub fn translations_column(mut self, name: impl Into<String>) -> Self {
        self.translations_column = name.into();
        self
    }

    /// Set the populated relation suffix (default: "__relation")
    pub fn relation_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.relation_suffix = suffix.into();
        self
    }

    /// Enable or disable `created_at` stamping (default: true)
    pub fn auto_created_at(mut self, enabled: bool) -> Self {
        self.auto_columns.created_at = enabled;
        self
    }

    /// Enable or disable `updated_at` stamping (default: true)
    pub fn auto_updated_at(mut self, enabled: bool) -> Self {
        self.auto_columns.updated_at = enabled;
        self
    }

    /// Disable all auto-managed columns
    pub fn without_auto_columns(mut self) -> Self {
        self.auto_columns = AutoColumns {
            created_at: false,
            updated_at: false,
        };
        self
    }

    /// Set the default row limit (default: 1000)
    pub fn default_limit(mut self, limit: i64) -> Self {
        self.default_limit = limit;
        self
    }

    /// Set the number of read retries on transient errors (default: 1)
    pub fn read_retries(mut self, retries: u32) -> Self {
        self.read_retries = retries;
        self
    }

    /// Override the security table names
    pub fn security_tables(mut self, tables: SecurityTables) -> Self {
        self.security = tables;
        self
    }

    /// Build the configuration
    pub fn build(self) -> EngineConfig {
        EngineConfig {
            database_url: self.database_url,
            identifier_max_len: self.identifier_max_len,
            junction_prefix: self.junction_prefix,
            translations_column: self.translations_column,
            relation_suffix: self.relation_suffix,
            auto_columns: self.auto_columns,
            default_limit: self.default_limit,
            read_retries: self.read_retries,
            security: self.security,
        }
    }
}
