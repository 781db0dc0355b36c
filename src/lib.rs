//! # runtara-object-query
//!
//! Condition compilation and relation resolution for metadata-defined objects
//! stored in MySQL.
//!
//! Objects, their fields and the connections between them are described by
//! metadata handed to a per-tenant [`TenantContext`]. Callers filter records
//! with a tree of rules; the engine rewrites the tree for the caller (scopes,
//! stored queries and data collections, current-user placeholders), compiles
//! it to SQL and attaches linked records to the rows it returns.
//!
//! ## Features
//!
//! - **Rule Compilation**: Text, numeric, date, list, user and connection rules compiled to MySQL
//! - **Relation Resolution**: one:one, one:many, many:one and many:many (junction) connections
//! - **Batch Population**: One read per populated connection field, siblings read concurrently
//! - **Condition Rewriting**: Scopes, `in_query`, `in_data_collection`, `contain_current_user`, `same_as_user`
//! - **Mutations**: Create, update (relation deltas only), relate, unrelate and delete
//! - **SQL Injection Prevention**: Every identifier is backtick-quoted and every literal escaped
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use runtara_object_query::{
//!     EngineConfig, FindOptions, MetadataSnapshot, MySqlDatabase, ObjectQuery, TenantContext,
//!     UserContext, condition_helpers::eq,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::builder("mysql://localhost/tenant_a").build();
//!     let db = MySqlDatabase::connect(&config).await?;
//!
//!     // Metadata normally comes from the tenant bootstrap
//!     let snapshot = MetadataSnapshot::new();
//!     let ctx = Arc::new(TenantContext::new(Arc::new(db), snapshot, config));
//!
//!     let query = ObjectQuery::new(ctx);
//!     let invoices = query
//!         .find(
//!             "obj_invoice",
//!             &FindOptions::new().with_condition(eq("status", "Open".into())),
//!             &UserContext::new("alice"),
//!         )
//!         .await?;
//!
//!     println!("{} invoices", invoices.len());
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! The engine is configured using `EngineConfig`:
//!
//! ```rust
//! use runtara_object_query::EngineConfig;
//!
//! let config = EngineConfig::builder("mysql://localhost/tenant_a")
//!     .junction_prefix("JOINMN")      // Token prefixed to many:many junction tables
//!     .relation_suffix("__relation")  // Property populated records are attached under
//!     .default_limit(1000)            // Row limit when a request carries none
//!     .read_retries(1)                // Re-issue a read once on a transient error
//!     .build();
//! ```
//!
//! ## Multi-Tenancy
//!
//! Each tenant gets its own `TenantContext` holding its database handle,
//! metadata snapshot and derived join mappings. Nothing is shared between
//! tenants.

pub mod condition;
pub mod config;
pub mod db;
pub mod error;
pub mod mutation;
pub mod notify;
pub mod record;
pub mod relation;
pub mod rewrite;
pub mod schema;
pub mod security;
pub mod sql;
pub mod store;
pub mod tenant;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use condition::{Condition, ConditionGroup, Glue, Rule, RuleOp, condition_helpers};
pub use config::{AutoColumns, EngineConfig, EngineConfigBuilder, SecurityTables};
pub use db::{Database, ExecResult, MySqlDatabase, MySqlTransaction};
pub use error::{FieldError, QueryError, Result};
pub use notify::{DeveloperNotifier, NoticeKind, TracingNotifier};
pub use record::{FindOptions, JoinRequest, Populate, Record, SaveOutcome, SortDirection, SortSpec};
pub use relation::{JoinMapping, JoinSpec, RelationJoin, Shape};
pub use schema::{DataCollectionDefinition, DataSource, ObjectDefinition, PrimaryKey, QueryDefinition};
pub use security::{Role, Scope, SqlUserDirectory, UserContext, UserDirectory, UserRecord};
pub use store::ObjectQuery;
pub use tenant::{MetadataSnapshot, TenantContext};
pub use types::{
    Aggregate, ConnectSettings, FieldDefinition, FieldType, FormulaSettings, IndexDefinition,
    LinkType, ListOption,
};

// Re-export SQL utilities for advanced users
pub use sql::ConditionCompiler;
pub use sql::sanitize::{quote_identifier, validate_identifier};
