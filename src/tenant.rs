//! Per-tenant state
//!
//! A `TenantContext` owns everything a request against one tenant needs: the
//! database handle, the metadata snapshot, the configuration and the cache of
//! join mappings derived from the snapshot. Nothing here is process-global.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::OwnedMutexGuard;

use crate::config::EngineConfig;
use crate::db::Database;
use crate::error::{QueryError, Result};
use crate::notify::{DeveloperNotifier, NoticeKind, TracingNotifier};
use crate::relation::{JoinMapping, build_join_mapping};
use crate::schema::{DataCollectionDefinition, ObjectDefinition, QueryDefinition};
use crate::security::{SqlUserDirectory, UserDirectory};
use crate::sql::sanitize::validate_identifier;

/// Read-only view of a tenant's metadata
#[derive(Debug, Clone, Default)]
pub struct MetadataSnapshot {
    objects: HashMap<String, ObjectDefinition>,
    queries: HashMap<String, QueryDefinition>,
    data_collections: HashMap<String, DataCollectionDefinition>,
}

impl MetadataSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an object
    pub fn with_object(mut self, object: ObjectDefinition) -> Self {
        self.objects.insert(object.id.clone(), object);
        self
    }

    pub fn with_query(mut self, query: QueryDefinition) -> Self {
        self.queries.insert(query.id.clone(), query);
        self
    }

    pub fn with_data_collection(mut self, collection: DataCollectionDefinition) -> Self {
        self.data_collections.insert(collection.id.clone(), collection);
        self
    }

    pub fn object(&self, id: &str) -> Option<&ObjectDefinition> {
        self.objects.get(id)
    }

    /// Object by id, as an error when missing
    pub fn require_object(&self, id: &str) -> Result<&ObjectDefinition> {
        self.object(id)
            .ok_or_else(|| QueryError::object_not_found(id))
    }

    pub fn object_by_table(&self, table_name: &str) -> Option<&ObjectDefinition> {
        self.objects.values().find(|o| o.table_name == table_name)
    }

    pub fn objects(&self) -> impl Iterator<Item = &ObjectDefinition> {
        self.objects.values()
    }

    pub fn query(&self, id: &str) -> Option<&QueryDefinition> {
        self.queries.get(id)
    }

    pub fn data_collection(&self, id: &str) -> Option<&DataCollectionDefinition> {
        self.data_collections.get(id)
    }
}

/// State shared by every request of one tenant
pub struct TenantContext {
    db: Arc<dyn Database>,
    config: EngineConfig,
    snapshot: RwLock<Arc<MetadataSnapshot>>,
    join_cache: RwLock<HashMap<String, Arc<JoinMapping>>>,
    /// Bumped on every invalidation; mappings built across a bump are not cached
    generation: AtomicU64,
    notifier: Arc<dyn DeveloperNotifier>,
    users: Arc<dyn UserDirectory>,
    record_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TenantContext {
    pub fn new(db: Arc<dyn Database>, snapshot: MetadataSnapshot, config: EngineConfig) -> Self {
        let users = SqlUserDirectory::new(config.security.clone())
            .with_read_retries(config.read_retries);
        Self {
            db,
            snapshot: RwLock::new(Arc::new(snapshot)),
            join_cache: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
            notifier: Arc::new(TracingNotifier),
            users: Arc::new(users),
            record_locks: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn DeveloperNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_user_directory(mut self, users: Arc<dyn UserDirectory>) -> Self {
        self.users = users;
        self
    }

    pub fn database(&self) -> &dyn Database {
        self.db.as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn notifier(&self) -> &dyn DeveloperNotifier {
        self.notifier.as_ref()
    }

    pub fn users(&self) -> &dyn UserDirectory {
        self.users.as_ref()
    }

    /// Current snapshot; stays valid for the caller even if it is replaced
    pub fn snapshot(&self) -> Arc<MetadataSnapshot> {
        self.snapshot.read().clone()
    }

    /// Swap in new metadata and drop every derived mapping
    pub fn replace_snapshot(&self, snapshot: MetadataSnapshot) {
        *self.snapshot.write() = Arc::new(snapshot);
        self.invalidate_all();
    }

    /// Drop the mappings of an object and of every object linking to it
    pub fn invalidate(&self, object_id: &str) {
        let mut cache = self.join_cache.write();
        cache.retain(|id, mapping| id != object_id && !mapping.references(object_id));
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn invalidate_all(&self) {
        let mut cache = self.join_cache.write();
        cache.clear();
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Join mapping of an object, built on first use
    pub fn join_mapping(&self, object_id: &str) -> Result<Arc<JoinMapping>> {
        if let Some(mapping) = self.join_cache.read().get(object_id) {
            return Ok(mapping.clone());
        }

        let generation = self.generation.load(Ordering::Acquire);
        let snapshot = self.snapshot();
        let object = snapshot.require_object(object_id)?;
        self.check_identifiers(object);
        let mapping = Arc::new(build_join_mapping(
            &snapshot,
            object,
            &self.config,
            self.notifier.as_ref(),
        ));
        self.cache_mapping(object_id, mapping.clone(), generation);
        Ok(mapping)
    }

    /// Cache a mapping unless an invalidation ran since `generation` was read
    fn cache_mapping(&self, object_id: &str, mapping: Arc<JoinMapping>, generation: u64) {
        let mut cache = self.join_cache.write();
        if self.generation.load(Ordering::Acquire) == generation {
            cache.insert(object_id.to_string(), mapping);
        } else {
            tracing::debug!(object = %object_id, "Join mapping went stale while building");
        }
    }

    /// Report a connection field of `object` that has no join
    ///
    /// Returns the notice message.
    pub(crate) fn report_unresolved(&self, object: &ObjectDefinition, field: &str) -> String {
        let message = format!(
            "Connection '{}' of '{}' cannot be resolved",
            field, object.name
        );
        self.notifier.notify(
            NoticeKind::MissingLinkTarget,
            &message,
            serde_json::json!({"object": object.id, "field": field}),
        );
        message
    }

    /// Report an unresolvable connection a condition depends on, as an error
    pub(crate) fn unresolved_connection(&self, object: &ObjectDefinition, field: &str) -> QueryError {
        QueryError::configuration(self.report_unresolved(object, field))
    }

    /// Hold the write lock of one record
    ///
    /// Writes to the same record queue behind each other; writes to different
    /// records proceed independently.
    pub async fn lock_record(&self, object_id: &str, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.record_locks.lock();
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry(format!("{}:{}", object_id, key))
                .or_default()
                .clone()
        };
        lock.lock_owned().await
    }

    /// Report table and column names the dialect cannot hold
    fn check_identifiers(&self, object: &ObjectDefinition) {
        let max = self.config.identifier_max_len;
        let names = std::iter::once(object.table_name.as_str()).chain(
            object
                .fields
                .iter()
                .filter(|f| !f.is_virtual())
                .map(|f| f.column_name.as_str()),
        );
        for name in names {
            if let Err(message) = validate_identifier(name, max) {
                self.notifier.notify(
                    NoticeKind::InvalidIdentifier,
                    &message,
                    serde_json::json!({"object": object.id, "identifier": name}),
                );
            }
        }
    }
}

impl std::fmt::Debug for TenantContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantContext")
            .field("config", &self.config)
            .field("cached_mappings", &self.join_cache.read().len())
            .finish()
    }
}
