//! Resolution of tenants to their physical location. The directory caches
//! assignments read from the topology store and supports targeted
//! invalidation as well as a full reload when the topology changes.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use slog::{debug, o, Logger};

use crate::error::StoreError;
use crate::{Namespace, PoolId, ServerId, TenantId};

/// The resolved physical location of a tenant: the server it lives on,
/// the pools to use for reading and writing, and the schema holding its
/// data. Immutable once created; topology changes produce a new value.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Assignment {
    pub tenant: TenantId,
    pub server: ServerId,
    pub read_pool: PoolId,
    pub write_pool: PoolId,
    pub schema: Namespace,
}

/// The interface to the configuration/metadata store that knows which
/// tenant lives where. Implemented by [`crate::config::Topology`] for
/// file-based setups and by test doubles.
pub trait TopologyStore: Send + Sync + 'static {
    /// The assignment for one tenant, or `None` if the tenant is unknown.
    fn assignment(&self, tenant: TenantId) -> Result<Option<Assignment>, StoreError>;

    /// All assignments, for bulk refresh.
    fn assignments(&self) -> Result<Vec<Assignment>, StoreError>;
}

#[derive(Default)]
struct Maps {
    by_tenant: HashMap<TenantId, Arc<Assignment>>,
    by_schema: HashMap<Namespace, Arc<Assignment>>,
}

impl Maps {
    fn insert(&mut self, assignment: Arc<Assignment>) {
        self.by_tenant
            .insert(assignment.tenant, assignment.clone());
        self.by_schema
            .insert(assignment.schema.clone(), assignment);
    }

    fn remove(&mut self, tenant: TenantId) {
        if let Some(assignment) = self.by_tenant.remove(&tenant) {
            self.by_schema.remove(&assignment.schema);
        }
    }
}

/// Cache for the mapping from tenant to server/pools/schema. Entries are
/// `Arc`ed so concurrent readers either see the old or the new assignment
/// in full, never a partial update.
pub struct SchemaDirectory {
    logger: Logger,
    store: Arc<dyn TopologyStore>,
    cache: RwLock<Maps>,
}

impl SchemaDirectory {
    pub fn new(logger: &Logger, store: Arc<dyn TopologyStore>) -> Self {
        let logger = logger.new(o!("component" => "SchemaDirectory"));
        Self {
            logger,
            store,
            cache: RwLock::new(Maps::default()),
        }
    }

    /// Resolve the assignment for `tenant`, from the cache if possible.
    pub fn resolve(&self, tenant: TenantId) -> Result<Arc<Assignment>, StoreError> {
        if let Some(assignment) = self.cache.read().unwrap().by_tenant.get(&tenant) {
            return Ok(assignment.clone());
        }

        let assignment = self
            .store
            .assignment(tenant)
            .map_err(directory_unavailable)?
            .ok_or(StoreError::TenantNotFound(tenant))?;
        let assignment = Arc::new(assignment);
        debug!(self.logger, "resolved tenant";
               "tenant" => %tenant,
               "schema" => %assignment.schema,
               "write_pool" => %assignment.write_pool);
        self.cache.write().unwrap().insert(assignment.clone());
        Ok(assignment)
    }

    /// Reverse lookup: the assignment whose schema is `schema`.
    pub fn resolve_by_schema(&self, schema: &Namespace) -> Result<Arc<Assignment>, StoreError> {
        if let Some(assignment) = self.cache.read().unwrap().by_schema.get(schema) {
            return Ok(assignment.clone());
        }

        let assignment = self
            .store
            .assignments()
            .map_err(directory_unavailable)?
            .into_iter()
            .find(|a| &a.schema == schema)
            .ok_or_else(|| {
                StoreError::DirectoryUnavailable(format!(
                    "no tenant is assigned to schema {}",
                    schema
                ))
            })?;
        let assignment = Arc::new(assignment);
        self.cache.write().unwrap().insert(assignment.clone());
        Ok(assignment)
    }

    /// Evict the given tenants from the cache; the next `resolve` reads
    /// fresh data from the topology store. Safe to call concurrently with
    /// `resolve`.
    pub fn invalidate(&self, tenants: &[TenantId]) {
        let mut maps = self.cache.write().unwrap();
        for tenant in tenants {
            maps.remove(*tenant);
        }
        debug!(self.logger, "invalidated tenants"; "count" => tenants.len());
    }

    /// Replace the whole cache with the topology store's current state.
    /// Failures leave the existing cache untouched and surface to the
    /// caller; nothing is retried here.
    pub fn reload(&self) -> Result<(), StoreError> {
        let assignments = self.store.assignments().map_err(directory_unavailable)?;
        let mut maps = Maps::default();
        for assignment in assignments {
            maps.insert(Arc::new(assignment));
        }
        let count = maps.by_tenant.len();
        *self.cache.write().unwrap() = maps;
        debug!(self.logger, "reloaded directory"; "assignments" => count);
        Ok(())
    }
}

fn directory_unavailable(e: StoreError) -> StoreError {
    match e {
        e @ StoreError::DirectoryUnavailable(_) => e,
        e => StoreError::DirectoryUnavailable(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::logger;

    /// A topology store whose contents tests can swap out from under the
    /// directory, standing in for a topology change.
    struct SwappableStore {
        assignments: Mutex<Vec<Assignment>>,
    }

    impl SwappableStore {
        fn new(assignments: Vec<Assignment>) -> Self {
            Self {
                assignments: Mutex::new(assignments),
            }
        }

        fn swap(&self, assignments: Vec<Assignment>) {
            *self.assignments.lock().unwrap() = assignments;
        }
    }

    impl TopologyStore for SwappableStore {
        fn assignment(&self, tenant: TenantId) -> Result<Option<Assignment>, StoreError> {
            Ok(self
                .assignments
                .lock()
                .unwrap()
                .iter()
                .find(|a| a.tenant == tenant)
                .cloned())
        }

        fn assignments(&self) -> Result<Vec<Assignment>, StoreError> {
            Ok(self.assignments.lock().unwrap().clone())
        }
    }

    fn assignment(tenant: u32, pool: u32, schema: &str) -> Assignment {
        Assignment {
            tenant: TenantId(tenant),
            server: ServerId(1),
            read_pool: PoolId(pool),
            write_pool: PoolId(pool),
            schema: Namespace::new(schema.to_string()).unwrap(),
        }
    }

    #[test]
    fn resolve_caches_until_invalidated() {
        let store = Arc::new(SwappableStore::new(vec![assignment(42, 7, "s1")]));
        let directory = SchemaDirectory::new(&logger::discard(), store.clone());

        let resolved = directory.resolve(TenantId(42)).unwrap();
        assert_eq!(resolved.write_pool, PoolId(7));
        assert_eq!(resolved.schema.as_str(), "s1");

        // The topology moves the tenant, but the cache still answers
        store.swap(vec![assignment(42, 9, "s2")]);
        let resolved = directory.resolve(TenantId(42)).unwrap();
        assert_eq!(resolved.write_pool, PoolId(7));

        // After invalidation the new assignment is visible
        directory.invalidate(&[TenantId(42)]);
        let resolved = directory.resolve(TenantId(42)).unwrap();
        assert_eq!(resolved.write_pool, PoolId(9));
        assert_eq!(resolved.schema.as_str(), "s2");
    }

    #[test]
    fn unknown_tenants_are_reported_as_such() {
        let store = Arc::new(SwappableStore::new(vec![]));
        let directory = SchemaDirectory::new(&logger::discard(), store);

        match directory.resolve(TenantId(3)) {
            Err(StoreError::TenantNotFound(tenant)) => assert_eq!(tenant, TenantId(3)),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn resolve_by_schema_finds_the_same_assignment() {
        let store = Arc::new(SwappableStore::new(vec![
            assignment(1, 7, "s1"),
            assignment(2, 9, "s2"),
        ]));
        let directory = SchemaDirectory::new(&logger::discard(), store);

        let schema = Namespace::new("s2".to_string()).unwrap();
        let by_schema = directory.resolve_by_schema(&schema).unwrap();
        assert_eq!(by_schema.tenant, TenantId(2));

        let by_tenant = directory.resolve(TenantId(2)).unwrap();
        assert_eq!(by_tenant, by_schema);
    }

    #[test]
    fn reload_replaces_the_whole_cache() {
        let store = Arc::new(SwappableStore::new(vec![assignment(1, 7, "s1")]));
        let directory = SchemaDirectory::new(&logger::discard(), store.clone());
        directory.resolve(TenantId(1)).unwrap();

        store.swap(vec![assignment(1, 9, "s2"), assignment(2, 9, "s3")]);
        directory.reload().unwrap();

        assert_eq!(directory.resolve(TenantId(1)).unwrap().write_pool, PoolId(9));
        assert_eq!(directory.resolve(TenantId(2)).unwrap().schema.as_str(), "s3");
    }
}
