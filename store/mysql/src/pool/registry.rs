//! The set of all connection pools, keyed by pool id. The registry is an
//! explicitly constructed value: built once from the topology at process
//! start, passed to whoever needs it, and dropped at shutdown. Tests can
//! construct isolated registries of their own.

use std::collections::HashMap;

use slog::{info, o, warn, Logger};

use crate::broker::Purpose;
use crate::config::Topology;
use crate::metrics::MetricsRegistry;
use crate::{PoolId, StoreError};

use super::{ConnectionPool, PoolRole, PooledMysqlConnection};

pub struct PoolRegistry {
    logger: Logger,
    pools: HashMap<PoolId, ConnectionPool>,
}

impl PoolRegistry {
    /// Create one pool per server entry in the topology. Construction
    /// never waits on the network; connections are established in the
    /// background and on demand.
    pub fn from_topology(
        logger: &Logger,
        topology: &Topology,
        registry: &MetricsRegistry,
    ) -> Self {
        let logger = logger.new(o!("component" => "PoolRegistry"));
        let mut pools = HashMap::new();
        for server in &topology.servers {
            let id = PoolId(server.pool);
            let role = if server.replica {
                PoolRole::Replica
            } else {
                PoolRole::Main
            };
            let pool = ConnectionPool::create(
                id,
                role,
                server.connection.clone(),
                server.pool_size,
                &logger,
                registry,
            );
            info!(logger, "created connection pool";
                  "pool" => %id, "role" => role.as_str(), "size" => server.pool_size);
            pools.insert(id, pool);
        }
        Self { logger, pools }
    }

    pub fn get(&self, pool: PoolId) -> Result<&ConnectionPool, StoreError> {
        self.pools.get(&pool).ok_or(StoreError::UnknownPool(pool))
    }

    /// Get a raw connection from the pool `pool` for the given purpose.
    /// Write purposes are refused on replica pools; the no-timeout purpose
    /// draws from the separate no-timeout pool, never from the main one.
    pub fn acquire(
        &self,
        pool: PoolId,
        purpose: Purpose,
    ) -> Result<PooledMysqlConnection, StoreError> {
        let pool = self.get(pool)?;
        match purpose {
            Purpose::Read => pool.get(),
            Purpose::Write | Purpose::WriteNoTimeout if pool.role().is_replica() => {
                Err(crate::internal_error!(
                    "pool {} is a replica and cannot serve writes",
                    pool.id()
                ))
            }
            Purpose::Write => pool.get(),
            Purpose::WriteNoTimeout => pool.get_no_timeout(),
        }
    }

    pub fn pools(&self) -> impl Iterator<Item = &ConnectionPool> {
        self.pools.values()
    }

    /// Probe every pool once and log the result; meant to be called at
    /// startup so a misconfigured endpoint is visible before the first
    /// tenant request hits it.
    pub fn check_all(&self) -> bool {
        let mut ok = true;
        for pool in self.pools.values() {
            if !pool.check() {
                warn!(self.logger, "database is not reachable"; "pool" => %pool.id());
                ok = false;
            }
        }
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger;

    fn registry() -> PoolRegistry {
        let topology = Topology::from_toml(
            r#"
            [[server]]
            pool = 7
            server = 1
            connection = "mysql://writer@db1/"

            [[server]]
            pool = 8
            server = 1
            connection = "mysql://reader@db1-replica/"
            replica = true
            "#,
        )
        .unwrap();
        PoolRegistry::from_topology(&logger::discard(), &topology, &MetricsRegistry::new())
    }

    #[test]
    fn unknown_pools_are_reported_not_a_crash() {
        let registry = registry();
        match registry.get(PoolId(99)) {
            Err(StoreError::UnknownPool(pool)) => assert_eq!(pool, PoolId(99)),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn writes_are_refused_on_replica_pools() {
        let registry = registry();
        for purpose in [Purpose::Write, Purpose::WriteNoTimeout] {
            match registry.acquire(PoolId(8), purpose) {
                Err(StoreError::InternalError(msg)) => {
                    assert!(msg.contains("replica"), "{}", msg)
                }
                Err(e) => panic!("unexpected error: {:?}", e),
                Ok(_) => panic!("acquired a write connection from a replica"),
            }
        }
    }

    #[test]
    fn roles_follow_the_topology() {
        let registry = registry();
        assert_eq!(registry.get(PoolId(7)).unwrap().role(), PoolRole::Main);
        assert_eq!(registry.get(PoolId(8)).unwrap().role(), PoolRole::Replica);
        assert_eq!(registry.pools().count(), 2);
    }
}
