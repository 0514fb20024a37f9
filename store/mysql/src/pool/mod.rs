//! Connection pools for one database endpoint.
//!
//! Every endpoint gets a bounded main pool for ordinary work and, on
//! write-capable endpoints, a small separate pool for no-timeout
//! connections. No-timeout connections are exempt from idle and lifetime
//! eviction; they are reserved for schema provisioning and long
//! migrations and must be requested explicitly.

use std::collections::HashMap;
use std::fmt;

use diesel::mysql::MysqlConnection;
use diesel::r2d2::{Builder, ConnectionManager, Pool, PooledConnection};
use diesel::{sql_query, RunQueryDsl};
use slog::{error, o, Logger};

use crate::internal_error;
use crate::metrics::MetricsRegistry;
use crate::{PoolId, StoreError, ENV_VARS};

mod registry;
mod state_tracker;

pub use registry::PoolRegistry;
use state_tracker::{ErrorHandler, EventHandler, StateTracker};

pub type PooledMysqlConnection = PooledConnection<ConnectionManager<MysqlConnection>>;

/// What an endpoint may be used for. The main endpoint of a server can be
/// used for reading and writing; replica endpoints only serve reads and
/// never get a no-timeout pool.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PoolRole {
    Main,
    Replica,
}

impl PoolRole {
    fn as_str(&self) -> &'static str {
        match self {
            PoolRole::Main => "main",
            PoolRole::Replica => "replica",
        }
    }

    pub fn is_replica(&self) -> bool {
        matches!(self, PoolRole::Replica)
    }
}

/// The pools for one database endpoint.
#[derive(Clone)]
pub struct ConnectionPool {
    logger: Logger,
    id: PoolId,
    role: PoolRole,
    pool: Pool<ConnectionManager<MysqlConnection>>,
    no_timeout_pool: Option<Pool<ConnectionManager<MysqlConnection>>>,
    state_tracker: StateTracker,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("id", &self.id)
            .field("role", &self.role)
            .finish()
    }
}

impl ConnectionPool {
    pub(crate) fn create(
        id: PoolId,
        role: PoolRole,
        connection_url: String,
        pool_size: u32,
        logger: &Logger,
        registry: &MetricsRegistry,
    ) -> ConnectionPool {
        let logger_pool = logger.new(o!("component" => "ConnectionPool", "pool" => id.to_string()));
        let const_labels = {
            let mut map = HashMap::new();
            map.insert("pool".to_owned(), id.to_string());
            map.insert("role".to_owned(), role.as_str().to_owned());
            map
        };
        let error_counter = registry
            .global_counter(
                "store_connection_error_count",
                "The number of MySQL connection errors",
                const_labels.clone(),
            )
            .expect("failed to create `store_connection_error_count` counter");
        let state_tracker = StateTracker::new();
        let error_handler = Box::new(ErrorHandler::new(
            logger_pool.clone(),
            error_counter,
            state_tracker.clone(),
        ));
        let event_handler = Box::new(EventHandler::new(
            logger_pool.clone(),
            registry,
            const_labels,
            state_tracker.clone(),
        ));

        let conn_manager = ConnectionManager::new(connection_url.clone());
        let builder: Builder<ConnectionManager<MysqlConnection>> = Pool::builder()
            .error_handler(error_handler.clone())
            .event_handler(event_handler.clone())
            .connection_timeout(ENV_VARS.connection_timeout())
            .max_size(pool_size)
            .min_idle(ENV_VARS.connection_min_idle())
            .idle_timeout(Some(ENV_VARS.connection_idle_timeout()))
            .max_lifetime(Some(ENV_VARS.connection_max_lifetime()));
        let pool = builder.build_unchecked(conn_manager);

        // Replicas never serve provisioning or migrations, so only main
        // endpoints carry a no-timeout pool
        let no_timeout_pool = match role {
            PoolRole::Main => {
                let conn_manager = ConnectionManager::new(connection_url);
                let builder: Builder<ConnectionManager<MysqlConnection>> = Pool::builder()
                    .error_handler(error_handler)
                    .event_handler(event_handler)
                    .connection_timeout(ENV_VARS.connection_timeout())
                    .max_size(ENV_VARS.no_timeout_pool_size())
                    .min_idle(Some(1))
                    .idle_timeout(None)
                    .max_lifetime(None);
                Some(builder.build_unchecked(conn_manager))
            }
            PoolRole::Replica => None,
        };

        ConnectionPool {
            logger: logger_pool,
            id,
            role,
            pool,
            no_timeout_pool,
            state_tracker,
        }
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    pub fn role(&self) -> PoolRole {
        self.role
    }

    /// Get a connection with the ordinary lease policy. Fails fast with
    /// `DatabaseUnavailable` while the endpoint is known to be down and
    /// with `PoolExhausted` when no connection frees up within the
    /// checkout timeout.
    pub fn get(&self) -> Result<PooledMysqlConnection, StoreError> {
        if !self.state_tracker.is_available() {
            return Err(StoreError::DatabaseUnavailable);
        }
        match self.pool.get() {
            Ok(conn) => {
                self.state_tracker.mark_available();
                Ok(conn)
            }
            Err(_) if self.state_tracker.is_available() => Err(StoreError::PoolExhausted(self.id)),
            Err(_) => Err(StoreError::DatabaseUnavailable),
        }
    }

    /// Get a connection that is exempt from idle and lifetime eviction.
    /// It is an error to ask a replica for one.
    pub fn get_no_timeout(&self) -> Result<PooledMysqlConnection, StoreError> {
        let pool = match &self.no_timeout_pool {
            Some(pool) => pool,
            None => {
                const MSG: &str = "trying to get a no-timeout connection on a replica pool";
                error!(self.logger, "{}", MSG);
                return Err(internal_error!("{}: {}", MSG, self.id));
            }
        };
        if !self.state_tracker.is_available() {
            return Err(StoreError::DatabaseUnavailable);
        }
        match pool.get() {
            Ok(conn) => {
                self.state_tracker.mark_available();
                Ok(conn)
            }
            Err(_) if self.state_tracker.is_available() => Err(StoreError::PoolExhausted(self.id)),
            Err(_) => Err(StoreError::DatabaseUnavailable),
        }
    }

    /// Check that we can connect to the database
    pub fn check(&self) -> bool {
        self.pool
            .get()
            .ok()
            .map(|mut conn| sql_query("select 1").execute(&mut conn).is_ok())
            .unwrap_or(false)
    }

}
