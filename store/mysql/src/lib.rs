//! Multi-tenant database routing and replication-aware connection pooling
//! for MySQL.
//!
//! The crate maps a logical tenant to a physical database server and
//! schema, hands out pooled connections honoring read/write and timeout
//! policies, tracks master/replica transaction counters per data partition
//! so reads can safely go to a replica, and retries transactions that fail
//! with transient serialization conflicts.

use std::fmt;

pub mod broker;
pub mod catalog;
pub mod config;
pub mod directory;
mod env_vars;
pub mod error;
pub mod logger;
pub mod metrics;
pub mod pool;
pub mod provision;
pub mod replication;
pub mod txn;
pub mod util;

pub use broker::{ConnectionBroker, ConnectionLease, LeaseListener, Purpose};
pub use config::Topology;
pub use directory::{Assignment, SchemaDirectory, TopologyStore};
pub use env_vars::{EnvVars, ENV_VARS};
pub use error::StoreError;
pub use metrics::MetricsRegistry;
pub use pool::{ConnectionPool, PoolRegistry, PoolRole};
pub use provision::{CreateStatement, DbObject, ObjectKind, ProvisioningUnit};
pub use replication::{ReplicaState, ReplicationMonitor};
pub use txn::{RetryingExecutor, TransactionControl};

/// The id of a logical tenant. Each tenant's data lives in exactly one
/// schema at a time; the mapping is resolved through the
/// [`SchemaDirectory`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TenantId(pub u32);

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The id of one database endpoint and its connection pools. Read and
/// write endpoints of a replicated server carry distinct pool ids.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct PoolId(pub u32);

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The id of a physical database server, grouping the read and write
/// pools that point at it.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ServerId(pub u32);

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An application-chosen subdivision of a schema used to scope
/// replication-lag tracking. Partition `0` conventionally means "the whole
/// schema"; the monitor itself assumes nothing about partition semantics
/// beyond identity.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct PartitionId(pub i64);

impl PartitionId {
    /// The conventional partition covering the whole schema.
    pub const WHOLE_SCHEMA: PartitionId = PartitionId(0);
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The name of a database schema; valid names must match `[a-z0-9_]+` and
/// be no longer than 64 characters. Since namespaces get interpolated into
/// `use` and DDL statements, restricting them is how we keep those
/// statements well-formed.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Namespace(String);

impl Namespace {
    pub fn new(name: String) -> Result<Self, StoreError> {
        if name.is_empty() {
            return Err(StoreError::InvalidIdentifier(
                "schema names must not be empty".to_string(),
            ));
        }
        if name.len() > 64 {
            return Err(StoreError::InvalidIdentifier(format!(
                "schema names can be at most 64 characters, but `{}` has {} characters",
                name,
                name.len()
            )));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(StoreError::InvalidIdentifier(format!(
                "schema name `{}` may only contain lowercase alphanumeric characters or '_'",
                name
            )));
        }
        Ok(Namespace(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}
