//! The façade callers go through to get and return database connections.
//!
//! The broker combines the schema directory, the pool registry and the
//! replication monitor: given a tenant (or an explicit pool and schema) it
//! hands out a [`ConnectionLease`] with the schema already selected and
//! the right timeout policy applied, and takes the lease back into the
//! correct pool on release. Monitored acquisitions additionally consult
//! the replication monitor so reads never see stale replica data after a
//! write from the same process.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use diesel::connection::SimpleConnection;
use diesel::mysql::MysqlConnection;
use prometheus::CounterVec;
use slog::{debug, o, warn, Logger};

use crate::directory::SchemaDirectory;
use crate::error::StoreError;
use crate::metrics::MetricsRegistry;
use crate::pool::{PoolRegistry, PooledMysqlConnection};
use crate::provision::{self, ProvisioningUnit};
use crate::replication::ReplicationMonitor;
use crate::txn::{RetryingExecutor, TransactionControl};
use crate::{Namespace, PartitionId, PoolId, TenantId, ENV_VARS};

/// What a connection is borrowed for. The purpose decides which pool
/// serves the acquisition and what lease policy applies; it is fixed at
/// acquisition time and drives the bookkeeping on release.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Purpose {
    Read,
    Write,
    /// Writable and exempt from idle/lifetime eviction; reserved for
    /// schema provisioning and long migrations, never the default
    WriteNoTimeout,
}

impl Purpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Purpose::Read => "read",
            Purpose::Write => "write",
            Purpose::WriteNoTimeout => "write-no-timeout",
        }
    }
}

/// Hooks observing the transaction-state changes of one lease. Invoked
/// synchronously in registration order; a failing listener is logged and
/// never interrupts the operation it observed.
pub trait LeaseListener: Send {
    fn on_commit(&self) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn on_rollback(&self) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn on_autocommit_change(&self, _autocommit: bool) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

#[derive(Copy, Clone, Debug)]
enum LeaseKind {
    Plain(Purpose),
    MonitoredRead {
        write_pool: PoolId,
        partition: PartitionId,
        /// `true` when the replica was lagging and the read was served by
        /// the writer instead
        on_writer: bool,
    },
    MonitoredWrite {
        partition: PartitionId,
    },
}

impl LeaseKind {
    fn as_str(&self) -> &'static str {
        match self {
            LeaseKind::Plain(purpose) => purpose.as_str(),
            LeaseKind::MonitoredRead { on_writer: false, .. } => "monitored-read",
            LeaseKind::MonitoredRead { on_writer: true, .. } => "monitored-read-on-writer",
            LeaseKind::MonitoredWrite { .. } => "monitored-write",
        }
    }

    fn exempt_from_lease_timeout(&self) -> bool {
        matches!(self, LeaseKind::Plain(Purpose::WriteNoTimeout))
    }
}

/// A borrowed physical connection together with what it was borrowed for.
/// Dropping the lease returns the connection to its pool in any case, but
/// callers are expected to go through the broker's `back_*` methods, which
/// perform the purpose-specific bookkeeping; a lease that is simply
/// dropped is logged as an anomaly.
///
/// The lease derefs to the underlying [`MysqlConnection`], so diesel
/// queries run on it directly.
pub struct ConnectionLease {
    logger: Logger,
    conn: Option<PooledMysqlConnection>,
    pool: PoolId,
    schema: Namespace,
    kind: LeaseKind,
    acquired: Instant,
    holder: String,
    autocommit: bool,
    released: bool,
    listeners: Vec<Box<dyn LeaseListener>>,
}

impl fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("pool", &self.pool)
            .field("schema", &self.schema)
            .field("kind", &self.kind.as_str())
            .field("holder", &self.holder)
            .finish()
    }
}

impl ConnectionLease {
    fn new(
        logger: &Logger,
        conn: PooledMysqlConnection,
        pool: PoolId,
        schema: Namespace,
        kind: LeaseKind,
    ) -> Self {
        let holder = std::thread::current()
            .name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{:?}", std::thread::current().id()));
        let logger = logger.new(o!("pool" => pool.to_string(), "schema" => schema.to_string()));
        ConnectionLease {
            logger,
            conn: Some(conn),
            pool,
            schema,
            kind,
            acquired: Instant::now(),
            holder,
            autocommit: true,
            released: false,
            listeners: Vec::new(),
        }
    }

    pub fn pool(&self) -> PoolId {
        self.pool
    }

    pub fn schema(&self) -> &Namespace {
        &self.schema
    }

    /// Attach a listener; listeners fire in the order they were added.
    pub fn add_listener(&mut self, listener: Box<dyn LeaseListener>) {
        self.listeners.push(listener);
    }

    fn conn_mut(&mut self) -> &mut MysqlConnection {
        self.conn
            .as_mut()
            .expect("a lease holds its connection until it is released")
    }

    /// Bind the session to the lease's schema. Everything the caller runs
    /// on this connection happens inside that schema.
    fn select_schema(&mut self) -> Result<(), StoreError> {
        let stmt = format!("use `{}`", self.schema);
        let schema = self.schema.clone();
        self.conn_mut()
            .batch_execute(&stmt)
            .map_err(|e| StoreError::SchemaSelection {
                schema,
                message: e.to_string(),
            })
    }

    fn notify<F>(&self, f: F)
    where
        F: Fn(&dyn LeaseListener) -> Result<(), anyhow::Error>,
    {
        for listener in &self.listeners {
            if let Err(e) = f(listener.as_ref()) {
                warn!(self.logger, "lease listener failed"; "error" => %e);
            }
        }
    }

    /// Put the connection back into its default state before it returns
    /// to the pool: roll back anything the holder left open and restore
    /// autocommit. Never fails; a connection this cannot be done to is
    /// left for the pool's checkout test to weed out.
    fn reset(&mut self) {
        let age = self.acquired.elapsed();
        if !self.kind.exempt_from_lease_timeout() && age > ENV_VARS.max_lease_duration() {
            warn!(self.logger, "connection lease was held too long";
                  "holder" => &self.holder,
                  "purpose" => self.kind.as_str(),
                  "age_ms" => age.as_millis() as u64);
        }
        if !self.autocommit {
            warn!(self.logger, "connection returned with an open transaction, rolling back";
                  "holder" => &self.holder);
            let rollback = self
                .conn_mut()
                .batch_execute("rollback; set autocommit=1");
            match rollback {
                Ok(()) => {
                    self.autocommit = true;
                    self.notify(|l| l.on_rollback());
                    self.notify(|l| l.on_autocommit_change(true));
                }
                Err(e) => {
                    warn!(self.logger, "resetting returned connection failed"; "error" => %e);
                }
            }
        }
    }

    /// Hand the connection back to r2d2.
    fn finish(mut self) {
        self.released = true;
        self.conn.take();
    }
}

impl std::ops::Deref for ConnectionLease {
    type Target = MysqlConnection;

    fn deref(&self) -> &MysqlConnection {
        self.conn
            .as_deref()
            .expect("a lease holds its connection until it is released")
    }
}

impl std::ops::DerefMut for ConnectionLease {
    fn deref_mut(&mut self) -> &mut MysqlConnection {
        self.conn
            .as_deref_mut()
            .expect("a lease holds its connection until it is released")
    }
}

impl TransactionControl for ConnectionLease {
    fn autocommit(&self) -> bool {
        self.autocommit
    }

    fn set_autocommit(&mut self, on: bool) -> Result<(), StoreError> {
        if self.autocommit == on {
            return Ok(());
        }
        let stmt = if on {
            "set autocommit=1"
        } else {
            "set autocommit=0"
        };
        self.conn_mut().batch_execute(stmt)?;
        self.autocommit = on;
        self.notify(|l| l.on_autocommit_change(on));
        Ok(())
    }

    fn begin(&mut self) -> Result<(), StoreError> {
        self.conn_mut().batch_execute("start transaction")?;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.conn_mut().batch_execute("commit")?;
        self.notify(|l| l.on_commit());
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        self.conn_mut().batch_execute("rollback")?;
        self.notify(|l| l.on_rollback());
        Ok(())
    }

    fn savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        self.conn_mut()
            .batch_execute(&format!("savepoint {}", name))?;
        Ok(())
    }

    fn release_savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        self.conn_mut()
            .batch_execute(&format!("release savepoint {}", name))?;
        Ok(())
    }

    fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        self.conn_mut()
            .batch_execute(&format!("rollback to savepoint {}", name))?;
        Ok(())
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Not going through the broker means any monitored-write
        // bookkeeping is lost; all we can do is return a clean connection
        warn!(self.logger, "connection lease dropped without explicit release";
              "holder" => &self.holder,
              "purpose" => self.kind.as_str(),
              "age_ms" => self.acquired.elapsed().as_millis() as u64);
        self.reset();
    }
}

/// The combination of schema directory, pool registry and replication
/// monitor behind one acquisition/release surface.
pub struct ConnectionBroker {
    logger: Logger,
    directory: Arc<SchemaDirectory>,
    pools: Arc<PoolRegistry>,
    monitor: Arc<ReplicationMonitor>,
    executor: RetryingExecutor,
    error_counter: CounterVec,
}

impl ConnectionBroker {
    pub fn new(
        logger: &Logger,
        directory: Arc<SchemaDirectory>,
        pools: Arc<PoolRegistry>,
        monitor: Arc<ReplicationMonitor>,
        registry: &MetricsRegistry,
    ) -> Self {
        let logger = logger.new(o!("component" => "ConnectionBroker"));
        let executor = RetryingExecutor::new(&logger, registry);
        let error_counter = registry
            .global_counter_vec(
                "store_classified_error_count",
                "Errors surfaced to callers, by classification category",
                &["category"],
            )
            .expect("failed to create `store_classified_error_count` counter");
        Self {
            logger,
            directory,
            pools,
            monitor,
            executor,
            error_counter,
        }
    }

    pub fn directory(&self) -> &SchemaDirectory {
        &self.directory
    }

    /// Count the category of every error this surface reports, so
    /// operators can see what is failing without grepping logs.
    fn track<T>(&self, result: Result<T, StoreError>) -> Result<T, StoreError> {
        if let Err(e) = &result {
            self.error_counter
                .with_label_values(&[e.category()])
                .inc();
        }
        result
    }

    fn acquire_kind(
        &self,
        pool: PoolId,
        schema: &Namespace,
        purpose: Purpose,
        kind: LeaseKind,
    ) -> Result<ConnectionLease, StoreError> {
        let conn = self.pools.acquire(pool, purpose)?;
        let mut lease = ConnectionLease::new(&self.logger, conn, pool, schema.clone(), kind);
        match lease.select_schema() {
            Ok(()) => Ok(lease),
            Err(e) => {
                lease.finish();
                Err(e)
            }
        }
    }

    /// Acquire a connection on an explicit pool with the schema selected.
    pub fn acquire(
        &self,
        pool: PoolId,
        schema: &Namespace,
        purpose: Purpose,
    ) -> Result<ConnectionLease, StoreError> {
        self.track(self.acquire_kind(pool, schema, purpose, LeaseKind::Plain(purpose)))
    }

    /// Acquire from the tenant's read pool.
    pub fn get_read_only(&self, tenant: TenantId) -> Result<ConnectionLease, StoreError> {
        let result = self.directory.resolve(tenant).and_then(|assignment| {
            self.acquire_kind(
                assignment.read_pool,
                &assignment.schema,
                Purpose::Read,
                LeaseKind::Plain(Purpose::Read),
            )
        });
        self.track(result)
    }

    /// Acquire from the tenant's write pool.
    pub fn get_writable(&self, tenant: TenantId) -> Result<ConnectionLease, StoreError> {
        let result = self.directory.resolve(tenant).and_then(|assignment| {
            self.acquire_kind(
                assignment.write_pool,
                &assignment.schema,
                Purpose::Write,
                LeaseKind::Plain(Purpose::Write),
            )
        });
        self.track(result)
    }

    /// Acquire a no-timeout writable connection from the tenant's write
    /// pool, for update tasks and other long-running administrative work.
    pub fn get_for_update_task(&self, tenant: TenantId) -> Result<ConnectionLease, StoreError> {
        let result = self.directory.resolve(tenant).and_then(|assignment| {
            self.acquire_kind(
                assignment.write_pool,
                &assignment.schema,
                Purpose::WriteNoTimeout,
                LeaseKind::Plain(Purpose::WriteNoTimeout),
            )
        });
        self.track(result)
    }

    /// Explicit pool/schema acquisition for administrative flows.
    pub fn get(&self, pool: PoolId, schema: &Namespace) -> Result<ConnectionLease, StoreError> {
        self.acquire(pool, schema, Purpose::Write)
    }

    /// Explicit no-timeout acquisition; see [`Purpose::WriteNoTimeout`].
    pub fn get_no_timeout(
        &self,
        pool: PoolId,
        schema: &Namespace,
    ) -> Result<ConnectionLease, StoreError> {
        self.acquire(pool, schema, Purpose::WriteNoTimeout)
    }

    /// A read that must observe all monitored writes this process has
    /// made to `partition`. Served from the replica when its counter has
    /// caught up, transparently from the writer otherwise.
    pub fn get_read_only_monitored(
        &self,
        read_pool: PoolId,
        write_pool: PoolId,
        schema: &Namespace,
        partition: PartitionId,
    ) -> Result<ConnectionLease, StoreError> {
        let result =
            self.monitored_read(read_pool, write_pool, schema, partition);
        self.track(result)
    }

    fn monitored_read(
        &self,
        read_pool: PoolId,
        write_pool: PoolId,
        schema: &Namespace,
        partition: PartitionId,
    ) -> Result<ConnectionLease, StoreError> {
        let mut lease = self.acquire_kind(
            read_pool,
            schema,
            Purpose::Read,
            LeaseKind::MonitoredRead {
                write_pool,
                partition,
                on_writer: false,
            },
        )?;
        let state = match self
            .monitor
            .replica_state(&mut lease, write_pool, schema, partition)
        {
            Ok(state) => state,
            Err(e) => {
                // If the replica cannot even answer the counter query we
                // must not trust it with the read
                warn!(self.logger, "replica counter check failed, using writer";
                      "schema" => %schema, "partition" => %partition, "error" => %e);
                crate::replication::ReplicaState::Stale
            }
        };
        debug!(self.logger, "monitored read";
               "schema" => %schema,
               "partition" => %partition,
               "replica" => state.as_str());
        if state.serve_replica() {
            return Ok(lease);
        }

        lease.finish();
        self.monitor.record_fallback(write_pool, schema, partition);
        self.acquire_kind(
            write_pool,
            schema,
            Purpose::Read,
            LeaseKind::MonitoredRead {
                write_pool,
                partition,
                on_writer: true,
            },
        )
    }

    /// A write whose commit will be recorded in the replication counters
    /// of `partition` when the lease is returned. `read_pool` identifies
    /// the replica that later monitored reads will be checked against.
    pub fn get_writable_monitored(
        &self,
        read_pool: PoolId,
        write_pool: PoolId,
        schema: &Namespace,
        partition: PartitionId,
    ) -> Result<ConnectionLease, StoreError> {
        debug!(self.logger, "monitored write";
               "schema" => %schema,
               "partition" => %partition,
               "read_pool" => %read_pool);
        let result = self.acquire_kind(
            write_pool,
            schema,
            Purpose::Write,
            LeaseKind::MonitoredWrite { partition },
        );
        self.track(result)
    }

    fn expect_kind(&self, lease: &ConnectionLease, expected: &str) {
        if lease.kind.as_str() != expected {
            warn!(self.logger, "lease returned through the wrong release call";
                  "expected" => expected.to_string(),
                  "actual" => lease.kind.as_str(),
                  "holder" => &lease.holder);
        }
    }

    /// Reset the lease and hand its connection back, performing whatever
    /// bookkeeping its purpose requires. The replication counter of a
    /// monitored write is bumped here, once the write transaction is
    /// over.
    fn finish_lease(&self, mut lease: ConnectionLease) -> Result<(), StoreError> {
        lease.reset();
        if let LeaseKind::MonitoredWrite { partition } = lease.kind {
            let pool = lease.pool;
            let schema = lease.schema.clone();
            if let Err(e) = self
                .monitor
                .record_write(&mut lease, pool, &schema, partition)
            {
                // We could not prove the write to later readers; assume it
                // so monitored reads stay on the writer rather than
                // trusting a replica we can no longer check
                self.monitor.assume_write(pool, &schema, partition);
                lease.finish();
                return self.track(Err(e));
            }
        }
        lease.finish();
        Ok(())
    }

    pub fn back_read_only(&self, lease: ConnectionLease) -> Result<(), StoreError> {
        self.expect_kind(&lease, "read");
        self.finish_lease(lease)
    }

    pub fn back_writable(&self, lease: ConnectionLease) -> Result<(), StoreError> {
        self.expect_kind(&lease, "write");
        self.finish_lease(lease)
    }

    pub fn back_for_update_task(&self, lease: ConnectionLease) -> Result<(), StoreError> {
        self.expect_kind(&lease, "write-no-timeout");
        self.finish_lease(lease)
    }

    /// Release for leases from [`ConnectionBroker::get`] and
    /// [`ConnectionBroker::get_no_timeout`].
    pub fn back(&self, lease: ConnectionLease) -> Result<(), StoreError> {
        self.finish_lease(lease)
    }

    pub fn back_read_only_monitored(&self, lease: ConnectionLease) -> Result<(), StoreError> {
        if !matches!(lease.kind, LeaseKind::MonitoredRead { .. }) {
            self.expect_kind(&lease, "monitored-read");
        }
        self.finish_lease(lease)
    }

    pub fn back_writable_monitored(&self, lease: ConnectionLease) -> Result<(), StoreError> {
        self.expect_kind(&lease, "monitored-write");
        self.finish_lease(lease)
    }

    /// Idempotently set up replication monitoring for `schema` on its
    /// write pool: ensure the counter table exists and seed counter rows
    /// for `partitions`. Re-seeding never resets an existing counter.
    pub fn init_replication_monitoring(
        &self,
        write_pool: PoolId,
        schema: &Namespace,
        partitions: &[PartitionId],
    ) -> Result<(), StoreError> {
        let result = (|| {
            let mut lease = self.acquire_kind(
                write_pool,
                schema,
                Purpose::Write,
                LeaseKind::Plain(Purpose::Write),
            )?;
            self.monitor.init_monitoring_tables(&mut lease)?;
            self.monitor.init_partitions(&mut lease, partitions)?;
            self.finish_lease(lease)
        })();
        self.track(result)
    }

    /// Run `work` transactionally with bounded retries on transient
    /// conflicts; see [`RetryingExecutor::run`].
    pub fn run_with_retry<T, F>(
        &self,
        conn: &mut ConnectionLease,
        max_retries: u32,
        work: F,
    ) -> Result<T, StoreError>
    where
        F: FnMut(&mut ConnectionLease) -> Result<T, StoreError>,
    {
        let result = self.executor.run(conn, max_retries, work);
        self.track(result)
    }

    /// Provision the schema of `tenant`: resolve its assignment, take a
    /// no-timeout connection to its write pool, and run the given units in
    /// dependency order inside one transaction.
    pub fn provision(
        &self,
        tenant: TenantId,
        units: &[&dyn ProvisioningUnit],
    ) -> Result<(), StoreError> {
        let result = self.directory.resolve(tenant).and_then(|assignment| {
            let lease = self.acquire_kind(
                assignment.write_pool,
                &assignment.schema,
                Purpose::WriteNoTimeout,
                LeaseKind::Plain(Purpose::WriteNoTimeout),
            )?;
            self.provision_on(lease, &assignment.schema, units)
        });
        self.track(result)
    }

    fn provision_on(
        &self,
        mut lease: ConnectionLease,
        schema: &Namespace,
        units: &[&dyn ProvisioningUnit],
    ) -> Result<(), StoreError> {
        lease.set_autocommit(false)?;
        lease.begin()?;
        let result = provision::provision(&self.logger, &mut lease, schema, units);
        let result = match result {
            Ok(()) => lease.commit(),
            Err(e) => {
                if let Err(rollback) = lease.rollback() {
                    warn!(self.logger, "rollback after failed provisioning also failed";
                          "error" => %rollback);
                }
                Err(e)
            }
        };
        // The lease goes back through the ordinary release path, which
        // also restores autocommit
        self.finish_lease(lease)?;
        result
    }
}
