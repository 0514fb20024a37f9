//! Detection of replication lag, per data partition.
//!
//! Every schema carries a `replication_monitor` table with one counter row
//! per partition. Monitored writes increment the counter of the partition
//! they touched and remember the new value in process memory; monitored
//! reads compare the counter visible through the read endpoint against
//! that remembered value. A replica that has not caught up yet is never
//! used for a monitored read; the broker transparently re-acquires from
//! the writer instead. That fallback is a functional degradation, not an
//! error, and is observable through a counter metric.
//!
//! The guarantee is read-after-write for the same process and partition,
//! nothing more. The monitor may over-fetch from the writer, but it never
//! lets a stale reader believe it is synced.

use std::collections::HashMap;
use std::sync::RwLock;

use diesel::connection::SimpleConnection;
use diesel::mysql::MysqlConnection;
use diesel::sql_types::BigInt;
use diesel::{sql_query, QueryableByName, RunQueryDsl};
use prometheus::Counter;
use slog::{debug, o, warn, Logger};

use crate::metrics::MetricsRegistry;
use crate::{Namespace, PartitionId, PoolId, StoreError};

/// What we know about a replica's view of one partition.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReplicaState {
    /// No write to the partition is known to this process; the replica
    /// cannot be behind anything we care about
    Unknown,
    /// The replica has applied the last write this process performed
    Synced,
    /// The replica is behind; reads must go to the writer
    Stale,
}

impl ReplicaState {
    pub fn serve_replica(&self) -> bool {
        matches!(self, ReplicaState::Unknown | ReplicaState::Synced)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicaState::Unknown => "unknown",
            ReplicaState::Synced => "synced",
            ReplicaState::Stale => "stale",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
struct MonitorKey {
    pool: PoolId,
    schema: Namespace,
    partition: PartitionId,
}

#[derive(QueryableByName)]
struct CounterRow {
    #[diesel(sql_type = BigInt)]
    txn_count: i64,
}

pub struct ReplicationMonitor {
    logger: Logger,
    /// The highest counter value this process has written, per partition.
    /// Values only ever go up; concurrent writers merge with `max` so a
    /// slow thread cannot regress what a faster one recorded.
    last_written: RwLock<HashMap<MonitorKey, i64>>,
    fallback_counter: Counter,
}

impl ReplicationMonitor {
    pub fn new(logger: &Logger, registry: &MetricsRegistry) -> Self {
        let logger = logger.new(o!("component" => "ReplicationMonitor"));
        let fallback_counter = registry
            .global_counter(
                "store_replication_fallback_count",
                "The number of monitored reads served by the writer because the replica lagged",
                HashMap::new(),
            )
            .expect("failed to create `store_replication_fallback_count` counter");
        Self {
            logger,
            last_written: RwLock::new(HashMap::new()),
            fallback_counter,
        }
    }

    /// Idempotently create the counter table in the schema `conn` is
    /// currently using.
    pub fn init_monitoring_tables(&self, conn: &mut MysqlConnection) -> Result<(), StoreError> {
        conn.batch_execute(
            "create table if not exists replication_monitor (
                 partition_id bigint not null primary key,
                 txn_count bigint not null default 0
             )",
        )?;
        Ok(())
    }

    /// Idempotently seed counter rows for `partitions`. Seeding an
    /// existing partition never resets its counter.
    pub fn init_partitions(
        &self,
        conn: &mut MysqlConnection,
        partitions: &[PartitionId],
    ) -> Result<(), StoreError> {
        for partition in partitions {
            sql_query(
                "insert ignore into replication_monitor (partition_id, txn_count) values (?, 0)",
            )
            .bind::<BigInt, _>(partition.0)
            .execute(conn)?;
        }
        Ok(())
    }

    /// Decide whether a replica read for `partition` is safe, by comparing
    /// the counter visible through `conn` (a connection to the *read*
    /// endpoint) with the last value this process wrote.
    pub(crate) fn replica_state(
        &self,
        conn: &mut MysqlConnection,
        write_pool: PoolId,
        schema: &Namespace,
        partition: PartitionId,
    ) -> Result<ReplicaState, StoreError> {
        let expected = self.last_written(write_pool, schema, partition);
        if expected.is_none() {
            return Ok(ReplicaState::Unknown);
        }
        let seen = read_counter(conn, partition)?;
        Ok(decide(expected, seen))
    }

    /// Count a read that had to go to the writer.
    pub(crate) fn record_fallback(
        &self,
        write_pool: PoolId,
        schema: &Namespace,
        partition: PartitionId,
    ) {
        self.fallback_counter.inc();
        debug!(self.logger, "replica lagging, read served by writer";
               "write_pool" => %write_pool,
               "schema" => %schema,
               "partition" => %partition);
    }

    /// Bump the persisted counter after a monitored write transaction has
    /// committed, and remember the new value. `conn` must be the write
    /// connection, back in autocommit mode.
    pub(crate) fn record_write(
        &self,
        conn: &mut MysqlConnection,
        write_pool: PoolId,
        schema: &Namespace,
        partition: PartitionId,
    ) -> Result<(), StoreError> {
        let updated = sql_query(
            "update replication_monitor set txn_count = txn_count + 1 where partition_id = ?",
        )
        .bind::<BigInt, _>(partition.0)
        .execute(conn)?;
        if updated == 0 {
            warn!(self.logger, "partition is not seeded for replication monitoring";
                  "write_pool" => %write_pool,
                  "schema" => %schema,
                  "partition" => %partition);
            return Ok(());
        }
        match read_counter(conn, partition)? {
            Some(value) => self.note_write(write_pool, schema, partition, value),
            None => {
                // The row was there for the update; losing it now means
                // somebody dropped it concurrently
                warn!(self.logger, "replication counter disappeared";
                      "schema" => %schema, "partition" => %partition);
            }
        }
        Ok(())
    }

    /// After a failed counter bump we no longer know whether the replica
    /// can prove it has seen our write, so raise the expectation by one;
    /// reads fall back to the writer until the persisted counter catches
    /// up again.
    pub(crate) fn assume_write(
        &self,
        write_pool: PoolId,
        schema: &Namespace,
        partition: PartitionId,
    ) {
        let key = MonitorKey {
            pool: write_pool,
            schema: schema.clone(),
            partition,
        };
        let mut map = self.last_written.write().unwrap();
        *map.entry(key).or_insert(0) += 1;
    }

    fn note_write(
        &self,
        write_pool: PoolId,
        schema: &Namespace,
        partition: PartitionId,
        value: i64,
    ) {
        let key = MonitorKey {
            pool: write_pool,
            schema: schema.clone(),
            partition,
        };
        let mut map = self.last_written.write().unwrap();
        let entry = map.entry(key).or_insert(value);
        if *entry < value {
            *entry = value;
        }
    }

    fn last_written(
        &self,
        write_pool: PoolId,
        schema: &Namespace,
        partition: PartitionId,
    ) -> Option<i64> {
        let key = MonitorKey {
            pool: write_pool,
            schema: schema.clone(),
            partition,
        };
        self.last_written.read().unwrap().get(&key).copied()
    }
}

fn read_counter(
    conn: &mut MysqlConnection,
    partition: PartitionId,
) -> Result<Option<i64>, StoreError> {
    let rows = sql_query("select txn_count from replication_monitor where partition_id = ?")
        .bind::<BigInt, _>(partition.0)
        .load::<CounterRow>(conn)?;
    Ok(rows.first().map(|row| row.txn_count))
}

/// The core comparison: a replica is only trusted when its visible counter
/// has reached the last value this process wrote for the partition.
fn decide(last_written: Option<i64>, seen: Option<i64>) -> ReplicaState {
    match (last_written, seen) {
        (None, _) => ReplicaState::Unknown,
        (Some(_), None) => ReplicaState::Stale,
        (Some(expected), Some(seen)) => {
            if seen >= expected {
                ReplicaState::Synced
            } else {
                ReplicaState::Stale
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger;

    fn monitor() -> ReplicationMonitor {
        ReplicationMonitor::new(&logger::discard(), &MetricsRegistry::new())
    }

    fn schema() -> Namespace {
        Namespace::new("tenant_1".to_string()).unwrap()
    }

    #[test]
    fn unknown_partitions_may_read_from_the_replica() {
        assert_eq!(decide(None, None), ReplicaState::Unknown);
        assert_eq!(decide(None, Some(5)), ReplicaState::Unknown);
        assert!(decide(None, None).serve_replica());
    }

    #[test]
    fn a_lagging_or_missing_counter_is_stale() {
        assert_eq!(decide(Some(3), Some(2)), ReplicaState::Stale);
        assert_eq!(decide(Some(3), None), ReplicaState::Stale);
        assert!(!decide(Some(3), Some(2)).serve_replica());
    }

    #[test]
    fn a_caught_up_replica_is_synced() {
        assert_eq!(decide(Some(3), Some(3)), ReplicaState::Synced);
        assert_eq!(decide(Some(3), Some(7)), ReplicaState::Synced);
    }

    #[test]
    fn remembered_counters_never_regress() {
        let monitor = monitor();
        let schema = schema();
        let (pool, partition) = (PoolId(7), PartitionId(0));

        monitor.note_write(pool, &schema, partition, 5);
        // A slower thread reporting an older value must not win
        monitor.note_write(pool, &schema, partition, 3);
        assert_eq!(monitor.last_written(pool, &schema, partition), Some(5));

        monitor.note_write(pool, &schema, partition, 8);
        assert_eq!(monitor.last_written(pool, &schema, partition), Some(8));
    }

    #[test]
    fn partitions_are_tracked_independently() {
        let monitor = monitor();
        let schema = schema();
        monitor.note_write(PoolId(7), &schema, PartitionId(0), 4);
        monitor.note_write(PoolId(7), &schema, PartitionId(1), 9);

        assert_eq!(
            monitor.last_written(PoolId(7), &schema, PartitionId(0)),
            Some(4)
        );
        assert_eq!(
            monitor.last_written(PoolId(7), &schema, PartitionId(1)),
            Some(9)
        );
        assert_eq!(monitor.last_written(PoolId(9), &schema, PartitionId(0)), None);
    }

    #[test]
    fn assumed_writes_force_the_writer_until_proven_synced() {
        let monitor = monitor();
        let schema = schema();
        let (pool, partition) = (PoolId(7), PartitionId(0));

        monitor.note_write(pool, &schema, partition, 2);
        monitor.assume_write(pool, &schema, partition);
        assert_eq!(monitor.last_written(pool, &schema, partition), Some(3));
        // A replica that has only seen the persisted value stays stale
        assert_eq!(decide(Some(3), Some(2)), ReplicaState::Stale);
    }
}
