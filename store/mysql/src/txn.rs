//! Transactional execution with bounded retries.
//!
//! The executor wraps a unit of work in a transaction and retries it when
//! it fails with a transient conflict (deadlock, lock-wait timeout,
//! serialization failure). On a connection that already has an open
//! transaction, the work runs under a uniquely named savepoint instead, so
//! a conflicted inner attempt only rolls back to the savepoint and the
//! caller's outer transaction survives untouched.
//!
//! The retry decision is a pure match on the error tag; whatever vendor
//! sniffing produced it happened once, in the error classifier. Everything
//! that is not a transient conflict propagates immediately without
//! consuming a retry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use prometheus::Counter;
use slog::{o, warn, Logger};

use crate::metrics::MetricsRegistry;
use crate::util::backoff::RetryBackoff;
use crate::StoreError;

/// The transaction-state operations the executor needs from a connection.
/// Implemented by [`crate::ConnectionLease`]; tests use a recording
/// double.
pub trait TransactionControl {
    /// Whether the session is in its default autocommit state, i.e. has
    /// no open transaction.
    fn autocommit(&self) -> bool;
    fn set_autocommit(&mut self, on: bool) -> Result<(), StoreError>;
    fn begin(&mut self) -> Result<(), StoreError>;
    fn commit(&mut self) -> Result<(), StoreError>;
    fn rollback(&mut self) -> Result<(), StoreError>;
    fn savepoint(&mut self, name: &str) -> Result<(), StoreError>;
    fn release_savepoint(&mut self, name: &str) -> Result<(), StoreError>;
    fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), StoreError>;
}

/// Savepoint names must be unique among the transactions this process has
/// open; a plain process-wide sequence is enough.
static SAVEPOINT_SEQ: AtomicU64 = AtomicU64::new(0);

pub struct RetryingExecutor {
    logger: Logger,
    retry_counter: Counter,
    backoff_base: Duration,
    backoff_jitter: Duration,
}

impl RetryingExecutor {
    /// The wait before retry `n` is `n * BACKOFF_BASE` plus a random
    /// portion of `BACKOFF_JITTER`. Deliberately linear; see
    /// [`RetryBackoff`].
    const BACKOFF_BASE: Duration = Duration::from_millis(1000);
    const BACKOFF_JITTER: Duration = Duration::from_millis(1000);

    pub fn new(logger: &Logger, registry: &MetricsRegistry) -> Self {
        let logger = logger.new(o!("component" => "RetryingExecutor"));
        let retry_counter = registry
            .global_counter(
                "store_transaction_retry_count",
                "The number of transaction attempts retried after a transient conflict",
                Default::default(),
            )
            .expect("failed to create `store_transaction_retry_count` counter");
        Self {
            logger,
            retry_counter,
            backoff_base: Self::BACKOFF_BASE,
            backoff_jitter: Self::BACKOFF_JITTER,
        }
    }

    /// Override the retry wait parameters.
    pub fn with_backoff(mut self, base: Duration, jitter: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_jitter = jitter;
        self
    }

    /// Run `work` transactionally on `conn`, retrying transient conflicts
    /// up to `max_retries` times, so `work` runs at most `max_retries + 1`
    /// times. `work` must be safe to re-invoke: the executor rolls back
    /// the partial effects of a failed attempt before running it again,
    /// but it cannot undo side effects outside the transaction.
    pub fn run<C, T, F>(&self, conn: &mut C, max_retries: u32, work: F) -> Result<T, StoreError>
    where
        C: TransactionControl,
        F: FnMut(&mut C) -> Result<T, StoreError>,
    {
        if conn.autocommit() {
            self.run_fresh(conn, max_retries, work)
        } else {
            self.run_nested(conn, max_retries, work)
        }
    }

    /// The connection has no open transaction: run each attempt in a
    /// transaction of its own and restore autocommit at the end, no
    /// matter how things went.
    fn run_fresh<C, T, F>(
        &self,
        conn: &mut C,
        max_retries: u32,
        mut work: F,
    ) -> Result<T, StoreError>
    where
        C: TransactionControl,
        F: FnMut(&mut C) -> Result<T, StoreError>,
    {
        conn.set_autocommit(false)?;
        let result = self.attempts_fresh(conn, max_retries, &mut work);
        match conn.set_autocommit(true) {
            Ok(()) => result,
            Err(restore) => match result {
                // The work went through but the connection is now in an
                // unknown state; that must not look like success
                Ok(_) => Err(restore),
                Err(first) => {
                    warn!(self.logger, "restoring autocommit after failure also failed";
                          "error" => %restore);
                    Err(first)
                }
            },
        }
    }

    fn attempts_fresh<C, T, F>(
        &self,
        conn: &mut C,
        max_retries: u32,
        work: &mut F,
    ) -> Result<T, StoreError>
    where
        C: TransactionControl,
        F: FnMut(&mut C) -> Result<T, StoreError>,
    {
        let mut backoff = RetryBackoff::new(self.backoff_base, self.backoff_jitter);
        loop {
            conn.begin()?;
            match work(conn).and_then(|value| conn.commit().map(|()| value)) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if let Err(rollback) = conn.rollback() {
                        warn!(self.logger, "rollback after failed attempt also failed";
                              "error" => %rollback);
                        return Err(e);
                    }
                    if !self.should_retry(&e, &backoff, max_retries) {
                        return Err(e);
                    }
                    self.note_retry(&e, &mut backoff);
                }
            }
        }
    }

    /// The connection already has an open transaction: protect each
    /// attempt with a savepoint so a failure only undoes the attempt, not
    /// the caller's outer work.
    fn run_nested<C, T, F>(
        &self,
        conn: &mut C,
        max_retries: u32,
        mut work: F,
    ) -> Result<T, StoreError>
    where
        C: TransactionControl,
        F: FnMut(&mut C) -> Result<T, StoreError>,
    {
        let name = format!("retry_sp_{}", SAVEPOINT_SEQ.fetch_add(1, Ordering::Relaxed));
        let mut backoff = RetryBackoff::new(self.backoff_base, self.backoff_jitter);
        loop {
            conn.savepoint(&name)?;
            match work(conn) {
                Ok(value) => {
                    conn.release_savepoint(&name)?;
                    return Ok(value);
                }
                Err(e) => {
                    if let Err(rollback) = conn.rollback_to_savepoint(&name) {
                        warn!(self.logger, "rollback to savepoint failed";
                              "savepoint" => &name, "error" => %rollback);
                        return Err(e);
                    }
                    if !self.should_retry(&e, &backoff, max_retries) {
                        if let Err(release) = conn.release_savepoint(&name) {
                            warn!(self.logger, "releasing savepoint failed";
                                  "savepoint" => &name, "error" => %release);
                        }
                        return Err(e);
                    }
                    self.note_retry(&e, &mut backoff);
                }
            }
        }
    }

    fn should_retry(&self, e: &StoreError, backoff: &RetryBackoff, max_retries: u32) -> bool {
        e.is_transient() && backoff.attempt < max_retries as u64
    }

    fn note_retry(&self, e: &StoreError, backoff: &mut RetryBackoff) {
        self.retry_counter.inc();
        warn!(self.logger, "retrying conflicted transaction";
              "attempt" => backoff.attempt + 1,
              "error" => %e);
        backoff.sleep();
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::logger;

    fn executor() -> RetryingExecutor {
        RetryingExecutor::new(&logger::discard(), &MetricsRegistry::new())
            .with_backoff(Duration::ZERO, Duration::ZERO)
    }

    fn transient() -> StoreError {
        StoreError::TransientConflict("Deadlock found when trying to get lock".to_string())
    }

    /// Records every transaction-state operation so tests can assert on
    /// the exact sequence.
    struct MockConn {
        autocommit: bool,
        ops: Vec<String>,
    }

    impl MockConn {
        fn fresh() -> Self {
            MockConn {
                autocommit: true,
                ops: Vec::new(),
            }
        }

        fn inside_transaction() -> Self {
            MockConn {
                autocommit: false,
                ops: Vec::new(),
            }
        }

        fn op(&mut self, op: String) -> Result<(), StoreError> {
            self.ops.push(op);
            Ok(())
        }
    }

    impl TransactionControl for MockConn {
        fn autocommit(&self) -> bool {
            self.autocommit
        }

        fn set_autocommit(&mut self, on: bool) -> Result<(), StoreError> {
            self.autocommit = on;
            self.op(format!("autocommit={}", on))
        }

        fn begin(&mut self) -> Result<(), StoreError> {
            self.op("begin".to_string())
        }

        fn commit(&mut self) -> Result<(), StoreError> {
            self.op("commit".to_string())
        }

        fn rollback(&mut self) -> Result<(), StoreError> {
            self.op("rollback".to_string())
        }

        fn savepoint(&mut self, name: &str) -> Result<(), StoreError> {
            self.op(format!("savepoint {}", name))
        }

        fn release_savepoint(&mut self, name: &str) -> Result<(), StoreError> {
            self.op(format!("release {}", name))
        }

        fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), StoreError> {
            self.op(format!("rollback_to {}", name))
        }
    }

    #[test]
    fn work_runs_at_most_max_retries_plus_one_times() {
        for max_retries in [0u32, 3] {
            let mut conn = MockConn::fresh();
            let mut invocations = 0u32;
            let result: Result<(), _> = executor().run(&mut conn, max_retries, |_| {
                invocations += 1;
                Err(transient())
            });
            assert_eq!(invocations, max_retries + 1);
            match result {
                Err(StoreError::TransientConflict(_)) => {}
                other => panic!("unexpected result: {:?}", other),
            }
            // The connection is back in autocommit mode
            assert!(conn.autocommit());
            assert_eq!(conn.ops.last().unwrap(), "autocommit=true");
        }
    }

    #[test]
    fn non_transient_failures_are_not_retried() {
        let mut conn = MockConn::fresh();
        let mut invocations = 0;
        let result: Result<(), _> = executor().run(&mut conn, 3, |_| {
            invocations += 1;
            Err(StoreError::ConstraintViolation {
                key: "PRIMARY".to_string(),
                message: "Duplicate entry '1' for key 'PRIMARY'".to_string(),
            })
        });
        assert_eq!(invocations, 1);
        assert!(matches!(
            result,
            Err(StoreError::ConstraintViolation { .. })
        ));
        // The failed attempt was rolled back and autocommit restored
        assert_eq!(
            conn.ops,
            vec!["autocommit=false", "begin", "rollback", "autocommit=true"]
        );
    }

    #[test]
    fn a_conflict_that_clears_up_eventually_succeeds() {
        let mut conn = MockConn::fresh();
        let mut invocations = 0;
        let result = executor().run(&mut conn, 3, |_| {
            invocations += 1;
            if invocations < 3 {
                Err(transient())
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(invocations, 3);
        assert_eq!(
            conn.ops,
            vec![
                "autocommit=false",
                "begin",
                "rollback",
                "begin",
                "rollback",
                "begin",
                "commit",
                "autocommit=true"
            ]
        );
    }

    #[test]
    fn a_fresh_connection_gets_a_real_transaction() {
        let mut conn = MockConn::fresh();
        executor().run(&mut conn, 0, |_| Ok(())).unwrap();
        assert_eq!(
            conn.ops,
            vec!["autocommit=false", "begin", "commit", "autocommit=true"]
        );
    }

    #[test]
    fn a_nested_call_uses_a_savepoint_and_leaves_the_outer_transaction_alone() {
        let mut conn = MockConn::inside_transaction();
        executor().run(&mut conn, 0, |_| Ok(())).unwrap();

        assert_eq!(conn.ops.len(), 2);
        let name = conn.ops[0].strip_prefix("savepoint ").unwrap().to_string();
        assert_eq!(conn.ops[1], format!("release {}", name));
        // No commit, rollback or autocommit change leaked out
        assert!(!conn.autocommit());
    }

    #[test]
    fn a_conflicted_nested_attempt_rolls_back_to_the_savepoint_only() {
        let mut conn = MockConn::inside_transaction();
        let mut invocations = 0;
        let result = executor().run(&mut conn, 1, |_| {
            invocations += 1;
            if invocations == 1 {
                Err(transient())
            } else {
                Ok(())
            }
        });
        result.unwrap();

        let name = conn.ops[0].strip_prefix("savepoint ").unwrap().to_string();
        assert_eq!(
            conn.ops,
            vec![
                format!("savepoint {}", name),
                format!("rollback_to {}", name),
                format!("savepoint {}", name),
                format!("release {}", name),
            ]
        );
    }

    #[test]
    fn a_failed_nested_call_releases_its_savepoint() {
        let mut conn = MockConn::inside_transaction();
        let result: Result<(), _> = executor().run(&mut conn, 0, |_| {
            Err(StoreError::DatabaseUnavailable)
        });
        assert!(matches!(result, Err(StoreError::DatabaseUnavailable)));

        let name = conn.ops[0].strip_prefix("savepoint ").unwrap().to_string();
        assert_eq!(
            conn.ops,
            vec![
                format!("savepoint {}", name),
                format!("rollback_to {}", name),
                format!("release {}", name),
            ]
        );
    }

    #[test]
    fn savepoint_names_are_unique_per_execution() {
        let mut conn = MockConn::inside_transaction();
        let exec = executor();
        exec.run(&mut conn, 0, |_| Ok(())).unwrap();
        exec.run(&mut conn, 0, |_| Ok(())).unwrap();

        let first = conn.ops[0].clone();
        let second = conn.ops[2].clone();
        assert_ne!(first, second);
    }
}
