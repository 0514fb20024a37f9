//! Availability tracking for connection pools.
//!
//! The r2d2 error and event handlers in this module count connection
//! errors, record checkout waits and keep track of whether the underlying
//! database is reachable. Once a database is marked unavailable,
//! acquisitions fail fast instead of queueing until the checkout timeout;
//! the first successful acquisition marks it available again.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use diesel::r2d2::{self, event as e, HandleEvent};
use prometheus::Counter;
use slog::{error, Logger};

use crate::metrics::MetricsRegistry;

#[derive(Clone)]
pub(super) struct StateTracker {
    available: Arc<AtomicBool>,
}

impl StateTracker {
    pub(super) fn new() -> Self {
        Self {
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    pub(super) fn mark_available(&self) {
        self.available.store(true, Ordering::Relaxed);
    }

    fn mark_unavailable(&self) {
        self.available.store(false, Ordering::Relaxed);
    }

    pub(super) fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }
}

/// Called by r2d2 whenever establishing or checking a connection fails.
#[derive(Clone)]
pub(super) struct ErrorHandler {
    logger: Logger,
    counter: Counter,
    state_tracker: StateTracker,
}

impl ErrorHandler {
    pub(super) fn new(logger: Logger, counter: Counter, state_tracker: StateTracker) -> Self {
        ErrorHandler {
            logger,
            counter,
            state_tracker,
        }
    }
}

impl fmt::Debug for ErrorHandler {
    fn fmt(&self, _f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Result::Ok(())
    }
}

impl r2d2::HandleError<r2d2::Error> for ErrorHandler {
    fn handle_error(&self, error: r2d2::Error) {
        self.counter.inc();
        // Only log the first error after the database went away so an
        // outage does not flood the log
        if self.state_tracker.is_available() {
            error!(self.logger, "connection checkout failed"; "error" => %error);
        }
        self.state_tracker.mark_unavailable();
    }
}

/// Called by r2d2 on pool lifecycle events; keeps the checkout gauge and
/// wait-time accounting up to date.
#[derive(Clone)]
pub(super) struct EventHandler {
    logger: Logger,
    checkout_gauge: prometheus::Gauge,
    wait_ms_counter: Counter,
    exhausted_counter: Counter,
    state_tracker: StateTracker,
}

impl EventHandler {
    pub(super) fn new(
        logger: Logger,
        registry: &MetricsRegistry,
        const_labels: HashMap<String, String>,
        state_tracker: StateTracker,
    ) -> Self {
        let checkout_gauge = registry
            .global_gauge(
                "store_connection_checkout_count",
                "The number of connections currently checked out",
                const_labels.clone(),
            )
            .expect("failed to create `store_connection_checkout_count` gauge");
        let wait_ms_counter = registry
            .global_counter(
                "store_connection_wait_ms_total",
                "Total time callers waited for a connection checkout",
                const_labels.clone(),
            )
            .expect("failed to create `store_connection_wait_ms_total` counter");
        let exhausted_counter = registry
            .global_counter(
                "store_pool_exhausted_count",
                "The number of checkouts that timed out because the pool was exhausted",
                const_labels,
            )
            .expect("failed to create `store_pool_exhausted_count` counter");
        EventHandler {
            logger,
            checkout_gauge,
            wait_ms_counter,
            exhausted_counter,
            state_tracker,
        }
    }
}

impl fmt::Debug for EventHandler {
    fn fmt(&self, _f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Result::Ok(())
    }
}

impl HandleEvent for EventHandler {
    fn handle_acquire(&self, _: e::AcquireEvent) {
        self.state_tracker.mark_available();
    }

    fn handle_release(&self, _: e::ReleaseEvent) {}

    fn handle_checkout(&self, event: e::CheckoutEvent) {
        self.checkout_gauge.inc();
        self.wait_ms_counter
            .inc_by(event.duration().as_millis() as f64);
    }

    fn handle_timeout(&self, event: e::TimeoutEvent) {
        self.exhausted_counter.inc();
        self.wait_ms_counter
            .inc_by(event.timeout().as_millis() as f64);
        if self.state_tracker.is_available() {
            error!(self.logger, "connection checkout timed out";
                   "wait_ms" => event.timeout().as_millis() as u64);
        }
    }

    fn handle_checkin(&self, _: e::CheckinEvent) {
        self.checkout_gauge.dec();
    }
}
