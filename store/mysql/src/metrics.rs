use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use prometheus::{Counter, CounterVec, Error as PrometheusError, Gauge, Opts, Registry};

/// A wrapper around the prometheus registry that hands out shared metric
/// handles. Several pools register counters under the same name with
/// different const labels; prometheus rejects duplicate registration, so
/// we cache handles keyed by name and labels and return clones.
pub struct MetricsRegistry {
    registry: Arc<Registry>,
    counters: RwLock<HashMap<String, Counter>>,
    counter_vecs: RwLock<HashMap<String, CounterVec>>,
    gauges: RwLock<HashMap<String, Gauge>>,
}

fn metric_key(name: &str, const_labels: &HashMap<String, String>) -> String {
    let mut labels: Vec<_> = const_labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    labels.sort();
    format!("{}#{}", name, labels.join(","))
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            counters: RwLock::new(HashMap::new()),
            counter_vecs: RwLock::new(HashMap::new()),
            gauges: RwLock::new(HashMap::new()),
        }
    }

    /// The underlying registry, e.g. for wiring up an exporter.
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn global_counter(
        &self,
        name: &str,
        help: &str,
        const_labels: HashMap<String, String>,
    ) -> Result<Counter, PrometheusError> {
        let key = metric_key(name, &const_labels);
        if let Some(counter) = self.counters.read().unwrap().get(&key) {
            return Ok(counter.clone());
        }
        let opts = Opts::new(name, help).const_labels(const_labels);
        let counter = Counter::with_opts(opts)?;
        self.registry.register(Box::new(counter.clone()))?;
        self.counters
            .write()
            .unwrap()
            .insert(key, counter.clone());
        Ok(counter)
    }

    pub fn global_counter_vec(
        &self,
        name: &str,
        help: &str,
        variable_labels: &[&str],
    ) -> Result<CounterVec, PrometheusError> {
        if let Some(vec) = self.counter_vecs.read().unwrap().get(name) {
            return Ok(vec.clone());
        }
        let vec = CounterVec::new(Opts::new(name, help), variable_labels)?;
        self.registry.register(Box::new(vec.clone()))?;
        self.counter_vecs
            .write()
            .unwrap()
            .insert(name.to_string(), vec.clone());
        Ok(vec)
    }

    pub fn global_gauge(
        &self,
        name: &str,
        help: &str,
        const_labels: HashMap<String, String>,
    ) -> Result<Gauge, PrometheusError> {
        let key = metric_key(name, &const_labels);
        if let Some(gauge) = self.gauges.read().unwrap().get(&key) {
            return Ok(gauge.clone());
        }
        let opts = Opts::new(name, help).const_labels(const_labels);
        let gauge = Gauge::with_opts(opts)?;
        self.registry.register(Box::new(gauge.clone()))?;
        self.gauges.write().unwrap().insert(key, gauge.clone());
        Ok(gauge)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_registration_returns_the_same_handle() {
        let registry = MetricsRegistry::new();
        let labels: HashMap<_, _> = [("pool".to_string(), "7".to_string())].into();
        let a = registry
            .global_counter("requests_total", "requests", labels.clone())
            .unwrap();
        let b = registry
            .global_counter("requests_total", "requests", labels)
            .unwrap();
        a.inc();
        b.inc();
        assert_eq!(a.get() as u64, 2);
    }

    #[test]
    fn same_name_with_different_labels_is_distinct() {
        let registry = MetricsRegistry::new();
        let a = registry
            .global_counter(
                "requests_total",
                "requests",
                [("pool".to_string(), "7".to_string())].into(),
            )
            .unwrap();
        let b = registry
            .global_counter(
                "requests_total",
                "requests",
                [("pool".to_string(), "9".to_string())].into(),
            )
            .unwrap();
        a.inc();
        assert_eq!(b.get() as u64, 0);
    }
}
