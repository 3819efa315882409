//! In-process metrics registry.
//!
//! A mapping from hierarchical metric name to a gauge instrument,
//! append-only for the process lifetime. Handles are cheap clones backed
//! by atomics, so updates to distinct names never contend and the map
//! lock is only taken on get-or-create and snapshot.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Last-written value of a single instrument.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Int(i64),
    Float(f64),
}

/// Integer gauge handle. Last write wins.
#[derive(Debug, Clone, Default)]
pub struct IntGauge(Arc<AtomicI64>);

impl IntGauge {
    pub fn set(&self, value: i64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Floating-point gauge handle. Last write wins.
#[derive(Debug, Clone, Default)]
pub struct FloatGauge(Arc<AtomicU64>);

impl FloatGauge {
    pub fn set(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

#[derive(Debug, Clone)]
enum Instrument {
    Int(IntGauge),
    Float(FloatGauge),
}

impl Instrument {
    fn value(&self) -> MetricValue {
        match self {
            Instrument::Int(g) => MetricValue::Int(g.get()),
            Instrument::Float(g) => MetricValue::Float(g.get()),
        }
    }
}

/// Append-only mapping from metric name to instrument.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    instruments: RwLock<HashMap<String, Instrument>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the integer gauge registered under `name`.
    ///
    /// Re-registering a name that holds a float gauge logs a warning and
    /// the int gauge wins; this bridge's fixed naming never does that.
    pub fn int_gauge(&self, name: &str) -> IntGauge {
        {
            let instruments = self.instruments.read();
            if let Some(Instrument::Int(gauge)) = instruments.get(name) {
                return gauge.clone();
            }
        }

        let mut instruments = self.instruments.write();
        match instruments.get(name) {
            Some(Instrument::Int(gauge)) => gauge.clone(),
            existing => {
                if existing.is_some() {
                    warn!(metric = name, "re-registering float gauge as int");
                }
                let gauge = IntGauge::default();
                instruments.insert(name.to_string(), Instrument::Int(gauge.clone()));
                gauge
            }
        }
    }

    /// Get or create the floating-point gauge registered under `name`.
    pub fn float_gauge(&self, name: &str) -> FloatGauge {
        {
            let instruments = self.instruments.read();
            if let Some(Instrument::Float(gauge)) = instruments.get(name) {
                return gauge.clone();
            }
        }

        let mut instruments = self.instruments.write();
        match instruments.get(name) {
            Some(Instrument::Float(gauge)) => gauge.clone(),
            existing => {
                if existing.is_some() {
                    warn!(metric = name, "re-registering int gauge as float");
                }
                let gauge = FloatGauge::default();
                instruments.insert(name.to_string(), Instrument::Float(gauge.clone()));
                gauge
            }
        }
    }

    /// Immutable point-in-time copy of the name→value mapping.
    ///
    /// Each call produces an independent map; no reader observes a
    /// partially applied single-metric update.
    pub fn snapshot(&self) -> BTreeMap<String, MetricValue> {
        self.instruments
            .read()
            .iter()
            .map(|(name, instrument)| (name.clone(), instrument.value()))
            .collect()
    }

    /// Number of registered instruments.
    pub fn len(&self) -> usize {
        self.instruments.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_get_or_create_returns_same_instrument() {
        let registry = MetricsRegistry::new();

        registry.int_gauge("cpu.totals.user").set(7);
        registry.int_gauge("cpu.totals.user").set(9);

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.int_gauge("cpu.totals.user").get(), 9);
    }

    #[test]
    fn test_snapshot_contents() {
        let registry = MetricsRegistry::new();
        registry.int_gauge("memory.free").set(1024);
        registry.float_gauge("cpu.totals.usage").set(53.85);

        let snap = registry.snapshot();
        assert_eq!(snap.get("memory.free"), Some(&MetricValue::Int(1024)));
        assert_eq!(
            snap.get("cpu.totals.usage"),
            Some(&MetricValue::Float(53.85))
        );
    }

    #[test]
    fn test_snapshot_idempotent_without_writes() {
        let registry = MetricsRegistry::new();
        registry.int_gauge("swap.used").set(512);
        registry.float_gauge("uptime.length").set(100.5);

        assert_eq!(registry.snapshot(), registry.snapshot());
    }

    #[test]
    fn test_snapshot_independent_of_later_writes() {
        let registry = MetricsRegistry::new();
        registry.int_gauge("swap.used").set(512);

        let snap = registry.snapshot();
        registry.int_gauge("swap.used").set(1024);

        assert_eq!(snap.get("swap.used"), Some(&MetricValue::Int(512)));
    }

    #[test]
    fn test_concurrent_updates_distinct_names() {
        let registry = Arc::new(MetricsRegistry::new());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                thread::spawn(move || {
                    let gauge = registry.int_gauge(&format!("diskstats.sda{i}.read_ios"));
                    for v in 0..1000 {
                        gauge.set(v);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.len(), 8);
        for i in 0..8 {
            assert_eq!(
                registry.int_gauge(&format!("diskstats.sda{i}.read_ios")).get(),
                999
            );
        }
    }

    #[test]
    fn test_metric_value_serializes_flat() {
        let mut map = BTreeMap::new();
        map.insert("a", MetricValue::Int(3));
        map.insert("b", MetricValue::Float(1.5));

        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"a":3,"b":1.5}"#);
    }
}
