//! Per-tick collection of system counters into the metrics registry.

use std::future::Future;
use std::sync::Arc;

use serde_json::{Value, json};
use tracing::error;

use crate::error::ReadError;
use crate::readers::{CpuSample, ProcReader};
use crate::registry::MetricsRegistry;

/// Collects every subsystem once per tick and writes the derived metrics
/// into the registry.
///
/// Owns the previous CPU sample needed for delta metrics. `flush` takes
/// `&mut self`, so concurrent flushes are ruled out by construction.
pub struct StatsPublisher {
    reader: ProcReader,
    registry: Arc<MetricsRegistry>,
    cpu_prev: CpuSample,
}

impl StatsPublisher {
    /// Takes the initial CPU baseline so the first flush produces a delta
    /// over a real window rather than the whole uptime.
    pub fn new(reader: ProcReader, registry: Arc<MetricsRegistry>) -> Self {
        let cpu_prev = reader.cpu().unwrap_or_else(|e| {
            error!(error = %e, "failed to read initial cpu sample");
            CpuSample::default()
        });

        Self {
            reader,
            registry,
            cpu_prev,
        }
    }

    /// Refresh the registry from all subsystems, in order, fail-fast.
    ///
    /// Each subsystem's writes land before the next subsystem is read, so
    /// an error leaves the earlier subsystems' fresh values in place for
    /// the next publish tick.
    pub fn flush(&mut self) -> Result<(), ReadError> {
        self.flush_cpu()?;
        self.flush_memory()?;
        self.flush_swap()?;
        self.flush_uptime()?;
        self.flush_network()?;
        self.flush_disks()?;
        Ok(())
    }

    fn flush_cpu(&mut self) -> Result<(), ReadError> {
        let delta = self.cpu_delta()?;

        self.set_int("cpu.totals.user", delta.user);
        self.set_int("cpu.totals.nice", delta.nice);
        self.set_int("cpu.totals.sys", delta.sys);
        self.set_int("cpu.totals.idle", delta.idle);
        self.set_int("cpu.totals.wait", delta.wait);
        self.set_int("cpu.totals.total", delta.total());
        self.set_float("cpu.totals.usage", delta.usage_percent());

        Ok(())
    }

    /// Read the CPU counters and advance the baseline.
    ///
    /// The baseline moves as soon as the read succeeds, even when the
    /// delta itself is inconsistent, so the next tick compares against a
    /// recent sample instead of erroring forever.
    fn cpu_delta(&mut self) -> Result<crate::readers::CpuDelta, ReadError> {
        let cpu = self.reader.cpu()?;
        let delta = cpu.delta(&self.cpu_prev);
        self.cpu_prev = cpu;
        delta
    }

    fn flush_memory(&self) -> Result<(), ReadError> {
        let mem = self.reader.memory()?;

        self.set_int("memory.free", mem.free);
        self.set_int("memory.used", mem.used);
        self.set_int("memory.actualfree", mem.actual_free);
        self.set_int("memory.actualused", mem.actual_used);
        self.set_int("memory.total", mem.total);

        Ok(())
    }

    fn flush_swap(&self) -> Result<(), ReadError> {
        let swap = self.reader.swap()?;

        self.set_int("swap.free", swap.free);
        self.set_int("swap.used", swap.used);
        self.set_int("swap.total", swap.total);

        Ok(())
    }

    fn flush_uptime(&self) -> Result<(), ReadError> {
        let uptime = self.reader.uptime()?;
        self.set_float("uptime.length", uptime);
        Ok(())
    }

    fn flush_network(&self) -> Result<(), ReadError> {
        for (iface, counters) in self.reader.network_interfaces()? {
            for (key, value) in counters.fields() {
                self.set_int(&format!("network.interfaces.{iface}.{key}"), value);
            }
        }
        Ok(())
    }

    fn flush_disks(&self) -> Result<(), ReadError> {
        for (device, counters) in self.reader.disk_stats()? {
            for (key, value) in counters.fields() {
                self.set_int(&format!("diskstats.{device}.{key}"), value);
            }
        }
        Ok(())
    }

    fn set_int(&self, name: &str, value: u64) {
        self.registry.int_gauge(name).set(value as i64);
    }

    fn set_float(&self, name: &str, value: f64) {
        self.registry.float_gauge(name).set(value);
    }

    /// Topic-keyed variant: hands each subsystem's payload to `emit`
    /// immediately after that subsystem is read, bypassing the registry.
    ///
    /// Same subsystem order and fail-fast policy as [`flush`](Self::flush);
    /// payloads already emitted stay emitted when a later subsystem fails.
    pub async fn flush_each<F, Fut>(&mut self, mut emit: F) -> Result<(), ReadError>
    where
        F: FnMut(&'static str, Value) -> Fut,
        Fut: Future<Output = ()>,
    {
        let delta = self.cpu_delta()?;
        emit(
            "cpu/total",
            json!({
                "user": delta.user,
                "nice": delta.nice,
                "sys": delta.sys,
                "idle": delta.idle,
                "wait": delta.wait,
                "total": delta.total(),
                "usage": delta.usage_percent(),
            }),
        )
        .await;

        let mem = self.reader.memory()?;
        emit(
            "memory",
            json!({
                "free": mem.free,
                "used": mem.used,
                "actualfree": mem.actual_free,
                "actualused": mem.actual_used,
                "total": mem.total,
            }),
        )
        .await;

        let swap = self.reader.swap()?;
        emit(
            "swap",
            json!({
                "free": swap.free,
                "used": swap.used,
                "total": swap.total,
            }),
        )
        .await;

        let uptime = self.reader.uptime()?;
        emit("uptime", json!({ "length": uptime })).await;

        let interfaces = self.reader.network_interfaces()?;
        let payload: serde_json::Map<String, Value> = interfaces
            .iter()
            .map(|(iface, counters)| (iface.clone(), fields_object(counters.fields())))
            .collect();
        emit("network/interfaces", Value::Object(payload)).await;

        let devices = self.reader.disk_stats()?;
        let payload: serde_json::Map<String, Value> = devices
            .iter()
            .map(|(device, counters)| (device.clone(), fields_object(counters.fields())))
            .collect();
        emit("diskstats", Value::Object(payload)).await;

        Ok(())
    }
}

fn fields_object(fields: impl Iterator<Item = (&'static str, u64)>) -> Value {
    Value::Object(
        fields
            .map(|(key, value)| (key.to_string(), Value::from(value)))
            .collect(),
    )
}
