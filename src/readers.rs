//! Point-in-time readers for `/proc`-style counter sources.
//!
//! Each reader returns a fully populated sample or fails with a
//! [`ReadError`] naming the subsystem. The parsers are pure functions
//! over the source text so they can be exercised on synthetic input.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::ReadError;

/// CPU tick counters from the aggregate `cpu` line of `stat`.
///
/// Absolute, monotonically increasing counters since boot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuSample {
    pub user: u64,
    pub nice: u64,
    pub sys: u64,
    pub idle: u64,
    pub wait: u64,
}

impl CpuSample {
    pub fn total(&self) -> u64 {
        self.user + self.nice + self.sys + self.idle + self.wait
    }

    /// Field-wise difference against an earlier sample.
    ///
    /// A total that went backwards is a consistency error; a zero-total
    /// delta (two reads in the same tick) is valid and yields zero usage.
    pub fn delta(&self, previous: &CpuSample) -> Result<CpuDelta, ReadError> {
        if self.total() < previous.total() {
            return Err(ReadError::consistency(
                "cpu",
                format!(
                    "total ticks went backwards: {} < {}",
                    self.total(),
                    previous.total()
                ),
            ));
        }

        Ok(CpuDelta {
            user: self.user.saturating_sub(previous.user),
            nice: self.nice.saturating_sub(previous.nice),
            sys: self.sys.saturating_sub(previous.sys),
            idle: self.idle.saturating_sub(previous.idle),
            wait: self.wait.saturating_sub(previous.wait),
        })
    }
}

/// CPU ticks spent in each state over one delta window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuDelta {
    pub user: u64,
    pub nice: u64,
    pub sys: u64,
    pub idle: u64,
    pub wait: u64,
}

impl CpuDelta {
    pub fn total(&self) -> u64 {
        self.user + self.nice + self.sys + self.idle + self.wait
    }

    /// Busy share of the window in percent, in `[0, 100]`.
    ///
    /// Exactly `0` when the window saw no counter movement.
    pub fn usage_percent(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        let idle = self.wait + self.idle;
        (total - idle) as f64 / total as f64 * 100.0
    }
}

/// Memory readings in bytes, point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemorySample {
    pub free: u64,
    pub used: u64,
    pub actual_free: u64,
    pub actual_used: u64,
    pub total: u64,
}

/// Swap readings in bytes, point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwapSample {
    pub free: u64,
    pub used: u64,
    pub total: u64,
}

/// The 16 ordered counters of one `net/dev` interface line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceCounters {
    pub recv_bytes: u64,
    pub recv_packets: u64,
    pub recv_errs: u64,
    pub recv_drop: u64,
    pub recv_fifo: u64,
    pub recv_frame: u64,
    pub recv_compressed: u64,
    pub recv_multicast: u64,
    pub trans_bytes: u64,
    pub trans_packets: u64,
    pub trans_errs: u64,
    pub trans_drop: u64,
    pub trans_fifo: u64,
    pub trans_colls: u64,
    pub trans_carrier: u64,
    pub trans_compressed: u64,
}

impl InterfaceCounters {
    pub const FIELDS: [&'static str; 16] = [
        "recv_bytes",
        "recv_packets",
        "recv_errs",
        "recv_drop",
        "recv_fifo",
        "recv_frame",
        "recv_compressed",
        "recv_multicast",
        "trans_bytes",
        "trans_packets",
        "trans_errs",
        "trans_drop",
        "trans_fifo",
        "trans_colls",
        "trans_carrier",
        "trans_compressed",
    ];

    fn from_tokens(tokens: &[&str]) -> Self {
        let take = |i: usize| tokens.get(i).map_or(0, |t| parse_counter("network", t));
        Self {
            recv_bytes: take(0),
            recv_packets: take(1),
            recv_errs: take(2),
            recv_drop: take(3),
            recv_fifo: take(4),
            recv_frame: take(5),
            recv_compressed: take(6),
            recv_multicast: take(7),
            trans_bytes: take(8),
            trans_packets: take(9),
            trans_errs: take(10),
            trans_drop: take(11),
            trans_fifo: take(12),
            trans_colls: take(13),
            trans_carrier: take(14),
            trans_compressed: take(15),
        }
    }

    /// Counters in the documented order, paired with their field names.
    pub fn fields(&self) -> impl Iterator<Item = (&'static str, u64)> {
        let values = [
            self.recv_bytes,
            self.recv_packets,
            self.recv_errs,
            self.recv_drop,
            self.recv_fifo,
            self.recv_frame,
            self.recv_compressed,
            self.recv_multicast,
            self.trans_bytes,
            self.trans_packets,
            self.trans_errs,
            self.trans_drop,
            self.trans_fifo,
            self.trans_colls,
            self.trans_carrier,
            self.trans_compressed,
        ];
        Self::FIELDS.into_iter().zip(values)
    }
}

/// The 11 ordered counters of one `diskstats` device line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskCounters {
    pub read_ios: u64,
    pub read_merges: u64,
    pub read_sectors: u64,
    pub read_ticks: u64,
    pub write_ios: u64,
    pub write_merges: u64,
    pub write_sectors: u64,
    pub write_ticks: u64,
    pub in_flight: u64,
    pub io_ticks: u64,
    pub time_in_queue: u64,
}

impl DiskCounters {
    pub const FIELDS: [&'static str; 11] = [
        "read_ios",
        "read_merges",
        "read_sectors",
        "read_ticks",
        "write_ios",
        "write_merges",
        "write_sectors",
        "write_ticks",
        "in_flight",
        "io_ticks",
        "time_in_queue",
    ];

    fn from_tokens(tokens: &[&str]) -> Self {
        let take = |i: usize| tokens.get(i).map_or(0, |t| parse_counter("disk", t));
        Self {
            read_ios: take(0),
            read_merges: take(1),
            read_sectors: take(2),
            read_ticks: take(3),
            write_ios: take(4),
            write_merges: take(5),
            write_sectors: take(6),
            write_ticks: take(7),
            in_flight: take(8),
            io_ticks: take(9),
            time_in_queue: take(10),
        }
    }

    /// Counters in the documented order, paired with their field names.
    pub fn fields(&self) -> impl Iterator<Item = (&'static str, u64)> {
        let values = [
            self.read_ios,
            self.read_merges,
            self.read_sectors,
            self.read_ticks,
            self.write_ios,
            self.write_merges,
            self.write_sectors,
            self.write_ticks,
            self.in_flight,
            self.io_ticks,
            self.time_in_queue,
        ];
        Self::FIELDS.into_iter().zip(values)
    }
}

/// Parse a single counter token, degrading to `0` on malformed input.
fn parse_counter(subsystem: &'static str, token: &str) -> u64 {
    match token.parse() {
        Ok(value) => value,
        Err(_) => {
            debug!(subsystem, token, "unparseable counter token, reporting 0");
            0
        }
    }
}

/// Parse the aggregate `cpu` line of a `stat` file.
pub fn parse_cpu_stat(text: &str) -> Result<CpuSample, ReadError> {
    for line in text.lines() {
        let mut fields = line.split_whitespace();
        if fields.next() != Some("cpu") {
            continue;
        }

        let mut tick = || {
            fields
                .next()
                .ok_or_else(|| ReadError::format("cpu", "truncated cpu line"))?
                .parse::<u64>()
                .map_err(|e| ReadError::format("cpu", format!("bad tick counter: {e}")))
        };

        return Ok(CpuSample {
            user: tick()?,
            nice: tick()?,
            sys: tick()?,
            idle: tick()?,
            wait: tick()?,
        });
    }

    Err(ReadError::format("cpu", "no aggregate cpu line"))
}

/// Parse a `meminfo` file into memory and swap samples.
///
/// `used` is total minus free; `actual_free` additionally counts buffers
/// and page cache as reclaimable.
pub fn parse_meminfo(
    text: &str,
    subsystem: &'static str,
) -> Result<(MemorySample, SwapSample), ReadError> {
    let mut total = None;
    let mut free = None;
    let mut buffers = 0;
    let mut cached = 0;
    let mut swap_total = None;
    let mut swap_free = None;

    for line in text.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let Some(value) = rest.split_whitespace().next() else {
            continue;
        };
        let value: u64 = value
            .parse()
            .map_err(|e| ReadError::format(subsystem, format!("bad {key} value: {e}")))?;
        let bytes = value * 1024;

        match key {
            "MemTotal" => total = Some(bytes),
            "MemFree" => free = Some(bytes),
            "Buffers" => buffers = bytes,
            "Cached" => cached = bytes,
            "SwapTotal" => swap_total = Some(bytes),
            "SwapFree" => swap_free = Some(bytes),
            _ => {}
        }
    }

    let missing = |field| move || ReadError::format(subsystem, format!("missing {field} field"));
    let total = total.ok_or_else(missing("MemTotal"))?;
    let free = free.ok_or_else(missing("MemFree"))?;
    let swap_total = swap_total.ok_or_else(missing("SwapTotal"))?;
    let swap_free = swap_free.ok_or_else(missing("SwapFree"))?;

    let actual_free = free + buffers + cached;
    let memory = MemorySample {
        free,
        used: total.saturating_sub(free),
        actual_free,
        actual_used: total.saturating_sub(actual_free),
        total,
    };
    let swap = SwapSample {
        free: swap_free,
        used: swap_total.saturating_sub(swap_free),
        total: swap_total,
    };

    Ok((memory, swap))
}

/// Parse an `uptime` file into elapsed seconds since boot.
pub fn parse_uptime(text: &str) -> Result<f64, ReadError> {
    text.split_whitespace()
        .next()
        .ok_or_else(|| ReadError::format("uptime", "empty uptime file"))?
        .parse()
        .map_err(|e| ReadError::format("uptime", format!("bad uptime value: {e}")))
}

/// Parse a `net/dev` file into per-interface counters.
///
/// Skips exactly the two header lines. A data line without a `:`
/// separator fails the whole read; malformed counter tokens degrade to 0.
pub fn parse_net_dev(text: &str) -> Result<BTreeMap<String, InterfaceCounters>, ReadError> {
    let mut interfaces = BTreeMap::new();

    for line in text.lines().skip(2) {
        let Some((name, counters)) = line.split_once(':') else {
            return Err(ReadError::format(
                "network",
                format!("missing ':' separator in interface line '{line}'"),
            ));
        };

        let tokens: Vec<&str> = counters.split_whitespace().collect();
        interfaces.insert(
            name.trim().to_string(),
            InterfaceCounters::from_tokens(&tokens),
        );
    }

    Ok(interfaces)
}

/// Parse a `diskstats` file into per-device counters.
///
/// A line with fewer than 14 whitespace-separated fields fails the whole
/// read; the device name is the third field.
pub fn parse_diskstats(text: &str) -> Result<BTreeMap<String, DiskCounters>, ReadError> {
    let mut devices = BTreeMap::new();

    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 14 {
            return Err(ReadError::format(
                "disk",
                format!("expected at least 14 fields, got {}", fields.len()),
            ));
        }

        devices.insert(fields[2].to_string(), DiskCounters::from_tokens(&fields[3..]));
    }

    Ok(devices)
}

/// Reads raw counter sources under a `/proc`-style root.
///
/// Stateless; every call produces a fresh sample owned by the caller.
#[derive(Debug, Clone)]
pub struct ProcReader {
    root: PathBuf,
}

impl ProcReader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn read(&self, subsystem: &'static str, file: &str) -> Result<String, ReadError> {
        std::fs::read_to_string(self.root.join(file)).map_err(|e| ReadError::io(subsystem, e))
    }

    pub fn cpu(&self) -> Result<CpuSample, ReadError> {
        parse_cpu_stat(&self.read("cpu", "stat")?)
    }

    pub fn memory(&self) -> Result<MemorySample, ReadError> {
        parse_meminfo(&self.read("memory", "meminfo")?, "memory").map(|(memory, _)| memory)
    }

    pub fn swap(&self) -> Result<SwapSample, ReadError> {
        parse_meminfo(&self.read("swap", "meminfo")?, "swap").map(|(_, swap)| swap)
    }

    pub fn uptime(&self) -> Result<f64, ReadError> {
        parse_uptime(&self.read("uptime", "uptime")?)
    }

    pub fn network_interfaces(&self) -> Result<BTreeMap<String, InterfaceCounters>, ReadError> {
        parse_net_dev(&self.read("network", "net/dev")?)
    }

    pub fn disk_stats(&self) -> Result<BTreeMap<String, DiskCounters>, ReadError> {
        parse_diskstats(&self.read("disk", "diskstats")?)
    }
}

impl Default for ProcReader {
    fn default() -> Self {
        Self::new("/proc")
    }
}
