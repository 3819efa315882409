//! Publish scheduler: the poll and publish interval tasks.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{HoststatsConfig, PublishMode};
use crate::connection::ConnectionManager;
use crate::publisher::StatsPublisher;
use crate::registry::{MetricValue, MetricsRegistry};
use crate::serialization::encode;
use crate::transport::Transport;

/// Envelope for snapshot publishes and streaming frames.
#[derive(Debug, Clone, Serialize)]
pub struct StatsFrame {
    pub ts: i64,
    pub payload: BTreeMap<String, MetricValue>,
}

impl StatsFrame {
    /// Capture a registry snapshot stamped with the current time.
    pub fn capture(registry: &MetricsRegistry) -> Self {
        Self {
            ts: unix_seconds(),
            payload: registry.snapshot(),
        }
    }
}

/// Current time as unix seconds.
pub fn unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Owns the periodic tasks and the connection used to publish.
///
/// Both timers start at construction and run until `shutdown`. Ticks
/// that fire while the previous body is still running are skipped, never
/// queued.
pub struct Engine<T: Transport> {
    conn: Arc<ConnectionManager<T>>,
    tasks: Vec<JoinHandle<()>>,
}

impl<T: Transport> Engine<T> {
    pub fn start(
        publisher: StatsPublisher,
        registry: Arc<MetricsRegistry>,
        conn: Arc<ConnectionManager<T>>,
        config: &HoststatsConfig,
        hostname: &str,
    ) -> Self {
        let topic_prefix = format!("{}/{}", config.key_prefix, hostname);
        let poll_period = Duration::from_secs(config.poll_interval_secs);
        let format = config.publish.format;

        let mut tasks = Vec::new();

        match config.publish.mode {
            PublishMode::Snapshot => {
                tasks.push(spawn_poll_task(publisher, poll_period));
                tasks.push(spawn_publish_task(
                    registry,
                    conn.clone(),
                    format!("{topic_prefix}/stats"),
                    Duration::from_secs(config.publish_interval_secs),
                    format,
                ));
            }
            PublishMode::PerCategory => {
                tasks.push(spawn_category_task(
                    publisher,
                    conn.clone(),
                    topic_prefix,
                    poll_period,
                    format,
                ));
            }
        }

        info!(
            mode = ?config.publish.mode,
            poll_secs = config.poll_interval_secs,
            publish_secs = config.publish_interval_secs,
            "engine started"
        );

        Self { conn, tasks }
    }

    /// Stop both timers and release the connection.
    pub async fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        self.conn.disconnect().await;
        info!("engine stopped");
    }
}

fn spawn_poll_task(mut publisher: StatsPublisher, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if let Err(e) = publisher.flush() {
                warn!(error = %e, "flush failed, retrying next tick");
            }
        }
    })
}

fn spawn_publish_task<T: Transport>(
    registry: Arc<MetricsRegistry>,
    conn: Arc<ConnectionManager<T>>,
    topic: String,
    period: Duration,
    format: crate::serialization::Format,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;

            let frame = StatsFrame::capture(&registry);
            let payload = match encode(&frame, format) {
                Ok(payload) => payload,
                Err(e) => {
                    error!(error = %e, "failed to encode stats frame");
                    continue;
                }
            };

            // Best-effort: the send is attempted even when the connect
            // attempt failed, and never retried within the tick.
            if !conn.ensure_connected().await {
                warn!("publish tick: not connected");
            }

            debug!(topic = %topic, bytes = payload.len(), "publishing snapshot");
            if let Err(e) = conn.publish(&topic, payload).await {
                error!(error = %e, "publish failed");
            }
        }
    })
}

fn spawn_category_task<T: Transport>(
    mut publisher: StatsPublisher,
    conn: Arc<ConnectionManager<T>>,
    topic_prefix: String,
    period: Duration,
    format: crate::serialization::Format,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;

            if !conn.ensure_connected().await {
                warn!("poll tick: not connected");
            }

            let result = publisher
                .flush_each(|category, payload| {
                    let conn = conn.clone();
                    let topic = format!("{topic_prefix}/{category}");
                    async move {
                        match encode(&payload, format) {
                            Ok(bytes) => {
                                if let Err(e) = conn.publish(&topic, bytes).await {
                                    error!(topic = %topic, error = %e, "publish failed");
                                }
                            }
                            Err(e) => error!(error = %e, "failed to encode category payload"),
                        }
                    }
                })
                .await;

            if let Err(e) = result {
                warn!(error = %e, "flush failed, retrying next tick");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Endpoint;
    use crate::error::ConnectError;
    use crate::readers::ProcReader;
    use crate::transport::Connection;
    use std::sync::Mutex;

    #[test]
    fn test_stats_frame_shape() {
        let registry = MetricsRegistry::new();
        registry.int_gauge("memory.free").set(42);

        let frame = StatsFrame::capture(&registry);
        assert!(frame.ts > 0);

        let json: serde_json::Value = serde_json::from_slice(
            &encode(&frame, crate::serialization::Format::Json).unwrap(),
        )
        .unwrap();
        assert_eq!(json["ts"], frame.ts);
        assert_eq!(json["payload"]["memory.free"], 42);
    }

    #[derive(Clone)]
    struct RecordingTransport {
        published: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    }

    struct RecordingConn {
        published: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    }

    impl Transport for RecordingTransport {
        type Conn = RecordingConn;

        async fn connect(&self, _endpoint: &Endpoint) -> Result<RecordingConn, ConnectError> {
            Ok(RecordingConn {
                published: self.published.clone(),
            })
        }
    }

    impl Connection for RecordingConn {
        async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ConnectError> {
            self.published.lock().unwrap().push((topic.to_string(), payload));
            Ok(())
        }

        async fn close(self) {}
    }

    fn fixture_config(dir: &std::path::Path, mode: PublishMode) -> HoststatsConfig {
        std::fs::create_dir_all(dir.join("net")).unwrap();
        std::fs::write(dir.join("stat"), "cpu 100 0 50 800 50 0 0 0").unwrap();
        std::fs::write(
            dir.join("meminfo"),
            "MemTotal: 1000 kB\nMemFree: 200 kB\nSwapTotal: 500 kB\nSwapFree: 400 kB\n",
        )
        .unwrap();
        std::fs::write(dir.join("uptime"), "99.5 180.0").unwrap();
        std::fs::write(
            dir.join("net/dev"),
            "h1\nh2\n  eth0: 100 1 0 0 0 0 0 0 200 2 0 0 0 0 0 0\n",
        )
        .unwrap();
        std::fs::write(dir.join("diskstats"), "8 0 sda 5 1 300 40 7 2 500 60 0 90 100\n")
            .unwrap();

        HoststatsConfig {
            proc_root: dir.to_path_buf(),
            poll_interval_secs: 1,
            publish_interval_secs: 5,
            publish: crate::config::PublishConfig {
                mode,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_publishes_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let config = fixture_config(dir.path(), PublishMode::Snapshot);

        let registry = Arc::new(MetricsRegistry::new());
        let publisher = StatsPublisher::new(ProcReader::new(dir.path()), registry.clone());

        let transport = RecordingTransport {
            published: Arc::new(Mutex::new(Vec::new())),
        };
        let published = transport.published.clone();
        let conn = ConnectionManager::new(transport, Endpoint::parse("tcp://broker:7447").unwrap());

        let engine = Engine::start(publisher, registry, conn, &config, "testhost");

        // Paused time auto-advances through poll and publish ticks.
        tokio::time::sleep(Duration::from_secs(6)).await;
        engine.shutdown().await;

        let published = published.lock().unwrap();
        assert!(!published.is_empty());
        assert_eq!(published[0].0, "hoststats/testhost/stats");

        // The first frame may race the first poll tick; the last one has
        // seen several flushes.
        let (_, payload) = published.last().unwrap();
        let frame: serde_json::Value = serde_json::from_slice(payload).unwrap();
        assert!(frame["ts"].as_i64().unwrap() > 0);
        assert_eq!(frame["payload"]["memory.total"], 1_024_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_per_category_topics() {
        let dir = tempfile::tempdir().unwrap();
        let config = fixture_config(dir.path(), PublishMode::PerCategory);

        let registry = Arc::new(MetricsRegistry::new());
        let publisher = StatsPublisher::new(ProcReader::new(dir.path()), registry.clone());

        let transport = RecordingTransport {
            published: Arc::new(Mutex::new(Vec::new())),
        };
        let published = transport.published.clone();
        let conn = ConnectionManager::new(transport, Endpoint::parse("tcp://broker:7447").unwrap());

        let engine = Engine::start(publisher, registry.clone(), conn, &config, "testhost");
        tokio::time::sleep(Duration::from_secs(2)).await;
        engine.shutdown().await;

        let published = published.lock().unwrap();
        let topics: Vec<_> = published.iter().map(|(t, _)| t.as_str()).collect();
        assert!(topics.contains(&"hoststats/testhost/cpu/total"));
        assert!(topics.contains(&"hoststats/testhost/memory"));
        assert!(topics.contains(&"hoststats/testhost/network/interfaces"));
        assert!(topics.contains(&"hoststats/testhost/diskstats"));

        // This variant bypasses the registry entirely.
        assert!(registry.is_empty());
    }
}
