//! Graphite plain-text protocol flusher.
//!
//! One flusher task per registry. Every tick the registry is serialized
//! into `path value timestamp` lines and the whole batch is written over
//! a freshly dialed TCP connection. A failed tick is logged and the next
//! tick retries from scratch.

use std::{
    fmt::Write as _,
    net::{SocketAddr, ToSocketAddrs},
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tokio::{io::AsyncWriteExt, net::TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::{
    config::GraphiteConfig,
    error::LogtricsError,
    graphite::metrics::{Metric, MetricsRegistry},
};

/// A metrics registry bound to a graphite endpoint.
///
/// The endpoint is resolved once at construction; resolution failure
/// fails construction. [`Graphite::new`] also starts the background
/// flush task, which stops on cancellation after finishing any flush
/// already in progress.
#[derive(Debug)]
pub struct Graphite {
    registry: Arc<MetricsRegistry>,
    address: SocketAddr,
}

impl Graphite {
    /// Resolves the endpoint and starts the periodic flush task.
    pub fn new(conf: &GraphiteConfig, cancel: CancellationToken) -> Result<Arc<Self>, LogtricsError> {
        let target = format!("{}:{}", conf.host, conf.port);
        let address = target
            .to_socket_addrs()
            .map_err(|e| LogtricsError::GraphiteResolve {
                address: target.clone(),
                reason: e.to_string(),
            })?
            .next()
            .ok_or_else(|| LogtricsError::GraphiteResolve {
                address: target.clone(),
                reason: "no address resolved".to_string(),
            })?;

        let graphite = Arc::new(Self {
            registry: Arc::new(MetricsRegistry::default()),
            address,
        });

        if conf.debug {
            debug!(
                graphite.host = %conf.host,
                graphite.port = conf.port,
                graphite.interval = conf.interval,
                graphite.debug = conf.debug,
                "graphite configuration"
            );
        }

        let flusher = Arc::clone(&graphite);
        let period = Duration::from_secs(conf.interval.max(1));
        let log_batches = conf.debug;
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(address = %flusher.address, "graphite flusher terminated");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = flusher.flush_once(log_batches).await {
                            error!(error = %e, "failed to send graphite metrics");
                        }
                    }
                }
            }
        });

        Ok(graphite)
    }

    /// The registry whose cells this flusher publishes.
    pub fn registry(&self) -> &Arc<MetricsRegistry> {
        &self.registry
    }

    async fn flush_once(&self, log_batch: bool) -> Result<(), LogtricsError> {
        let timestamp = unix_now();
        let batch = self.render_batch(timestamp);
        if batch.is_empty() {
            return Ok(());
        }
        if log_batch {
            for line in batch.lines() {
                debug!(metrics = line, "graphite batch");
            }
        }
        let mut stream = TcpStream::connect(self.address)
            .await
            .map_err(LogtricsError::FlushFailed)?;
        stream
            .write_all(batch.as_bytes())
            .await
            .map_err(LogtricsError::FlushFailed)?;
        stream.shutdown().await.map_err(LogtricsError::FlushFailed)?;
        Ok(())
    }

    /// Serializes every metric into graphite lines at the given timestamp.
    ///
    /// Counters and gauges emit their bare name. Meters and timers emit
    /// the derived series under dotted suffixes; durations are rendered
    /// in seconds.
    fn render_batch(&self, timestamp: u64) -> String {
        let mut out = String::new();
        for (name, metric) in self.registry.snapshot() {
            match metric {
                Metric::Counter(counter) => {
                    let _ = writeln!(out, "{name} {} {timestamp}", counter.value());
                }
                Metric::Gauge(gauge) => {
                    let _ = writeln!(out, "{name} {} {timestamp}", gauge.value());
                }
                Metric::Meter(meter) => {
                    let snap = meter.snapshot();
                    let _ = writeln!(out, "{name}.count {} {timestamp}", snap.count);
                    let _ = writeln!(out, "{name}.rate1 {:.2} {timestamp}", snap.rate1);
                    let _ = writeln!(out, "{name}.rate5 {:.2} {timestamp}", snap.rate5);
                    let _ = writeln!(out, "{name}.rate15 {:.2} {timestamp}", snap.rate15);
                    let _ = writeln!(out, "{name}.mean {:.2} {timestamp}", snap.mean_rate);
                }
                Metric::Timer(timer) => {
                    let snap = timer.snapshot();
                    let _ = writeln!(out, "{name}.count {} {timestamp}", snap.count);
                    let _ = writeln!(out, "{name}.min {:.4} {timestamp}", seconds(snap.min as f64));
                    let _ = writeln!(out, "{name}.max {:.4} {timestamp}", seconds(snap.max as f64));
                    let _ = writeln!(out, "{name}.mean {:.4} {timestamp}", seconds(snap.mean));
                    let _ = writeln!(out, "{name}.p50 {:.4} {timestamp}", seconds(snap.p50));
                    let _ = writeln!(out, "{name}.p75 {:.4} {timestamp}", seconds(snap.p75));
                    let _ = writeln!(out, "{name}.p95 {:.4} {timestamp}", seconds(snap.p95));
                    let _ = writeln!(out, "{name}.p99 {:.4} {timestamp}", seconds(snap.p99));
                    let _ = writeln!(out, "{name}.p999 {:.4} {timestamp}", seconds(snap.p999));
                    let _ = writeln!(out, "{name}.rate1 {:.2} {timestamp}", snap.rate1);
                    let _ = writeln!(out, "{name}.rate5 {:.2} {timestamp}", snap.rate5);
                    let _ = writeln!(out, "{name}.rate15 {:.2} {timestamp}", snap.rate15);
                }
            }
        }
        out
    }
}

fn seconds(nanos: f64) -> f64 {
    nanos / 1e9
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn test_conf(port: u16, interval: u64) -> GraphiteConfig {
        GraphiteConfig {
            host: "127.0.0.1".to_string(),
            port,
            interval,
            debug: false,
        }
    }

    #[tokio::test]
    async fn test_resolution_failure_fails_construction() {
        let conf = GraphiteConfig {
            host: String::new(),
            ..test_conf(2024, 30)
        };
        let err = Graphite::new(&conf, CancellationToken::new()).unwrap_err();
        assert!(matches!(err, LogtricsError::GraphiteResolve { .. }));
    }

    #[tokio::test]
    async fn test_counter_renders_bare_line() {
        let cancel = CancellationToken::new();
        let graphite = Graphite::new(&test_conf(2024, 3600), cancel.clone()).unwrap();
        let counter = graphite.registry().counter("hits").unwrap();
        for _ in 0..5 {
            counter.inc(1);
        }
        let batch = graphite.render_batch(1700000000);
        assert_eq!(batch, "hits 5 1700000000\n");
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_derived_series_suffixes() {
        let cancel = CancellationToken::new();
        let graphite = Graphite::new(&test_conf(2024, 3600), cancel.clone()).unwrap();
        graphite.registry().meter("events").unwrap().mark(4);
        graphite
            .registry()
            .timer("latency")
            .unwrap()
            .update(1_500_000_000);
        let batch = graphite.render_batch(42);
        assert!(batch.contains("events.count 4 42"));
        assert!(batch.contains("events.rate1 "));
        assert!(batch.contains("events.rate15 "));
        assert!(batch.contains("latency.count 1 42"));
        assert!(batch.contains("latency.p50 1.5000 42"));
        assert!(batch.contains("latency.p999 1.5000 42"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_flush_writes_batch_over_tcp() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let cancel = CancellationToken::new();
        let graphite = Graphite::new(&test_conf(port, 3600), cancel.clone()).unwrap();
        graphite.registry().counter("hits").unwrap().inc(5);

        let accept = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = String::new();
            socket.read_to_string(&mut received).await.unwrap();
            received
        });

        graphite.flush_once(false).await.unwrap();
        let received = accept.await.unwrap();
        assert!(received.starts_with("hits 5 "));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_flush_failure_is_reported() {
        // Bind then drop to find a port nothing is listening on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let cancel = CancellationToken::new();
        let graphite = Graphite::new(&test_conf(port, 3600), cancel.clone()).unwrap();
        graphite.registry().counter("hits").unwrap().inc(1);
        let err = graphite.flush_once(false).await.unwrap_err();
        assert!(matches!(err, LogtricsError::FlushFailed(_)));
        cancel.cancel();
    }
}
