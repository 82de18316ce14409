//! Request drivers for the ping plugin: one-shot calls and a QPS load test.

use crate::{AddRequest, AddResponse, PONG_PLUGIN};
use pluginbus_core::{BusError, CallContext, CancellationToken, Plugin, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Send `ping` to the pong plugin and return its reply as text.
pub async fn ping_once(plugin: &Plugin, call: &CallContext) -> Result<String> {
    let reply = plugin.send(PONG_PLUGIN, "ping", b"ping".to_vec(), call).await?;
    Ok(String::from_utf8_lossy(&reply).into_owned())
}

/// Ask the pong plugin for `a + b`.
pub async fn add_once(plugin: &Plugin, a: i64, b: i64, call: &CallContext) -> Result<i64> {
    let response: AddResponse = plugin
        .call(PONG_PLUGIN, "add", &AddRequest { a, b }, call)
        .await?;
    Ok(response.result)
}

/// Counters shared by the load-test workers.
#[derive(Debug, Default)]
pub struct LoadStats {
    success: AtomicU64,
    failed: AtomicU64,
    latency_nanos: AtomicU64,
}

impl LoadStats {
    pub fn record_success(&self, latency: Duration) {
        self.success.fetch_add(1, Ordering::Relaxed);
        let nanos = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);
        self.latency_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LoadSnapshot {
        LoadSnapshot {
            success: self.success.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            latency_nanos: self.latency_nanos.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`LoadStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSnapshot {
    pub success: u64,
    pub failed: u64,
    pub latency_nanos: u64,
}

impl LoadSnapshot {
    pub fn total(&self) -> u64 {
        self.success + self.failed
    }

    /// Mean latency of successful requests, in milliseconds.
    pub fn avg_latency_ms(&self) -> f64 {
        if self.success == 0 {
            return 0.0;
        }
        self.latency_nanos as f64 / self.success as f64 / 1_000_000.0
    }

    pub fn success_rate(&self) -> f64 {
        if self.total() == 0 {
            return 0.0;
        }
        self.success as f64 / self.total() as f64
    }
}

/// Final numbers of a [`QpsTest`] run.
#[derive(Debug, Clone, Copy)]
pub struct LoadReport {
    pub elapsed: Duration,
    pub stats: LoadSnapshot,
}

impl LoadReport {
    pub fn avg_qps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.stats.total() as f64 / secs
    }
}

/// Hammers the pong plugin's `add` method from many concurrent workers.
#[derive(Debug, Clone)]
pub struct QpsTest {
    pub duration: Duration,
    pub concurrency: usize,
    pub report_interval: Duration,
    pub request_timeout: Duration,
}

impl Default for QpsTest {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(30),
            concurrency: 100,
            report_interval: Duration::from_secs(1),
            request_timeout: Duration::from_secs(5),
        }
    }
}

impl QpsTest {
    pub async fn run(&self, plugin: &Plugin) -> LoadReport {
        let stats = Arc::new(LoadStats::default());
        let stop = CancellationToken::new();
        let started = Instant::now();

        let reporter = {
            let stats = stats.clone();
            let interval = self.report_interval;
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(interval);
                tick.tick().await;
                let mut last_success = 0;
                loop {
                    tick.tick().await;
                    let now = stats.snapshot();
                    let qps = (now.success - last_success) as f64 / interval.as_secs_f64();
                    info!(
                        "QPS {:.0} | total {} | success {} | fails {} | avg latency {:.3}ms | elapsed {:.1}s",
                        qps,
                        now.total(),
                        now.success,
                        now.failed,
                        now.avg_latency_ms(),
                        started.elapsed().as_secs_f64()
                    );
                    last_success = now.success;
                }
            })
        };

        let workers: Vec<_> = (0..self.concurrency)
            .map(|_| {
                let plugin = plugin.clone();
                let stats = stats.clone();
                let call = CallContext::with_timeout(self.request_timeout).cancel_with(stop.clone());
                tokio::spawn(async move {
                    while !call.token().is_cancelled() {
                        let start = Instant::now();
                        match add_once(&plugin, 1, 1, &call).await {
                            Ok(_) => stats.record_success(start.elapsed()),
                            Err(BusError::Cancelled) => break,
                            Err(_) => stats.record_failure(),
                        }
                    }
                })
            })
            .collect();

        tokio::time::sleep(self.duration).await;
        stop.cancel();
        futures::future::join_all(workers).await;
        reporter.abort();

        let report = LoadReport {
            elapsed: started.elapsed(),
            stats: stats.snapshot(),
        };
        info!(
            "Final QPS test results: duration {:.1}s, total {}, avg QPS {:.0}, success rate {:.4}, avg latency {:.3}ms",
            report.elapsed.as_secs_f64(),
            report.stats.total(),
            report.avg_qps(),
            report.stats.success_rate(),
            report.stats.avg_latency_ms()
        );
        report
    }
}
