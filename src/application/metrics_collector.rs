//! Metrics collector.
//!
//! Samples the control plane every interval: host CPU/memory plus
//! coordinator counts and the trailing completion window. Samples land
//! in a bounded in-memory ring; consumers pull, there is no push
//! fan-out beyond the event bus notification.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::application::coordinator::SwarmCoordinator;
use crate::domain::models::{CompletionRecord, MetricsConfig, MetricsSample};
use crate::domain::ports::Clock;
use crate::services::event_bus::{EventBus, EventPayload};

/// Bounded ring of recent samples. Single producer (the collector),
/// many pulling consumers.
pub struct MetricsRing {
    capacity: usize,
    inner: RwLock<VecDeque<MetricsSample>>,
}

impl MetricsRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: RwLock::new(VecDeque::new()),
        }
    }

    pub async fn push(&self, sample: MetricsSample) {
        let mut inner = self.inner.write().await;
        inner.push_back(sample);
        while inner.len() > self.capacity {
            inner.pop_front();
        }
    }

    pub async fn latest(&self) -> Option<MetricsSample> {
        self.inner.read().await.back().cloned()
    }

    /// Samples oldest-first.
    pub async fn snapshot(&self) -> Vec<MetricsSample> {
        self.inner.read().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

/// Periodic sampler feeding the ring.
pub struct MetricsCollector {
    ring: Arc<MetricsRing>,
    coordinator: Arc<SwarmCoordinator>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    config: MetricsConfig,
    interval_ms: u64,
    system: StdMutex<System>,
    shutdown_tx: broadcast::Sender<()>,
}

impl MetricsCollector {
    pub fn new(
        ring: Arc<MetricsRing>,
        coordinator: Arc<SwarmCoordinator>,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        config: MetricsConfig,
        interval_ms: u64,
    ) -> Self {
        let refresh = RefreshKind::new()
            .with_cpu(CpuRefreshKind::everything())
            .with_memory(MemoryRefreshKind::everything());
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            ring,
            coordinator,
            bus,
            clock,
            config,
            interval_ms,
            system: StdMutex::new(System::new_with_specifics(refresh)),
            shutdown_tx,
        }
    }

    pub fn ring(&self) -> Arc<MetricsRing> {
        Arc::clone(&self.ring)
    }

    /// Spawn the sampling loop.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let collector = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(collector.interval_ms));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = collector.interval_ms, "Metrics collector started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        collector.sample_once().await;
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            info!("Metrics collector stopped");
        })
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Take one sample and publish it. Exposed for tests and on-demand
    /// refreshes.
    pub async fn sample_once(&self) -> MetricsSample {
        let now = self.clock.now();
        let (cpu_pct, mem_pct) = self.host_usage();
        let snapshot = self.coordinator.metrics_snapshot().await;

        let sample = build_sample(
            now,
            cpu_pct,
            mem_pct,
            snapshot.queue_len,
            snapshot.active_agents,
            snapshot.idle_agents,
            &snapshot.completions,
            self.interval_ms,
        );

        self.ring.push(sample.clone()).await;
        self.bus
            .publish(EventPayload::MetricsSampled(sample.clone()), now);
        debug!(
            cpu_pct = sample.cpu_pct,
            queue_len = sample.queue_len,
            active = sample.active_agents,
            "Sampled metrics"
        );
        sample
    }

    /// Queue length above which the auto-scaler treats load as high.
    pub fn queue_high_watermark(&self) -> usize {
        self.config.queue_high_watermark
    }

    fn host_usage(&self) -> (f64, f64) {
        let mut system = match self.system.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        system.refresh_cpu_usage();
        system.refresh_memory();
        let cpu = f64::from(system.global_cpu_usage());
        let total = system.total_memory();
        let mem = if total == 0 {
            0.0
        } else {
            system.used_memory() as f64 / total as f64 * 100.0
        };
        (cpu, mem)
    }
}

/// Derive one sample from raw counts and the completion window.
#[allow(clippy::too_many_arguments)]
fn build_sample(
    now: DateTime<Utc>,
    cpu_pct: f64,
    mem_pct: f64,
    queue_len: usize,
    active_agents: usize,
    idle_agents: usize,
    completions: &[CompletionRecord],
    interval_ms: u64,
) -> MetricsSample {
    // Throughput over the trailing five sample intervals.
    let window = chrono::Duration::milliseconds((interval_ms * 5) as i64);
    let window_start = now - window;
    let recent = completions
        .iter()
        .filter(|c| c.ended_at >= window_start)
        .count();
    let window_minutes = (interval_ms * 5) as f64 / 60_000.0;
    let throughput_tpm = if window_minutes > 0.0 {
        recent as f64 / window_minutes
    } else {
        0.0
    };

    let mut durations: Vec<u64> = completions.iter().map(|c| c.duration_ms).collect();
    durations.sort_unstable();
    let response_time_ms = if durations.is_empty() {
        0.0
    } else {
        durations[durations.len() / 2] as f64
    };

    let failed = completions.iter().filter(|c| c.failed).count();
    let error_rate_pct = if completions.is_empty() {
        0.0
    } else {
        failed as f64 / completions.len() as f64 * 100.0
    };

    MetricsSample {
        ts: now,
        cpu_pct,
        mem_pct,
        queue_len,
        active_agents,
        idle_agents,
        throughput_tpm,
        response_time_ms,
        error_rate_pct,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ring_is_bounded_and_ordered() {
        let ring = MetricsRing::new(3);
        for i in 0..5 {
            let mut sample = MetricsSample::empty(Utc::now());
            sample.queue_len = i;
            ring.push(sample).await;
        }
        assert_eq!(ring.len().await, 3);
        let snapshot = ring.snapshot().await;
        assert_eq!(snapshot[0].queue_len, 2);
        assert_eq!(snapshot[2].queue_len, 4);
        assert_eq!(ring.latest().await.unwrap().queue_len, 4);
    }

    #[test]
    fn test_build_sample_derivations() {
        let now = Utc::now();
        let completions = vec![
            CompletionRecord { ended_at: now, duration_ms: 100, failed: false },
            CompletionRecord { ended_at: now, duration_ms: 300, failed: false },
            CompletionRecord { ended_at: now, duration_ms: 200, failed: true },
            // Outside the five-interval throughput window.
            CompletionRecord {
                ended_at: now - chrono::Duration::hours(1),
                duration_ms: 900,
                failed: false,
            },
        ];
        let sample = build_sample(now, 50.0, 40.0, 2, 3, 1, &completions, 30_000);

        // 3 recent completions over 2.5 minutes.
        assert!((sample.throughput_tpm - 1.2).abs() < 1e-9);
        // p50 of [100, 200, 300, 900].
        assert!((sample.response_time_ms - 300.0).abs() < f64::EPSILON);
        // 1 failure out of 4 records.
        assert!((sample.error_rate_pct - 25.0).abs() < f64::EPSILON);
        assert_eq!(sample.queue_len, 2);
    }

    #[test]
    fn test_build_sample_empty_window() {
        let now = Utc::now();
        let sample = build_sample(now, 0.0, 0.0, 0, 0, 0, &[], 30_000);
        assert!(sample.throughput_tpm.abs() < f64::EPSILON);
        assert!(sample.response_time_ms.abs() < f64::EPSILON);
        assert!(sample.error_rate_pct.abs() < f64::EPSILON);
    }
}
