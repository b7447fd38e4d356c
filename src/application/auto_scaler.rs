//! Auto-scaler.
//!
//! Closed-loop controller over the agent pool. Each tick reads the
//! latest metrics sample, consults the adopted policy, and moves the
//! pool by at most one agent, recording every decision as an
//! append-only scaling action. Thresholds form a strict hysteresis
//! band (`down < target < up`) enforced at policy write time.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::application::coordinator::SwarmCoordinator;
use crate::application::metrics_collector::MetricsRing;
use crate::application::retry::retry_storage;
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    Config, MetricsSample, ScalingAction, ScalingKind, ScalingPolicy,
};
use crate::domain::ports::{Clock, IdSource, ScalingRepository};
use crate::services::event_bus::{EventBus, EventPayload};

/// What one evaluation decided.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Decision {
    Up(String),
    Down(String),
    Hold,
}

pub struct AutoScaler {
    coordinator: Arc<SwarmCoordinator>,
    repo: Arc<dyn ScalingRepository>,
    ring: Arc<MetricsRing>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdSource>,
    config: Config,
    shutdown_tx: broadcast::Sender<()>,
}

impl AutoScaler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        coordinator: Arc<SwarmCoordinator>,
        repo: Arc<dyn ScalingRepository>,
        ring: Arc<MetricsRing>,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdSource>,
        config: Config,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            coordinator,
            repo,
            ring,
            bus,
            clock,
            ids,
            config,
            shutdown_tx,
        }
    }

    /// Spawn the control loop.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let scaler = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(scaler.config.scale_interval_ms));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                interval_ms = scaler.config.scale_interval_ms,
                "Auto-scaler started"
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = scaler.tick().await {
                            // Scaling failures never bring the loop down.
                            warn!(error = %e, "Auto-scaler tick failed");
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            info!("Auto-scaler stopped");
        })
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// One evaluation of the control loop. Returns the executed action,
    /// if any. Exposed for tests and for the loop.
    pub async fn tick(&self) -> DomainResult<Option<ScalingAction>> {
        let Some(mut policy) = self.repo.get_current_policy().await? else {
            return Ok(None);
        };
        if !policy.enabled {
            return Ok(None);
        }
        let now = self.clock.now();
        if !policy.cooldown_elapsed(now) {
            debug!(policy = %policy.name, "Cooldown active, holding");
            return Ok(None);
        }
        let Some(sample) = self.ring.latest().await else {
            return Ok(None);
        };

        let active = self.coordinator.active_agent_count().await as u32;
        let decision = decide(
            &policy,
            &sample,
            active,
            self.config.metrics.queue_high_watermark,
            self.config.metrics.response_time_high_ms,
        );

        let (kind, reason) = match decision {
            Decision::Hold => return Ok(None),
            Decision::Up(reason) => (ScalingKind::Up, reason),
            Decision::Down(reason) => (ScalingKind::Down, reason),
        };

        let action = self.execute_unit(kind, &reason, active).await?;

        policy.last_triggered_at = Some(now);
        retry_storage(&self.config.retry, || self.repo.put_policy(&policy)).await?;
        Ok(Some(action))
    }

    /// Execute one unit of change, recording the action through its
    /// `pending → in_progress → completed|failed` lifecycle.
    async fn execute_unit(
        &self,
        kind: ScalingKind,
        reason: &str,
        from_count: u32,
    ) -> DomainResult<ScalingAction> {
        let now = self.clock.now();
        let mut action = ScalingAction::new(self.ids.new_id(), kind, reason, from_count, now);
        retry_storage(&self.config.retry, || self.repo.put_action(&action)).await?;

        action.begin();
        retry_storage(&self.config.retry, || self.repo.put_action(&action)).await?;

        let result = match kind {
            ScalingKind::Up => self.coordinator.spawn_for_scaler().await.map(|_| ()),
            ScalingKind::Down => self.coordinator.stop_for_scaler().await.map(|_| ()),
            ScalingKind::Rebalance => Ok(()),
        };

        let finished_at = self.clock.now();
        match result {
            Ok(()) => {
                let to_count = match kind {
                    ScalingKind::Up => from_count + 1,
                    ScalingKind::Down => from_count.saturating_sub(1),
                    ScalingKind::Rebalance => from_count,
                };
                action.complete(to_count, finished_at);
                info!(kind = kind.as_str(), from_count, to_count, reason, "Scaled");
            }
            Err(ref e) => {
                action.fail(e.to_string(), finished_at);
                warn!(kind = kind.as_str(), error = %e, "Scaling action failed");
            }
        }
        retry_storage(&self.config.retry, || self.repo.put_action(&action)).await?;

        self.bus.publish(
            EventPayload::ScalingTriggered {
                action_id: action.id,
                kind,
                reason: reason.to_string(),
                from_count,
                to_count: action.to_count,
            },
            finished_at,
        );
        result.map(|()| action)
    }

    /// Explicit one-shot `scale up|down n`. Bounds come from the adopted
    /// policy when one exists, otherwise from the global agent ceiling.
    pub async fn manual_scale(
        &self,
        kind: ScalingKind,
        n: u32,
    ) -> DomainResult<Vec<ScalingAction>> {
        let policy = self.repo.get_current_policy().await?;
        let (min, max) = policy
            .as_ref()
            .map_or((0, self.config.max_agents), |p| (p.min_agents, p.max_agents));

        let mut actions = Vec::new();
        for _ in 0..n {
            let active = self.coordinator.active_agent_count().await as u32;
            let target = match kind {
                ScalingKind::Up => active + 1,
                ScalingKind::Down => active.saturating_sub(1),
                ScalingKind::Rebalance => active,
            };
            if target > max {
                return Err(DomainError::LimitViolation(format!(
                    "target {target} exceeds max_agents {max}"
                )));
            }
            if matches!(kind, ScalingKind::Down) && target < min {
                return Err(DomainError::LimitViolation(format!(
                    "target {target} below min_agents {min}"
                )));
            }
            actions.push(self.execute_unit(kind, "manual scale", active).await?);
        }

        // Manual actions participate in cooldown bookkeeping.
        if let Some(mut policy) = policy {
            if !actions.is_empty() {
                policy.last_triggered_at = Some(self.clock.now());
                retry_storage(&self.config.retry, || self.repo.put_policy(&policy)).await?;
            }
        }
        Ok(actions)
    }

    /// Validate and adopt a policy. The hysteresis invariant is enforced
    /// here, before anything is written.
    pub async fn set_policy(&self, policy: ScalingPolicy) -> DomainResult<()> {
        policy.validate().map_err(DomainError::InvalidPolicy)?;
        if policy.max_agents > self.config.max_agents {
            return Err(DomainError::InvalidPolicy(format!(
                "policy max_agents {} exceeds configured ceiling {}",
                policy.max_agents, self.config.max_agents
            )));
        }
        retry_storage(&self.config.retry, || self.repo.put_policy(&policy)).await?;
        info!(policy = %policy.name, "Scaling policy adopted");
        Ok(())
    }

    pub async fn current_policy(&self) -> DomainResult<Option<ScalingPolicy>> {
        Ok(self.repo.get_current_policy().await?)
    }

    pub async fn list_actions(&self, limit: usize) -> DomainResult<Vec<ScalingAction>> {
        Ok(self.repo.list_actions(limit).await?)
    }
}

/// Scale-up wins over scale-down whenever both are eligible.
fn decide(
    policy: &ScalingPolicy,
    sample: &MetricsSample,
    active: u32,
    queue_high: usize,
    rt_high: f64,
) -> Decision {
    if active < policy.max_agents {
        if sample.cpu_pct > policy.scale_up_threshold {
            return Decision::Up(format!(
                "cpu {:.1}% above threshold {:.1}%",
                sample.cpu_pct, policy.scale_up_threshold
            ));
        }
        if sample.queue_len > queue_high {
            return Decision::Up(format!(
                "queue length {} above watermark {queue_high}",
                sample.queue_len
            ));
        }
        if sample.response_time_ms > rt_high {
            return Decision::Up(format!(
                "response time {:.0}ms above watermark {rt_high:.0}ms",
                sample.response_time_ms
            ));
        }
    }

    if active > policy.min_agents
        && sample.cpu_pct < policy.scale_down_threshold
        && sample.queue_len == 0
        && sample.idle_agents > 0
    {
        return Decision::Down(format!(
            "cpu {:.1}% below threshold {:.1}%, queue empty, {} idle",
            sample.cpu_pct, policy.scale_down_threshold, sample.idle_agents
        ));
    }

    Decision::Hold
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn sample(cpu: f64, queue_len: usize, idle: usize, rt_ms: f64) -> MetricsSample {
        let mut s = MetricsSample::empty(Utc::now());
        s.cpu_pct = cpu;
        s.queue_len = queue_len;
        s.idle_agents = idle;
        s.response_time_ms = rt_ms;
        s
    }

    fn policy() -> ScalingPolicy {
        let mut p = ScalingPolicy::new(Uuid::new_v4(), "test");
        p.min_agents = 1;
        p.max_agents = 5;
        p.target_utilization = 70.0;
        p.scale_up_threshold = 80.0;
        p.scale_down_threshold = 60.0;
        p
    }

    const QUEUE_HIGH: usize = 5;
    const RT_HIGH: f64 = 5_000.0;

    #[test]
    fn test_scale_up_on_cpu() {
        let d = decide(&policy(), &sample(95.0, 0, 0, 0.0), 2, QUEUE_HIGH, RT_HIGH);
        assert!(matches!(d, Decision::Up(_)));
    }

    #[test]
    fn test_scale_up_on_queue() {
        let d = decide(&policy(), &sample(10.0, 8, 0, 0.0), 2, QUEUE_HIGH, RT_HIGH);
        assert!(matches!(d, Decision::Up(_)));
    }

    #[test]
    fn test_scale_up_on_response_time() {
        let d = decide(&policy(), &sample(10.0, 0, 0, 8_000.0), 2, QUEUE_HIGH, RT_HIGH);
        assert!(matches!(d, Decision::Up(_)));
    }

    #[test]
    fn test_no_scale_up_at_max() {
        let d = decide(&policy(), &sample(95.0, 8, 0, 9_000.0), 5, QUEUE_HIGH, RT_HIGH);
        assert_eq!(d, Decision::Hold);
    }

    #[test]
    fn test_scale_down_when_quiet() {
        let d = decide(&policy(), &sample(20.0, 0, 2, 0.0), 3, QUEUE_HIGH, RT_HIGH);
        assert!(matches!(d, Decision::Down(_)));
    }

    #[test]
    fn test_no_scale_down_at_min() {
        let d = decide(&policy(), &sample(20.0, 0, 1, 0.0), 1, QUEUE_HIGH, RT_HIGH);
        assert_eq!(d, Decision::Hold);
    }

    #[test]
    fn test_no_scale_down_with_queued_work() {
        let d = decide(&policy(), &sample(20.0, 1, 2, 0.0), 3, QUEUE_HIGH, RT_HIGH);
        assert_eq!(d, Decision::Hold);
    }

    #[test]
    fn test_no_scale_down_without_idle_agents() {
        let d = decide(&policy(), &sample(20.0, 0, 0, 0.0), 3, QUEUE_HIGH, RT_HIGH);
        assert_eq!(d, Decision::Hold);
    }

    #[test]
    fn test_hysteresis_band_holds() {
        // cpu at target: inside the band, no action either way.
        let d = decide(&policy(), &sample(70.0, 0, 2, 0.0), 3, QUEUE_HIGH, RT_HIGH);
        assert_eq!(d, Decision::Hold);
    }

    #[test]
    fn test_up_wins_over_down() {
        // Queue pressure forces up even though cpu alone reads quiet.
        let d = decide(&policy(), &sample(20.0, 10, 2, 0.0), 3, QUEUE_HIGH, RT_HIGH);
        assert!(matches!(d, Decision::Up(_)));
    }
}
