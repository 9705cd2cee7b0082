use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use skein_core::config::BreakerConfig;
use skein_core::error::{Result, SkeinError};
use skein_core::event::{EngineEvent, EventBus};

/// Per-tool breaker state. Lives for the process lifetime of the engine.
#[derive(Debug, Clone, Default)]
pub struct BreakerState {
    pub failure_count: u32,
    pub last_failure: Option<Instant>,
    pub open: bool,
    pub opened_at: Option<Instant>,
    /// A half-open trial call is in flight; no other call is admitted.
    pub trial_in_flight: bool,
}

/// Circuit breaker shared across all runs, one state entry per tool id.
///
/// Closed by default. `failure_threshold` consecutive failures open the
/// circuit; while open, calls fail fast. After `cooldown_secs` the breaker
/// admits exactly one trial call: success closes it and resets the
/// counter, failure re-opens it and refreshes the failure timestamp.
pub struct CircuitBreaker {
    states: Mutex<HashMap<String, BreakerState>>,
    config: BreakerConfig,
    event_bus: Arc<EventBus>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, event_bus: Arc<EventBus>) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            config,
            event_bus,
        }
    }

    /// Gate a call: `Ok` admits it (possibly as a half-open trial),
    /// `BreakerOpen` rejects it without touching the backend.
    pub async fn preflight(&self, tool_id: &str) -> Result<()> {
        let mut states = self.states.lock().await;
        let state = states.entry(tool_id.to_string()).or_default();

        if !state.open {
            return Ok(());
        }

        let cooled_down = state
            .opened_at
            .is_some_and(|at| at.elapsed() >= Duration::from_secs(self.config.cooldown_secs));

        if cooled_down && !state.trial_in_flight {
            debug!(tool_id, "Circuit breaker half-open, admitting trial call");
            state.trial_in_flight = true;
            return Ok(());
        }

        Err(SkeinError::BreakerOpen {
            tool: tool_id.to_string(),
        })
    }

    /// Record a successful call. Closes the breaker and resets the counter.
    pub async fn record_success(&self, tool_id: &str) {
        let mut states = self.states.lock().await;
        let state = states.entry(tool_id.to_string()).or_default();
        let was_open = state.open;
        *state = BreakerState::default();
        drop(states);

        if was_open {
            info!(tool_id, "Circuit breaker closed after successful trial");
            self.event_bus.publish(EngineEvent::BreakerClosed {
                tool_id: tool_id.to_string(),
            });
        }
    }

    /// Record a failed call. Opens the breaker at the failure threshold;
    /// a failed half-open trial re-opens it and refreshes the timestamp.
    pub async fn record_failure(&self, tool_id: &str) {
        let mut states = self.states.lock().await;
        let state = states.entry(tool_id.to_string()).or_default();
        let now = Instant::now();
        state.last_failure = Some(now);

        if state.trial_in_flight {
            state.trial_in_flight = false;
            state.opened_at = Some(now);
            drop(states);
            warn!(tool_id, "Half-open trial failed, circuit breaker re-opened");
            self.event_bus.publish(EngineEvent::BreakerOpened {
                tool_id: tool_id.to_string(),
            });
            return;
        }

        state.failure_count += 1;
        if state.failure_count >= self.config.failure_threshold && !state.open {
            state.open = true;
            state.opened_at = Some(now);
            let count = state.failure_count;
            drop(states);
            warn!(
                tool_id,
                consecutive_failures = count,
                "Circuit breaker opened"
            );
            self.event_bus.publish(EngineEvent::BreakerOpened {
                tool_id: tool_id.to_string(),
            });
        }
    }

    /// Force-close breakers that have been open longer than the
    /// configured limit, regardless of trial outcome. Returns how many
    /// were closed.
    pub async fn sweep(&self) -> usize {
        let limit = Duration::from_secs(self.config.force_close_secs);
        let mut closed = Vec::new();

        {
            let mut states = self.states.lock().await;
            for (tool_id, state) in states.iter_mut() {
                if state.open && state.opened_at.is_some_and(|at| at.elapsed() >= limit) {
                    *state = BreakerState::default();
                    closed.push(tool_id.clone());
                }
            }
        }

        for tool_id in &closed {
            info!(tool_id, "Circuit breaker force-closed by sweep");
            self.event_bus.publish(EngineEvent::BreakerClosed {
                tool_id: tool_id.clone(),
            });
        }
        closed.len()
    }

    /// Snapshot a tool's breaker state, if any calls were recorded.
    pub async fn state(&self, tool_id: &str) -> Option<BreakerState> {
        self.states.lock().await.get(tool_id).cloned()
    }

    /// Run the periodic sweep on the configured cron schedule.
    /// Blocks until cancelled.
    pub async fn sweep_loop(self: Arc<Self>, cancel: CancellationToken) {
        let schedule = match Schedule::from_str(&self.config.sweep_schedule) {
            Ok(s) => s,
            Err(e) => {
                warn!(
                    schedule = %self.config.sweep_schedule,
                    error = %e,
                    "Invalid sweep schedule, breaker sweep disabled"
                );
                return;
            }
        };

        info!(schedule = %self.config.sweep_schedule, "Breaker sweep scheduled");

        loop {
            let now = Utc::now();
            let Some(next) = schedule.upcoming(Utc).next() else {
                cancel.cancelled().await;
                return;
            };
            let delay = (next - now).to_std().unwrap_or(Duration::from_secs(1));

            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let closed = self.sweep().await;
                    if closed > 0 {
                        info!(closed, "Breaker sweep force-closed stale circuits");
                    }
                }
                _ = cancel.cancelled() => {
                    info!("Breaker sweep shutting down");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig::default(), Arc::new(EventBus::default()))
    }

    #[tokio::test]
    async fn closed_by_default() {
        let cb = breaker();
        assert!(cb.preflight("t").await.is_ok());
        assert!(cb.state("t").await.is_some());
    }

    #[tokio::test]
    async fn opens_after_five_consecutive_failures() {
        let cb = breaker();
        for _ in 0..4 {
            cb.record_failure("t").await;
            assert!(cb.preflight("t").await.is_ok());
        }
        cb.record_failure("t").await;
        assert!(matches!(
            cb.preflight("t").await,
            Err(SkeinError::BreakerOpen { .. })
        ));
    }

    #[tokio::test]
    async fn success_resets_counter() {
        let cb = breaker();
        for _ in 0..4 {
            cb.record_failure("t").await;
        }
        cb.record_success("t").await;
        assert_eq!(cb.state("t").await.unwrap().failure_count, 0);

        // Four more failures still don't reach the threshold
        for _ in 0..4 {
            cb.record_failure("t").await;
        }
        assert!(cb.preflight("t").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_one_trial() {
        let cb = breaker();
        for _ in 0..5 {
            cb.record_failure("t").await;
        }
        assert!(cb.preflight("t").await.is_err());

        tokio::time::advance(Duration::from_secs(61)).await;

        // Exactly one trial call is admitted
        assert!(cb.preflight("t").await.is_ok());
        assert!(cb.preflight("t").await.is_err());

        // Trial success closes the breaker and resets the counter
        cb.record_success("t").await;
        let state = cb.state("t").await.unwrap();
        assert!(!state.open);
        assert_eq!(state.failure_count, 0);
        assert!(cb.preflight("t").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_reopens() {
        let cb = breaker();
        for _ in 0..5 {
            cb.record_failure("t").await;
        }
        tokio::time::advance(Duration::from_secs(61)).await;

        assert!(cb.preflight("t").await.is_ok());
        cb.record_failure("t").await;

        // Re-opened with a fresh timestamp: still rejecting, and another
        // trial only after a full cooldown
        assert!(cb.preflight("t").await.is_err());
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(cb.preflight("t").await.is_err());
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(cb.preflight("t").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_force_closes_stale_breakers() {
        let cb = breaker();
        for _ in 0..5 {
            cb.record_failure("t").await;
        }
        assert_eq!(cb.sweep().await, 0);

        tokio::time::advance(Duration::from_secs(3601)).await;
        assert_eq!(cb.sweep().await, 1);
        assert!(cb.preflight("t").await.is_ok());
        assert!(!cb.state("t").await.unwrap().open);
    }

    #[tokio::test]
    async fn breaker_events_published() {
        let bus = Arc::new(EventBus::default());
        let cb = CircuitBreaker::new(BreakerConfig::default(), bus.clone());
        let mut rx = bus.subscribe();

        for _ in 0..5 {
            cb.record_failure("t").await;
        }
        assert!(matches!(
            rx.recv().await.unwrap(),
            EngineEvent::BreakerOpened { .. }
        ));
    }
}
