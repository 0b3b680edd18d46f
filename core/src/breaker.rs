use serde::Deserialize;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;
use tracing::info;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures within the monitoring window before the circuit opens.
    pub failure_threshold: u32,
    /// Window inside which failures accumulate; older failures age out.
    pub monitoring_window: Duration,
    /// How long an open circuit waits before admitting a probe.
    pub reset_timeout: Duration,
    /// Whether timeouts count as failures. Callers whose generators have
    /// legitimately long tails can opt out.
    pub count_timeouts: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            monitoring_window: Duration::from_millis(300_000),
            reset_timeout: Duration::from_millis(60_000),
            count_timeouts: true,
        }
    }
}

#[derive(Debug)]
struct BreakerEntry {
    state: BreakerState,
    failures: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl BreakerEntry {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failures: 0,
            last_failure: None,
            opened_at: None,
            probe_in_flight: false,
        }
    }
}

/// Verdict for an agent call about to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    Allow,
    Reject,
}

/// Per-agent failure gates, keyed by agent name. Owned by the executor;
/// entries live as long as the process. Accesses happen only at agent-call
/// boundaries, so a single mutex over the map is enough.
#[derive(Debug, Default)]
pub struct CircuitBreakerMap {
    entries: Mutex<HashMap<String, BreakerEntry>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerMap {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Gate a call. An open circuit rejects outright until the reset
    /// timeout elapses, then admits exactly one probe at a time.
    pub fn check(&self, agent: &str) -> BreakerDecision {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries
            .entry(agent.to_string())
            .or_insert_with(BreakerEntry::new);

        match entry.state {
            BreakerState::Closed => BreakerDecision::Allow,
            BreakerState::Open => {
                let elapsed = entry.opened_at.map(|at| at.elapsed()).unwrap_or_default();
                if elapsed >= self.config.reset_timeout {
                    info!(agent, "circuit half-open after reset timeout");
                    entry.state = BreakerState::HalfOpen;
                    entry.probe_in_flight = true;
                    BreakerDecision::Allow
                } else {
                    BreakerDecision::Reject
                }
            }
            BreakerState::HalfOpen => {
                if entry.probe_in_flight {
                    BreakerDecision::Reject
                } else {
                    entry.probe_in_flight = true;
                    BreakerDecision::Allow
                }
            }
        }
    }

    pub fn record_success(&self, agent: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries
            .entry(agent.to_string())
            .or_insert_with(BreakerEntry::new);
        if entry.state != BreakerState::Closed {
            info!(agent, "circuit closed after successful call");
        }
        *entry = BreakerEntry::new();
    }

    pub fn record_failure(&self, agent: &str, was_timeout: bool) {
        if was_timeout && !self.config.count_timeouts {
            self.release_probe(agent);
            return;
        }

        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries
            .entry(agent.to_string())
            .or_insert_with(BreakerEntry::new);
        let now = Instant::now();

        match entry.state {
            BreakerState::HalfOpen => {
                warn!(agent, "probe failed; circuit re-opened");
                entry.state = BreakerState::Open;
                entry.opened_at = Some(now);
                entry.last_failure = Some(now);
                entry.probe_in_flight = false;
            }
            _ => {
                // Failures outside the monitoring window no longer count
                // toward the threshold.
                let in_window = entry
                    .last_failure
                    .is_some_and(|at| at.elapsed() <= self.config.monitoring_window);
                entry.failures = if in_window { entry.failures + 1 } else { 1 };
                entry.last_failure = Some(now);

                if entry.failures >= self.config.failure_threshold {
                    warn!(agent, failures = entry.failures, "circuit opened");
                    entry.state = BreakerState::Open;
                    entry.opened_at = Some(now);
                }
            }
        }
    }

    /// Cancellations are not failures; they only release an outstanding
    /// half-open probe so the next call can try again.
    pub fn record_cancelled(&self, agent: &str) {
        self.release_probe(agent);
    }

    pub fn state(&self, agent: &str) -> BreakerState {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(agent)
            .map(|entry| entry.state)
            .unwrap_or(BreakerState::Closed)
    }

    fn release_probe(&self, agent: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.get_mut(agent) {
            entry.probe_in_flight = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            monitoring_window: Duration::from_secs(60),
            reset_timeout: Duration::from_millis(20),
            count_timeouts: true,
        }
    }

    #[test]
    fn opens_after_threshold_failures() {
        let map = CircuitBreakerMap::new(fast_config());
        for _ in 0..2 {
            map.record_failure("a", false);
            assert_eq!(map.state("a"), BreakerState::Closed);
        }
        map.record_failure("a", false);
        assert_eq!(map.state("a"), BreakerState::Open);
        assert_eq!(map.check("a"), BreakerDecision::Reject);
    }

    #[test]
    fn success_resets_failure_count() {
        let map = CircuitBreakerMap::new(fast_config());
        map.record_failure("a", false);
        map.record_failure("a", false);
        map.record_success("a");
        map.record_failure("a", false);
        map.record_failure("a", false);
        assert_eq!(map.state("a"), BreakerState::Closed);
    }

    #[test]
    fn half_open_probe_success_closes() {
        let map = CircuitBreakerMap::new(fast_config());
        for _ in 0..3 {
            map.record_failure("a", false);
        }
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(map.check("a"), BreakerDecision::Allow);
        assert_eq!(map.state("a"), BreakerState::HalfOpen);
        // Only one probe at a time.
        assert_eq!(map.check("a"), BreakerDecision::Reject);
        map.record_success("a");
        assert_eq!(map.state("a"), BreakerState::Closed);
        assert_eq!(map.check("a"), BreakerDecision::Allow);
    }

    #[test]
    fn half_open_probe_failure_reopens() {
        let map = CircuitBreakerMap::new(fast_config());
        for _ in 0..3 {
            map.record_failure("a", false);
        }
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(map.check("a"), BreakerDecision::Allow);
        map.record_failure("a", false);
        assert_eq!(map.state("a"), BreakerState::Open);
        assert_eq!(map.check("a"), BreakerDecision::Reject);
    }

    #[test]
    fn timeouts_can_be_excluded() {
        let map = CircuitBreakerMap::new(CircuitBreakerConfig {
            count_timeouts: false,
            ..fast_config()
        });
        for _ in 0..5 {
            map.record_failure("a", true);
        }
        assert_eq!(map.state("a"), BreakerState::Closed);
    }

    #[test]
    fn cancellation_releases_probe_without_counting() {
        let map = CircuitBreakerMap::new(fast_config());
        for _ in 0..3 {
            map.record_failure("a", false);
        }
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(map.check("a"), BreakerDecision::Allow);
        map.record_cancelled("a");
        assert_eq!(map.state("a"), BreakerState::HalfOpen);
        assert_eq!(map.check("a"), BreakerDecision::Allow);
    }

    #[test]
    fn breakers_are_keyed_per_agent() {
        let map = CircuitBreakerMap::new(fast_config());
        for _ in 0..3 {
            map.record_failure("a", false);
        }
        assert_eq!(map.state("a"), BreakerState::Open);
        assert_eq!(map.state("b"), BreakerState::Closed);
        assert_eq!(map.check("b"), BreakerDecision::Allow);
    }
}
