use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

fn default_failure_threshold() -> u32 {
    5
}
fn default_window_secs() -> u64 {
    60
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_success_threshold() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold", rename = "failureThreshold")]
    pub failure_threshold: u32,
    /// Sliding window over which failures are counted.
    #[serde(default = "default_window_secs", rename = "windowSecs")]
    pub window_secs: u64,
    /// Cooldown in `open` before a half-open probe is allowed.
    #[serde(default = "default_timeout_secs", rename = "timeoutSecs")]
    pub timeout_secs: u64,
    /// Consecutive successes needed to close from half-open.
    #[serde(default = "default_success_threshold", rename = "successThreshold")]
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            window_secs: default_window_secs(),
            timeout_secs: default_timeout_secs(),
            success_threshold: default_success_threshold(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Sliding-window circuit breaker guarding calls to a single model key.
///
/// Transitions: closed → open when window failures reach the threshold;
/// open → half_open after the cooldown; half_open → closed after enough
/// consecutive successes; any half_open failure reopens.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: CircuitState,
    failure_timestamps: VecDeque<Instant>,
    consecutive_successes: u32,
    state_changed_at: Instant,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: CircuitState::Closed,
            failure_timestamps: VecDeque::new(),
            consecutive_successes: 0,
            state_changed_at: Instant::now(),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Check whether a request may proceed, performing the open → half_open
    /// transition when the cooldown has elapsed.
    pub fn can_execute(&mut self) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = self.state_changed_at.elapsed().as_secs_f64();
                if elapsed > self.config.timeout_secs as f64 {
                    info!(
                        "circuit '{}' cooldown elapsed ({elapsed:.1}s), probing half-open",
                        self.name
                    );
                    self.change_state(CircuitState::HalfOpen);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Seconds until the next half-open probe is allowed. Zero outside `open`.
    pub fn retry_in_secs(&self) -> u64 {
        if self.state != CircuitState::Open {
            return 0;
        }
        self.config
            .timeout_secs
            .saturating_sub(self.state_changed_at.elapsed().as_secs())
    }

    pub fn record_success(&mut self) {
        self.consecutive_successes += 1;
        if self.state == CircuitState::HalfOpen
            && self.consecutive_successes >= self.config.success_threshold
        {
            info!("circuit '{}' recovered, closing", self.name);
            self.change_state(CircuitState::Closed);
        }
    }

    pub fn record_failure(&mut self) {
        self.consecutive_successes = 0;
        self.failure_timestamps.push_back(Instant::now());
        self.prune_window();

        match self.state {
            CircuitState::HalfOpen => {
                warn!("circuit '{}' probe failed, reopening", self.name);
                self.change_state(CircuitState::Open);
            }
            CircuitState::Closed => {
                if self.failure_timestamps.len() >= self.config.failure_threshold as usize {
                    warn!(
                        "circuit '{}' opened: {} failures within {}s",
                        self.name,
                        self.failure_timestamps.len(),
                        self.config.window_secs
                    );
                    self.change_state(CircuitState::Open);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn prune_window(&mut self) {
        let window = std::time::Duration::from_secs(self.config.window_secs);
        while let Some(oldest) = self.failure_timestamps.front() {
            if oldest.elapsed() > window {
                self.failure_timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn change_state(&mut self, new_state: CircuitState) {
        if new_state != self.state {
            debug!("circuit '{}': {} -> {}", self.name, self.state, new_state);
            self.state = new_state;
            self.state_changed_at = Instant::now();
            self.consecutive_successes = 0;
            if new_state == CircuitState::Closed {
                self.failure_timestamps.clear();
            }
        }
    }
}

/// Per-model breaker map. Breakers persist across requests so one request's
/// failures protect the next.
pub struct BreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<CircuitBreaker>>>>,
}

impl BreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn breaker_for(&self, model: &str) -> Arc<tokio::sync::Mutex<CircuitBreaker>> {
        let mut map = self
            .breakers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        map.entry(model.to_string())
            .or_insert_with(|| {
                Arc::new(tokio::sync::Mutex::new(CircuitBreaker::new(
                    model,
                    self.config.clone(),
                )))
            })
            .clone()
    }
}
