//! Per-agent circuit breaker.
//!
//! ```text
//!   Closed ──(failures ≥ threshold)──▶ Open ──(cooldown elapsed)──▶ HalfOpen
//!     ▲                                  ▲                              │
//!     └──────(N consecutive successes)───┼──────────────────────────────┤
//!                                        └──────────(any failure)───────┘
//! ```
//!
//! HalfOpen lets at most `half_open_max_requests` trial operations through;
//! the rest are blocked until the trials report back.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

fn default_failure_threshold() -> u32 {
    5
}
fn default_cooldown_ms() -> u64 {
    30_000
}
fn default_success_threshold() -> u32 {
    3
}
fn default_half_open_max_requests() -> u32 {
    3
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_half_open_max_requests")]
    pub half_open_max_requests: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
            success_threshold: default_success_threshold(),
            half_open_max_requests: default_half_open_max_requests(),
        }
    }
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// A state change worth reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerTransition {
    Opened,
    HalfOpened,
    Closed,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_trials: u32,
    opened_at: Option<Instant>,
    last_failure: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            half_open_trials: 0,
            opened_at: None,
            last_failure: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn last_failure(&self) -> Option<Instant> {
        self.last_failure
    }

    /// Move Open → HalfOpen once the cooldown has elapsed.
    pub fn poll(&mut self) -> Option<BreakerTransition> {
        if self.state == CircuitState::Open
            && self
                .opened_at
                .is_some_and(|t| t.elapsed() >= self.config.cooldown())
        {
            self.state = CircuitState::HalfOpen;
            self.success_count = 0;
            self.half_open_trials = 0;
            return Some(BreakerTransition::HalfOpened);
        }
        None
    }

    fn has_capacity(&self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => self.half_open_trials < self.config.half_open_max_requests,
        }
    }

    /// Whether an operation would be let through right now. Does not use up
    /// a half-open trial.
    pub fn allows(&mut self) -> (bool, Option<BreakerTransition>) {
        let transition = self.poll();
        (self.has_capacity(), transition)
    }

    /// Admit one operation. In HalfOpen a `true` answer takes a trial slot.
    pub fn acquire(&mut self) -> (bool, Option<BreakerTransition>) {
        let transition = self.poll();
        let admitted = self.has_capacity();
        if admitted && self.state == CircuitState::HalfOpen {
            self.half_open_trials += 1;
        }
        (admitted, transition)
    }

    /// Trial operations admitted since the breaker went half-open.
    pub fn half_open_trials(&self) -> u32 {
        self.half_open_trials
    }

    pub fn record_success(&mut self) -> Option<BreakerTransition> {
        let polled = self.poll();
        match self.state {
            CircuitState::Closed => {
                self.failure_count = 0;
                polled
            }
            CircuitState::HalfOpen => {
                self.success_count += 1;
                if self.success_count >= self.config.success_threshold {
                    self.state = CircuitState::Closed;
                    self.failure_count = 0;
                    self.success_count = 0;
                    self.half_open_trials = 0;
                    self.opened_at = None;
                    Some(BreakerTransition::Closed)
                } else {
                    polled
                }
            }
            // Still cooling down; successes reported meanwhile do not count.
            CircuitState::Open => None,
        }
    }

    pub fn record_failure(&mut self) -> Option<BreakerTransition> {
        self.poll();
        let now = Instant::now();
        self.last_failure = Some(now);
        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.config.failure_threshold {
                    self.trip(now);
                    Some(BreakerTransition::Opened)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                self.trip(now);
                Some(BreakerTransition::Opened)
            }
            CircuitState::Open => {
                self.failure_count += 1;
                None
            }
        }
    }

    fn trip(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.success_count = 0;
        self.half_open_trials = 0;
    }

    /// Back to a fresh Closed breaker (used after a restart).
    pub fn reset(&mut self) {
        *self = Self::new(self.config.clone());
    }
}
