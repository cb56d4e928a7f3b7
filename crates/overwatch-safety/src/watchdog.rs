//! [`Watchdog`] – per-agent liveness clock.
//!
//! Every registered agent gets a clock started at registration. Each activity
//! report calls [`Watchdog::touch`], which refreshes the agent's last-activity
//! timestamp and records how many actions the report covered. Health rules
//! read runtime, idle time and recent action rate from here.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Actions older than this no longer count towards the action rate.
pub const ACTION_RATE_WINDOW: Duration = Duration::from_secs(60);

// ────────────────────────────────────────────────────────────────────────────
// AgentClock
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AgentClock {
    pub registered_at: Instant,
    pub last_activity: Instant,
    recent_actions: VecDeque<(Instant, u32)>,
}

impl AgentClock {
    fn started(now: Instant) -> Self {
        Self {
            registered_at: now,
            last_activity: now,
            recent_actions: VecDeque::new(),
        }
    }

    pub fn runtime(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.registered_at)
    }

    pub fn idle(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Actions reported within [`ACTION_RATE_WINDOW`] of `now`.
    pub fn actions_in_window(&self, now: Instant) -> u64 {
        self.recent_actions
            .iter()
            .filter(|(at, _)| now.saturating_duration_since(*at) <= ACTION_RATE_WINDOW)
            .map(|(_, n)| u64::from(*n))
            .sum()
    }

    fn prune(&mut self, now: Instant) {
        while let Some((at, _)) = self.recent_actions.front() {
            if now.saturating_duration_since(*at) > ACTION_RATE_WINDOW {
                self.recent_actions.pop_front();
            } else {
                break;
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Watchdog
// ────────────────────────────────────────────────────────────────────────────

/// Liveness clocks for every registered agent.
///
/// # Example
///
/// ```
/// use std::time::Instant;
/// use overwatch_safety::watchdog::Watchdog;
///
/// let mut wd = Watchdog::new();
/// wd.register("planner");
/// wd.touch("planner", 3, Instant::now());
/// let clock = wd.clock("planner").unwrap();
/// assert_eq!(clock.actions_in_window(Instant::now()), 3);
/// ```
#[derive(Debug, Default)]
pub struct Watchdog {
    agents: HashMap<String, AgentClock>,
}

impl Watchdog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or restart) the clock for `agent_id`.
    pub fn register(&mut self, agent_id: &str) {
        self.agents
            .insert(agent_id.to_string(), AgentClock::started(Instant::now()));
    }

    pub fn forget(&mut self, agent_id: &str) {
        self.agents.remove(agent_id);
    }

    /// Record activity covering `actions` actions. No-op for unknown agents.
    pub fn touch(&mut self, agent_id: &str, actions: u32, now: Instant) {
        if let Some(clock) = self.agents.get_mut(agent_id) {
            clock.last_activity = now;
            if actions > 0 {
                clock.recent_actions.push_back((now, actions));
            }
            clock.prune(now);
        }
    }

    pub fn clock(&self, agent_id: &str) -> Option<&AgentClock> {
        self.agents.get(agent_id)
    }
}
