use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

/// Base delay before the first automatic restart
pub const BASE_BACKOFF_SECS: u64 = 1;

/// Ceiling for the exponential backoff curve
pub const MAX_BACKOFF_SECS: u64 = 60;

/// Restart mode attached to a managed process at registration time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartMode {
    /// Never restart automatically
    Never,
    /// Restart on unexpected exit, bounded by the windowed limit
    OnFailure,
    /// Restart unconditionally (bounded only by backoff)
    Always,
}

/// Restart policy configuration
///
/// Immutable once attached to a process; supplied at registration time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartPolicy {
    /// Restart mode
    pub mode: RestartMode,
    /// Maximum restarts within the window (`None` = unlimited)
    pub max_restarts: Option<usize>,
    /// Sliding window for counting restarts (in seconds)
    pub window_secs: u64,
}

impl RestartPolicy {
    /// Policy that never restarts
    pub fn never() -> Self {
        Self {
            mode: RestartMode::Never,
            max_restarts: None,
            window_secs: 60,
        }
    }

    /// Policy that restarts on failure, at most `max_restarts` times per window
    pub fn on_failure(max_restarts: usize, window_secs: u64) -> Self {
        Self {
            mode: RestartMode::OnFailure,
            max_restarts: Some(max_restarts),
            window_secs,
        }
    }

    /// Policy that always restarts
    pub fn always() -> Self {
        Self {
            mode: RestartMode::Always,
            max_restarts: None,
            window_secs: 60,
        }
    }

    /// Window as a `Duration`
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::on_failure(10, 60)
    }
}

/// Ordered restart timestamps for a process
///
/// Entries older than the policy window are ignored at evaluation time and
/// pruned opportunistically when new entries are recorded.
#[derive(Debug, Clone, Default)]
pub struct RestartHistory {
    restarts: Vec<SystemTime>,
}

impl RestartHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a restart event
    pub fn record(&mut self, at: SystemTime) {
        self.restarts.push(at);
    }

    /// Total recorded restarts (including entries outside the window)
    pub fn len(&self) -> usize {
        self.restarts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.restarts.is_empty()
    }

    /// Time of the most recent restart, if any
    pub fn last(&self) -> Option<SystemTime> {
        self.restarts.last().copied()
    }

    /// Count restarts within `[now - window, now]`
    pub fn count_within(&self, window: Duration, now: SystemTime) -> usize {
        self.restarts
            .iter()
            .filter(|&&at| {
                now.duration_since(at)
                    .map(|elapsed| elapsed < window)
                    .unwrap_or(false)
            })
            .count()
    }

    /// Drop entries older than the window
    pub fn prune(&mut self, window: Duration, now: SystemTime) {
        self.restarts.retain(|&at| {
            now.duration_since(at)
                .map(|elapsed| elapsed < window)
                .unwrap_or(false)
        });
    }

    /// Clear all history
    pub fn clear(&mut self) {
        self.restarts.clear();
    }
}

/// Why a restart was denied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// Policy mode is `never`
    PolicyNever,
    /// Windowed restart limit reached
    RestartLimitExceeded,
}

/// Outcome of a policy evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Restart permitted after waiting `backoff`
    Allow { backoff: Duration },
    /// Restart denied
    Deny { reason: DenyReason },
}

impl RestartDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RestartDecision::Allow { .. })
    }
}

/// Decide whether a restart is permitted right now.
///
/// Pure function over the policy, the restart history and the evaluation
/// instant. Only entries within the sliding window count toward the limit,
/// so a process that survives past the window evaluates against an empty
/// history and gets the base backoff again.
pub fn evaluate(policy: &RestartPolicy, history: &RestartHistory, now: SystemTime) -> RestartDecision {
    let recent = history.count_within(policy.window(), now);

    match policy.mode {
        RestartMode::Never => RestartDecision::Deny {
            reason: DenyReason::PolicyNever,
        },
        RestartMode::Always => RestartDecision::Allow {
            backoff: backoff_for(recent),
        },
        RestartMode::OnFailure => match policy.max_restarts {
            Some(max) if recent >= max => RestartDecision::Deny {
                reason: DenyReason::RestartLimitExceeded,
            },
            _ => RestartDecision::Allow {
                backoff: backoff_for(recent),
            },
        },
    }
}

/// Exponential backoff for the given windowed restart count: 1s, 2s, 4s, ...
/// capped at [`MAX_BACKOFF_SECS`]. Monotonically non-decreasing in the count.
pub fn backoff_for(recent_restarts: usize) -> Duration {
    let secs = BASE_BACKOFF_SECS
        .saturating_mul(2_u64.saturating_pow(recent_restarts.min(u32::MAX as usize) as u32))
        .min(MAX_BACKOFF_SECS);
    Duration::from_secs(secs)
}
