//! Health monitor
//!
//! Keeps a bounded window of recent operation samples and maps them to a
//! [`HealthState`]. The state is derived, never set directly: every call to
//! [`HealthMonitor::evaluate`] recomputes it from the window plus the pool
//! and audit-backlog figures passed in. Transitions are kept in a history,
//! logged, and raised on the alert bus.
//!
//! Only system-side failures count towards the failure rate. A caller
//! asking for an unknown algorithm or a key it may not use says nothing
//! about the health of the HSM.

use crate::alert::{AlertBus, AlertKind};
use crate::config::HealthConfig;
use crate::error::HsmError;
use crate::pool::PoolStats;
use crate::types::OperationType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum HealthState {
    Healthy,
    Degraded,
    Critical,
}

impl HealthState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Healthy => "HEALTHY",
            Self::Degraded => "DEGRADED",
            Self::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One finished operation, as the monitor sees it.
#[derive(Clone, Debug)]
pub struct Sample {
    pub at: DateTime<Utc>,
    pub operation: OperationType,
    /// Failed for a reason on the system side.
    pub system_failure: bool,
    pub duration_ms: u64,
    pub within_target: bool,
}

impl Sample {
    pub fn new(operation: OperationType, error: Option<&HsmError>, duration_ms: u64, within_target: bool) -> Self {
        Self {
            at: Utc::now(),
            operation,
            system_failure: error.map_or(false, |e| !e.is_caller_error()),
            duration_ms,
            within_target,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct HealthStatus {
    pub state: HealthState,
    pub failure_rate: f64,
    pub average_latency_ms: f64,
    pub target_breach_rate: f64,
    /// Samples in the window.
    pub samples: usize,
    pub pool: Option<PoolStats>,
    /// Audit entries buffered but not yet flushed.
    pub audit_backlog: usize,
    /// Why the state is not `Healthy`. Empty when it is.
    pub reasons: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
pub struct HealthTransition {
    pub at: DateTime<Utc>,
    pub from: HealthState,
    pub to: HealthState,
    pub reason: String,
}

struct MonitorState {
    samples: VecDeque<Sample>,
    state: HealthState,
    /// Most recent transitions, capped at the sample window.
    history: VecDeque<HealthTransition>,
}

pub struct HealthMonitor {
    config: HealthConfig,
    /// Backlog above which the audit path counts as falling behind.
    backlog_limit: usize,
    state: Mutex<MonitorState>,
    alerts: Arc<AlertBus>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, backlog_limit: usize, alerts: Arc<AlertBus>) -> Self {
        Self {
            state: Mutex::new(MonitorState {
                samples: VecDeque::with_capacity(config.window.min(4096)),
                state: HealthState::Healthy,
                history: VecDeque::new(),
            }),
            config,
            backlog_limit,
            alerts,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn record(&self, sample: Sample) {
        let window = self.config.window.max(1);
        let mut state = self.lock();
        state.samples.push_back(sample);
        while state.samples.len() > window {
            state.samples.pop_front();
        }
    }

    /// Last computed state, without recomputing.
    pub fn current_state(&self) -> HealthState {
        self.lock().state
    }

    pub fn history(&self) -> Vec<HealthTransition> {
        self.lock().history.iter().cloned().collect()
    }

    /// Recompute the status and record a transition if the state moved.
    pub fn evaluate(&self, pool: Option<PoolStats>, audit_backlog: usize) -> HealthStatus {
        let (status, transition) = {
            let mut guard = self.lock();
            let status = self.compute(&guard.samples, pool, audit_backlog);
            let transition = if status.state != guard.state {
                let t = HealthTransition {
                    at: status.checked_at,
                    from: guard.state,
                    to: status.state,
                    reason: if status.reasons.is_empty() {
                        "recovered".to_string()
                    } else {
                        status.reasons.join("; ")
                    },
                };
                guard.state = status.state;
                guard.history.push_back(t.clone());
                while guard.history.len() > self.config.window.max(1) {
                    guard.history.pop_front();
                }
                Some(t)
            } else {
                None
            };
            (status, transition)
        };

        // Alert outside the lock: a handler may ask for health itself.
        if let Some(t) = transition {
            if t.to > t.from {
                tracing::warn!(from = %t.from, to = %t.to, reason = %t.reason, "health degraded");
            } else {
                tracing::info!(from = %t.from, to = %t.to, reason = %t.reason, "health improved");
            }
            self.alerts.emit(AlertKind::HealthChanged {
                from: t.from,
                to: t.to,
                reason: t.reason,
            });
        }
        status
    }

    fn compute(&self, samples: &VecDeque<Sample>, pool: Option<PoolStats>, audit_backlog: usize) -> HealthStatus {
        let n = samples.len();
        let (failures, breaches, latency) = samples.iter().fold((0usize, 0usize, 0u64), |(f, b, l), s| {
            (
                f + s.system_failure as usize,
                b + (!s.within_target) as usize,
                l.saturating_add(s.duration_ms),
            )
        });
        let rate = |count: usize| if n == 0 { 0.0 } else { count as f64 / n as f64 };
        let failure_rate = rate(failures);
        let target_breach_rate = rate(breaches);
        let average_latency_ms = if n == 0 { 0.0 } else { latency as f64 / n as f64 };

        let mut state = HealthState::Healthy;
        let mut reasons = Vec::new();
        let mut raise = |to: HealthState, reason: String| {
            state = state.max(to);
            reasons.push(reason);
        };

        if pool.map_or(false, |p| p.shut_down) {
            raise(HealthState::Critical, "connection pool is shut down".into());
        }
        if failure_rate >= self.config.critical_failure_rate && failures > 0 {
            raise(HealthState::Critical, format!("failure rate {:.1}%", failure_rate * 100.0));
        } else if failure_rate >= self.config.degraded_failure_rate && failures > 0 {
            raise(HealthState::Degraded, format!("failure rate {:.1}%", failure_rate * 100.0));
        }
        if target_breach_rate >= self.config.degraded_breach_rate && breaches > 0 {
            raise(
                HealthState::Degraded,
                format!("{:.1}% of operations over target", target_breach_rate * 100.0),
            );
        }
        if audit_backlog > self.backlog_limit {
            raise(HealthState::Degraded, format!("audit backlog {}", audit_backlog));
        }

        HealthStatus {
            state,
            failure_rate,
            average_latency_ms,
            target_breach_rate,
            samples: n,
            pool,
            audit_backlog,
            reasons,
            checked_at: Utc::now(),
        }
    }
}
