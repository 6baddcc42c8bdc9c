//! Per-capability circuit breakers
//!
//! One breaker per pipeline step's capability, held in a fixed array built at
//! construction. Each cell sits behind its own lock so concurrent failure
//! reports for the same capability are applied one at a time.

use crate::models::configuration::BreakerConfig;
use crate::models::workflow::StepKind;
use serde::Serialize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Externally visible breaker state
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Calls allowed
    Closed,
    /// Calls rejected until the cooldown elapses
    Open,
    /// A single trial call decides the next state
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
enum CellState {
    Closed,
    Open { until: Instant },
    HalfOpen { trial_started: Option<Instant> },
}

#[derive(Debug)]
struct BreakerCell {
    state: CellState,
    consecutive_failures: u32,
}

impl Default for BreakerCell {
    fn default() -> Self {
        Self {
            state: CellState::Closed,
            consecutive_failures: 0,
        }
    }
}

/// Breaker snapshot for health reporting
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub capability: StepKind,
    pub state: BreakerState,
    pub consecutive_failures: u32,
}

/// Breakers for every known capability
pub struct CircuitBreakerRegistry {
    failure_threshold: u32,
    cooldown: Duration,
    cells: [Mutex<BreakerCell>; 4],
}

impl CircuitBreakerRegistry {
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            cooldown: config.cooldown(),
            cells: std::array::from_fn(|_| Mutex::new(BreakerCell::default())),
        }
    }

    fn cell(&self, capability: StepKind) -> MutexGuard<'_, BreakerCell> {
        self.cells[capability as usize]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a call to `capability` may be attempted now
    ///
    /// Moves an expired Open breaker to HalfOpen and hands out its single
    /// trial slot. A trial that never reports back is replaced after one
    /// cooldown period.
    pub fn allow(&self, capability: StepKind) -> bool {
        let now = Instant::now();
        let mut cell = self.cell(capability);
        match cell.state {
            CellState::Closed => true,
            CellState::Open { until } => {
                if now >= until {
                    cell.state = CellState::HalfOpen {
                        trial_started: Some(now),
                    };
                    tracing::info!(capability = %capability, "Circuit breaker half-open, allowing trial call");
                    true
                } else {
                    false
                }
            }
            CellState::HalfOpen { trial_started } => match trial_started {
                Some(started) if now.duration_since(started) < self.cooldown => false,
                _ => {
                    cell.state = CellState::HalfOpen {
                        trial_started: Some(now),
                    };
                    true
                }
            },
        }
    }

    pub fn record_success(&self, capability: StepKind) {
        let mut cell = self.cell(capability);
        cell.consecutive_failures = 0;
        if !matches!(cell.state, CellState::Closed) {
            tracing::info!(capability = %capability, "Circuit breaker closed after successful call");
        }
        cell.state = CellState::Closed;
    }

    pub fn record_failure(&self, capability: StepKind) {
        let now = Instant::now();
        let mut cell = self.cell(capability);
        cell.consecutive_failures = cell.consecutive_failures.saturating_add(1);

        match cell.state {
            CellState::HalfOpen { .. } => {
                cell.state = CellState::Open {
                    until: now + self.cooldown,
                };
                tracing::warn!(capability = %capability, "Trial call failed, circuit breaker reopened");
            }
            CellState::Closed if cell.consecutive_failures >= self.failure_threshold => {
                cell.state = CellState::Open {
                    until: now + self.cooldown,
                };
                tracing::warn!(
                    capability = %capability,
                    failures = cell.consecutive_failures,
                    "Circuit breaker opened after consecutive failures"
                );
            }
            _ => {}
        }
    }

    /// Current state without side effects
    pub fn state(&self, capability: StepKind) -> BreakerState {
        let cell = self.cell(capability);
        match cell.state {
            CellState::Closed => BreakerState::Closed,
            CellState::Open { until } if Instant::now() < until => BreakerState::Open,
            CellState::Open { .. } | CellState::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    /// Time left before an Open breaker admits a trial call
    pub fn remaining_cooldown(&self, capability: StepKind) -> Option<Duration> {
        let cell = self.cell(capability);
        match cell.state {
            CellState::Open { until } => {
                let remaining = until.saturating_duration_since(Instant::now());
                (!remaining.is_zero()).then_some(remaining)
            }
            _ => None,
        }
    }

    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        StepKind::ALL
            .into_iter()
            .map(|capability| BreakerSnapshot {
                capability,
                state: self.state(capability),
                consecutive_failures: self.cell(capability).consecutive_failures,
            })
            .collect()
    }
}
