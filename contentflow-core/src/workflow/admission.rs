//! Admission control for concurrently running workflows
//!
//! A fixed budget of slots is handed out first come, first served. Requests
//! beyond the budget wait in one of two FIFO lanes; the interactive lane is
//! always drained before the background lane.

use crate::error::{WorkflowError, WorkflowResult};
use crate::models::admission::{AdmissionStats, AdmissionTicket, Priority};
use crate::models::configuration::AdmissionConfig;
use crate::models::workflow::StepKind;
use crate::workflow::circuit_breaker::{BreakerState, CircuitBreakerRegistry};
use chrono::Utc;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

struct Waiter {
    ticket: AdmissionTicket,
    grant: oneshot::Sender<()>,
}

#[derive(Default)]
struct AdmissionState {
    active: HashSet<Uuid>,
    interactive: VecDeque<Waiter>,
    background: VecDeque<Waiter>,
    /// Most recent step durations in milliseconds
    durations: VecDeque<u64>,
}

impl AdmissionState {
    fn lane_mut(&mut self, priority: Priority) -> &mut VecDeque<Waiter> {
        match priority {
            Priority::UserInteractive => &mut self.interactive,
            Priority::Background => &mut self.background,
        }
    }
}

/// A ticket plus the pending grant for queued tickets
pub struct Admission {
    pub ticket: AdmissionTicket,
    grant: Option<oneshot::Receiver<()>>,
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        self.grant.is_none()
    }
}

/// Bounds the number of concurrently admitted workflows
pub struct AdmissionController {
    config: AdmissionConfig,
    breakers: Option<Arc<CircuitBreakerRegistry>>,
    state: Mutex<AdmissionState>,
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            config,
            breakers: None,
            state: Mutex::new(AdmissionState::default()),
        }
    }

    /// Consult breakers so work for an unavailable capability is turned away
    pub fn with_breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    fn state(&self) -> MutexGuard<'_, AdmissionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn average_ms(&self, state: &AdmissionState) -> u64 {
        if state.durations.is_empty() {
            return self.config.initial_step_estimate_ms;
        }
        let total: u64 = state.durations.iter().sum();
        (total / state.durations.len() as u64).max(1)
    }

    /// Request a slot
    ///
    /// Grants immediately while under budget (`estimated_wait_ms = 0`),
    /// otherwise queues the ticket at the back of its lane.
    pub fn enqueue(&self, priority: Priority) -> WorkflowResult<Admission> {
        let mut state = self.state();
        let mut ticket = AdmissionTicket {
            ticket_id: Uuid::new_v4(),
            enqueued_at: Utc::now(),
            priority,
            estimated_wait_ms: 0,
            granted: false,
        };

        if state.active.len() < self.config.concurrency_budget {
            ticket.granted = true;
            state.active.insert(ticket.ticket_id);
            return Ok(Admission {
                ticket,
                grant: None,
            });
        }

        let average = self.average_ms(&state);
        let max_depth = self.config.max_queue_depth;
        let lane = state.lane_mut(priority);
        let position = lane.len() as u64 + 1;
        ticket.estimated_wait_ms = position * average;

        if lane.len() >= max_depth {
            tracing::warn!(?priority, "Admission queue full, rejecting request");
            return Err(WorkflowError::CapacityExceeded {
                estimated_wait_ms: ticket.estimated_wait_ms,
            });
        }

        let (tx, rx) = oneshot::channel();
        lane.push_back(Waiter {
            ticket: ticket.clone(),
            grant: tx,
        });
        tracing::debug!(
            ticket_id = %ticket.ticket_id,
            ?priority,
            position,
            estimated_wait_ms = ticket.estimated_wait_ms,
            "Admission request queued"
        );

        Ok(Admission {
            ticket,
            grant: Some(rx),
        })
    }

    /// Like `enqueue`, but refuses work whose capability breaker is open
    pub fn enqueue_for(&self, priority: Priority, capability: StepKind) -> WorkflowResult<Admission> {
        if let Some(breakers) = &self.breakers {
            if breakers.state(capability) == BreakerState::Open {
                let wait = breakers
                    .remaining_cooldown(capability)
                    .unwrap_or_default()
                    .as_millis() as u64;
                tracing::warn!(capability = %capability, "Capability unavailable, rejecting admission");
                return Err(WorkflowError::CapacityExceeded {
                    estimated_wait_ms: wait,
                });
            }
        }
        self.enqueue(priority)
    }

    /// Wait until a queued ticket is granted
    ///
    /// Tickets still queued after the configured queue timeout are discarded
    /// and reported as `CapacityExceeded`.
    pub async fn wait_for_grant(&self, admission: Admission) -> WorkflowResult<AdmissionTicket> {
        let Admission { mut ticket, grant } = admission;
        let Some(rx) = grant else {
            return Ok(ticket);
        };

        match tokio::time::timeout(self.config.queue_timeout(), rx).await {
            Ok(Ok(())) => {
                ticket.granted = true;
                Ok(ticket)
            }
            Ok(Err(_)) => Err(WorkflowError::InvalidState(
                "admission ticket was discarded".to_string(),
            )),
            Err(_) => {
                if self.cancel(ticket.ticket_id) {
                    let estimated_wait_ms = self.average_ms(&self.state());
                    return Err(WorkflowError::CapacityExceeded { estimated_wait_ms });
                }
                // Promoted between the timeout firing and the removal
                ticket.granted = true;
                Ok(ticket)
            }
        }
    }

    /// Fill free slots from the lanes, interactive first
    fn promote(&self, state: &mut AdmissionState) {
        while state.active.len() < self.config.concurrency_budget {
            let next = match state.interactive.pop_front() {
                Some(waiter) => waiter,
                None => match state.background.pop_front() {
                    Some(waiter) => waiter,
                    None => break,
                },
            };
            let id = next.ticket.ticket_id;
            // A closed receiver means the waiter gave up; skip it
            if next.grant.send(()).is_ok() {
                state.active.insert(id);
                tracing::debug!(ticket_id = %id, "Admission granted from queue");
            }
        }
    }

    /// Free a granted slot and promote the next waiter
    pub fn release(&self, ticket_id: Uuid) -> bool {
        let mut state = self.state();
        if !state.active.remove(&ticket_id) {
            return false;
        }
        self.promote(&mut state);
        true
    }

    /// Discard a queued ticket; returns false if it was not waiting
    pub fn cancel(&self, ticket_id: Uuid) -> bool {
        Self::remove_queued(&mut self.state(), ticket_id)
    }

    fn remove_queued(state: &mut AdmissionState, ticket_id: Uuid) -> bool {
        for priority in [Priority::UserInteractive, Priority::Background] {
            let lane = state.lane_mut(priority);
            if let Some(pos) = lane.iter().position(|w| w.ticket.ticket_id == ticket_id) {
                lane.remove(pos);
                return true;
            }
        }
        false
    }

    /// Drop a ticket wherever it is, granted or queued
    ///
    /// Both lookups happen under one lock, so a ticket promoted concurrently
    /// is still released.
    pub fn discard(&self, ticket_id: Uuid) -> bool {
        let mut state = self.state();
        if state.active.remove(&ticket_id) {
            self.promote(&mut state);
            return true;
        }
        Self::remove_queued(&mut state, ticket_id)
    }

    /// Feed the rolling average used for wait estimates
    pub fn record_step_duration(&self, duration: Duration) {
        let window = self.config.rolling_window.max(1);
        let mut state = self.state();
        state.durations.push_back(duration.as_millis() as u64);
        while state.durations.len() > window {
            state.durations.pop_front();
        }
    }

    pub fn average_step_ms(&self) -> u64 {
        self.average_ms(&self.state())
    }

    pub fn active_count(&self) -> usize {
        self.state().active.len()
    }

    pub fn stats(&self) -> AdmissionStats {
        let state = self.state();
        AdmissionStats {
            budget: self.config.concurrency_budget,
            active: state.active.len(),
            queued_interactive: state.interactive.len(),
            queued_background: state.background.len(),
            average_step_ms: self.average_ms(&state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::configuration::BreakerConfig;

    fn controller(budget: usize) -> AdmissionController {
        AdmissionController::new(AdmissionConfig {
            concurrency_budget: budget,
            initial_step_estimate_ms: 1000,
            ..AdmissionConfig::default()
        })
    }

    #[test]
    fn test_grants_immediately_under_budget() {
        let admission = controller(2);
        let first = admission.enqueue(Priority::UserInteractive).unwrap();
        let second = admission.enqueue(Priority::Background).unwrap();

        assert!(first.is_granted());
        assert!(second.is_granted());
        assert_eq!(first.ticket.estimated_wait_ms, 0);
        assert_eq!(admission.active_count(), 2);

        let third = admission.enqueue(Priority::UserInteractive).unwrap();
        assert!(!third.is_granted());
        assert_eq!(third.ticket.estimated_wait_ms, 1000);
    }

    #[tokio::test]
    async fn test_interactive_lane_served_first() {
        let admission = controller(1);
        let holder = admission.enqueue(Priority::Background).unwrap();
        let background = admission.enqueue(Priority::Background).unwrap();
        let interactive = admission.enqueue(Priority::UserInteractive).unwrap();
        let background_id = background.ticket.ticket_id;

        assert!(admission.release(holder.ticket.ticket_id));

        let granted = admission.wait_for_grant(interactive).await.unwrap();
        assert!(granted.granted);
        assert_eq!(admission.stats().queued_background, 1);

        assert!(admission.release(granted.ticket_id));
        let granted = admission.wait_for_grant(background).await.unwrap();
        assert_eq!(granted.ticket_id, background_id);
    }

    #[test]
    fn test_fifo_within_lane() {
        let admission = controller(1);
        let holder = admission.enqueue(Priority::UserInteractive).unwrap();
        let mut first = admission.enqueue(Priority::UserInteractive).unwrap();
        let mut second = admission.enqueue(Priority::UserInteractive).unwrap();

        admission.release(holder.ticket.ticket_id);

        let mut first_rx = first.grant.take().unwrap();
        let mut second_rx = second.grant.take().unwrap();
        assert!(first_rx.try_recv().is_ok());
        assert!(second_rx.try_recv().is_err());
    }

    #[test]
    fn test_estimates_follow_rolling_average() {
        let admission = controller(1);
        let _holder = admission.enqueue(Priority::UserInteractive).unwrap();

        admission.record_step_duration(Duration::from_millis(200));
        admission.record_step_duration(Duration::from_millis(400));
        assert_eq!(admission.average_step_ms(), 300);

        let first = admission.enqueue(Priority::UserInteractive).unwrap();
        let second = admission.enqueue(Priority::UserInteractive).unwrap();
        let background = admission.enqueue(Priority::Background).unwrap();

        assert_eq!(first.ticket.estimated_wait_ms, 300);
        assert_eq!(second.ticket.estimated_wait_ms, 600);
        assert_eq!(background.ticket.estimated_wait_ms, 300);
    }

    #[test]
    fn test_queue_depth_limit() {
        let admission = AdmissionController::new(AdmissionConfig {
            concurrency_budget: 1,
            max_queue_depth: 1,
            ..AdmissionConfig::default()
        });
        let _holder = admission.enqueue(Priority::UserInteractive).unwrap();
        let _queued = admission.enqueue(Priority::UserInteractive).unwrap();

        let err = admission.enqueue(Priority::UserInteractive).err().unwrap();
        assert!(matches!(err, WorkflowError::CapacityExceeded { .. }));
    }

    #[test]
    fn test_cancelled_waiter_is_skipped() {
        let admission = controller(1);
        let holder = admission.enqueue(Priority::UserInteractive).unwrap();
        let gone = admission.enqueue(Priority::UserInteractive).unwrap();
        let mut next = admission.enqueue(Priority::UserInteractive).unwrap();

        assert!(admission.cancel(gone.ticket.ticket_id));
        admission.release(holder.ticket.ticket_id);

        assert!(next.grant.take().unwrap().try_recv().is_ok());
        assert_eq!(admission.active_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_timeout_discards_ticket() {
        let admission = AdmissionController::new(AdmissionConfig {
            concurrency_budget: 1,
            queue_timeout_seconds: 5,
            ..AdmissionConfig::default()
        });
        let _holder = admission.enqueue(Priority::UserInteractive).unwrap();
        let queued = admission.enqueue(Priority::UserInteractive).unwrap();

        let err = admission.wait_for_grant(queued).await.unwrap_err();
        assert!(matches!(err, WorkflowError::CapacityExceeded { .. }));
        assert_eq!(admission.stats().queued_interactive, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_rejects_new_work() {
        let breakers = Arc::new(CircuitBreakerRegistry::new(&BreakerConfig::default()));
        for _ in 0..5 {
            breakers.record_failure(StepKind::ContentGeneration);
        }
        let admission = controller(10).with_breakers(breakers);

        let err = admission
            .enqueue_for(Priority::UserInteractive, StepKind::ContentGeneration)
            .err()
            .unwrap();
        assert_eq!(err.estimated_wait_ms(), Some(30_000));

        assert!(admission
            .enqueue_for(Priority::UserInteractive, StepKind::Packaging)
            .is_ok());
    }

    #[test]
    fn test_discard_releases_granted_or_queued() {
        let admission = controller(1);
        let holder = admission.enqueue(Priority::UserInteractive).unwrap();
        let queued = admission.enqueue(Priority::UserInteractive).unwrap();
        let mut next = admission.enqueue(Priority::Background).unwrap();

        assert!(admission.discard(queued.ticket.ticket_id));
        assert_eq!(admission.stats().queued_interactive, 0);
        assert_eq!(admission.active_count(), 1);

        assert!(admission.discard(holder.ticket.ticket_id));
        assert!(next.grant.take().unwrap().try_recv().is_ok());
        assert_eq!(admission.active_count(), 1);

        // A promoted ticket is found in the active set
        assert!(admission.discard(next.ticket.ticket_id));
        assert_eq!(admission.active_count(), 0);
        assert!(!admission.discard(next.ticket.ticket_id));
    }
}
