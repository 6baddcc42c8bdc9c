//! Workflow orchestration and lifecycle management
//!
//! The orchestrator owns every session state transition. Each transition runs
//! under the session's claim lock: read the record, compute, write it back.
//! Capability calls happen outside the lock, so a slow step never blocks
//! status reads or cancellation.

use crate::capability::CapabilitySet;
use crate::error::{StepError, StepErrorKind, WorkflowError, WorkflowResult};
use crate::models::admission::{AdmissionTicket, Priority};
use crate::models::configuration::{Configuration, StepTimeouts};
use crate::models::workflow::{
    FallbackPolicy, OptimizedMedia, SessionStatus, StepFailure, StepKind, StepOutput, StepPayload,
    StepStatus, WorkflowSession, WorkflowStatus,
};
use crate::services::logging::log_state_error;
use crate::workflow::admission::{Admission, AdmissionController};
use crate::workflow::circuit_breaker::CircuitBreakerRegistry;
use crate::workflow::persistence::SessionStore;
use crate::workflow::step_executor::StepExecutor;
use crate::workflow::validator::RequestValidator;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const VISUAL_FALLBACK_WARNING: &str = "Visual generation unavailable, continuing with text only";
const OPTIMIZATION_FALLBACK_WARNING: &str = "Media optimization unavailable, original media used";

/// Returned by `start_workflow`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowStarted {
    pub session_id: Uuid,
    pub ticket: AdmissionTicket,
}

/// Result of one `step_once` pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Nothing to run: not admitted yet, or a step is already in flight
    Idle,
    /// A step settled and the session keeps running
    Progressed,
    /// The session is terminal
    Terminal,
}

/// In-process coordination for one session
struct SessionSlot {
    claim: Mutex<()>,
    cancel: CancellationToken,
    ticket: Mutex<Option<Uuid>>,
}

impl SessionSlot {
    fn new() -> Self {
        Self {
            claim: Mutex::new(()),
            cancel: CancellationToken::new(),
            ticket: Mutex::new(None),
        }
    }

    fn claim(&self) -> MutexGuard<'_, ()> {
        self.claim.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_ticket(&self, ticket_id: Uuid) {
        *self.ticket.lock().unwrap_or_else(PoisonError::into_inner) = Some(ticket_id);
    }

    fn take_ticket(&self) -> Option<Uuid> {
        self.ticket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Workflow orchestrator driving sessions through the content pipeline
#[derive(Clone)]
pub struct WorkflowOrchestrator {
    store: Arc<dyn SessionStore>,
    executor: Arc<StepExecutor>,
    admission: Arc<AdmissionController>,
    capabilities: CapabilitySet,
    timeouts: StepTimeouts,
    auto_advance: bool,
    slots: Arc<DashMap<Uuid, Arc<SessionSlot>>>,
}

impl WorkflowOrchestrator {
    /// Create new workflow orchestrator
    pub fn new(
        store: Arc<dyn SessionStore>,
        executor: Arc<StepExecutor>,
        admission: Arc<AdmissionController>,
        capabilities: CapabilitySet,
        timeouts: StepTimeouts,
    ) -> Self {
        Self {
            store,
            executor,
            admission,
            capabilities,
            timeouts,
            auto_advance: true,
            slots: Arc::new(DashMap::new()),
        }
    }

    /// Wire breakers, executor and admission from configuration
    pub fn from_config(
        config: &Configuration,
        store: Arc<dyn SessionStore>,
        capabilities: CapabilitySet,
    ) -> Self {
        let breakers = Arc::new(CircuitBreakerRegistry::new(&config.breaker));
        let executor = Arc::new(StepExecutor::new(breakers.clone(), config.retry.clone()));
        let admission =
            Arc::new(AdmissionController::new(config.admission.clone()).with_breakers(breakers));

        Self::new(
            store,
            executor,
            admission,
            capabilities,
            config.timeouts.clone(),
        )
        .with_auto_advance(config.auto_advance)
    }

    /// When false, steps only run on explicit `advance` calls
    pub fn with_auto_advance(mut self, auto_advance: bool) -> Self {
        self.auto_advance = auto_advance;
        self
    }

    pub fn admission(&self) -> Arc<AdmissionController> {
        self.admission.clone()
    }

    pub fn breakers(&self) -> Arc<CircuitBreakerRegistry> {
        self.executor.breakers()
    }

    fn register(&self, session_id: Uuid) -> Arc<SessionSlot> {
        Arc::clone(
            self.slots
                .entry(session_id)
                .or_insert_with(|| Arc::new(SessionSlot::new()))
                .value(),
        )
    }

    /// Slot for a stored session
    ///
    /// Only sessions that can still change are registered. Terminal sessions
    /// get a detached slot, and unknown ids fail before anything is created.
    fn slot_for(&self, session_id: Uuid) -> WorkflowResult<Arc<SessionSlot>> {
        if let Some(slot) = self.slots.get(&session_id) {
            return Ok(Arc::clone(slot.value()));
        }
        if self.load(session_id)?.is_terminal() {
            return Ok(Arc::new(SessionSlot::new()));
        }
        Ok(self.register(session_id))
    }

    fn load(&self, session_id: Uuid) -> WorkflowResult<WorkflowSession> {
        self.store
            .get(session_id)?
            .ok_or(WorkflowError::NotFound(session_id))
    }

    /// Load under the claim; a session that disappeared gives up its slot
    fn load_live(&self, session_id: Uuid, slot: &SessionSlot) -> WorkflowResult<WorkflowSession> {
        self.load(session_id).map_err(|e| {
            if matches!(e, WorkflowError::NotFound(_)) {
                self.finish(session_id, slot);
            }
            e
        })
    }

    fn reject(&self, session_id: Uuid, step: Option<StepKind>, error: WorkflowError) -> WorkflowError {
        log_state_error(session_id, step, &error);
        error
    }

    fn terminal_error(&self, session: &WorkflowSession, operation: &str) -> WorkflowError {
        self.reject(
            session.id,
            None,
            WorkflowError::InvalidState(format!(
                "cannot {} session in {:?} state",
                operation, session.status
            )),
        )
    }

    /// Give the session's admission slot back, whether granted or still queued
    fn release_ticket(&self, slot: &SessionSlot) {
        if let Some(ticket_id) = slot.take_ticket() {
            self.admission.discard(ticket_id);
        }
    }

    fn finish(&self, session_id: Uuid, slot: &SessionSlot) {
        self.release_ticket(slot);
        self.slots.remove(&session_id);
    }

    /// Drop whatever slot is registered for a session known to be terminal
    fn forget(&self, session_id: Uuid) {
        if let Some((_, slot)) = self.slots.remove(&session_id) {
            self.release_ticket(&slot);
        }
    }

    /// Fail a session whose transition could not be persisted
    ///
    /// The stored record is marked Failed, together with the step left in
    /// flight, and the admission slot is released. If that write fails too
    /// the record stays as stored until `resume_incomplete` runs on the next
    /// start.
    fn abandon(
        &self,
        session_id: Uuid,
        slot: &SessionSlot,
        step: Option<usize>,
        error: WorkflowError,
    ) -> WorkflowError {
        tracing::error!(session_id = %session_id, "Failed to persist session transition: {}", error);
        slot.cancel.cancel();
        {
            let _claim = slot.claim();
            match self.load(session_id) {
                Ok(mut session) if !session.is_terminal() => {
                    let failure = StepFailure {
                        code: error.code().to_string(),
                        message: "The session could not be saved".to_string(),
                        retryable: error.is_retryable(),
                        attempts: 0,
                    };
                    if let Some(step) = step.and_then(|index| session.steps.get_mut(index)) {
                        if step.status == StepStatus::InProgress {
                            step.status = StepStatus::Failed;
                            step.finished_at = Some(Utc::now());
                            step.last_error = Some(failure.clone());
                        }
                    }
                    session.status = SessionStatus::Failed;
                    session.error = Some(failure);
                    session.touch();
                    if let Err(e) = self.store.put(&session) {
                        tracing::error!(session_id = %session_id, "Failed to record storage failure: {}", e);
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::error!(session_id = %session_id, "Failed to load session: {}", e),
            }
        }
        self.finish(session_id, slot);
        error
    }

    /// Start a new session for `user_id`
    ///
    /// Validation happens before anything is created. The session is
    /// persisted as Pending and starts running once its admission ticket is
    /// granted.
    pub async fn start_workflow(
        &self,
        prompt: &str,
        user_id: &str,
    ) -> WorkflowResult<WorkflowStarted> {
        if let Err(e) = RequestValidator::validate_start(prompt, user_id) {
            return Err(self.reject(Uuid::nil(), None, e));
        }

        let admission = self
            .admission
            .enqueue_for(Priority::UserInteractive, StepKind::ContentGeneration)?;
        let ticket = admission.ticket.clone();

        let session = WorkflowSession::new(user_id, prompt.trim());
        let session_id = session.id;
        let slot = self.register(session_id);
        slot.set_ticket(ticket.ticket_id);

        if let Err(e) = self.store.put(&session) {
            self.finish(session_id, &slot);
            return Err(e.into());
        }

        tracing::info!(
            session_id = %session_id,
            user_id = %user_id,
            granted = ticket.granted,
            estimated_wait_ms = ticket.estimated_wait_ms,
            "Started workflow session"
        );

        self.spawn_driver(session_id, admission);

        Ok(WorkflowStarted { session_id, ticket })
    }

    fn spawn_driver(&self, session_id: Uuid, admission: Admission) {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            match orchestrator.admission.wait_for_grant(admission).await {
                Ok(ticket) => {
                    if let Err(e) = orchestrator.begin(session_id, ticket).await {
                        tracing::error!(session_id = %session_id, "Workflow driver stopped: {}", e);
                    }
                }
                Err(e) => orchestrator.admission_failed(session_id, e),
            }
        });
    }

    fn spawn_drive(&self, session_id: Uuid) {
        let orchestrator = self.clone();
        tokio::spawn(async move { orchestrator.drive(session_id).await });
    }

    /// Mark an admitted session Running and, in auto mode, run it to the end
    async fn begin(&self, session_id: Uuid, ticket: AdmissionTicket) -> WorkflowResult<()> {
        let slot = match self.slot_for(session_id) {
            Ok(slot) => slot,
            Err(e) => {
                self.admission.discard(ticket.ticket_id);
                return Err(e);
            }
        };
        {
            let _claim = slot.claim();
            let mut session = match self.load_live(session_id, &slot) {
                Ok(session) => session,
                Err(e) => {
                    self.admission.discard(ticket.ticket_id);
                    return Err(e);
                }
            };
            if session.is_terminal() {
                drop(_claim);
                self.finish(session_id, &slot);
                // Granted after the session was cancelled; the slot no longer
                // holds this ticket
                self.admission.discard(ticket.ticket_id);
                return Ok(());
            }
            slot.set_ticket(ticket.ticket_id);
            session.status = SessionStatus::Running;
            session.touch();
            if let Err(e) = self.store.put(&session) {
                drop(_claim);
                return Err(self.abandon(session_id, &slot, None, e.into()));
            }
        }
        tracing::info!(session_id = %session_id, "Workflow session admitted");

        if self.auto_advance {
            self.drive(session_id).await;
        }
        Ok(())
    }

    /// Record why a session never got a slot
    fn admission_failed(&self, session_id: Uuid, error: WorkflowError) {
        let slot = match self.slot_for(session_id) {
            Ok(slot) => slot,
            Err(e) => {
                tracing::error!(session_id = %session_id, "Failed to load session: {}", e);
                self.forget(session_id);
                return;
            }
        };
        let _claim = slot.claim();
        match self.load(session_id) {
            Ok(mut session) if !session.is_terminal() => {
                tracing::warn!(session_id = %session_id, "Admission failed: {}", error);
                session.status = SessionStatus::Failed;
                session.error = Some(StepFailure {
                    code: error.code().to_string(),
                    message: "The system is at capacity, please try again later".to_string(),
                    retryable: error.is_retryable(),
                    attempts: 0,
                });
                session.touch();
                if let Err(e) = self.store.put(&session) {
                    tracing::error!(session_id = %session_id, "Failed to persist admission failure: {}", e);
                }
            }
            // Cancelled while queued
            Ok(_) => {}
            Err(e) => tracing::error!(session_id = %session_id, "Failed to load session: {}", e),
        }
        drop(_claim);
        self.finish(session_id, &slot);
    }

    /// Run steps until the session is idle or terminal
    async fn drive(&self, session_id: Uuid) {
        loop {
            match self.step_once(session_id).await {
                Ok(StepOutcome::Progressed) => continue,
                Ok(_) => break,
                Err(e) => {
                    tracing::error!(session_id = %session_id, "Workflow step failed: {}", e);
                    break;
                }
            }
        }
    }

    /// Claim and run the next runnable step, then apply its result
    pub async fn step_once(&self, session_id: Uuid) -> WorkflowResult<StepOutcome> {
        let slot = self.slot_for(session_id)?;

        let (index, payload) = {
            let _claim = slot.claim();
            let mut session = self.load_live(session_id, &slot)?;
            if session.is_terminal() {
                drop(_claim);
                self.finish(session_id, &slot);
                return Ok(StepOutcome::Terminal);
            }
            if session.status != SessionStatus::Running || session.in_flight_step().is_some() {
                return Ok(StepOutcome::Idle);
            }
            let Some(index) = session.next_runnable_step() else {
                return Ok(StepOutcome::Idle);
            };

            let payload = StepPayload {
                session_id,
                step: session.steps[index].kind,
                prompt: session.prompt.clone(),
                upstream: session.upstream_outputs(index),
            };

            let step = &mut session.steps[index];
            step.reset();
            step.status = StepStatus::InProgress;
            step.started_at = Some(Utc::now());
            session.touch();
            self.store.put(&session)?;
            (index, payload)
        };

        let kind = payload.step;
        tracing::info!(session_id = %session_id, step = %kind, "Running step");

        let outcome = match self.capabilities.get(kind) {
            Some(capability) => {
                self.executor
                    .execute(
                        capability.as_ref(),
                        &payload,
                        self.timeouts.for_step(kind),
                        &slot.cancel,
                    )
                    .await
            }
            None => Err(StepError {
                step: kind,
                kind: StepErrorKind::ServiceError,
                attempts: 0,
                retryable: false,
                detail: format!("no capability configured for {}", kind),
            }),
        };

        if let Ok(result) = &outcome {
            self.admission.record_step_duration(result.duration);
        }

        let _claim = slot.claim();
        let mut session = self.load_live(session_id, &slot)?;
        if slot.cancel.is_cancelled()
            || session.is_terminal()
            || session.steps[index].status != StepStatus::InProgress
        {
            tracing::info!(session_id = %session_id, step = %kind, "Discarding result of cancelled step");
            if session.is_terminal() {
                drop(_claim);
                self.finish(session_id, &slot);
                return Ok(StepOutcome::Terminal);
            }
            return Ok(StepOutcome::Idle);
        }

        let now = Utc::now();
        let step = &mut session.steps[index];
        step.finished_at = Some(now);
        match outcome {
            Ok(result) => {
                step.status = StepStatus::Completed;
                step.attempts = result.attempts;
                step.result = Some(result.output);
                tracing::info!(session_id = %session_id, step = %kind, attempts = result.attempts, "Step completed");
            }
            Err(err) => {
                let failure = err.to_failure();
                step.attempts = err.attempts;
                step.last_error = Some(failure.clone());
                match kind.fallback() {
                    FallbackPolicy::FailSession => {
                        step.status = StepStatus::Failed;
                        session.status = SessionStatus::Failed;
                        session.error = Some(failure);
                    }
                    FallbackPolicy::TextOnly => {
                        step.status = StepStatus::FallenBack;
                        step.warning = Some(VISUAL_FALLBACK_WARNING.to_string());
                    }
                    FallbackPolicy::SubstituteOriginal => {
                        step.status = StepStatus::FallenBack;
                        step.warning = Some(OPTIMIZATION_FALLBACK_WARNING.to_string());
                        step.result = Some(StepOutput::Optimization(OptimizedMedia::unoptimized(
                            payload.visual(),
                        )));
                    }
                }
                tracing::warn!(
                    session_id = %session_id,
                    step = %kind,
                    attempts = err.attempts,
                    code = err.kind.code(),
                    fallback = ?kind.fallback(),
                    "Step failed"
                );
            }
        }

        session.sync_cursor();
        if session.status == SessionStatus::Running && session.all_settled() {
            session.status = SessionStatus::Completed;
        }
        session.touch();
        if let Err(e) = self.store.put(&session) {
            drop(_claim);
            return Err(self.abandon(session_id, &slot, Some(index), e.into()));
        }

        if session.is_terminal() {
            tracing::info!(session_id = %session_id, status = ?session.status, "Workflow session finished");
            drop(_claim);
            self.finish(session_id, &slot);
            return Ok(StepOutcome::Terminal);
        }
        Ok(StepOutcome::Progressed)
    }

    /// Current status view; never mutates the session
    pub fn get_status(&self, session_id: Uuid) -> WorkflowResult<WorkflowStatus> {
        self.load(session_id)
            .map(|session| session.status_view())
            .map_err(|e| self.reject(session_id, None, e))
    }

    /// Sessions of one user, oldest first
    pub fn list_sessions(&self, user_id: &str) -> WorkflowResult<Vec<WorkflowStatus>> {
        Ok(self
            .store
            .list_by_user(user_id)?
            .iter()
            .map(WorkflowSession::status_view)
            .collect())
    }

    /// Run the next pending step
    ///
    /// A no-op when a step is already in flight or the session is still
    /// waiting for admission. In auto mode the remaining steps continue in
    /// the background.
    pub async fn advance(&self, session_id: Uuid) -> WorkflowResult<WorkflowStatus> {
        let session = self
            .load(session_id)
            .map_err(|e| self.reject(session_id, None, e))?;
        if session.is_terminal() {
            self.forget(session_id);
            return Err(self.terminal_error(&session, "advance"));
        }

        let outcome = self.step_once(session_id).await?;
        if self.auto_advance && outcome == StepOutcome::Progressed {
            self.spawn_drive(session_id);
        }
        self.get_status(session_id)
    }

    /// Reset one step and run it again
    ///
    /// Every other step is left exactly as it was.
    pub async fn regenerate_step(
        &self,
        session_id: Uuid,
        step_name: &str,
    ) -> WorkflowResult<WorkflowStatus> {
        let kind: StepKind = step_name
            .parse()
            .map_err(|e| self.reject(session_id, None, WorkflowError::InvalidInput(e)))?;

        let slot = self
            .slot_for(session_id)
            .map_err(|e| self.reject(session_id, Some(kind), e))?;
        {
            let _claim = slot.claim();
            let mut session = self
                .load_live(session_id, &slot)
                .map_err(|e| self.reject(session_id, Some(kind), e))?;
            if session.is_terminal() {
                drop(_claim);
                self.finish(session_id, &slot);
                return Err(self.terminal_error(&session, "regenerate a step of"));
            }
            if let Some(index) = session.in_flight_step() {
                return Err(self.reject(
                    session_id,
                    Some(kind),
                    WorkflowError::InvalidState(format!(
                        "step {} is in progress",
                        session.steps[index].kind
                    )),
                ));
            }
            let index = session
                .step_index(kind)
                .ok_or_else(|| WorkflowError::InvalidInput(format!("Unknown step '{}'", kind)))?;
            session.steps[index].reset();
            session.touch();
            self.store.put(&session)?;
        }
        tracing::info!(session_id = %session_id, step = %kind, "Regenerating step");

        self.advance(session_id).await
    }

    /// Cancel a session
    ///
    /// A step already in flight is asked to stop; its result, if it still
    /// arrives, is discarded.
    pub async fn cancel(&self, session_id: Uuid) -> WorkflowResult<WorkflowStatus> {
        let slot = self
            .slot_for(session_id)
            .map_err(|e| self.reject(session_id, None, e))?;
        let status = {
            let _claim = slot.claim();
            let mut session = self
                .load_live(session_id, &slot)
                .map_err(|e| self.reject(session_id, None, e))?;
            if session.is_terminal() {
                drop(_claim);
                self.finish(session_id, &slot);
                return Err(self.terminal_error(&session, "cancel"));
            }

            session.status = SessionStatus::Cancelled;
            if let Some(index) = session.in_flight_step() {
                let step = &mut session.steps[index];
                let attempts = step.attempts;
                step.reset();
                step.last_error = Some(StepError::cancelled(step.kind, attempts).to_failure());
            }
            session.touch();
            self.store.put(&session)?;
            slot.cancel.cancel();
            session.status_view()
        };

        self.finish(session_id, &slot);
        tracing::info!(session_id = %session_id, "Cancelled workflow session");
        Ok(status)
    }

    /// Re-admit sessions left unfinished by a previous process
    ///
    /// Steps caught in flight are reset to Pending. Resumed sessions queue in
    /// the background lane behind interactive work.
    pub fn resume_incomplete(&self) -> WorkflowResult<usize> {
        let mut resumed = 0;
        for mut session in self.store.list_incomplete()? {
            let session_id = session.id;
            let mut interrupted = false;
            for step in session
                .steps
                .iter_mut()
                .filter(|step| step.status == StepStatus::InProgress)
            {
                step.reset();
                interrupted = true;
            }
            if interrupted {
                session.touch();
                self.store.put(&session)?;
            }

            let admission = match self.admission.enqueue(Priority::Background) {
                Ok(admission) => admission,
                Err(e) => {
                    tracing::warn!(session_id = %session_id, "Could not re-admit session: {}", e);
                    continue;
                }
            };
            self.register(session_id).set_ticket(admission.ticket.ticket_id);
            self.spawn_driver(session_id, admission);
            resumed += 1;
        }

        if resumed > 0 {
            tracing::info!("Resumed {} incomplete workflow session(s)", resumed);
        }
        Ok(resumed)
    }
}
