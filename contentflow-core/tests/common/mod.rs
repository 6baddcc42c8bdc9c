//! Shared fixtures: scripted capabilities and orchestrator wiring

#![allow(dead_code)]

use async_trait::async_trait;
use contentflow_core::capability::{Capability, CapabilitySet};
use contentflow_core::error::CapabilityError;
use contentflow_core::models::{
    AdmissionConfig, Configuration, ImageRef, OptimizedMedia, PackageDescriptor, RetryPolicy,
    StepKind, StepOutput, StepPayload, TextContent, WorkflowStatus,
};
use contentflow_core::workflow::{SessionStore, WorkflowOrchestrator};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

/// How a scripted capability answers
pub enum Behavior {
    Succeed,
    Fail(CapabilityError),
    /// Never answers; only a timeout ends the call
    Hang,
    /// Signals `entered`, then waits for `release` before succeeding
    Gate {
        entered: Arc<Notify>,
        release: Arc<Notify>,
    },
}

pub struct Scripted {
    behavior: Behavior,
    calls: AtomicU32,
    order: Arc<Mutex<Vec<StepKind>>>,
}

impl Scripted {
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

fn output_for(payload: &StepPayload, call: u32) -> StepOutput {
    match payload.step {
        StepKind::ContentGeneration => StepOutput::ContentGeneration(TextContent {
            title: Some("Draft".to_string()),
            body: format!("{} (take {})", payload.prompt, call),
        }),
        StepKind::VisualGeneration => StepOutput::VisualGeneration(ImageRef {
            uri: format!("mem://visual/{}", call),
            mime_type: "image/png".to_string(),
            width: Some(1024),
            height: Some(768),
        }),
        StepKind::Optimization => StepOutput::Optimization(OptimizedMedia {
            source_uri: payload.visual().map(|image| image.uri.clone()),
            uri: payload.visual().map(|image| format!("{}.webp", image.uri)),
            original_bytes: Some(2_000_000),
            optimized_bytes: Some(400_000),
            optimized: payload.visual().is_some(),
        }),
        StepKind::Packaging => StepOutput::Packaging(PackageDescriptor {
            package_uri: format!("mem://package/{}", payload.session_id),
            format: "zip".to_string(),
            includes_visual: payload.visual().is_some(),
        }),
    }
}

#[async_trait]
impl Capability for Scripted {
    async fn invoke(&self, payload: &StepPayload) -> Result<StepOutput, CapabilityError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.order
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(payload.step);

        match &self.behavior {
            Behavior::Succeed => Ok(output_for(payload, call)),
            Behavior::Fail(error) => Err(error.clone()),
            Behavior::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            Behavior::Gate { entered, release } => {
                entered.notify_one();
                release.notified().await;
                Ok(output_for(payload, call))
            }
        }
    }
}

/// One scripted capability per step, sharing an invocation log
pub struct Pipeline {
    pub content: Arc<Scripted>,
    pub visual: Arc<Scripted>,
    pub optimization: Arc<Scripted>,
    pub packaging: Arc<Scripted>,
    pub order: Arc<Mutex<Vec<StepKind>>>,
}

impl Pipeline {
    pub fn healthy() -> Self {
        Self::with(Vec::new())
    }

    /// Every step succeeds except the overridden ones
    pub fn with(overrides: Vec<(StepKind, Behavior)>) -> Self {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut overrides = overrides;
        let mut build = |kind: StepKind| {
            let behavior = overrides
                .iter()
                .position(|(k, _)| *k == kind)
                .map(|i| overrides.remove(i).1)
                .unwrap_or(Behavior::Succeed);
            Arc::new(Scripted {
                behavior,
                calls: AtomicU32::new(0),
                order: order.clone(),
            })
        };

        Self {
            content: build(StepKind::ContentGeneration),
            visual: build(StepKind::VisualGeneration),
            optimization: build(StepKind::Optimization),
            packaging: build(StepKind::Packaging),
            order,
        }
    }

    pub fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::new()
            .with(StepKind::ContentGeneration, self.content.clone())
            .with(StepKind::VisualGeneration, self.visual.clone())
            .with(StepKind::Optimization, self.optimization.clone())
            .with(StepKind::Packaging, self.packaging.clone())
    }

    pub fn invocation_order(&self) -> Vec<StepKind> {
        self.order.lock().unwrap().clone()
    }
}

pub fn test_config(budget: usize, auto_advance: bool) -> Configuration {
    Configuration {
        auto_advance,
        admission: AdmissionConfig {
            concurrency_budget: budget,
            ..AdmissionConfig::default()
        },
        retry: RetryPolicy {
            jitter_factor: 0.0,
            ..RetryPolicy::default()
        },
        ..Configuration::default()
    }
}

pub fn orchestrator(
    pipeline: &Pipeline,
    store: Arc<dyn SessionStore>,
    budget: usize,
    auto_advance: bool,
) -> WorkflowOrchestrator {
    WorkflowOrchestrator::from_config(
        &test_config(budget, auto_advance),
        store,
        pipeline.capabilities(),
    )
}

/// Poll until the session satisfies `done`
pub async fn wait_until<F>(
    orchestrator: &WorkflowOrchestrator,
    session_id: Uuid,
    done: F,
) -> WorkflowStatus
where
    F: Fn(&WorkflowStatus) -> bool,
{
    for _ in 0..20_000 {
        let status = orchestrator.get_status(session_id).unwrap();
        if done(&status) {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session {} never reached the expected state", session_id);
}

pub async fn wait_for_terminal(
    orchestrator: &WorkflowOrchestrator,
    session_id: Uuid,
) -> WorkflowStatus {
    wait_until(orchestrator, session_id, |status| status.status.is_terminal()).await
}
