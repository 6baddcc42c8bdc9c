//! Capability interface for external pipeline collaborators

pub mod command;
pub mod http;

pub use command::*;
pub use http::*;

use crate::error::CapabilityError;
use crate::models::configuration::{CapabilitiesConfig, CapabilityConfig};
use crate::models::workflow::{StepKind, StepOutput, StepPayload};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// An external service invoked by one pipeline step
#[async_trait]
pub trait Capability: Send + Sync {
    /// Invoke the capability
    ///
    /// # Arguments
    /// * `payload` - Prompt plus the results of the earlier steps
    ///
    /// # Returns
    /// The step's typed output
    async fn invoke(&self, payload: &StepPayload) -> Result<StepOutput, CapabilityError>;
}

/// Capabilities wired to each step
#[derive(Clone, Default)]
pub struct CapabilitySet {
    capabilities: HashMap<StepKind, Arc<dyn Capability>>,
}

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the capability for a step, replacing any previous one
    pub fn with(mut self, kind: StepKind, capability: Arc<dyn Capability>) -> Self {
        self.capabilities.insert(kind, capability);
        self
    }

    pub fn get(&self, kind: StepKind) -> Option<Arc<dyn Capability>> {
        self.capabilities.get(&kind).cloned()
    }

    /// Build adapters from configuration; every step must be configured
    pub fn from_config(config: &CapabilitiesConfig) -> Result<Self> {
        let mut set = CapabilitySet::new();
        for kind in StepKind::ALL {
            let entry = config
                .get(kind)
                .with_context(|| format!("No capability configured for step '{}'", kind))?;
            let capability: Arc<dyn Capability> = match entry {
                CapabilityConfig::Command { command } => {
                    Arc::new(CommandCapability::new(command.clone()))
                }
                CapabilityConfig::Http { url, token_env } => {
                    let token = token_env
                        .as_ref()
                        .and_then(|name| std::env::var(name).ok());
                    Arc::new(
                        HttpCapability::new(url, token)
                            .with_context(|| format!("Invalid capability for step '{}'", kind))?,
                    )
                }
            };
            set = set.with(kind, capability);
        }
        Ok(set)
    }
}
