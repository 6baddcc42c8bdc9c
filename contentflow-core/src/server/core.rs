//! Main server integration for contentflow

use crate::capability::CapabilitySet;
use crate::models::Configuration;
use crate::workflow::orchestrator::WorkflowOrchestrator;
use crate::workflow::persistence::{JsonSessionStore, SessionStore};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;

/// HTTP front end around a workflow orchestrator
pub struct ContentflowServer {
    host: String,
    port: u16,
    orchestrator: WorkflowOrchestrator,
}

impl ContentflowServer {
    pub fn new(host: String, port: u16, orchestrator: WorkflowOrchestrator) -> Self {
        Self {
            host,
            port,
            orchestrator,
        }
    }

    /// Build store, capabilities and orchestrator from configuration
    pub fn from_config(config: &Configuration) -> Result<Self> {
        let store: Arc<dyn SessionStore> = Arc::new(
            JsonSessionStore::new(config.resolved_store_path())
                .context("Failed to open session store")?,
        );
        let capabilities = CapabilitySet::from_config(&config.capabilities)?;
        let orchestrator = WorkflowOrchestrator::from_config(config, store, capabilities);

        Ok(Self::new(
            config.server_host.clone(),
            config.server_port,
            orchestrator,
        ))
    }

    pub fn orchestrator(&self) -> &WorkflowOrchestrator {
        &self.orchestrator
    }

    /// Serve until Ctrl+C
    pub async fn start(self) -> Result<()> {
        let address: SocketAddr = format!("{}:{}", self.host, self.port)
            .parse()
            .context("Invalid server address")?;

        let resumed = self
            .orchestrator
            .resume_incomplete()
            .context("Failed to resume incomplete sessions")?;

        let routes = crate::server::api::create_api_routes(self.orchestrator.clone());
        let (bound, server) = warp::serve(routes)
            .try_bind_with_graceful_shutdown(address, async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Shutdown signal received");
                }
            })
            .with_context(|| format!("Failed to bind to {}", address))?;

        tracing::info!(address = %bound, resumed, "contentflow server listening");
        println!("contentflow server listening on http://{}", bound);
        println!("Press Ctrl+C to stop the server");

        server.await;
        tracing::info!("contentflow server stopped");
        Ok(())
    }
}
