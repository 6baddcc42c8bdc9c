//! Command handlers

use anyhow::{Context, Result};
use contentflow_core::capability::CapabilitySet;
use contentflow_core::models::{
    CapabilityConfig, Configuration, SessionStatus, StepStatus, WorkflowStatus,
};
use contentflow_core::server::ContentflowServer;
use contentflow_core::workflow::{JsonSessionStore, SessionStore, WorkflowOrchestrator};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Resolve the config file and load it, defaults when missing
pub fn load_config(config_file: Option<&Path>) -> Result<Configuration> {
    let path = match config_file {
        Some(path) => path.to_path_buf(),
        None => Configuration::default_config_path()?,
    };
    let config = Configuration::load_from_file(&path)?;
    if let Err(errors) = config.validate() {
        anyhow::bail!("Invalid configuration {}:\n  {}", path.display(), errors.join("\n  "));
    }
    Ok(config)
}

/// Create workflow orchestrator instance
///
/// Capabilities are only wired when steps will actually run.
fn create_orchestrator(config: &Configuration, run_steps: bool) -> Result<WorkflowOrchestrator> {
    let store: Arc<dyn SessionStore> = Arc::new(
        JsonSessionStore::new(config.resolved_store_path())
            .context("Failed to initialize session store")?,
    );
    let capabilities = if run_steps {
        CapabilitySet::from_config(&config.capabilities)?
    } else {
        CapabilitySet::new()
    };
    Ok(WorkflowOrchestrator::from_config(config, store, capabilities))
}

fn parse_session_id(session_id: &str) -> Result<uuid::Uuid> {
    uuid::Uuid::parse_str(session_id).context("Invalid session ID format (expected UUID)")
}

fn status_icon(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Pending => "·",
        StepStatus::InProgress => "▶",
        StepStatus::Completed => "✅",
        StepStatus::Failed => "❌",
        StepStatus::FallenBack => "⚠️",
    }
}

fn print_status(status: &WorkflowStatus) {
    println!("Workflow Session Status");
    println!("=======================");
    println!("Session ID:     {}", status.session_id);
    println!("User:           {}", status.user_id);
    println!("Status:         {:?}", status.status);
    println!("Progress:       {}%", status.progress_percent);
    if let Some(step) = status.current_step {
        println!("Current Step:   {}", step);
    }
    println!(
        "Updated At:     {}",
        status.updated_at.format("%Y-%m-%d %H:%M:%S")
    );
    if let Some(error) = &status.error {
        println!("Error:          {} ({})", error.message, error.code);
    }

    println!();
    println!("Steps:");
    println!("------");
    for step in &status.steps {
        println!(
            "  {} {} ({} attempt(s))",
            status_icon(step.status),
            step.name,
            step.attempts
        );
        if let Some(warning) = &step.warning {
            println!("     {}", warning);
        }
    }
}

/// Handle the 'serve' command
pub async fn handle_serve(
    config: Configuration,
    host: Option<String>,
    port: Option<u16>,
) -> Result<()> {
    let mut config = config;
    if let Some(host) = host {
        config.server_host = host;
    }
    if let Some(port) = port {
        config.server_port = port;
    }

    let server = ContentflowServer::from_config(&config)?;
    server.start().await
}

/// Handle the 'run' command: start a session and follow it to the end
pub async fn handle_run(
    config: Configuration,
    prompt: String,
    user: String,
    json: bool,
) -> Result<()> {
    let mut config = config;
    // Nobody calls advance from a one-shot run
    config.auto_advance = true;
    let orchestrator = create_orchestrator(&config, true)?;

    let started = orchestrator
        .start_workflow(&prompt, &user)
        .await
        .context("Failed to start workflow")?;

    tracing::debug!(
        session_id = %started.session_id,
        user_id = %user,
        "Following session until it finishes"
    );

    if !json {
        println!("🚀 Started session {}", started.session_id);
        if !started.ticket.granted {
            println!(
                "   Queued, estimated wait {} ms",
                started.ticket.estimated_wait_ms
            );
        }
    }

    let mut reported = 0;
    let status = loop {
        let status = orchestrator.get_status(started.session_id)?;
        if !json {
            for step in status.steps.iter().skip(reported) {
                if !step.status.is_settled() && step.status != StepStatus::Failed {
                    break;
                }
                println!("   {} {}", status_icon(step.status), step.name);
                if let Some(warning) = &step.warning {
                    println!("      {}", warning);
                }
                reported += 1;
            }
        }
        if status.status.is_terminal() {
            break status;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        match status.status {
            SessionStatus::Completed => println!("✅ Session completed"),
            SessionStatus::Cancelled => println!("🛑 Session cancelled"),
            _ => {
                let reason = status
                    .error
                    .as_ref()
                    .map(|e| e.message.as_str())
                    .unwrap_or("unknown error");
                println!("❌ Session failed: {}", reason);
            }
        }
    }

    if status.status == SessionStatus::Failed {
        std::process::exit(1);
    }
    Ok(())
}

/// Handle the 'status' command
pub async fn handle_status(config: Configuration, session_id: String, json: bool) -> Result<()> {
    let orchestrator = create_orchestrator(&config, false)?;
    let status = orchestrator.get_status(parse_session_id(&session_id)?)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print_status(&status);
    }
    Ok(())
}

/// Handle the 'list' command
pub async fn handle_list(config: Configuration, user: String, json: bool) -> Result<()> {
    let orchestrator = create_orchestrator(&config, false)?;
    let sessions = orchestrator.list_sessions(&user)?;

    if json {
        let output = serde_json::json!({
            "user_id": user,
            "sessions": sessions,
            "count": sessions.len()
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else if sessions.is_empty() {
        println!("No sessions for user '{}'.", user);
    } else {
        println!("Sessions for '{}':", user);
        println!("==================");
        for session in sessions {
            println!(
                "  • {}  {:?}  {}%  {}",
                session.session_id,
                session.status,
                session.progress_percent,
                session.updated_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }
    Ok(())
}

/// Handle the 'config --init' command
///
/// Writes a configuration with defaults and command capabilities that read
/// the payload from stdin.
pub async fn handle_config_init(config_file: Option<PathBuf>, force: bool) -> Result<()> {
    let config_path = match config_file {
        Some(path) => path,
        None => Configuration::default_config_path()?,
    };

    if config_path.exists() && !force {
        anyhow::bail!(
            "Configuration file {} already exists (use --force to overwrite)",
            config_path.display()
        );
    }

    let mut config = Configuration::default();
    let command = |step: &str| CapabilityConfig::Command {
        command: format!("contentflow-{}", step),
    };
    config.capabilities.content_generation = Some(command("content"));
    config.capabilities.visual_generation = Some(command("visual"));
    config.capabilities.optimization = Some(command("optimize"));
    config.capabilities.packaging = Some(command("package"));

    config.save_to_file(&config_path)?;

    println!("⚙️  Wrote configuration to {}", config_path.display());
    println!(
        "   Sessions will be stored in {}",
        config.resolved_store_path().display()
    );
    println!("   Edit the [capabilities] section to point at your services.");
    Ok(())
}
