use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use switchboard_agent::{Agent, AgentSettings, ContextBuilder, MessageBus, SessionStore};
use switchboard_channels::ChannelManager;
use switchboard_core::{Config, Error};
use switchboard_gateway::{AdminState, LogRing, SharedConfig, Supervisor, SupervisorSettings};
use switchboard_providers::create_provider;
use switchboard_skills::SkillRegistry;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::resolve;

/// Extra time on top of the drain window before stragglers are aborted.
const ABORT_SLACK: Duration = Duration::from_secs(5);

pub async fn run(config_path: Option<PathBuf>, ring: LogRing) -> anyhow::Result<()> {
    let resolved = resolve(config_path)?;
    resolved.config.validate()?;
    let config: Config = resolved.config.clone();

    let workspace = resolved.workspace();
    workspace.ensure_dirs().map_err(Error::from)?;
    resolved.paths.ensure_dirs().map_err(Error::from)?;

    let provider = create_provider(&config)?;
    info!(model = %config.agents.defaults.model, "LLM provider ready");

    let skills = Arc::new(SkillRegistry::new(
        workspace.skills_dir(),
        resolved.paths.global_skills_dir(),
        resolved.paths.builtin_skills_dir(),
    ));
    info!(skills = skills.list_skills().len(), "Skills loaded");

    let defaults = &config.agents.defaults;
    let bus = MessageBus::new(config.gateway.inbound_buffer);
    let prompt_paths: Vec<String> = defaults.system_prompt_paths.iter().cloned().collect();
    let agent = Arc::new(Agent::new(
        Arc::from(provider),
        skills,
        Arc::new(SessionStore::new()),
        ContextBuilder::new(workspace.clone(), &prompt_paths, defaults.max_context_tokens as usize),
        bus.clone(),
        AgentSettings::from(defaults),
    ));

    let channels = ChannelManager::from_config(&config, &workspace, bus.clone())?;
    if channels.is_empty() {
        warn!("No channels enabled; only the admin chat will receive messages");
    }

    let settings = SupervisorSettings::from(&config);
    let grace = settings.shutdown_grace;
    let shared: SharedConfig = Arc::new(RwLock::new(config.clone()));
    let supervisor = Arc::new(Supervisor::new(
        agent,
        bus,
        channels,
        Arc::clone(&shared),
        workspace.clone(),
        settings,
    ));

    let bind_addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| Error::Config(format!("cannot bind admin API on {}: {}", bind_addr, e)))?;
    if config.gateway.api_token.is_none() && config.gateway.host != "127.0.0.1" {
        warn!(addr = %bind_addr, "Admin API exposed without an apiToken");
    }

    let admin = AdminState::new(
        Arc::clone(&supervisor),
        shared,
        resolved.config_path.clone(),
        workspace,
        ring,
    );
    let http_shutdown = CancellationToken::new();
    let http_token = http_shutdown.clone();
    let http_handle = tokio::spawn(async move {
        if let Err(e) = switchboard_gateway::serve(admin, listener, http_token).await {
            error!(error = %e, "Admin API server failed");
        }
    });

    let sup = Arc::clone(&supervisor);
    let mut supervisor_handle = tokio::spawn(async move {
        if let Err(e) = sup.run().await {
            error!(error = %e, "Supervisor exited with error");
        }
    });

    info!(addr = %bind_addr, "switchboard gateway started");

    let supervisor_exited = tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                warn!(error = %e, "Cannot listen for Ctrl+C; shutting down");
            }
            info!("Shutdown signal received, draining in-flight turns...");
            supervisor.shutdown();
            false
        }
        res = &mut supervisor_handle => {
            warn!("Supervisor stopped unexpectedly");
            if let Err(e) = res {
                error!(error = %e, "Supervisor task panicked");
            }
            true
        }
    };

    let mut failed = 0;
    if !supervisor_exited {
        let deadline = tokio::time::Instant::now() + grace + ABORT_SLACK;
        match tokio::time::timeout_at(deadline, &mut supervisor_handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_cancelled() => debug!("Supervisor cancelled during shutdown"),
            Ok(Err(e)) => {
                error!(error = %e, "Supervisor panicked during shutdown");
                failed += 1;
            }
            Err(_) => {
                warn!("Supervisor did not stop in the grace window, aborting");
                supervisor_handle.abort();
            }
        }
    }

    http_shutdown.cancel();
    match tokio::time::timeout(ABORT_SLACK, http_handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) if e.is_cancelled() => debug!("Admin API cancelled during shutdown"),
        Ok(Err(e)) => {
            error!(error = %e, "Admin API panicked during shutdown");
            failed += 1;
        }
        Err(_) => warn!("Admin API did not exit after shutdown"),
    }

    if failed == 0 {
        info!("Gateway stopped");
    } else {
        warn!(failed, "Gateway stopped with task failures");
    }
    Ok(())
}
