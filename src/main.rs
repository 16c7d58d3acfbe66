use clap::Parser;
use fleet_core::a2a::JobStore;
use fleet_core::config::Config;
use fleet_core::continuation::ContinuationController;
use fleet_core::events::EventBus;
use fleet_core::monitor::MonitorServer;
use fleet_core::tasks::store::TaskStore;
use fleet_core::tasks::KnownAgents;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info, warn, Level};

/// fleet-cored: task lifecycle, continuation, and agent-to-agent orchestration engine.
#[derive(Parser, Debug)]
#[command(name = "fleet-cored")]
struct Cli {
    /// Overrides TASK_MONITOR_PORT.
    #[arg(long)]
    port: Option<u16>,

    /// Overrides TASK_MONITOR_HOST.
    #[arg(long)]
    host: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    if let Err(e) = run().await {
        error!("fleet-cored failed to start: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load()?;
    if let Some(port) = cli.port {
        config.api.port = port;
    }
    if let Some(host) = cli.host {
        config.api.host = host;
    }

    info!("starting fleet-core agent orchestration engine");

    let events = EventBus::with_log_file(config.workspace.root.join("logs").join("coordination-events.ndjson"));
    let tasks = TaskStore::new(&config.workspace.root);
    let jobs = JobStore::new(&config.workspace.root);

    // The A2A flow orchestrator and concurrency gate are constructed per
    // flow by whatever integration dispatches agent turns; fleet-cored
    // itself only owns the durable job store it depends on, reaping it on
    // startup so stale flows resume or abandon before anything else runs.
    let reaper_report = jobs.reap().await?;
    info!(
        resumed = reaper_report.reset_to_pending,
        abandoned = reaper_report.abandoned,
        cleaned_up = reaper_report.cleaned_up,
        "a2a job reaper completed startup pass"
    );

    let known_agents = discover_known_agents(&config.workspace.root).await;
    let continuation = ContinuationController::new(tasks.clone(), events.clone());
    let monitor = MonitorServer::new(config.clone(), tasks.clone(), events.clone(), known_agents.clone());

    let poll_interval = Duration::from_secs(config.continuation.poll_interval_secs);
    let poller = tokio::spawn(run_continuation_poller(continuation, known_agents, poll_interval));

    tokio::select! {
        result = monitor.run() => {
            if let Err(e) = result {
                error!("monitor server failed: {}", e);
                return Err(e.into());
            }
        }
        _ = poller => {
            warn!("continuation poller task exited unexpectedly");
        }
    }

    Ok(())
}

/// Scans `<root>/workspace-<id>/` directories to build the agent registry.
/// Stand-in for whatever agent roster the surrounding system maintains.
async fn discover_known_agents(root: &Path) -> KnownAgents {
    let mut ids = Vec::new();
    if let Ok(mut entries) = tokio::fs::read_dir(root).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(file_type) = entry.file_type().await else { continue };
            if !file_type.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if let Some(id) = name.strip_prefix("workspace-") {
                    ids.push(id.to_string());
                }
            }
        }
    }
    KnownAgents::from_ids(ids)
}

async fn run_continuation_poller(continuation: ContinuationController, known_agents: KnownAgents, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        for agent_id in known_agents.0.keys() {
            if let Err(e) = continuation.poll_agent(agent_id, true).await {
                warn!(agent_id, error = %e, "continuation poll failed");
            }
        }
    }
}
