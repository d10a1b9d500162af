//! od - declarative device onboarding daemon
//!
//! CLI entry point: serve the onboarding API or inspect the task ledger.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, TimeZone};
use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result, eyre};
use taskstore::{DoState, FileStorage, StatePersistence, Task, TaskStatus};
use tracing::{debug, info};

use onboard::api::{ApiHandler, server};
use onboard::cli::{Cli, Command, get_log_path};
use onboard::config::Config;
use onboard::delegation::{HttpSender, RequestSender};
use onboard::orchestrator::{Collaborators, Orchestrator, Recovery};
use onboard::state::StateManager;
use onboard::view::TaskView;
use onboard::webhook::HttpNotifier;

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Can't log here until the subscriber is installed
    let log_path = get_log_path();
    let log_dir = log_path.parent().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // Priority: CLI --log-level > config file > INFO
    let level = match cli_log_level.or(config_log_level).map(str::to_uppercase).as_deref() {
        Some("TRACE") => tracing::Level::TRACE,
        Some("DEBUG") => tracing::Level::DEBUG,
        Some("INFO") | None => tracing::Level::INFO,
        Some("WARN") | Some("WARNING") => tracing::Level::WARN,
        Some("ERROR") => tracing::Level::ERROR,
        Some(other) => {
            eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", other);
            tracing::Level::INFO
        }
    };

    let log_file = fs::File::create(&log_path).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_log_level = Config::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;
    info!(deployment = %config.deployment, state_file = %config.storage.state_file.display(), "od loaded config");

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Serve { simulate } => cmd_serve(config, simulate).await,
        Command::Tasks { id } => cmd_tasks(&config, id.as_deref()).await,
        Command::Configs => cmd_configs(&config).await,
        Command::DeleteConfig { id } => cmd_delete_config(&config, &id).await,
    }
}

/// Run the API until ctrl-c
async fn cmd_serve(config: Config, simulate: bool) -> Result<()> {
    debug!(simulate, "cmd_serve: called");
    let mut collaborators = device_collaborators(simulate)?;

    let persistence: Arc<dyn StatePersistence> = Arc::new(FileStorage::new(&config.storage.state_file));
    let state = StateManager::load(persistence, config.storage.clone())
        .await
        .context("Failed to load task state")?;

    if let Some(url) = &config.delegation.url {
        let sender = HttpSender::new(url.as_str(), Duration::from_millis(config.delegation.timeout_ms))
            .map_err(|e| eyre!("Failed to build peer client: {}", e))?;
        collaborators.peer = Some(Arc::new(sender) as Arc<dyn RequestSender>);
    }
    let notifier = HttpNotifier::new(Duration::from_millis(config.webhook.timeout_ms))
        .map_err(|e| eyre!("Failed to build webhook client: {}", e))?;
    collaborators.notifier = Arc::new(notifier);

    let listen = config.server.listen;
    let base_path = config.server.base_path.clone();
    let orchestrator = Orchestrator::start(config, state, collaborators);

    match orchestrator.recover().await.context("Start-up recovery failed")? {
        Recovery::Nothing => debug!("cmd_serve: nothing to recover"),
        Recovery::RebootCompleted { task_id } => info!(%task_id, "Completed task interrupted by reboot"),
        Recovery::Resuming { task_id, .. } => info!(%task_id, "Resuming task interrupted by license revocation"),
    }

    println!("od listening on http://{}{}", listen, base_path);
    let handler = Arc::new(ApiHandler::new(orchestrator, base_path));
    server::serve(listen, handler).await
}

const NO_DEVICE_TRANSPORT: &str = "od has no device transport of its own; host the onboard library with real \
collaborators, or run `od serve --simulate` from a build with the `sim` feature";

/// Collaborators `od serve` can run with on its own
#[cfg(feature = "sim")]
fn device_collaborators(simulate: bool) -> Result<Collaborators> {
    if !simulate {
        return Err(eyre!(NO_DEVICE_TRANSPORT));
    }
    tracing::warn!("Serving against simulated devices; no configuration reaches a real device");
    Ok(Collaborators::simulated())
}

#[cfg(not(feature = "sim"))]
fn device_collaborators(simulate: bool) -> Result<Collaborators> {
    debug!(simulate, "device_collaborators: built without the sim feature");
    Err(eyre!(NO_DEVICE_TRANSPORT))
}

/// Read the ledger straight from the state file
async fn load_ledger(config: &Config) -> Result<(FileStorage, DoState)> {
    let storage = FileStorage::new(&config.storage.state_file);
    let raw = storage.load().await.context("Failed to read state file")?;
    let state = raw.map(DoState::upgrade).unwrap_or_default();
    debug!(task_count = state.tasks.len(), "load_ledger: loaded");
    Ok((storage, state))
}

fn format_time(ms: i64) -> String {
    match Local.timestamp_millis_opt(ms).single() {
        Some(time) => time.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => "-".to_string(),
    }
}

fn format_status(status: Option<TaskStatus>) -> String {
    match status {
        Some(TaskStatus::Ok) => "OK".green().to_string(),
        Some(TaskStatus::Error) => "ERROR".red().to_string(),
        Some(other) => other.to_string().yellow().to_string(),
        None => "-".dimmed().to_string(),
    }
}

async fn cmd_tasks(config: &Config, id: Option<&str>) -> Result<()> {
    debug!(?id, "cmd_tasks: called");
    let (_, state) = load_ledger(config).await?;

    if let Some(id) = id {
        let task = state.task(id).map_err(|e| eyre!("{}", e))?;
        let view = serde_json::to_string_pretty(&TaskView::from(task))?;
        println!("{}", view);
        return Ok(());
    }

    let mut tasks: Vec<&Task> = state.tasks.values().collect();
    if tasks.is_empty() {
        println!("No tasks recorded in {}", config.storage.state_file.display());
        return Ok(());
    }
    tasks.sort_by(|a, b| a.last_update.cmp(&b.last_update).then_with(|| a.id.cmp(&b.id)));

    println!("{:<38} {:<20} {:>5} {:<14} {}", "ID".bold(), "UPDATED".bold(), "CODE".bold(), "STATUS".bold(), "MESSAGE".bold());
    for task in tasks {
        let marker = if task.id == state.most_recent_task { "*" } else { " " };
        println!(
            "{}{:<37} {:<20} {:>5} {:<14} {}",
            marker,
            task.id,
            format_time(task.last_update),
            task.result.code.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string()),
            format_status(task.result.status),
            task.result.message.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

async fn cmd_configs(config: &Config) -> Result<()> {
    debug!("cmd_configs: called");
    let (_, state) = load_ledger(config).await?;

    let ids = state.original_config_ids();
    if ids.is_empty() {
        println!("No original configurations recorded");
        return Ok(());
    }
    for id in ids {
        let fields = state
            .get_original_config_by_config_id(&id)
            .and_then(|c| c.as_object().map(|o| o.len()))
            .unwrap_or(0);
        println!("  {} ({} top-level fields)", id.cyan(), fields);
    }
    Ok(())
}

async fn cmd_delete_config(config: &Config, id: &str) -> Result<()> {
    debug!(%id, "cmd_delete_config: called");
    let (storage, mut state) = load_ledger(config).await?;

    if !state.delete_original_config_by_config_id(id) {
        println!("{} no original configuration for {}", "Not found:".red(), id);
        return Ok(());
    }
    storage.save(&state).await.context("Failed to write state file")?;
    info!(config_id = %id, "Deleted original configuration from state file");
    println!("{} original configuration for {}", "Deleted".green(), id);
    Ok(())
}
