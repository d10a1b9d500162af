//! CLI command definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

/// od - declarative device onboarding daemon
#[derive(Parser)]
#[command(
    name = "od",
    about = "Declarative device onboarding: task orchestration, rollback, reboot and delegation",
    version,
    after_help = after_help()
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the onboarding API
    Serve {
        /// Run against simulated devices (needs the `sim` feature)
        #[arg(long)]
        simulate: bool,
    },

    /// Show recorded tasks from the state file
    Tasks {
        /// Show a single task in full
        id: Option<String>,
    },

    /// List original configuration snapshots by device
    Configs,

    /// Delete the original configuration snapshot of a device
    DeleteConfig {
        /// Device configuration id
        id: String,
    },
}

/// Where `od serve` writes its log
pub fn get_log_path() -> PathBuf {
    debug!("get_log_path: called");
    let path = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("onboard")
        .join("logs")
        .join("onboard.log");
    debug!(?path, "get_log_path: returning path");
    path
}

fn after_help() -> String {
    format!("Logs are written to: {}", get_log_path().display())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_delete_config() {
        let cli = Cli::try_parse_from(["od", "-l", "debug", "delete-config", "dev1"]).unwrap();
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert!(matches!(cli.command, Command::DeleteConfig { id } if id == "dev1"));
    }

    #[test]
    fn test_tasks_id_is_optional() {
        let cli = Cli::try_parse_from(["od", "tasks"]).unwrap();
        assert!(matches!(cli.command, Command::Tasks { id: None }));
    }

    #[test]
    fn test_serve_is_real_by_default() {
        let cli = Cli::try_parse_from(["od", "serve"]).unwrap();
        assert!(matches!(cli.command, Command::Serve { simulate: false }));
        let cli = Cli::try_parse_from(["od", "serve", "--simulate"]).unwrap();
        assert!(matches!(cli.command, Command::Serve { simulate: true }));
    }

    #[test]
    fn test_log_path_under_onboard() {
        assert!(get_log_path().ends_with("onboard/logs/onboard.log"));
    }
}
