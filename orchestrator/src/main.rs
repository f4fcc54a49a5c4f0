//! redeploy - Entry Point
//!
//! Updates a server-hosted application from its git remote, restarting its
//! services and rolling back to the latest snapshot on any failure.

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

use anyhow::Context;
use colored::Colorize;
use tracing::{error, info};

use redeploy::app::options::AppOptions;
use redeploy::app::run::run;
use redeploy::app::state::AppState;
use redeploy::errors::DeployError;
use redeploy::logs::{init_logging, LogOptions};
use redeploy::models::deployment::RunOutcome;
use redeploy::storage::layout::StorageLayout;
use redeploy::storage::run_log::RunLog;
use redeploy::storage::settings::Settings;
use redeploy::utils::version_info;

const DEFAULT_SETTINGS: &str = "/etc/redeploy/settings.json";
const DEFAULT_HISTORY: usize = 10;

/// Run refused: already running, unreadable settings, logging unavailable
const EXIT_REFUSED: i32 = 2;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Parse command line arguments
    let mut cli_args: HashMap<String, String> = HashMap::new();
    for arg in env::args().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version_info()) {
            Ok(json) => println!("{json}"),
            Err(e) => eprintln!("Failed to render version: {e}"),
        }
        return;
    }

    // Retrieve the settings file
    let explicit = cli_args.get("config").map(PathBuf::from);
    let settings = match load_settings(explicit.as_deref()).await {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Unable to read settings: {e:#}");
            std::process::exit(EXIT_REFUSED);
        }
    };

    if let Some(limit) = cli_args.get("history") {
        let limit = limit.parse().unwrap_or(DEFAULT_HISTORY);
        std::process::exit(print_history(&settings, limit).await);
    }

    let options = match AppOptions::from_settings(&settings) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("Invalid settings: {e}");
            std::process::exit(EXIT_REFUSED);
        }
    };

    // Initialize logging
    let log_level = match cli_args.get("log-level") {
        Some(level) => level.parse().unwrap_or_else(|e| {
            eprintln!("{e}, using {}", settings.log_level.to_filter_string());
            settings.log_level.clone()
        }),
        None => settings.log_level.clone(),
    };
    let log_options = LogOptions {
        log_level,
        log_file: options.log_file.clone(),
        json_format: cli_args.contains_key("json"),
        ..Default::default()
    };
    let log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            std::process::exit(EXIT_REFUSED);
        }
    };

    let version = version_info();
    info!("redeploy {} ({})", version.version, version.git_hash);

    let revision = cli_args.get("revision").cloned();
    let state = AppState::system(options);
    let code = match run(&state, revision).await {
        Ok(record) => {
            let outcome = record.outcome.unwrap_or(RunOutcome::Failed);
            if let Some(err) = &record.error {
                error!("Run {} {}: {}", record.id, outcome, err.message);
            }
            outcome.exit_code()
        }
        Err(e @ DeployError::AlreadyRunning(_)) => {
            error!("{e}");
            EXIT_REFUSED
        }
        Err(e) => {
            error!("Run refused: {e}");
            1
        }
    };

    // Flush the file writer before exiting
    drop(log_guard);
    std::process::exit(code);
}

/// Read the settings file. A missing default file yields built-in defaults;
/// a missing explicit file is an error.
async fn load_settings(explicit: Option<&Path>) -> anyhow::Result<Settings> {
    let path = explicit.unwrap_or_else(|| Path::new(DEFAULT_SETTINGS));
    if explicit.is_none() && !tokio::fs::try_exists(path).await.unwrap_or(false) {
        return Ok(Settings::default());
    }

    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parsing {}", path.display()))
}

async fn print_history(settings: &Settings, limit: usize) -> i32 {
    let run_log = RunLog::new(StorageLayout::new(&settings.state_dir).run_log_file());
    let runs = match run_log.load_recent(limit).await {
        Ok(runs) => runs,
        Err(e) => {
            eprintln!("Unable to read run log: {e}");
            return 1;
        }
    };

    if runs.is_empty() {
        println!("No deployment runs recorded");
        return 0;
    }

    for run in runs {
        let outcome = match run.outcome {
            Some(RunOutcome::Succeeded) => "succeeded".green(),
            Some(RunOutcome::RolledBack) => "rolled back".yellow(),
            Some(RunOutcome::Failed) | None => "failed".red(),
        };
        let revision = run
            .revision_after
            .as_deref()
            .or(run.revision_before.as_deref())
            .unwrap_or("-");
        println!(
            "{}  {:<11}  {}  {}",
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            outcome,
            revision.chars().take(12).collect::<String>(),
            run.id.dimmed()
        );
        if let Some(err) = &run.error {
            println!("    {} {}", err.code.bold(), err.message);
        }
        for warning in &run.warnings {
            println!("    {} {}", "warning".yellow(), warning);
        }
    }
    0
}
