mod api;
mod attachments;
mod config;
mod day;
mod rate_limit;
mod run;
mod state;
mod thread;

use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use clap::Parser;
use eyre::{Context, Result, eyre};
use serde::Deserialize;
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

use crate::api::Credentials;
use crate::config::{DEFAULT_PAGE_SIZE, DEFAULT_PAUSE_SECONDS, ExportConfig};

/// Incrementally export Rocket.Chat room history to day-bucketed JSON
/// archives. Repeated runs resume from the last successful check.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory to write day records and attachments.
    /// Defaults to ./rocket-chat-export if not set in config.
    #[arg(value_name = "OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// Path to a specific configuration file.
    /// Defaults to $XDG_CONFIG_HOME/rocket-chat-export/config.toml
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Global start date, e.g. 2016-01-01 (implied T00:00:00.000000).
    #[arg(short = 's', long, value_name = "DATE")]
    date_start: Option<NaiveDate>,

    /// Global end date, e.g. 2016-01-01 (implied T23:59:59.999999).
    /// Defaults to yesterday in UTC, like all day windows.
    #[arg(short = 'e', long, value_name = "DATE")]
    date_end: Option<NaiveDate>,

    /// Do not create or update the checkpoint state file.
    #[arg(short = 'r', long)]
    read_only_state: bool,

    /// Log every API page and attachment as it is fetched.
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Deserialize, Default)]
struct FileConfig {
    server: Option<Url>,
    user: Option<String>,
    auth: Option<String>,
    /// `auth` is a personal access token (and `user` the user id) rather
    /// than a password.
    #[serde(default)]
    use_pat: bool,
    output_dir: Option<PathBuf>,
    state_file: Option<PathBuf>,
    pause_seconds: Option<u64>,
    page_size: Option<u32>,
}

fn load_file_config(explicit_path: Option<&Path>) -> Result<FileConfig> {
    let path = if let Some(p) = explicit_path {
        if !p.exists() {
            return Err(eyre!("Config file not found: {}", p.display()));
        }
        Some(p.to_path_buf())
    } else {
        dirs::config_dir()
            .map(|d| d.join("rocket-chat-export/config.toml"))
            .filter(|p| p.exists())
    };

    match path {
        None => Ok(FileConfig::default()),
        Some(p) => {
            let content = fs::read_to_string(&p)
                .wrap_err_with(|| format!("Failed to read config: {}", p.display()))?;
            toml::from_str(&content)
                .wrap_err_with(|| format!("Failed to parse config: {}", p.display()))
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "rocket_chat_export=debug"
    } else {
        "rocket_chat_export=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    // 1. Load config file (CLI path > default path)
    let file_cfg = load_file_config(cli.config.as_deref())?;

    // 2. Server and credentials come from the config file only
    let server = file_cfg
        .server
        .ok_or_else(|| eyre!("No server URL configured.\nSet server in config.toml."))?;
    let user = file_cfg
        .user
        .ok_or_else(|| eyre!("No user configured.\nSet user in config.toml."))?;
    let auth = file_cfg
        .auth
        .ok_or_else(|| eyre!("No credential configured.\nSet auth in config.toml."))?;
    let credentials = if file_cfg.use_pat {
        Credentials::Token {
            user_id: user,
            token: auth,
        }
    } else {
        Credentials::Password {
            user,
            password: auth,
        }
    };

    // 3. Resolve output_dir (CLI > Config > Default) and the state file
    let output_dir = cli
        .output_dir
        .or(file_cfg.output_dir)
        .unwrap_or_else(|| PathBuf::from("rocket-chat-export"));
    let state_file = file_cfg
        .state_file
        .unwrap_or_else(|| output_dir.join("state.json"));

    // 4. Build the Export Config
    let config = ExportConfig {
        server,
        credentials,
        output_dir,
        state_file,
        pause_seconds: file_cfg.pause_seconds.unwrap_or(DEFAULT_PAUSE_SECONDS),
        page_size: file_cfg.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
        date_start: cli.date_start,
        date_end: cli.date_end,
        read_only_state: cli.read_only_state,
    };

    info!("BEGIN export run");
    run::execute(&config)?;
    info!("END export run");
    Ok(())
}
