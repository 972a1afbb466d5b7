//! gitnest appliance supervisor CLI
//!
//! `start` is the container entrypoint: it provisions SSH and GPG keys,
//! brings up the backup lifecycle, launches the web server, and replaces
//! itself with the SSH daemon. The `backup`, `verify` and `cleanup`
//! subcommands are what the periodic scheduler's backup script invokes.
//!
//! # Usage
//!
//! ```bash
//! # Boot the appliance (container CMD)
//! gitnest start
//!
//! # Scheduled operations (from the periodic slot)
//! gitnest backup
//! gitnest verify
//! gitnest cleanup
//!
//! # Inspect configuration and component state
//! gitnest status
//! ```

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use gitnest::backup::BackupService;
use gitnest::config::Config;
use gitnest::paths::{Layout, COMPONENT_BACKUP, COMPONENT_GPG, COMPONENT_SSH};
use gitnest::preflight;
use gitnest::state::{FileStateStore, StateStore};

#[derive(Parser)]
#[command(name = "gitnest")]
#[command(author, version, about = "Self-hosted git server appliance supervisor", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the boot sequence and hand off to the SSH daemon
    Start,

    /// Run an incremental backup of the data paths
    Backup,

    /// Verify the backup chain against the target
    Verify,

    /// Prune old chains, keeping the configured number of full backups
    Cleanup,

    /// Show configuration, component state and clone URLs
    Status,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command.unwrap_or(Commands::Start) {
        Commands::Start => cmd_start(),
        Commands::Backup => cmd_backup(),
        Commands::Verify => cmd_verify(),
        Commands::Cleanup => cmd_cleanup(),
        Commands::Status => cmd_status(),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn cmd_start() -> Result<()> {
    let config = Config::from_env()?;
    let layout = Layout::default();
    gitnest::entrypoint::run(&config, &layout)
}

fn cmd_backup() -> Result<()> {
    let (config, layout, state) = open_appliance()?;
    let backup = BackupService::attach(&config, &layout, &state);
    if !backup.perform_backup() {
        bail!("backup did not complete");
    }
    Ok(())
}

fn cmd_verify() -> Result<()> {
    let (config, layout, state) = open_appliance()?;
    let backup = BackupService::attach(&config, &layout, &state);
    if !backup.verify_backup() {
        bail!("backup verification failed");
    }
    Ok(())
}

fn cmd_cleanup() -> Result<()> {
    let (config, layout, state) = open_appliance()?;
    let backup = BackupService::attach(&config, &layout, &state);
    if !backup.cleanup_backups() {
        bail!("backup cleanup failed");
    }
    Ok(())
}

fn cmd_status() -> Result<()> {
    let config = Config::from_env()?;
    let layout = Layout::default();
    let state = FileStateStore::new(&layout.state_dir)?;

    println!("gitnest status");
    println!("==============");
    println!();
    println!("Configuration:");
    println!("  Hostname:        {}", config.external_hostname);
    println!("  SSH port:        {}", config.external_ssh_port);
    println!("  HTTP port:       {}", config.external_http_port);
    println!("  Backup schedule: {}", config.backup_schedule);
    println!("  Full backups:    keep {}", config.full_backups_to_keep);
    println!();

    println!("Components:");
    for component in [COMPONENT_SSH, COMPONENT_GPG, COMPONENT_BACKUP] {
        let configured = if state.is_configured(component) {
            "CONFIGURED"
        } else {
            "NOT CONFIGURED"
        };
        println!("  {:8} {}", component, configured);
    }
    println!();

    println!("Clone URLs:");
    println!("  SSH:   {}/<type>/<repo>", config.git_ssh_url());
    println!("  HTTP:  {}/<type>/<repo>", config.git_http_url());
    println!();

    println!("Host tools:");
    preflight::print_results(&preflight::check_host_tools());

    Ok(())
}

fn open_appliance() -> Result<(Config, Layout, FileStateStore)> {
    let config = Config::from_env()?;
    let layout = Layout::default();
    let state = FileStateStore::new(&layout.state_dir)?;
    Ok((config, layout, state))
}
