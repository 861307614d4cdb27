//! prbar: pull requests in the menu bar.
//!
//! Runs once per invocation as a SwiftBar/xbar plugin: prints the menu on
//! stdout, logs to stderr, and sends desktop notifications for changes since
//! the previous run.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use tracing_subscriber::EnvFilter;

use prbar::avatar::AvatarCache;
use prbar::config::Config;
use prbar::github::GhCli;
use prbar::ledger::Ledger;
use prbar::notify::{Notifier, TerminalNotifier};
use prbar::plugin::{self, RunContext};
use prbar::state::StateLayout;

/// Pull requests that need you, in the menu bar.
#[derive(Parser)]
#[command(name = "prbar", version, about)]
struct Cli {
    /// State directory (defaults to the user cache directory).
    #[arg(short = 'C', long, global = true)]
    state_dir: Option<PathBuf>,

    /// Path to config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Detect and record events without sending notifications.
    #[arg(long, global = true)]
    no_notify: bool,

    /// Log at debug level (overridden by PRBAR_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch, render the menu, and notify (the default).
    Run,

    /// Delete persisted state so the next run primes without notifying.
    Reset,

    /// Print the notification ledger.
    Ledger,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = match &cli.config {
        Some(p) => p.clone(),
        None => Config::default_path().ok_or_else(|| eyre!("no config directory; pass --config"))?,
    };
    let config = Config::load(&config_path)?;
    let layout = StateLayout::new(config.resolve_state_dir(cli.state_dir.as_deref())?);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => cmd_run(config, layout, cli.no_notify).await,
        Command::Reset => cmd_reset(&layout),
        Command::Ledger => cmd_ledger(&layout),
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_env("PRBAR_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
}

/// One plugin run.
async fn cmd_run(config: Config, layout: StateLayout, no_notify: bool) -> Result<()> {
    let timeout = config.limits.command_timeout();

    let gh = GhCli::new(timeout);
    gh.ensure_available().await?;

    let notifier: Option<Arc<dyn Notifier>> = if no_notify || !config.notify.enabled {
        None
    } else {
        let notifier = TerminalNotifier::new(config.notify.notifier.clone(), timeout);
        Some(Arc::new(notifier))
    };

    let avatars = if config.display.avatars {
        match AvatarCache::new(layout.avatar_dir(), timeout, config.limits.avatar_ttl()) {
            Ok(cache) => Some(Arc::new(cache)),
            Err(e) => {
                tracing::warn!("avatars disabled: {e}");
                None
            }
        }
    } else {
        None
    };

    let ctx = RunContext {
        config,
        layout,
        api: Arc::new(gh),
        notifier,
        avatars,
    };
    let report = ctx.run_once().await?;

    print!("{}", report.menu);
    tracing::info!(
        target: "plugin",
        "{} PR(s), {} event(s), {} notification(s), {} enrichment fetch(es)",
        report.snapshot_size,
        report.events.len(),
        report.delivered,
        report.enrich_fetches
    );
    Ok(())
}

/// Remove persisted state.
fn cmd_reset(layout: &StateLayout) -> Result<()> {
    let removed = layout.reset()?;
    println!(
        "Removed {removed} state file(s) from {}",
        layout.root().display()
    );
    println!("The next run will prime without notifying.");
    Ok(())
}

/// Dump the ledger.
fn cmd_ledger(layout: &StateLayout) -> Result<()> {
    let path = layout.ledger();
    let ledger = Ledger::load(&path).wrap_err_with(|| format!("failed to read {}", path.display()))?;

    if ledger.is_empty() {
        println!("Ledger is empty ({}).", path.display());
        return Ok(());
    }

    if let Some(at) = plugin::snapshot_time(layout) {
        println!("Snapshot written {}", at.format("%Y-%m-%d %H:%M UTC"));
    }
    println!("{} entr(ies) in {}:", ledger.len(), path.display());
    for (key, discriminator) in ledger.iter() {
        println!("  {key}\t{discriminator}");
    }
    Ok(())
}
