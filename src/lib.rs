// src/lib.rs

pub mod cli;
pub mod config;
pub mod engine;
pub mod errors;
pub mod guard;
pub mod logging;
pub mod process;
pub mod reactor;
pub mod signals;
pub mod stream;
pub mod watcher;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::cli::CliArgs;
use crate::config::load_and_validate;
use crate::config::model::ConfigFile;
use crate::engine::{Arbiter, LoopEvent, Runtime};
use crate::process::{LaunchMode, OsProcessBackend};
use crate::reactor::TokioReactor;
use crate::signals::SignalDispatcher;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading
/// - the OS process backend and the tokio reactor
/// - the arbiter and its runtime loop
/// - the signal dispatcher
pub async fn run(args: CliArgs) -> Result<()> {
    let mut cfg = load_and_validate(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    if let Some(delay) = args.check_delay {
        anyhow::ensure!(!delay.is_zero(), "--check-delay must be greater than zero");
        debug!(?delay, "check_delay overridden on the command line");
        cfg.arbiter.check_delay = delay;
    }

    if args.dry_run {
        print_dry_run(&cfg);
        return Ok(());
    }

    let (event_tx, event_rx) = mpsc::unbounded_channel::<LoopEvent>();
    let reactor = TokioReactor::new(event_tx);
    let arbiter = Arbiter::from_config(&cfg, OsProcessBackend::new(), reactor)?;
    info!(watchers = ?arbiter.watcher_names(), "arbiter configured");

    let (mut dispatcher, signals) =
        SignalDispatcher::install().context("installing signal handlers")?;

    let runtime = Runtime::new(arbiter, event_rx).with_signals(signals);
    let result = runtime.run().await;

    dispatcher.stop();
    result?;
    Ok(())
}

/// Print the resolved watchers without launching anything.
fn print_dry_run(cfg: &ConfigFile) {
    println!("procwarden dry-run");
    println!("  arbiter.check_delay = {:?}", cfg.arbiter.check_delay);
    println!();

    println!("watchers ({}):", cfg.watchers.len());
    for def in &cfg.watchers {
        println!("  - {}", def.name);
        println!("      cmd: {}", def.spec.command_line());
        if def.spec.mode == LaunchMode::Shell {
            println!("      shell: true");
        }
        if let Some(dir) = &def.spec.working_dir {
            println!("      working_dir: {}", dir.display());
        }
        println!("      numprocesses: {}", def.numprocesses);
        println!("      max_retry: {}", def.max_retry);
        println!("      respawn: {}", def.respawn);
        if !def.autostart {
            println!("      autostart: false");
        }
        println!(
            "      stop: {:?} then SIGKILL after {:?}",
            def.stop_signal, def.graceful_timeout
        );
        println!("      stdout: {:?}", def.stdout);
        println!("      stderr: {:?}", def.stderr);
    }

    debug!("dry-run complete (nothing launched)");
}
