//! Interactive front-end: drain the queue on demand, inspect it, and edit the
//! settings the background daemon picks up on its next cycle.

use std::error::Error;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use strum::IntoEnumIterator;

use ocr_folder_queue::{
    config::AppConfig,
    models::{folders::Partition, settings::Settings},
    services::{
        ocr::Pdf24Cli,
        resolver,
        scheduler::{CycleOutcome, FrontEnd, Scheduler},
        shutdown::{os_signal, shutdown_channel},
    },
    telemetry,
};

#[derive(Parser, Debug)]
#[command(name = "ocr-batch")]
#[command(about = "Process and inspect the OCR folder queue")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process pending documents until the queue is empty.
    Run {
        /// Stop after a single cycle.
        #[arg(long)]
        once: bool,
    },
    /// Show folder statistics and lease holders.
    Status,
    /// Print the effective settings, optionally changing them first.
    Settings {
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long)]
        language: Option<String>,
        #[arg(long)]
        deskew: Option<bool>,
        #[arg(long)]
        delete_input: Option<bool>,
        #[arg(long)]
        auto_start: Option<bool>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    telemetry::init_tracing(false);
    let cli = Cli::parse();
    let config = AppConfig::from_env()?;

    match cli.command {
        Command::Run { once } => run(&config, once).await,
        Command::Status => status(&config),
        Command::Settings {
            workers,
            language,
            deskew,
            delete_input,
            auto_start,
        } => {
            let mut settings = Settings::load(&config.settings_path(), config.worker_ceiling());
            let changed = workers.is_some()
                || language.is_some()
                || deskew.is_some()
                || delete_input.is_some()
                || auto_start.is_some();

            if let Some(workers) = workers {
                settings.workers = workers.clamp(1, config.worker_ceiling());
            }
            if let Some(language) = language {
                settings.language = language;
            }
            if let Some(deskew) = deskew {
                settings.deskew = deskew;
            }
            if let Some(delete_input) = delete_input {
                settings.delete_input = delete_input;
            }
            if let Some(auto_start) = auto_start {
                settings.auto_start = auto_start;
            }

            if changed {
                garde::Validate::validate(&settings)?;
                settings.save(&config.settings_path())?;
                tracing::info!(path = %config.settings_path().display(), "Settings saved");
            }
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
    }
}

async fn run(config: &AppConfig, once: bool) -> Result<(), Box<dyn Error>> {
    config.folders().ensure_all()?;

    let engine = Pdf24Cli::from_config(config);
    if !engine.is_installed() {
        return Err(format!("OCR tool not found at {}", engine.tool_path().display()).into());
    }
    let scheduler = Scheduler::from_config(config, Arc::new(engine), FrontEnd::Interactive);

    let (trigger, shutdown) = shutdown_channel();
    tokio::spawn(async move {
        os_signal().await;
        tracing::info!("Interrupted, finishing the current batch");
        trigger.trigger();
    });

    let mut succeeded = 0;
    let mut failed = 0;
    let mut duplicates = 0;
    loop {
        match scheduler.run_one_cycle(&shutdown).await? {
            CycleOutcome::NoWork => break,
            CycleOutcome::Skipped(reason) => {
                tracing::warn!(%reason, "Queue busy, try again later");
                break;
            }
            CycleOutcome::Completed(result) => {
                succeeded += result.succeeded;
                failed += result.failed;
                duplicates += result.duplicates;
                for outcome in result.outcomes.iter().filter(|o| !o.success) {
                    if let Some(error) = &outcome.error {
                        println!("FAILED {} after {} attempt(s): {error}", outcome.file_name, outcome.attempts);
                    }
                }
                if once || shutdown.is_requested() || result.touched() == 0 {
                    break;
                }
            }
        }
    }

    println!("{succeeded} succeeded, {failed} failed, {duplicates} duplicate(s)");
    Ok(())
}

fn status(config: &AppConfig) -> Result<(), Box<dyn Error>> {
    let folders = config.folders();
    for partition in Partition::iter() {
        let stats = folders.stats(partition)?;
        if stats.exists {
            println!("{:<11} {:>6} files {:>10.2} MiB", partition.to_string(), stats.count, stats.size_mib());
        } else {
            println!("{:<11} missing ({})", partition.to_string(), folders.path(partition).display());
        }
    }

    let snapshot = resolver::resolve(&folders)?;
    println!("pending     {:>6}", snapshot.pending.len());

    let leases = config.leases();
    for front_end in [FrontEnd::Interactive, FrontEnd::Background] {
        let name = front_end.lease_name();
        match leases.holder(name)? {
            Some(record) if !leases.is_stale(&record) => {
                println!("{name}: held by pid {} since {}", record.pid, record.acquired_at.to_rfc3339());
            }
            Some(record) => println!("{name}: stale (pid {})", record.pid),
            None => println!("{name}: free"),
        }
    }
    Ok(())
}
