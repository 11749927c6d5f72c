use std::sync::Arc;

use ocr_folder_queue::{
    config::AppConfig,
    services::{
        ocr::Pdf24Cli,
        scheduler::{FrontEnd, Scheduler},
        shutdown::{os_signal, shutdown_channel},
    },
    telemetry,
};

#[tokio::main]
async fn main() {
    telemetry::init_tracing(true);

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!(work_dir = %config.work_dir.display(), "Starting OCR folder queue daemon");

    if let Some(addr) = config.metrics_addr {
        telemetry::install_metrics_exporter(addr).expect("Failed to install Prometheus exporter");
    }

    let folders = config.folders();
    folders.ensure_all().expect("Failed to create queue folders");

    let engine = Pdf24Cli::from_config(&config);
    if !engine.is_installed() {
        tracing::error!(tool = %engine.tool_path().display(), "OCR tool not found, refusing to start");
        std::process::exit(1);
    }

    let scheduler = Scheduler::from_config(&config, Arc::new(engine), FrontEnd::Background);
    tracing::info!(
        input = %folders.input.display(),
        output = %folders.output.display(),
        settings = %config.settings_path().display(),
        max_workers = config.worker_ceiling(),
        "Daemon ready"
    );

    let (trigger, shutdown) = shutdown_channel();
    tokio::spawn(async move {
        os_signal().await;
        tracing::info!("Shutdown signal received");
        trigger.trigger();
    });

    scheduler.run_forever(shutdown).await;
    tracing::info!("Daemon stopped");
}
