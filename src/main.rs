mod app;
mod bbswitch;
mod config;
mod data;
mod format;
mod monitor;
mod pci;
mod process;
mod reconcile;
mod scheduler;
mod session;

use anyhow::{anyhow, Context};
use app::DgmApp;
use clap::Parser;
use config::MonitorConfig;
use egui::ViewportBuilder;
use monitor::NvmlSampler;
use scheduler::MonitorScheduler;
use std::path::PathBuf;
use std::sync::Arc;

/// Monitor for power-gated NVIDIA GPUs
#[derive(Parser, Debug)]
#[command(name = "dgm", version, about)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// JSON configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();
    log::debug!("Verbose output enabled");

    let config = MonitorConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    // polling runs on the runtime, the window on the main thread
    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    let sampler = Arc::new(NvmlSampler::new(&config.modules_path, &config.nvidia_device));
    let scheduler = MonitorScheduler::new(runtime.handle().clone(), sampler, config.timing());

    let native_options = eframe::NativeOptions {
        viewport: ViewportBuilder::default().with_inner_size([1000.0, 760.0]),
        ..Default::default()
    };

    eframe::run_native(
        "DGM",
        native_options,
        Box::new(move |cc| Ok(Box::new(DgmApp::new(cc, scheduler, &config)))),
    )
    .map_err(|e| anyhow!("Failed to start application: {}", e))?;

    Ok(())
}
