//! Instrument control server entry point.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use rppal::gpio::Gpio;
use tokio::net::TcpListener;
use tokio::sync::{Notify, mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use needle_server::config::Config;
use needle_server::events::event_loop;
use needle_server::gpio::{GpioLeds, InputBank, InputLevels, NullLeds, spawn_input_watcher};
use needle_server::indicator::LedSink;
use needle_server::server::{self, App};
use needle_server::supervisor::spawn_supervisor;
use needle_server::telemetry::spawn_telemetry;

#[derive(Debug, Parser)]
#[command(name = "needle_server", about = "Needle-inspector instrument control server")]
struct Args {
    /// Path to a TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the WebSocket listen address.
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(err) => {
                error!(%err, "cannot load config");
                return ExitCode::FAILURE;
            }
        },
        None => Config::default(),
    };
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }

    let (inputs, leds) = init_gpio();
    let levels = inputs.as_ref().map(|bank| {
        let levels = Arc::new(InputLevels::default());
        levels.seed(bank);
        levels
    });
    let app = Arc::new(App::new(config.clone(), leds, levels.clone()));

    if let (Some(bank), Some(levels)) = (inputs, levels) {
        // A tip may already be seated at startup.
        let snapshot = bank.snapshot();
        app.indicator()
            .sync_inputs(snapshot.tip_present, snapshot.short);

        let (event_tx, event_rx) = mpsc::channel(64);
        let _ = spawn_input_watcher(bank, levels, event_tx);
        tokio::spawn(event_loop(app.clone(), event_rx));
    }
    let _ = spawn_telemetry(app.clone());
    let fatal = Arc::new(Notify::new());
    let _ = spawn_supervisor(app.clone(), fatal.clone());

    let listener = match TcpListener::bind(&config.listen_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(addr = %config.listen_addr, %err, "cannot bind control port");
            return ExitCode::FAILURE;
        }
    };
    info!(addr = %config.listen_addr, "control server listening");

    let exit = tokio::select! {
        result = server::run(app.clone(), listener) => match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                error!(%err, "control listener failed");
                ExitCode::FAILURE
            }
        },
        _ = fatal.notified() => {
            error!("motor port unrecoverable, exiting");
            ExitCode::FAILURE
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            ExitCode::SUCCESS
        }
    };

    app.instrument.disconnect().await;
    app.indicator().all_off();
    info!("shutdown complete");
    exit
}

/// Claim the panel pins. Off-target (or with the GPIO busy) the server runs
/// degraded: no inputs, no lamps, everything else alive.
fn init_gpio() -> (Option<InputBank>, Box<dyn LedSink>) {
    let gpio = match Gpio::new() {
        Ok(gpio) => gpio,
        Err(err) => {
            warn!(%err, "gpio unavailable, panel inputs and lamps disabled");
            return (None, Box::new(NullLeds));
        }
    };
    let inputs = match InputBank::open(&gpio) {
        Ok(bank) => Some(bank),
        Err(err) => {
            warn!(%err, "panel inputs unavailable");
            None
        }
    };
    let leds: Box<dyn LedSink> = match GpioLeds::open(&gpio) {
        Ok(leds) => Box::new(leds),
        Err(err) => {
            warn!(%err, "led bank unavailable");
            Box::new(NullLeds)
        }
    };
    (inputs, leds)
}
