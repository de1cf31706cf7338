/*!
# Inspection Line Host

Runs the inspection line against real devices or the simulated bench and
takes operator commands on stdin.

## Usage

```bash
inspection_line --config line.toml run
inspection_line run --simulate
inspection_line config --output line.toml
```

Console commands: `online`, `offline`, `start <car>`, `stop`, `car`
(bench only: simulate a car entering), `status`, `quit`.
*/

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use inspection_line::bench::Bench;
use inspection_line::camera::{FrameSink, LoggingSink, SimulatedCamera, ThermalCamera};
use inspection_line::light_curtain;
use inspection_line::plc::McProtocolClient;
use inspection_line::{AppConfig, DeviceSet, InspectionLine};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "inspection_line")]
#[command(about = "Vehicle thermal inspection line controller")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "inspection_line.toml")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the line and read operator commands from stdin
    Run {
        /// Use simulated devices instead of the configured endpoints
        #[arg(long)]
        simulate: bool,
    },

    /// Generate configuration file
    Config {
        /// Output path for configuration file
        #[arg(short, long, default_value = "inspection_line.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout stays free for the console
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match cli.command {
        Commands::Run { simulate } => run(cli.config, simulate).await,
        Commands::Config { output } => generate_config_file(output),
    }
}

fn load_config(path: &Path, simulate: bool) -> Result<AppConfig> {
    if path.exists() {
        return AppConfig::load_from_file(path);
    }
    if simulate {
        warn!("⚠️ {} not found, using defaults", path.display());
        return Ok(AppConfig::new());
    }
    anyhow::bail!("config file {} not found; generate one with `config --output`", path.display())
}

async fn run(config_path: PathBuf, simulate: bool) -> Result<()> {
    let mut config = load_config(&config_path, simulate)?;
    let bench = if simulate {
        Some(Bench::start(&mut config).await.context("failed to start the simulated bench")?)
    } else {
        None
    };

    info!("🚀 Starting inspection line ({})", if simulate { "simulated" } else { "live" });
    let line = InspectionLine::new(config);

    let shutdown = CancellationToken::new();
    let ctrlc_token = shutdown.clone();
    ctrlc::set_handler(move || {
        eprintln!("\n🛑 Received Ctrl+C, shutting down gracefully...");
        ctrlc_token.cancel();
    })?;

    let mut commands = spawn_console();
    bring_online(&line, bench.as_ref()).await;

    loop {
        let line_text = tokio::select! {
            _ = shutdown.cancelled() => break,
            text = commands.recv() => match text {
                Some(text) => text,
                None => {
                    info!("console closed");
                    shutdown.cancelled().await;
                    break;
                }
            },
        };

        let mut words = line_text.split_whitespace();
        match (words.next(), words.next()) {
            (None, _) => {}
            (Some("online"), _) => bring_online(&line, bench.as_ref()).await,
            (Some("offline"), _) => line.go_offline().await,
            (Some("start"), Some(car)) => {
                if !line.start_inspection_sequence(car).await {
                    warn!("start of {} was not accepted", car);
                }
            }
            (Some("start"), None) => warn!("usage: start <car>"),
            (Some("stop"), _) => line.stop_inspection().await,
            (Some("car"), _) => match &bench {
                Some(bench) => bench.signal_car_entry(),
                None => warn!("car entry comes from the PLC in live mode"),
            },
            (Some("status"), _) => info!(
                "online: {}, running: {}",
                line.is_online().await,
                line.is_running()
            ),
            (Some("quit"), _) | (Some("exit"), _) => break,
            (Some(other), _) => warn!("unknown command '{}'", other),
        }
    }

    line.go_offline().await;
    if let Some(bench) = bench {
        bench.stop().await;
    }
    println!("✅ Inspection line stopped");
    Ok(())
}

async fn bring_online(line: &InspectionLine, bench: Option<&Bench>) {
    let devices = match bench {
        Some(bench) => bench.devices(),
        None => live_devices(line.config()),
    };
    if let Err(e) = line.go_online(devices).await {
        error!("failed to go online: {}", e);
    }
}

fn live_devices(config: &AppConfig) -> DeviceSet {
    // No vendor camera adapter is linked into this build
    warn!("⚠️ No thermal camera driver available, using simulated cameras");
    DeviceSet {
        plc: Box::new(McProtocolClient::new(
            &config.plc.host,
            config.plc.port,
            Duration::from_millis(config.plc.io_timeout_ms),
        )),
        cameras: config
            .modules
            .iter()
            .map(|m| Arc::new(SimulatedCamera::new(&m.camera_id, Duration::from_millis(33))) as Arc<dyn ThermalCamera>)
            .collect(),
        sinks: config
            .modules
            .iter()
            .map(|_| Box::new(LoggingSink::default()) as Box<dyn FrameSink>)
            .collect(),
        light_curtain: light_curtain::from_config(&config.light_curtain),
    }
}

/// Forward stdin lines from a blocking reader thread
fn spawn_console() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Generate a default configuration file
fn generate_config_file(output_path: PathBuf) -> Result<()> {
    let config = AppConfig::new();
    config.save_to_file(&output_path)?;

    println!("✅ Generated configuration file: {}", output_path.display());
    println!("📝 Edit the file to customize settings, then run:");
    println!("   inspection_line --config {} run", output_path.display());

    Ok(())
}
