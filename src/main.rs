use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use home_pv_telemetry::clock::{Clock, SystemClock};
use home_pv_telemetry::config::{Config, TransportKind, DEFAULT_CONFIG_PATH};
use home_pv_telemetry::transport::Transport;
use home_pv_telemetry::{consumer, producer, telemetry};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about = "Simulated household meter and PV telemetry pipeline")]
struct Cli {
    /// Configuration file (TOML), overridable with PVSIM__SECTION__KEY variables
    #[arg(long, env = "PVSIM_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Publish simulated meter readings
    Meter,
    /// Consume meter readings, join them with PV output and write the session log
    Pv,
    /// Run meter and PV together in one process
    Simulate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing();

    let cli = Cli::parse();
    let cfg = Config::load_from(&cli.config)?;

    let cancel = CancellationToken::new();
    telemetry::cancel_on_shutdown(cancel.clone());

    let transport = Transport::connect(&cfg.transport)
        .await
        .context("failed to connect to message transport")?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    match cli.command {
        Command::Meter => {
            if cfg.transport.kind == TransportKind::Memory {
                warn!("in-memory transport selected: readings will not leave this process");
            }
            producer::run_meter(&cfg.meter, &transport, clock, cancel).await?;
        }
        Command::Pv => {
            consumer::run_pv(&cfg.pv, &cfg.storage.data_dir, &transport, clock, cancel).await?;
        }
        Command::Simulate => run_simulation(&cfg, transport, clock, cancel).await?,
    }

    info!("shutdown complete");
    Ok(())
}

async fn run_simulation(
    cfg: &Config,
    transport: Transport,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
) -> Result<()> {
    if cfg.meter.pv_id != cfg.pv.id {
        warn!(
            meter_pv_id = %cfg.meter.pv_id,
            pv_id = %cfg.pv.id,
            "meter and PV are bound to different queues"
        );
    }

    let meter = {
        let (meter_cfg, transport, clock, cancel) =
            (cfg.meter.clone(), transport.clone(), clock.clone(), cancel.clone());
        tokio::spawn(async move {
            producer::run_meter(&meter_cfg, &transport, clock, cancel.clone()).await.map_err(|e| {
                // PV side stops with the meter
                cancel.cancel();
                e
            })
        })
    };

    let pv_result =
        consumer::run_pv(&cfg.pv, &cfg.storage.data_dir, &transport, clock, cancel.clone()).await;
    cancel.cancel();

    meter.await.context("meter task panicked")??;
    pv_result?;
    Ok(())
}
