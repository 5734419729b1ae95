//! OBD-II Acquisition Engine - Main Entry Point

use engine::{init_logging, install_metrics, Engine, EngineConfig};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args().nth(1);
    let config = EngineConfig::load(path.as_deref())?;
    init_logging(&config.log_level, config.log_json)?;

    info!("=== OBD Engine v{} ===", env!("CARGO_PKG_VERSION"));
    info!("Mode: {:?}", config.mode);

    if let Some(addr) = config.metrics_addr {
        install_metrics(addr)?;
    }

    let engine = Engine::start(config).await?;
    if let Some(vin) = engine.vin() {
        info!("Vehicle {} (valid: {})", vin.raw, vin.valid);
    }

    let mut readings = engine.subscribe();
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);
    loop {
        tokio::select! {
            _ = &mut interrupt => {
                info!("Interrupt received");
                break;
            }
            reading = readings.recv() => match reading {
                Ok(reading) => debug!("{} = {} {}", reading.pid, reading.value, reading.unit),
                Err(RecvError::Lagged(skipped)) => warn!("Skipped {} readings", skipped),
                Err(RecvError::Closed) => {
                    warn!("Acquisition ended on its own");
                    break;
                }
            },
        }
    }

    for pid in engine.disabled() {
        warn!("PID {} was disabled during the session", pid);
    }
    let snapshot = engine.shutdown().await?;
    info!(
        "Session {} finished with {} PIDs and {} events",
        snapshot.session,
        snapshot.readings.len(),
        snapshot.events.len()
    );

    Ok(())
}
