//! OBD-II Acquisition Engine
//!
//! Wires a reading source (adapter or emulator), the supported-PID cache,
//! the session logger, the acquisition loop and the heartbeat together from
//! one [`EngineConfig`].

mod config;

pub use config::{EngineConfig, EngineMode, DEFAULT_CONFIG_NAME, ENV_PREFIX};

use obd_protocol::{
    vin, ConnectionState, DtcRecord, Emulator, ObdClient, ObdError, PidCode, PidSource, Reading,
    RegistryError, Transport, VinRecord,
};
use obd_scheduler::{AcquisitionLoop, Heartbeat, ReadingFeed, SchedulerError};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use storage::{AsyncLogger, LoggerHandle, PidCache, SessionSnapshot, StorageError};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    #[error("PID registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("OBD error: {0}")]
    Obd(#[from] ObdError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Logging setup failed: {0}")]
    Logging(String),

    #[error("Metrics exporter failed: {0}")]
    Metrics(String),

    #[error("Background task failed: {0}")]
    Task(String),
}

/// A running acquisition session
pub struct Engine {
    source: Arc<dyn PidSource>,
    client: Option<Arc<ObdClient>>,
    feed: ReadingFeed,
    cache: Arc<PidCache>,
    vin: Option<VinRecord>,
    logger: AsyncLogger,
    shutdown: watch::Sender<bool>,
    acquisition: JoinHandle<Result<(), SchedulerError>>,
    heartbeat: JoinHandle<()>,
}

impl Engine {
    /// Start a session with a fresh PID cache
    pub async fn start(config: EngineConfig) -> Result<Self, EngineError> {
        Self::start_with_cache(config, Arc::new(PidCache::new())).await
    }

    /// Start a session in the configured mode, sharing `cache`
    pub async fn start_with_cache(
        config: EngineConfig,
        cache: Arc<PidCache>,
    ) -> Result<Self, EngineError> {
        match config.mode {
            EngineMode::Real => {
                let transport = config.transport.build(config.supervisor.timeout());
                Self::start_with_transport(config, transport, cache).await
            }
            EngineMode::Emulator => {
                let registry = Arc::new(config.registry()?);
                info!("Starting in emulator mode");
                let emulator = Arc::new(Emulator::new(registry, config.emulator.clone()));
                Self::launch(emulator, None, &config, cache).await
            }
        }
    }

    /// Start a session against an adapter reached through `transport`
    pub async fn start_with_transport(
        config: EngineConfig,
        transport: Box<dyn Transport>,
        cache: Arc<PidCache>,
    ) -> Result<Self, EngineError> {
        let registry = Arc::new(config.registry()?);
        info!("Connecting to {}", transport.describe());
        let client = Arc::new(ObdClient::new(
            transport,
            registry,
            config.supervisor.clone(),
        ));
        client.connect().await?;
        Self::launch(client.clone(), Some(client), &config, cache).await
    }

    async fn launch(
        source: Arc<dyn PidSource>,
        client: Option<Arc<ObdClient>>,
        config: &EngineConfig,
        cache: Arc<PidCache>,
    ) -> Result<Self, EngineError> {
        let logger = AsyncLogger::spawn(config.logger.clone()).await?;
        let handle = logger.handle();
        log_event(&handle, "state", format!("{:?}", source.state()));

        let vin = identify(source.as_ref(), &handle).await?;
        let supported = resolve_supported(source.as_ref(), &cache, vin.as_ref()).await?;

        let feed = ReadingFeed::new();
        let mut acquisition = AcquisitionLoop::new(
            source.clone(),
            config.acquisition.clone(),
            feed.clone(),
            Some(handle.clone()),
        )?;
        acquisition.restrict_to(&supported)?;
        info!("Polling {} PIDs", acquisition.poll_set().len());

        let heartbeat = Heartbeat::new(source.clone(), config.heartbeat.clone(), Some(handle));

        let (shutdown, stop_rx) = watch::channel(false);
        let acquisition = tokio::spawn(acquisition.run(stop_rx.clone()));
        let heartbeat = tokio::spawn(heartbeat.run(stop_rx));

        Ok(Self {
            source,
            client,
            feed,
            cache,
            vin,
            logger,
            shutdown,
            acquisition,
            heartbeat,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.source.state()
    }

    /// Last reading per PID
    pub fn latest(&self) -> Vec<Reading> {
        self.feed.latest()
    }

    /// Readings published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Reading> {
        self.feed.subscribe()
    }

    /// Decoded VIN of this session, when the vehicle reported one
    pub fn vin(&self) -> Option<&VinRecord> {
        self.vin.as_ref()
    }

    /// Read stored trouble codes
    pub async fn read_dtcs(&self) -> Result<Vec<DtcRecord>, EngineError> {
        let dtcs = self.source.read_dtcs().await?;
        info!("Read {} stored trouble codes", dtcs.len());
        let handle = self.logger.handle();
        for dtc in &dtcs {
            log_event(&handle, "dtc", format!("{} (MIL {})", dtc.code, dtc.mil_active));
        }
        Ok(dtcs)
    }

    /// PIDs removed from the poll set after repeated failures
    pub fn disabled(&self) -> Vec<PidCode> {
        self.feed.disabled()
    }

    pub fn cache(&self) -> &Arc<PidCache> {
        &self.cache
    }

    /// Stop polling, close the link and flush the session file
    pub async fn shutdown(self) -> Result<SessionSnapshot, EngineError> {
        info!("Shutting down engine");
        // fails only if both tasks already ended
        let _ = self.shutdown.send(true);

        match self.acquisition.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Acquisition ended with: {}", e),
            Err(e) => return Err(EngineError::Task(e.to_string())),
        }
        self.heartbeat
            .await
            .map_err(|e| EngineError::Task(e.to_string()))?;

        if let Some(client) = &self.client {
            client.disconnect().await;
        }

        log_event(&self.logger.handle(), "state", "shutdown".to_string());
        Ok(self.logger.shutdown().await?)
    }
}

/// Read and decode the VIN; a vehicle without one is not an error
async fn identify(
    source: &dyn PidSource,
    logger: &LoggerHandle,
) -> Result<Option<VinRecord>, EngineError> {
    match source.read_vin().await {
        Ok(raw) => {
            let record = vin::decode(&raw);
            match &record.error {
                None => info!(
                    "VIN {} ({:?}, {:?})",
                    record.raw, record.manufacturer, record.model_year
                ),
                Some(e) => warn!("VIN {} did not validate: {}", record.raw, e),
            }
            if let Err(e) = logger.set_vin(record.raw.clone()) {
                warn!("Could not log VIN: {}", e);
            }
            Ok(Some(record))
        }
        Err(e) if e.is_link_failure() => Err(e.into()),
        Err(e) => {
            warn!("VIN unavailable: {}", e);
            Ok(None)
        }
    }
}

/// Cached supported set for this vehicle, or a fresh discovery
async fn resolve_supported(
    source: &dyn PidSource,
    cache: &PidCache,
    vin: Option<&VinRecord>,
) -> Result<BTreeSet<PidCode>, EngineError> {
    let key = vin.map(|record| record.raw.as_str());
    if let Some(set) = cache.get(key)? {
        info!("Using {} cached supported PIDs", set.pids.len());
        return Ok(set.pids);
    }

    match source.discover_supported().await {
        Ok(pids) => Ok(cache.set(key, pids)?.pids),
        Err(e) if e.is_link_failure() => Err(e.into()),
        Err(e) => {
            warn!("Supported-PID discovery failed, polling the configured set: {}", e);
            Ok(BTreeSet::new())
        }
    }
}

fn log_event(logger: &LoggerHandle, kind: &str, message: String) {
    if let Err(e) = logger.log_event(kind, message) {
        error!("Could not queue {} event: {}", kind, e);
    }
}

/// Initialize logging
pub fn init_logging(level: &str, json: bool) -> Result<(), EngineError> {
    let level = Level::from_str(level).map_err(|e| EngineError::Logging(e.to_string()))?;

    let result = if json {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(true)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
    };
    result.map_err(|e| EngineError::Logging(e.to_string()))
}

/// Serve Prometheus metrics on `addr`
pub fn install_metrics(addr: SocketAddr) -> Result<(), EngineError> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| EngineError::Metrics(e.to_string()))?;
    info!("Metrics exported on http://{}/metrics", addr);
    Ok(())
}
