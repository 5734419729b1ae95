//! Acquisition Loop Implementation

use crate::error::SchedulerError;
use data_validator::{SmoothingSet, ValidationResult, Validator, DEFAULT_WINDOW};
use obd_protocol::{ObdError, PidCode, PidSource, Reading};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use storage::LoggerHandle;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// Readings buffered per slow subscriber before it starts lagging
const BROADCAST_CAPACITY: usize = 256;

/// Configuration for the acquisition loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// PIDs polled each pass, in query order
    pub pids: Vec<PidCode>,
    /// Pause between passes in milliseconds
    pub poll_interval_ms: u64,
    /// Moving-average window per smoothed PID
    pub smoothing_window: usize,
    /// Consecutive decode failures before a PID is dropped
    pub max_consecutive_failures: u32,
    /// Consecutive all-failing passes before the link is reported degraded
    pub degraded_after_passes: u32,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            pids: [0x0C, 0x0D, 0x05, 0x04, 0x11, 0x10]
                .into_iter()
                .map(PidCode::current)
                .collect(),
            poll_interval_ms: 200,
            smoothing_window: DEFAULT_WINDOW,
            max_consecutive_failures: 3,
            degraded_after_passes: 3,
        }
    }
}

impl AcquisitionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Published readings: latest value per PID plus a live subscription
#[derive(Debug, Clone)]
pub struct ReadingFeed {
    latest: Arc<RwLock<BTreeMap<PidCode, Reading>>>,
    disabled: Arc<RwLock<BTreeSet<PidCode>>>,
    /// `None` once the feed is closed
    tx: Arc<RwLock<Option<broadcast::Sender<Reading>>>>,
}

impl ReadingFeed {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            latest: Arc::new(RwLock::new(BTreeMap::new())),
            disabled: Arc::new(RwLock::new(BTreeSet::new())),
            tx: Arc::new(RwLock::new(Some(tx))),
        }
    }

    /// Every reading published from now on; a closed feed yields a
    /// receiver that reports `Closed` straight away
    pub fn subscribe(&self) -> broadcast::Receiver<Reading> {
        if let Ok(tx) = self.tx.read() {
            if let Some(tx) = tx.as_ref() {
                return tx.subscribe();
            }
        }
        broadcast::channel(1).1
    }

    /// End every subscription; latest values stay readable
    pub fn close(&self) {
        if let Ok(mut tx) = self.tx.write() {
            if tx.take().is_some() {
                debug!("Reading feed closed");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.read().map(|tx| tx.is_none()).unwrap_or(true)
    }

    /// Last reading of every PID, in PID order
    pub fn latest(&self) -> Vec<Reading> {
        self.latest
            .read()
            .map(|latest| latest.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, code: &PidCode) -> Option<Reading> {
        self.latest.read().ok().and_then(|latest| latest.get(code).cloned())
    }

    /// PIDs dropped from the poll set after repeated failures
    pub fn disabled(&self) -> Vec<PidCode> {
        self.disabled
            .read()
            .map(|disabled| disabled.iter().copied().collect())
            .unwrap_or_default()
    }

    fn publish(&self, reading: Reading) {
        if let Ok(mut latest) = self.latest.write() {
            latest.insert(reading.pid, reading.clone());
        }
        if let Ok(tx) = self.tx.read() {
            if let Some(tx) = tx.as_ref() {
                // no subscribers is fine
                let _ = tx.send(reading);
            }
        }
    }

    fn disable(&self, code: PidCode) {
        if let Ok(mut disabled) = self.disabled.write() {
            disabled.insert(code);
        }
        if let Ok(mut latest) = self.latest.write() {
            latest.remove(&code);
        }
    }
}

impl Default for ReadingFeed {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of one pass over the poll set
#[derive(Debug, Clone, Default)]
pub struct PassSummary {
    /// Readings published, in query order
    pub readings: Vec<Reading>,
    /// Queries that returned an error
    pub failures: usize,
    /// PIDs disabled during this pass
    pub disabled: Vec<PidCode>,
    /// Range check over the published readings
    pub validation: ValidationResult,
    /// The pass stopped because the link went away
    pub link_lost: bool,
}

/// Sequential poller for one [`PidSource`]
pub struct AcquisitionLoop {
    source: Arc<dyn PidSource>,
    config: AcquisitionConfig,
    poll_set: Vec<PidCode>,
    failures: HashMap<PidCode, u32>,
    failed_passes: u32,
    smoothing: SmoothingSet<PidCode>,
    validator: Validator,
    feed: ReadingFeed,
    logger: Option<LoggerHandle>,
}

impl AcquisitionLoop {
    /// Create a loop over the configured PIDs that the registry defines
    /// for the source's bus protocol
    pub fn new(
        source: Arc<dyn PidSource>,
        config: AcquisitionConfig,
        feed: ReadingFeed,
        logger: Option<LoggerHandle>,
    ) -> Result<Self, SchedulerError> {
        let smoothing = SmoothingSet::new(config.smoothing_window)?;

        let active = source.active_protocol();
        let mut poll_set = Vec::with_capacity(config.pids.len());
        for code in &config.pids {
            match source.registry().get(code) {
                None => warn!("PID {} has no definition, not polling it", code),
                Some(definition) if !definition.protocol.applies_to(active) => warn!(
                    "PID {} is defined for {}, bus runs {}",
                    code, definition.protocol, active
                ),
                Some(_) if !poll_set.contains(code) => poll_set.push(*code),
                Some(_) => {}
            }
        }
        if poll_set.is_empty() {
            return Err(SchedulerError::EmptyPollSet);
        }

        info!("Acquisition loop created with {} PIDs", poll_set.len());
        Ok(Self {
            source,
            config,
            poll_set,
            failures: HashMap::new(),
            failed_passes: 0,
            smoothing,
            validator: Validator::new(),
            feed,
            logger,
        })
    }

    /// Keep only PIDs the vehicle reported as supported
    pub fn restrict_to(&mut self, supported: &BTreeSet<PidCode>) -> Result<(), SchedulerError> {
        if supported.is_empty() {
            return Ok(());
        }
        let before = self.poll_set.len();
        self.poll_set.retain(|code| {
            let keep = supported.contains(code);
            if !keep {
                info!("PID {} not supported by this vehicle", code);
            }
            keep
        });
        debug!("Poll set reduced from {} to {} PIDs", before, self.poll_set.len());

        if self.poll_set.is_empty() {
            return Err(SchedulerError::EmptyPollSet);
        }
        Ok(())
    }

    /// PIDs still polled, in query order
    pub fn poll_set(&self) -> &[PidCode] {
        &self.poll_set
    }

    pub fn feed(&self) -> &ReadingFeed {
        &self.feed
    }

    /// Query every PID in the poll set once
    pub async fn poll_once(&mut self) -> PassSummary {
        let mut summary = PassSummary::default();
        let mut decode_failures = Vec::new();

        for code in self.poll_set.clone() {
            match self.source.query(code).await {
                Ok(reading) => {
                    self.failures.remove(&code);
                    let reading = self.finish(code, reading);
                    self.feed.publish(reading.clone());
                    summary.readings.push(reading);
                }
                Err(e) if e.is_link_failure() || matches!(e, ObdError::NotReady(_)) => {
                    warn!("Pass interrupted at PID {}: {}", code, e);
                    summary.link_lost = true;
                    break;
                }
                Err(e) => {
                    summary.failures += 1;
                    debug!("PID {} failed: {}", code, e);
                    if e.as_decode().is_some() {
                        decode_failures.push(code);
                    }
                }
            }
        }

        if summary.link_lost {
            return summary;
        }

        summary.validation = self.check_pass(&summary.readings);
        if !summary.validation.valid {
            debug!(
                "{} of {} readings out of range",
                summary.validation.errors.len(),
                summary.validation.fields_checked
            );
        }

        // the pass counter is checked before PIDs leave the poll set
        if summary.readings.is_empty() {
            self.on_failed_pass();
        } else {
            self.failed_passes = 0;
        }
        for code in decode_failures {
            if self.record_failure(code) {
                summary.disabled.push(code);
            }
        }

        if !summary.readings.is_empty() {
            if let Some(logger) = &self.logger {
                if let Err(e) = logger.log_readings(summary.readings.clone()) {
                    warn!("Could not queue readings: {}", e);
                }
            }
        }

        summary
    }

    /// Smooth and range-check a fresh reading
    fn finish(&mut self, code: PidCode, reading: Reading) -> Reading {
        let Some(definition) = self.source.registry().get(&code) else {
            return reading;
        };

        let mut reading = if definition.smoothed {
            let smoothed = self.smoothing.push(&code, reading.measured);
            reading.with_value(definition, smoothed)
        } else {
            reading
        };

        match self
            .validator
            .validate_range(&definition.name, reading.measured, definition.min, definition.max)
        {
            Ok(()) => reading.in_range = true,
            Err(e) => {
                debug!("PID {}: {}", code, e);
                reading.in_range = false;
            }
        }
        reading
    }

    fn check_pass(&self, readings: &[Reading]) -> ValidationResult {
        let registry = self.source.registry();
        self.validator.validate_all(readings.iter().filter_map(|reading| {
            let definition = registry.get(&reading.pid)?;
            Some((
                definition.name.as_str(),
                reading.measured,
                definition.min,
                definition.max,
            ))
        }))
    }

    /// Count a decode failure; returns true when the PID was disabled
    fn record_failure(&mut self, code: PidCode) -> bool {
        let count = self.failures.entry(code).or_insert(0);
        *count += 1;
        if *count < self.config.max_consecutive_failures {
            return false;
        }

        warn!(
            "PID {} failed {} times in a row, removing it from the poll set",
            code, count
        );
        self.poll_set.retain(|c| *c != code);
        self.failures.remove(&code);
        self.smoothing.remove(&code);
        self.feed.disable(code);
        self.log_event("pid_disabled", format!("PID {} disabled after repeated failures", code));
        true
    }

    fn on_failed_pass(&mut self) {
        if self.poll_set.is_empty() {
            return;
        }
        self.failed_passes += 1;
        if self.failed_passes >= self.config.degraded_after_passes {
            warn!("{} consecutive passes without a reading", self.failed_passes);
            self.source.mark_degraded();
            self.log_event("degraded", "no PID answered for several passes".to_string());
            self.failed_passes = 0;
        }
    }

    fn log_event(&self, kind: &str, message: String) {
        if let Some(logger) = &self.logger {
            if let Err(e) = logger.log_event(kind, message) {
                warn!("Could not queue {} event: {}", kind, e);
            }
        }
    }

    /// Poll until `shutdown` turns true; an in-flight pass always completes.
    /// The feed is closed whichever way the loop ends.
    pub async fn run(mut self, shutdown: watch::Receiver<bool>) -> Result<(), SchedulerError> {
        info!("Starting acquisition loop");
        let result = self.poll_until(shutdown).await;
        self.feed.close();
        result
    }

    async fn poll_until(
        &mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), SchedulerError> {
        let interval = self.config.poll_interval();

        loop {
            if *shutdown.borrow() {
                break;
            }

            if self.source.state().accepts_queries() {
                let summary = self.poll_once().await;
                debug!(
                    "Pass done: {} readings, {} failures",
                    summary.readings.len(),
                    summary.failures
                );
                if self.poll_set.is_empty() {
                    warn!("Every PID has been disabled, stopping acquisition");
                    self.log_event("stopped", "poll set exhausted".to_string());
                    return Err(SchedulerError::EmptyPollSet);
                }
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }

        info!("Acquisition loop stopped");
        Ok(())
    }
}
