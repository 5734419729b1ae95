//! Link Heartbeat
//!
//! Probes an idle link on a fixed interval and drives recovery when the
//! link is degraded or gone.

use obd_protocol::{ConnectionState, ObdError, PidSource};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use storage::LoggerHandle;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { interval_ms: 5000 }
    }
}

/// What a single heartbeat tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// The probe answered
    Alive,
    /// The link was re-established
    Reconnected,
    /// A handshake is already running
    Skipped,
}

pub struct Heartbeat {
    source: Arc<dyn PidSource>,
    config: HeartbeatConfig,
    logger: Option<LoggerHandle>,
}

impl Heartbeat {
    pub fn new(
        source: Arc<dyn PidSource>,
        config: HeartbeatConfig,
        logger: Option<LoggerHandle>,
    ) -> Self {
        Self {
            source,
            config,
            logger,
        }
    }

    /// Probe once, reconnecting when the link is down or the probe fails
    pub async fn tick(&self) -> Result<HeartbeatOutcome, ObdError> {
        match self.source.state() {
            ConnectionState::Connecting | ConnectionState::Handshaking => {
                debug!("Handshake in progress, skipping heartbeat");
                Ok(HeartbeatOutcome::Skipped)
            }
            ConnectionState::Disconnected | ConnectionState::Degraded => self.recover().await,
            ConnectionState::Ready => match self.source.probe().await {
                Ok(()) => Ok(HeartbeatOutcome::Alive),
                Err(e) => {
                    warn!("Heartbeat probe failed: {}", e);
                    self.recover().await
                }
            },
        }
    }

    async fn recover(&self) -> Result<HeartbeatOutcome, ObdError> {
        info!("Reconnecting from {:?}", self.source.state());
        match self.source.reconnect().await {
            Ok(()) => {
                self.log_event("reconnected", "link re-established".to_string());
                Ok(HeartbeatOutcome::Reconnected)
            }
            Err(e) => {
                self.log_event("reconnect_failed", e.to_string());
                Err(e)
            }
        }
    }

    fn log_event(&self, kind: &str, message: String) {
        if let Some(logger) = &self.logger {
            if let Err(e) = logger.log_event(kind, message) {
                warn!("Could not queue {} event: {}", kind, e);
            }
        }
    }

    /// Tick every `interval_ms` until `shutdown` turns true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting heartbeat every {} ms", self.config.interval_ms);
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.interval_ms.max(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick fires immediately and the link was just connected
        interval.tick().await;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!("Heartbeat recovery failed: {}", e);
                    }
                }
            }
        }
        info!("Heartbeat stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_protocol::mock::{Reply, ScriptedTransport};
    use obd_protocol::{ObdClient, PidRegistry, SupervisorConfig};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn client(transport: ScriptedTransport) -> Arc<ObdClient> {
        Arc::new(ObdClient::new(
            Box::new(transport),
            Arc::new(PidRegistry::standard()),
            SupervisorConfig {
                timeout_ms: 50,
                max_retries: 1,
                retry_backoff_ms: 1,
                ..SupervisorConfig::default()
            },
        ))
    }

    #[tokio::test]
    async fn test_ready_link_is_probed() {
        let transport = ScriptedTransport::healthy();
        let log = transport.history();
        let client = client(transport);
        client.connect().await.unwrap();
        let before = log.count("0100");

        let heartbeat = Heartbeat::new(client, HeartbeatConfig::default(), None);
        assert_eq!(heartbeat.tick().await.unwrap(), HeartbeatOutcome::Alive);
        assert_eq!(log.count("0100"), before + 1);
    }

    #[tokio::test]
    async fn test_disconnected_link_is_reconnected() {
        let transport = ScriptedTransport::healthy();
        let log = transport.history();
        let client = client(transport);

        let heartbeat = Heartbeat::new(client.clone(), HeartbeatConfig::default(), None);
        assert_eq!(heartbeat.tick().await.unwrap(), HeartbeatOutcome::Reconnected);
        assert_eq!(client.state(), ConnectionState::Ready);
        assert_eq!(log.connects(), 1);
    }

    #[tokio::test]
    async fn test_failed_probe_triggers_reconnect() {
        let ecu_gone = Arc::new(AtomicBool::new(false));
        let flag = ecu_gone.clone();
        let transport = ScriptedTransport::new(move |cmd| match cmd {
            "0100" if flag.swap(false, Ordering::SeqCst) => Reply::Hangup,
            _ => Reply::Default,
        });
        let log = transport.history();
        let client = client(transport);
        client.connect().await.unwrap();

        ecu_gone.store(true, Ordering::SeqCst);
        let heartbeat = Heartbeat::new(client.clone(), HeartbeatConfig::default(), None);
        assert_eq!(heartbeat.tick().await.unwrap(), HeartbeatOutcome::Reconnected);
        assert_eq!(client.state(), ConnectionState::Ready);
        assert_eq!(log.connects(), 2);
    }

    #[tokio::test]
    async fn test_degraded_link_recovers() {
        let client = client(ScriptedTransport::healthy());
        client.connect().await.unwrap();
        client.mark_degraded();
        assert_eq!(client.state(), ConnectionState::Degraded);

        let heartbeat = Heartbeat::new(client.clone(), HeartbeatConfig::default(), None);
        assert_eq!(heartbeat.tick().await.unwrap(), HeartbeatOutcome::Reconnected);
        assert_eq!(client.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_unreachable_adapter_reports_error() {
        let client = client(ScriptedTransport::healthy().refusing_connections());
        let heartbeat = Heartbeat::new(client.clone(), HeartbeatConfig::default(), None);
        assert!(heartbeat.tick().await.is_err());
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let client = client(ScriptedTransport::healthy());
        client.connect().await.unwrap();
        let heartbeat = Heartbeat::new(client, HeartbeatConfig { interval_ms: 1000 }, None);

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(heartbeat.run(stop_rx));
        tokio::time::sleep(Duration::from_millis(3500)).await;
        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
