//! OBD-II Connection Supervisor for ELM327 Adapters
//!
//! Owns the framer behind a single lock so exactly one command is in flight,
//! runs the reset/configure/probe handshake and publishes the connection
//! state on a watch channel.

use crate::decoder;
use crate::error::{HandshakeError, ObdError, TransportError};
use crate::framer::Framer;
use crate::pid::{PidCode, PidRegistry};
use crate::protocol::ObdProtocol;
use crate::source::PidSource;
use crate::transport::Transport;
use async_trait::async_trait;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

/// Default timeout for OBD commands
const DEFAULT_TIMEOUT_MS: u64 = 2000;

/// Formatting commands sent after reset; failures are tolerated
const SETUP_COMMANDS: &[&str] = &["ATE0", "ATL0", "ATS0", "ATH0"];

/// Link state of one supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
    /// Connected but every polled PID keeps failing
    Degraded,
}

impl ConnectionState {
    /// Allowed transitions; anything may fall back to `Disconnected`
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (_, Disconnected)
                | (Disconnected, Connecting)
                | (Connecting, Handshaking)
                | (Handshaking, Ready)
                | (Ready, Degraded)
                | (Degraded, Ready)
        )
    }

    /// Whether PID queries may be issued
    pub fn accepts_queries(&self) -> bool {
        matches!(self, ConnectionState::Ready | ConnectionState::Degraded)
    }
}

/// Handshake and retry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Per-command timeout in milliseconds
    pub timeout_ms: u64,
    /// Attempts per handshake step
    pub max_retries: u32,
    /// Base delay between attempts in milliseconds (multiplied by attempt)
    pub retry_backoff_ms: u64,
    /// Protocol selected with `ATSPn`
    pub protocol: ObdProtocol,
    /// Substring the reset response must contain
    pub ready_token: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_retries: 3,
            retry_backoff_ms: 500,
            protocol: ObdProtocol::Auto,
            ready_token: "ELM".to_string(),
        }
    }
}

impl SupervisorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(u64::from(attempt)))
    }
}

/// OBD-II client for communicating with ELM327-compatible adapters
pub struct ObdClient {
    framer: Mutex<Framer>,
    registry: Arc<PidRegistry>,
    config: SupervisorConfig,
    state: watch::Sender<ConnectionState>,
    /// Bus protocol reported by `ATDPN` during the last handshake
    protocol: RwLock<ObdProtocol>,
}

impl ObdClient {
    /// Create a disconnected client over `transport`
    pub fn new(
        transport: Box<dyn Transport>,
        registry: Arc<PidRegistry>,
        config: SupervisorConfig,
    ) -> Self {
        info!("Creating OBD client for {}", transport.describe());
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            framer: Mutex::new(Framer::new(transport, config.timeout())),
            registry,
            config,
            state,
            protocol: RwLock::new(ObdProtocol::Auto),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Receiver notified on every state change
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Open the transport and run the handshake
    pub async fn connect(&self) -> Result<(), ObdError> {
        let mut framer = self.framer.lock().await;
        self.connect_locked(&mut framer).await
    }

    /// Close the transport
    pub async fn disconnect(&self) {
        let mut framer = self.framer.lock().await;
        if let Err(e) = framer.close().await {
            debug!("Error closing {}: {}", framer.describe(), e);
        }
        self.set_state(ConnectionState::Disconnected);
        info!("Disconnected from {}", framer.describe());
    }

    fn set_state(&self, next: ConnectionState) -> bool {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if !current.can_transition_to(next) {
                warn!("Ignoring state change {:?} -> {:?}", current, next);
                return false;
            }
            info!("Connection state: {:?} -> {:?}", current, next);
            *current = next;
            true
        })
    }

    async fn connect_locked(&self, framer: &mut Framer) -> Result<(), ObdError> {
        if self.state() != ConnectionState::Disconnected {
            self.set_state(ConnectionState::Disconnected);
        }
        self.set_state(ConnectionState::Connecting);

        let result = self.handshake(framer).await;
        match &result {
            Ok(()) => {
                self.set_state(ConnectionState::Ready);
                info!("OBD adapter at {} ready", framer.describe());
            }
            Err(e) => {
                error!("Connection to {} failed: {}", framer.describe(), e);
                if let Err(close_err) = framer.close().await {
                    debug!("Error closing after failed handshake: {}", close_err);
                }
                self.set_state(ConnectionState::Disconnected);
            }
        }
        result
    }

    async fn handshake(&self, framer: &mut Framer) -> Result<(), ObdError> {
        self.open_with_retries(framer).await?;
        self.set_state(ConnectionState::Handshaking);

        self.reset(framer).await?;
        self.configure(framer).await?;
        self.probe_ecu(framer).await?;
        self.detect_protocol(framer).await
    }

    async fn open_with_retries(&self, framer: &mut Framer) -> Result<(), TransportError> {
        let attempts = self.config.attempts();
        let mut attempt = 1;
        loop {
            match framer.open().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    warn!(
                        "Connect attempt {}/{} to {} failed: {}",
                        attempt,
                        attempts,
                        framer.describe(),
                        e
                    );
                    tokio::time::sleep(self.config.backoff(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// `ATZ` until the response carries the ready token
    async fn reset(&self, framer: &mut Framer) -> Result<(), ObdError> {
        let token = self.config.ready_token.to_ascii_uppercase();
        let attempts = self.config.attempts();

        for attempt in 1..=attempts {
            match framer.send("ATZ").await {
                Ok(response) if response.to_ascii_uppercase().contains(&token) => {
                    debug!("Interpreter identified as {:?}", response);
                    return Ok(());
                }
                Ok(response) => {
                    warn!("Reset attempt {}/{}: unexpected answer {:?}", attempt, attempts, response);
                }
                Err(e) if e.is_fatal() => return Err(HandshakeError::Transport(e).into()),
                Err(e) => warn!("Reset attempt {}/{}: {}", attempt, attempts, e),
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.backoff(attempt)).await;
            }
        }

        Err(HandshakeError::NoInterpreter.into())
    }

    /// Echo off, formatting and protocol selection, best-effort
    async fn configure(&self, framer: &mut Framer) -> Result<(), ObdError> {
        let protocol = self.config.protocol.to_elm_command();
        let commands = SETUP_COMMANDS.iter().copied().chain(std::iter::once(protocol.as_str()));

        for command in commands {
            match framer.send(command).await {
                Ok(response) if response.to_ascii_uppercase().contains("OK") => {}
                Ok(response) => debug!("{} answered {:?}", command, response),
                Err(e) if e.is_fatal() => return Err(HandshakeError::Transport(e).into()),
                Err(e) => warn!("{} failed, continuing: {}", command, e),
            }
        }
        Ok(())
    }

    /// `0100` until it carries the `41 00` acknowledgement
    async fn probe_ecu(&self, framer: &mut Framer) -> Result<(), ObdError> {
        let attempts = self.config.attempts();

        for attempt in 1..=attempts {
            match probe_once(framer).await {
                Ok(()) => return Ok(()),
                Err(ObdError::Transport(e)) if e.is_fatal() => {
                    return Err(HandshakeError::Transport(e).into())
                }
                Err(e) => warn!("Capability probe {}/{}: {}", attempt, attempts, e),
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.backoff(attempt)).await;
            }
        }

        Err(HandshakeError::NoEcu.into())
    }

    /// `ATDPN` once the bus answered; an unreadable answer leaves `Auto`
    async fn detect_protocol(&self, framer: &mut Framer) -> Result<(), ObdError> {
        let detected = match framer.send("ATDPN").await {
            Ok(response) => ObdProtocol::from_number(&response).unwrap_or_else(|| {
                debug!("Unrecognised ATDPN answer {:?}", response);
                ObdProtocol::Auto
            }),
            Err(e) if e.is_fatal() => return Err(HandshakeError::Transport(e).into()),
            Err(e) => {
                warn!("ATDPN failed, continuing: {}", e);
                ObdProtocol::Auto
            }
        };

        info!("Bus protocol: {}", detected);
        if let Ok(mut protocol) = self.protocol.write() {
            *protocol = detected;
        }
        Ok(())
    }

    fn ensure_queryable(&self) -> Result<(), ObdError> {
        let state = self.state();
        if state.accepts_queries() {
            Ok(())
        } else {
            Err(ObdError::NotReady(state))
        }
    }

    fn on_link_error(&self, error: &TransportError) {
        if error.is_fatal() {
            error!("Link failure: {}", error);
            self.set_state(ConnectionState::Disconnected);
        }
    }
}

async fn probe_once(framer: &mut Framer) -> Result<(), ObdError> {
    let code = PidCode::current(0x00);
    let response = framer.send(&code.command()).await?;
    decoder::extract_payload(code, 4, &response)?;
    Ok(())
}

#[async_trait]
impl PidSource for ObdClient {
    fn registry(&self) -> &PidRegistry {
        &self.registry
    }

    async fn exchange(&self, command: &str) -> Result<Vec<String>, ObdError> {
        self.ensure_queryable()?;
        let mut framer = self.framer.lock().await;
        // a reconnect may have finished or failed while we waited
        self.ensure_queryable()?;

        framer.send_lines(command).await.map_err(|e| {
            self.on_link_error(&e);
            ObdError::Transport(e)
        })
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn active_protocol(&self) -> ObdProtocol {
        self.protocol.read().map(|p| *p).unwrap_or_default()
    }

    async fn probe(&self) -> Result<(), ObdError> {
        self.ensure_queryable()?;
        let mut framer = self.framer.lock().await;
        self.ensure_queryable()?;

        match probe_once(&mut framer).await {
            Err(ObdError::Transport(e)) => {
                self.on_link_error(&e);
                Err(ObdError::Transport(e))
            }
            other => other,
        }
    }

    async fn reconnect(&self) -> Result<(), ObdError> {
        counter!("obd_reconnects_total").increment(1);
        let mut framer = self.framer.lock().await;
        info!("Reconnecting to {}", framer.describe());

        if let Err(e) = framer.close().await {
            debug!("Error closing before reconnect: {}", e);
        }
        self.set_state(ConnectionState::Disconnected);
        self.connect_locked(&mut framer).await
    }

    fn mark_degraded(&self) {
        if self.state() == ConnectionState::Ready {
            warn!("All polled PIDs failing, marking connection degraded");
            self.set_state(ConnectionState::Degraded);
        }
    }
}
