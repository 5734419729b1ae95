//! Scripted in-memory ELM327 for tests
//!
//! Enabled with the `mock` feature (always on for this crate's own tests).

use crate::error::TransportError;
use crate::transport::Transport;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// VIN reported by the scripted adapter (valid check digit)
pub const MOCK_VIN: &str = "1HGCM82633A004352";

/// How the scripted adapter answers one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Answer with this text followed by the prompt
    Text(String),
    /// Answer with these bytes, not necessarily UTF-8, followed by the prompt
    Raw(Vec<u8>),
    /// Answer the way a healthy adapter on a running engine would
    Default,
    /// Never answer (the framer times out)
    Silent,
    /// Close the channel
    Hangup,
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Reply::Text(text.into())
    }
}

/// Answers of a healthy adapter on a running engine
pub fn default_reply(command: &str) -> &'static str {
    match command {
        "ATZ" | "ATWS" | "ATD" | "ATI" => "ELM327 v1.5",
        "ATRV" => "12.6V",
        "ATDPN" => "A6",
        c if c.starts_with("AT") => "OK",
        "0100" => "41 00 BE 3F A8 13",
        "0120" => "41 20 80 00 00 00",
        "0101" => "41 01 82 07 E5 00",
        "0104" => "41 04 80",
        "0105" => "41 05 7B",
        "010C" => "41 0C 1A F8",
        "010D" => "41 0D 32",
        "0110" => "41 10 01 F4",
        "0111" => "41 11 40",
        "03" => "43 02 01 33 01 71",
        "0902" => "014\r0: 49 02 01 31 48 47\r1: 43 4D 38 32 36 33 33\r2: 41 30 30 34 33 35 32",
        _ => "NO DATA",
    }
}

/// Shared record of what the scripted adapter saw
#[derive(Debug, Clone, Default)]
pub struct CommandLog {
    commands: Arc<Mutex<Vec<String>>>,
    connects: Arc<AtomicUsize>,
}

impl CommandLog {
    /// Every command received, in order
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// How many times `command` was received
    pub fn count(&self, command: &str) -> usize {
        self.commands()
            .iter()
            .filter(|c| c.as_str() == command)
            .count()
    }

    /// How many times `connect` succeeded
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    fn record(&self, command: String) {
        if let Ok(mut commands) = self.commands.lock() {
            commands.push(command);
        }
    }
}

type Handler = Box<dyn FnMut(&str) -> Reply + Send>;

/// Transport that answers commands from a closure
pub struct ScriptedTransport {
    handler: Handler,
    log: CommandLog,
    partial: Vec<u8>,
    pending: VecDeque<u8>,
    chunk_size: usize,
    echo: bool,
    connected: bool,
    hung_up: bool,
    refuse_connect: bool,
}

impl ScriptedTransport {
    /// Adapter driven by `handler`; commands arrive trimmed and upper-cased
    pub fn new(handler: impl FnMut(&str) -> Reply + Send + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            log: CommandLog::default(),
            partial: Vec::new(),
            pending: VecDeque::new(),
            chunk_size: 64,
            echo: false,
            connected: false,
            hung_up: false,
            refuse_connect: false,
        }
    }

    /// Adapter answering everything with [`default_reply`]
    pub fn healthy() -> Self {
        Self::new(|_| Reply::Default)
    }

    /// Deliver at most `size` bytes per `receive`
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    /// Echo commands back until `ATE0` is received
    pub fn with_echo(mut self) -> Self {
        self.echo = true;
        self
    }

    /// Make `connect` fail
    pub fn refusing_connections(mut self) -> Self {
        self.refuse_connect = true;
        self
    }

    /// Handle on the command log, usable after the transport is boxed
    pub fn history(&self) -> CommandLog {
        self.log.clone()
    }

    fn dispatch(&mut self, command: String) {
        self.log.record(command.clone());

        if self.echo {
            self.pending.extend(command.as_bytes());
            self.pending.push_back(b'\r');
            if command == "ATE0" {
                self.echo = false;
            }
        }

        let bytes = match (self.handler)(&command) {
            Reply::Text(text) => text.into_bytes(),
            Reply::Raw(bytes) => bytes,
            Reply::Default => default_reply(&command).as_bytes().to_vec(),
            Reply::Silent => return,
            Reply::Hangup => {
                self.hung_up = true;
                return;
            }
        };

        self.pending.extend(bytes);
        self.pending.extend(b"\r\r>");
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.refuse_connect {
            return Err(TransportError::Connect {
                target: self.describe(),
                reason: "connection refused".to_string(),
            });
        }
        self.connected = true;
        self.hung_up = false;
        self.pending.clear();
        self.partial.clear();
        self.log.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        for byte in bytes {
            if *byte == b'\r' {
                let command = String::from_utf8_lossy(&self.partial)
                    .trim()
                    .to_ascii_uppercase();
                self.partial.clear();
                if !command.is_empty() {
                    self.dispatch(command);
                }
            } else if *byte != b'\n' {
                self.partial.push(*byte);
            }
        }
        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        if self.pending.is_empty() {
            if self.hung_up {
                return Ok(0);
            }
            return std::future::pending().await;
        }

        let n = self.pending.len().min(buf.len()).min(self.chunk_size);
        for slot in buf.iter_mut().take(n) {
            // n <= pending.len()
            *slot = self.pending.pop_front().unwrap_or_default();
        }
        Ok(n)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.connected = false;
        self.pending.clear();
        Ok(())
    }

    fn describe(&self) -> String {
        "mock://elm327".to_string()
    }
}
