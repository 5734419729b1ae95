//! OBD-II Error Types

use crate::client::ConnectionState;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the byte-stream channel to the interpreter
#[derive(Debug, Error)]
pub enum TransportError {
    /// Could not open the TCP socket or serial device
    #[error("Failed to connect to {target}: {reason}")]
    Connect { target: String, reason: String },

    /// Read or write failure on an open channel
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port error
    #[error("Serial port error: {0}")]
    Serial(String),

    /// No prompt arrived before the deadline
    #[error("Timeout waiting for OBD response after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The peer closed the channel
    #[error("Connection closed by adapter")]
    Closed,

    /// Operation attempted before `connect`
    #[error("Transport is not connected")]
    NotConnected,
}

impl TransportError {
    /// Whether the channel is unusable; a timeout leaves it open
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TransportError::Timeout(_))
    }
}

impl From<tokio_serial::Error> for TransportError {
    fn from(err: tokio_serial::Error) -> Self {
        TransportError::Serial(err.to_string())
    }
}

/// Errors that abort a single connection attempt
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The interpreter never answered the reset command
    #[error("OBD interpreter not responding")]
    NoInterpreter,

    /// The interpreter answered but the ECU capability probe failed
    #[error("Interpreter ready but no ECU answered the capability probe")]
    NoEcu,

    /// The channel failed during the handshake
    #[error("Transport failed during handshake: {0}")]
    Transport(#[from] TransportError),
}

/// Per-reading decode failures; never fatal to the connection
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    /// ECU answered `NO DATA`/`STOPPED` or nothing at all
    #[error("No data returned")]
    NoData,

    /// Response did not match the expected frame layout
    #[error("Malformed response: {0}")]
    Malformed(String),

    /// Formula evaluation hit a division by zero or a non-finite value
    #[error("Arithmetic error while evaluating formula")]
    ArithmeticError,

    /// The code has no definition in the registry
    #[error("PID {0} is not defined")]
    UnknownPid(String),
}

/// Formula parse failures, raised when a definition is loaded
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormulaError {
    #[error("Unexpected character '{0}' at offset {1}")]
    UnexpectedChar(char, usize),

    #[error("Unknown variable '{0}' (allowed: A-F)")]
    UnknownVariable(String),

    #[error("Invalid numeric literal '{0}'")]
    InvalidNumber(String),

    #[error("Unexpected token at offset {0}")]
    UnexpectedToken(usize),

    #[error("Unexpected end of expression")]
    UnexpectedEnd,

    #[error("Formula is empty")]
    Empty,
}

/// Errors while building a PID registry
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistryError {
    #[error("Invalid PID code '{0}'")]
    InvalidCode(String),

    #[error("PID {0} is defined more than once")]
    Duplicate(String),

    #[error("PID {code}: expected_bytes must be 1..=6, got {got}")]
    ByteCount { code: String, got: usize },

    #[error("PID {code}: formula uses byte {var} but only {expected} bytes are expected")]
    VariableOutOfRange { code: String, var: char, expected: usize },

    #[error("PID {code}: min {min} is greater than max {max}")]
    InvertedRange { code: String, min: f64, max: f64 },

    #[error("PID {code}: {source}")]
    Formula {
        code: String,
        #[source]
        source: FormulaError,
    },
}

/// Errors that can occur during OBD-II communication
#[derive(Debug, Error)]
pub enum ObdError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Query attempted outside `Ready`/`Degraded`
    #[error("Supervisor is {0:?}, queries need a ready connection")]
    NotReady(ConnectionState),
}

impl ObdError {
    /// Whether the error should tear down the connection
    pub fn is_link_failure(&self) -> bool {
        match self {
            ObdError::Transport(e) => e.is_fatal(),
            ObdError::Handshake(_) => true,
            _ => false,
        }
    }

    /// The decode error, if this is a per-reading failure
    pub fn as_decode(&self) -> Option<&DecodeError> {
        match self {
            ObdError::Decode(e) => Some(e),
            _ => None,
        }
    }
}
