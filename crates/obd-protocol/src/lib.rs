//! OBD-II Protocol Implementation
//!
//! Async communication with ELM327-compatible interpreters over TCP or
//! serial: framing, the PID registry and formula evaluator, response
//! decoding, the connection supervisor and an emulator that honours the
//! same [`PidSource`] contract. VIN and DTC decoding live here too.

mod client;
pub mod decoder;
pub mod dtc;
mod emulator;
mod error;
pub mod formula;
pub mod framer;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
mod pid;
mod protocol;
mod source;
pub mod transport;
pub mod vin;

pub use client::{ConnectionState, ObdClient, SupervisorConfig};
pub use dtc::{DtcCategory, DtcRecord, MilStatus};
pub use emulator::{Emulator, EmulatorConfig, EMULATOR_VIN};
pub use error::{DecodeError, FormulaError, HandshakeError, ObdError, RegistryError, TransportError};
pub use pid::{default_decimals, standard_specs, PidCode, PidDefinition, PidRegistry, PidSpec, Reading};
pub use protocol::ObdProtocol;
pub use source::PidSource;
pub use transport::{Transport, TransportConfig};
pub use vin::VinRecord;

/// OBD-II mode constants
pub mod mode {
    /// Current data
    pub const CURRENT_DATA: u8 = 0x01;
    /// Diagnostic trouble codes
    pub const READ_DTC: u8 = 0x03;
    /// Vehicle information
    pub const VEHICLE_INFO: u8 = 0x09;
    /// Added to the mode in positive responses (`01` -> `41`)
    pub const RESPONSE_OFFSET: u8 = 0x40;
}
