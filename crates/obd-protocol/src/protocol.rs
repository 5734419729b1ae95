//! OBD-II Bus Protocol Tags
//!
//! Used both to select the interpreter's bus protocol during the handshake
//! and to tag PID definitions with the protocol family they apply to.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Bus protocols understood by ELM327-class interpreters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObdProtocol {
    /// Automatic protocol detection
    #[default]
    Auto,
    /// SAE J1850 PWM (41.6 kbaud)
    J1850Pwm,
    /// SAE J1850 VPW (10.4 kbaud)
    J1850Vpw,
    /// ISO 9141-2 (10.4 kbaud, 5 baud init)
    Iso9141_2,
    /// ISO 14230-4 KWP (slow init)
    Iso14230_4Kwp,
    /// ISO 14230-4 KWP (fast init)
    Iso14230_4KwpFast,
    /// ISO 15765-4 CAN (11 bit ID, 500 kbaud)
    Iso15765_4Can11bit500,
    /// ISO 15765-4 CAN (29 bit ID, 500 kbaud)
    Iso15765_4Can29bit500,
    /// ISO 15765-4 CAN (11 bit ID, 250 kbaud)
    Iso15765_4Can11bit250,
    /// ISO 15765-4 CAN (29 bit ID, 250 kbaud)
    Iso15765_4Can29bit250,
}

impl ObdProtocol {
    /// Protocol number used by `ATSPn` / reported by `ATDPN`
    pub fn number(&self) -> u8 {
        match self {
            ObdProtocol::Auto => 0,
            ObdProtocol::J1850Pwm => 1,
            ObdProtocol::J1850Vpw => 2,
            ObdProtocol::Iso9141_2 => 3,
            ObdProtocol::Iso14230_4Kwp => 4,
            ObdProtocol::Iso14230_4KwpFast => 5,
            ObdProtocol::Iso15765_4Can11bit500 => 6,
            ObdProtocol::Iso15765_4Can29bit500 => 7,
            ObdProtocol::Iso15765_4Can11bit250 => 8,
            ObdProtocol::Iso15765_4Can29bit250 => 9,
        }
    }

    /// Parse an `ATDPN` answer; a leading `A` marks an auto-detected protocol
    pub fn from_number(raw: &str) -> Option<Self> {
        let digit = raw.trim().trim_start_matches('A');
        Some(match digit {
            "0" => ObdProtocol::Auto,
            "1" => ObdProtocol::J1850Pwm,
            "2" => ObdProtocol::J1850Vpw,
            "3" => ObdProtocol::Iso9141_2,
            "4" => ObdProtocol::Iso14230_4Kwp,
            "5" => ObdProtocol::Iso14230_4KwpFast,
            "6" => ObdProtocol::Iso15765_4Can11bit500,
            "7" => ObdProtocol::Iso15765_4Can29bit500,
            "8" => ObdProtocol::Iso15765_4Can11bit250,
            "9" => ObdProtocol::Iso15765_4Can29bit250,
            _ => return None,
        })
    }

    /// Get the ELM327 AT command selecting this protocol
    pub fn to_elm_command(&self) -> String {
        format!("ATSP{}", self.number())
    }

    /// Check if this is a CAN protocol
    pub fn is_can(&self) -> bool {
        matches!(
            self,
            ObdProtocol::Iso15765_4Can11bit500
                | ObdProtocol::Iso15765_4Can29bit500
                | ObdProtocol::Iso15765_4Can11bit250
                | ObdProtocol::Iso15765_4Can29bit250
        )
    }

    /// Whether a PID tagged with `self` may be polled on a bus running `active`
    pub fn applies_to(&self, active: ObdProtocol) -> bool {
        *self == ObdProtocol::Auto || active == ObdProtocol::Auto || *self == active
    }
}

impl fmt::Display for ObdProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
