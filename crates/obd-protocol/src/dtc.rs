//! Diagnostic Trouble Code Decoding

use crate::error::DecodeError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// DTC system category, from the top two bits of the first hex digit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DtcCategory {
    Powertrain,
    Chassis,
    Body,
    Network,
}

impl DtcCategory {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => DtcCategory::Powertrain,
            1 => DtcCategory::Chassis,
            2 => DtcCategory::Body,
            _ => DtcCategory::Network,
        }
    }

    pub fn letter(&self) -> char {
        match self {
            DtcCategory::Powertrain => 'P',
            DtcCategory::Chassis => 'C',
            DtcCategory::Body => 'B',
            DtcCategory::Network => 'U',
        }
    }

    fn from_letter(letter: char) -> Option<Self> {
        match letter {
            'P' => Some(DtcCategory::Powertrain),
            'C' => Some(DtcCategory::Chassis),
            'B' => Some(DtcCategory::Body),
            'U' => Some(DtcCategory::Network),
            _ => None,
        }
    }
}

/// A decoded trouble code
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DtcRecord {
    /// Standard form, e.g. `P0300`
    pub code: String,
    /// The four hex digits as received
    pub raw_hex: String,
    /// MIL state reported alongside the code
    pub mil_active: bool,
}

impl DtcRecord {
    pub fn category(&self) -> Option<DtcCategory> {
        self.code.chars().next().and_then(DtcCategory::from_letter)
    }

    /// Known description, or a generic one for the category
    pub fn description(&self) -> &'static str {
        describe(&self.code)
            .or_else(|| self.category().map(category_description))
            .unwrap_or("Unknown trouble code")
    }
}

impl fmt::Display for DtcRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.description())
    }
}

/// MIL state and stored-code count from mode 01 PID 01 byte A
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MilStatus {
    pub mil_active: bool,
    /// 0..=127
    pub active_count: u8,
}

/// Decode 4 hex digits; `Ok(None)` for the all-zero padding code
pub fn decode(code_hex: &str, mil_active: bool) -> Result<Option<DtcRecord>, DecodeError> {
    let hex = code_hex.trim().to_ascii_uppercase();
    if hex.len() != 4 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(DecodeError::Malformed(format!(
            "DTC must be 4 hex digits, got '{}'",
            code_hex
        )));
    }
    if hex == "0000" {
        return Ok(None);
    }

    let first = u8::from_str_radix(&hex[..1], 16)
        .map_err(|_| DecodeError::Malformed(code_hex.to_string()))?;
    let category = DtcCategory::from_bits(first >> 2);
    let code = format!("{}{}{}", category.letter(), first & 0b11, &hex[1..]);

    Ok(Some(DtcRecord {
        code,
        raw_hex: hex,
        mil_active,
    }))
}

/// Inverse of [`decode`]: `P0133` -> `0133`
pub fn encode(code: &str) -> Option<String> {
    let code = code.trim().to_ascii_uppercase();
    let mut chars = code.chars();
    let category = DtcCategory::from_letter(chars.next()?)?;
    let second = chars.next()?.to_digit(4)? as u8;
    let rest: String = chars.collect();
    if rest.len() != 3 || !rest.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let bits = match category {
        DtcCategory::Powertrain => 0,
        DtcCategory::Chassis => 1,
        DtcCategory::Body => 2,
        DtcCategory::Network => 3,
    };
    Some(format!("{:X}{}", (bits << 2) | second, rest))
}

/// Split the MIL status byte: bit 7 is the lamp, bits 0..6 the code count
pub fn decode_mil_status(byte: u8) -> MilStatus {
    MilStatus {
        mil_active: byte & 0x80 != 0,
        active_count: byte & 0x7F,
    }
}

fn category_description(category: DtcCategory) -> &'static str {
    match category {
        DtcCategory::Powertrain => "Powertrain fault (engine/transmission)",
        DtcCategory::Chassis => "Chassis fault (brakes/steering/suspension)",
        DtcCategory::Body => "Body fault (airbags/climate/lighting)",
        DtcCategory::Network => "Network communication fault",
    }
}

/// Generic SAE descriptions for frequently seen codes
fn describe(code: &str) -> Option<&'static str> {
    Some(match code {
        "P0100" => "Mass or Volume Air Flow Circuit Malfunction",
        "P0101" => "Mass or Volume Air Flow Circuit Range/Performance",
        "P0110" => "Intake Air Temperature Circuit Malfunction",
        "P0115" => "Engine Coolant Temperature Circuit Malfunction",
        "P0120" => "Throttle Position Sensor Circuit Malfunction",
        "P0128" => "Coolant Thermostat Below Regulating Temperature",
        "P0130" => "O2 Sensor Circuit Malfunction (Bank 1 Sensor 1)",
        "P0133" => "O2 Sensor Circuit Slow Response (Bank 1 Sensor 1)",
        "P0171" => "System Too Lean (Bank 1)",
        "P0172" => "System Too Rich (Bank 1)",
        "P0174" => "System Too Lean (Bank 2)",
        "P0175" => "System Too Rich (Bank 2)",
        "P0300" => "Random/Multiple Cylinder Misfire Detected",
        "P0301" => "Cylinder 1 Misfire Detected",
        "P0302" => "Cylinder 2 Misfire Detected",
        "P0303" => "Cylinder 3 Misfire Detected",
        "P0304" => "Cylinder 4 Misfire Detected",
        "P0325" => "Knock Sensor 1 Circuit Malfunction",
        "P0335" => "Crankshaft Position Sensor A Circuit Malfunction",
        "P0340" => "Camshaft Position Sensor Circuit Malfunction",
        "P0401" => "Exhaust Gas Recirculation Flow Insufficient",
        "P0420" => "Catalyst System Efficiency Below Threshold (Bank 1)",
        "P0430" => "Catalyst System Efficiency Below Threshold (Bank 2)",
        "P0440" => "Evaporative Emission Control System Malfunction",
        "P0442" => "Evaporative Emission Control System Leak Detected (small leak)",
        "P0455" => "Evaporative Emission Control System Leak Detected (large leak)",
        "P0500" => "Vehicle Speed Sensor Malfunction",
        "P0505" => "Idle Control System Malfunction",
        "P0562" => "System Voltage Low",
        "P0700" => "Transmission Control System Malfunction",
        "U0100" => "Lost Communication With ECM/PCM A",
        "U0121" => "Lost Communication With Anti-Lock Brake System Module",
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(hex: &str) -> String {
        decode(hex, false).unwrap().unwrap().code
    }

    #[test]
    fn test_powertrain_code() {
        assert_eq!(code("0133"), "P0133");
    }

    #[test]
    fn test_category_and_second_digit() {
        // 0x4 = 0b0100: category C, second digit 0
        assert_eq!(code("4200"), "C0200");
        assert_eq!(code("5200"), "C1200");
        assert_eq!(code("C100"), "U0100");
        assert_eq!(code("9234"), "B1234");
        assert_eq!(code("3FFF"), "P3FFF");
    }

    #[test]
    fn test_zero_code_is_filtered() {
        assert_eq!(decode("0000", true).unwrap(), None);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(decode("013", false).is_err());
        assert!(decode("01G3", false).is_err());
    }

    #[test]
    fn test_encode_standard_form() {
        assert_eq!(encode("P0133").as_deref(), Some("0133"));
        assert_eq!(encode("u0100").as_deref(), Some("C100"));
        assert_eq!(encode("B1234").as_deref(), Some("9234"));
        assert_eq!(encode("P4133"), None);
        assert_eq!(encode("X0133"), None);
    }

    #[test]
    fn test_mil_status() {
        assert_eq!(
            decode_mil_status(0x82),
            MilStatus {
                mil_active: true,
                active_count: 2
            }
        );
        assert_eq!(
            decode_mil_status(0x7F),
            MilStatus {
                mil_active: false,
                active_count: 127
            }
        );
    }

    #[test]
    fn test_descriptions() {
        let known = decode("0300", true).unwrap().unwrap();
        assert_eq!(known.description(), "Random/Multiple Cylinder Misfire Detected");
        assert!(known.mil_active);

        let unknown = decode("9234", false).unwrap().unwrap();
        assert_eq!(unknown.category(), Some(DtcCategory::Body));
        assert!(unknown.description().starts_with("Body fault"));
    }
}
