//! OBD-II PID Definitions and Registry
//!
//! A [`PidRegistry`] maps mode+PID codes to their decoding rules. It is built
//! once at startup (standard table plus any configured overrides) and then
//! shared read-only behind an `Arc`.

use crate::error::{FormulaError, RegistryError};
use crate::formula::{Formula, VARIABLES};
use crate::protocol::ObdProtocol;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Mode + PID pair, written as four hex digits (`010C`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PidCode {
    pub mode: u8,
    pub pid: u8,
}

impl PidCode {
    pub const fn new(mode: u8, pid: u8) -> Self {
        Self { mode, pid }
    }

    /// The mode-01 code for `pid`
    pub const fn current(pid: u8) -> Self {
        Self::new(crate::mode::CURRENT_DATA, pid)
    }

    /// Wire command for this query, e.g. `010C`
    pub fn command(&self) -> String {
        self.to_string()
    }

    /// First two bytes of a positive response: `mode + 0x40`, then the PID
    pub fn ack_prefix(&self) -> [u8; 2] {
        [self.mode.wrapping_add(crate::mode::RESPONSE_OFFSET), self.pid]
    }
}

impl fmt::Display for PidCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}{:02X}", self.mode, self.pid)
    }
}

impl FromStr for PidCode {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let compact: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        if compact.len() != 4 || !compact.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(RegistryError::InvalidCode(s.to_string()));
        }
        let mode = u8::from_str_radix(&compact[..2], 16)
            .map_err(|_| RegistryError::InvalidCode(s.to_string()))?;
        let pid = u8::from_str_radix(&compact[2..], 16)
            .map_err(|_| RegistryError::InvalidCode(s.to_string()))?;
        Ok(Self { mode, pid })
    }
}

impl TryFrom<String> for PidCode {
    type Error = RegistryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PidCode> for String {
    fn from(code: PidCode) -> Self {
        code.to_string()
    }
}

/// Decoding rules for one PID
#[derive(Debug, Clone, PartialEq)]
pub struct PidDefinition {
    pub code: PidCode,
    pub name: String,
    pub unit: String,
    pub formula: Formula,
    /// Data bytes following the two-byte acknowledgement
    pub expected_bytes: usize,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub protocol: ObdProtocol,
    /// Continuously-varying signal eligible for moving-average smoothing
    pub smoothed: bool,
    /// Decimal places kept in published values
    pub decimals: u8,
}

impl PidDefinition {
    /// Round a measured value to this PID's display precision
    pub fn round(&self, value: f64) -> f64 {
        let factor = 10f64.powi(i32::from(self.decimals));
        (value * factor).round() / factor
    }

    /// Whether `value` lies inside the declared range
    pub fn contains(&self, value: f64) -> bool {
        self.min.map_or(true, |min| value >= min) && self.max.map_or(true, |max| value <= max)
    }
}

/// Default display precision for a unit: integral for counts and RPM
pub fn default_decimals(unit: &str) -> u8 {
    match unit.trim().to_ascii_lowercase().as_str() {
        "rpm" | "count" | "" => 0,
        _ => 2,
    }
}

/// Serializable description of a PID, as found in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PidSpec {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub unit: String,
    pub formula: String,
    pub expected_bytes: usize,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub protocol: ObdProtocol,
    #[serde(default = "default_smoothed")]
    pub smoothed: bool,
    #[serde(default)]
    pub decimals: Option<u8>,
}

fn default_smoothed() -> bool {
    true
}

impl PidSpec {
    /// Validate and compile into a definition
    pub fn compile(&self) -> Result<PidDefinition, RegistryError> {
        let code: PidCode = self.code.parse()?;
        let code_str = code.to_string();

        if !(1..=VARIABLES.len()).contains(&self.expected_bytes) {
            return Err(RegistryError::ByteCount {
                code: code_str,
                got: self.expected_bytes,
            });
        }

        let formula = Formula::parse(&self.formula).map_err(|source: FormulaError| {
            RegistryError::Formula {
                code: code_str.clone(),
                source,
            }
        })?;

        let used = formula.bytes_used();
        if used > self.expected_bytes {
            return Err(RegistryError::VariableOutOfRange {
                code: code_str,
                var: VARIABLES[used - 1],
                expected: self.expected_bytes,
            });
        }

        if let (Some(min), Some(max)) = (self.min, self.max) {
            if min > max {
                return Err(RegistryError::InvertedRange {
                    code: code_str,
                    min,
                    max,
                });
            }
        }

        Ok(PidDefinition {
            code,
            name: self.name.clone(),
            unit: self.unit.clone(),
            formula,
            expected_bytes: self.expected_bytes,
            min: self.min,
            max: self.max,
            protocol: self.protocol,
            smoothed: self.smoothed,
            decimals: self.decimals.unwrap_or_else(|| default_decimals(&self.unit)),
        })
    }
}

/// (code, name, unit, formula, bytes, min, max, smoothed)
type StandardRow = (&'static str, &'static str, &'static str, &'static str, usize, f64, f64, bool);

/// Standard mode-01 PIDs shipped with the engine
const STANDARD_PIDS: &[StandardRow] = &[
    ("0104", "Calculated engine load", "%", "A*100/255", 1, 0.0, 100.0, true),
    ("0105", "Engine coolant temperature", "°C", "A-40", 1, -40.0, 215.0, true),
    ("0106", "Short term fuel trim bank 1", "%", "(A-128)*100/128", 1, -100.0, 99.22, true),
    ("0107", "Long term fuel trim bank 1", "%", "(A-128)*100/128", 1, -100.0, 99.22, true),
    ("0108", "Short term fuel trim bank 2", "%", "(A-128)*100/128", 1, -100.0, 99.22, true),
    ("0109", "Long term fuel trim bank 2", "%", "(A-128)*100/128", 1, -100.0, 99.22, true),
    ("010A", "Fuel pressure", "kPa", "A*3", 1, 0.0, 765.0, true),
    ("010B", "Intake manifold absolute pressure", "kPa", "A", 1, 0.0, 255.0, true),
    ("010C", "Engine speed", "rpm", "((A*256)+B)/4", 2, 0.0, 8000.0, true),
    ("010D", "Vehicle speed", "km/h", "A", 1, 0.0, 255.0, true),
    ("010E", "Timing advance", "°", "(A/2)-64", 1, -64.0, 63.5, true),
    ("010F", "Intake air temperature", "°C", "A-40", 1, -40.0, 215.0, true),
    ("0110", "Mass air flow rate", "g/s", "((A*256)+B)/100", 2, 0.0, 655.35, true),
    ("0111", "Throttle position", "%", "A*100/255", 1, 0.0, 100.0, true),
    ("011F", "Run time since engine start", "s", "(A*256)+B", 2, 0.0, 65535.0, false),
    ("0121", "Distance traveled with MIL on", "km", "(A*256)+B", 2, 0.0, 65535.0, false),
    ("012F", "Fuel tank level", "%", "A*100/255", 1, 0.0, 100.0, true),
    ("0130", "Warm-ups since codes cleared", "count", "A", 1, 0.0, 255.0, false),
    ("0131", "Distance since codes cleared", "km", "(A*256)+B", 2, 0.0, 65535.0, false),
    ("0133", "Barometric pressure", "kPa", "A", 1, 0.0, 255.0, true),
    ("0142", "Control module voltage", "V", "((A*256)+B)/1000", 2, 0.0, 65.535, true),
    ("0146", "Ambient air temperature", "°C", "A-40", 1, -40.0, 215.0, true),
    ("015C", "Engine oil temperature", "°C", "A-40", 1, -40.0, 210.0, true),
    ("015E", "Engine fuel rate", "L/h", "((A*256)+B)/20", 2, 0.0, 3276.75, true),
];

/// The standard PID table as configuration specs
pub fn standard_specs() -> Vec<PidSpec> {
    STANDARD_PIDS
        .iter()
        .map(|(code, name, unit, formula, bytes, min, max, smoothed)| PidSpec {
            code: code.to_string(),
            name: name.to_string(),
            unit: unit.to_string(),
            formula: formula.to_string(),
            expected_bytes: *bytes,
            min: Some(*min),
            max: Some(*max),
            protocol: ObdProtocol::Auto,
            smoothed: *smoothed,
            decimals: None,
        })
        .collect()
}

/// Immutable lookup table of PID definitions
#[derive(Debug, Clone, Default)]
pub struct PidRegistry {
    definitions: HashMap<PidCode, PidDefinition>,
}

impl PidRegistry {
    /// Build from specs; a code may appear only once
    pub fn from_specs(specs: &[PidSpec]) -> Result<Self, RegistryError> {
        let mut definitions = HashMap::with_capacity(specs.len());
        for spec in specs {
            let definition = spec.compile()?;
            let code = definition.code;
            if definitions.insert(code, definition).is_some() {
                return Err(RegistryError::Duplicate(code.to_string()));
            }
        }
        Ok(Self { definitions })
    }

    /// Registry holding the standard mode-01 table
    pub fn standard() -> Self {
        // rows are checked by test_standard_table_compiles
        Self::from_specs(&standard_specs()).expect("built-in PID table must compile")
    }

    /// Standard table with `overrides` replacing or extending entries
    pub fn with_overrides(overrides: &[PidSpec]) -> Result<Self, RegistryError> {
        let mut registry = Self::standard();
        let extra = Self::from_specs(overrides)?;
        registry.definitions.extend(extra.definitions);
        Ok(registry)
    }

    pub fn get(&self, code: &PidCode) -> Option<&PidDefinition> {
        self.definitions.get(code)
    }

    pub fn contains(&self, code: &PidCode) -> bool {
        self.definitions.contains_key(code)
    }

    /// All codes in ascending order
    pub fn codes(&self) -> Vec<PidCode> {
        let mut codes: Vec<_> = self.definitions.keys().copied().collect();
        codes.sort();
        codes
    }

    pub fn iter(&self) -> impl Iterator<Item = &PidDefinition> {
        self.definitions.values()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

/// One decoded value for one PID
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// The PID that was queried
    pub pid: PidCode,
    /// Data bytes after the acknowledgement prefix
    pub raw_bytes: Vec<u8>,
    /// Published value, rounded to the PID's precision
    pub value: f64,
    pub unit: String,
    /// When the response was decoded
    pub timestamp: DateTime<Utc>,
    /// False when the value fell outside the declared range
    pub in_range: bool,
    /// Unrounded formula output
    #[serde(skip)]
    pub measured: f64,
}

impl Reading {
    /// Build a reading from a measured value
    pub fn new(definition: &PidDefinition, raw_bytes: Vec<u8>, measured: f64) -> Self {
        Self {
            pid: definition.code,
            raw_bytes,
            value: definition.round(measured),
            unit: definition.unit.clone(),
            timestamp: Utc::now(),
            in_range: definition.contains(measured),
            measured,
        }
    }

    /// Replace the published value (e.g. with a smoothed one)
    pub fn with_value(mut self, definition: &PidDefinition, value: f64) -> Self {
        self.value = definition.round(value);
        self.in_range = definition.contains(value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_table_compiles() {
        let registry = PidRegistry::from_specs(&standard_specs()).unwrap();
        assert_eq!(registry.len(), STANDARD_PIDS.len());
        assert!(registry.contains(&PidCode::current(0x0C)));
    }

    #[test]
    fn test_code_parsing() {
        let code: PidCode = "010c".parse().unwrap();
        assert_eq!(code, PidCode::new(0x01, 0x0C));
        assert_eq!(code.to_string(), "010C");
        assert_eq!(code.ack_prefix(), [0x41, 0x0C]);
        assert!("01G0".parse::<PidCode>().is_err());
        assert!("010".parse::<PidCode>().is_err());
    }

    #[test]
    fn test_rpm_rounds_to_integer() {
        let registry = PidRegistry::standard();
        let rpm = registry.get(&PidCode::current(0x0C)).unwrap();
        let measured = rpm.formula.evaluate(&[0x1A, 0x2B]).unwrap();
        assert!((measured - 1674.75).abs() < 1e-9);
        assert_eq!(rpm.round(measured), 1675.0);
        assert_eq!(rpm.round(1707.75), 1708.0);
    }

    #[test]
    fn test_fractional_units_keep_two_decimals() {
        let registry = PidRegistry::standard();
        let load = registry.get(&PidCode::current(0x04)).unwrap();
        let measured = load.formula.evaluate(&[0x80]).unwrap();
        assert_eq!(load.round(measured), 50.2);
    }

    #[test]
    fn test_duplicate_codes_rejected() {
        let mut specs = standard_specs();
        specs.push(specs[0].clone());
        assert!(matches!(
            PidRegistry::from_specs(&specs),
            Err(RegistryError::Duplicate(_))
        ));
    }

    #[test]
    fn test_formula_must_fit_byte_count() {
        let spec = PidSpec {
            code: "01FF".into(),
            name: "Broken".into(),
            unit: "".into(),
            formula: "A+B".into(),
            expected_bytes: 1,
            min: None,
            max: None,
            protocol: ObdProtocol::Auto,
            smoothed: false,
            decimals: None,
        };
        assert!(matches!(
            spec.compile(),
            Err(RegistryError::VariableOutOfRange { var: 'B', .. })
        ));
    }

    #[test]
    fn test_overrides_replace_standard_entry() {
        let mut spec = standard_specs().remove(0);
        spec.name = "Load (custom)".into();
        let registry = PidRegistry::with_overrides(&[spec]).unwrap();
        assert_eq!(registry.len(), STANDARD_PIDS.len());
        assert_eq!(
            registry.get(&PidCode::current(0x04)).unwrap().name,
            "Load (custom)"
        );
    }

    #[test]
    fn test_out_of_range_reading_is_kept_and_flagged() {
        let registry = PidRegistry::standard();
        let rpm = registry.get(&PidCode::current(0x0C)).unwrap();
        let reading = Reading::new(rpm, vec![0xFF, 0xFF], 16383.75);
        assert!(!reading.in_range);
        assert_eq!(reading.value, 16384.0);
    }
}
