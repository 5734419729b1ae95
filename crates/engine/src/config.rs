//! Engine Configuration

use crate::EngineError;
use config::{Config, Environment, File};
use obd_protocol::{EmulatorConfig, PidRegistry, PidSpec, SupervisorConfig, TransportConfig};
use obd_scheduler::{AcquisitionConfig, HeartbeatConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use storage::LoggerConfig;
use tracing::debug;

/// Configuration file looked up when none is named
pub const DEFAULT_CONFIG_NAME: &str = "obd-engine";

/// Prefix of environment overrides (`OBD_TRANSPORT__HOST`)
pub const ENV_PREFIX: &str = "OBD";

/// Where readings come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineMode {
    /// An ELM327 adapter over the configured transport
    #[default]
    Real,
    /// The built-in synthetic ECU
    Emulator,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub mode: EngineMode,
    pub transport: TransportConfig,
    pub supervisor: SupervisorConfig,
    pub acquisition: AcquisitionConfig,
    pub heartbeat: HeartbeatConfig,
    pub logger: LoggerConfig,
    pub emulator: EmulatorConfig,
    /// Extra or replacement PID definitions
    pub pids: Vec<PidSpec>,
    pub log_level: String,
    pub log_json: bool,
    /// Prometheus listener; metrics are not exported when unset
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: EngineMode::default(),
            transport: TransportConfig::default(),
            supervisor: SupervisorConfig::default(),
            acquisition: AcquisitionConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            logger: LoggerConfig::default(),
            emulator: EmulatorConfig::default(),
            pids: Vec::new(),
            log_level: "info".to_string(),
            log_json: false,
            metrics_addr: None,
        }
    }
}

impl EngineConfig {
    /// Load from an optional file, then apply `OBD_*` environment overrides
    pub fn load(path: Option<&str>) -> Result<Self, EngineError> {
        let (name, required) = match path {
            Some(path) => (path, true),
            None => (DEFAULT_CONFIG_NAME, false),
        };
        debug!("Loading configuration from {}", name);

        let config = Config::builder()
            .add_source(File::with_name(name).required(required))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(config.try_deserialize()?)
    }

    /// The standard PID table with the configured definitions merged over it
    pub fn registry(&self) -> Result<PidRegistry, EngineError> {
        if self.pids.is_empty() {
            return Ok(PidRegistry::standard());
        }
        Ok(PidRegistry::with_overrides(&self.pids)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_protocol::PidCode;
    use std::io::Write;

    fn write_config(dir: &tempfile::TempDir, body: &str) -> String {
        let path = dir.path().join("engine.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_missing_default_file_gives_defaults() {
        let config = EngineConfig::load(None).unwrap();
        assert_eq!(config.mode, EngineMode::Real);
        assert_eq!(config.supervisor.max_retries, 3);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_named_file_must_exist() {
        assert!(matches!(
            EngineConfig::load(Some("/nonexistent/obd-engine.toml")),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn test_file_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
mode = "emulator"
metrics_addr = "127.0.0.1:9000"

[transport]
kind = "serial"
path = "/dev/ttyUSB0"

[supervisor]
timeout_ms = 1500

[acquisition]
pids = ["010C", "010D"]
poll_interval_ms = 50

[emulator]
seed = 42

[[pids]]
code = "2201"
name = "Custom gauge"
unit = "%"
formula = "A*100/255"
expected_bytes = 1
"#,
        );
        let config = EngineConfig::load(Some(&path)).unwrap();

        assert_eq!(config.mode, EngineMode::Emulator);
        assert_eq!(
            config.transport,
            TransportConfig::Serial {
                path: "/dev/ttyUSB0".to_string(),
                baud_rate: 38400,
            }
        );
        assert_eq!(config.supervisor.timeout_ms, 1500);
        assert_eq!(config.supervisor.max_retries, 3);
        assert_eq!(
            config.acquisition.pids,
            vec![PidCode::current(0x0C), PidCode::current(0x0D)]
        );
        assert_eq!(config.emulator.seed, Some(42));
        assert_eq!(config.metrics_addr, Some("127.0.0.1:9000".parse().unwrap()));

        let registry = config.registry().unwrap();
        assert!(registry.contains(&PidCode::new(0x22, 0x01)));
        assert!(registry.contains(&PidCode::current(0x0C)));
    }

    #[test]
    fn test_bad_formula_rejected_at_load() {
        let config = EngineConfig {
            pids: vec![PidSpec {
                code: "2202".to_string(),
                name: "Broken".to_string(),
                unit: String::new(),
                formula: "A % 3".to_string(),
                expected_bytes: 1,
                min: None,
                max: None,
                protocol: Default::default(),
                smoothed: false,
                decimals: None,
            }],
            ..EngineConfig::default()
        };
        assert!(matches!(config.registry(), Err(EngineError::Registry(_))));
    }
}
