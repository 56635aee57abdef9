//! Emulator configuration
//!
//! Defaults match the command line defaults of `mb_server`. A YAML file may set any
//! subset of the fields; missing ones keep their default.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::error::{ModbusError, ModbusResult};
use crate::lifecycle::LifecyclePolicy;
use crate::protocol::ProtocolVariant;
use crate::register_bank::{BankSizes, MAX_BANK_SIZE};

/// Full emulator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    /// Modbus wire port
    pub port: u16,
    pub rest_port: u16,
    pub grpc_port: u16,
    pub protocol: ProtocolVariant,
    pub coils: usize,
    pub discrete_inputs: usize,
    pub holding_registers: usize,
    pub input_registers: usize,
    pub max_connections: usize,
    pub request_timeout_secs: u64,
    pub rollback_on_start_failure: bool,
    pub best_effort_stop: bool,
    /// Randomize input registers and discrete inputs at this interval
    pub simulate_interval_ms: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: crate::DEFAULT_TCP_PORT,
            rest_port: 8000,
            grpc_port: 9000,
            protocol: ProtocolVariant::default(),
            coils: 65535,
            discrete_inputs: 65535,
            holding_registers: 65535,
            input_registers: 65535,
            max_connections: 100,
            request_timeout_secs: 30,
            rollback_on_start_failure: false,
            best_effort_stop: false,
            simulate_interval_ms: None,
        }
    }
}

impl ServerConfig {
    /// Load from a YAML file
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> ModbusResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ModbusError::configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> ModbusResult<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Reject configurations that cannot start
    pub fn validate(&self) -> ModbusResult<()> {
        let banks = [
            ("coils", self.coils),
            ("discrete_inputs", self.discrete_inputs),
            ("holding_registers", self.holding_registers),
            ("input_registers", self.input_registers),
        ];
        for (name, count) in banks {
            if count > MAX_BANK_SIZE {
                return Err(ModbusError::configuration(format!(
                    "{} = {} exceeds {}",
                    name, count, MAX_BANK_SIZE
                )));
            }
        }

        let ports = [
            ("port", self.port),
            ("rest_port", self.rest_port),
            ("grpc_port", self.grpc_port),
        ];
        for (i, (name, port)) in ports.iter().enumerate() {
            if *port == 0 {
                return Err(ModbusError::configuration(format!("{} must not be 0", name)));
            }
            if let Some((other, _)) = ports[..i].iter().find(|(_, p)| p == port) {
                return Err(ModbusError::configuration(format!(
                    "{} and {} both use port {}",
                    other, name, port
                )));
            }
        }

        if !(1..=Semaphore::MAX_PERMITS).contains(&self.max_connections) {
            return Err(ModbusError::configuration(format!(
                "max_connections must be between 1 and {}",
                Semaphore::MAX_PERMITS
            )));
        }
        if self.simulate_interval_ms == Some(0) {
            return Err(ModbusError::configuration("simulate_interval_ms must be at least 1"));
        }
        Ok(())
    }

    pub fn bank_sizes(&self) -> BankSizes {
        BankSizes::new(
            self.coils,
            self.discrete_inputs,
            self.holding_registers,
            self.input_registers,
        )
    }

    pub fn policy(&self) -> LifecyclePolicy {
        LifecyclePolicy {
            rollback_on_start_failure: self.rollback_on_start_failure,
            best_effort_stop: self.best_effort_stop,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn modbus_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn rest_address(&self) -> String {
        format!("{}:{}", self.host, self.rest_port)
    }

    pub fn grpc_address(&self) -> String {
        format!("{}:{}", self.host, self.grpc_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.modbus_address(), "localhost:502");
        assert_eq!(config.rest_address(), "localhost:8000");
        assert_eq!(config.grpc_address(), "localhost:9000");
        assert_eq!(config.protocol, ProtocolVariant::RtuOverTcp);
        assert_eq!(config.bank_sizes(), BankSizes::new(65535, 65535, 65535, 65535));
        assert_eq!(config.policy(), LifecyclePolicy::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml() {
        let config = ServerConfig::from_yaml_str(
            "port: 1502\nprotocol: ModbusTCP\nholding_registers: 100\nbest_effort_stop: true\n",
        )
        .unwrap();
        assert_eq!(config.port, 1502);
        assert_eq!(config.protocol, ProtocolVariant::ModbusTcp);
        assert_eq!(config.holding_registers, 100);
        assert_eq!(config.coils, 65535);
        assert!(config.policy().best_effort_stop);
        assert!(!config.policy().rollback_on_start_failure);

        let err = ServerConfig::from_yaml_str("port: [1]").unwrap_err();
        assert!(matches!(err, ModbusError::Configuration { .. }));
    }

    #[test]
    fn test_validation() {
        let config = ServerConfig {
            coils: MAX_BANK_SIZE + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ServerConfig {
            rest_port: 502,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("port and rest_port"));

        let config = ServerConfig {
            grpc_port: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ServerConfig {
            coils: MAX_BANK_SIZE,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_connection_limit_bounds() {
        let config = ServerConfig {
            max_connections: Semaphore::MAX_PERMITS + 1,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_connections"));

        let config = ServerConfig {
            max_connections: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ServerConfig {
            max_connections: Semaphore::MAX_PERMITS,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}
