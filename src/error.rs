//! # Error Handling
//!
//! Every fallible operation in the crate returns [`ModbusResult`]. The error enum covers
//! three layers of the emulator:
//!
//! ## Register bank errors
//! - **Out of range**: an address span runs past the end of a bank. Never clamped.
//! - **State**: the bank was used before `init`, or `init` was called twice. Also
//!   raised when a server is started twice or stopped while not running.
//!
//! ## Lifecycle errors
//! - **Startup**: a server failed to bind or listen. Carries the server's name.
//! - **Shutdown**: a server failed to release its resources. Carries the server's name.
//! - **Shutdown errors**: every shutdown failure collected by a best-effort stop.
//!
//! ## Adapter errors
//! - **I/O**, **Connection** and **Timeout** for the network side.
//! - **Frame**, **CRC** and **Invalid function** for wire decoding.
//! - **Invalid data** for malformed values (bad coil encodings, byte count mismatches).
//! - **Configuration** and **Internal**.
//!
//! Adapters translate these into their own wire representation. The wire adapter uses
//! [`ModbusError::exception_code`]; REST and gRPC map the variants onto status codes.
//!
//! ```rust
//! use voltage_modbus_slave::{ModbusError, ModbusRegisterBank};
//!
//! let bank = ModbusRegisterBank::with_counts(10, 10, 10, 10).unwrap();
//! match bank.write_coils(8, &[true; 5]) {
//!     Err(err) if err.is_range_error() => println!("rejected: {}", err),
//!     other => panic!("unexpected: {:?}", other),
//! }
//! ```

use std::fmt;
use thiserror::Error;

/// Result type alias for all crate operations
pub type ModbusResult<T> = Result<T, ModbusError>;

/// One of the four addressable banks of the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bank {
    Coils,
    DiscreteInputs,
    HoldingRegisters,
    InputRegisters,
}

impl fmt::Display for Bank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Bank::Coils => "coils",
            Bank::DiscreteInputs => "discrete inputs",
            Bank::HoldingRegisters => "holding registers",
            Bank::InputRegisters => "input registers",
        };
        f.write_str(name)
    }
}

/// Modbus slave error types
#[derive(Error, Debug, Clone)]
pub enum ModbusError {
    /// Address span exceeds the fixed size of a bank
    ///
    /// `count` is the length of the requested span; a zero-length span is also
    /// rejected with this variant since it addresses no element.
    #[error("Address out of range: {bank} start={address}, count={count}, size={size}")]
    OutOfRange {
        bank: Bank,
        address: u16,
        count: usize,
        size: usize,
    },

    /// Operation invoked in the wrong state
    ///
    /// # Examples
    /// - Reading a register bank before `init`
    /// - Calling `init` a second time
    /// - Starting a server that is already running or was stopped
    #[error("State error: {message}")]
    State { message: String },

    /// A server failed to start
    #[error("Server '{server}' failed to start: {message}")]
    Startup { server: String, message: String },

    /// A server failed to stop cleanly
    #[error("Server '{server}' failed to stop: {message}")]
    Shutdown { server: String, message: String },

    /// Aggregate of every failure seen by a best-effort stop
    #[error("{} server(s) failed to stop: {}", .errors.len(), join_errors(.errors))]
    ShutdownErrors { errors: Vec<ModbusError> },

    /// I/O related errors (sockets, files)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Connection errors
    ///
    /// # Examples
    /// - Bind failure (address in use)
    /// - Connection refused because the server is at capacity
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Timeout errors
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Unsupported function code in a request
    #[error("Invalid function code: {code}")]
    InvalidFunction { code: u8 },

    /// Invalid data value
    ///
    /// # Examples
    /// - Coil value not 0x0000 or 0xFF00
    /// - Byte count that does not match the quantity
    /// - Register value above 0xFFFF coming from a JSON or gRPC client
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// CRC validation failure on an RTU frame
    #[error("CRC validation failed: expected={expected:04X}, actual={actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// Frame parsing errors
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Internal errors (poisoned locks, lost tasks)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

fn join_errors(errors: &[ModbusError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl ModbusError {
    /// Create an out-of-range error for a bank span
    pub fn out_of_range(bank: Bank, address: u16, count: usize, size: usize) -> Self {
        Self::OutOfRange {
            bank,
            address,
            count,
            size,
        }
    }

    /// Create a state error
    pub fn state<S: Into<String>>(message: S) -> Self {
        Self::State {
            message: message.into(),
        }
    }

    /// Create a startup error for the named server
    pub fn startup<N: Into<String>, S: Into<String>>(server: N, message: S) -> Self {
        Self::Startup {
            server: server.into(),
            message: message.into(),
        }
    }

    /// Create a shutdown error for the named server
    pub fn shutdown<N: Into<String>, S: Into<String>>(server: N, message: S) -> Self {
        Self::Shutdown {
            server: server.into(),
            message: message.into(),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create an invalid function error
    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    /// Create an invalid data error
    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }

    /// Create a CRC mismatch error
    pub fn crc_mismatch(expected: u16, actual: u16) -> Self {
        Self::CrcMismatch { expected, actual }
    }

    /// Create a frame error
    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if the error is an address range violation
    pub fn is_range_error(&self) -> bool {
        matches!(self, Self::OutOfRange { .. })
    }

    /// Check if the error is a state violation
    pub fn is_state_error(&self) -> bool {
        matches!(self, Self::State { .. })
    }

    /// Check if the error came from starting or stopping a server
    ///
    /// ```rust
    /// use voltage_modbus_slave::ModbusError;
    ///
    /// assert!(ModbusError::startup("rest", "address in use").is_lifecycle_error());
    /// assert!(!ModbusError::state("not initialized").is_lifecycle_error());
    /// ```
    pub fn is_lifecycle_error(&self) -> bool {
        matches!(
            self,
            Self::Startup { .. } | Self::Shutdown { .. } | Self::ShutdownErrors { .. }
        )
    }

    /// Check if the error was raised while decoding a wire frame
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidFunction { .. }
                | Self::Frame { .. }
                | Self::CrcMismatch { .. }
        )
    }

    /// Modbus exception code a wire adapter should answer with
    ///
    /// - 0x01 Illegal Function for unsupported function codes
    /// - 0x02 Illegal Data Address for range violations
    /// - 0x03 Illegal Data Value for malformed values and frames
    /// - 0x04 Server Device Failure for everything else
    pub fn exception_code(&self) -> u8 {
        match self {
            Self::InvalidFunction { .. } => 0x01,
            Self::OutOfRange { .. } => 0x02,
            Self::InvalidData { .. } | Self::Frame { .. } => 0x03,
            _ => 0x04,
        }
    }
}

/// Convert from std::io::Error
impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

/// Convert from serde JSON errors
impl From<serde_json::Error> for ModbusError {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_data(format!("JSON error: {}", err))
    }
}

/// Convert from serde YAML errors
impl From<serde_yaml::Error> for ModbusError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::configuration(format!("YAML error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = ModbusError::out_of_range(Bank::Coils, 8, 5, 10);
        assert!(err.is_range_error());
        assert!(!err.is_state_error());
        assert_eq!(err.exception_code(), 0x02);

        let err = ModbusError::state("bank not initialized");
        assert!(err.is_state_error());
        assert_eq!(err.exception_code(), 0x04);

        assert_eq!(ModbusError::invalid_function(0x2B).exception_code(), 0x01);
        assert_eq!(ModbusError::invalid_data("bad coil").exception_code(), 0x03);
        assert!(ModbusError::crc_mismatch(1, 2).is_protocol_error());
    }

    #[test]
    fn test_error_display() {
        let err = ModbusError::out_of_range(Bank::HoldingRegisters, 8, 5, 10);
        let msg = format!("{}", err);
        assert!(msg.contains("holding registers"));
        assert!(msg.contains("start=8"));
        assert!(msg.contains("size=10"));

        let err = ModbusError::crc_mismatch(0x1234, 0x5678);
        let msg = format!("{}", err);
        assert!(msg.contains("CRC validation failed"));
        assert!(msg.contains("1234"));
        assert!(msg.contains("5678"));
    }

    #[test]
    fn test_shutdown_errors_aggregate() {
        let err = ModbusError::ShutdownErrors {
            errors: vec![
                ModbusError::shutdown("modbus-tcp", "task panicked"),
                ModbusError::shutdown("grpc", "listener lost"),
            ],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("2 server(s) failed to stop"));
        assert!(msg.contains("'modbus-tcp'"));
        assert!(msg.contains("'grpc'"));
        assert!(err.is_lifecycle_error());
    }
}
