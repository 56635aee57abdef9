//! Logging setup and wire frame tracing
//!
//! The library logs through the `log` facade. Binaries call [`init`] to install
//! `env_logger` with millisecond timestamps; `RUST_LOG` still overrides the level.

use std::fmt;
use std::io::Write;
use std::net::SocketAddr;
use std::str::FromStr;

use log::{debug, log_enabled, Level};

use crate::error::ModbusError;
use crate::protocol::ProtocolVariant;

/// Log levels accepted on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// Error messages
    Error,
    /// Warning messages
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages, including hex dumps of every frame
    Debug,
    /// Everything
    Trace,
}

impl LogLevel {
    /// Convert log level to string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    pub fn to_level_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = ModbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(ModbusError::configuration(format!("Unknown log level '{}'", s))),
        }
    }
}

/// Install the process logger
///
/// Safe to call more than once; later calls are ignored.
pub fn init(level: LogLevel) {
    let _ = env_logger::Builder::new()
        .filter_level(level.to_level_filter())
        .parse_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {:<5} {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .try_init();
}

/// Direction of a logged frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Rx,
    Tx,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Rx => f.write_str("<-"),
            Direction::Tx => f.write_str("->"),
        }
    }
}

/// Hex-dump a wire frame at debug level
pub fn log_frame(direction: Direction, peer: SocketAddr, variant: ProtocolVariant, frame: &[u8]) {
    if !log_enabled!(Level::Debug) {
        return;
    }
    debug!(
        "[{}] {} {} ({} bytes): {}",
        variant,
        direction,
        peer,
        frame.len(),
        hex::encode_upper(frame)
    );
}

/// Short human-readable summary of a request PDU (or an exception response)
pub fn describe_pdu(pdu: &[u8]) -> String {
    let Some((&code, data)) = pdu.split_first() else {
        return "empty PDU".to_string();
    };
    if code & 0x80 != 0 {
        let exception = data.first().copied().unwrap_or(0);
        return format!("exception 0x{:02X} for function 0x{:02X}", exception, code & 0x7F);
    }
    match (code, data.len()) {
        (0x01..=0x06 | 0x0F | 0x10, 4..) => {
            let address = u16::from_be_bytes([data[0], data[1]]);
            let word = u16::from_be_bytes([data[2], data[3]]);
            format!("function 0x{:02X} address={} value/quantity={}", code, address, word)
        }
        _ => format!("function 0x{:02X} data={}", code, hex::encode(data)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parsing() {
        assert_eq!("debug".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("loud".parse::<LogLevel>().is_err());
        assert_eq!(LogLevel::default().to_level_filter(), log::LevelFilter::Info);
    }

    #[test]
    fn test_describe_pdu() {
        assert_eq!(
            describe_pdu(&[0x03, 0x00, 0x0A, 0x00, 0x02]),
            "function 0x03 address=10 value/quantity=2"
        );
        assert_eq!(describe_pdu(&[0x83, 0x02]), "exception 0x02 for function 0x03");
        assert_eq!(describe_pdu(&[0x03, 0x04, 0x00]), "function 0x03 data=0400");
        assert_eq!(describe_pdu(&[]), "empty PDU");
    }

    #[test]
    fn test_log_frame_both_directions() {
        crate::utils::init_test_logger();
        assert_eq!(Direction::Rx.to_string(), "<-");
        assert_eq!(Direction::Tx.to_string(), "->");

        let peer: SocketAddr = "127.0.0.1:1502".parse().unwrap();
        log_frame(Direction::Rx, peer, ProtocolVariant::RtuOverTcp, &[0x01, 0x03, 0xAB]);
        log_frame(Direction::Tx, peer, ProtocolVariant::ModbusTcp, &[]);
    }
}
