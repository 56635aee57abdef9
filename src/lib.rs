//! # Voltage Modbus Slave - Multi-Protocol Modbus Device Emulator
//!
//! **Author:** Evan Liu <evan.liu@voltageenergy.com>
//! **License:** MIT
//!
//! An emulated Modbus slave: one in-memory address space served concurrently over
//! several network front-ends, started and stopped as a unit.
//!
//! ## Features
//!
//! - **🗄️ Address Space**: Four fixed-size banks (coils, discrete inputs, holding
//!   registers, input registers) with strict range checks and all-or-nothing writes
//! - **🔌 Wire Protocol**: Modbus TCP (MBAP) or Modbus RTU framing over TCP
//! - **🌐 REST**: JSON over HTTP with axum
//! - **🛰️ gRPC**: tonic service, behind the `grpc` feature
//! - **🔄 Ordered Lifecycle**: Fail-fast start, signal-driven stop that never races startup
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Server |
//! |------|----------|--------|
//! | 0x01 | Read Coils | ✅ |
//! | 0x02 | Read Discrete Inputs | ✅ |
//! | 0x03 | Read Holding Registers | ✅ |
//! | 0x04 | Read Input Registers | ✅ |
//! | 0x05 | Write Single Coil | ✅ |
//! | 0x06 | Write Single Register | ✅ |
//! | 0x0F | Write Multiple Coils | ✅ |
//! | 0x10 | Write Multiple Registers | ✅ |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use voltage_modbus_slave::{
//!     lifecycle::shutdown_signal, LifecyclePolicy, ModbusRegisterBank, ModbusServer,
//!     ModbusTcpServer, ProtocolVariant, RestServer, RestServerConfig, ServerLifecycle,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bank = Arc::new(ModbusRegisterBank::with_counts(100, 100, 100, 100)?);
//!     bank.write_holding_registers(0, &[1, 2, 3, 4, 5])?;
//!
//!     let servers: Vec<Box<dyn ModbusServer>> = vec![
//!         Box::new(ModbusTcpServer::with_address(
//!             "127.0.0.1:1502",
//!             ProtocolVariant::ModbusTcp,
//!             bank.clone(),
//!         )),
//!         Box::new(RestServer::new(RestServerConfig::default(), bank)),
//!     ];
//!
//!     ServerLifecycle::new(servers, LifecyclePolicy::default())
//!         .run(shutdown_signal())
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//!   Modbus TCP / RTU      REST (axum)      gRPC (tonic)
//!          │                   │                 │
//!   ┌──────────────────────────────────────────────────┐
//!   │      ServerLifecycle (ordered start / stop)      │
//!   └──────────────────────────────────────────────────┘
//!          │                   │                 │
//!   ┌──────────────────────────────────────────────────┐
//!   │   Arc<ModbusRegisterBank> (one RwLock per bank)  │
//!   └──────────────────────────────────────────────────┘
//! ```

/// Core error types and result handling
pub mod error;

/// Modbus protocol definitions and PDU handling
pub mod protocol;

/// Protocol front-ends
pub mod server;

/// Thread-safe register storage shared by every front-end
pub mod register_bank;

/// Ordered start/stop of the front-ends
pub mod lifecycle;

/// Emulator configuration
pub mod config;

/// Random data for the read-only banks
pub mod simulation;

/// Bit packing, CRC and formatting helpers
pub mod utils;

/// Logging setup for binaries and frame tracing
pub mod logging;

// Re-export main types for convenience
pub use config::ServerConfig;
pub use error::{Bank, ModbusError, ModbusResult};
pub use lifecycle::{LifecyclePolicy, ServerLifecycle, ServerState};
pub use logging::LogLevel;
pub use protocol::{ModbusFunction, ModbusRequest, ModbusResponse, ProtocolVariant};
pub use register_bank::{BankSizes, ModbusRegisterBank, RegisterBankStats};
pub use server::rest::{RestServer, RestServerConfig};
pub use server::tcp::{ModbusTcpServer, ModbusTcpServerConfig};
pub use server::{ModbusServer, ServerStats};
pub use simulation::Simulator;

#[cfg(feature = "grpc")]
pub use server::grpc::{GrpcServer, GrpcServerConfig};

/// Maximum number of coils or discrete inputs in one read request
pub const MAX_COILS_PER_REQUEST: u16 = 2000;

/// Maximum number of registers in one read request
pub const MAX_REGISTERS_PER_REQUEST: u16 = 125;

/// Maximum number of coils in one Write Multiple Coils request
pub const MAX_WRITE_COILS_PER_REQUEST: u16 = 1968;

/// Maximum number of registers in one Write Multiple Registers request
pub const MAX_WRITE_REGISTERS_PER_REQUEST: u16 = 123;

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!(
        "Voltage Modbus Slave v{} - Multi-protocol Modbus device emulator by Evan Liu",
        VERSION
    )
}
