/// Voltage Modbus Slave Emulator
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
/// Serves one register bank over the Modbus wire protocol, REST and gRPC until
/// Ctrl-C or SIGTERM, then stops every server in start order.
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::{error, info, warn};

use voltage_modbus_slave::{
    lifecycle::shutdown_signal, logging, LogLevel, ModbusRegisterBank, ModbusServer,
    ModbusTcpServer, ModbusTcpServerConfig, ProtocolVariant, RestServer, RestServerConfig,
    ServerConfig, ServerLifecycle, Simulator,
};

#[derive(Parser, Debug)]
#[command(name = "mb_server", version, about = "Modbus slave emulator")]
struct Args {
    /// YAML configuration file; flags given on the command line take precedence
    #[arg(long)]
    config: Option<PathBuf>,

    /// Interface every server binds to [default: localhost]
    #[arg(long)]
    host: Option<String>,

    /// Modbus port [default: 502]
    #[arg(long)]
    port: Option<u16>,

    /// REST port [default: 8000]
    #[arg(long)]
    rest_port: Option<u16>,

    /// gRPC port [default: 9000]
    #[arg(long)]
    grpc_port: Option<u16>,

    /// ModbusTCP or ModbusRTUviaTCP [default: ModbusRTUviaTCP]
    #[arg(long)]
    mbprotocol: Option<ProtocolVariant>,

    /// Number of coils [default: 65535]
    #[arg(long)]
    coils: Option<usize>,

    /// Number of discrete inputs [default: 65535]
    #[arg(long)]
    discrete_inputs: Option<usize>,

    /// Number of holding registers [default: 65535]
    #[arg(long)]
    holding_registers: Option<usize>,

    /// Number of input registers [default: 65535]
    #[arg(long)]
    input_registers: Option<usize>,

    /// Stop already started servers when a later one fails to start
    #[arg(long)]
    rollback_on_start_failure: bool,

    /// Keep stopping the remaining servers after one fails to stop
    #[arg(long)]
    best_effort_stop: bool,

    /// Randomize input registers and discrete inputs every N milliseconds
    #[arg(long)]
    simulate_interval_ms: Option<u64>,

    #[arg(long, default_value = "info")]
    log_level: LogLevel,
}

impl Args {
    fn into_config(self) -> anyhow::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_yaml_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => ServerConfig::default(),
        };

        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(port) = self.rest_port {
            config.rest_port = port;
        }
        if let Some(port) = self.grpc_port {
            config.grpc_port = port;
        }
        if let Some(protocol) = self.mbprotocol {
            config.protocol = protocol;
        }
        if let Some(count) = self.coils {
            config.coils = count;
        }
        if let Some(count) = self.discrete_inputs {
            config.discrete_inputs = count;
        }
        if let Some(count) = self.holding_registers {
            config.holding_registers = count;
        }
        if let Some(count) = self.input_registers {
            config.input_registers = count;
        }
        config.rollback_on_start_failure |= self.rollback_on_start_failure;
        config.best_effort_stop |= self.best_effort_stop;
        if self.simulate_interval_ms.is_some() {
            config.simulate_interval_ms = self.simulate_interval_ms;
        }

        config.validate()?;
        Ok(config)
    }
}

const SEED_REGISTERS: [u16; 5] = [1, 2, 3, 4, 5];
const SEED_COILS: [bool; 5] = [true, false, false, true, true];

/// Initial device image, clipped to banks smaller than the pattern
fn seed(bank: &ModbusRegisterBank) -> anyhow::Result<()> {
    let sizes = bank.sizes().context("register bank is not initialized")?;

    let registers = &SEED_REGISTERS[..SEED_REGISTERS.len().min(sizes.holding_registers)];
    if !registers.is_empty() {
        bank.write_holding_registers(0, registers)
            .context("seeding holding registers")?;
    }
    let coils = &SEED_COILS[..SEED_COILS.len().min(sizes.coils)];
    if !coils.is_empty() {
        bank.write_coils(0, coils).context("seeding coils")?;
    }
    Ok(())
}

fn build_servers(config: &ServerConfig, bank: &Arc<ModbusRegisterBank>) -> Vec<Box<dyn ModbusServer>> {
    let mut servers: Vec<Box<dyn ModbusServer>> = Vec::new();

    servers.push(Box::new(ModbusTcpServer::new(
        ModbusTcpServerConfig {
            bind_address: config.modbus_address(),
            protocol: config.protocol,
            max_connections: config.max_connections,
            request_timeout: config.request_timeout(),
        },
        bank.clone(),
    )));

    servers.push(Box::new(RestServer::new(
        RestServerConfig {
            bind_address: config.rest_address(),
        },
        bank.clone(),
    )));

    #[cfg(feature = "grpc")]
    servers.push(Box::new(voltage_modbus_slave::GrpcServer::new(
        voltage_modbus_slave::GrpcServerConfig {
            bind_address: config.grpc_address(),
        },
        bank.clone(),
    )));
    #[cfg(not(feature = "grpc"))]
    warn!(
        "gRPC support not compiled in (enable the `grpc` feature); port {} stays closed",
        config.grpc_port
    );

    servers
}

async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let bank = Arc::new(ModbusRegisterBank::with_sizes(config.bank_sizes())?);
    seed(&bank)?;

    info!("🚀 {}", voltage_modbus_slave::info());
    info!("   - Modbus ({}): {}", config.protocol, config.modbus_address());
    info!("   - REST: {}", config.rest_address());
    info!("   - Banks: {:?}", bank.get_stats());

    let simulator = config
        .simulate_interval_ms
        .map(|ms| Simulator::new(bank.clone(), Duration::from_millis(ms)).spawn());

    let servers = build_servers(&config, &bank);
    let result = ServerLifecycle::new(servers, config.policy())
        .run(shutdown_signal())
        .await;

    if let Some(simulator) = simulator {
        simulator.abort();
    }
    result?;
    info!("👋 Emulator stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    logging::init(args.log_level);

    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => {
            error!("❌ Invalid configuration: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("❌ {:#}", e);
            ExitCode::FAILURE
        }
    }
}
