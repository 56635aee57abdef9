//! Modbus wire protocol server
//!
//! Serves the register bank over TCP with either MBAP framing (plain Modbus TCP) or
//! RTU framing carried over the TCP stream. The framing is fixed per server by its
//! [`ProtocolVariant`]; request handling is identical for both.

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;

use super::{ModbusServer, RunState, Running, ServerStats, StatsHandle};
use crate::error::{ModbusError, ModbusResult};
use crate::logging::{self, Direction};
use crate::protocol::{ModbusException, ModbusRequest, ModbusResponse, ProtocolVariant};
use crate::register_bank::ModbusRegisterBank;
use crate::utils::crc16;

/// MBAP header size (transaction id, protocol id, length, unit id)
const MBAP_HEADER_SIZE: usize = 7;

/// Largest PDU a Modbus frame can carry
const MAX_PDU_SIZE: usize = 253;

/// RTU broadcast address; requests are executed but never answered
const RTU_BROADCAST: u8 = 0;

/// Modbus TCP server configuration
#[derive(Debug, Clone)]
pub struct ModbusTcpServerConfig {
    /// `host:port` to bind; port 0 picks a free port
    pub bind_address: String,
    pub protocol: ProtocolVariant,
    pub max_connections: usize,
    /// Idle time after which a silent client is disconnected
    pub request_timeout: Duration,
}

impl Default for ModbusTcpServerConfig {
    fn default() -> Self {
        Self {
            bind_address: format!("127.0.0.1:{}", crate::DEFAULT_TCP_PORT),
            protocol: ProtocolVariant::default(),
            max_connections: 100,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Modbus TCP server implementation
pub struct ModbusTcpServer {
    name: String,
    config: ModbusTcpServerConfig,
    register_bank: Arc<ModbusRegisterBank>,
    stats: StatsHandle,
    state: RunState,
}

/// Everything a connection task needs
struct ConnectionContext {
    register_bank: Arc<ModbusRegisterBank>,
    stats: StatsHandle,
    protocol: ProtocolVariant,
    request_timeout: Duration,
}

/// One request cut out of the receive buffer
#[derive(Debug, Clone, PartialEq)]
pub struct RequestFrame {
    /// MBAP transaction id; zero for RTU
    pub transaction_id: u16,
    pub unit_id: u8,
    pub pdu: Vec<u8>,
}

/// Result of trying to decode one frame
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Request(RequestFrame),
    /// Corrupted frame consumed without an answer
    Dropped,
}

impl ModbusTcpServer {
    /// Create a new server bound to the shared register bank
    pub fn new(config: ModbusTcpServerConfig, register_bank: Arc<ModbusRegisterBank>) -> Self {
        let name = match config.protocol {
            ProtocolVariant::ModbusTcp => "modbus-tcp",
            ProtocolVariant::RtuOverTcp => "modbus-rtu-over-tcp",
        };
        Self {
            name: name.to_string(),
            config,
            register_bank,
            stats: StatsHandle::default(),
            state: RunState::default(),
        }
    }

    /// Create a server with default settings on `bind_address`
    pub fn with_address(
        bind_address: &str,
        protocol: ProtocolVariant,
        register_bank: Arc<ModbusRegisterBank>,
    ) -> Self {
        let config = ModbusTcpServerConfig {
            bind_address: bind_address.to_string(),
            protocol,
            ..Default::default()
        };
        Self::new(config, register_bank)
    }

    pub fn config(&self) -> &ModbusTcpServerConfig {
        &self.config
    }

    async fn accept_loop(
        listener: TcpListener,
        ctx: Arc<ConnectionContext>,
        max_connections: usize,
        shutdown_tx: broadcast::Sender<()>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let permits = Arc::new(Semaphore::new(max_connections));
        let mut clients = JoinSet::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let Ok(permit) = permits.clone().try_acquire_owned() else {
                                warn!("Connection limit ({}) reached, refusing {}", max_connections, peer);
                                drop(stream);
                                continue;
                            };
                            debug!("Accepted connection from {}", peer);

                            let ctx = ctx.clone();
                            let client_shutdown = shutdown_tx.subscribe();
                            clients.spawn(async move {
                                let _permit = permit;
                                Self::handle_client(stream, peer, ctx, client_shutdown).await;
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                // Reap finished connections so the set does not grow unbounded
                Some(_) = clients.join_next(), if !clients.is_empty() => {}
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping listener {}", ctx.protocol);
                    break;
                }
            }
        }

        drop(listener);
        // Connections finish the request they are processing, then close
        while clients.join_next().await.is_some() {}
    }

    /// Handle client connection
    async fn handle_client(
        mut stream: TcpStream,
        peer: SocketAddr,
        ctx: Arc<ConnectionContext>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        info!("📡 New client connected: {}", peer);
        ctx.stats.update(|stats| stats.connections_count += 1);

        let mut buffer = BytesMut::with_capacity(2 * (MBAP_HEADER_SIZE + MAX_PDU_SIZE));

        'connection: loop {
            // Answer every complete frame already buffered
            loop {
                let decoded = match ctx.protocol {
                    ProtocolVariant::ModbusTcp => decode_mbap(&mut buffer),
                    ProtocolVariant::RtuOverTcp => decode_rtu(&mut buffer),
                };
                match decoded {
                    Ok(Some(Decoded::Request(frame))) => {
                        if let Err(e) = Self::respond(&mut stream, peer, &ctx, frame).await {
                            error!("Failed to send response to {}: {}", peer, e);
                            break 'connection;
                        }
                    }
                    Ok(Some(Decoded::Dropped)) => {
                        ctx.stats.record_request(false);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Closing {}: {}", peer, e);
                        ctx.stats.record_request(false);
                        break 'connection;
                    }
                }
            }

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("Shutdown signal received for client {}", peer);
                    break;
                }
                result = timeout(ctx.request_timeout, stream.read_buf(&mut buffer)) => {
                    match result {
                        Ok(Ok(0)) => {
                            debug!("Client {} closed the connection", peer);
                            break;
                        }
                        Ok(Ok(bytes_read)) => {
                            ctx.stats.update(|stats| stats.bytes_received += bytes_read as u64);
                            let received = &buffer[buffer.len() - bytes_read..];
                            logging::log_frame(Direction::Rx, peer, ctx.protocol, received);
                        }
                        Ok(Err(e)) => {
                            error!("Read error from {}: {}", peer, e);
                            break;
                        }
                        Err(_) => {
                            let err = ModbusError::timeout(
                                format!("waiting for a request from {}", peer),
                                ctx.request_timeout.as_millis() as u64,
                            );
                            warn!("Closing idle connection: {}", err);
                            break;
                        }
                    }
                }
            }
        }

        info!("🔌 Client {} disconnected", peer);
    }

    async fn respond(
        stream: &mut TcpStream,
        peer: SocketAddr,
        ctx: &ConnectionContext,
        frame: RequestFrame,
    ) -> ModbusResult<()> {
        debug!("{} request: {}", peer, logging::describe_pdu(&frame.pdu));
        let response = handle_request_pdu(&frame.pdu, &ctx.register_bank);
        ctx.stats.record_request(!response.is_exception());

        if ctx.protocol == ProtocolVariant::RtuOverTcp && frame.unit_id == RTU_BROADCAST {
            return Ok(());
        }

        let reply = encode_frame(ctx.protocol, &frame, &response.encode());
        logging::log_frame(Direction::Tx, peer, ctx.protocol, &reply);
        stream.write_all(&reply).await?;
        ctx.stats.update(|stats| stats.bytes_sent += reply.len() as u64);
        Ok(())
    }
}

/// Execute one request PDU against the bank
///
/// Never fails: every error becomes an exception response carrying the matching
/// Modbus exception code.
pub fn handle_request_pdu(pdu: &[u8], register_bank: &ModbusRegisterBank) -> ModbusResponse {
    let function_code = pdu.first().copied().unwrap_or(0);
    match ModbusRequest::parse(pdu).and_then(|request| execute(&request, register_bank)) {
        Ok(response) => response,
        Err(e) => {
            debug!("Request 0x{:02X} rejected: {}", function_code, e);
            ModbusResponse::Exception {
                function_code,
                exception: ModbusException::from_error(&e),
            }
        }
    }
}

fn execute(request: &ModbusRequest, bank: &ModbusRegisterBank) -> ModbusResult<ModbusResponse> {
    let function = request.function();
    let response = match *request {
        ModbusRequest::ReadCoils { address, quantity } => ModbusResponse::Bits {
            function,
            values: bank.read_01(address, quantity)?,
        },
        ModbusRequest::ReadDiscreteInputs { address, quantity } => ModbusResponse::Bits {
            function,
            values: bank.read_02(address, quantity)?,
        },
        ModbusRequest::ReadHoldingRegisters { address, quantity } => ModbusResponse::Registers {
            function,
            values: bank.read_03(address, quantity)?,
        },
        ModbusRequest::ReadInputRegisters { address, quantity } => ModbusResponse::Registers {
            function,
            values: bank.read_04(address, quantity)?,
        },
        ModbusRequest::WriteSingleCoil { address, value } => {
            bank.write_05(address, value)?;
            ModbusResponse::Write {
                function,
                address,
                word: if value { 0xFF00 } else { 0x0000 },
            }
        }
        ModbusRequest::WriteSingleRegister { address, value } => {
            bank.write_06(address, value)?;
            ModbusResponse::Write {
                function,
                address,
                word: value,
            }
        }
        ModbusRequest::WriteMultipleCoils { address, ref values } => {
            bank.write_0f(address, values)?;
            ModbusResponse::Write {
                function,
                address,
                word: values.len() as u16,
            }
        }
        ModbusRequest::WriteMultipleRegisters { address, ref values } => {
            bank.write_10(address, values)?;
            ModbusResponse::Write {
                function,
                address,
                word: values.len() as u16,
            }
        }
    };
    Ok(response)
}

/// Cut one MBAP frame out of the buffer
///
/// Returns `Ok(None)` until a whole frame is buffered. A non-zero protocol id or an
/// impossible length is a framing error and ends the connection.
pub fn decode_mbap(buffer: &mut BytesMut) -> ModbusResult<Option<Decoded>> {
    if buffer.len() < MBAP_HEADER_SIZE {
        return Ok(None);
    }
    let transaction_id = u16::from_be_bytes([buffer[0], buffer[1]]);
    let protocol_id = u16::from_be_bytes([buffer[2], buffer[3]]);
    let length = u16::from_be_bytes([buffer[4], buffer[5]]) as usize;

    if protocol_id != 0 {
        return Err(ModbusError::frame(format!("Invalid protocol ID {}", protocol_id)));
    }
    // length covers unit id + PDU
    if !(2..=MAX_PDU_SIZE + 1).contains(&length) {
        return Err(ModbusError::frame(format!("Invalid MBAP length {}", length)));
    }

    let total = MBAP_HEADER_SIZE - 1 + length;
    if buffer.len() < total {
        return Ok(None);
    }
    let frame = buffer.split_to(total);
    Ok(Some(Decoded::Request(RequestFrame {
        transaction_id,
        unit_id: frame[6],
        pdu: frame[MBAP_HEADER_SIZE..].to_vec(),
    })))
}

/// Cut one RTU frame out of the buffer
///
/// RTU carries no length field, so the frame size is derived from the function
/// code. Unknown function codes consume the whole buffer and are answered with
/// Illegal Function; frames with a bad CRC are dropped silently.
pub fn decode_rtu(buffer: &mut BytesMut) -> ModbusResult<Option<Decoded>> {
    if buffer.len() < 2 {
        return Ok(None);
    }
    let unit_id = buffer[0];
    let function_code = buffer[1];

    let frame_len = match function_code {
        0x01..=0x06 => 8,
        0x0F | 0x10 => {
            if buffer.len() < 7 {
                return Ok(None);
            }
            9 + buffer[6] as usize
        }
        _ => {
            buffer.clear();
            return Ok(Some(Decoded::Request(RequestFrame {
                transaction_id: 0,
                unit_id,
                pdu: vec![function_code],
            })));
        }
    };

    if buffer.len() < frame_len {
        return Ok(None);
    }
    let frame = buffer.split_to(frame_len);
    match crc16::verify(&frame) {
        Ok(body) => Ok(Some(Decoded::Request(RequestFrame {
            transaction_id: 0,
            unit_id,
            pdu: body[1..].to_vec(),
        }))),
        Err((expected, actual)) => {
            warn!("{}", ModbusError::crc_mismatch(expected, actual));
            // Whatever followed the corrupted frame cannot be trusted either
            buffer.advance(buffer.len());
            Ok(Some(Decoded::Dropped))
        }
    }
}

/// Wrap a response PDU in the framing of `protocol`
pub fn encode_frame(protocol: ProtocolVariant, request: &RequestFrame, pdu: &[u8]) -> Vec<u8> {
    match protocol {
        ProtocolVariant::ModbusTcp => {
            let mut frame = Vec::with_capacity(MBAP_HEADER_SIZE + pdu.len());
            frame.extend_from_slice(&request.transaction_id.to_be_bytes());
            frame.extend_from_slice(&0u16.to_be_bytes());
            frame.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
            frame.push(request.unit_id);
            frame.extend_from_slice(pdu);
            frame
        }
        ProtocolVariant::RtuOverTcp => {
            let mut frame = Vec::with_capacity(pdu.len() + 3);
            frame.push(request.unit_id);
            frame.extend_from_slice(pdu);
            crc16::append(&mut frame);
            frame
        }
    }
}

#[async_trait]
impl ModbusServer for ModbusTcpServer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&mut self) -> ModbusResult<()> {
        self.state.ensure_startable(&self.name)?;
        if !(1..=Semaphore::MAX_PERMITS).contains(&self.config.max_connections) {
            return Err(ModbusError::configuration(format!(
                "max_connections must be between 1 and {}, got {}",
                Semaphore::MAX_PERMITS,
                self.config.max_connections
            )));
        }

        info!(
            "🚀 Starting Modbus server ({}) on {}",
            self.config.protocol, self.config.bind_address
        );

        let listener = TcpListener::bind(self.config.bind_address.as_str())
            .await
            .map_err(|e| {
                ModbusError::connection(format!(
                    "Failed to bind to {}: {}",
                    self.config.bind_address, e
                ))
            })?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let ctx = Arc::new(ConnectionContext {
            register_bank: self.register_bank.clone(),
            stats: self.stats.clone(),
            protocol: self.config.protocol,
            request_timeout: self.config.request_timeout,
        });
        let task = tokio::spawn(Self::accept_loop(
            listener,
            ctx,
            self.config.max_connections,
            shutdown_tx.clone(),
            shutdown_rx,
        ));

        self.state = RunState::Running(Running {
            shutdown_tx,
            task,
            local_addr,
            started_at: Instant::now(),
        });

        info!("✅ Modbus server listening on {}", local_addr);
        info!("   - Framing: {}", self.config.protocol);
        info!("   - Max connections: {}", self.config.max_connections);
        info!("   - Request timeout: {:?}", self.config.request_timeout);
        Ok(())
    }

    async fn stop(&mut self) -> ModbusResult<()> {
        self.state.stop(&self.name).await?;
        info!("⏹️  Modbus server ({}) stopped", self.config.protocol);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.state.is_running()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.state.local_addr()
    }

    fn get_stats(&self) -> ServerStats {
        self.stats.snapshot(&self.state, &self.register_bank)
    }

    fn get_register_bank(&self) -> Option<Arc<ModbusRegisterBank>> {
        Some(self.register_bank.clone())
    }
}
