//! gRPC front-end for the register bank
//!
//! Service `modbus.Modbus` with one unary method per bank operation. Messages are
//! declared with `prost` derives and routed by hand, so no `.proto` build step is
//! needed.

use async_trait::async_trait;
use log::{error, info};
use std::future::{ready, Ready};
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::body::BoxBody;
use tonic::codec::ProstCodec;
use tonic::codegen::{empty_body, http, Body, BoxFuture, StdError};
use tonic::server::{Grpc, NamedService, UnaryService};
use tonic::Status;

use super::{ModbusServer, RunState, Running, ServerStats, StatsHandle};
use crate::error::{ModbusError, ModbusResult};
use crate::register_bank::ModbusRegisterBank;

/// Span to read
#[derive(Clone, PartialEq, prost::Message)]
pub struct ReadRequest {
    #[prost(uint32, tag = "1")]
    pub address: u32,
    #[prost(uint32, tag = "2")]
    pub count: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BitsResponse {
    #[prost(bool, repeated, tag = "1")]
    pub values: Vec<bool>,
}

/// Register values widened to `uint32`, as protobuf has no 16-bit type
#[derive(Clone, PartialEq, prost::Message)]
pub struct RegistersResponse {
    #[prost(uint32, repeated, tag = "1")]
    pub values: Vec<u32>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WriteBitsRequest {
    #[prost(uint32, tag = "1")]
    pub address: u32,
    #[prost(bool, repeated, tag = "2")]
    pub values: Vec<bool>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WriteRegistersRequest {
    #[prost(uint32, tag = "1")]
    pub address: u32,
    #[prost(uint32, repeated, tag = "2")]
    pub values: Vec<u32>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WriteResponse {
    #[prost(uint32, tag = "1")]
    pub address: u32,
    #[prost(uint32, tag = "2")]
    pub count: u32,
}

fn to_status(err: ModbusError) -> Status {
    match err {
        ModbusError::OutOfRange { .. } => Status::out_of_range(err.to_string()),
        ModbusError::State { .. } => Status::failed_precondition(err.to_string()),
        ModbusError::InvalidData { .. } => Status::invalid_argument(err.to_string()),
        _ => Status::internal(err.to_string()),
    }
}

/// protobuf fields are 32-bit; anything past 16 bits can never name a valid span
fn narrow(field: &str, value: u32) -> Result<u16, Status> {
    u16::try_from(value)
        .map_err(|_| Status::out_of_range(format!("{} {} exceeds the Modbus address range", field, value)))
}

/// Operations behind each RPC
pub mod handlers {
    use super::*;

    pub fn read_coils(bank: &ModbusRegisterBank, req: ReadRequest) -> Result<BitsResponse, Status> {
        let values = bank
            .read_coils(narrow("address", req.address)?, narrow("count", req.count)?)
            .map_err(to_status)?;
        Ok(BitsResponse { values })
    }

    pub fn read_discrete_inputs(
        bank: &ModbusRegisterBank,
        req: ReadRequest,
    ) -> Result<BitsResponse, Status> {
        let values = bank
            .read_discrete_inputs(narrow("address", req.address)?, narrow("count", req.count)?)
            .map_err(to_status)?;
        Ok(BitsResponse { values })
    }

    pub fn read_holding_registers(
        bank: &ModbusRegisterBank,
        req: ReadRequest,
    ) -> Result<RegistersResponse, Status> {
        let values = bank
            .read_holding_registers(narrow("address", req.address)?, narrow("count", req.count)?)
            .map_err(to_status)?;
        Ok(RegistersResponse {
            values: values.into_iter().map(u32::from).collect(),
        })
    }

    pub fn read_input_registers(
        bank: &ModbusRegisterBank,
        req: ReadRequest,
    ) -> Result<RegistersResponse, Status> {
        let values = bank
            .read_input_registers(narrow("address", req.address)?, narrow("count", req.count)?)
            .map_err(to_status)?;
        Ok(RegistersResponse {
            values: values.into_iter().map(u32::from).collect(),
        })
    }

    pub fn write_coils(
        bank: &ModbusRegisterBank,
        req: WriteBitsRequest,
    ) -> Result<WriteResponse, Status> {
        bank.write_coils(narrow("address", req.address)?, &req.values)
            .map_err(to_status)?;
        Ok(WriteResponse {
            address: req.address,
            count: req.values.len() as u32,
        })
    }

    pub fn write_holding_registers(
        bank: &ModbusRegisterBank,
        req: WriteRegistersRequest,
    ) -> Result<WriteResponse, Status> {
        let address = narrow("address", req.address)?;
        let values = req
            .values
            .iter()
            .map(|&v| {
                u16::try_from(v).map_err(|_| {
                    to_status(ModbusError::invalid_data(format!(
                        "Register value {} exceeds 0xFFFF",
                        v
                    )))
                })
            })
            .collect::<Result<Vec<u16>, Status>>()?;
        bank.write_holding_registers(address, &values)
            .map_err(to_status)?;
        Ok(WriteResponse {
            address: req.address,
            count: values.len() as u32,
        })
    }
}

/// Adapts a synchronous handler to tonic's unary service
struct Unary<F>(F);

impl<Req, Resp, F> UnaryService<Req> for Unary<F>
where
    F: FnMut(Req) -> Result<Resp, Status>,
{
    type Response = Resp;
    type Future = Ready<Result<tonic::Response<Resp>, Status>>;

    fn call(&mut self, request: tonic::Request<Req>) -> Self::Future {
        ready((self.0)(request.into_inner()).map(tonic::Response::new))
    }
}

async fn dispatch<Req, Resp, F, B>(handler: F, req: http::Request<B>) -> http::Response<BoxBody>
where
    Req: prost::Message + Default + Send + 'static,
    Resp: prost::Message + Send + 'static,
    F: FnMut(Req) -> Result<Resp, Status> + Send + 'static,
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    let mut grpc = Grpc::new(ProstCodec::<Resp, Req>::default());
    grpc.unary(Unary(handler), req).await
}

/// `modbus.Modbus` service
#[derive(Clone)]
pub struct ModbusService {
    register_bank: Arc<ModbusRegisterBank>,
    stats: StatsHandle,
}

impl ModbusService {
    pub fn new(register_bank: Arc<ModbusRegisterBank>) -> Self {
        Self {
            register_bank,
            stats: StatsHandle::default(),
        }
    }

    fn counted<Req, Resp>(
        &self,
        handler: fn(&ModbusRegisterBank, Req) -> Result<Resp, Status>,
    ) -> impl FnMut(Req) -> Result<Resp, Status> + Send + 'static
    where
        Req: 'static,
        Resp: 'static,
    {
        let bank = self.register_bank.clone();
        let stats = self.stats.clone();
        move |req| {
            let result = handler(&bank, req);
            stats.record_request(result.is_ok());
            result
        }
    }
}

impl NamedService for ModbusService {
    const NAME: &'static str = "modbus.Modbus";
}

impl<B> tonic::codegen::Service<http::Request<B>> for ModbusService
where
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<BoxBody>;
    type Error = std::convert::Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        match req.uri().path() {
            "/modbus.Modbus/ReadCoils" => {
                let handler = self.counted(handlers::read_coils);
                Box::pin(async move { Ok(dispatch(handler, req).await) })
            }
            "/modbus.Modbus/ReadDiscreteInputs" => {
                let handler = self.counted(handlers::read_discrete_inputs);
                Box::pin(async move { Ok(dispatch(handler, req).await) })
            }
            "/modbus.Modbus/ReadHoldingRegisters" => {
                let handler = self.counted(handlers::read_holding_registers);
                Box::pin(async move { Ok(dispatch(handler, req).await) })
            }
            "/modbus.Modbus/ReadInputRegisters" => {
                let handler = self.counted(handlers::read_input_registers);
                Box::pin(async move { Ok(dispatch(handler, req).await) })
            }
            "/modbus.Modbus/WriteCoils" => {
                let handler = self.counted(handlers::write_coils);
                Box::pin(async move { Ok(dispatch(handler, req).await) })
            }
            "/modbus.Modbus/WriteHoldingRegisters" => {
                let handler = self.counted(handlers::write_holding_registers);
                Box::pin(async move { Ok(dispatch(handler, req).await) })
            }
            _ => Box::pin(async move {
                let mut response = http::Response::new(empty_body());
                let headers = response.headers_mut();
                // 12 = UNIMPLEMENTED
                headers.insert("grpc-status", http::HeaderValue::from_static("12"));
                headers.insert(
                    http::header::CONTENT_TYPE,
                    http::HeaderValue::from_static("application/grpc"),
                );
                Ok(response)
            }),
        }
    }
}

/// gRPC server configuration
#[derive(Debug, Clone)]
pub struct GrpcServerConfig {
    pub bind_address: String,
}

impl Default for GrpcServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:9000".to_string(),
        }
    }
}

/// gRPC server
pub struct GrpcServer {
    config: GrpcServerConfig,
    service: ModbusService,
    state: RunState,
}

impl GrpcServer {
    pub fn new(config: GrpcServerConfig, register_bank: Arc<ModbusRegisterBank>) -> Self {
        Self {
            config,
            service: ModbusService::new(register_bank),
            state: RunState::default(),
        }
    }
}

#[async_trait]
impl ModbusServer for GrpcServer {
    fn name(&self) -> &str {
        "grpc"
    }

    async fn start(&mut self) -> ModbusResult<()> {
        self.state.ensure_startable(self.name())?;

        let listener = TcpListener::bind(self.config.bind_address.as_str())
            .await
            .map_err(|e| {
                ModbusError::connection(format!(
                    "Failed to bind to {}: {}",
                    self.config.bind_address, e
                ))
            })?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let service = self.service.clone();
        let task = tokio::spawn(async move {
            let result = tonic::transport::Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await;
            if let Err(e) = result {
                error!("gRPC server error: {}", e);
            }
        });

        self.state = RunState::Running(Running {
            shutdown_tx,
            task,
            local_addr,
            started_at: Instant::now(),
        });
        info!("🛰️  gRPC server listening on {}", local_addr);
        Ok(())
    }

    async fn stop(&mut self) -> ModbusResult<()> {
        self.state.stop("grpc").await?;
        info!("⏹️  gRPC server stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.state.is_running()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.state.local_addr()
    }

    fn get_stats(&self) -> ServerStats {
        self.service
            .stats
            .snapshot(&self.state, &self.service.register_bank)
    }

    fn get_register_bank(&self) -> Option<Arc<ModbusRegisterBank>> {
        Some(self.service.register_bank.clone())
    }
}
