//! HTTP/JSON front-end for the register bank
//!
//! Routes:
//! - `GET /coils`, `GET /discrete_inputs`, `GET /holding_registers`,
//!   `GET /input_registers` with `?address=&count=`
//! - `PUT /coils`, `PUT /holding_registers` with `{"address", "values"}`
//! - `GET /stats`, `GET /health`

use async_trait::async_trait;
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use super::{ModbusServer, RunState, Running, ServerStats, StatsHandle};
use crate::error::{ModbusError, ModbusResult};
use crate::register_bank::{ModbusRegisterBank, RegisterBankStats};

/// REST server configuration
#[derive(Debug, Clone)]
pub struct RestServerConfig {
    pub bind_address: String,
}

impl Default for RestServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8000".to_string(),
        }
    }
}

#[derive(Clone)]
struct AppState {
    register_bank: Arc<ModbusRegisterBank>,
    stats: StatsHandle,
}

/// `?address=&count=`
#[derive(Debug, Deserialize)]
pub struct SpanQuery {
    pub address: u16,
    pub count: u16,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ValuesBody<T> {
    pub address: u16,
    pub values: Vec<T>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct WriteAck {
    pub address: u16,
    pub count: usize,
}

/// Error returned by every handler as `{"error": message}`
#[derive(Debug)]
pub struct ApiError(ModbusError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self.0 {
            ModbusError::OutOfRange { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            ModbusError::InvalidData { .. } => StatusCode::BAD_REQUEST,
            ModbusError::State { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ModbusError> for ApiError {
    fn from(err: ModbusError) -> Self {
        Self(err)
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self(ModbusError::invalid_data(rejection.body_text()))
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(ModbusError::invalid_data(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (self.status(), body).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn record<T>(state: &AppState, result: ModbusResult<T>) -> Result<T, ApiError> {
    state.stats.record_request(result.is_ok());
    result.map_err(ApiError::from)
}

async fn read_coils(
    State(state): State<AppState>,
    query: Result<Query<SpanQuery>, QueryRejection>,
) -> ApiResult<ValuesBody<bool>> {
    let Query(span) = query?;
    let values = record(&state, state.register_bank.read_coils(span.address, span.count))?;
    Ok(Json(ValuesBody {
        address: span.address,
        values,
    }))
}

async fn write_coils(
    State(state): State<AppState>,
    body: Result<Json<ValuesBody<bool>>, JsonRejection>,
) -> ApiResult<WriteAck> {
    let Json(body) = body?;
    record(&state, state.register_bank.write_coils(body.address, &body.values))?;
    Ok(Json(WriteAck {
        address: body.address,
        count: body.values.len(),
    }))
}

async fn read_discrete_inputs(
    State(state): State<AppState>,
    query: Result<Query<SpanQuery>, QueryRejection>,
) -> ApiResult<ValuesBody<bool>> {
    let Query(span) = query?;
    let values = record(
        &state,
        state
            .register_bank
            .read_discrete_inputs(span.address, span.count),
    )?;
    Ok(Json(ValuesBody {
        address: span.address,
        values,
    }))
}

async fn read_holding_registers(
    State(state): State<AppState>,
    query: Result<Query<SpanQuery>, QueryRejection>,
) -> ApiResult<ValuesBody<u16>> {
    let Query(span) = query?;
    let values = record(
        &state,
        state
            .register_bank
            .read_holding_registers(span.address, span.count),
    )?;
    Ok(Json(ValuesBody {
        address: span.address,
        values,
    }))
}

/// Values arrive as JSON numbers; anything above 0xFFFF is rejected before the bank is touched
async fn write_holding_registers(
    State(state): State<AppState>,
    body: Result<Json<ValuesBody<u32>>, JsonRejection>,
) -> ApiResult<WriteAck> {
    let Json(body) = body?;
    let written = body
        .values
        .iter()
        .map(|&v| {
            u16::try_from(v).map_err(|_| {
                ModbusError::invalid_data(format!("Register value {} exceeds 0xFFFF", v))
            })
        })
        .collect::<ModbusResult<Vec<u16>>>()
        .and_then(|values| {
            state
                .register_bank
                .write_holding_registers(body.address, &values)
                .map(|()| values.len())
        });
    let count = record(&state, written)?;
    Ok(Json(WriteAck {
        address: body.address,
        count,
    }))
}

async fn read_input_registers(
    State(state): State<AppState>,
    query: Result<Query<SpanQuery>, QueryRejection>,
) -> ApiResult<ValuesBody<u16>> {
    let Query(span) = query?;
    let values = record(
        &state,
        state
            .register_bank
            .read_input_registers(span.address, span.count),
    )?;
    Ok(Json(ValuesBody {
        address: span.address,
        values,
    }))
}

async fn get_stats(State(state): State<AppState>) -> Json<RegisterBankStats> {
    Json(state.register_bank.get_stats())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/coils", get(read_coils).put(write_coils))
        .route("/discrete_inputs", get(read_discrete_inputs))
        .route(
            "/holding_registers",
            get(read_holding_registers).put(write_holding_registers),
        )
        .route("/input_registers", get(read_input_registers))
        .route("/stats", get(get_stats))
        .route("/health", get(health))
        .with_state(state)
}

/// REST server
pub struct RestServer {
    config: RestServerConfig,
    register_bank: Arc<ModbusRegisterBank>,
    stats: StatsHandle,
    state: RunState,
}

impl RestServer {
    pub fn new(config: RestServerConfig, register_bank: Arc<ModbusRegisterBank>) -> Self {
        Self {
            config,
            register_bank,
            stats: StatsHandle::default(),
            state: RunState::default(),
        }
    }
}

#[async_trait]
impl ModbusServer for RestServer {
    fn name(&self) -> &str {
        "rest"
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

        let app = build_router(AppState {
            register_bank: self.register_bank.clone(),
            stats: self.stats.clone(),
        });
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await;
            if let Err(e) = result {
                error!("REST server error: {}", e);
            }
        });

        self.state = RunState::Running(Running {
            shutdown_tx,
            task,
            local_addr,
            started_at: Instant::now(),
        });
        info!("🌐 REST server listening on http://{}", local_addr);
        Ok(())
    }

    async fn stop(&mut self) -> ModbusResult<()> {
        self.state.stop("rest").await?;
        info!("⏹️  REST server stopped");
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

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn state() -> AppState {
        let bank = ModbusRegisterBank::with_counts(10, 10, 10, 10).unwrap();
        AppState {
            register_bank: Arc::new(bank),
            stats: StatsHandle::default(),
        }
    }

    #[test]
    fn test_error_status_mapping() {
        use crate::error::Bank;

        let range = ApiError::from(ModbusError::out_of_range(Bank::Coils, 8, 5, 10));
        assert_eq!(range.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(
            ApiError::from(ModbusError::invalid_data("bad")).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(ModbusError::state("not initialized")).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::from(ModbusError::internal("boom")).into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_register_handlers() {
        let state = state();

        let ack = write_holding_registers(
            State(state.clone()),
            Ok(Json(ValuesBody {
                address: 2,
                values: vec![10, 20],
            })),
        )
        .await
        .unwrap();
        assert_eq!(ack.0, WriteAck { address: 2, count: 2 });

        let Json(body) = read_holding_registers(
            State(state.clone()),
            Ok(Query(SpanQuery { address: 1, count: 3 })),
        )
        .await
        .unwrap();
        assert_eq!(body.values, vec![0, 10, 20]);

        let err = write_holding_registers(
            State(state.clone()),
            Ok(Json(ValuesBody {
                address: 0,
                values: vec![1, 0x1_0000],
            })),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        // Rejected body leaves register 0 untouched
        assert_eq!(state.register_bank.read_holding_registers(0, 1).unwrap(), vec![0]);

        let err = read_input_registers(
            State(state.clone()),
            Ok(Query(SpanQuery { address: 8, count: 5 })),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::RANGE_NOT_SATISFIABLE);

        let stats = state.stats.snapshot(&RunState::Idle, &state.register_bank);
        assert_eq!(stats.total_requests, 4);
        assert_eq!(stats.failed_requests, 2);
    }

    #[tokio::test]
    async fn test_put_counts_as_one_request() {
        let state = state();
        write_holding_registers(
            State(state.clone()),
            Ok(Json(ValuesBody {
                address: 0,
                values: vec![7],
            })),
        )
        .await
        .unwrap();

        let stats = state.stats.snapshot(&RunState::Idle, &state.register_bank);
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.successful_requests, 1);
    }

    #[tokio::test]
    async fn test_coil_handlers() {
        let state = state();
        write_coils(
            State(state.clone()),
            Ok(Json(ValuesBody {
                address: 0,
                values: vec![true, false, false, true, true],
            })),
        )
        .await
        .unwrap();

        let Json(body) = read_coils(
            State(state.clone()),
            Ok(Query(SpanQuery { address: 0, count: 5 })),
        )
        .await
        .unwrap();
        assert_eq!(body.values, vec![true, false, false, true, true]);

        let err = read_discrete_inputs(
            State(state.clone()),
            Ok(Query(SpanQuery { address: 0, count: 0 })),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    }

    #[tokio::test]
    async fn test_server_serves_http() {
        let bank = Arc::new(ModbusRegisterBank::with_counts(10, 10, 10, 10).unwrap());
        bank.write_holding_registers(0, &[1, 2, 3]).unwrap();
        let mut server = RestServer::new(
            RestServerConfig {
                bind_address: "127.0.0.1:0".to_string(),
            },
            bank,
        );
        server.start().await.unwrap();
        let addr = server.local_addr().unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(
                b"GET /holding_registers?address=0&count=3 HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            )
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with(r#"{"address":0,"values":[1,2,3]}"#));

        server.stop().await.unwrap();
        assert!(!server.is_running());
        assert!(server.stop().await.unwrap_err().is_state_error());
    }
}
