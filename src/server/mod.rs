//! Modbus server implementations
//!
//! Every network front-end implements [`ModbusServer`]: a minimal start/stop
//! capability the lifecycle drives without knowing which protocol sits behind it.
//! All front-ends wrap the same `Arc<ModbusRegisterBank>`.
//!
//! - [`tcp`]: Modbus wire protocol (MBAP or RTU framing over TCP)
//! - [`rest`]: HTTP/JSON
//! - `grpc`: gRPC, behind the `grpc` cargo feature

use async_trait::async_trait;
use log::debug;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::{ModbusError, ModbusResult};
use crate::register_bank::{ModbusRegisterBank, RegisterBankStats};

pub mod rest;
pub mod tcp;

#[cfg(feature = "grpc")]
pub mod grpc;

/// Modbus server trait
///
/// A server is started once and stopped once. `start` returns as soon as the
/// listener is bound and serving runs in the background; `stop` returns after the
/// listener is released. Neither may be retried after it succeeds.
#[async_trait]
pub trait ModbusServer: Send + Sync {
    /// Name used in logs and lifecycle errors
    fn name(&self) -> &str;

    /// Start the server
    async fn start(&mut self) -> ModbusResult<()>;

    /// Stop the server
    async fn stop(&mut self) -> ModbusResult<()>;

    /// Check if server is running
    fn is_running(&self) -> bool;

    /// Address actually bound, once started
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Get server statistics
    fn get_stats(&self) -> ServerStats {
        ServerStats::default()
    }

    /// Get register bank reference
    fn get_register_bank(&self) -> Option<Arc<ModbusRegisterBank>> {
        None
    }
}

/// Server statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServerStats {
    pub connections_count: u64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub uptime_seconds: u64,
    pub register_bank_stats: Option<RegisterBankStats>,
}

/// Shared, lock-protected stats of one server
#[derive(Debug, Clone, Default)]
pub(crate) struct StatsHandle(Arc<Mutex<ServerStats>>);

impl StatsHandle {
    pub(crate) fn update<F: FnOnce(&mut ServerStats)>(&self, f: F) {
        if let Ok(mut stats) = self.0.lock() {
            f(&mut stats);
        }
    }

    pub(crate) fn record_request(&self, success: bool) {
        self.update(|stats| {
            stats.total_requests += 1;
            if success {
                stats.successful_requests += 1;
            } else {
                stats.failed_requests += 1;
            }
        });
    }

    pub(crate) fn snapshot(
        &self,
        state: &RunState,
        register_bank: &ModbusRegisterBank,
    ) -> ServerStats {
        let mut stats = self.0.lock().map(|s| s.clone()).unwrap_or_default();
        if let RunState::Running(running) = state {
            stats.uptime_seconds = running.started_at.elapsed().as_secs();
        }
        stats.register_bank_stats = Some(register_bank.get_stats());
        stats
    }
}

/// Background serving task of a started server
#[derive(Debug)]
pub(crate) struct Running {
    pub shutdown_tx: broadcast::Sender<()>,
    pub task: JoinHandle<()>,
    pub local_addr: SocketAddr,
    pub started_at: Instant,
}

/// Start/stop bookkeeping shared by all front-ends
#[derive(Debug, Default)]
pub(crate) enum RunState {
    #[default]
    Idle,
    Running(Running),
    Stopped,
}

impl RunState {
    /// Fail unless the server has never been started
    pub(crate) fn ensure_startable(&self, name: &str) -> ModbusResult<()> {
        match self {
            RunState::Idle => Ok(()),
            RunState::Running(_) => Err(ModbusError::state(format!(
                "Server '{}' is already running",
                name
            ))),
            RunState::Stopped => Err(ModbusError::state(format!(
                "Server '{}' was stopped and cannot be restarted",
                name
            ))),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        matches!(self, RunState::Running(running) if !running.task.is_finished())
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            RunState::Running(running) => Some(running.local_addr),
            _ => None,
        }
    }

    /// Signal the serving task and wait for it to release the listener
    pub(crate) async fn stop(&mut self, name: &str) -> ModbusResult<()> {
        let running = match std::mem::replace(self, RunState::Stopped) {
            RunState::Running(running) => running,
            previous => {
                let message = match previous {
                    RunState::Idle => "was never started",
                    _ => "is already stopped",
                };
                *self = previous;
                return Err(ModbusError::state(format!("Server '{}' {}", name, message)));
            }
        };

        // No receivers left means the task already exited on its own
        let _ = running.shutdown_tx.send(());
        running
            .task
            .await
            .map_err(|e| ModbusError::shutdown(name, format!("serving task failed: {}", e)))?;
        debug!("Server '{}' released {}", name, running.local_addr);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_state_transitions() {
        let mut state = RunState::default();
        assert!(state.ensure_startable("test").is_ok());
        assert!(state.stop("test").await.unwrap_err().is_state_error());
        assert!(matches!(state, RunState::Idle));

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(async move {
            let _ = shutdown_rx.recv().await;
        });
        state = RunState::Running(Running {
            shutdown_tx,
            task,
            local_addr: "127.0.0.1:1502".parse().unwrap(),
            started_at: Instant::now(),
        });
        assert!(state.is_running());
        assert!(state.ensure_startable("test").unwrap_err().is_state_error());
        assert_eq!(state.local_addr().unwrap().port(), 1502);

        state.stop("test").await.unwrap();
        assert!(!state.is_running());
        assert!(state.ensure_startable("test").unwrap_err().is_state_error());
        assert!(state.stop("test").await.unwrap_err().is_state_error());
    }

    #[tokio::test]
    async fn test_stop_reports_panicked_task() {
        let (shutdown_tx, _) = broadcast::channel(1);
        let task = tokio::spawn(async {
            panic!("listener lost");
        });
        let mut state = RunState::Running(Running {
            shutdown_tx,
            task,
            local_addr: "127.0.0.1:1502".parse().unwrap(),
            started_at: Instant::now(),
        });
        let err = state.stop("rest").await.unwrap_err();
        assert!(matches!(err, ModbusError::Shutdown { ref server, .. } if server == "rest"));
    }
}
