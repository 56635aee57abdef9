//! Ordered start/stop of heterogeneous servers
//!
//! [`ServerLifecycle`] owns every front-end as a `Box<dyn ModbusServer>` and drives
//! them in the order they were given. By default both directions fail fast: the
//! first error aborts the sequence and is returned to the caller, and servers that
//! already started are left running. [`LifecyclePolicy`] opts into rollback on a
//! failed start and best-effort stop.
//!
//! [`ServerLifecycle::run`] ties it to a shutdown signal. The signal may arrive at
//! any time, but `stop_all` only begins once `start_all` has returned.

use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{oneshot, watch, Mutex};

use crate::error::{ModbusError, ModbusResult};
use crate::server::ModbusServer;

/// Lifecycle state of one managed server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServerState {
    Constructed,
    Starting,
    Running,
    Stopping,
    Stopped,
    /// Start or stop failed; terminal
    Errored,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Failure handling switches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecyclePolicy {
    /// Stop the servers already started, in reverse order, when a later one fails
    pub rollback_on_start_failure: bool,
    /// Keep stopping after a failure and report every failure together
    pub best_effort_stop: bool,
}

struct Handle {
    server: Box<dyn ModbusServer>,
    state: ServerState,
}

/// Starts and stops a fixed, ordered list of servers
pub struct ServerLifecycle {
    handles: Vec<Handle>,
    policy: LifecyclePolicy,
}

impl ServerLifecycle {
    pub fn new(servers: Vec<Box<dyn ModbusServer>>, policy: LifecyclePolicy) -> Self {
        let handles = servers
            .into_iter()
            .map(|server| Handle {
                server,
                state: ServerState::Constructed,
            })
            .collect();
        Self { handles, policy }
    }

    pub fn policy(&self) -> LifecyclePolicy {
        self.policy
    }

    /// `(name, state)` of every server, in start order
    pub fn states(&self) -> Vec<(String, ServerState)> {
        self.handles
            .iter()
            .map(|h| (h.server.name().to_string(), h.state))
            .collect()
    }

    /// Managed servers, in start order
    pub fn servers(&self) -> impl Iterator<Item = &dyn ModbusServer> + '_ {
        self.handles.iter().map(|h| h.server.as_ref())
    }

    /// Start every server in order
    ///
    /// Returns the first failure as [`ModbusError::Startup`]; later servers are not
    /// attempted.
    pub async fn start_all(&mut self) -> ModbusResult<()> {
        for index in 0..self.handles.len() {
            let handle = &mut self.handles[index];
            let name = handle.server.name().to_string();

            handle.state = ServerState::Starting;
            info!("Starting server '{}'", name);
            let started = handle.server.start().await;
            match started {
                Ok(()) => handle.state = ServerState::Running,
                Err(e) => {
                    handle.state = ServerState::Errored;
                    error!("Server '{}' failed to start: {}", name, e);
                    let mut message = e.to_string();
                    if self.policy.rollback_on_start_failure {
                        let errors = self.rollback(index).await;
                        if !errors.is_empty() {
                            let rollback = ModbusError::ShutdownErrors { errors };
                            message = format!("{}; rollback: {}", message, rollback);
                        }
                    }
                    return Err(ModbusError::startup(name, message));
                }
            }
        }
        info!("All {} server(s) started", self.handles.len());
        Ok(())
    }

    /// Stop the running servers before `failed`, newest first
    ///
    /// Every server is tried; the stop failures are returned.
    async fn rollback(&mut self, failed: usize) -> Vec<ModbusError> {
        let mut errors = Vec::new();
        for handle in self.handles[..failed].iter_mut().rev() {
            if handle.state != ServerState::Running {
                continue;
            }
            let name = handle.server.name().to_string();
            warn!("Rolling back server '{}'", name);
            handle.state = ServerState::Stopping;
            let stopped = handle.server.stop().await;
            handle.state = match stopped {
                Ok(()) => ServerState::Stopped,
                Err(e) => {
                    error!("Rollback of server '{}' failed: {}", name, e);
                    errors.push(ModbusError::shutdown(name, e.to_string()));
                    ServerState::Errored
                }
            };
        }
        errors
    }

    /// Stop every running server in order
    ///
    /// Servers that never reached `Running` are skipped.
    pub async fn stop_all(&mut self) -> ModbusResult<()> {
        let mut errors = Vec::new();

        for handle in self.handles.iter_mut() {
            if handle.state != ServerState::Running {
                continue;
            }
            let name = handle.server.name().to_string();

            handle.state = ServerState::Stopping;
            info!("Stopping server '{}'", name);
            let stopped = handle.server.stop().await;
            match stopped {
                Ok(()) => handle.state = ServerState::Stopped,
                Err(e) => {
                    handle.state = ServerState::Errored;
                    error!("Server '{}' failed to stop: {}", name, e);
                    let err = ModbusError::shutdown(name, e.to_string());
                    if !self.policy.best_effort_stop {
                        return Err(err);
                    }
                    errors.push(err);
                }
            }
        }

        if errors.is_empty() {
            info!("All servers stopped");
            Ok(())
        } else {
            Err(ModbusError::ShutdownErrors { errors })
        }
    }

    /// Start everything, then stop everything once `shutdown` resolves
    ///
    /// The shutdown future is polled from the moment `run` is called, but stopping is
    /// gated on `start_all` having returned. If starting fails, the startup error is
    /// returned and no stop is attempted.
    pub async fn run<F>(self, shutdown: F) -> ModbusResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let lifecycle = Arc::new(Mutex::new(self));
        let (started_tx, mut started_rx) = watch::channel(false);
        let (done_tx, done_rx) = oneshot::channel();

        let stopper = {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move {
                shutdown.await;
                info!("🛑 Shutdown signal received");
                if started_rx.wait_for(|started| *started).await.is_err() {
                    return;
                }
                let result = lifecycle.lock().await.stop_all().await;
                let _ = done_tx.send(result);
            })
        };

        let started = lifecycle.lock().await.start_all().await;
        if let Err(e) = started {
            stopper.abort();
            return Err(e);
        }
        let _ = started_tx.send(true);

        done_rx
            .await
            .map_err(|_| ModbusError::internal("Shutdown task ended without a result"))?
    }
}

/// Resolves on Ctrl-C, or SIGTERM on Unix
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    type Events = Arc<StdMutex<Vec<String>>>;

    struct MockServer {
        name: String,
        fail_start: bool,
        fail_stop: bool,
        start_delay: Duration,
        running: bool,
        events: Events,
    }

    impl MockServer {
        fn boxed(name: &str, events: &Events) -> Box<dyn ModbusServer> {
            Box::new(Self::new(name, events))
        }

        fn new(name: &str, events: &Events) -> Self {
            Self {
                name: name.to_string(),
                fail_start: false,
                fail_stop: false,
                start_delay: Duration::ZERO,
                running: false,
                events: events.clone(),
            }
        }

        fn record(&self, event: &str) {
            self.events
                .lock()
                .unwrap()
                .push(format!("{} {}", event, self.name));
        }
    }

    #[async_trait]
    impl ModbusServer for MockServer {
        fn name(&self) -> &str {
            &self.name
        }

        async fn start(&mut self) -> ModbusResult<()> {
            tokio::time::sleep(self.start_delay).await;
            self.record("start");
            if self.fail_start {
                return Err(ModbusError::connection("address already in use"));
            }
            self.running = true;
            Ok(())
        }

        async fn stop(&mut self) -> ModbusResult<()> {
            self.record("stop");
            if self.fail_stop {
                return Err(ModbusError::internal("listener stuck"));
            }
            self.running = false;
            Ok(())
        }

        fn is_running(&self) -> bool {
            self.running
        }
    }

    fn events() -> Events {
        Arc::new(StdMutex::new(Vec::new()))
    }

    fn taken(events: &Events) -> Vec<String> {
        std::mem::take(&mut *events.lock().unwrap())
    }

    #[tokio::test]
    async fn test_start_and_stop_in_order() {
        let events = events();
        let mut lifecycle = ServerLifecycle::new(
            vec![
                MockServer::boxed("wire", &events),
                MockServer::boxed("rest", &events),
                MockServer::boxed("grpc", &events),
            ],
            LifecyclePolicy::default(),
        );

        lifecycle.start_all().await.unwrap();
        assert!(lifecycle.servers().all(|s| s.is_running()));
        lifecycle.stop_all().await.unwrap();

        assert_eq!(
            taken(&events),
            ["start wire", "start rest", "start grpc", "stop wire", "stop rest", "stop grpc"]
        );
        assert!(lifecycle
            .states()
            .iter()
            .all(|(_, state)| *state == ServerState::Stopped));
    }

    #[tokio::test]
    async fn test_start_fails_fast() {
        let events = events();
        let mut failing = MockServer::new("rest", &events);
        failing.fail_start = true;
        let mut lifecycle = ServerLifecycle::new(
            vec![
                MockServer::boxed("wire", &events),
                Box::new(failing),
                MockServer::boxed("grpc", &events),
            ],
            LifecyclePolicy::default(),
        );

        let err = lifecycle.start_all().await.unwrap_err();
        assert!(matches!(err, ModbusError::Startup { ref server, .. } if server == "rest"));
        assert!(err.is_lifecycle_error());
        assert_eq!(taken(&events), ["start wire", "start rest"]);
        assert_eq!(
            lifecycle.states(),
            vec![
                ("wire".to_string(), ServerState::Running),
                ("rest".to_string(), ServerState::Errored),
                ("grpc".to_string(), ServerState::Constructed),
            ]
        );

        // Only the running server is stopped
        lifecycle.stop_all().await.unwrap();
        assert_eq!(taken(&events), ["stop wire"]);
    }

    #[tokio::test]
    async fn test_last_server_fails_to_start() {
        let events = events();
        let mut failing = MockServer::new("grpc", &events);
        failing.fail_start = true;
        let mut lifecycle = ServerLifecycle::new(
            vec![
                MockServer::boxed("wire", &events),
                MockServer::boxed("rest", &events),
                Box::new(failing),
            ],
            LifecyclePolicy::default(),
        );

        let err = lifecycle.start_all().await.unwrap_err();
        assert!(matches!(err, ModbusError::Startup { ref server, .. } if server == "grpc"));
        let states: Vec<ServerState> = lifecycle.states().into_iter().map(|(_, s)| s).collect();
        assert_eq!(
            states,
            [ServerState::Running, ServerState::Running, ServerState::Errored]
        );
    }

    #[tokio::test]
    async fn test_rollback_on_start_failure() {
        let events = events();
        let mut failing = MockServer::new("grpc", &events);
        failing.fail_start = true;
        let mut lifecycle = ServerLifecycle::new(
            vec![
                MockServer::boxed("wire", &events),
                MockServer::boxed("rest", &events),
                Box::new(failing),
            ],
            LifecyclePolicy {
                rollback_on_start_failure: true,
                ..Default::default()
            },
        );

        assert!(lifecycle.start_all().await.is_err());
        assert_eq!(
            taken(&events),
            ["start wire", "start rest", "start grpc", "stop rest", "stop wire"]
        );
        assert_eq!(lifecycle.states()[0].1, ServerState::Stopped);
    }

    #[tokio::test]
    async fn test_rollback_failure_is_reported() {
        let events = events();
        let mut stuck = MockServer::new("wire", &events);
        stuck.fail_stop = true;
        let mut failing = MockServer::new("grpc", &events);
        failing.fail_start = true;
        let mut lifecycle = ServerLifecycle::new(
            vec![
                Box::new(stuck),
                MockServer::boxed("rest", &events),
                Box::new(failing),
            ],
            LifecyclePolicy {
                rollback_on_start_failure: true,
                ..Default::default()
            },
        );

        let err = lifecycle.start_all().await.unwrap_err();
        assert!(matches!(err, ModbusError::Startup { ref server, .. } if server == "grpc"));
        let message = err.to_string();
        assert!(message.contains("rollback"), "{}", message);
        assert!(message.contains("listener stuck"), "{}", message);

        // The rest server still rolled back after the wire server refused
        assert_eq!(
            taken(&events),
            ["start wire", "start rest", "start grpc", "stop rest", "stop wire"]
        );
        let states: Vec<ServerState> = lifecycle.states().into_iter().map(|(_, s)| s).collect();
        assert_eq!(
            states,
            [ServerState::Errored, ServerState::Stopped, ServerState::Errored]
        );
    }

    #[tokio::test]
    async fn test_stop_fails_fast() {
        let events = events();
        let mut stuck = MockServer::new("wire", &events);
        stuck.fail_stop = true;
        let mut lifecycle = ServerLifecycle::new(
            vec![Box::new(stuck), MockServer::boxed("rest", &events)],
            LifecyclePolicy::default(),
        );
        lifecycle.start_all().await.unwrap();
        taken(&events);

        let err = lifecycle.stop_all().await.unwrap_err();
        assert!(matches!(err, ModbusError::Shutdown { ref server, .. } if server == "wire"));
        assert_eq!(taken(&events), ["stop wire"]);
        assert_eq!(lifecycle.states()[1].1, ServerState::Running);
    }

    #[tokio::test]
    async fn test_best_effort_stop_collects_errors() {
        let events = events();
        let mut first = MockServer::new("wire", &events);
        first.fail_stop = true;
        let mut last = MockServer::new("grpc", &events);
        last.fail_stop = true;
        let mut lifecycle = ServerLifecycle::new(
            vec![Box::new(first), MockServer::boxed("rest", &events), Box::new(last)],
            LifecyclePolicy {
                best_effort_stop: true,
                ..Default::default()
            },
        );
        lifecycle.start_all().await.unwrap();
        taken(&events);

        let err = lifecycle.stop_all().await.unwrap_err();
        let ModbusError::ShutdownErrors { errors } = &err else {
            panic!("expected aggregated errors, got {:?}", err);
        };
        assert_eq!(errors.len(), 2);
        assert_eq!(taken(&events), ["stop wire", "stop rest", "stop grpc"]);
        assert_eq!(lifecycle.states()[1].1, ServerState::Stopped);
    }

    #[tokio::test]
    async fn test_signal_before_start_completes() {
        let events = events();
        let mut slow = MockServer::new("rest", &events);
        slow.start_delay = Duration::from_millis(50);
        let lifecycle = ServerLifecycle::new(
            vec![MockServer::boxed("wire", &events), Box::new(slow)],
            LifecyclePolicy::default(),
        );

        // Signal fires immediately, while "rest" is still starting
        lifecycle.run(async {}).await.unwrap();
        assert_eq!(
            taken(&events),
            ["start wire", "start rest", "stop wire", "stop rest"]
        );
    }

    #[tokio::test]
    async fn test_run_returns_startup_error() {
        let events = events();
        let mut failing = MockServer::new("wire", &events);
        failing.fail_start = true;
        let lifecycle = ServerLifecycle::new(vec![Box::new(failing)], LifecyclePolicy::default());

        let (signal_tx, signal_rx) = oneshot::channel::<()>();
        let err = lifecycle
            .run(async move {
                let _ = signal_rx.await;
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ModbusError::Startup { .. }));
        drop(signal_tx);
        assert_eq!(taken(&events), ["start wire"]);
    }

    #[tokio::test]
    async fn test_run_waits_for_signal() {
        let events = events();
        let lifecycle = ServerLifecycle::new(
            vec![MockServer::boxed("wire", &events)],
            LifecyclePolicy::default(),
        );
        let (signal_tx, signal_rx) = oneshot::channel::<()>();
        let run = tokio::spawn(lifecycle.run(async move {
            let _ = signal_rx.await;
        }));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!run.is_finished());
        assert_eq!(taken(&events), ["start wire"]);

        signal_tx.send(()).unwrap();
        tokio_test::assert_ok!(run.await.unwrap());
        assert_eq!(taken(&events), ["stop wire"]);
    }
}
