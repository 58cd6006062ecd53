//! HTTP health and readiness surface
//!
//! The listener runs on its own task, independent of broker state: the
//! owning service flips `ready` and `status` as its initialization
//! progresses, and request handlers only ever read. Linking broker health
//! to readiness is the owning service's job, not this module's.

mod routes;

pub(crate) use routes::build_router;

use crate::error::{ConfigError, HealthError};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Readiness and status shared between the owning service (writer) and the
/// HTTP handler tasks (readers).
pub struct HealthState {
    ready: AtomicBool,
    status: RwLock<Option<String>>,
    status_code: AtomicU16,
    started: Instant,
}

impl HealthState {
    fn new(ready: bool) -> Self {
        Self {
            ready: AtomicBool::new(ready),
            status: RwLock::new(None),
            status_code: AtomicU16::new(503),
            started: Instant::now(),
        }
    }

    pub fn ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn status(&self) -> Option<String> {
        self.status.read().clone()
    }

    pub fn set_status(&self, status: Option<String>) {
        *self.status.write() = status;
    }

    pub fn status_code(&self) -> u16 {
        self.status_code.load(Ordering::SeqCst)
    }

    /// Set the status code reported by `/status` while ready. Codes outside
    /// `100..=599` are rejected.
    pub fn set_status_code(&self, code: u16) -> Result<(), ConfigError> {
        if !(100..=599).contains(&code) {
            return Err(ConfigError::InvalidStatusCode(code));
        }
        self.status_code.store(code, Ordering::SeqCst);
        Ok(())
    }

    /// Time since construction; monotonic.
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}

/// HTTP health server.
///
/// [`start`](HealthServer::start) binds the listener and serves it from a
/// spawned task; the constructing task is never blocked. A disabled server
/// keeps the state surface but no listener, and defaults to ready.
pub struct HealthServer {
    state: Arc<HealthState>,
    port: Option<u16>,
}

impl HealthServer {
    /// Bind and start serving on `port`. Port zero is rejected.
    pub async fn start(port: u16) -> Result<Self, HealthError> {
        if port == 0 {
            return Err(ConfigError::InvalidHealthPort.into());
        }

        let state = Arc::new(HealthState::new(false));
        let app = build_router(state.clone());
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;

        tracing::info!(port, "Health server listening");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "Health server terminated");
            }
        });

        Ok(Self {
            state,
            port: Some(port),
        })
    }

    /// No listener; readiness defaults to true.
    pub fn disabled() -> Self {
        Self {
            state: Arc::new(HealthState::new(true)),
            port: None,
        }
    }

    /// The serving port, or `None` when disabled.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Shared state handle, for owners that want to move it elsewhere.
    pub fn state(&self) -> Arc<HealthState> {
        self.state.clone()
    }

    pub fn ready(&self) -> bool {
        self.state.ready()
    }

    pub fn set_ready(&self, ready: bool) {
        self.state.set_ready(ready);
    }

    pub fn status(&self) -> Option<String> {
        self.state.status()
    }

    pub fn set_status(&self, status: Option<String>) {
        self.state.set_status(status);
    }

    pub fn status_code(&self) -> u16 {
        self.state.status_code()
    }

    pub fn set_status_code(&self, code: u16) -> Result<(), ConfigError> {
        self.state.set_status_code(code)
    }

    pub fn uptime(&self) -> Duration {
        self.state.uptime()
    }
}
