//! Real-time event fan-out to connected clients.
//!
//! One [`Session`] per WebSocket connection. The session owns every
//! subscription it registers with the device source and releases them all,
//! exactly once, when it closes. [`connection::serve_socket`] drives a
//! session from an axum socket; tests drive sessions directly.

pub mod connection;
mod session;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use tgw_correlator::{Clock, DiagnosticLog};

use crate::devices::DeviceSource;

pub use session::{Flow, Outbound, Session, SessionState};

/// Which devices a connection follows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    AllDevices,
    Device(String),
}

#[derive(Clone)]
pub struct EventFanoutHub {
    devices: Arc<dyn DeviceSource>,
    log: Arc<DiagnosticLog>,
    clock: Arc<dyn Clock>,
    liveness_interval: Duration,
}

impl EventFanoutHub {
    pub fn new(
        devices: Arc<dyn DeviceSource>,
        log: Arc<DiagnosticLog>,
        clock: Arc<dyn Clock>,
        liveness_interval: Duration,
    ) -> Self {
        Self {
            devices,
            log,
            clock,
            liveness_interval,
        }
    }

    pub fn devices(&self) -> &Arc<dyn DeviceSource> {
        &self.devices
    }

    pub fn liveness_interval(&self) -> Duration {
        self.liveness_interval
    }

    /// New session in `Connecting` state plus the receiver of everything it
    /// wants written to the socket.
    pub fn session(&self, scope: Scope) -> (Session, mpsc::UnboundedReceiver<Outbound>) {
        Session::new(self.clone(), scope)
    }
}
