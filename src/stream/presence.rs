//! Network presence polling.
//!
//! The probe runs in its own task and reports changes to the connection
//! worker, so a slow probe never delays heartbeats.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::retry::with_timeout;
use crate::stream::client::WorkerCommand;

/// Answers whether the host currently has network connectivity.
#[async_trait]
pub trait PresenceProbe: Send + Sync {
    async fn is_online(&self) -> bool;
}

/// Probe for hosts that cannot tell; never suppresses reconnects.
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysOnline;

#[async_trait]
impl PresenceProbe for AlwaysOnline {
    async fn is_online(&self) -> bool {
        true
    }
}

/// Online when a TCP connection to `addr` opens within `timeout`.
#[derive(Clone, Debug)]
pub struct TcpPresenceProbe {
    addr: String,
    timeout: Duration,
}

impl TcpPresenceProbe {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            timeout: Duration::from_secs(2),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl PresenceProbe for TcpPresenceProbe {
    async fn is_online(&self) -> bool {
        matches!(
            with_timeout(self.timeout, TcpStream::connect(self.addr.as_str())).await,
            Ok(Ok(_))
        )
    }
}

/// Polls `probe` every `interval` and forwards changes as
/// [`WorkerCommand::Presence`]. Exits when the worker is gone.
pub(crate) async fn run_presence_monitor(
    probe: Arc<dyn PresenceProbe>,
    interval: Duration,
    commands: mpsc::UnboundedSender<WorkerCommand>,
) {
    let mut last = None;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if commands.is_closed() {
            debug!(event = "presence_monitor_stopped");
            return;
        }
        let online = probe.is_online().await;
        if last == Some(online) {
            continue;
        }
        if last.is_some() {
            info!(event = "network_presence_changed", online);
        }
        last = Some(online);
        if commands.send(WorkerCommand::Presence(online)).is_err() {
            return;
        }
    }
}
