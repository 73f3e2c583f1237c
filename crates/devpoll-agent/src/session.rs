//! Gateway session state and link-loss detection.

use async_trait::async_trait;
use devpoll_core::{
    ConnectionSession, FetchResults, GatewayError, PointId, PropertyFetchGateway, RemoteDevice,
};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// The agent's connection to the gateway.
///
/// Two separate flags: the link goes down when the gateway is deemed lost,
/// and the session is shut down when a poll tick then observes the lost
/// link. The agent exits on shutdown.
#[derive(Debug)]
pub struct AgentSession {
    link_up: AtomicBool,
    shut_down: AtomicBool,
    closed: Notify,
}

impl AgentSession {
    /// An open session.
    #[must_use]
    pub fn new() -> Self {
        Self {
            link_up: AtomicBool::new(true),
            shut_down: AtomicBool::new(false),
            closed: Notify::new(),
        }
    }

    /// Mark the gateway link as lost. The next poll tick tears the session
    /// down.
    pub fn mark_lost(&self) {
        if self.link_up.swap(false, Ordering::SeqCst) {
            tracing::error!("Gateway link lost");
        }
    }

    /// Whether [`ConnectionSession::shutdown`] has run.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Resolves once the session has been shut down.
    pub async fn closed(&self) {
        loop {
            let notified = self.closed.notified();
            if self.is_shut_down() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for AgentSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionSession for AgentSession {
    fn is_open(&self) -> bool {
        self.link_up.load(Ordering::SeqCst)
    }

    fn shutdown(&self) {
        self.link_up.store(false, Ordering::SeqCst);
        if !self.shut_down.swap(true, Ordering::SeqCst) {
            tracing::warn!("Gateway session shut down");
        }
        self.closed.notify_waiters();
    }
}

/// Fetch gateway wrapper that marks the session lost after a run of
/// consecutive transport failures.
pub struct MonitoredGateway {
    inner: Arc<dyn PropertyFetchGateway>,
    session: Arc<AgentSession>,
    max_failures: u32,
    failures: AtomicU32,
}

impl MonitoredGateway {
    /// Wrap `inner`; `max_failures` consecutive transport errors mark the
    /// session lost.
    #[must_use]
    pub fn new(
        inner: Arc<dyn PropertyFetchGateway>,
        session: Arc<AgentSession>,
        max_failures: u32,
    ) -> Self {
        Self {
            inner,
            session,
            max_failures: max_failures.max(1),
            failures: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl PropertyFetchGateway for MonitoredGateway {
    async fn fetch(
        &self,
        device: &RemoteDevice,
        points: &[PointId],
    ) -> Result<FetchResults, GatewayError> {
        let result = self.inner.fetch(device, points).await;
        match &result {
            Err(GatewayError::Transport(err)) => {
                let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::debug!(failures, error = %err, "Gateway transport failure");
                if failures >= self.max_failures {
                    self.session.mark_lost();
                }
            }
            _ => self.failures.store(0, Ordering::SeqCst),
        }
        result
    }
}
