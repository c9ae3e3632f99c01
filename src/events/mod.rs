//! Event infrastructure.
//!
//! Inbound: agents push kernel lifecycle notifications which drive the state
//! machine. Outbound: the core anycasts cluster events (endpoint route
//! updates) to whoever is listening, through an injected producer.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::state::KernelStatus;
use crate::types::{EndpointId, Error, KernelId, Result};

/// Lifecycle notification pushed by an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelLifecycleEvent {
    pub kernel_id: KernelId,
    pub kind: KernelEventKind,
    pub reason: Option<String>,
    pub exit_code: Option<i32>,
}

impl KernelLifecycleEvent {
    pub fn new(kernel_id: KernelId, kind: KernelEventKind) -> Self {
        Self {
            kernel_id,
            kind,
            reason: None,
            exit_code: None,
        }
    }
}

/// Which lifecycle edge the agent reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KernelEventKind {
    Preparing,
    Pulling,
    Prepared,
    Creating,
    Started,
    Terminated,
}

impl KernelEventKind {
    /// The kernel status this event drives the state machine towards.
    pub fn target_status(self) -> KernelStatus {
        match self {
            KernelEventKind::Preparing => KernelStatus::Preparing,
            KernelEventKind::Pulling => KernelStatus::Pulling,
            KernelEventKind::Prepared => KernelStatus::Prepared,
            KernelEventKind::Creating => KernelStatus::Creating,
            KernelEventKind::Started => KernelStatus::Running,
            KernelEventKind::Terminated => KernelStatus::Terminated,
        }
    }
}

/// Events the core publishes for external collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterEvent {
    /// An inference endpoint's backing routes changed; the proxy must
    /// reload its route list.
    EndpointRouteListUpdated(EndpointId),
}

/// Outbound event seam.
#[async_trait]
pub trait EventProducer: Send + Sync + fmt::Debug {
    /// Deliver the event to exactly one consumer.
    async fn anycast(&self, event: ClusterEvent) -> Result<()>;
}

/// Channel-backed producer: events land on an mpsc the embedding process
/// drains.
#[derive(Debug)]
pub struct ChannelEventProducer {
    tx: mpsc::UnboundedSender<ClusterEvent>,
}

impl ChannelEventProducer {
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<ClusterEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl EventProducer for ChannelEventProducer {
    async fn anycast(&self, event: ClusterEvent) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|e| Error::internal(format!("event bus closed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kinds_map_to_statuses() {
        assert_eq!(
            KernelEventKind::Started.target_status(),
            KernelStatus::Running
        );
        assert_eq!(
            KernelEventKind::Terminated.target_status(),
            KernelStatus::Terminated
        );
        assert_eq!(
            KernelEventKind::Preparing.target_status(),
            KernelStatus::Preparing
        );
    }

    #[tokio::test]
    async fn channel_producer_delivers() {
        let (producer, mut rx) = ChannelEventProducer::channel();
        let endpoint = EndpointId::new();
        producer
            .anycast(ClusterEvent::EndpointRouteListUpdated(endpoint.clone()))
            .await
            .unwrap();
        assert_eq!(
            rx.recv().await,
            Some(ClusterEvent::EndpointRouteListUpdated(endpoint))
        );
    }
}
