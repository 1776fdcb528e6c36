use crate::coordinator::CoordinatorEvent;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use relayplay_core::{IceCandidate, PeerId, Role, SessionDescription};
use tokio::sync::mpsc;

/// Connectivity as reported by the platform's peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Callbacks of a peer-connection primitive, turned into queue messages.
#[derive(Debug, Clone)]
pub enum PrimitiveEvent {
    StateChanged(LinkState),
    /// A local candidate was gathered and must be sent to the remote peer.
    LocalCandidate(IceCandidate),
    ChannelOpen,
    Message(Bytes),
    Error(String),
}

/// The platform peer connection. Owned by exactly one coordinator.
#[async_trait]
pub trait PeerConnectionPrimitive: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: &SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: &SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()>;

    /// Write one frame to the data channel.
    async fn send(&self, data: Bytes) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait PrimitiveFactory: Send + Sync {
    async fn create(
        &self,
        remote: PeerId,
        role: Role,
        events: PrimitiveEvents,
    ) -> Result<Box<dyn PeerConnectionPrimitive>>;
}

/// Handed to a primitive at creation; every callback it fires lands on the
/// owning coordinator's queue.
#[derive(Clone)]
pub struct PrimitiveEvents {
    tx: mpsc::UnboundedSender<CoordinatorEvent>,
}

impl PrimitiveEvents {
    pub(crate) fn new(tx: mpsc::UnboundedSender<CoordinatorEvent>) -> Self {
        Self { tx }
    }

    /// Returns false once the coordinator has stopped.
    pub fn emit(&self, event: PrimitiveEvent) -> bool {
        self.tx.send(CoordinatorEvent::Primitive(event)).is_ok()
    }
}
