use crate::error::TransportError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use relayplay_core::{PeerId, RoomId, SignalingEnvelope};

/// The relay that carries envelopes between peers of a room.
///
/// Delivery is best effort and unacknowledged. Nothing above this trait
/// waits for a reply; lost envelopes are covered by the coordinator timers.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn publish(&self, envelope: SignalingEnvelope) -> Result<(), TransportError>;

    /// Envelopes of `room` addressed to `recipient`, in relay order.
    fn subscribe(&self, room: &RoomId, recipient: PeerId) -> BoxStream<'static, SignalingEnvelope>;
}
