use crate::error::TransportError;
use crate::signaling::SignalingTransport;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use futures::stream::BoxStream;
use relayplay_core::{PeerId, RoomId, SignalingEnvelope};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, warn};

pub const DEFAULT_RELAY_CAPACITY: usize = 256;

type Rooms = Arc<DashMap<RoomId, broadcast::Sender<Arc<str>>>>;

struct RelayInner {
    rooms: Rooms,
    capacity: usize,
    delayed: Option<(Duration, mpsc::UnboundedSender<(Instant, RoomId, Arc<str>)>)>,
}

/// In-process relay: one broadcast channel per room, envelopes travel as
/// JSON text like they would over a socket.
#[derive(Clone)]
pub struct LocalRelay {
    inner: Arc<RelayInner>,
}

impl LocalRelay {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_RELAY_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                rooms: Arc::new(DashMap::new()),
                capacity,
                delayed: None,
            }),
        }
    }

    /// Delays every delivery by `latency`, keeping publish order.
    ///
    /// Spawns the delivery task, so it must be called inside a tokio runtime.
    pub fn with_latency(latency: Duration) -> Self {
        let rooms: Rooms = Arc::new(DashMap::new());
        let (tx, mut rx) = mpsc::unbounded_channel::<(Instant, RoomId, Arc<str>)>();

        let delivery_rooms = rooms.clone();
        tokio::spawn(async move {
            while let Some((due, room, text)) = rx.recv().await {
                tokio::time::sleep_until(due).await;
                if let Some(sender) = delivery_rooms.get(&room) {
                    let _ = sender.send(text);
                }
            }
        });

        Self {
            inner: Arc::new(RelayInner {
                rooms,
                capacity: DEFAULT_RELAY_CAPACITY,
                delayed: Some((latency, tx)),
            }),
        }
    }

    pub fn subscriber_count(&self, room: &RoomId) -> usize {
        self.inner
            .rooms
            .get(room)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    fn room_sender(&self, room: &RoomId) -> broadcast::Sender<Arc<str>> {
        self.inner
            .rooms
            .entry(room.clone())
            .or_insert_with(|| broadcast::channel(self.inner.capacity).0)
            .clone()
    }
}

impl Default for LocalRelay {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignalingTransport for LocalRelay {
    async fn publish(&self, envelope: SignalingEnvelope) -> Result<(), TransportError> {
        if envelope.from() == envelope.to() {
            return Err(TransportError::Rejected(format!(
                "{} envelope addressed to its own sender",
                envelope.kind()
            )));
        }

        let text: Arc<str> = envelope.to_json()?.into();
        let room = envelope.room().clone();
        let sender = self.room_sender(&room);

        match &self.inner.delayed {
            Some((latency, tx)) => tx
                .send((Instant::now() + *latency, room, text))
                .map_err(|_| TransportError::Closed)?,
            None => {
                if sender.send(text).is_err() {
                    debug!("Room {}: no subscribers, {} envelope lost", room, envelope.kind());
                }
            }
        }
        Ok(())
    }

    fn subscribe(&self, room: &RoomId, recipient: PeerId) -> BoxStream<'static, SignalingEnvelope> {
        let rx = self.room_sender(room).subscribe();
        let room = room.clone();

        futures::stream::unfold(rx, move |mut rx| {
            let room = room.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(text) => match SignalingEnvelope::from_json(&text) {
                            Ok(envelope) if *envelope.to() == recipient => {
                                return Some((envelope, rx));
                            }
                            Ok(_) => continue,
                            Err(e) => warn!("Room {}: unreadable envelope on relay: {}", room, e),
                        },
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Room {}: subscriber for {} lagged, {} envelopes skipped", room, recipient, skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        })
        .boxed()
    }
}
