use crate::coordinator::ConnectionState;
use relayplay_core::{ChannelError, EnvelopeError, PeerId, RoomId, SignalKind};
use thiserror::Error;

/// Why an inbound signal was dropped instead of applied.
///
/// Drops are logged and reported to the status listener; they never fail the
/// coordinator that saw them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalDrop {
    #[error("stale {kind} for a terminated connection")]
    StaleSignal { kind: SignalKind },

    #[error("duplicate answer")]
    DuplicateAnswer,

    #[error("duplicate offer")]
    DuplicateOffer,

    #[error("unsolicited {kind}")]
    Unsolicited { kind: SignalKind },

    #[error("{kind} belongs to another negotiation")]
    ForeignNegotiation { kind: SignalKind },

    #[error("room {room} is not open here")]
    UnknownRoom { room: RoomId },

    #[error("no connection for {from} in room {room} ({kind})")]
    UnknownPeer {
        room: RoomId,
        from: PeerId,
        kind: SignalKind,
    },

    #[error("envelope addressed to {to}")]
    Misaddressed { to: PeerId },

    #[error("malformed {kind} payload: {reason}")]
    Malformed { kind: SignalKind, reason: String },
}

impl SignalDrop {
    pub(crate) fn malformed(kind: SignalKind, err: EnvelopeError) -> Self {
        Self::Malformed {
            kind,
            reason: err.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: ConnectionState,
    },

    #[error("peer connection failed: {0}")]
    Primitive(String),

    #[error("coordinator for {0} has stopped")]
    Stopped(PeerId),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("room {0} is not open")]
    UnknownRoom(RoomId),

    #[error("room {0} is already open")]
    RoomExists(RoomId),

    #[error("room {0} must require at least one guest")]
    NoRequiredPlayers(RoomId),

    #[error("room {room} already has its {required} players")]
    RoomFull { room: RoomId, required: usize },

    #[error("{peer} already has a connection in room {room}")]
    SlotOccupied { room: RoomId, peer: PeerId },

    #[error("only the host of room {0} can invite guests")]
    NotHost(RoomId),

    #[error("failed to create peer connection: {0}")]
    Primitive(String),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("relay is closed")]
    Closed,

    #[error("failed to encode envelope: {0}")]
    Encode(#[from] EnvelopeError),

    #[error("relay rejected envelope: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(&'static str),
}
