use crate::coordinator::machine::{ConnectionState, PeerConnection, Termination};
use crate::coordinator::timer::TimerId;
use crate::error::{CoordinatorError, SignalDrop};
use crate::transport::PrimitiveEvent;
use bytes::Bytes;
use relayplay_core::{
    IceCandidate, NegotiationId, PeerId, Role, RoomId, SessionDescription, SignalingEnvelope,
};
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Everything a coordinator reacts to. Processed one at a time, in queue order.
#[derive(Debug)]
pub enum CoordinatorEvent {
    CreateOffer {
        reply: oneshot::Sender<Result<SessionDescription, CoordinatorError>>,
    },
    /// A raw envelope from the relay, decoded by the coordinator.
    Signal(SignalingEnvelope),
    ApplyAnswer {
        answer: SessionDescription,
        negotiation: Option<NegotiationId>,
    },
    RemoteCandidate {
        candidate: IceCandidate,
        negotiation: Option<NegotiationId>,
    },
    Primitive(PrimitiveEvent),
    TimerFired(TimerId),
    Dispose,
    Close,
    Send(Bytes),
}

/// Read-only view of a coordinator, published after every event.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorSnapshot {
    pub room: RoomId,
    pub remote_id: PeerId,
    pub role: Role,
    pub state: ConnectionState,
    pub negotiation: Option<NegotiationId>,
    pub waiting_for_answer: bool,
    pub grace_deadline: Option<Instant>,
    pub created_at: Option<Instant>,
    pub pending_candidates: usize,
    pub armed_timers: usize,
    pub termination: Option<Termination>,
}

impl CoordinatorSnapshot {
    pub(crate) fn capture(room: &RoomId, pc: &PeerConnection, armed_timers: usize) -> Self {
        Self {
            room: room.clone(),
            remote_id: pc.id(),
            role: pc.role(),
            state: pc.state(),
            negotiation: pc.negotiation(),
            waiting_for_answer: pc.waiting_for_answer(),
            grace_deadline: pc.grace_deadline(),
            created_at: pc.created_at(),
            pending_candidates: pc.pending_candidates(),
            armed_timers,
            termination: pc.termination().cloned(),
        }
    }

    pub fn dispose_pending(&self) -> bool {
        self.grace_deadline.is_some()
    }

    /// Terminal and with no timer left that could still fire.
    pub fn is_settled(&self) -> bool {
        self.state.is_terminal() && self.armed_timers == 0
    }
}

/// The single upward channel of a coordinator.
///
/// Called from the coordinator's task, so implementations must not block.
pub trait StatusListener: Send + Sync + 'static {
    fn on_status(&self, snapshot: &CoordinatorSnapshot);

    fn on_drop(&self, _room: &RoomId, _remote: &PeerId, _reason: &SignalDrop) {}
}
