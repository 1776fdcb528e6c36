use crate::error::SignalDrop;
use relayplay_core::{IceCandidate, NegotiationId, PeerId, Role, SignalKind};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    Idle,
    OfferCreated,
    AwaitingAnswer,
    /// Remote description applied, waiting for the primitive to report connectivity.
    ConnectivityPending,
    Connected,
    Closed,
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::OfferCreated => "offer-created",
            ConnectionState::AwaitingAnswer => "awaiting-answer",
            ConnectionState::ConnectivityPending => "connectivity-pending",
            ConnectionState::Connected => "connected",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CloseReason {
    /// The dispose request was honoured (immediately or after the grace window).
    Disposed,
    Explicit,
    Timeout,
    RemoteBye,
    PeerLeft,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Termination {
    Closed(CloseReason),
    Failed(String),
}

impl Termination {
    /// Terminations that leave the slot in an error state for the room.
    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            Termination::Failed(_) | Termination::Closed(CloseReason::Timeout)
        )
    }

    pub fn state(&self) -> ConnectionState {
        match self {
            Termination::Closed(_) => ConnectionState::Closed,
            Termination::Failed(_) => ConnectionState::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Idle,
    OfferCreated,
    /// `grace_deadline` is set once a dispose request has been deferred.
    AwaitingAnswer { grace_deadline: Option<Instant> },
    ConnectivityPending,
    Connected,
    Terminated(Termination),
}

/// What to do with an inbound remote candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateAction {
    Forward(IceCandidate),
    Queued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisposeDecision {
    /// Keep the connection; close at `deadline` unless an answer comes first.
    Defer { deadline: Instant },
    CloseNow,
    AlreadyPending,
    AlreadyTerminated,
}

/// Connection state for one peer pair.
///
/// Pure value type: every transition is a method call, the owning coordinator
/// performs the side effects each transition asks for.
#[derive(Debug, Clone)]
pub struct PeerConnection {
    id: PeerId,
    role: Role,
    phase: Phase,
    created_at: Option<Instant>,
    negotiation: Option<NegotiationId>,
    remote_description_set: bool,
    pending_candidates: VecDeque<IceCandidate>,
}

impl PeerConnection {
    pub fn new(id: PeerId, role: Role) -> Self {
        Self {
            id,
            role,
            phase: Phase::Idle,
            created_at: None,
            negotiation: None,
            remote_description_set: false,
            pending_candidates: VecDeque::new(),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        match &self.phase {
            Phase::Idle => ConnectionState::Idle,
            Phase::OfferCreated => ConnectionState::OfferCreated,
            Phase::AwaitingAnswer { .. } => ConnectionState::AwaitingAnswer,
            Phase::ConnectivityPending => ConnectionState::ConnectivityPending,
            Phase::Connected => ConnectionState::Connected,
            Phase::Terminated(t) => t.state(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, Phase::Terminated(_))
    }

    pub fn waiting_for_answer(&self) -> bool {
        matches!(self.phase, Phase::AwaitingAnswer { .. })
    }

    pub fn grace_deadline(&self) -> Option<Instant> {
        match self.phase {
            Phase::AwaitingAnswer { grace_deadline } => grace_deadline,
            _ => None,
        }
    }

    pub fn dispose_pending(&self) -> bool {
        self.grace_deadline().is_some()
    }

    pub fn created_at(&self) -> Option<Instant> {
        self.created_at
    }

    pub fn negotiation(&self) -> Option<NegotiationId> {
        self.negotiation
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn termination(&self) -> Option<&Termination> {
        match &self.phase {
            Phase::Terminated(t) => Some(t),
            _ => None,
        }
    }

    /// Idle → OfferCreated. Returns false from any other state.
    pub fn offer_created(&mut self, negotiation: NegotiationId, now: Instant) -> bool {
        if self.role != Role::Host || self.phase != Phase::Idle {
            return false;
        }
        self.phase = Phase::OfferCreated;
        self.created_at = Some(now);
        self.negotiation = Some(negotiation);
        true
    }

    /// OfferCreated → AwaitingAnswer, once the offer is the local description.
    pub fn local_offer_applied(&mut self) -> bool {
        if self.phase != Phase::OfferCreated {
            return false;
        }
        self.phase = Phase::AwaitingAnswer {
            grace_deadline: None,
        };
        true
    }

    /// Checks whether an answer may be applied right now.
    pub fn check_answer(&self, negotiation: Option<NegotiationId>) -> Result<(), SignalDrop> {
        match self.phase {
            Phase::Terminated(_) => Err(SignalDrop::StaleSignal {
                kind: SignalKind::Answer,
            }),
            Phase::ConnectivityPending | Phase::Connected => Err(SignalDrop::DuplicateAnswer),
            Phase::Idle | Phase::OfferCreated => Err(SignalDrop::Unsolicited {
                kind: SignalKind::Answer,
            }),
            Phase::AwaitingAnswer { .. } => self.check_negotiation(SignalKind::Answer, negotiation),
        }
    }

    /// Checks whether a remote offer may be applied right now.
    pub fn check_offer(&self) -> Result<(), SignalDrop> {
        match self.phase {
            Phase::Terminated(_) => Err(SignalDrop::StaleSignal {
                kind: SignalKind::Offer,
            }),
            Phase::Idle if self.role == Role::Guest => Ok(()),
            Phase::Idle => Err(SignalDrop::Unsolicited {
                kind: SignalKind::Offer,
            }),
            _ => Err(SignalDrop::DuplicateOffer),
        }
    }

    /// Checks whether a remote bye ends this connection. A bye naming a
    /// negotiation this connection never took part in is foreign.
    pub fn check_bye(&self, negotiation: Option<NegotiationId>) -> Result<(), SignalDrop> {
        if self.is_terminal() {
            return Err(SignalDrop::StaleSignal {
                kind: SignalKind::Bye,
            });
        }
        match (self.negotiation, negotiation) {
            (None, Some(_)) => Err(SignalDrop::ForeignNegotiation {
                kind: SignalKind::Bye,
            }),
            _ => self.check_negotiation(SignalKind::Bye, negotiation),
        }
    }

    /// Guest side: remembers the host's negotiation id and the start of the
    /// exchange before the answer is produced.
    pub fn offer_received(&mut self, negotiation: Option<NegotiationId>, now: Instant) {
        if self.phase == Phase::Idle {
            self.negotiation = negotiation;
            self.created_at = Some(now);
        }
    }

    /// Records that the remote description has been applied and hands back the
    /// queued candidates in arrival order. The queue is drained exactly once.
    pub fn remote_description_applied(&mut self) -> Vec<IceCandidate> {
        if self.remote_description_set || self.is_terminal() {
            return Vec::new();
        }
        self.remote_description_set = true;
        if matches!(self.phase, Phase::AwaitingAnswer { .. } | Phase::Idle) {
            self.phase = Phase::ConnectivityPending;
        }
        self.pending_candidates.drain(..).collect()
    }

    pub fn accept_candidate(
        &mut self,
        candidate: IceCandidate,
        negotiation: Option<NegotiationId>,
    ) -> Result<CandidateAction, SignalDrop> {
        if self.is_terminal() {
            return Err(SignalDrop::StaleSignal {
                kind: SignalKind::Candidate,
            });
        }
        self.check_negotiation(SignalKind::Candidate, negotiation)?;

        if self.remote_description_set {
            Ok(CandidateAction::Forward(candidate))
        } else {
            self.pending_candidates.push_back(candidate);
            Ok(CandidateAction::Queued)
        }
    }

    /// Decides how to honour a dispose request made at `now`.
    pub fn request_dispose(&mut self, now: Instant, grace_period: Duration) -> DisposeDecision {
        match self.phase {
            Phase::Terminated(_) => DisposeDecision::AlreadyTerminated,
            Phase::AwaitingAnswer {
                grace_deadline: Some(_),
            } => DisposeDecision::AlreadyPending,
            Phase::AwaitingAnswer {
                grace_deadline: None,
            } => {
                let elapsed = self
                    .created_at
                    .map(|created| now.saturating_duration_since(created))
                    .unwrap_or_default();
                if elapsed >= grace_period {
                    return DisposeDecision::CloseNow;
                }
                let deadline = now + grace_period;
                self.phase = Phase::AwaitingAnswer {
                    grace_deadline: Some(deadline),
                };
                DisposeDecision::Defer { deadline }
            }
            _ => DisposeDecision::CloseNow,
        }
    }

    /// ConnectivityPending → Connected.
    pub fn connectivity_confirmed(&mut self) -> bool {
        if self.phase != Phase::ConnectivityPending {
            return false;
        }
        self.phase = Phase::Connected;
        true
    }

    /// Enters a terminal state. Only the first call has an effect.
    pub fn terminate(&mut self, termination: Termination) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.phase = Phase::Terminated(termination);
        self.pending_candidates.clear();
        true
    }

    fn check_negotiation(
        &self,
        kind: SignalKind,
        negotiation: Option<NegotiationId>,
    ) -> Result<(), SignalDrop> {
        match (self.negotiation, negotiation) {
            (Some(ours), Some(theirs)) if ours != theirs => {
                Err(SignalDrop::ForeignNegotiation { kind })
            }
            _ => Ok(()),
        }
    }
}
