use crate::channel::DataChannelRouter;
use crate::config::SessionConfig;
use crate::coordinator::event::{CoordinatorEvent, CoordinatorSnapshot, StatusListener};
use crate::coordinator::machine::{
    CandidateAction, CloseReason, ConnectionState, DisposeDecision, PeerConnection, Termination,
};
use crate::coordinator::timer::{TimerId, TimerKind, TimerWheel, Timers};
use crate::error::{CoordinatorError, SignalDrop};
use crate::signaling::SignalingTransport;
use crate::transport::{
    LinkState, PeerConnectionPrimitive, PrimitiveEvent, PrimitiveEvents, PrimitiveFactory,
};
use bytes::Bytes;
use relayplay_core::{
    ByePayload, CandidatePayload, ChannelMessage, DescriptionPayload, EnvelopeError, IceCandidate,
    NegotiationId, PeerId, Role, RoomId, SdpKind, SessionDescription, SignalKind,
    SignalingEnvelope,
};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Collaborators shared by every coordinator of one room.
#[derive(Clone)]
pub struct CoordinatorContext {
    pub room: RoomId,
    pub local_id: PeerId,
    pub config: SessionConfig,
    pub transport: Arc<dyn SignalingTransport>,
    pub router: Arc<DataChannelRouter>,
    pub listener: Arc<dyn StatusListener>,
}

/// Drives one peer connection: the state machine, its primitive, its timers.
///
/// Runs as a single task over one ordered queue, so none of its fields is
/// ever touched concurrently. Talk to it through [`CoordinatorHandle`].
pub struct ConnectionCoordinator {
    ctx: CoordinatorContext,
    connection: PeerConnection,
    primitive: Box<dyn PeerConnectionPrimitive>,
    timers: Timers,
    wheel: TimerWheel,
    events_rx: mpsc::UnboundedReceiver<CoordinatorEvent>,
    snapshot_tx: watch::Sender<CoordinatorSnapshot>,
}

impl ConnectionCoordinator {
    pub async fn new(
        ctx: CoordinatorContext,
        remote: PeerId,
        role: Role,
        primitives: &dyn PrimitiveFactory,
    ) -> Result<(Self, CoordinatorHandle), CoordinatorError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let primitive = primitives
            .create(remote, role, PrimitiveEvents::new(events_tx.clone()))
            .await
            .map_err(|e| CoordinatorError::Primitive(format!("{e:#}")))?;

        let connection = PeerConnection::new(remote, role);
        let (snapshot_tx, snapshot_rx) =
            watch::channel(CoordinatorSnapshot::capture(&ctx.room, &connection, 0));

        let handle = CoordinatorHandle {
            remote_id: remote,
            events: events_tx.clone(),
            snapshot: snapshot_rx,
        };

        let coordinator = Self {
            ctx,
            connection,
            primitive,
            timers: Timers::default(),
            wheel: TimerWheel::new(events_tx),
            events_rx,
            snapshot_tx,
        };

        Ok((coordinator, handle))
    }

    /// Processes events until the connection is closed or failed. Returns
    /// only after every timer has been cancelled.
    pub async fn run(mut self) -> Termination {
        info!(
            "Room {}: coordinator for {} ({}) started",
            self.ctx.room,
            self.remote(),
            self.connection.role()
        );

        let termination = loop {
            let Some(event) = self.events_rx.recv().await else {
                // Unreachable while the timer wheel holds a sender.
                self.terminate(Termination::Closed(CloseReason::Explicit))
                    .await;
                self.publish();
                break self.final_termination();
            };

            self.handle_event(event).await;
            self.publish();

            if self.connection.is_terminal() {
                break self.final_termination();
            }
        };

        self.events_rx.close();
        while let Ok(event) = self.events_rx.try_recv() {
            self.discard(event);
        }

        info!(
            "Room {}: coordinator for {} finished: {:?}",
            self.ctx.room,
            self.remote(),
            termination
        );
        termination
    }

    /// Releases the primitive of a coordinator that was never run.
    pub(crate) async fn abandon(self) {
        if let Err(e) = self.primitive.close().await {
            warn!(
                "Room {}: failed to close unused primitive for {}: {:#}",
                self.ctx.room,
                self.remote(),
                e
            );
        }
    }

    fn remote(&self) -> PeerId {
        self.connection.id()
    }

    fn final_termination(&self) -> Termination {
        self.connection
            .termination()
            .cloned()
            .unwrap_or(Termination::Closed(CloseReason::Explicit))
    }

    async fn handle_event(&mut self, event: CoordinatorEvent) {
        match event {
            CoordinatorEvent::CreateOffer { reply } => {
                let result = self.create_offer().await;
                self.publish();
                let _ = reply.send(result);
            }
            CoordinatorEvent::Signal(envelope) => self.on_signal(envelope).await,
            CoordinatorEvent::ApplyAnswer {
                answer,
                negotiation,
            } => self.apply_answer(answer, negotiation).await,
            CoordinatorEvent::RemoteCandidate {
                candidate,
                negotiation,
            } => self.add_remote_candidate(candidate, negotiation).await,
            CoordinatorEvent::Primitive(event) => self.on_primitive(event).await,
            CoordinatorEvent::TimerFired(id) => self.on_timer(id).await,
            CoordinatorEvent::Dispose => self.request_dispose().await,
            CoordinatorEvent::Close => {
                self.terminate(Termination::Closed(CloseReason::Explicit))
                    .await
            }
            CoordinatorEvent::Send(data) => self.send(data).await,
        }
    }

    async fn create_offer(&mut self) -> Result<SessionDescription, CoordinatorError> {
        let state = self.connection.state();
        if state != ConnectionState::Idle || self.connection.role() != Role::Host {
            return Err(CoordinatorError::InvalidState {
                operation: "create an offer",
                state,
            });
        }

        let offer = match self.primitive.create_offer().await {
            Ok(offer) => offer,
            Err(e) => return Err(self.primitive_failed("create offer", e).await),
        };

        let negotiation = NegotiationId::new();
        let created_at = Instant::now();
        self.connection.offer_created(negotiation, created_at);
        self.publish();

        if let Err(e) = self.primitive.set_local_description(&offer).await {
            return Err(self.primitive_failed("set local offer", e).await);
        }
        self.connection.local_offer_applied();
        self.timers.connection = Some(self.wheel.arm(
            TimerKind::ConnectionTimeout,
            created_at + self.ctx.config.connection_timeout,
        ));

        let payload = DescriptionPayload {
            description: offer.clone(),
            negotiation: Some(negotiation),
        };
        self.publish_signal(SignalingEnvelope::offer(
            self.ctx.room.clone(),
            self.ctx.local_id,
            self.remote(),
            &payload,
        ))
        .await;

        info!(
            "Room {}: offer sent to {}, awaiting answer",
            self.ctx.room,
            self.remote()
        );
        Ok(offer)
    }

    async fn on_signal(&mut self, envelope: SignalingEnvelope) {
        if envelope.to() != &self.ctx.local_id {
            self.dropped(SignalDrop::Misaddressed { to: *envelope.to() });
            return;
        }
        if envelope.from() != &self.remote() {
            self.dropped(SignalDrop::UnknownPeer {
                room: envelope.room().clone(),
                from: *envelope.from(),
                kind: envelope.kind(),
            });
            return;
        }

        let kind = envelope.kind();
        match kind {
            SignalKind::Offer => match envelope.description() {
                Ok(payload) => self.apply_offer(payload).await,
                Err(e) => self.dropped(SignalDrop::malformed(kind, e)),
            },
            SignalKind::Answer => match envelope.description() {
                Ok(payload) => {
                    self.apply_answer(payload.description, payload.negotiation)
                        .await
                }
                Err(e) => self.dropped(SignalDrop::malformed(kind, e)),
            },
            SignalKind::Candidate => match envelope.candidate_payload() {
                Ok(payload) => {
                    self.add_remote_candidate(payload.candidate, payload.negotiation)
                        .await
                }
                Err(e) => self.dropped(SignalDrop::malformed(kind, e)),
            },
            SignalKind::Bye => match envelope.bye_payload() {
                Ok(payload) => self.on_bye(payload.negotiation).await,
                Err(e) => self.dropped(SignalDrop::malformed(kind, e)),
            },
        }
    }

    async fn on_bye(&mut self, negotiation: Option<NegotiationId>) {
        if let Err(reason) = self.connection.check_bye(negotiation) {
            self.dropped(reason);
            return;
        }
        info!("Room {}: {} said bye", self.ctx.room, self.remote());
        self.terminate(Termination::Closed(CloseReason::RemoteBye))
            .await;
    }

    /// Guest side of the exchange: apply the host's offer and answer it.
    async fn apply_offer(&mut self, payload: DescriptionPayload) {
        if let Err(reason) = self.connection.check_offer() {
            self.dropped(reason);
            return;
        }

        let created_at = Instant::now();
        self.connection
            .offer_received(payload.negotiation, created_at);

        if let Err(e) = self
            .primitive
            .set_remote_description(&payload.description)
            .await
        {
            self.primitive_failed("apply remote offer", e).await;
            return;
        }
        let pending = self.connection.remote_description_applied();
        self.flush_candidates(pending).await;

        let answer = match self.primitive.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                self.primitive_failed("create answer", e).await;
                return;
            }
        };
        if let Err(e) = self.primitive.set_local_description(&answer).await {
            self.primitive_failed("set local answer", e).await;
            return;
        }

        self.timers.connection = Some(self.wheel.arm(
            TimerKind::ConnectionTimeout,
            created_at + self.ctx.config.connection_timeout,
        ));

        let reply = DescriptionPayload {
            description: answer,
            negotiation: payload.negotiation,
        };
        self.publish_signal(SignalingEnvelope::answer(
            self.ctx.room.clone(),
            self.ctx.local_id,
            self.remote(),
            &reply,
        ))
        .await;

        info!("Room {}: answered offer from {}", self.ctx.room, self.remote());
    }

    async fn apply_answer(
        &mut self,
        answer: SessionDescription,
        negotiation: Option<NegotiationId>,
    ) {
        if let Err(reason) = self.connection.check_answer(negotiation) {
            self.dropped(reason);
            return;
        }
        if answer.kind != SdpKind::Answer {
            self.dropped(SignalDrop::Malformed {
                kind: SignalKind::Answer,
                reason: "description is not an answer".to_owned(),
            });
            return;
        }

        if let Err(e) = self.primitive.set_remote_description(&answer).await {
            self.primitive_failed("apply remote answer", e).await;
            return;
        }

        let was_pending = self.connection.dispose_pending();
        self.timers.cancel_grace();
        let pending = self.connection.remote_description_applied();
        self.flush_candidates(pending).await;

        if was_pending {
            info!(
                "Room {}: answer from {} arrived within the grace period, dispose cancelled",
                self.ctx.room,
                self.remote()
            );
        } else {
            info!("Room {}: answer from {} applied", self.ctx.room, self.remote());
        }
    }

    async fn add_remote_candidate(
        &mut self,
        candidate: IceCandidate,
        negotiation: Option<NegotiationId>,
    ) {
        match self.connection.accept_candidate(candidate, negotiation) {
            Err(reason) => self.dropped(reason),
            Ok(CandidateAction::Queued) => debug!(
                "Room {}: queued candidate from {} ({} pending)",
                self.ctx.room,
                self.remote(),
                self.connection.pending_candidates()
            ),
            Ok(CandidateAction::Forward(candidate)) => self.forward_candidate(&candidate).await,
        }
    }

    async fn flush_candidates(&mut self, pending: Vec<IceCandidate>) {
        if pending.is_empty() {
            return;
        }
        debug!(
            "Room {}: flushing {} queued candidates for {}",
            self.ctx.room,
            pending.len(),
            self.remote()
        );
        for candidate in &pending {
            self.forward_candidate(candidate).await;
        }
    }

    async fn forward_candidate(&self, candidate: &IceCandidate) {
        if let Err(e) = self.primitive.add_ice_candidate(candidate).await {
            warn!(
                "Room {}: failed to add candidate from {}: {:#}",
                self.ctx.room,
                self.remote(),
                e
            );
        }
    }

    async fn on_primitive(&mut self, event: PrimitiveEvent) {
        if self.connection.is_terminal() {
            debug!(
                "Room {}: ignoring primitive event for closed connection {}: {:?}",
                self.ctx.room,
                self.remote(),
                event
            );
            return;
        }

        match event {
            PrimitiveEvent::StateChanged(LinkState::Connected) => {
                if self.connection.connectivity_confirmed() {
                    self.timers.cancel_connection();
                    info!("Room {}: connected to {}", self.ctx.room, self.remote());
                } else {
                    debug!(
                        "Room {}: link to {} up while {}",
                        self.ctx.room,
                        self.remote(),
                        self.connection.state()
                    );
                }
            }
            PrimitiveEvent::StateChanged(LinkState::Failed) => {
                self.on_primitive_error("peer connection failed".to_owned())
                    .await;
            }
            PrimitiveEvent::StateChanged(LinkState::Disconnected) => {
                if self.connection.state() == ConnectionState::Connected {
                    self.terminate(Termination::Closed(CloseReason::PeerLeft))
                        .await;
                }
            }
            PrimitiveEvent::StateChanged(LinkState::Closed) => {
                self.terminate(Termination::Closed(CloseReason::PeerLeft))
                    .await;
            }
            PrimitiveEvent::StateChanged(state) => {
                debug!("Room {}: link to {} is {:?}", self.ctx.room, self.remote(), state);
            }
            PrimitiveEvent::LocalCandidate(candidate) => {
                let payload = CandidatePayload {
                    candidate,
                    negotiation: self.connection.negotiation(),
                };
                self.publish_signal(SignalingEnvelope::candidate(
                    self.ctx.room.clone(),
                    self.ctx.local_id,
                    self.remote(),
                    &payload,
                ))
                .await;
            }
            PrimitiveEvent::ChannelOpen => {
                info!("Room {}: data channel to {} open", self.ctx.room, self.remote());
            }
            PrimitiveEvent::Message(data) => {
                if self.connection.state() == ConnectionState::Connected {
                    let outcome = self.ctx.router.route(&self.remote(), &data);
                    debug!("Room {}: routed frame from {}: {:?}", self.ctx.room, self.remote(), outcome);
                } else {
                    warn!(
                        "Room {}: dropping {} byte frame from {} while {}",
                        self.ctx.room,
                        data.len(),
                        self.remote(),
                        self.connection.state()
                    );
                }
            }
            PrimitiveEvent::Error(reason) => self.on_primitive_error(reason).await,
        }
    }

    async fn on_timer(&mut self, id: TimerId) {
        let Some(timer) = self.timers.take_fired(id) else {
            debug!("Room {}: ignoring stale timer {}", self.ctx.room, id);
            return;
        };

        match timer.kind() {
            TimerKind::ConnectionTimeout => warn!(
                "Room {}: connection to {} timed out while {}",
                self.ctx.room,
                self.remote(),
                self.connection.state()
            ),
            TimerKind::GraceClose => info!(
                "Room {}: no answer from {} within the grace period, closing",
                self.ctx.room,
                self.remote()
            ),
        }
        self.terminate(Termination::Closed(CloseReason::Timeout))
            .await;
    }

    async fn request_dispose(&mut self) {
        let now = Instant::now();
        match self
            .connection
            .request_dispose(now, self.ctx.config.grace_period)
        {
            DisposeDecision::Defer { deadline } => {
                self.timers.grace = Some(self.wheel.arm(TimerKind::GraceClose, deadline));
                info!(
                    "Room {}: dispose of {} deferred for {:?} awaiting a late answer",
                    self.ctx.room,
                    self.remote(),
                    deadline - now
                );
            }
            DisposeDecision::CloseNow => {
                self.terminate(Termination::Closed(CloseReason::Disposed))
                    .await;
            }
            DisposeDecision::AlreadyPending => {
                debug!("Room {}: dispose of {} already pending", self.ctx.room, self.remote());
            }
            DisposeDecision::AlreadyTerminated => {
                debug!("Room {}: dispose of closed {}", self.ctx.room, self.remote());
            }
        }
    }

    async fn send(&self, data: Bytes) {
        if self.connection.state() != ConnectionState::Connected {
            warn!(
                "Room {}: not connected to {}, dropping outbound frame",
                self.ctx.room,
                self.remote()
            );
            return;
        }
        if let Err(e) = self.primitive.send(data).await {
            warn!(
                "Room {}: failed to send to {}: {:#}",
                self.ctx.room,
                self.remote(),
                e
            );
        }
    }

    async fn on_primitive_error(&mut self, reason: String) {
        error!(
            "Room {}: peer connection to {} failed: {}",
            self.ctx.room,
            self.remote(),
            reason
        );
        self.terminate(Termination::Failed(reason)).await;
    }

    async fn primitive_failed(&mut self, step: &str, e: anyhow::Error) -> CoordinatorError {
        let reason = format!("{step}: {e:#}");
        self.on_primitive_error(reason.clone()).await;
        CoordinatorError::Primitive(reason)
    }

    /// Enters the terminal state once: cancels every timer, closes the
    /// primitive and tells the remote side unless it left first.
    async fn terminate(&mut self, termination: Termination) {
        let notify_remote = !matches!(
            termination,
            Termination::Closed(CloseReason::RemoteBye | CloseReason::PeerLeft)
        );
        if !self.connection.terminate(termination) {
            return;
        }
        self.timers.cancel_all();

        if let Err(e) = self.primitive.close().await {
            warn!(
                "Room {}: error closing connection to {}: {:#}",
                self.ctx.room,
                self.remote(),
                e
            );
        }

        if notify_remote {
            let payload = ByePayload {
                negotiation: self.connection.negotiation(),
            };
            self.publish_signal(SignalingEnvelope::bye(
                self.ctx.room.clone(),
                self.ctx.local_id,
                self.remote(),
                &payload,
            ))
            .await;
        }

        info!(
            "Room {}: connection to {} is {}",
            self.ctx.room,
            self.remote(),
            self.connection.state()
        );
    }

    /// Best effort: a lost envelope is recovered by the timeout and grace timers.
    async fn publish_signal(&self, envelope: Result<SignalingEnvelope, EnvelopeError>) {
        let envelope = match envelope {
            Ok(envelope) => envelope,
            Err(e) => {
                error!("Room {}: failed to build envelope: {}", self.ctx.room, e);
                return;
            }
        };
        let kind = envelope.kind();
        if let Err(e) = self.ctx.transport.publish(envelope).await {
            warn!(
                "Room {}: failed to publish {} to {}: {}",
                self.ctx.room,
                kind,
                self.remote(),
                e
            );
        }
    }

    fn dropped(&self, reason: SignalDrop) {
        warn!(
            "Room {}: dropped signal from {}: {}",
            self.ctx.room,
            self.remote(),
            reason
        );
        self.ctx
            .listener
            .on_drop(&self.ctx.room, &self.remote(), &reason);
    }

    fn discard(&self, event: CoordinatorEvent) {
        match event {
            CoordinatorEvent::CreateOffer { reply } => {
                let _ = reply.send(Err(CoordinatorError::InvalidState {
                    operation: "create an offer",
                    state: self.connection.state(),
                }));
            }
            CoordinatorEvent::Signal(envelope) if envelope.kind() != SignalKind::Bye => {
                self.dropped(SignalDrop::StaleSignal {
                    kind: envelope.kind(),
                });
            }
            CoordinatorEvent::ApplyAnswer { .. } => self.dropped(SignalDrop::StaleSignal {
                kind: SignalKind::Answer,
            }),
            CoordinatorEvent::RemoteCandidate { .. } => self.dropped(SignalDrop::StaleSignal {
                kind: SignalKind::Candidate,
            }),
            _ => {}
        }
    }

    fn publish(&self) {
        let snapshot =
            CoordinatorSnapshot::capture(&self.ctx.room, &self.connection, self.timers.armed());
        let changed = self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot.clone();
            true
        });
        if changed {
            self.ctx.listener.on_status(&snapshot);
        }
    }
}

/// Cloneable front of a running coordinator. Every method returns at once;
/// the work happens on the coordinator's own task.
#[derive(Clone)]
pub struct CoordinatorHandle {
    remote_id: PeerId,
    events: mpsc::UnboundedSender<CoordinatorEvent>,
    snapshot: watch::Receiver<CoordinatorSnapshot>,
}

impl CoordinatorHandle {
    pub fn remote_id(&self) -> PeerId {
        self.remote_id
    }

    pub async fn create_offer(&self) -> Result<SessionDescription, CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(CoordinatorEvent::CreateOffer { reply })
            .map_err(|_| CoordinatorError::Stopped(self.remote_id))?;
        rx.await
            .map_err(|_| CoordinatorError::Stopped(self.remote_id))?
    }

    /// Queues an envelope from the relay. Fails only when the coordinator is gone.
    pub fn deliver(&self, envelope: SignalingEnvelope) -> Result<(), SignalDrop> {
        let kind = envelope.kind();
        self.events
            .send(CoordinatorEvent::Signal(envelope))
            .map_err(|_| SignalDrop::StaleSignal { kind })
    }

    pub fn apply_answer(
        &self,
        answer: SessionDescription,
        negotiation: Option<NegotiationId>,
    ) -> Result<(), SignalDrop> {
        self.events
            .send(CoordinatorEvent::ApplyAnswer {
                answer,
                negotiation,
            })
            .map_err(|_| SignalDrop::StaleSignal {
                kind: SignalKind::Answer,
            })
    }

    pub fn add_remote_candidate(
        &self,
        candidate: IceCandidate,
        negotiation: Option<NegotiationId>,
    ) -> Result<(), SignalDrop> {
        self.events
            .send(CoordinatorEvent::RemoteCandidate {
                candidate,
                negotiation,
            })
            .map_err(|_| SignalDrop::StaleSignal {
                kind: SignalKind::Candidate,
            })
    }

    /// Never blocks. A coordinator that already stopped has nothing to dispose.
    pub fn request_dispose(&self) {
        let _ = self.events.send(CoordinatorEvent::Dispose);
    }

    pub fn close(&self) {
        let _ = self.events.send(CoordinatorEvent::Close);
    }

    pub fn send(&self, message: &ChannelMessage) -> Result<(), CoordinatorError> {
        let data = message.encode()?;
        self.events
            .send(CoordinatorEvent::Send(data))
            .map_err(|_| CoordinatorError::Stopped(self.remote_id))
    }

    pub fn snapshot(&self) -> CoordinatorSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.snapshot.borrow().state
    }

    pub fn is_stopped(&self) -> bool {
        self.events.is_closed()
    }

    /// Resolves with the first snapshot matching `predicate`, or the last one
    /// published if the coordinator stops first.
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&CoordinatorSnapshot) -> bool,
    ) -> CoordinatorSnapshot {
        let mut rx = self.snapshot.clone();
        let result = rx.wait_for(predicate).await.map(|s| s.clone());
        match result {
            Ok(snapshot) => snapshot,
            Err(_) => rx.borrow().clone(),
        }
    }
}
