use crate::channel::{DataChannelRouter, EmulatorControl};
use crate::config::SessionConfig;
use crate::coordinator::{
    ConnectionCoordinator, ConnectionState, CoordinatorContext, CoordinatorHandle,
    CoordinatorSnapshot, StatusListener, Termination,
};
use crate::error::{CoordinatorError, RegistryError, SignalDrop};
use crate::room::room_spec::RoomSpec;
use crate::room::session_event::SessionEvent;
use crate::room::status::{RoomStatus, aggregate};
use crate::signaling::SignalingTransport;
use crate::transport::PrimitiveFactory;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::StreamExt;
use relayplay_core::{
    ChannelMessage, ChatMessage, PeerId, Role, RoomId, SignalKind, SignalingEnvelope,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

pub const SESSION_EVENT_CAPACITY: usize = 256;

/// How many departed peers a room remembers for classifying late signals.
pub const DEPARTED_MEMORY: usize = 32;

struct Slot {
    instance: u64,
    handle: CoordinatorHandle,
}

struct RoomSlots {
    spec: RoomSpec,
    role: Role,
    router: Arc<DataChannelRouter>,
    slots: HashMap<PeerId, Slot>,
    /// Failed or timed out slots, kept until the peer gets a new slot.
    faults: HashMap<PeerId, Termination>,
    departed: VecDeque<PeerId>,
    /// Guest rooms only: `ts` of the newest host offer that opened a slot.
    last_host_offer_ts: Option<u64>,
    status: RoomStatus,
    pump: Option<AbortHandle>,
}

impl RoomSlots {
    fn compute_status(&self) -> RoomStatus {
        aggregate(
            self.spec.required_players,
            self.slots.values().map(|slot| slot.handle.state()),
            self.faults.len(),
        )
    }

    /// Returns the new status if it changed.
    fn refresh(&mut self) -> Option<RoomStatus> {
        let status = self.compute_status();
        if status == self.status {
            return None;
        }
        self.status = status;
        Some(status)
    }

    fn owns(&self, remote: &PeerId, instance: u64) -> bool {
        self.slots
            .get(remote)
            .is_some_and(|slot| slot.instance == instance)
    }

    /// Whether a new coordinator for `remote` may take a slot. A guest slot
    /// whose coordinator already terminated may be replaced.
    fn admits(&self, remote: PeerId, role: Role) -> Result<(), RegistryError> {
        if let Some(existing) = self.slots.get(&remote) {
            if role == Role::Guest && existing.handle.state().is_terminal() {
                return Ok(());
            }
            return Err(RegistryError::SlotOccupied {
                room: self.spec.id.clone(),
                peer: remote,
            });
        }
        if role == Role::Host && self.slots.len() >= self.spec.required_players {
            return Err(RegistryError::RoomFull {
                room: self.spec.id.clone(),
                required: self.spec.required_players,
            });
        }
        Ok(())
    }

    fn remember_departed(&mut self, remote: PeerId) {
        self.departed.retain(|peer| *peer != remote);
        if self.departed.len() == DEPARTED_MEMORY {
            self.departed.pop_front();
        }
        self.departed.push_back(remote);
    }
}

impl Drop for RoomSlots {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

struct RegistryInner {
    local_id: PeerId,
    config: SessionConfig,
    transport: Arc<dyn SignalingTransport>,
    primitives: Arc<dyn PrimitiveFactory>,
    rooms: DashMap<RoomId, RoomSlots>,
    next_instance: AtomicU64,
    events: broadcast::Sender<SessionEvent>,
}

impl RegistryInner {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn emit_status(&self, room: &RoomId, changed: Option<RoomStatus>) {
        if let Some(status) = changed {
            info!("Room {}: status is now {}", room, status);
            self.emit(SessionEvent::RoomStatus {
                room: room.clone(),
                status,
            });
        }
    }

    fn report_drop(&self, room: &RoomId, from: &PeerId, reason: &SignalDrop) {
        warn!("Room {}: dropped signal from {}: {}", room, from, reason);
        self.emit(SessionEvent::Dropped {
            room: room.clone(),
            from: *from,
            reason: reason.clone(),
        });
    }

    fn reap(&self, room_id: &RoomId, remote: PeerId, instance: u64, termination: Termination) {
        let changed = match self.rooms.get_mut(room_id) {
            Some(mut room) if room.owns(&remote, instance) => {
                room.slots.remove(&remote);
                room.remember_departed(remote);
                room.refresh()
            }
            _ => {
                debug!(
                    "Room {}: slot for {} already replaced or room closed",
                    room_id, remote
                );
                return;
            }
        };

        info!("Room {}: removed slot for {} ({:?})", room_id, remote, termination);
        self.emit(SessionEvent::SlotRemoved {
            room: room_id.clone(),
            remote,
            termination,
        });
        self.emit_status(room_id, changed);
    }
}

/// Reports for one coordinator instance. Snapshots of an instance that no
/// longer owns its slot only reach the event stream.
struct SlotListener {
    registry: Weak<RegistryInner>,
    instance: u64,
}

impl StatusListener for SlotListener {
    fn on_status(&self, snapshot: &CoordinatorSnapshot) {
        let Some(inner) = self.registry.upgrade() else {
            return;
        };
        inner.emit(SessionEvent::Slot(snapshot.clone()));

        let changed = match inner.rooms.get_mut(&snapshot.room) {
            Some(mut room) if room.owns(&snapshot.remote_id, self.instance) => {
                if let Some(termination) = &snapshot.termination
                    && termination.is_fault()
                {
                    room.faults
                        .insert(snapshot.remote_id, termination.clone());
                }
                room.refresh()
            }
            _ => None,
        };
        inner.emit_status(&snapshot.room, changed);
    }

    fn on_drop(&self, room: &RoomId, remote: &PeerId, reason: &SignalDrop) {
        if let Some(inner) = self.registry.upgrade() {
            inner.emit(SessionEvent::Dropped {
                room: room.clone(),
                from: *remote,
                reason: reason.clone(),
            });
        }
    }
}

enum Route {
    Deliver(CoordinatorHandle),
    Open,
    /// The host renegotiated: retire the old coordinator, then open.
    Replace(CoordinatorHandle),
}

/// Owns every coordinator of the local peer, one slot per remote peer and room.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(
        local_id: PeerId,
        config: SessionConfig,
        transport: Arc<dyn SignalingTransport>,
        primitives: Arc<dyn PrimitiveFactory>,
    ) -> Self {
        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        Self {
            inner: Arc::new(RegistryInner {
                local_id,
                config,
                transport,
                primitives,
                rooms: DashMap::new(),
                next_instance: AtomicU64::new(1),
                events,
            }),
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.inner.local_id
    }

    pub fn open_room(
        &self,
        spec: RoomSpec,
        emulator: Arc<dyn EmulatorControl>,
    ) -> Result<(), RegistryError> {
        let role = spec.role_of(self.inner.local_id);
        if role == Role::Host && spec.required_players == 0 {
            return Err(RegistryError::NoRequiredPlayers(spec.id));
        }

        let room_id = spec.id.clone();
        let status = aggregate(spec.required_players, [], 0);
        match self.inner.rooms.entry(room_id.clone()) {
            Entry::Occupied(_) => return Err(RegistryError::RoomExists(room_id)),
            Entry::Vacant(vacant) => {
                vacant.insert(RoomSlots {
                    router: Arc::new(DataChannelRouter::new(room_id.clone(), emulator)),
                    spec,
                    role,
                    slots: HashMap::new(),
                    faults: HashMap::new(),
                    departed: VecDeque::with_capacity(DEPARTED_MEMORY),
                    last_host_offer_ts: None,
                    status,
                    pump: None,
                });
            }
        }

        info!("Room {}: opened as {}", room_id, role);
        self.inner.emit_status(&room_id, Some(status));
        Ok(())
    }

    /// Removes the room and closes every connection in it at once.
    pub fn close_room(&self, room_id: &RoomId) -> Result<(), RegistryError> {
        let (_, room) = self
            .inner
            .rooms
            .remove(room_id)
            .ok_or_else(|| RegistryError::UnknownRoom(room_id.clone()))?;

        for slot in room.slots.values() {
            slot.handle.close();
        }
        info!("Room {}: closed with {} connections", room_id, room.slots.len());
        Ok(())
    }

    /// Pumps the relay's envelopes for this room into [`Self::route_envelope`].
    /// Calling it again replaces the previous subscription.
    pub fn listen(&self, room_id: &RoomId) -> Result<(), RegistryError> {
        if !self.inner.rooms.contains_key(room_id) {
            return Err(RegistryError::UnknownRoom(room_id.clone()));
        }

        let mut stream = self
            .inner
            .transport
            .subscribe(room_id, self.inner.local_id);
        let registry = Arc::downgrade(&self.inner);
        let room = room_id.clone();

        let task = tokio::spawn(async move {
            while let Some(envelope) = stream.next().await {
                let Some(inner) = registry.upgrade() else {
                    break;
                };
                let _ = SessionRegistry { inner }.route_envelope(envelope).await;
            }
            debug!("Room {}: relay subscription ended", room);
        });

        match self.inner.rooms.get_mut(room_id) {
            Some(mut room) => {
                if let Some(previous) = room.pump.replace(task.abort_handle()) {
                    previous.abort();
                }
            }
            None => task.abort(),
        }
        Ok(())
    }

    /// Host side: opens a slot for `guest` and sends it an offer.
    pub async fn invite_guest(
        &self,
        room_id: &RoomId,
        guest: PeerId,
    ) -> Result<CoordinatorHandle, RegistryError> {
        {
            let room = self
                .inner
                .rooms
                .get(room_id)
                .ok_or_else(|| RegistryError::UnknownRoom(room_id.clone()))?;
            if room.role != Role::Host {
                return Err(RegistryError::NotHost(room_id.clone()));
            }
            if guest == self.inner.local_id {
                return Err(RegistryError::SlotOccupied {
                    room: room_id.clone(),
                    peer: guest,
                });
            }
        }

        let handle = self.spawn_slot(room_id, guest, Role::Host).await?;
        handle.create_offer().await?;
        info!("Room {}: invited {}", room_id, guest);
        Ok(handle)
    }

    /// Delivers one relay envelope to the coordinator it belongs to. Every
    /// drop is logged and published as [`SessionEvent::Dropped`].
    pub async fn route_envelope(&self, envelope: SignalingEnvelope) -> Result<(), SignalDrop> {
        let room = envelope.room().clone();
        let from = *envelope.from();
        let result = self.try_route(envelope).await;
        if let Err(reason) = &result {
            self.inner.report_drop(&room, &from, reason);
        }
        result
    }

    async fn try_route(&self, envelope: SignalingEnvelope) -> Result<(), SignalDrop> {
        let local = self.inner.local_id;
        if *envelope.to() != local || *envelope.from() == local {
            return Err(SignalDrop::Misaddressed { to: *envelope.to() });
        }

        let room_id = envelope.room().clone();
        let from = *envelope.from();
        let kind = envelope.kind();

        let route = {
            let mut room = self
                .inner
                .rooms
                .get_mut(&room_id)
                .ok_or_else(|| SignalDrop::UnknownRoom {
                    room: room_id.clone(),
                })?;
            let existing = room.slots.get(&from).map(|slot| slot.handle.clone());

            if kind == SignalKind::Offer && room.role == Role::Guest && from == room.spec.host_id {
                if let Some(last) = room.last_host_offer_ts
                    && envelope.ts() <= last
                {
                    return Err(SignalDrop::DuplicateOffer);
                }
                match existing {
                    Some(handle) if !handle.state().is_terminal() => {
                        let current = handle.snapshot().negotiation;
                        let offered = envelope
                            .description()
                            .ok()
                            .and_then(|payload| payload.negotiation);
                        match (current, offered) {
                            (Some(current), Some(offered)) if current != offered => {
                                room.slots.remove(&from);
                                room.last_host_offer_ts = Some(envelope.ts());
                                Route::Replace(handle)
                            }
                            _ => Route::Deliver(handle),
                        }
                    }
                    _ => {
                        room.last_host_offer_ts = Some(envelope.ts());
                        Route::Open
                    }
                }
            } else {
                match existing {
                    Some(handle) => Route::Deliver(handle),
                    None if kind == SignalKind::Bye => {
                        debug!("Room {}: bye from {} without a connection", room_id, from);
                        return Ok(());
                    }
                    None if room.departed.contains(&from) => {
                        return Err(SignalDrop::StaleSignal { kind });
                    }
                    // A host candidate that overtakes its offer lands here
                    // and is lost.
                    None => {
                        return Err(SignalDrop::UnknownPeer {
                            room: room_id.clone(),
                            from,
                            kind,
                        });
                    }
                }
            }
        };

        match route {
            Route::Deliver(handle) => handle.deliver(envelope),
            Route::Open | Route::Replace(_) => {
                if let Route::Replace(previous) = &route {
                    info!(
                        "Room {}: host {} renegotiated, replacing its connection",
                        room_id, from
                    );
                    previous.close();
                } else {
                    info!("Room {}: offer from host {}, opening connection", room_id, from);
                }
                match self.spawn_slot(&room_id, from, Role::Guest).await {
                    Ok(handle) => handle.deliver(envelope),
                    Err(e) => {
                        error!("Room {}: cannot answer {}: {}", room_id, from, e);
                        self.record_fault(&room_id, from, Termination::Failed(e.to_string()));
                        Ok(())
                    }
                }
            }
        }
    }

    /// Builds a coordinator, installs it in its slot and spawns it under a
    /// supervisor that frees the slot once the coordinator has settled.
    async fn spawn_slot(
        &self,
        room_id: &RoomId,
        remote: PeerId,
        role: Role,
    ) -> Result<CoordinatorHandle, RegistryError> {
        let instance = self.inner.next_instance.fetch_add(1, Ordering::Relaxed);
        let ctx = {
            let room = self
                .inner
                .rooms
                .get(room_id)
                .ok_or_else(|| RegistryError::UnknownRoom(room_id.clone()))?;
            room.admits(remote, role)?;
            CoordinatorContext {
                room: room_id.clone(),
                local_id: self.inner.local_id,
                config: self.inner.config.clone(),
                transport: self.inner.transport.clone(),
                router: room.router.clone(),
                listener: Arc::new(SlotListener {
                    registry: Arc::downgrade(&self.inner),
                    instance,
                }),
            }
        };

        let (coordinator, handle) =
            ConnectionCoordinator::new(ctx, remote, role, self.inner.primitives.as_ref())
                .await
                .map_err(|e| match e {
                    CoordinatorError::Primitive(reason) => RegistryError::Primitive(reason),
                    other => other.into(),
                })?;

        // The primitive was created without holding the room, so admission
        // is checked again before the slot is taken.
        let admitted = match self.inner.rooms.get_mut(room_id) {
            Some(mut room) => room.admits(remote, role).map(|()| {
                room.slots.insert(
                    remote,
                    Slot {
                        instance,
                        handle: handle.clone(),
                    },
                );
                room.faults.remove(&remote);
                room.departed.retain(|peer| *peer != remote);
                room.refresh()
            }),
            None => Err(RegistryError::UnknownRoom(room_id.clone())),
        };
        let changed = match admitted {
            Ok(changed) => changed,
            Err(e) => {
                debug!("Room {}: discarding coordinator for {}: {}", room_id, remote, e);
                coordinator.abandon().await;
                return Err(e);
            }
        };
        self.inner.emit_status(room_id, changed);

        let registry = Arc::downgrade(&self.inner);
        let room = room_id.clone();
        tokio::spawn(async move {
            let termination = coordinator.run().await;
            if let Some(inner) = registry.upgrade() {
                inner.reap(&room, remote, instance, termination);
            }
        });

        Ok(handle)
    }

    fn record_fault(&self, room_id: &RoomId, remote: PeerId, termination: Termination) {
        let changed = self.inner.rooms.get_mut(room_id).and_then(|mut room| {
            room.faults.insert(remote, termination);
            room.refresh()
        });
        self.inner.emit_status(room_id, changed);
    }

    /// Asks the guest's coordinator to close, honouring the grace period.
    /// For a guest that already failed this clears the recorded fault.
    pub fn dispose_guest(&self, room_id: &RoomId, guest: PeerId) -> Result<(), RegistryError> {
        let changed = {
            let mut room = self
                .inner
                .rooms
                .get_mut(room_id)
                .ok_or_else(|| RegistryError::UnknownRoom(room_id.clone()))?;
            if let Some(slot) = room.slots.get(&guest) {
                slot.handle.request_dispose();
                None
            } else if room.faults.remove(&guest).is_some() {
                room.refresh()
            } else {
                None
            }
        };
        self.inner.emit_status(room_id, changed);
        Ok(())
    }

    pub fn handle(&self, room_id: &RoomId, remote: PeerId) -> Option<CoordinatorHandle> {
        let room = self.inner.rooms.get(room_id)?;
        room.slots.get(&remote).map(|slot| slot.handle.clone())
    }

    pub fn status(&self, room_id: &RoomId) -> Result<RoomStatus, RegistryError> {
        self.inner
            .rooms
            .get(room_id)
            .map(|room| room.compute_status())
            .ok_or_else(|| RegistryError::UnknownRoom(room_id.clone()))
    }

    pub fn slots(&self, room_id: &RoomId) -> Vec<CoordinatorSnapshot> {
        self.inner
            .rooms
            .get(room_id)
            .map(|room| room.slots.values().map(|slot| slot.handle.snapshot()).collect())
            .unwrap_or_default()
    }

    pub fn fault(&self, room_id: &RoomId, remote: PeerId) -> Option<Termination> {
        let room = self.inner.rooms.get(room_id)?;
        room.faults.get(&remote).cloned()
    }

    pub fn rooms(&self) -> Vec<RoomId> {
        self.inner
            .rooms
            .iter()
            .map(|room| room.key().clone())
            .collect()
    }

    pub fn router(&self, room_id: &RoomId) -> Option<Arc<DataChannelRouter>> {
        self.inner
            .rooms
            .get(room_id)
            .map(|room| room.router.clone())
    }

    pub fn transcript(&self, room_id: &RoomId) -> Option<Vec<ChatMessage>> {
        self.router(room_id)
            .map(|router| router.transcript().messages())
    }

    /// Sends `message` to every connected peer of the room. Returns how many
    /// coordinators accepted it.
    pub fn broadcast(
        &self,
        room_id: &RoomId,
        message: &ChannelMessage,
    ) -> Result<usize, RegistryError> {
        let handles: Vec<CoordinatorHandle> = {
            let room = self
                .inner
                .rooms
                .get(room_id)
                .ok_or_else(|| RegistryError::UnknownRoom(room_id.clone()))?;
            room.slots
                .values()
                .filter(|slot| slot.handle.state() == ConnectionState::Connected)
                .map(|slot| slot.handle.clone())
                .collect()
        };

        let mut sent = 0;
        for handle in handles {
            match handle.send(message) {
                Ok(()) => sent += 1,
                Err(CoordinatorError::Stopped(peer)) => {
                    debug!("Room {}: {} stopped before broadcast", room_id, peer)
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(sent)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }
}
