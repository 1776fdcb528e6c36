use crate::coordinator::{CoordinatorSnapshot, Termination};
use crate::error::SignalDrop;
use crate::room::status::RoomStatus;
use relayplay_core::{PeerId, RoomId};

/// Everything the registry tells its UI.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Slot(CoordinatorSnapshot),
    SlotRemoved {
        room: RoomId,
        remote: PeerId,
        termination: Termination,
    },
    RoomStatus {
        room: RoomId,
        status: RoomStatus,
    },
    Dropped {
        room: RoomId,
        from: PeerId,
        reason: SignalDrop,
    },
}
