use relayplay_core::{PeerId, Role, RoomId};

/// What a registry needs to know to open a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSpec {
    pub id: RoomId,
    pub host_id: PeerId,
    /// Remote peers the room waits for. A guest's room waits for its host only.
    pub required_players: usize,
}

impl RoomSpec {
    pub fn host(id: impl Into<RoomId>, host_id: PeerId, required_players: usize) -> Self {
        Self {
            id: id.into(),
            host_id,
            required_players,
        }
    }

    pub fn guest(id: impl Into<RoomId>, host_id: PeerId) -> Self {
        Self {
            id: id.into(),
            host_id,
            required_players: 1,
        }
    }

    pub fn role_of(&self, local_id: PeerId) -> Role {
        if local_id == self.host_id {
            Role::Host
        } else {
            Role::Guest
        }
    }
}
