pub use relayplay_core::model::{PeerId, RoomId};

pub mod model {
    pub use relayplay_core::model::*;
}

#[cfg(feature = "session")]
pub mod session {
    pub use relayplay_session::*;
}
