use crate::coordinator::ConnectionState;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Aggregate health of a room as shown to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    Waiting,
    Connecting,
    Ready,
    Error,
}

impl fmt::Display for RoomStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoomStatus::Waiting => "waiting",
            RoomStatus::Connecting => "connecting",
            RoomStatus::Ready => "ready",
            RoomStatus::Error => "error",
        };
        f.write_str(name)
    }
}

/// Folds slot states into a room status.
///
/// `unresolved_faults` counts slots that ended by failure or timeout and
/// were not replaced since. Precedence: error, waiting, connecting, ready.
pub fn aggregate(
    required_players: usize,
    slots: impl IntoIterator<Item = ConnectionState>,
    unresolved_faults: usize,
) -> RoomStatus {
    let mut count = 0;
    let mut all_connected = true;
    let mut failed = false;

    for state in slots {
        count += 1;
        failed |= state == ConnectionState::Failed;
        all_connected &= state == ConnectionState::Connected;
    }

    if failed || unresolved_faults > 0 {
        RoomStatus::Error
    } else if count < required_players {
        RoomStatus::Waiting
    } else if !all_connected {
        RoomStatus::Connecting
    } else {
        RoomStatus::Ready
    }
}
