use parking_lot::Mutex;
use relayplay_core::{PeerId, RoomId};
use relayplay_session::{ConnectionState, CoordinatorSnapshot, SignalDrop, StatusListener};
use std::sync::Arc;

/// Captures every snapshot and drop a coordinator reports.
#[derive(Default)]
pub struct RecordingListener {
    snapshots: Mutex<Vec<CoordinatorSnapshot>>,
    drops: Mutex<Vec<SignalDrop>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn drops(&self) -> Vec<SignalDrop> {
        self.drops.lock().clone()
    }

    pub fn states(&self) -> Vec<ConnectionState> {
        let mut states: Vec<ConnectionState> = Vec::new();
        for snapshot in self.snapshots.lock().iter() {
            if states.last() != Some(&snapshot.state) {
                states.push(snapshot.state);
            }
        }
        states
    }

    pub fn terminal_reports(&self) -> usize {
        self.snapshots
            .lock()
            .iter()
            .filter(|s| s.state.is_terminal())
            .count()
    }
}

impl StatusListener for RecordingListener {
    fn on_status(&self, snapshot: &CoordinatorSnapshot) {
        self.snapshots.lock().push(snapshot.clone());
    }

    fn on_drop(&self, _room: &RoomId, _remote: &PeerId, reason: &SignalDrop) {
        self.drops.lock().push(reason.clone());
    }
}
