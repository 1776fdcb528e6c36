use relayplay_core::{Button, PeerId};

/// The local emulator instance, as driven by remote peers.
///
/// Called from coordinator tasks; implementations must return promptly.
pub trait EmulatorControl: Send + Sync {
    fn button(&self, player: PeerId, button: Button, pressed: bool);

    fn set_mute(&self, muted: bool, volume: Option<f32>);

    fn pause(&self);

    fn resume(&self);

    fn reset(&self);
}

/// For rooms without a local emulator, such as a guest that only watches.
pub struct NoopEmulator;

impl EmulatorControl for NoopEmulator {
    fn button(&self, _player: PeerId, _button: Button, _pressed: bool) {}

    fn set_mute(&self, _muted: bool, _volume: Option<f32>) {}

    fn pause(&self) {}

    fn resume(&self) {}

    fn reset(&self) {}
}
