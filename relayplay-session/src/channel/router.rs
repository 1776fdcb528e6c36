use crate::channel::emulator::EmulatorControl;
use crate::channel::transcript::ChatTranscript;
use relayplay_core::{Button, ChannelMessage, ChatMessage, PeerId, RoomId, unix_millis};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlAction {
    SetMute { muted: bool, volume: Option<f32> },
    Pause,
    Resume,
    Reset,
}

/// What happened to one inbound data-channel frame.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    Chat(ChatMessage),
    Input { button: Button, pressed: bool },
    InputIgnored { key: String },
    Control(ControlAction),
    Dropped(String),
}

/// Dispatches application messages of one room to the transcript and the
/// local emulator.
pub struct DataChannelRouter {
    room: RoomId,
    emulator: Arc<dyn EmulatorControl>,
    transcript: ChatTranscript,
}

impl DataChannelRouter {
    pub fn new(room: RoomId, emulator: Arc<dyn EmulatorControl>) -> Self {
        Self::with_transcript(room, emulator, ChatTranscript::default())
    }

    pub fn with_transcript(
        room: RoomId,
        emulator: Arc<dyn EmulatorControl>,
        transcript: ChatTranscript,
    ) -> Self {
        Self {
            room,
            emulator,
            transcript,
        }
    }

    pub fn transcript(&self) -> &ChatTranscript {
        &self.transcript
    }

    pub fn route(&self, from: &PeerId, data: &[u8]) -> RouteOutcome {
        let message = match ChannelMessage::decode(data) {
            Ok(message) => message,
            Err(e) => {
                warn!("Room {}: dropping frame from {}: {}", self.room, from, e);
                return RouteOutcome::Dropped(e.to_string());
            }
        };

        match message {
            ChannelMessage::Chat { text } => {
                let line = ChatMessage {
                    from: *from,
                    text,
                    at: unix_millis(),
                };
                self.transcript.push(line.clone());
                RouteOutcome::Chat(line)
            }
            ChannelMessage::RemoteInput { payload } => match Button::from_key(&payload.key) {
                Some(button) => {
                    self.emulator.button(*from, button, payload.pressed);
                    RouteOutcome::Input {
                        button,
                        pressed: payload.pressed,
                    }
                }
                None => {
                    debug!("Room {}: unmapped key '{}' from {}", self.room, payload.key, from);
                    RouteOutcome::InputIgnored { key: payload.key }
                }
            },
            ChannelMessage::SetMute { muted, volume } => {
                self.emulator.set_mute(muted, volume);
                RouteOutcome::Control(ControlAction::SetMute { muted, volume })
            }
            ChannelMessage::Pause => {
                self.emulator.pause();
                RouteOutcome::Control(ControlAction::Pause)
            }
            ChannelMessage::Resume => {
                self.emulator.resume();
                RouteOutcome::Control(ControlAction::Resume)
            }
            ChannelMessage::Reset => {
                self.emulator.reset();
                RouteOutcome::Control(ControlAction::Reset)
            }
        }
    }
}
