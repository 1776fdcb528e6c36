use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A key transition from a remote player's keyboard or gamepad.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteInputEvent {
    pub key: String,
    pub pressed: bool,
}

/// Application messages carried over the data channel once a peer is connected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ChannelMessage {
    Chat {
        text: String,
    },
    RemoteInput {
        payload: RemoteInputEvent,
    },
    SetMute {
        muted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        volume: Option<f32>,
    },
    Pause,
    Resume,
    Reset,
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("malformed channel message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("channel message has no type discriminator")]
    MissingType,

    #[error("unknown channel message type '{0}'")]
    UnknownType(String),
}

impl ChannelMessage {
    pub const KNOWN_TYPES: [&'static str; 6] =
        ["chat", "remote-input", "set-mute", "pause", "resume", "reset"];

    pub fn chat(text: impl Into<String>) -> Self {
        Self::Chat { text: text.into() }
    }

    pub fn remote_input(key: impl Into<String>, pressed: bool) -> Self {
        Self::RemoteInput {
            payload: RemoteInputEvent {
                key: key.into(),
                pressed,
            },
        }
    }

    /// Decodes one data-channel frame, telling unknown types apart from
    /// frames that are simply broken.
    pub fn decode(data: &[u8]) -> Result<Self, ChannelError> {
        let value: serde_json::Value = serde_json::from_slice(data)?;
        let kind = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .ok_or(ChannelError::MissingType)?;

        if !Self::KNOWN_TYPES.contains(&kind) {
            return Err(ChannelError::UnknownType(kind.to_owned()));
        }

        Ok(serde_json::from_value(value)?)
    }

    pub fn encode(&self) -> Result<Bytes, ChannelError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}
