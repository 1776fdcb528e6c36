mod channel;
mod chat;
mod input;
mod peer;
mod room;
mod signaling;

pub use channel::{ChannelError, ChannelMessage, RemoteInputEvent};
pub use chat::ChatMessage;
pub use input::Button;
pub use peer::{PeerId, Role};
pub use room::RoomId;
pub use signaling::{
    ByePayload, CandidatePayload, DescriptionPayload, EnvelopeError, IceCandidate, NegotiationId,
    SdpKind, SessionDescription, SignalKind, SignalingEnvelope, unix_millis,
};
