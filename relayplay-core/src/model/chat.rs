use crate::model::peer::PeerId;
use serde::{Deserialize, Serialize};

/// A chat line as kept in a room transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub from: PeerId,
    pub text: String,
    /// Milliseconds since the unix epoch, stamped on receipt.
    pub at: u64,
}
