pub mod channel;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod room;
pub mod signaling;
pub mod transport;

pub use channel::{
    ChatTranscript, ControlAction, DataChannelRouter, EmulatorControl, NoopEmulator, RouteOutcome,
};
pub use config::SessionConfig;
pub use coordinator::{
    CloseReason, ConnectionCoordinator, ConnectionState, CoordinatorContext, CoordinatorHandle,
    CoordinatorSnapshot, StatusListener, Termination,
};
pub use error::{ConfigError, CoordinatorError, RegistryError, SignalDrop, TransportError};
pub use room::{RoomSpec, RoomStatus, SessionEvent, SessionRegistry};
pub use signaling::{LocalRelay, SignalingTransport};
pub use transport::{
    LinkState, PeerConnectionPrimitive, PrimitiveEvent, PrimitiveEvents, PrimitiveFactory,
    RtcPrimitiveFactory, TransportConfig,
};
