mod registry;
mod room_spec;
mod session_event;
mod status;

pub use registry::*;
pub use room_spec::*;
pub use session_event::*;
pub use status::*;
