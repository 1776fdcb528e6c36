mod actor;
mod event;
mod machine;
mod timer;

pub use actor::*;
pub use event::*;
pub use machine::*;
pub use timer::{TimerHandle, TimerId, TimerKind};
