mod emulator;
mod router;
mod transcript;

pub use emulator::*;
pub use router::*;
pub use transcript::*;
