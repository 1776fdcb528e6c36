mod primitive;
mod rtc;
mod transport_config;

pub use primitive::*;
pub use rtc::*;
pub use transport_config::*;
