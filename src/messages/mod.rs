pub mod control;
pub mod session;

pub use control::{parse, ControlMessage, SessionConfig};
pub use session::{Session, SessionState};
