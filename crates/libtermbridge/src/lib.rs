pub mod error;
pub mod manager;
pub mod pty;
pub mod registry;
pub mod system;

pub use error::{BridgeError, Result};
pub use manager::{Messenger, SessionManager};
pub use registry::{Registry, Session};
