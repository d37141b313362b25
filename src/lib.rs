pub mod config;
pub mod error;
pub mod logger;
pub mod matchmaker;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod store;
mod utils;

pub use config::CallConfig;
pub use error::{CallError, Result};
pub use matchmaker::{Assignment, Identity, Matchmaker};
pub use peer::{SessionStatus, SessionView};
pub use session::{CallSession, Collaborators};
pub use store::memory::MemoryStore;
pub use store::RendezvousStore;
