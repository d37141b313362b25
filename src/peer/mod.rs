pub mod connection;
pub mod ice;
pub mod media;
pub mod state;
pub mod types;

pub use connection::{ConnectionHandle, PeerConnection, PeerEvent, PeerFactory, RtcPeerFactory};
pub use ice::{CredentialProvider, HttpCredentialProvider, StaticCredentials};
pub use media::{MediaSource, MediaStream, MediaTrack, SyntheticMedia};
pub use state::{SessionStatus, SessionView};
pub use types::{IceCandidate, IceConfig, LinkState, Role, SessionDescription};
