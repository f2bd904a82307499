//! Networking primitives for the sharemesh protocol
//!
//! This crate provides:
//! - Length-prefixed message framing
//! - Wire messages for gossip links and catch-up
//! - Peer link roles and state
//! - TCP transport helpers and the reflection probe

pub mod framing;
pub mod messages;
pub mod peer;
pub mod probe;
pub mod transport;

pub use framing::{Frame, FrameCodec, FrameError, FrameType};
pub use messages::{Channel, GetHistory, History, OpenChannel, ReflectedAddr};
pub use peer::{ConnectionState, PeerHandle, PeerRole};
pub use probe::{is_external_ip, Reflector, TcpReflector};
pub use transport::{FramedStream, Heartbeat, TransportError};
