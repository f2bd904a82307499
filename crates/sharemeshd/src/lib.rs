//! sharemeshd - content sharing mesh node
//!
//! This daemon provides:
//! - Signed record submission and validation
//! - Day-sharded record storage with retention
//! - One upstream and one downstream gossip link per node
//! - History catch-up when joining an upstream

pub mod broadcast;
pub mod config;
pub mod link;
pub mod selector;
pub mod server;
pub mod storage;
pub mod sync;

pub use broadcast::{Freshness, GossipBroadcaster, Outcome, SubmitError};
pub use config::Config;
pub use link::LinkManager;
pub use selector::PeerSelector;
pub use server::Server;
pub use storage::RecordStore;
pub use sync::AntiEntropy;
