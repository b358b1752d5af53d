//! relicd - Reliquary Artifact Repository and Sync Daemon
//!
//! This daemon provides:
//! - Content-addressed artifact storage with delta compression
//! - Typed manifest cross-linking into derived history indexes
//! - Peer synchronization over the card protocol
//! - Phantom/cluster bookkeeping and shun enforcement
//! - User authentication and capability gating

pub mod auth;
pub mod config;
pub mod crosslink;
pub mod server;
pub mod storage;
pub mod store;
pub mod sync;

pub use config::Config;
pub use crosslink::Crosslinker;
pub use server::Server;
pub use storage::Storage;
pub use store::Repository;
