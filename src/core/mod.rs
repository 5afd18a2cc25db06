pub mod config;
pub mod connection;
pub mod membership;
pub mod node;
pub mod peer_registry;
pub mod protocol;
pub mod relay;
pub mod session_id;
pub mod storage;
pub mod sync;
pub mod transfer;
