//! Chunked file transfer between peers.
//!
//! The sender streams a file as `transfer-start`, `transfer-write`* and
//! `transfer-end` messages; the receiver tracks progress per slot and drives
//! the storage worker. Stalls and gaps are repaired through resume requests.

pub mod chunk;
pub mod preload;
pub mod receiver;
pub mod recovery;
pub mod sender;

pub use preload::PreloadScheduler;
pub use receiver::{ReceiveAction, StartInfo, TransferReceiver};
pub use recovery::{FireContext, FireOutcome, RecoveryCoordinator, TriggerOutcome};
pub use sender::{spawn_push, Push, Source};
