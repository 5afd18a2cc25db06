//! Centralized configuration constants for lockstep.
//!
//! All tunable protocol parameters live here so they can be reviewed and
//! adjusted in a single place. Wire-format names (message discriminants,
//! resource prefixes) stay in their respective modules.

use std::time::Duration;

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Default chunk size in bytes (16 KiB).
///
/// A chunk travels base64-encoded inside a JSON `transfer-write` message, so
/// the encoded frame is roughly 22 KiB, well under [`MAX_MESSAGE_SIZE`].
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Largest chunk size a receiver accepts in `transfer-start` (32 KiB).
///
/// Its base64 form (about 43 KiB) plus the JSON envelope stays under
/// [`MAX_MESSAGE_SIZE`].
pub const MAX_CHUNK_SIZE: usize = 32 * 1024;

/// Flush the slot's write handle after this many written chunks.
///
/// Bounds the amount of unflushed data without paying a flush per write.
pub const FLUSH_EVERY_CHUNKS: u64 = 100;

/// Sender read-ahead buffer: max chunks prefetched from disk and queued
/// for encoding + send.
pub const SENDER_READ_AHEAD_CHUNKS: usize = 32;

/// The send loop yields to the runtime after queueing this many chunks.
pub const SENDER_YIELD_EVERY: u32 = 32;

/// Largest encoded message a link accepts (64 KiB).
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

// ── Storage locks ────────────────────────────────────────────────────────────

/// Lock age after which a `current` slot held for a different resource may be
/// force-preempted by a lower session id.
pub const CURRENT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Same as [`CURRENT_LOCK_TIMEOUT`] for the `preload` slot. Shorter so a
/// stalled preload cannot block a later legitimate attempt for long.
pub const PRELOAD_LOCK_TIMEOUT: Duration = Duration::from_secs(20);

// ── Recovery ─────────────────────────────────────────────────────────────────

/// Maximum automatic resume requests per stall episode.
pub const MAX_RECOVERY_RETRIES: u32 = 3;

/// Backoff before each resume request, indexed by the current retry count.
pub const RECOVERY_BACKOFF_MS: [u64; 3] = [2000, 5000, 10000];

/// A receiving transfer with no new chunk for this long is considered stalled.
pub const TRANSFER_WATCHDOG_TIMEOUT: Duration = Duration::from_secs(4);

/// How often the guest checks its in-flight transfers for stalls.
pub const WATCHDOG_TICK: Duration = Duration::from_secs(1);

// ── Membership ───────────────────────────────────────────────────────────────

/// Maximum number of guests in one session (slots `1..=MAX_GUESTS`).
pub const MAX_GUESTS: usize = 3;

/// Labels assigned to guest slots `1..=MAX_GUESTS`.
pub const SLOT_LABELS: [&str; MAX_GUESTS] = ["Left", "Right", "Center"];

/// Delay before a newly opened link is classified local/remote, once the
/// transport has settled on a candidate pair.
pub const LINK_CLASSIFY_DELAY: Duration = Duration::from_millis(1500);

/// Number of digits in a session code.
pub const SESSION_CODE_DIGITS: u32 = 6;

// ── Relay ────────────────────────────────────────────────────────────────────

/// Relayed copies carrying this many hops are not forwarded any further.
pub const MAX_RELAY_HOPS: u32 = 4;

/// Prefix of privileged requests a guest forwards towards the host.
pub const REQUEST_PREFIX: &str = "request-";

// ── Clock sync ───────────────────────────────────────────────────────────────

/// Host sync-broadcast period.
pub const SYNC_INTERVAL: Duration = Duration::from_secs(1);

/// Guests seek only when drift exceeds this many seconds.
pub const DRIFT_THRESHOLD_SECS: f64 = 2.0;

/// Host time advancing less than this between two `playing` broadcasts
/// counts as a stale broadcast.
pub const STALE_ADVANCE_SECS: f64 = 0.5;

/// Consecutive stale broadcasts before the host is considered stalled (ad).
pub const STALE_COUNT_THRESHOLD: u32 = 2;

/// Guest ping period.
pub const PING_INTERVAL: Duration = Duration::from_secs(5);

/// Weight of the newest sample in the round-trip EWMA.
pub const RTT_SMOOTHING: f64 = 0.25;

// ── Auto-reconnect ──────────────────────────────────────────────────────────

/// Delays (in seconds) between guest reconnect attempts after a drop.
pub const RECONNECT_RETRY_DELAYS: [u64; 5] = [3, 5, 10, 20, 30];

// ── Buffers ─────────────────────────────────────────────────────────────────

/// Read buffer used when hashing a completed slot file from disk.
pub const HASH_READ_BUFFER: usize = 256 * 1024;
