//! Peer links: the ordered, size-limited text channel the core runs on.
//!
//! A [`PeerLink`] is fire-and-forget: `send` queues one encoded message and
//! returns immediately. Inbound traffic and lifecycle changes for every link
//! arrive on one shared [`LinkEvent`] stream, so the node sees a single
//! ordered feed per link. The [`tcp`] transport only produces links; nothing
//! above this module knows how bytes move.

pub mod tcp;

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio::sync::mpsc;

use crate::core::config::MAX_MESSAGE_SIZE;
use crate::core::protocol::{ConnectionType, Envelope, ProtocolMessage};
use crate::utils::sos::SignalOfStop;

/// Process-unique link identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Allocator for [`LinkId`]s, shared by every transport of one node.
#[derive(Debug, Clone, Default)]
pub struct LinkIds(Arc<AtomicU64>);

impl LinkIds {
    pub fn next(&self) -> LinkId {
        LinkId(self.0.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link {0} is closed")]
    Closed(LinkId),
    #[error("message of {size} bytes exceeds the {max}-byte limit")]
    Oversize { size: usize, max: usize },
    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// What happened on some link.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    Opened(PeerLink),
    Message { link: LinkId, text: String },
    Closed { link: LinkId },
}

/// Handle to one open channel. Clones refer to the same channel.
#[derive(Debug, Clone)]
pub struct PeerLink {
    id: LinkId,
    remote: Option<SocketAddr>,
    outbound: mpsc::UnboundedSender<String>,
    stop: SignalOfStop,
}

impl PeerLink {
    /// New link plus the outbound queue its transport drains.
    pub fn new(id: LinkId, remote: Option<SocketAddr>) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        (
            Self {
                id,
                remote,
                outbound,
                stop: SignalOfStop::new(),
            },
            rx,
        )
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub fn is_open(&self) -> bool {
        !self.stop.cancelled() && !self.outbound.is_closed()
    }

    /// Signal fired when the link closes from either side.
    pub fn stop_signal(&self) -> SignalOfStop {
        self.stop.clone()
    }

    /// Close the link. The transport emits [`LinkEvent::Closed`].
    pub fn close(&self) {
        self.stop.cancel();
    }

    pub fn send_text(&self, text: String) -> Result<(), LinkError> {
        if text.len() > MAX_MESSAGE_SIZE {
            return Err(LinkError::Oversize {
                size: text.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        if !self.is_open() {
            return Err(LinkError::Closed(self.id));
        }
        self.outbound.send(text).map_err(|_| LinkError::Closed(self.id))
    }

    pub fn send(&self, msg: &ProtocolMessage) -> Result<(), LinkError> {
        self.send_text(msg.to_json()?)
    }

    pub fn send_envelope(&self, env: &Envelope) -> Result<(), LinkError> {
        self.send_text(env.text().to_string())
    }
}

/// Local when the remote address is loopback, private, or link-local.
pub fn classify_addr(remote: Option<SocketAddr>) -> ConnectionType {
    let Some(addr) = remote else {
        return ConnectionType::Unknown;
    };
    let local = match addr.ip() {
        IpAddr::V4(ip) => ip.is_loopback() || ip.is_private() || ip.is_link_local(),
        IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
            Some(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
            None => ip.is_loopback() || ip.is_unique_local() || ip.is_unicast_link_local(),
        },
    };
    if local {
        ConnectionType::Local
    } else {
        ConnectionType::Remote
    }
}
