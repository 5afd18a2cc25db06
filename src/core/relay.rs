//! Relay router: control-message dispatch and tree forwarding.
//!
//! Every node runs one router. Inbound control envelopes are validated,
//! handed to the handler registered for their type, and then forwarded:
//!
//! ```text
//!            upstream (host or relay)
//!                    │  relayable kinds
//!                    ▼
//!   ┌──────────── RelayRouter ────────────┐
//!   │ handler(env, source)                │
//!   └─────┬──────────────┬────────────────┘
//!         ▼              ▼          ▲
//!    downstream A   downstream B    │ request-* (non-host only)
//! ```
//!
//! Forwarded copies carry a hop counter; copies at [`MAX_RELAY_HOPS`] are not
//! forwarded again, which bounds the damage of an accidental link cycle.
//!
//! A downstream link takes part in broadcasts, fan-out and request
//! forwarding only once it is marked joined, i.e. after its `hello` passed
//! the session-code check.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::core::config::MAX_RELAY_HOPS;
use crate::core::connection::{LinkId, PeerLink};
use crate::core::protocol::{Envelope, ProtocolMessage, RELAYABLE_KINDS};

/// Handler for one message type. Errors are logged by the router and never
/// stop forwarding.
pub type Handler = Arc<dyn Fn(&Envelope, LinkId) -> anyhow::Result<()> + Send + Sync>;

/// What [`RelayRouter::dispatch`] did with an envelope.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub handled: bool,
    pub relayed: Vec<LinkId>,
    pub forwarded_upstream: bool,
}

pub struct RelayRouter {
    handlers: HashMap<String, Handler>,
    links: HashMap<LinkId, PeerLink>,
    joined: HashSet<LinkId>,
    upstream: Option<LinkId>,
    is_host: bool,
}

impl RelayRouter {
    pub fn new(is_host: bool) -> Self {
        Self {
            handlers: HashMap::new(),
            links: HashMap::new(),
            joined: HashSet::new(),
            upstream: None,
            is_host,
        }
    }

    pub fn is_host(&self) -> bool {
        self.is_host
    }

    /// Register `handler` for `kind`. A second registration replaces the first.
    pub fn register_handler(&mut self, kind: &str, handler: Handler) {
        if self.handlers.insert(kind.to_string(), handler).is_some() {
            warn!(event = "handler_overwritten", kind = %kind, "Replacing existing handler");
        }
    }

    pub fn add_link(&mut self, link: PeerLink) {
        self.links.insert(link.id(), link);
    }

    pub fn remove_link(&mut self, id: LinkId) -> Option<PeerLink> {
        if self.upstream == Some(id) {
            self.upstream = None;
        }
        self.joined.remove(&id);
        self.links.remove(&id)
    }

    /// Let a registered downstream link receive broadcasts and fan-out, and
    /// send requests upstream.
    pub fn mark_joined(&mut self, id: LinkId) {
        if self.links.contains_key(&id) {
            self.joined.insert(id);
        }
    }

    pub fn is_joined(&self, id: LinkId) -> bool {
        self.joined.contains(&id)
    }

    /// Mark `id` as the link towards the host. Registers the link as well.
    pub fn set_upstream(&mut self, link: PeerLink) {
        self.upstream = Some(link.id());
        self.add_link(link);
    }

    pub fn upstream(&self) -> Option<&PeerLink> {
        self.upstream.and_then(|id| self.links.get(&id))
    }

    pub fn link(&self, id: LinkId) -> Option<&PeerLink> {
        self.links.get(&id)
    }

    /// Open links other than the upstream.
    pub fn downstream(&self) -> impl Iterator<Item = &PeerLink> {
        let upstream = self.upstream;
        self.links
            .values()
            .filter(move |l| Some(l.id()) != upstream && l.is_open())
    }

    /// Send `msg` to every open joined downstream link. Returns how many took
    /// it.
    pub fn broadcast(&self, msg: &ProtocolMessage) -> usize {
        let env = match Envelope::from_message(msg) {
            Ok(env) => env,
            Err(e) => {
                warn!(event = "broadcast_encode_failed", kind = msg.kind(), error = %e, "Encode failed");
                return 0;
            }
        };
        self.downstream()
            .filter(|l| self.joined.contains(&l.id()))
            .filter(|l| match l.send_envelope(&env) {
                Ok(()) => true,
                Err(e) => {
                    debug!(event = "broadcast_send_failed", link = %l.id(), error = %e, "Send failed");
                    false
                }
            })
            .count()
    }

    /// Send `msg` on one link. Returns `false` when the link is unknown or
    /// closed.
    pub fn send_to(&self, id: LinkId, msg: &ProtocolMessage) -> bool {
        let Some(link) = self.links.get(&id) else {
            return false;
        };
        match link.send(msg) {
            Ok(()) => true,
            Err(e) => {
                debug!(event = "send_failed", link = %id, kind = msg.kind(), error = %e, "Send failed");
                false
            }
        }
    }

    /// Send `msg` upstream. Returns `false` without an open upstream.
    pub fn send_upstream(&self, msg: &ProtocolMessage) -> bool {
        self.upstream.is_some_and(|id| self.send_to(id, msg))
    }

    /// Handle one inbound control envelope from `source`.
    pub fn dispatch(&self, env: &Envelope, source: LinkId) -> DispatchReport {
        let mut report = DispatchReport::default();
        let kind = env.kind();

        match self.handlers.get(kind) {
            Some(handler) => {
                report.handled = true;
                if let Err(e) = handler(env, source) {
                    warn!(event = "handler_failed", kind = %kind, link = %source, error = %e, "Handler error");
                }
            }
            None => debug!(event = "unhandled_message", kind = %kind, link = %source, "No handler registered"),
        }

        let from_upstream = self.upstream == Some(source);
        let below_hop_cap = env.hops() < MAX_RELAY_HOPS;

        if self.upstream.is_some() && RELAYABLE_KINDS.contains(&kind) {
            if below_hop_cap {
                let upstream = self.upstream;
                report.relayed = self.forward(env, |l| {
                    l.id() != source && Some(l.id()) != upstream && self.joined.contains(&l.id())
                });
            } else {
                warn!(event = "relay_hop_cap", kind = %kind, hops = env.hops(), "Not relaying further");
            }
        }

        if !self.is_host && !from_upstream && env.is_request() {
            if !self.joined.contains(&source) {
                debug!(event = "request_dropped", kind = %kind, link = %source, "Link has not joined");
                return report;
            }
            match (self.upstream(), below_hop_cap) {
                (Some(up), true) => {
                    report.forwarded_upstream = !self.forward(env, |l| l.id() == up.id()).is_empty();
                }
                (Some(_), false) => {
                    warn!(event = "relay_hop_cap", kind = %kind, hops = env.hops(), "Not forwarding request")
                }
                (None, _) => debug!(event = "request_dropped", kind = %kind, "No upstream for request"),
            }
        }
        report
    }

    fn forward(&self, env: &Envelope, target: impl Fn(&PeerLink) -> bool) -> Vec<LinkId> {
        let copy = match env.forwarded() {
            Ok(copy) => copy,
            Err(e) => {
                warn!(event = "relay_encode_failed", kind = %env.kind(), error = %e, "Cannot forward");
                return Vec::new();
            }
        };
        self.links
            .values()
            .filter(|l| l.is_open() && target(*l))
            .filter_map(|l| match l.send_envelope(&copy) {
                Ok(()) => Some(l.id()),
                Err(e) => {
                    debug!(event = "relay_send_failed", link = %l.id(), error = %e, "Forward failed");
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn link(id: u64) -> (PeerLink, UnboundedReceiver<String>) {
        PeerLink::new(LinkId(id), None)
    }

    fn sync_env() -> Envelope {
        Envelope::from_message(&ProtocolMessage::SyncBroadcast {
            time: 12.0,
            state: crate::core::protocol::TransportState::Playing,
            sub_index: None,
        })
        .unwrap()
    }

    fn recorder(router: &mut RelayRouter, kind: &str) -> Arc<Mutex<Vec<LinkId>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        router.register_handler(
            kind,
            Arc::new(move |_env: &Envelope, source: LinkId| {
                sink.lock().unwrap().push(source);
                Ok(())
            }),
        );
        seen
    }

    #[test]
    fn relayable_kinds_fan_out_except_source() {
        let mut router = RelayRouter::new(false);
        let (up, _up_rx) = link(1);
        let (a, mut a_rx) = link(2);
        let (b, mut b_rx) = link(3);
        router.set_upstream(up);
        router.add_link(a);
        router.add_link(b);
        router.mark_joined(LinkId(2));
        router.mark_joined(LinkId(3));
        let seen = recorder(&mut router, "sync-broadcast");

        let report = router.dispatch(&sync_env(), LinkId(1));
        assert!(report.handled);
        assert_eq!(report.relayed.len(), 2);
        assert_eq!(seen.lock().unwrap().as_slice(), &[LinkId(1)]);

        let copy = Envelope::parse(&a_rx.try_recv().unwrap()).unwrap();
        assert_eq!(copy.hops(), 1);
        assert!(b_rx.try_recv().is_ok());
    }

    #[test]
    fn host_never_relays_or_forwards() {
        let mut router = RelayRouter::new(true);
        let (a, mut a_rx) = link(2);
        router.add_link(a);
        router.mark_joined(LinkId(2));
        let env = Envelope::from_message(&ProtocolMessage::RequestPlay { from: "g".into() }).unwrap();
        let report = router.dispatch(&env, LinkId(2));
        assert!(!report.forwarded_upstream);
        assert!(report.relayed.is_empty());
        assert!(a_rx.try_recv().is_err());
    }

    #[test]
    fn requests_from_downstream_go_upstream() {
        let mut router = RelayRouter::new(false);
        let (up, mut up_rx) = link(1);
        let (a, mut a_rx) = link(2);
        router.set_upstream(up);
        router.add_link(a);
        router.mark_joined(LinkId(2));

        let env = Envelope::from_message(&ProtocolMessage::RequestSeek {
            from: "g2".into(),
            time: 30.0,
        })
        .unwrap();
        let report = router.dispatch(&env, LinkId(2));
        assert!(report.forwarded_upstream);
        assert!(up_rx.try_recv().unwrap().contains("request-seek"));
        assert!(a_rx.try_recv().is_err());

        // A request coming down from upstream is not bounced back.
        let report = router.dispatch(&env, LinkId(1));
        assert!(!report.forwarded_upstream);
    }

    #[test]
    fn links_before_hello_get_nothing_and_send_nothing_up() {
        let mut router = RelayRouter::new(false);
        let (up, mut up_rx) = link(1);
        let (a, mut a_rx) = link(2);
        router.set_upstream(up);
        router.add_link(a);
        router.mark_joined(LinkId(9));
        assert!(!router.is_joined(LinkId(9)));

        let report = router.dispatch(&sync_env(), LinkId(1));
        assert!(report.relayed.is_empty());
        assert_eq!(router.broadcast(&ProtocolMessage::Pong { sent_at: 0.0 }), 0);
        assert!(a_rx.try_recv().is_err());

        let env = Envelope::from_message(&ProtocolMessage::RequestPlay { from: "g".into() }).unwrap();
        assert!(!router.dispatch(&env, LinkId(2)).forwarded_upstream);
        assert!(up_rx.try_recv().is_err());

        router.mark_joined(LinkId(2));
        assert!(router.dispatch(&env, LinkId(2)).forwarded_upstream);
        router.remove_link(LinkId(2));
        assert!(!router.is_joined(LinkId(2)));
    }

    #[test]
    fn hop_cap_stops_forwarding() {
        let mut router = RelayRouter::new(false);
        let (up, _up_rx) = link(1);
        let (a, mut a_rx) = link(2);
        router.set_upstream(up);
        router.add_link(a);
        router.mark_joined(LinkId(2));

        let mut env = sync_env();
        for _ in 0..MAX_RELAY_HOPS {
            env = env.forwarded().unwrap();
        }
        let report = router.dispatch(&env, LinkId(1));
        assert!(report.relayed.is_empty());
        assert!(a_rx.try_recv().is_err());
    }

    #[test]
    fn handler_error_does_not_block_relay() {
        let mut router = RelayRouter::new(false);
        let (up, _up_rx) = link(1);
        let (a, _a_rx) = link(2);
        router.set_upstream(up);
        router.add_link(a);
        router.mark_joined(LinkId(2));
        router.register_handler("sync-broadcast", Arc::new(|_: &Envelope, _: LinkId| -> anyhow::Result<()> { anyhow::bail!("boom") }));

        let report = router.dispatch(&sync_env(), LinkId(1));
        assert!(report.handled);
        assert_eq!(report.relayed, vec![LinkId(2)]);
    }

    #[test]
    fn reregistering_replaces_handler() {
        let mut router = RelayRouter::new(true);
        let first = recorder(&mut router, "ping");
        let second = recorder(&mut router, "ping");
        let (a, _rx) = link(5);
        router.add_link(a);
        let env = Envelope::from_message(&ProtocolMessage::Ping { sent_at: 1.0 }).unwrap();
        router.dispatch(&env, LinkId(5));
        assert!(first.lock().unwrap().is_empty());
        assert_eq!(second.lock().unwrap().len(), 1);
    }

    #[test]
    fn closed_links_are_skipped() {
        let mut router = RelayRouter::new(true);
        let (a, _a_rx) = link(1);
        let (b, _b_rx) = link(2);
        b.close();
        router.add_link(a);
        router.add_link(b);
        router.mark_joined(LinkId(1));
        router.mark_joined(LinkId(2));
        assert_eq!(router.broadcast(&ProtocolMessage::Pong { sent_at: 0.0 }), 1);
        assert!(!router.send_to(LinkId(2), &ProtocolMessage::Pong { sent_at: 0.0 }));
        assert!(router.remove_link(LinkId(2)).is_some());
    }
}
