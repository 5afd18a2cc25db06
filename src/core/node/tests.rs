//! End-to-end sessions over loopback TCP.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use super::*;
use crate::core::config::{CHUNK_SIZE, MAX_GUESTS};
use crate::core::connection::tcp;
use crate::core::storage::resource_name;
use crate::core::sync::ClockPlayer;

const CODE: &str = "482913";
const WAIT: Duration = Duration::from_secs(15);

fn scratch(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("lockstep-node-{tag}-{}", uuid::Uuid::new_v4().simple()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn media(dir: &Path, name: &str, chunks: usize, seed: u8) -> PathBuf {
    let data: Vec<u8> = (0..chunks * CHUNK_SIZE)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect();
    let path = dir.join(name);
    std::fs::write(&path, data).unwrap();
    path
}

fn config(role: Role, peer_id: &str, dir: &Path) -> NodeConfig {
    NodeConfig {
        role,
        peer_id: peer_id.to_string(),
        display_name: None,
        session_code: CODE.to_string(),
        tracks: Vec::new(),
        operators: Vec::new(),
        instance_id: peer_id.to_string(),
        storage_dir: dir.join(peer_id),
        registry_path: None,
    }
}

struct Running {
    addr: SocketAddr,
    events: UnboundedReceiver<NodeEvent>,
    commands: mpsc::UnboundedSender<NodeCommand>,
    task: JoinHandle<anyhow::Result<NodeExit>>,
}

async fn start_host(dir: &Path, tracks: Vec<PathBuf>, operators: Vec<String>, stop: &SignalOfStop) -> Running {
    let mut cfg = config(Role::Host, "host", dir);
    cfg.tracks = tracks;
    cfg.operators = operators;
    let mut host = Host::new(cfg, Box::new(ClockPlayer::new()), stop.clone()).unwrap();
    let events = host.subscribe();
    let handles = host.handles();
    let addr = tcp::listen(
        "127.0.0.1:0".parse().unwrap(),
        handles.link_ids.clone(),
        handles.link_events.clone(),
        stop.clone(),
    )
    .await
    .unwrap();
    let task = tokio::spawn(async move { host.run().await });
    Running {
        addr,
        events,
        commands: handles.commands,
        task,
    }
}

async fn start_guest(dir: &Path, peer_id: &str, code: &str, to: SocketAddr, stop: &SignalOfStop) -> Running {
    let mut cfg = config(Role::Guest, peer_id, dir);
    cfg.session_code = code.to_string();
    let mut guest = Guest::new(cfg, Box::new(ClockPlayer::new()), stop.clone()).unwrap();
    let events = guest.subscribe();
    let handles = guest.handles();
    let link = tcp::connect(to, &handles.link_ids, handles.link_events.clone())
        .await
        .unwrap();
    guest.attach_upstream(link).unwrap();
    let task = tokio::spawn(async move { guest.run().await });
    Running {
        addr: to,
        events,
        commands: handles.commands,
        task,
    }
}

/// A guest that also accepts peers below it. Returns the node and the
/// address it relays on.
async fn start_relay(dir: &Path, peer_id: &str, to: SocketAddr, stop: &SignalOfStop) -> (Running, SocketAddr) {
    let mut guest = Guest::new(config(Role::Guest, peer_id, dir), Box::new(ClockPlayer::new()), stop.clone()).unwrap();
    let events = guest.subscribe();
    let handles = guest.handles();
    let relay_addr = tcp::listen(
        "127.0.0.1:0".parse().unwrap(),
        handles.link_ids.clone(),
        handles.link_events.clone(),
        stop.clone(),
    )
    .await
    .unwrap();
    let link = tcp::connect(to, &handles.link_ids, handles.link_events.clone())
        .await
        .unwrap();
    guest.attach_upstream(link).unwrap();
    let task = tokio::spawn(async move { guest.run().await });
    let running = Running {
        addr: to,
        events,
        commands: handles.commands,
        task,
    };
    (running, relay_addr)
}

/// A bare socket speaking the wire format without a node behind it.
struct RawPeer {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl RawPeer {
    async fn connect(to: SocketAddr) -> Self {
        let (read, writer) = TcpStream::connect(to).await.unwrap().into_split();
        Self {
            lines: BufReader::new(read).lines(),
            writer,
        }
    }

    async fn send(&mut self, json: &str) {
        self.writer.write_all(json.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    /// Every message type received until a `pong` arrives.
    async fn kinds_until_pong(&mut self) -> Vec<String> {
        tokio::time::timeout(WAIT, async {
            let mut kinds = Vec::new();
            while let Some(line) = self.lines.next_line().await.unwrap() {
                let value: serde_json::Value = serde_json::from_str(&line).unwrap();
                let kind = value["type"].as_str().unwrap_or_default().to_string();
                if kind == "pong" {
                    return kinds;
                }
                kinds.push(kind);
            }
            panic!("peer closed the socket")
        })
        .await
        .expect("no pong")
    }

    /// Next message type, if one arrives within `within`.
    async fn next_kind(&mut self, within: Duration) -> Option<String> {
        let line = tokio::time::timeout(within, self.lines.next_line()).await.ok()?.ok()??;
        let value: serde_json::Value = serde_json::from_str(&line).ok()?;
        value["type"].as_str().map(str::to_string)
    }
}

/// Every event up to and including the first one matching `want`.
async fn collect_until(events: &mut UnboundedReceiver<NodeEvent>, want: impl Fn(&NodeEvent) -> bool) -> Vec<NodeEvent> {
    tokio::time::timeout(WAIT, async {
        let mut seen = Vec::new();
        loop {
            let event = events.recv().await.expect("node stopped emitting");
            let done = want(&event);
            seen.push(event);
            if done {
                return seen;
            }
        }
    })
    .await
    .expect("timed out waiting for node event")
}

fn roster_has(event: &NodeEvent, id: &str, is_op: bool) -> bool {
    matches!(event, NodeEvent::RosterChanged(peers) if peers.iter().any(|p| p.id == id && p.is_op == is_op))
}

async fn wait_for(events: &mut UnboundedReceiver<NodeEvent>, want: impl Fn(&NodeEvent) -> bool) -> NodeEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("node stopped emitting");
            if want(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for node event")
}

async fn exit_of(running: Running) -> NodeExit {
    tokio::time::timeout(WAIT, running.task)
        .await
        .expect("node did not exit")
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn guest_joins_and_receives_current_track() {
    let dir = scratch("join");
    let stop = SignalOfStop::new();
    let track = media(&dir, "track.mp3", 100, 7);
    let mut host = start_host(&dir, vec![track.clone()], Vec::new(), &stop).await;
    wait_for(&mut host.events, |e| matches!(e, NodeEvent::SessionReady { .. })).await;

    let mut guest = start_guest(&dir, "guest-a", CODE, host.addr, &stop).await;
    let welcomed = wait_for(&mut guest.events, |e| matches!(e, NodeEvent::Welcomed { .. })).await;
    assert_eq!(
        welcomed,
        NodeEvent::Welcomed {
            slot: 1,
            label: "Left".into()
        }
    );

    let loaded = wait_for(&mut guest.events, |e| matches!(e, NodeEvent::TrackLoaded { .. })).await;
    let NodeEvent::TrackLoaded {
        track_index,
        filename,
        from_preload,
        ..
    } = loaded
    else {
        unreachable!()
    };
    assert_eq!((track_index, filename.as_str(), from_preload), (0, "track.mp3", false));

    let stored = dir
        .join("guest-a")
        .join(resource_name(SlotKind::Current, "track.mp3", "guest-a"));
    assert_eq!(std::fs::read(stored).unwrap(), std::fs::read(&track).unwrap());

    let roster = wait_for(&mut host.events, |e| {
        matches!(e, NodeEvent::RosterChanged(peers) if peers.iter().any(|p| p.id == "guest-a"))
    })
    .await;
    let NodeEvent::RosterChanged(peers) = roster else { unreachable!() };
    assert!(peers[0].is_host);

    stop.cancel();
    assert_eq!(exit_of(guest).await, NodeExit::Stopped);
    assert_eq!(exit_of(host).await, NodeExit::Stopped);
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn next_track_plays_from_preload() {
    let dir = scratch("preload");
    let stop = SignalOfStop::new();
    let a = media(&dir, "a.mp3", 8, 1);
    let b = media(&dir, "b.mp3", 12, 2);
    let host = start_host(&dir, vec![a, b], Vec::new(), &stop).await;
    let mut guest = start_guest(&dir, "guest-p", CODE, host.addr, &stop).await;

    wait_for(&mut guest.events, |e| matches!(e, NodeEvent::TrackLoaded { track_index: 0, .. })).await;
    let ready = wait_for(&mut guest.events, |e| matches!(e, NodeEvent::PreloadReady { .. })).await;
    assert_eq!(
        ready,
        NodeEvent::PreloadReady {
            track_index: 1,
            filename: "b.mp3".into()
        }
    );

    host.commands.send(NodeCommand::Track(1)).unwrap();
    let loaded = wait_for(&mut guest.events, |e| matches!(e, NodeEvent::TrackLoaded { track_index: 1, .. })).await;
    assert!(matches!(
        loaded,
        NodeEvent::TrackLoaded {
            from_preload: true,
            ..
        }
    ));

    stop.cancel();
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn operator_guest_can_change_track() {
    let dir = scratch("operator");
    let stop = SignalOfStop::new();
    let a = media(&dir, "a.mp3", 2, 3);
    let b = media(&dir, "b.mp3", 2, 4);
    let mut host = start_host(&dir, vec![a, b], vec!["guest-op".into()], &stop).await;
    let mut guest = start_guest(&dir, "guest-op", CODE, host.addr, &stop).await;

    wait_for(&mut guest.events, |e| matches!(e, NodeEvent::OperatorChanged(true))).await;
    guest.commands.send(NodeCommand::Track(1)).unwrap();
    wait_for(&mut host.events, |e| matches!(e, NodeEvent::TrackLoaded { track_index: 1, .. })).await;
    wait_for(&mut guest.events, |e| matches!(e, NodeEvent::TrackLoaded { track_index: 1, .. })).await;

    stop.cancel();
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn wrong_code_is_rejected() {
    let dir = scratch("reject");
    let stop = SignalOfStop::new();
    let track = media(&dir, "track.mp3", 1, 0);
    let host = start_host(&dir, vec![track], Vec::new(), &stop).await;

    let guest = start_guest(&dir, "intruder", "000000", host.addr, &stop).await;
    assert_eq!(exit_of(guest).await, NodeExit::Rejected("invalid session code".into()));

    stop.cancel();
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn fourth_guest_gets_session_full() {
    let dir = scratch("full");
    let stop = SignalOfStop::new();
    let track = media(&dir, "track.mp3", 1, 0);
    let host = start_host(&dir, vec![track], Vec::new(), &stop).await;

    let mut admitted = Vec::new();
    for i in 0..MAX_GUESTS {
        let mut g = start_guest(&dir, &format!("g{i}"), CODE, host.addr, &stop).await;
        wait_for(&mut g.events, |e| matches!(e, NodeEvent::Welcomed { .. })).await;
        admitted.push(g);
    }

    let late = start_guest(&dir, "g-late", CODE, host.addr, &stop).await;
    let exit = exit_of(late).await;
    assert!(matches!(exit, NodeExit::Rejected(ref msg) if msg.contains("full")), "{exit:?}");

    stop.cancel();
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn host_restart_reports_upstream_lost() {
    let dir = scratch("lost");
    let host_stop = SignalOfStop::new();
    let guest_stop = SignalOfStop::new();
    let track = media(&dir, "track.mp3", 1, 0);
    let host = start_host(&dir, vec![track], Vec::new(), &host_stop).await;
    let mut guest = start_guest(&dir, "g", CODE, host.addr, &guest_stop).await;
    wait_for(&mut guest.events, |e| matches!(e, NodeEvent::Welcomed { .. })).await;

    host_stop.cancel();
    assert_eq!(exit_of(host).await, NodeExit::Stopped);
    assert_eq!(exit_of(guest).await, NodeExit::UpstreamLost);

    guest_stop.cancel();
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn link_without_hello_is_ignored() {
    let dir = scratch("nohello");
    let stop = SignalOfStop::new();
    let track = media(&dir, "track.mp3", 4, 9);
    let mut host = start_host(&dir, vec![track], Vec::new(), &stop).await;
    wait_for(&mut host.events, |e| matches!(e, NodeEvent::SessionReady { .. })).await;

    let mut raw = RawPeer::connect(host.addr).await;
    raw.send(r#"{"type":"request-join","peerId":"intruder"}"#).await;
    raw.send(r#"{"type":"recovery-request","nextChunk":0,"slot":"current"}"#).await;
    raw.send(r#"{"type":"request-track","from":"intruder","index":0}"#).await;
    raw.send(r#"{"type":"ping","sentAt":1.0}"#).await;
    assert_eq!(raw.kinds_until_pong().await, Vec::<String>::new());

    // Broadcasts caused by a real join do not reach the bare link either.
    let mut guest = start_guest(&dir, "guest-a", CODE, host.addr, &stop).await;
    wait_for(&mut guest.events, |e| matches!(e, NodeEvent::TrackLoaded { .. })).await;
    let roster = wait_for(&mut host.events, |e| roster_has(e, "guest-a", false)).await;
    let NodeEvent::RosterChanged(peers) = roster else { unreachable!() };
    assert!(peers.iter().all(|p| p.id != "intruder"));
    assert_eq!(raw.next_kind(Duration::from_millis(500)).await, None);

    stop.cancel();
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn relayed_guest_joins_downloads_and_keeps_its_own_rights() {
    let dir = scratch("relay");
    let stop = SignalOfStop::new();
    let a = media(&dir, "a.mp3", 6, 5);
    let b = media(&dir, "b.mp3", 3, 6);
    let mut host = start_host(&dir, vec![a.clone(), b], Vec::new(), &stop).await;
    wait_for(&mut host.events, |e| matches!(e, NodeEvent::SessionReady { .. })).await;
    let (mut relay, relay_addr) = start_relay(&dir, "relay", host.addr, &stop).await;
    wait_for(&mut relay.events, |e| matches!(e, NodeEvent::TrackLoaded { track_index: 0, .. })).await;

    let mut below = start_guest(&dir, "below", CODE, relay_addr, &stop).await;
    let welcomed = wait_for(&mut below.events, |e| matches!(e, NodeEvent::Welcomed { .. })).await;
    assert_eq!(
        welcomed,
        NodeEvent::Welcomed {
            slot: 2,
            label: "Right".into()
        }
    );
    wait_for(&mut below.events, |e| matches!(e, NodeEvent::TrackLoaded { track_index: 0, .. })).await;
    let stored = dir.join("below").join(resource_name(SlotKind::Current, "a.mp3", "below"));
    assert_eq!(std::fs::read(stored).unwrap(), std::fs::read(&a).unwrap());

    // A bare link on the relay gets no fan-out and no file.
    let mut raw = RawPeer::connect(relay_addr).await;
    raw.send(r#"{"type":"recovery-request","nextChunk":0,"slot":"current"}"#).await;
    raw.send(r#"{"type":"ping","sentAt":1.0}"#).await;
    assert_eq!(raw.kinds_until_pong().await, Vec::<String>::new());

    // Rights granted to the relay stay with the relay.
    host.commands.send(NodeCommand::Grant("relay".into())).unwrap();
    wait_for(&mut relay.events, |e| matches!(e, NodeEvent::OperatorChanged(true))).await;
    let seen = collect_until(&mut below.events, |e| roster_has(e, "relay", true)).await;
    assert!(!seen.contains(&NodeEvent::OperatorChanged(true)), "{seen:?}");
    assert_eq!(raw.next_kind(Duration::from_millis(300)).await, None);

    // Rights granted below the relay reach only that peer, and its requests
    // travel up through the relay.
    host.commands.send(NodeCommand::Grant("below".into())).unwrap();
    wait_for(&mut below.events, |e| matches!(e, NodeEvent::OperatorChanged(true))).await;
    let seen = collect_until(&mut relay.events, |e| roster_has(e, "below", true)).await;
    assert!(!seen.contains(&NodeEvent::OperatorChanged(false)), "{seen:?}");

    below.commands.send(NodeCommand::Track(1)).unwrap();
    wait_for(&mut host.events, |e| matches!(e, NodeEvent::TrackLoaded { track_index: 1, .. })).await;
    wait_for(&mut below.events, |e| matches!(e, NodeEvent::TrackLoaded { track_index: 1, .. })).await;

    stop.cancel();
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test(start_paused = true)]
async fn unanswered_track_fails_after_three_resends_then_retries() {
    let dir = scratch("exhaust");
    let stop = SignalOfStop::new();
    let mut guest = Guest::new(config(Role::Guest, "lonely", &dir), Box::new(ClockPlayer::new()), stop.clone()).unwrap();
    let mut events = guest.subscribe();
    let handles = guest.handles();
    let (upstream, mut sent) = PeerLink::new(handles.link_ids.next(), None);
    guest.attach_upstream(upstream.clone()).unwrap();
    let task = tokio::spawn(async move { guest.run().await });

    let inject = |msg: ProtocolMessage| {
        handles
            .link_events
            .send(LinkEvent::Message {
                link: upstream.id(),
                text: msg.to_json().unwrap(),
            })
            .unwrap();
    };
    inject(ProtocolMessage::Welcome {
        peer_id: "lonely".into(),
        slot: 1,
        label: "Left".into(),
    });
    inject(ProtocolMessage::TrackChange {
        track_index: 0,
        filename: "a.mp3".into(),
        session_id: 40,
        generation: 1,
    });

    let whole_file_requests = |sent: &mut UnboundedReceiver<String>| {
        let mut n = 0;
        while let Ok(text) = sent.try_recv() {
            if let Ok(ProtocolMessage::RecoveryRequest { filename, next_chunk, .. }) = Envelope::parse(&text).unwrap().decode() {
                assert_eq!((filename.as_deref(), next_chunk), (Some("a.mp3"), 0));
                n += 1;
            }
        }
        n
    };

    let failed = tokio::time::timeout(Duration::from_secs(300), async {
        loop {
            match events.recv().await {
                Some(NodeEvent::TransferFailed { slot, filename, reason }) => return (slot, filename, reason),
                Some(_) => continue,
                None => panic!("guest stopped"),
            }
        }
    })
    .await
    .expect("no failure reported");
    assert_eq!(failed.0, SlotKind::Current);
    assert_eq!(failed.1, "a.mp3");
    assert!(failed.2.contains("exhausted"));
    // The first ask on track-change plus three resends.
    assert_eq!(whole_file_requests(&mut sent), 4);

    // After the watchdog timeout the track is asked for again.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(whole_file_requests(&mut sent) >= 1);

    stop.cancel();
    assert_eq!(task.await.unwrap().unwrap(), NodeExit::Stopped);
    let _ = std::fs::remove_dir_all(&dir);
}
