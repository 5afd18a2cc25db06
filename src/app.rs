//! Process driver: builds the node for the selected role, wires transports,
//! stdin commands and event reporting, and keeps a guest connected.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::core::config::RECONNECT_RETRY_DELAYS;
use crate::core::connection::tcp;
use crate::core::node::{Guest, Host, NodeCommand, NodeConfig, NodeEvent, NodeExit, NodeHandles, Role};
use crate::core::peer_registry::PeerRegistry;
use crate::core::sync::ClockPlayer;
use crate::utils::data_dir;
use crate::utils::sos::SignalOfStop;
use crate::workers::args::Args;

pub async fn run(args: Args, data_root: &Path, sos: SignalOfStop) -> Result<()> {
    let role = args.role();
    let config = NodeConfig {
        role,
        peer_id: args
            .peer_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()),
        display_name: args.display_name.clone(),
        session_code: args.session_code.clone().unwrap_or_default(),
        tracks: args.tracks.clone(),
        operators: args.operators.clone(),
        instance_id: uuid::Uuid::new_v4().simple().to_string(),
        storage_dir: data_dir::storage_dir(data_root),
        registry_path: (role == Role::Host).then(|| PeerRegistry::path_in(data_root)),
    };
    info!(event = "node_config", role = ?role, peer_id = %config.peer_id, instance_id = %config.instance_id, "Starting");

    match role {
        Role::Host => run_host(args, config, sos).await,
        Role::Guest => run_guest(args, config, sos).await,
    }
}

async fn run_host(args: Args, config: NodeConfig, sos: SignalOfStop) -> Result<()> {
    let listen = args
        .listen
        .ok_or_else(|| anyhow!("the host needs --listen <addr>"))?;
    let mut host = Host::new(config, Box::new(ClockPlayer::new()), sos.clone())?;
    let handles = host.handles();
    spawn_reporter(host.subscribe());
    spawn_stdin_commands(handles.commands.clone(), sos.clone());

    let bound = tcp::listen(listen, handles.link_ids, handles.link_events, sos.clone()).await?;
    eprintln!("Session code {} on {bound}", host.session_code());

    host.run().await?;
    Ok(())
}

async fn run_guest(args: Args, config: NodeConfig, sos: SignalOfStop) -> Result<()> {
    let upstream = args
        .connect
        .ok_or_else(|| anyhow!("a guest needs --connect <addr>"))?;
    if config.session_code.is_empty() {
        bail!("a guest needs --session-code");
    }
    let mut guest = Guest::new(config, Box::new(ClockPlayer::new()), sos.clone())?;
    let handles = guest.handles();
    spawn_reporter(guest.subscribe());
    spawn_stdin_commands(handles.commands.clone(), sos.clone());

    if let Some(listen) = args.listen {
        let bound = tcp::listen(listen, handles.link_ids.clone(), handles.link_events.clone(), sos.clone()).await?;
        info!(event = "relay_listening", addr = %bound, "Accepting peers to relay");
    }

    let link = tcp::connect(upstream, &handles.link_ids, handles.link_events.clone())
        .await
        .context("joining session")?;
    guest.attach_upstream(link)?;

    loop {
        match guest.run().await? {
            NodeExit::Stopped => return Ok(()),
            NodeExit::Rejected(reason) => bail!("host refused this guest: {reason}"),
            NodeExit::UpstreamLost => {
                let targets = reconnect_targets(upstream, args.fallback);
                let Some(link) = reconnect(&targets, &handles, &sos).await else {
                    if sos.cancelled() {
                        return Ok(());
                    }
                    bail!("could not reach {upstream} again");
                };
                guest.attach_upstream(link)?;
            }
        }
    }
}

/// The usual upstream first, then the direct host address if one is set.
fn reconnect_targets(upstream: SocketAddr, fallback: Option<SocketAddr>) -> Vec<SocketAddr> {
    let mut targets = vec![upstream];
    targets.extend(fallback.filter(|f| *f != upstream));
    targets
}

/// Dial `targets` in order on the reconnect schedule.
async fn reconnect(
    targets: &[SocketAddr],
    handles: &NodeHandles,
    sos: &SignalOfStop,
) -> Option<crate::core::connection::PeerLink> {
    for (attempt, secs) in RECONNECT_RETRY_DELAYS.iter().enumerate() {
        warn!(event = "reconnect_wait", attempt = attempt + 1, delay_secs = secs, "Reconnecting soon");
        sos.run_until(tokio::time::sleep(Duration::from_secs(*secs))).await?;
        for addr in targets {
            match tcp::connect(*addr, &handles.link_ids, handles.link_events.clone()).await {
                Ok(link) => {
                    info!(event = "reconnected", addr = %addr, attempt = attempt + 1, "Upstream restored");
                    return Some(link);
                }
                Err(e) => warn!(event = "reconnect_failed", addr = %addr, attempt = attempt + 1, error = %e, "Reconnect failed"),
            }
        }
    }
    None
}

fn spawn_reporter(mut events: mpsc::UnboundedReceiver<NodeEvent>) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                NodeEvent::SessionReady { session_code } => {
                    info!(event = "session_ready", session_code = %session_code, "Session ready")
                }
                NodeEvent::Welcomed { slot, label } => {
                    info!(event = "welcomed", slot, label = %label, "Joined")
                }
                NodeEvent::RosterChanged(peers) => {
                    info!(event = "roster", peers = peers.len(), "Roster changed")
                }
                NodeEvent::OperatorChanged(is_op) => info!(event = "operator", is_op, "Operator rights changed"),
                NodeEvent::TrackLoaded {
                    track_index,
                    filename,
                    from_preload,
                    ..
                } => info!(event = "track_loaded", track_index, filename = %filename, from_preload, "Track loaded"),
                NodeEvent::PreloadReady { track_index, filename } => {
                    info!(event = "preload_ready", track_index, filename = %filename, "Next track ready")
                }
                NodeEvent::TransferFailed { slot, filename, reason } => {
                    error!(event = "transfer_failed", slot = %slot, filename = %filename, reason = %reason, "Transfer failed")
                }
            }
        }
    });
}

fn spawn_stdin_commands(commands: mpsc::UnboundedSender<NodeCommand>, sos: SignalOfStop) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = match sos.run_until(lines.next_line()).await {
                Some(Ok(Some(line))) => line,
                _ => break,
            };
            if line.trim().is_empty() {
                continue;
            }
            match parse_command(&line) {
                Ok(cmd) => {
                    if commands.send(cmd).is_err() {
                        break;
                    }
                }
                Err(e) => eprintln!("{e}"),
            }
        }
    });
}

/// `play`, `pause`, `seek <secs>`, `track <index>`, `nudge <secs>`,
/// `grant <peer>`, `revoke <peer>`, `roster`.
pub fn parse_command(line: &str) -> Result<NodeCommand> {
    let mut words = line.split_whitespace();
    let verb = words.next().unwrap_or_default();
    let arg = words.next();
    let need = |what: &str| arg.ok_or_else(|| anyhow!("{verb} needs {what}"));

    Ok(match verb {
        "play" => NodeCommand::Play,
        "pause" => NodeCommand::Pause,
        "roster" => NodeCommand::Roster,
        "seek" => NodeCommand::Seek(need("a position")?.parse().context("seek position")?),
        "track" => NodeCommand::Track(need("an index")?.parse().context("track index")?),
        "nudge" => NodeCommand::Nudge(need("an offset")?.parse().context("nudge offset")?),
        "grant" => NodeCommand::Grant(need("a peer id")?.to_string()),
        "revoke" => NodeCommand::Revoke(need("a peer id")?.to_string()),
        other => bail!("unknown command {other:?}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands() {
        assert_eq!(parse_command("play").unwrap(), NodeCommand::Play);
        assert_eq!(parse_command("  seek 42.5 ").unwrap(), NodeCommand::Seek(42.5));
        assert_eq!(parse_command("track 2").unwrap(), NodeCommand::Track(2));
        assert_eq!(parse_command("nudge -0.25").unwrap(), NodeCommand::Nudge(-0.25));
        assert_eq!(parse_command("grant g1").unwrap(), NodeCommand::Grant("g1".into()));
    }

    #[test]
    fn fallback_is_tried_after_the_upstream() {
        let relay: SocketAddr = "192.168.1.21:7001".parse().unwrap();
        let host: SocketAddr = "192.168.1.20:7000".parse().unwrap();
        assert_eq!(reconnect_targets(relay, Some(host)), vec![relay, host]);
        assert_eq!(reconnect_targets(host, Some(host)), vec![host]);
        assert_eq!(reconnect_targets(relay, None), vec![relay]);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse_command("seek").is_err());
        assert!(parse_command("track two").is_err());
        assert!(parse_command("dance").is_err());
    }
}
