//! Newline-delimited JSON over TCP.
//!
//! Each link gets a reader task (lines → [`LinkEvent::Message`]) and a writer
//! task (outbound queue → socket). The reader owns the lifecycle: it emits
//! exactly one [`LinkEvent::Closed`] whether the socket dropped or the link
//! was closed locally.

use anyhow::{Context, Result};
use futures_util::StreamExt;
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};

use super::{LinkEvent, LinkIds, PeerLink};
use crate::core::config::MAX_MESSAGE_SIZE;
use crate::utils::sos::SignalOfStop;

/// Wrap a connected stream in a [`PeerLink`] and announce it.
pub fn attach(stream: TcpStream, ids: &LinkIds, events: mpsc::UnboundedSender<LinkEvent>) -> PeerLink {
    let remote = stream.peer_addr().ok();
    let _ = stream.set_nodelay(true);
    let (link, mut outbound) = PeerLink::new(ids.next(), remote);
    let id = link.id();
    let stop = link.stop_signal();
    let (read_half, mut write_half) = stream.into_split();
    let _ = events.send(LinkEvent::Opened(link.clone()));

    let writer_stop = stop.clone();
    tokio::spawn(async move {
        loop {
            // Queued messages go out before a local close takes effect.
            let text = tokio::select! {
                biased;
                next = outbound.recv() => match next {
                    Some(text) => text,
                    None => break,
                },
                _ = writer_stop.wait() => break,
            };
            let written = async {
                write_half.write_all(text.as_bytes()).await?;
                write_half.write_all(b"\n").await
            };
            if let Err(e) = written.await {
                debug!(event = "tcp_write_failed", link = %id, error = %e, "Write failed; closing link");
                break;
            }
        }
        writer_stop.cancel();
        let _ = write_half.shutdown().await;
    });

    let reader_events = events.clone();
    tokio::spawn(async move {
        // Lines longer than the message cap are never buffered whole.
        let mut lines = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_MESSAGE_SIZE));
        loop {
            let line = tokio::select! {
                _ = stop.wait() => break,
                line = lines.next() => line,
            };
            match line {
                Some(Ok(text)) => {
                    if text.trim().is_empty() {
                        continue;
                    }
                    if reader_events.send(LinkEvent::Message { link: id, text }).is_err() {
                        break;
                    }
                }
                None => break,
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    warn!(event = "oversize_message", link = %id, max = MAX_MESSAGE_SIZE, "Oversize message; closing link");
                    break;
                }
                Some(Err(LinesCodecError::Io(e))) => {
                    debug!(event = "tcp_read_failed", link = %id, error = %e, "Read failed; closing link");
                    break;
                }
            }
        }
        stop.cancel();
        let _ = reader_events.send(LinkEvent::Closed { link: id });
    });

    link
}

/// Dial `addr` and attach the stream.
pub async fn connect(addr: SocketAddr, ids: &LinkIds, events: mpsc::UnboundedSender<LinkEvent>) -> Result<PeerLink> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connect to {addr}"))?;
    info!(event = "tcp_connected", remote = %addr, "Connected");
    Ok(attach(stream, ids, events))
}

/// Bind `addr` and attach every accepted stream until `stop` fires.
/// Returns the bound address.
pub async fn listen(
    addr: SocketAddr,
    ids: LinkIds,
    events: mpsc::UnboundedSender<LinkEvent>,
    stop: SignalOfStop,
) -> Result<SocketAddr> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    let bound = listener.local_addr()?;
    info!(event = "tcp_listening", addr = %bound, "Accepting peers");

    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = stop.wait() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, remote)) => {
                    debug!(event = "tcp_accepted", remote = %remote, "Inbound connection");
                    attach(stream, &ids, events.clone());
                }
                Err(e) => warn!(event = "tcp_accept_failed", error = %e, "Accept failed"),
            }
        }
    });
    Ok(bound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::ProtocolMessage;

    #[tokio::test]
    async fn messages_flow_both_ways_and_close_is_reported() {
        let ids = LinkIds::default();
        let stop = SignalOfStop::new();
        let (server_tx, mut server_rx) = mpsc::unbounded_channel();
        let bound = listen("127.0.0.1:0".parse().unwrap(), ids.clone(), server_tx, stop.clone())
            .await
            .unwrap();

        let (client_tx, mut client_rx) = mpsc::unbounded_channel();
        let client = connect(bound, &ids, client_tx).await.unwrap();
        assert!(matches!(client_rx.recv().await.unwrap(), LinkEvent::Opened(_)));

        let server = match server_rx.recv().await.unwrap() {
            LinkEvent::Opened(link) => link,
            other => panic!("unexpected {other:?}"),
        };
        assert_ne!(server.id(), client.id());

        client.send(&ProtocolMessage::Ping { sent_at: 4.0 }).unwrap();
        match server_rx.recv().await.unwrap() {
            LinkEvent::Message { link, text } => {
                assert_eq!(link, server.id());
                assert!(text.contains("\"sentAt\":4.0"));
            }
            other => panic!("unexpected {other:?}"),
        }

        server.send(&ProtocolMessage::Pong { sent_at: 4.0 }).unwrap();
        assert!(matches!(client_rx.recv().await.unwrap(), LinkEvent::Message { .. }));

        client.close();
        assert!(matches!(client_rx.recv().await.unwrap(), LinkEvent::Closed { .. }));
        assert!(matches!(server_rx.recv().await.unwrap(), LinkEvent::Closed { .. }));
        stop.cancel();
    }

    #[tokio::test]
    async fn unterminated_oversize_line_closes_the_link() {
        let ids = LinkIds::default();
        let stop = SignalOfStop::new();
        let (server_tx, mut server_rx) = mpsc::unbounded_channel();
        let bound = listen("127.0.0.1:0".parse().unwrap(), ids.clone(), server_tx, stop.clone())
            .await
            .unwrap();

        let mut raw = TcpStream::connect(bound).await.unwrap();
        assert!(matches!(server_rx.recv().await.unwrap(), LinkEvent::Opened(_)));

        // No newline ever arrives; the reader must give up at the cap.
        let junk = vec![b'x'; MAX_MESSAGE_SIZE + 4096];
        let _ = raw.write_all(&junk).await;

        let closed = tokio::time::timeout(std::time::Duration::from_secs(10), server_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(closed, LinkEvent::Closed { .. }), "{closed:?}");
        stop.cancel();
    }
}
