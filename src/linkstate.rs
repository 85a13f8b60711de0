//! Peer socket I/O and the outbound connector (spec §4.3 "Peer link state
//! machine", `call_remote_servers`).
//!
//! Dialing a peer and accepting one both end the same way: a reader/writer
//! task pair spawned per socket (teacher's split in
//! `connection/mod.rs::handle_io`), translating line activity into
//! [`Event`]s for the core loop. Neither task ever touches a table —
//! they only know their own `sindex` once the core hands it back.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;

use crate::config::RemoteServerRecord;
use crate::entity::NO_SUCH;
use crate::event::{Event, Inbox};
use crate::state::Kernel;

/// Spawn the ticker that fires `Event::ConnectTick` on the configured
/// cadence (spec §4.3 `call_remote_servers`).
pub fn spawn_ticker(inbox: Inbox, interval_secs: u64) {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(interval_secs));
        loop {
            ticker.tick().await;
            if inbox.send(Event::ConnectTick).await.is_err() {
                return;
            }
        }
    });
}

/// Dial every configured peer we don't already have a live (connecting or
/// registered) link to. The table lookup happens here, inside the core
/// task; the actual connect runs in a detached task so it can't stall the
/// core on a slow or dead address.
pub fn call_remote_servers(kernel: &Kernel, inbox: &Inbox) {
    for record in &kernel.config.remote_servers {
        if kernel.servers.find_name(&record.name) != NO_SUCH {
            continue;
        }
        spawn_outbound_attempt(record.clone(), inbox.clone());
    }
}

fn spawn_outbound_attempt(record: RemoteServerRecord, inbox: Inbox) {
    tokio::spawn(async move {
        let addr = format!("{}:{}", record.address, record.port);
        match TcpStream::connect(&addr).await {
            Ok(stream) => spawn_peer_io(stream, Some(record), inbox).await,
            Err(e) => {
                tracing::warn!(peer = %record.name, %addr, "outbound connect failed: {e}");
                let _ = inbox.send(Event::OutboundFailed { record }).await;
            }
        }
    });
}

/// Accept loop for the peer listener (spec §3 "Peer server" inbound half).
pub async fn run_peer_listener(addr: String, inbox: Inbox) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "peer listener up");
    loop {
        let (stream, peer_addr) = listener.accept().await?;
        tracing::info!(%peer_addr, "inbound peer connection");
        tokio::spawn(spawn_peer_io(stream, None, inbox.clone()));
    }
}

/// Split `stream` into reader/writer tasks, register the link with the
/// core, and pump lines until the socket dies.
async fn spawn_peer_io(stream: TcpStream, record: Option<RemoteServerRecord>, inbox: Inbox) {
    let (reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<Arc<[u8]>>(1024);

    let (reply_tx, reply_rx) = oneshot::channel();
    if inbox
        .send(Event::PeerConnected {
            record,
            tx,
            reply: reply_tx,
        })
        .await
        .is_err()
    {
        return;
    }
    let Ok(sindex) = reply_rx.await else {
        return;
    };

    tokio::spawn(async move {
        while let Some(buf) = rx.recv().await {
            if writer.write_all(&buf).await.is_err() {
                break;
            }
        }
    });

    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                if inbox
                    .send(Event::PeerLine {
                        sindex,
                        line: line.clone(),
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }
    let _ = inbox.send(Event::PeerClosed { sindex }).await;
}
