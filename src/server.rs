//! Top-level server: listeners, tickers, and the single core loop (spec
//! §5 "Execution model").
//!
//! Every socket gets its own reader/writer task pair (teacher's split in
//! `connection/mod.rs::handle_io`); those tasks only ever talk to the core
//! through [`Event`]s on one shared `mpsc` channel. The core loop below is
//! the *only* code that touches a [`Kernel`] — by construction, not by
//! locking.

use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};

use crate::config::ServerConfig;
use crate::dispatch;
use crate::event::Event;
use crate::linkstate;
use crate::reaper;
use crate::state::Kernel;

pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    pub async fn run(self) -> Result<()> {
        let (inbox, mut rx) = mpsc::channel::<Event>(4096);

        let client_listener = TcpListener::bind(&self.config.client_addr).await?;
        tracing::info!(addr = %self.config.client_addr, "client listener up");

        {
            let inbox = inbox.clone();
            tokio::spawn(async move {
                loop {
                    match client_listener.accept().await {
                        Ok((stream, addr)) => {
                            tokio::spawn(handle_client(stream, addr.ip().to_string(), inbox.clone()));
                        }
                        Err(e) => {
                            tracing::warn!("client accept failed: {e}");
                        }
                    }
                }
            });
        }

        {
            let addr = self.config.peer_addr.clone();
            let inbox = inbox.clone();
            tokio::spawn(async move {
                if let Err(e) = linkstate::run_peer_listener(addr, inbox).await {
                    tracing::error!("peer listener died: {e}");
                }
            });
        }

        reaper::spawn_ticker(inbox.clone());
        linkstate::spawn_ticker(inbox.clone(), self.config.connect_interval_secs);

        let mut kernel = Kernel::new(self.config);
        // Kick off the first connection attempts immediately rather than
        // waiting a full tick (spec §4.3 `call_remote_servers`).
        linkstate::call_remote_servers(&kernel, &inbox);

        while let Some(event) = rx.recv().await {
            match event {
                Event::ClientConnected { ip, tx, reply } => {
                    // On `CoreError::Resource`, the reply sender is simply
                    // dropped: the accept task's `reply_rx.await` then fails
                    // and it returns without spawning reader/writer tasks,
                    // which closes the socket (spec §7 "refuse the new
                    // connection with a transient error").
                    match dispatch::on_client_connected(&mut kernel, ip, tx) {
                        Ok(cindex) => {
                            let _ = reply.send(cindex);
                        }
                        Err(e) => tracing::warn!("refusing client connection: {e}"),
                    }
                }
                Event::ClientLine { cindex, line } => {
                    dispatch::handle_client_line(&mut kernel, cindex, line);
                }
                Event::ClientClosed { cindex } => {
                    dispatch::on_client_closed(&mut kernel, cindex);
                }
                Event::PeerConnected { record, tx, reply } => {
                    let sindex = dispatch::on_peer_connected(&mut kernel, record, tx);
                    let _ = reply.send(sindex);
                }
                Event::PeerLine { sindex, line } => {
                    dispatch::handle_peer_line(&mut kernel, sindex, line);
                }
                Event::PeerClosed { sindex } => {
                    dispatch::on_peer_closed(&mut kernel, sindex);
                }
                Event::ReaperTick => {
                    reaper::sweep(&mut kernel);
                }
                Event::ConnectTick => {
                    linkstate::call_remote_servers(&kernel, &inbox);
                }
                Event::OutboundFailed { record } => {
                    tracing::debug!(peer = %record.name, "will retry on next connector tick");
                }
            }
        }

        Ok(())
    }
}

/// Split a client socket into reader/writer tasks and register it with the
/// core, mirroring `linkstate::spawn_peer_io` on the peer side.
async fn handle_client(stream: tokio::net::TcpStream, ip: String, inbox: mpsc::Sender<Event>) {
    let (reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<Arc<[u8]>>(1024);

    let (reply_tx, reply_rx) = oneshot::channel();
    if inbox
        .send(Event::ClientConnected { ip, tx, reply: reply_tx })
        .await
        .is_err()
    {
        return;
    }
    let Ok(cindex) = reply_rx.await else {
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
    const MAX_LINE_LEN: usize = 8192;
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                if line.len() > MAX_LINE_LEN {
                    tracing::warn!(%cindex, len = line.len(), "line too long, dropping connection");
                    break;
                }
                if inbox
                    .send(Event::ClientLine {
                        cindex,
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
    let _ = inbox.send(Event::ClientClosed { cindex }).await;
}
