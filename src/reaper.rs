//! The idle/timeout reaper (spec §4.5).
//!
//! The reaper is the *only* component that may observe time-based
//! liveness violations and initiate cleanup. The ticker that wakes it
//! lives outside the core (spawned by `server.rs`); the actual sweep
//! below runs inside the core loop like every other event, so it mutates
//! tables without any lock.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::interval;

use crate::event::Event;
use crate::state::{unix_now, Kernel};

pub const TICK: Duration = Duration::from_secs(5);
pub const FIRST_FIRE: Duration = Duration::from_secs(10);

/// Spawn the ticker that fires every 5s, first fire after 10s (spec §4.5).
pub fn spawn_ticker(inbox: mpsc::Sender<Event>) {
    tokio::spawn(async move {
        tokio::time::sleep(FIRST_FIRE).await;
        let mut ticker = interval(TICK);
        loop {
            ticker.tick().await;
            if inbox.send(Event::ReaperTick).await.is_err() {
                return;
            }
        }
    });
}

/// One sweep: expire clients and peers whose `last_activity` predates the
/// idle threshold, pinging once before killing.
pub fn sweep(kernel: &mut Kernel) {
    let now = unix_now();
    kernel.cheap_ts = now;
    let threshold = kernel.config.idle_timeout_secs;

    let mut to_kill_clients = Vec::new();
    let mut to_ping_clients = Vec::new();
    for (idx, client) in kernel.clients.table.iter_mut() {
        if now.saturating_sub(client.last_activity) < threshold {
            continue;
        }
        if client.pinged {
            to_kill_clients.push(idx);
        } else if client.is_reg {
            client.pinged = true;
            to_ping_clients.push(idx);
        } else {
            // Unregistered and idle too long — just drop it.
            to_kill_clients.push(idx);
        }
    }
    for idx in to_ping_clients {
        if let Some(c) = kernel.clients.table.try_get(idx) {
            let server_name = kernel.config.server_name.clone();
            c.enqueue(std::sync::Arc::from(
                format!("PING :{server_name}\r\n").into_bytes().into_boxed_slice(),
            ));
        }
    }
    for idx in to_kill_clients {
        crate::dispatch::kill_client(kernel, idx, "Ping timeout");
    }

    let mut to_close_peers = Vec::new();
    let mut to_ping_peers = Vec::new();
    for (idx, peer) in kernel.servers.table.iter_mut() {
        if idx == kernel.self_sindex || !peer.is_local {
            continue;
        }
        if now.saturating_sub(peer.last_activity) < threshold {
            continue;
        }
        if peer.pinged {
            to_close_peers.push(idx);
        } else {
            peer.pinged = true;
            to_ping_peers.push(idx);
        }
    }
    for idx in to_ping_peers {
        if let Some(p) = kernel.servers.table.try_get(idx) {
            p.enqueue(std::sync::Arc::from(
                b"PING :reaper\r\n".to_vec().into_boxed_slice(),
            ));
        }
    }
    for idx in to_close_peers {
        crate::dispatch::close_peer(kernel, idx, "Ping timeout");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn idle_registered_client_gets_pinged_then_killed() {
        let mut k = Kernel::new(crate::config::test_config());
        let (tx, mut rx) = mpsc::channel(16);
        let idx = k
            .clients
            .create(Client::new(tx, "127.0.0.1".into(), k.self_token(), k.self_sindex, 0));
        {
            let c = k.clients.table.get_mut(idx);
            c.is_reg = true;
            c.nick = "idle".into();
            c.last_activity = 0;
        }
        k.clients.index_nick("idle", idx);
        k.counters.total_users = 1;
        k.counters.local_users = 1;

        // First sweep past the threshold: ping, not kill.
        sweep(&mut k);
        assert!(k.clients.table.is_live(idx));
        let ping = rx.try_recv().unwrap();
        assert!(String::from_utf8(ping.to_vec()).unwrap().starts_with("PING"));

        // Still idle on the next sweep (pinged already set): kill.
        k.clients.table.get_mut(idx).last_activity = 0;
        sweep(&mut k);
        assert!(!k.clients.table.is_live(idx));
        assert_eq!(k.counters.total_users, 0);
    }
}
