//! The netburst encoder (spec §4.4).
//!
//! Invoked once per newly-`REGISTERED` peer link. Emits, to that peer only,
//! every known server, then every registered client, then every live
//! channel, then the `EB` terminator — an order chosen so the peer can
//! always resolve a referenced token before the reference is used.
//!
//! Per SPEC_FULL.md §5 (resolving spec §9's Open Question): the client loop
//! iterates `clients.size()` and the channel loop iterates `channels.size()`
//! — not the source's documented bound mix-up.

use std::fmt::Write as _;

use crate::peer::LinkState;
use crate::state::Kernel;

/// Encode and send the full netburst to `peer_idx`. Sets `mid_burst` on the
/// peer entity for the duration and clears it once `EB` is sent.
pub fn send_netburst(kernel: &mut Kernel, peer_idx: usize) {
    let Some(peer) = kernel.servers.table.try_get_mut(peer_idx) else {
        return;
    };
    peer.mid_burst = true;
    let self_token = kernel.self_token();

    let mut out = String::new();

    // 1. Servers.
    for (_, srv) in kernel.servers.table.iter() {
        if srv.state != LinkState::Registered {
            continue;
        }
        let _ = writeln!(
            out,
            "{} S {} {} {} {} J10 {} :{}\r",
            self_token, srv.name, srv.hops, srv.boot_ts, srv.link_ts, srv.token, srv.description
        );
    }

    // 2. Clients — iterate clients.size(), not channels.size() (spec §9).
    for idx in 0..kernel.clients.size() {
        let Some(client) = kernel.clients.table.try_get(idx) else {
            continue;
        };
        if !client.is_reg {
            continue;
        }
        let owner = kernel.servers.table.try_get(client.sindex);
        let owner_token = owner.map(|s| s.token).unwrap_or(client.server_token);
        let hops = owner.map(|s| s.hops).unwrap_or(1);
        let _ = writeln!(
            out,
            "{} N {} {} 0 {} {} {} {} {} :{}\r",
            owner_token,
            client.nick,
            hops,
            client.user,
            client.host,
            if client.modes.is_empty() { "+" } else { &client.modes },
            client.ip,
            idx,
            client.realname
        );
    }

    // 3. Channels — iterate channels.size().
    for idx in 0..kernel.channels.size() {
        let Some(ch) = kernel.channels.named.table.try_get(idx) else {
            continue;
        };
        if let Some(topic) = &ch.topic {
            let _ = writeln!(
                out,
                "{} B {} {} {}\r",
                self_token, ch.name, ch.created_at, ch.modes
            );
            let _ = topic; // topic text itself travels via TOPIC relay, not the burst line (spec §4.4).
        } else {
            let _ = writeln!(
                out,
                "{} C {} {} {}\r",
                self_token, ch.name, ch.modes, ch.created_at
            );
        }
    }

    // 4. Terminator.
    out.push_str("EB\r\n");

    if let Some(peer) = kernel.servers.table.try_get(peer_idx) {
        peer.enqueue(std::sync::Arc::from(out.into_bytes().into_boxed_slice()));
    }
    if let Some(peer) = kernel.servers.table.try_get_mut(peer_idx) {
        peer.mid_burst = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn burst_ordering_servers_then_clients_then_channels_then_eb() {
        let mut k = Kernel::new(crate::config::test_config());

        let (peer_tx, mut peer_rx) = mpsc::channel(16);
        let peer_idx = k.servers.create(crate::peer::PeerServer::local(
            peer_tx,
            "leaf".into(),
            'B',
            "leaf server".into(),
            0,
        ));
        k.servers.table.get_mut(peer_idx).state = LinkState::Registered;

        let (ctx, _crx) = mpsc::channel(16);
        let cidx = k
            .clients
            .create(Client::new(ctx, "127.0.0.1".into(), k.self_token(), k.self_sindex, 0));
        {
            let c = k.clients.table.get_mut(cidx);
            c.nick = "alice".into();
            c.user = "alice".into();
            c.is_reg = true;
        }
        k.clients.index_nick("alice", cidx);

        k.channels.create("#general", 0);

        send_netburst(&mut k, peer_idx);

        let bytes = peer_rx.try_recv().expect("burst should be a single buffer");
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        let s_pos = lines.iter().position(|l| l.contains(" S ")).unwrap();
        let n_pos = lines.iter().position(|l| l.contains(" N ")).unwrap();
        let c_pos = lines
            .iter()
            .position(|l| l.contains(" C #general"))
            .unwrap();
        let eb_pos = lines.iter().position(|&l| l == "EB").unwrap();

        assert!(s_pos < n_pos, "servers must precede clients");
        assert!(n_pos < c_pos, "clients must precede channels");
        assert!(c_pos < eb_pos, "EB must terminate the burst");
        assert_eq!(eb_pos, lines.len() - 1, "EB must be the last line");

        assert!(peer_rx.try_recv().is_err(), "no interleaved traffic during burst");
    }
}
