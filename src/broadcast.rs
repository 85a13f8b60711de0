//! The broadcast fan-out engine (spec §4.2) and server-to-server relay
//! (spec §4.3 "Server-to-server relaying").

use std::collections::HashSet;
use std::sync::Arc;

use crate::state::Kernel;

/// Build the destination set for a source client: every member of every
/// channel `src` is in, optionally including `src` itself.
fn destinations(kernel: &Kernel, src: usize, include_src: bool) -> HashSet<usize> {
    let mut set = HashSet::new();
    if include_src {
        set.insert(src);
    }
    if let Some(client) = kernel.clients.table.try_get(src) {
        for &ch_idx in &client.channels {
            if let Some(ch) = kernel.channels.named.table.try_get(ch_idx) {
                set.extend(ch.members.iter().copied());
            }
        }
    }
    set
}

/// Wrap a formatted line in the shared, reference-counted buffer every
/// destination's send queue will hold a clone of (spec §4.2 "Zero-copy
/// policy", §5 "Shared resource"). Read-only after construction, released
/// when the last reference drops.
fn shared(line: String) -> Arc<[u8]> {
    Arc::from(line.into_bytes().into_boxed_slice())
}

fn deliver(kernel: &Kernel, dests: &HashSet<usize>, buf: &Arc<[u8]>) {
    for &idx in dests {
        if let Some(client) = kernel.clients.table.try_get(idx) {
            client.enqueue(Arc::clone(buf));
        }
    }
}

/// `user_bcast(src, from, numeric, tail)` — spec §4.2.
pub fn user_bcast(kernel: &Kernel, src: usize, from: &str, num: u16, tail: &str) {
    let line = crate::wire::numeric(from, num, tail);
    let dests = destinations(kernel, src, true);
    deliver(kernel, &dests, &shared(line));
}

/// `user_bcast_butone` — same destination set, excluding `src`.
pub fn user_bcast_butone(kernel: &Kernel, src: usize, from: &str, num: u16, tail: &str) {
    let line = crate::wire::numeric(from, num, tail);
    let dests = destinations(kernel, src, false);
    deliver(kernel, &dests, &shared(line));
}

/// Broadcast a pre-formatted raw line (the "raw-buffer form" in spec §4.2),
/// e.g. a command line like `:nick!user@host PRIVMSG #x :hi\r\n` that
/// doesn't fit the `numeric` shape.
pub fn user_bcast_raw(kernel: &Kernel, src: usize, line: String) {
    let dests = destinations(kernel, src, true);
    deliver(kernel, &dests, &shared(line));
}

pub fn user_bcast_raw_butone(kernel: &Kernel, src: usize, line: String) {
    let dests = destinations(kernel, src, false);
    deliver(kernel, &dests, &shared(line));
}

/// `sbcast(msg)` — send to every local, registered peer.
pub fn sbcast(kernel: &Kernel, msg: &str) {
    let buf = shared(msg.to_string());
    for (_, peer) in kernel.servers.local_registered() {
        peer.enqueue(Arc::clone(&buf));
    }
}

/// `sbcast_butone(origin, msg)` — every local registered peer except the
/// link the message arrived on. Origin exclusion happens before the first
/// byte is enqueued to any peer (spec §5 ordering guarantee (b)).
pub fn sbcast_butone(kernel: &Kernel, origin: usize, msg: &str) {
    let buf = shared(msg.to_string());
    for (idx, peer) in kernel.servers.local_registered() {
        if idx == origin {
            continue;
        }
        peer.enqueue(Arc::clone(&buf));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::entity::NO_SUCH;
    use tokio::sync::mpsc;

    fn kernel() -> Kernel {
        Kernel::new(crate::config::test_config())
    }

    fn add_client(k: &mut Kernel, nick: &str) -> (usize, mpsc::Receiver<Arc<[u8]>>) {
        let (tx, rx) = mpsc::channel(16);
        let idx = k
            .clients
            .create(Client::new(tx, "127.0.0.1".into(), k.self_token(), k.self_sindex, 0));
        k.clients.table.get_mut(idx).nick = nick.to_string();
        k.clients.index_nick(nick, idx);
        (idx, rx)
    }

    fn join(k: &mut Kernel, cindex: usize, chan: &str) {
        let ch_idx = if k.channels.find(chan) == NO_SUCH {
            k.channels.create(chan, 0)
        } else {
            k.channels.find(chan)
        };
        k.channels.named.table.get_mut(ch_idx).members.insert(cindex);
        k.clients.table.get_mut(cindex).channels.insert(ch_idx);
    }

    #[tokio::test]
    async fn single_channel_echo_excludes_source() {
        let mut k = kernel();
        let (a, mut a_rx) = add_client(&mut k, "A");
        let (b, mut b_rx) = add_client(&mut k, "B");
        let (c, mut c_rx) = add_client(&mut k, "C");
        for &cl in &[a, b, c] {
            join(&mut k, cl, "#x");
        }

        user_bcast_raw_butone(&k, a, ":A PRIVMSG #x :hi\r\n".to_string());

        assert!(a_rx.try_recv().is_err(), "source must not receive its own line");
        assert_eq!(b_rx.try_recv().unwrap().as_ref(), b":A PRIVMSG #x :hi\r\n");
        assert_eq!(c_rx.try_recv().unwrap().as_ref(), b":A PRIVMSG #x :hi\r\n");
    }

    #[tokio::test]
    async fn multi_channel_dedup_delivers_once() {
        let mut k = kernel();
        let (a, _a_rx) = add_client(&mut k, "A");
        let (b, mut b_rx) = add_client(&mut k, "B");
        join(&mut k, a, "#x");
        join(&mut k, b, "#x");
        join(&mut k, a, "#y");
        join(&mut k, b, "#y");

        user_bcast_raw_butone(&k, a, ":A NICK :A2\r\n".to_string());

        assert_eq!(b_rx.try_recv().unwrap().as_ref(), b":A NICK :A2\r\n");
        assert!(
            b_rx.try_recv().is_err(),
            "B shares two channels with A but must receive exactly one copy"
        );
    }
}
