//! Command dispatch: turns a tokenized client or peer line into table
//! mutations and broadcast/relay calls (spec §4.1 "Client lifecycle",
//! §4.3 "Peer link state machine", §6 "External interfaces").
//!
//! Everything here runs inside the single core task — no locking, per
//! spec §5 — so a handler is free to mutate any table directly.

use std::sync::Arc;

use crate::broadcast;
use crate::client::{Client, SendQueue};
use crate::config::RemoteServerRecord;
use crate::entity::NO_SUCH;
use crate::error::CoreError;
use crate::event::PeerSendQueue;
use crate::peer::{LinkState, PeerServer};
use crate::state::{unix_now, Kernel};
use crate::wire::{self, Parsed};

/// How a client/peer removal should be announced onward, if at all.
enum Relay {
    /// Don't forward a QUIT/Q onto any peer link (the peer the client lived
    /// on is already gone — spec §4.3 netsplit handling).
    None,
    /// Forward to every local, registered peer.
    All,
    /// Forward to every local, registered peer except the one named.
    ExceptOrigin(usize),
}

fn raw(line: String) -> Arc<[u8]> {
    Arc::from(line.into_bytes().into_boxed_slice())
}

// ---------------------------------------------------------------------
// Connection lifecycle
// ---------------------------------------------------------------------

/// spec §3 "Client" lifecycle, step 1: a socket accepted, entity created.
///
/// Refuses the connection with [`CoreError::Resource`] once the client
/// table is at its configured capacity (spec §7 "resource" error kind),
/// rather than growing the slot table without bound.
pub fn on_client_connected(
    kernel: &mut Kernel,
    ip: String,
    tx: SendQueue,
) -> Result<usize, CoreError> {
    if kernel.clients.table.len() >= kernel.config.max_clients {
        return Err(CoreError::Resource(format!(
            "client table full ({} live)",
            kernel.config.max_clients
        )));
    }
    let now = unix_now();
    let token = kernel.self_token();
    let sindex = kernel.self_sindex;
    Ok(kernel.clients.create(Client::new(tx, ip, token, sindex, now)))
}

/// The socket dropped (EOF/error) before an explicit QUIT arrived.
pub fn on_client_closed(kernel: &mut Kernel, cindex: usize) {
    if kernel.clients.table.is_live(cindex) {
        remove_client(kernel, cindex, "Connection closed", Relay::All);
    }
}

pub fn on_peer_connected(
    kernel: &mut Kernel,
    record: Option<RemoteServerRecord>,
    tx: PeerSendQueue,
) -> usize {
    let now = unix_now();
    let sindex = kernel.servers.create_pending(PeerServer::pending(tx, now));
    if let Some(record) = record {
        // We dialed this peer: speak first (spec §4.3 `call_remote_servers`).
        kernel.pending_outbound.insert(sindex, record.clone());
        if let Some(p) = kernel.servers.table.try_get(sindex) {
            let hello = format!(
                "PASS {}\r\nSERVER {} 1 {} {} J10 {} :{}\r\n",
                record.shared_secret,
                kernel.config.server_name,
                kernel.created_at,
                now,
                kernel.self_token(),
                kernel.config.description,
            );
            p.enqueue(raw(hello));
        }
    }
    sindex
}

pub fn on_peer_closed(kernel: &mut Kernel, sindex: usize) {
    if kernel.servers.table.is_live(sindex) {
        close_peer(kernel, sindex, "Connection closed");
    }
}

// ---------------------------------------------------------------------
// Removal (spec §4.3 netsplit handling, §4.6 `free_client`)
// ---------------------------------------------------------------------

/// Kill a single client: quit is announced to co-channel members, the
/// client leaves every channel it was in (freeing any that become empty),
/// and — unless suppressed — the quit is relayed onward.
fn remove_client(kernel: &mut Kernel, cindex: usize, reason: &str, relay: Relay) {
    let Some(client) = kernel.clients.table.try_get(cindex) else {
        return;
    };
    let is_reg = client.is_reg;
    let is_local = client.sindex == kernel.self_sindex;
    let hostmask = client.hostmask();
    let nick = client.nick.clone();
    let token = client.server_token;
    let channels: Vec<usize> = client.channels.iter().copied().collect();

    if is_reg {
        let line = format!(":{hostmask} QUIT :{reason}\r\n");
        broadcast::user_bcast_raw_butone(kernel, cindex, line);
    }

    for ch_idx in channels {
        if let Some(ch) = kernel.channels.named.table.try_get_mut(ch_idx) {
            ch.members.remove(&cindex);
            ch.ops.remove(&cindex);
            ch.voiced.remove(&cindex);
        }
        if kernel.channels.free_if_empty(ch_idx) {
            kernel.counters.channels = kernel.counters.channels.saturating_sub(1);
        }
    }

    if is_reg {
        match relay {
            Relay::All => broadcast::sbcast(kernel, &format!("Q {token} {nick} :{reason}\r\n")),
            Relay::ExceptOrigin(origin) => {
                broadcast::sbcast_butone(kernel, origin, &format!("Q {token} {nick} :{reason}\r\n"))
            }
            Relay::None => {}
        }
    }

    kernel.note_client_freed(is_local, is_reg);
    kernel.clients.free(cindex);
}

/// Local KILL, ping timeout, or any other server-initiated termination.
pub fn kill_client(kernel: &mut Kernel, cindex: usize, reason: &str) {
    remove_client(kernel, cindex, reason, Relay::All);
}

/// All clients owned by `sindex` vanish with it (spec §4.3 netsplit
/// handling, §8 scenario 4) — no relay, since the link they'd relay over
/// is the one that just closed.
pub fn kill_remote_clients_on(kernel: &mut Kernel, sindex: usize, reason: &str) {
    let victims: Vec<usize> = kernel
        .clients
        .table
        .iter()
        .filter(|(_, c)| c.sindex == sindex)
        .map(|(i, _)| i)
        .collect();
    for idx in victims {
        remove_client(kernel, idx, reason, Relay::None);
    }
}

/// A peer link goes down: its users are dropped first, then the peer
/// entity itself is freed (spec §4.3).
pub fn close_peer(kernel: &mut Kernel, sindex: usize, reason: &str) {
    kill_remote_clients_on(kernel, sindex, reason);
    kernel.pending_outbound.remove(&sindex);
    kernel.servers.free(sindex);
}

// ---------------------------------------------------------------------
// Client command dispatch
// ---------------------------------------------------------------------

pub fn handle_client_line(kernel: &mut Kernel, cindex: usize, line: String) {
    let Some(parsed) = wire::tokenize(&line) else {
        return;
    };
    if !kernel.clients.table.is_live(cindex) {
        return;
    }
    kernel.clients.table.get_mut(cindex).last_activity = unix_now();

    match parsed.verb.to_uppercase().as_str() {
        "NICK" => handle_nick(kernel, cindex, &parsed),
        "USER" => handle_user(kernel, cindex, &parsed),
        "JOIN" => handle_join(kernel, cindex, &parsed),
        "PART" => handle_part(kernel, cindex, &parsed),
        "PRIVMSG" | "NOTICE" => handle_privmsg(kernel, cindex, &parsed),
        "PING" => {
            let name = kernel.config.server_name.clone();
            kernel
                .clients
                .table
                .get(cindex)
                .enqueue(raw(format!(":{name} PONG {name}\r\n")));
        }
        "PONG" => {
            kernel.clients.table.get_mut(cindex).pinged = false;
        }
        "QUIT" => {
            let reason = parsed.trailing.clone().unwrap_or_else(|| "Client quit".into());
            remove_client(kernel, cindex, &reason, Relay::All);
        }
        "KILL" => handle_kill(kernel, cindex, &parsed),
        _ => {}
    }
}

fn handle_nick(kernel: &mut Kernel, cindex: usize, parsed: &Parsed) {
    let Some(new_nick) = parsed.param(0) else {
        return;
    };
    if kernel.clients.find_nick(new_nick) != NO_SUCH {
        let name = kernel.config.server_name.clone();
        kernel
            .clients
            .table
            .get(cindex)
            .enqueue(raw(wire::numeric(&name, 433, &format!("* {new_nick} :Nickname is already in use"))));
        return;
    }

    let was_reg = kernel.clients.table.get(cindex).is_reg;
    let old_nick = kernel.clients.table.get(cindex).nick.clone();
    if was_reg {
        let hostmask = kernel.clients.table.get(cindex).hostmask();
        broadcast::user_bcast_raw(kernel, cindex, format!(":{hostmask} NICK :{new_nick}\r\n"));
        kernel.clients.unindex_nick(&old_nick);
    }
    kernel.clients.table.get_mut(cindex).nick = new_nick.to_string();
    kernel.clients.index_nick(new_nick, cindex);

    if was_reg {
        let token = kernel.clients.table.get(cindex).server_token;
        broadcast::sbcast(kernel, &format!("RNICK {token} {old_nick} {new_nick}\r\n"));
    } else {
        try_complete_registration(kernel, cindex);
    }
}

fn handle_user(kernel: &mut Kernel, cindex: usize, parsed: &Parsed) {
    let Some(user) = parsed.param(0) else {
        return;
    };
    let realname = parsed.trailing.clone().unwrap_or_default();
    {
        let c = kernel.clients.table.get_mut(cindex);
        c.user = user.to_string();
        c.realname = realname;
    }
    try_complete_registration(kernel, cindex);
}

/// spec §3 "Client" lifecycle: registration completes once both NICK and
/// USER have been seen.
fn try_complete_registration(kernel: &mut Kernel, cindex: usize) {
    let (nick, user, is_reg) = {
        let c = kernel.clients.table.get(cindex);
        (c.nick.clone(), c.user.clone(), c.is_reg)
    };
    if is_reg || nick.is_empty() || user.is_empty() {
        return;
    }

    let now = unix_now();
    {
        let c = kernel.clients.table.get_mut(cindex);
        c.is_reg = true;
        c.registered_at = now;
    }
    kernel.note_client_registered(true);

    let server_name = kernel.config.server_name.clone();
    let network_name = kernel.config.network_name.clone();
    let motd = kernel.motd.clone();
    let client = kernel.clients.table.get(cindex);
    client.enqueue(raw(wire::numeric(
        &server_name,
        1,
        &format!("{nick} :Welcome to {network_name}, {nick}"),
    )));
    if motd.is_empty() {
        client.enqueue(raw(wire::numeric(&server_name, 422, &format!("{nick} :MOTD File is missing"))));
    } else {
        client.enqueue(raw(wire::numeric(&server_name, 375, &format!("{nick} :- {server_name} Message of the Day -"))));
        for line in &motd {
            client.enqueue(raw(wire::numeric(&server_name, 372, &format!("{nick} :- {line}"))));
        }
        client.enqueue(raw(wire::numeric(&server_name, 376, &format!("{nick} :End of MOTD command"))));
    }

    let token = kernel.self_token();
    let (user, host, modes, ip, realname) = {
        let c = kernel.clients.table.get(cindex);
        (c.user.clone(), c.host.clone(), c.modes.clone(), c.ip.clone(), c.realname.clone())
    };
    let modes_field = if modes.is_empty() { "+".to_string() } else { modes };
    broadcast::sbcast(
        kernel,
        &format!(
            "{token} N {nick} 1 {now} {user} {host} {modes_field} {ip} {cindex} :{realname}\r\n"
        ),
    );
}

fn handle_join(kernel: &mut Kernel, cindex: usize, parsed: &Parsed) {
    if !kernel.clients.table.get(cindex).is_reg {
        return;
    }
    let Some(names) = parsed.param(0) else {
        return;
    };
    let now = unix_now();
    for chan in names.split(',').filter(|s| s.starts_with('#')) {
        let ch_idx = if kernel.channels.find(chan) == NO_SUCH {
            let idx = kernel.channels.create(chan, now);
            kernel.counters.channels += 1;
            idx
        } else {
            kernel.channels.find(chan)
        };

        let already_member = kernel
            .channels
            .named
            .table
            .get(ch_idx)
            .members
            .contains(&cindex);
        if already_member {
            continue;
        }

        let is_first = kernel.channels.named.table.get(ch_idx).members.is_empty();
        let ch = kernel.channels.named.table.get_mut(ch_idx);
        ch.members.insert(cindex);
        if is_first {
            ch.ops.insert(cindex);
        }
        kernel.clients.table.get_mut(cindex).channels.insert(ch_idx);

        let hostmask = kernel.clients.table.get(cindex).hostmask();
        broadcast::user_bcast_raw(kernel, cindex, format!(":{hostmask} JOIN :{chan}\r\n"));
    }
}

fn handle_part(kernel: &mut Kernel, cindex: usize, parsed: &Parsed) {
    let Some(names) = parsed.param(0) else {
        return;
    };
    let reason = parsed.trailing.clone().unwrap_or_else(|| "".into());
    for chan in names.split(',') {
        let ch_idx = kernel.channels.find(chan);
        if ch_idx == NO_SUCH {
            continue;
        }
        let is_member = kernel
            .channels
            .named
            .table
            .get(ch_idx)
            .members
            .contains(&cindex);
        if !is_member {
            continue;
        }

        let hostmask = kernel.clients.table.get(cindex).hostmask();
        let tail = if reason.is_empty() {
            format!(":{hostmask} PART {chan}\r\n")
        } else {
            format!(":{hostmask} PART {chan} :{reason}\r\n")
        };
        broadcast::user_bcast_raw(kernel, cindex, tail);

        let ch = kernel.channels.named.table.get_mut(ch_idx);
        ch.members.remove(&cindex);
        ch.ops.remove(&cindex);
        ch.voiced.remove(&cindex);
        kernel.clients.table.get_mut(cindex).channels.remove(&ch_idx);
        if kernel.channels.free_if_empty(ch_idx) {
            kernel.counters.channels = kernel.counters.channels.saturating_sub(1);
        }
    }
}

fn handle_privmsg(kernel: &mut Kernel, cindex: usize, parsed: &Parsed) {
    let Some(target) = parsed.param(0) else {
        return;
    };
    let Some(text) = parsed.trailing.as_deref() else {
        return;
    };
    let verb = parsed.verb.to_uppercase();
    let hostmask = kernel.clients.table.get(cindex).hostmask();

    if let Some(chan) = target.strip_prefix('#') {
        let chan = format!("#{chan}");
        let ch_idx = kernel.channels.find(&chan);
        let is_member = ch_idx != NO_SUCH
            && kernel
                .channels
                .named
                .table
                .get(ch_idx)
                .members
                .contains(&cindex);
        if !is_member {
            return;
        }
        broadcast::user_bcast_raw_butone(
            kernel,
            cindex,
            format!(":{hostmask} {verb} {chan} :{text}\r\n"),
        );
        // Forward along the spanning tree; downstream servers filter to
        // their own local channel membership on re-receipt (spec §4.3
        // "Server-to-server relaying").
        let token = kernel.clients.table.get(cindex).server_token;
        broadcast::sbcast(kernel, &format!("P {token} {chan} :{text}\r\n"));
        return;
    }

    let dest = kernel.clients.find_nick(target);
    if dest == NO_SUCH {
        let name = kernel.config.server_name.clone();
        kernel
            .clients
            .table
            .get(cindex)
            .enqueue(raw(wire::numeric(&name, 401, &format!("{target} :No such nick/channel"))));
        return;
    }
    let dest_client = kernel.clients.table.get(dest);
    if dest_client.sindex == kernel.self_sindex {
        dest_client.enqueue(raw(format!(":{hostmask} {verb} {target} :{text}\r\n")));
    } else {
        let owner = dest_client.sindex;
        let token = kernel.clients.table.get(cindex).server_token;
        let line = format!("P {token} {target} :{text}\r\n");
        if let Some(peer) = kernel.servers.table.try_get(owner) {
            peer.enqueue(raw(line));
        }
    }
}

fn handle_kill(kernel: &mut Kernel, _cindex: usize, parsed: &Parsed) {
    let Some(target) = parsed.param(0) else {
        return;
    };
    let idx = kernel.clients.find_nick(target);
    if idx == NO_SUCH {
        return;
    }
    let reason = parsed
        .trailing
        .clone()
        .unwrap_or_else(|| "Killed".to_string());
    kill_client(kernel, idx, &format!("Killed ({reason})"));
}

// ---------------------------------------------------------------------
// Peer command dispatch (spec §4.3, §4.4)
// ---------------------------------------------------------------------

pub fn handle_peer_line(kernel: &mut Kernel, sindex: usize, line: String) {
    let Some(parsed) = wire::tokenize(&line) else {
        return;
    };
    if !kernel.servers.table.is_live(sindex) {
        return;
    }
    kernel.servers.table.get_mut(sindex).last_activity = unix_now();

    let state = kernel.servers.table.get(sindex).state;
    if state != LinkState::Registered {
        handle_peer_handshake(kernel, sindex, &parsed);
        return;
    }

    // Structural lines (`S`/`N`/`B`/`C`) are prefixed with the introducing
    // server's routing token, so `verb` is that token and the real command
    // is `param(0)` (spec §4.4); relay verbs and link-level commands carry
    // no such prefix. Matching `parsed.verb` against the literal relay
    // verbs below can't collide with a token prefix: `validate_token`
    // refuses any peer that tries to claim `P`/`Q` as its token at
    // handshake time, and `RNICK`/`PING`/`PONG`/`EB` are multi-character,
    // so no single-character token can equal them either.
    match parsed.verb.as_str() {
        "EB" => {
            if let Some(p) = kernel.servers.table.try_get_mut(sindex) {
                p.mid_burst = false;
            }
        }
        "P" => handle_peer_privmsg(kernel, sindex, &parsed),
        "Q" => handle_peer_quit(kernel, sindex, &parsed),
        "RNICK" => handle_peer_nick(kernel, &parsed),
        "PING" => {
            if let Some(p) = kernel.servers.table.try_get(sindex) {
                p.enqueue(raw("PONG\r\n".to_string()));
            }
        }
        "PONG" => {
            if let Some(p) = kernel.servers.table.try_get_mut(sindex) {
                p.pinged = false;
            }
        }
        _ => match parsed.param(0) {
            Some("S") => handle_peer_s(kernel, &parsed),
            Some("N") => handle_peer_n(kernel, &parsed),
            Some("B") | Some("C") => handle_peer_channel(kernel, &parsed),
            _ => {}
        },
    }
}

fn handle_peer_handshake(kernel: &mut Kernel, sindex: usize, parsed: &Parsed) {
    match parsed.verb.as_str() {
        "PASS" => {
            if let Some(secret) = parsed.param(0) {
                kernel.pending_pass.insert(sindex, secret.to_string());
            }
        }
        "SERVER" => {
            let Some(name) = parsed.param(0) else { return };
            let offered_secret = kernel.pending_pass.remove(&sindex).unwrap_or_default();
            let token = parsed.param(5).and_then(|t| t.chars().next());
            let Some(token) = token else { return };

            if let Err(e) = accept_remote_server(kernel, sindex, name, &offered_secret) {
                tracing::warn!(peer = name, "{e}");
                close_peer(kernel, sindex, "Bad link credentials");
                return;
            }
            if let Err(e) = validate_token(token) {
                tracing::warn!(peer = name, "{e}");
                close_peer(kernel, sindex, "Reserved token");
                return;
            }
            if kernel.servers.token_in_use(token) {
                close_peer(kernel, sindex, "Token collision");
                return;
            }

            let was_outbound = kernel.pending_outbound.remove(&sindex).is_some();
            let description = parsed.trailing.clone().unwrap_or_default();
            kernel.servers.finalize(sindex, name.to_string(), token);
            if let Some(p) = kernel.servers.table.try_get_mut(sindex) {
                p.description = description;
                p.state = LinkState::Registered;
                p.link_ts = unix_now();
            }

            // Inbound links haven't spoken yet; speak now so the new peer
            // can validate us before it bursts back (spec §4.3).
            if !was_outbound {
                let hello = format!(
                    "PASS {}\r\nSERVER {} 1 {} {} J10 {} :{}\r\n",
                    reply_secret_for(kernel, name),
                    kernel.config.server_name,
                    kernel.created_at,
                    unix_now(),
                    kernel.self_token(),
                    kernel.config.description,
                );
                if let Some(p) = kernel.servers.table.try_get(sindex) {
                    p.enqueue(raw(hello));
                }
            }
            crate::netburst::send_netburst(kernel, sindex);
        }
        _ => {}
    }
}

/// spec §4.4: refuse a peer's offered token if it collides with the
/// reserved relay-verb space (see [`crate::peer::RESERVED_TOKENS`]),
/// which is what keeps `handle_peer_line`'s verb match unambiguous.
fn validate_token(token: char) -> Result<(), CoreError> {
    if crate::peer::RESERVED_TOKENS.contains(&token) {
        Err(CoreError::Protocol(format!(
            "token {token:?} is reserved for relay verbs"
        )))
    } else {
        Ok(())
    }
}

/// spec §4.3: validate a peer's offered name/secret against either the
/// specific record we dialed (outbound) or the configured peer list
/// (inbound).
fn accept_remote_server(
    kernel: &Kernel,
    sindex: usize,
    name: &str,
    secret: &str,
) -> Result<(), CoreError> {
    let ok = if let Some(rec) = kernel.pending_outbound.get(&sindex) {
        if rec.name.is_empty() {
            kernel
                .config
                .remote_servers
                .iter()
                .any(|r| r.name.eq_ignore_ascii_case(name) && r.shared_secret == secret)
        } else {
            rec.name.eq_ignore_ascii_case(name) && rec.shared_secret == secret
        }
    } else {
        kernel
            .config
            .remote_servers
            .iter()
            .any(|r| r.name.eq_ignore_ascii_case(name) && r.shared_secret == secret)
    };
    if ok {
        Ok(())
    } else {
        Err(CoreError::Authentication)
    }
}

/// The secret to hand back to a peer we accepted inbound, so their own
/// `accept_remote_server` check succeeds (shared secrets are symmetric).
fn reply_secret_for(kernel: &Kernel, name: &str) -> String {
    kernel
        .config
        .remote_servers
        .iter()
        .find(|r| r.name.eq_ignore_ascii_case(name))
        .map(|r| r.shared_secret.clone())
        .unwrap_or_default()
}

fn handle_peer_s(kernel: &mut Kernel, parsed: &Parsed) {
    // param(0) is the literal "S"; the announced server's fields follow.
    let (Some(name), Some(hops), Some(boot_ts), Some(link_ts), Some(token)) = (
        parsed.param(1),
        parsed.param(2),
        parsed.param(3),
        parsed.param(4),
        parsed.param(6),
    ) else {
        return;
    };
    if kernel.servers.find_name(name) != NO_SUCH {
        return;
    }
    let Some(token) = token.chars().next() else {
        return;
    };
    let description = parsed.trailing.clone().unwrap_or_default();
    let mut remote = PeerServer::outbound(
        name.to_string(),
        token,
        description,
        hops.parse().unwrap_or(2),
        boot_ts.parse().unwrap_or_else(|_| unix_now()),
    );
    remote.link_ts = link_ts.parse().unwrap_or(remote.link_ts);
    remote.is_local = false;
    remote.state = LinkState::Registered;
    kernel.servers.create(remote);
}

fn handle_peer_n(kernel: &mut Kernel, parsed: &Parsed) {
    // param(0) is the literal "N"; verb is the owning server's token.
    let owner_token = parsed.verb.chars().next().unwrap_or('\0');
    let owner = kernel.servers.find_token(owner_token);
    if owner == NO_SUCH {
        return;
    }

    let (Some(nick), Some(user), Some(host), Some(modes), Some(ip)) = (
        parsed.param(1),
        parsed.param(4),
        parsed.param(5),
        parsed.param(6),
        parsed.param(7),
    ) else {
        return;
    };
    let realname = parsed.trailing.clone().unwrap_or_default();

    let existing = kernel.clients.find_nick(nick);
    let now = unix_now();
    if existing != NO_SUCH {
        // spec §8 scenario 5, SPEC_FULL.md §5: smaller registered_at wins.
        let existing_ts = kernel.clients.table.get(existing).registered_at;
        if existing_ts <= now {
            return;
        }
        kill_client(kernel, existing, "Nick collision");
    }

    let (tx, _rx) = tokio::sync::mpsc::channel(1);
    let mut client = Client::new(tx, ip.to_string(), owner_token, owner, now);
    client.nick = nick.to_string();
    client.user = user.to_string();
    client.host = host.to_string();
    client.modes = if modes == "+" { String::new() } else { modes.to_string() };
    client.realname = realname;
    client.is_reg = true;
    client.registered_at = now;
    let idx = kernel.clients.create(client);
    kernel.clients.index_nick(nick, idx);
    kernel.note_client_registered(false);
}

fn handle_peer_channel(kernel: &mut Kernel, parsed: &Parsed) {
    let is_b = parsed.param(0) == Some("B");
    let Some(name) = parsed.param(1) else {
        return;
    };
    if kernel.channels.find(name) != NO_SUCH {
        return;
    }
    let created_at = parsed
        .param(if is_b { 2 } else { 3 })
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(unix_now);
    kernel.channels.create(name, created_at);
    kernel.counters.channels += 1;
}

/// Steady-state relay lines carry the originating server's token as the
/// first parameter, not as the line's own verb (unlike burst lines) — the
/// immediate link forwarding the message may not be its origin.
fn handle_peer_privmsg(kernel: &mut Kernel, sindex: usize, parsed: &Parsed) {
    let (Some(origin_token), Some(target)) = (parsed.param(0), parsed.param(1)) else {
        return;
    };
    let Some(text) = parsed.trailing.as_deref() else {
        return;
    };
    let line = format!("P {origin_token} {target} :{text}\r\n");
    if target.starts_with('#') {
        let ch_idx = kernel.channels.find(target);
        if ch_idx != NO_SUCH {
            let members: Vec<usize> = kernel
                .channels
                .named
                .table
                .get(ch_idx)
                .members
                .iter()
                .copied()
                .collect();
            for idx in members {
                if let Some(c) = kernel.clients.table.try_get(idx) {
                    if c.sindex == kernel.self_sindex {
                        c.enqueue(raw(format!(":{origin_token}-relay {target} :{text}\r\n")));
                    }
                }
            }
        }
    } else {
        let dest = kernel.clients.find_nick(target);
        if let Some(c) = kernel.clients.table.try_get(dest) {
            if c.sindex == kernel.self_sindex {
                c.enqueue(raw(format!(":{origin_token}-relay {target} :{text}\r\n")));
            }
        }
    }
    broadcast::sbcast_butone(kernel, sindex, &line);
}

fn handle_peer_quit(kernel: &mut Kernel, sindex: usize, parsed: &Parsed) {
    let Some(nick) = parsed.param(1) else {
        return;
    };
    let idx = kernel.clients.find_nick(nick);
    if idx == NO_SUCH {
        return;
    }
    let reason = parsed.trailing.clone().unwrap_or_else(|| "Quit".to_string());
    remove_client(kernel, idx, &reason, Relay::ExceptOrigin(sindex));
}

fn handle_peer_nick(kernel: &mut Kernel, parsed: &Parsed) {
    let (Some(old), Some(new)) = (parsed.param(1), parsed.param(2)) else {
        return;
    };
    let idx = kernel.clients.find_nick(old);
    if idx == NO_SUCH {
        return;
    }
    kernel.clients.unindex_nick(old);
    kernel.clients.table.get_mut(idx).nick = new.to_string();
    kernel.clients.index_nick(new, idx);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn kernel() -> Kernel {
        Kernel::new(crate::config::test_config())
    }

    fn connect(k: &mut Kernel) -> (usize, mpsc::Receiver<Arc<[u8]>>) {
        let (tx, rx) = mpsc::channel(16);
        let idx = on_client_connected(k, "127.0.0.1".into(), tx).expect("capacity available in tests");
        (idx, rx)
    }

    #[tokio::test]
    async fn nick_then_user_completes_registration() {
        let mut k = kernel();
        let (idx, mut rx) = connect(&mut k);
        handle_client_line(&mut k, idx, "NICK alice\r\n".into());
        assert!(!k.clients.table.get(idx).is_reg);
        handle_client_line(&mut k, idx, "USER alice 0 * :Alice Example\r\n".into());
        assert!(k.clients.table.get(idx).is_reg);
        assert_eq!(k.counters.local_users, 1);
        let welcome = rx.try_recv().unwrap();
        assert!(String::from_utf8(welcome.to_vec()).unwrap().contains("001"));
    }

    #[tokio::test]
    async fn duplicate_nick_is_rejected() {
        let mut k = kernel();
        let (a, _ar) = connect(&mut k);
        handle_client_line(&mut k, a, "NICK alice\r\n".into());
        handle_client_line(&mut k, a, "USER alice 0 * :Alice\r\n".into());

        let (b, mut br) = connect(&mut k);
        handle_client_line(&mut k, b, "NICK alice\r\n".into());
        let err = br.try_recv().unwrap();
        assert!(String::from_utf8(err.to_vec()).unwrap().contains("433"));
        assert!(k.clients.table.get(b).nick.is_empty());
    }

    #[tokio::test]
    async fn join_part_frees_empty_channel() {
        let mut k = kernel();
        let (a, _ar) = connect(&mut k);
        handle_client_line(&mut k, a, "NICK alice\r\n".into());
        handle_client_line(&mut k, a, "USER alice 0 * :Alice\r\n".into());
        handle_client_line(&mut k, a, "JOIN #rust\r\n".into());
        assert_ne!(k.channels.find("#rust"), NO_SUCH);
        assert_eq!(k.counters.channels, 1);
        handle_client_line(&mut k, a, "PART #rust :bye\r\n".into());
        assert_eq!(k.channels.find("#rust"), NO_SUCH);
        assert_eq!(k.counters.channels, 0, "STAT_CHANNELS is a current-count gauge");
    }

    /// spec §7 "resource" error kind: a full client table refuses the
    /// connection rather than growing without bound.
    #[test]
    fn client_table_at_capacity_is_refused() {
        let mut cfg = crate::config::test_config();
        cfg.max_clients = 1;
        let mut k = Kernel::new(cfg);
        let (tx1, _r1) = mpsc::channel(16);
        assert!(on_client_connected(&mut k, "1.1.1.1".into(), tx1).is_ok());

        let (tx2, _r2) = mpsc::channel(16);
        let err = on_client_connected(&mut k, "2.2.2.2".into(), tx2).unwrap_err();
        assert!(matches!(err, CoreError::Resource(_)));
        assert_eq!(k.clients.table.len(), 1);
    }

    /// spec §4.4: a peer claiming a reserved routing token is refused at
    /// handshake time rather than being left to collide with the `P`/`Q`
    /// relay verbs later.
    #[test]
    fn peer_offering_reserved_token_is_refused() {
        let mut cfg = crate::config::test_config();
        cfg.remote_servers.push(RemoteServerRecord {
            name: "leaf".into(),
            shared_secret: "s3cret".into(),
            address: "127.0.0.1".into(),
            port: 4400,
        });
        let mut k = Kernel::new(cfg);
        let (tx, _rx) = mpsc::channel(16);
        let peer_idx = on_peer_connected(&mut k, None, tx);

        handle_peer_line(&mut k, peer_idx, "PASS s3cret\r\n".into());
        handle_peer_line(
            &mut k,
            peer_idx,
            "SERVER leaf 1 0 0 J10 P :leaf server\r\n".into(),
        );

        assert!(!k.servers.table.is_live(peer_idx));
        assert_eq!(k.servers.find_name("leaf"), NO_SUCH);
    }

    #[tokio::test]
    async fn quit_removes_client_and_counters() {
        let mut k = kernel();
        let (a, _ar) = connect(&mut k);
        handle_client_line(&mut k, a, "NICK alice\r\n".into());
        handle_client_line(&mut k, a, "USER alice 0 * :Alice\r\n".into());
        assert_eq!(k.counters.total_users, 1);
        handle_client_line(&mut k, a, "QUIT :done\r\n".into());
        assert!(!k.clients.table.is_live(a));
        assert_eq!(k.counters.total_users, 0);
    }

    #[test]
    fn kill_remote_clients_on_drops_only_that_servers_users() {
        let mut k = kernel();
        let (peer_tx, _prx) = mpsc::channel(16);
        let peer_idx = k.servers.create(PeerServer::outbound("leaf".into(), 'B', "d".into(), 1, 0));
        k.servers.table.get_mut(peer_idx).state = LinkState::Registered;

        let (tx1, _r1) = mpsc::channel(1);
        let mut c1 = Client::new(tx1, "1.1.1.1".into(), 'B', peer_idx, 0);
        c1.nick = "remote1".into();
        c1.is_reg = true;
        let c1_idx = k.clients.create(c1);
        k.clients.index_nick("remote1", c1_idx);

        let (tx2, _r2) = mpsc::channel(1);
        let mut c2 = Client::new(tx2, "127.0.0.1".into(), k.self_token(), k.self_sindex, 0);
        c2.nick = "local1".into();
        c2.is_reg = true;
        let c2_idx = k.clients.create(c2);
        k.clients.index_nick("local1", c2_idx);

        k.counters.total_users = 2;
        k.counters.local_users = 1;

        kill_remote_clients_on(&mut k, peer_idx, "netsplit");

        assert!(!k.clients.table.is_live(c1_idx));
        assert!(k.clients.table.is_live(c2_idx));
        assert_eq!(k.counters.total_users, 1);
        assert_eq!(k.counters.local_users, 1);
    }

    fn linked_peer(k: &mut Kernel, name: &str, token: char) -> usize {
        let idx = k.servers.create(PeerServer::outbound(name.into(), token, "d".into(), 1, 0));
        k.servers.table.get_mut(idx).state = LinkState::Registered;
        idx
    }

    /// spec §8 scenario 5: an older local entity survives a colliding
    /// burst introduction for the same nick.
    #[test]
    fn peer_burst_nick_collision_older_local_entity_survives() {
        let mut k = kernel();
        let peer_idx = linked_peer(&mut k, "leaf", 'B');

        let (tx, _rx) = mpsc::channel(16);
        let mut existing = Client::new(tx, "127.0.0.1".into(), k.self_token(), k.self_sindex, 0);
        existing.nick = "dupe".into();
        existing.is_reg = true;
        existing.registered_at = 100; // clearly in the past
        let existing_idx = k.clients.create(existing);
        k.clients.index_nick("dupe", existing_idx);

        let line = "B N dupe 1 0 dupe host + 1.2.3.4 9 :Dupe Remote\r\n".to_string();
        handle_peer_line(&mut k, peer_idx, line);

        assert!(k.clients.table.is_live(existing_idx));
        assert_eq!(k.clients.find_nick("dupe"), existing_idx);
    }

    /// spec §8 scenario 5: a colliding burst introduction that is older
    /// than the local entity's registration kills the local loser.
    #[test]
    fn peer_burst_nick_collision_younger_local_entity_is_killed() {
        let mut k = kernel();
        let peer_idx = linked_peer(&mut k, "leaf", 'B');

        let (tx, _rx) = mpsc::channel(16);
        let mut existing = Client::new(tx, "127.0.0.1".into(), k.self_token(), k.self_sindex, 0);
        existing.nick = "dupe".into();
        existing.is_reg = true;
        existing.registered_at = unix_now() + 1_000_000; // clearly "later" than the burst
        let existing_idx = k.clients.create(existing);
        k.clients.index_nick("dupe", existing_idx);

        let line = "B N dupe 1 0 dupe host + 1.2.3.4 9 :Dupe Remote\r\n".to_string();
        handle_peer_line(&mut k, peer_idx, line);

        assert!(!k.clients.table.is_live(existing_idx), "younger local entity loses the collision");
        let winner = k.clients.find_nick("dupe");
        assert_ne!(winner, NO_SUCH);
        assert_ne!(winner, existing_idx);
        assert_eq!(k.clients.table.get(winner).sindex, peer_idx);
    }
}
