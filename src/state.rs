//! Global state (spec §3 "Global state") and the entity tables it owns.
//!
//! `Kernel` is deliberately *not* wrapped in a `Mutex`: per spec §5 it is
//! only ever touched from the single core task (see `event.rs`), so no
//! synchronization is needed around it at all — the absence of locking
//! here is the point, not an oversight.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::channel::ChannelTable;
use crate::client::ClientTable;
use crate::config::{RemoteServerRecord, ServerConfig};
use crate::peer::ServerTable;

/// Observable counters (spec §3, §6 "Observable counters").
#[derive(Debug, Default, Clone, Copy)]
pub struct Counters {
    pub total_conns: u64,
    pub total_users: u64,
    pub local_users: u64,
    pub max_users: u64,
    pub channels: u64,
}

pub struct Kernel {
    pub config: ServerConfig,
    pub clients: ClientTable,
    pub channels: ChannelTable,
    pub servers: ServerTable,
    pub counters: Counters,
    /// This server's own peer-table handle, created at startup.
    pub self_sindex: usize,
    pub created_at: u64,
    pub created_at_human: String,
    /// Updated once per reaper tick; cheap freshness source for code that
    /// doesn't need wall-clock precision (spec §3).
    pub cheap_ts: u64,
    pub motd: Vec<String>,
    /// Which configured record an *outbound* handshake-in-progress peer
    /// corresponds to, keyed by its (still-`Unregistered`) sindex. Consulted
    /// by `dispatch::accept_remote_server` instead of a name lookup, since
    /// we already know who we dialed (spec §4.3 `call_remote_servers`).
    pub pending_outbound: HashMap<usize, RemoteServerRecord>,
    /// The secret offered by a peer's `PASS` line, held until its `SERVER`
    /// line names who it claims to be.
    pub pending_pass: HashMap<usize, String>,
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl Kernel {
    pub fn new(config: ServerConfig) -> Self {
        let created_at = unix_now();
        let mut servers = ServerTable::new();
        let token = config
            .token
            .chars()
            .next()
            .expect("server token must be non-empty");
        assert!(
            !crate::peer::RESERVED_TOKENS.contains(&token),
            "token {token:?} is reserved for relay verbs (P, Q)"
        );
        let self_sindex = servers.create(crate::peer::PeerServer::local(
            // The local server entity is never written to over a socket;
            // give it a sender that immediately drops everything.
            tokio::sync::mpsc::channel(1).0,
            config.server_name.clone(),
            token,
            config.description.clone(),
            created_at,
        ));
        // Our own entity is always "registered" and isn't driven through
        // the PASS/SERVER handshake.
        servers.table.get_mut(self_sindex).state = crate::peer::LinkState::Registered;

        let motd = config.load_motd().unwrap_or_default();

        Self {
            config,
            clients: ClientTable::new(),
            channels: ChannelTable::new(),
            servers,
            counters: Counters::default(),
            self_sindex,
            created_at,
            created_at_human: format!("{created_at}"),
            cheap_ts: created_at,
            motd,
            pending_outbound: HashMap::new(),
            pending_pass: HashMap::new(),
        }
    }

    pub fn self_token(&self) -> char {
        self.servers.table.get(self.self_sindex).token
    }

    /// spec §4.6 `new_registered_client`.
    pub fn note_client_registered(&mut self, is_local: bool) {
        if is_local {
            self.counters.total_conns += 1;
            self.counters.local_users += 1;
        }
        self.counters.total_users += 1;
        if self.counters.total_users > self.counters.max_users {
            self.counters.max_users = self.counters.total_users;
        }
    }

    /// spec §4.6 `free_client` (counter half only; table slot freed by caller).
    pub fn note_client_freed(&mut self, is_local: bool, was_registered: bool) {
        if !was_registered {
            return;
        }
        self.counters.total_users = self.counters.total_users.saturating_sub(1);
        if is_local {
            self.counters.local_users = self.counters.local_users.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config as cfg;

    #[test]
    fn counters_respect_invariant() {
        let mut k = Kernel::new(cfg());
        k.note_client_registered(true);
        k.note_client_registered(true);
        k.note_client_freed(true, true);
        assert!(k.counters.local_users <= k.counters.total_users);
        assert!(k.counters.total_users <= k.counters.max_users);
    }

    #[test]
    fn self_server_entity_is_registered() {
        let k = Kernel::new(cfg());
        assert_eq!(
            k.servers.table.get(k.self_sindex).state,
            crate::peer::LinkState::Registered
        );
        assert_eq!(k.self_token(), 'A');
    }

    /// spec §4.4: `P`/`Q` are reserved for relay verbs, so a server can't
    /// even start up configured with one as its own token.
    #[test]
    #[should_panic(expected = "reserved for relay verbs")]
    fn reserved_own_token_panics_at_startup() {
        let mut c = cfg();
        c.token = "P".into();
        Kernel::new(c);
    }
}
