//! Peer server entities and the link state machine (spec §3 "Peer server",
//! §4.3 "Peer link state machine").

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::entity::NO_SUCH;

/// States of a peer server entity (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Unregistered,
    Registered,
    Closed,
}

/// Tokens that may never be assigned to a peer (spec §4.4: every
/// non-local-origin `S`/`N`/`B`/`C` line is prefixed by its origin's
/// one-character token, so a token equal to a literal relay verb would
/// make that peer's structural lines indistinguishable from a relay
/// line by `parsed.verb` alone). `RNICK`/`PING`/`PONG`/`EB` can't
/// collide — they're multi-character — so only the single-character
/// relay verbs need reserving.
pub const RESERVED_TOKENS: [char; 2] = ['P', 'Q'];

pub struct PeerServer {
    /// Send queue for a local peer link. `None` for a remote (non-local)
    /// peer entity known only by token — never written to directly
    /// (spec §4.3 "Server-to-server relaying").
    pub tx: Option<mpsc::Sender<Arc<[u8]>>>,
    pub name: String,
    pub token: char,
    pub description: String,
    pub hops: u32,
    pub boot_ts: u64,
    pub link_ts: u64,
    pub is_local: bool,
    pub state: LinkState,
    /// Per-peer mid-burst flag (spec §9 Open Questions: burst-in-progress
    /// is per-peer state, not global).
    pub mid_burst: bool,
    pub last_activity: u64,
    pub pinged: bool,
    /// Set once, at creation. Used for the TS collision rule across
    /// simultaneously-introduced servers sharing a name, mirroring the
    /// client collision rule (SPEC_FULL.md §5).
    pub registered_at: u64,
}

impl PeerServer {
    pub fn outbound(
        name: String,
        token: char,
        description: String,
        hops: u32,
        now: u64,
    ) -> Self {
        Self {
            tx: None,
            name,
            token,
            description,
            hops,
            boot_ts: now,
            link_ts: now,
            is_local: false,
            state: LinkState::Connecting,
            mid_burst: false,
            last_activity: now,
            pinged: false,
            registered_at: now,
        }
    }

    pub fn local(
        tx: mpsc::Sender<Arc<[u8]>>,
        name: String,
        token: char,
        description: String,
        now: u64,
    ) -> Self {
        Self {
            tx: Some(tx),
            name,
            token,
            description,
            hops: 1,
            boot_ts: now,
            link_ts: now,
            is_local: true,
            state: LinkState::Unregistered,
            mid_burst: false,
            last_activity: now,
            pinged: false,
            registered_at: now,
        }
    }

    pub fn enqueue(&self, buf: Arc<[u8]>) {
        if let Some(tx) = &self.tx {
            let _ = tx.try_send(buf);
        }
    }

    /// A just-accepted/just-connected socket with no `SERVER` exchanged yet.
    /// Left unindexed by name/token until `ServerTable::finalize` runs.
    pub fn pending(tx: mpsc::Sender<Arc<[u8]>>, now: u64) -> Self {
        Self {
            tx: Some(tx),
            name: String::new(),
            token: '\0',
            description: String::new(),
            hops: 1,
            boot_ts: now,
            link_ts: now,
            is_local: true,
            state: LinkState::Unregistered,
            mid_burst: false,
            last_activity: now,
            pinged: false,
            registered_at: now,
        }
    }
}

#[derive(Default)]
pub struct ServerTable {
    pub table: crate::entity::Table<PeerServer>,
    by_name: HashMap<String, usize>,
    by_token: HashMap<char, usize>,
}

impl ServerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find_name(&self, name: &str) -> usize {
        self.by_name
            .get(&name.to_lowercase())
            .copied()
            .unwrap_or(NO_SUCH)
    }

    pub fn find_token(&self, token: char) -> usize {
        self.by_token.get(&token).copied().unwrap_or(NO_SUCH)
    }

    pub fn token_in_use(&self, token: char) -> bool {
        self.by_token.contains_key(&token)
    }

    pub fn create(&mut self, peer: PeerServer) -> usize {
        let name = peer.name.to_lowercase();
        let token = peer.token;
        let idx = self.table.create(peer);
        self.by_name.insert(name, idx);
        self.by_token.insert(token, idx);
        idx
    }

    /// Allocate a slot for a peer whose name/token aren't known yet (an
    /// accepted or just-connected socket awaiting `SERVER`). Left out of
    /// the name/token indexes until [`Self::finalize`] runs.
    pub fn create_pending(&mut self, peer: PeerServer) -> usize {
        self.table.create(peer)
    }

    /// Assign the real name/token once a peer's `SERVER` line arrives, and
    /// index it for `find_name`/`find_token`/`token_in_use`.
    pub fn finalize(&mut self, idx: usize, name: String, token: char) {
        if let Some(p) = self.table.try_get_mut(idx) {
            p.name = name.clone();
            p.token = token;
        }
        self.by_name.insert(name.to_lowercase(), idx);
        self.by_token.insert(token, idx);
    }

    pub fn free(&mut self, idx: usize) -> Option<PeerServer> {
        if let Some(p) = self.table.try_get(idx) {
            self.by_name.remove(&p.name.to_lowercase());
            self.by_token.remove(&p.token);
        }
        self.table.free(idx)
    }

    pub fn size(&self) -> usize {
        self.table.size()
    }

    /// Every local, registered peer (spec §4.3 `sbcast`).
    pub fn local_registered(&self) -> impl Iterator<Item = (usize, &PeerServer)> {
        self.table
            .iter()
            .filter(|(_, p)| p.is_local && p.state == LinkState::Registered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_uniqueness_tracked() {
        let mut t = ServerTable::new();
        assert!(!t.token_in_use('A'));
        let idx = t.create(PeerServer::outbound("hub".into(), 'A', "desc".into(), 1, 0));
        assert!(t.token_in_use('A'));
        assert_eq!(t.find_token('A'), idx);
        t.free(idx);
        assert!(!t.token_in_use('A'));
    }
}
