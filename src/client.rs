//! Client entities (spec §3 "Client").

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::entity::NO_SUCH;

/// Per-client send queue. Holds references to shared broadcast buffers, not
/// copies — see spec §4.2 "Zero-copy policy" and §5 "Shared resource".
pub type SendQueue = mpsc::Sender<Arc<[u8]>>;

pub struct Client {
    pub tx: SendQueue,
    pub is_reg: bool,
    pub nick: String,
    pub user: String,
    pub host: String,
    pub realname: String,
    pub ip: String,
    pub modes: String,
    /// One-character token of the server this client resides on.
    pub server_token: char,
    /// Owning server handle (sindex). [`crate::entity::NO_SUCH`] until known,
    /// though a registered client always has an owner.
    pub sindex: usize,
    pub channels: HashSet<usize>,
    pub last_activity: u64,
    /// Set once, at registration. Used for the TS collision rule (spec §8
    /// scenario 5, resolved in SPEC_FULL.md §5).
    pub registered_at: u64,
    /// True once the reaper has sent a PING and is waiting on a PONG.
    pub pinged: bool,
}

impl Client {
    pub fn new(tx: SendQueue, ip: String, server_token: char, sindex: usize, now: u64) -> Self {
        Self {
            tx,
            is_reg: false,
            nick: String::new(),
            user: String::new(),
            host: ip.clone(),
            realname: String::new(),
            ip,
            modes: String::new(),
            server_token,
            sindex,
            channels: HashSet::new(),
            last_activity: now,
            registered_at: now,
            pinged: false,
        }
    }

    pub fn hostmask(&self) -> String {
        format!("{}!{}@{}", self.nick, self.user, self.host)
    }

    /// Queue a shared buffer for delivery. Never blocks the core: a full
    /// queue means a dead/slow client, handled by the reaper, not by
    /// backpressuring the broadcast (spec §5, suspension points).
    pub fn enqueue(&self, buf: Arc<[u8]>) {
        let _ = self.tx.try_send(buf);
    }
}

#[derive(Default)]
pub struct ClientTable {
    pub table: crate::entity::Table<Client>,
    by_nick: std::collections::HashMap<String, usize>,
}

impl ClientTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, client: Client) -> usize {
        self.table.create(client)
    }

    pub fn find_nick(&self, nick: &str) -> usize {
        self.by_nick
            .get(&nick.to_lowercase())
            .copied()
            .unwrap_or(NO_SUCH)
    }

    /// Register or rename a client's nick in the index. Callers must remove
    /// the old entry first if renaming (spec §4.1 "incrementally maintained").
    pub fn index_nick(&mut self, nick: &str, idx: usize) {
        self.by_nick.insert(nick.to_lowercase(), idx);
    }

    pub fn unindex_nick(&mut self, nick: &str) {
        self.by_nick.remove(&nick.to_lowercase());
    }

    pub fn free(&mut self, idx: usize) -> Option<Client> {
        if let Some(c) = self.table.try_get(idx) {
            self.unindex_nick(&c.nick.clone());
        }
        self.table.free(idx)
    }

    pub fn size(&self) -> usize {
        self.table.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_tx() -> SendQueue {
        mpsc::channel(8).0
    }

    #[test]
    fn nick_index_tracks_registration() {
        let mut t = ClientTable::new();
        let idx = t.create(Client::new(dummy_tx(), "127.0.0.1".into(), 'A', NO_SUCH, 0));
        t.index_nick("alice", idx);
        assert_eq!(t.find_nick("Alice"), idx);
        t.free(idx);
        assert_eq!(t.find_nick("alice"), NO_SUCH);
    }
}
