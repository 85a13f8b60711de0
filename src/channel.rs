//! Channel entities (spec §3 "Channel").

use std::collections::HashSet;

use crate::entity::NamedTable;

#[derive(Debug, Clone)]
pub struct Topic {
    pub text: String,
    pub set_by: String,
    pub set_at: u64,
}

#[derive(Debug, Clone)]
pub struct BanEntry {
    pub mask: String,
    pub set_by: String,
    pub set_at: u64,
}

pub struct Channel {
    pub name: String,
    pub modes: String,
    pub created_at: u64,
    pub topic: Option<Topic>,
    pub members: HashSet<usize>,
    pub ops: HashSet<usize>,
    pub voiced: HashSet<usize>,
    pub bans: Vec<BanEntry>,
}

impl Channel {
    pub fn new(name: String, created_at: u64) -> Self {
        Self {
            name,
            modes: String::new(),
            created_at,
            topic: None,
            members: HashSet::new(),
            ops: HashSet::new(),
            voiced: HashSet::new(),
            bans: Vec::new(),
        }
    }

    pub fn is_empty_channel(&self) -> bool {
        self.members.is_empty()
    }
}

#[derive(Default)]
pub struct ChannelTable {
    pub named: NamedTable<Channel>,
}

impl ChannelTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, name: &str) -> usize {
        self.named.find(name)
    }

    pub fn create(&mut self, name: &str, now: u64) -> usize {
        self.named.create(name, Channel::new(name.to_string(), now))
    }

    /// Free the channel if membership has become empty (spec §3 Lifecycle).
    /// Returns true if it was freed.
    pub fn free_if_empty(&mut self, idx: usize) -> bool {
        let Some(ch) = self.named.table.try_get(idx) else {
            return false;
        };
        if !ch.is_empty_channel() {
            return false;
        }
        let name = ch.name.clone();
        self.named.free(&name, idx);
        true
    }

    pub fn size(&self) -> usize {
        self.named.table.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::NO_SUCH;

    #[test]
    fn free_if_empty_removes_from_index() {
        let mut t = ChannelTable::new();
        let idx = t.create("#rust", 0);
        assert!(!t.free_if_empty(idx), "non-empty channel stays");
        t.named.table.get_mut(idx).members.insert(1);
        assert!(!t.free_if_empty(idx));
        t.named.table.get_mut(idx).members.clear();
        assert!(t.free_if_empty(idx));
        assert_eq!(t.find("#rust"), NO_SUCH);
    }
}
