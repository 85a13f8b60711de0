//! Events fed into the single-threaded core loop (spec §5).
//!
//! Every socket's I/O lives in its own tokio task (teacher's reader/writer
//! split, `connection/mod.rs::handle_io`); those tasks never touch the
//! entity tables directly. Instead they translate socket activity into an
//! [`Event`] and send it down one shared `mpsc` channel to the core loop,
//! which is the only place tables are mutated — satisfying spec §5's "all
//! entity tables ... require no locking" by construction rather than by
//! locking around them.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::client::SendQueue;
use crate::config::RemoteServerRecord;

pub type PeerSendQueue = mpsc::Sender<Arc<[u8]>>;

pub enum Event {
    ClientConnected {
        ip: String,
        tx: SendQueue,
        reply: oneshot::Sender<usize>,
    },
    ClientLine {
        cindex: usize,
        line: String,
    },
    ClientClosed {
        cindex: usize,
    },
    /// A peer socket came up (inbound accept or outbound connect succeeded).
    /// The core replies with the assigned `sindex` so the I/O tasks can tag
    /// subsequent `PeerLine`/`PeerClosed` events. `record` is `Some` for a
    /// connection we dialed ourselves, so the core knows which configured
    /// peer to expect and can speak first (spec §4.3 `call_remote_servers`).
    PeerConnected {
        record: Option<RemoteServerRecord>,
        tx: PeerSendQueue,
        reply: oneshot::Sender<usize>,
    },
    PeerLine {
        sindex: usize,
        line: String,
    },
    PeerClosed {
        sindex: usize,
    },
    ReaperTick,
    ConnectTick,
    /// An outbound connect attempt for a configured peer finished.
    OutboundFailed {
        record: RemoteServerRecord,
    },
}

pub type Inbox = mpsc::Sender<Event>;
