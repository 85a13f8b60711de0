//! Core library for the tsircd IRC daemon kernel.
//!
//! The binary (`main.rs`) does nothing but parse configuration, set up
//! tracing, and hand off to [`server::Server`]. Everything that matters —
//! entity tables, the broadcast engine, netburst, the peer link state
//! machine, and the reaper — lives here so it can be unit tested without a
//! socket in sight.

pub mod broadcast;
pub mod channel;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod entity;
pub mod error;
pub mod event;
pub mod linkstate;
pub mod netburst;
pub mod peer;
pub mod reaper;
pub mod server;
pub mod state;
pub mod wire;
