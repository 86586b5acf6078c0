//! panel-link: a single-peer TCP control channel.
//!
//! The server accepts exactly one peer at a time on a backlog-of-one
//! listener. Inbound bytes are decoded as Shift-JIS text and routed to a
//! consumer (echo by default); outbound text is pushed to the peer as
//! ASCII, fire-and-forget.
//!
//! Features:
//! - Idempotent open/close lifecycle with a boolean `open`
//! - At most one active session, enforced by a one-permit admission gate
//! - Queued reconnects promoted as soon as the active peer leaves
//! - Shift-JIS inbound decoding with trailing-NUL trim
//! - Configuration via CLI arguments or TOML file

pub mod codec;
pub mod config;
pub mod server;

mod session;

pub use server::Server;
