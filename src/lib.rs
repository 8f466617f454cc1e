//! tirc: a Tor-friendly IRC terminal client with opportunistically
//! end-to-end encrypted direct messages.
//!
//! The crate is organized around a concurrent session engine
//! ([`session`]): a read-dispatch loop, a routing loop, and an
//! info-display loop run as tokio tasks beside the foreground input loop,
//! coordinated through bounded queues and one cancellation token. The
//! codec ([`proto`]) turns wire lines into structured messages, the
//! router ([`router`]) maps verbs to handlers, and direct messages pass
//! through the encryption adapter ([`crypto`]) backed by the bundled
//! engine ([`e2e`]).

pub mod commands;
pub mod config;
pub mod crypto;
pub mod e2e;
pub mod proto;
pub mod router;
pub mod session;
pub mod term;
pub mod tor;
pub mod transport;
