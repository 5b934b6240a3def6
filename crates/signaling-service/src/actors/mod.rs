//! Per-connection actors.
//!
//! ```text
//! transport (WebSocket reader)
//! └── ConnectionActor (one per client, owns the write half)
//! ```
//!
//! Inbound frames are dispatched directly by the transport; every outbound
//! message goes through the client's `ConnectionActor` mailbox so that writes
//! to one client are serialized.
//!
//! # Modules
//!
//! - [`connection`] - `ConnectionActor` and the `SignalSink` transport seam
//! - [`mailbox`] - Mailbox depth monitoring
//! - [`messages`] - Message types for actor communication

pub mod connection;
pub mod mailbox;
pub mod messages;

pub use connection::{ConnectionActor, ConnectionHandle, SignalSink};
pub use mailbox::{MailboxLevel, MailboxMonitor};
pub use messages::ConnectionMessage;
