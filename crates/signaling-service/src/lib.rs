//! Signaling Service Library
//!
//! Call-signaling coordinator for two-party real-time media sessions. The
//! service never touches media: it pairs clients, relays session descriptions
//! and connectivity candidates, and drives an external media negotiation
//! engine that owns the actual pipelines.
//!
//! # Architecture
//!
//! ```text
//! transport (WebSocket /call, one reader task per client)
//! └── SignalingService (handler)
//!     ├── IdentityRegistry ── Session (per registered client)
//!     ├── RoomScheduler (room auto-pairing, settle timers)
//!     ├── SessionOrchestrator (one task per establishment attempt)
//!     │   └── MediaEngine (Kurento JSON-RPC client)
//!     └── TeardownCoordinator (stop / disconnect)
//! ```
//!
//! Outbound messages to a client always go through that client's
//! `ConnectionActor`, so the signaling path and engine candidate events never
//! interleave writes.
//!
//! # Modules
//!
//! - [`actors`] - Per-connection outbound actor
//! - [`config`] - Service configuration from environment
//! - [`engine`] - Media negotiation engine seam and Kurento client
//! - [`handler`] - Inbound message dispatch
//! - [`orchestrator`] - Pipeline establishment and rollback
//! - [`pairing`] - Pairing strategies and the room scheduler
//! - [`registry`] / [`session`] - Identity registry and per-client state
//! - [`teardown`] - Stop and disconnect handling
//! - [`transport`] - WebSocket endpoint

pub mod actors;
pub mod candidates;
pub mod config;
pub mod engine;
pub mod errors;
pub mod handler;
pub mod observability;
pub mod orchestrator;
pub mod pairing;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod teardown;
pub mod transport;
