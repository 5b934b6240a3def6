//! # Signaling Test Utilities
//!
//! Shared test utilities for the signaling service.
//!
//! This crate provides a scripted media engine and client fixtures for
//! testing the signaling core without a real media server or sockets.
//!
//! ## Modules
//!
//! - `mock_engine` - Scripted `MediaEngine` with failure and hang injection
//! - `fixtures` - Channel-backed test clients, service builders, sample data
//!
//! ## Usage
//!
//! ```rust,ignore
//! use signaling_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let engine = MockMediaEngine::healthy();
//!     let service = call_service(&engine);
//!
//!     let mut alice = TestClient::connect("conn-alice");
//!     alice.register(&service, "alice").await;
//!
//!     // Drive the service and assert on alice.expect_message()...
//! }
//! ```

pub mod fixtures;
pub mod mock_engine;

// Re-export commonly used items
pub use fixtures::*;
pub use mock_engine::*;
