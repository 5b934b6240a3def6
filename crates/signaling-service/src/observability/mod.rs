//! Observability for the signaling service.
//!
//! Instrumentation never records SDP bodies, candidate strings or chat text.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `signaling_sessions_registered` | Gauge | none | Live registered sessions |
//! | `signaling_registrations_total` | Counter | `outcome` | Registration attempts |
//! | `signaling_establishments_total` | Counter | `outcome` | Pair establishment attempts |
//! | `signaling_establishment_duration_seconds` | Histogram | `outcome` | Establishment latency |
//! | `signaling_teardowns_total` | Counter | `reason` | Pair teardowns |
//! | `signaling_messages_total` | Counter | `kind` | Inbound messages by kind |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::{
    init_metrics_recorder, record_establishment, record_message, record_registration,
    record_teardown, set_sessions_registered,
};
