//! Observability for the live runtime.
//!
//! All instrumentation uses `#[instrument(skip_all)]` with explicit safe
//! fields. Message content, tokens, and media payloads are never logged.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `rt_connections_active` | Gauge | none |
//! | `rt_rooms_active` | Gauge | none |
//! | `rt_events_dropped_total` | Counter | none |
//! | `rt_dispatch_dropped_total` | Counter | none |
//! | `rt_message_latency_seconds` | Histogram | `message_type` |
//! | `rt_recording_parts_total` | Counter | none |
//! | `rt_recording_finalized_total` | Counter | `mode` |
//! | `rt_recording_aborted_total` | Counter | `reason` |
//! | `rt_recording_swept_total` | Counter | none |
//! | `rt_errors_total` | Counter | `operation`, `error_code` |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;
