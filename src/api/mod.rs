//! API layer
//!
//! HTTP handlers for:
//! - ActivityPub inboxes (signature verification)
//! - Delivery requests, status and async trigger
//! - Metrics (Prometheus)

mod activitypub;
mod delivery;
pub mod metrics;

pub use activitypub::activitypub_router;
pub use delivery::{DeliveryCreated, DeliveryRequest, DeliveryStatus, TargetRequest, delivery_router};
pub use metrics::{metrics_router, track_http_requests};
