//! ActivityPub federation module
//!
//! Handles:
//! - Delivery targets and per-host grouping
//! - HTTP Signatures (outbound signing, inbound verification)
//! - Outbound HTTP transport
//! - Dispatch, retry scheduling and background workers
//! - Public key caching

mod activity;
mod delivery;
mod dispatcher;
mod instance;
mod key_cache;
mod registry;
mod scheduler;
mod signature;
mod transport;
mod worker;

pub use activity::{
    ActivityFactory, ActivityType, OutboundActivity, PUBLIC_AUDIENCE, Visibility,
    audience_for_visibility, builder, followers_uri,
};
pub use delivery::ActivityDelivery;
pub use dispatcher::{DeliveryDispatcher, resolve_targets, select_fast_path};
pub use instance::{Instance, InstancePath, PathType, Priority};
pub use key_cache::{CacheStats, PublicKeyCache, extract_actor_domain, fetch_public_key};
pub use registry::{
    ActivityStore, FederationRegistry, FollowerDirectory, KeyResolver, SigningKeyStore,
};
pub use scheduler::{
    AttemptOutcome, HostFailures, ProcessSummary, RetryScheduler, backoff, is_eligible,
};
pub use signature::{
    InboundRequest, ParsedSignature, SignatureHeaders, VerifiedOrigin, generate_digest,
    http_date, key_id_for, key_id_matches_actor, parse_signature_header, sign_request,
    sign_string, signing_string, verify_request, verify_string,
};
pub use transport::{
    ACTIVITY_ACCEPT, HttpTransport, TransportError, TransportRequest, TransportResponse,
};
pub use worker::{DeliveryJob, DeliveryTrigger, spawn_sweeper, spawn_workers};

#[cfg(test)]
pub(crate) use registry::{
    MockActivityStore, MockFollowerDirectory, MockKeyResolver, MockSigningKeyStore,
};
#[cfg(test)]
pub(crate) use signature::tests::generate_test_keypair;
