//! Webhook Ingestion
//!
//! Turns platform webhook deliveries into queued [`sy_common::DispatchTask`]s,
//! admitting each event at most once.

pub mod dedup;
pub mod error;
pub mod events;
pub mod handlers;
pub mod pipeline;
pub mod router;
pub mod signing;

pub use dedup::{ClaimOutcome, Deduplicator, DEFAULT_DEDUP_TTL};
pub use error::{IngestError, IngestOutcome, IngestResult};
pub use events::{EventEnvelope, InboundEvent, MessageEvent};
pub use pipeline::IngestPipeline;
pub use router::{classify, IgnoreReason, Route};
pub use signing::{sign_request, SignatureError, SignatureVerifier};
