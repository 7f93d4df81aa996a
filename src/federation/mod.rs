//! ActivityPub federation engine
//!
//! Handles:
//! - HTTP Signatures
//! - WebFinger and the remote actor cache
//! - Outbound publishing and the durable delivery queue
//! - Inbound activity dispatch
//! - Relay subscriptions
//! - Thread reconstruction
//! - Inbound rate limiting

pub mod activity;
pub mod content;
pub mod delivery;
pub mod fetch;
pub mod keys;
pub mod outbound;
pub mod queue;
pub mod rate_limit;
pub mod relay;
pub mod resolver;
pub mod signature;
pub mod thread;
pub mod urls;
pub mod webfinger;

#[cfg(test)]
pub(crate) mod test_support;

pub use activity::{ActivityKind, DispatchOutcome, InboxDispatcher};
pub use delivery::{ActivityDelivery, builder};
pub use fetch::RemoteFetcher;
pub use keys::{KeyPair, KeyRing, LocalSigner};
pub use outbound::{Audience, OutboundProcessor, OutboundTask, Publisher};
pub use queue::{DeliveryQueue, QueueSettings, QueueWorker, TickReport, spawn_queue_worker};
pub use rate_limit::{RateLimiter, extract_domain};
pub use relay::RelayManager;
pub use resolver::IdentityResolver;
pub use signature::{SignatureVerdict, SignatureVerifier, sign_request, verify_signature};
pub use thread::{Thread, ThreadNode, ThreadResolver};
pub use urls::LocalUrls;
pub use webfinger::{WebFingerResponse, generate_webfinger_response, resolve_webfinger};
