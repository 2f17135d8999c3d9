//! Messaging layer for the archon orchestrator: MCP envelopes, the per-agent
//! postbox store, the processed-message archive, and the router that moves
//! messages between agent outboxes and recipient inboxes.
//!
//! Everything in this crate operates on a trusted local filesystem. Writers
//! use write-to-temp-then-rename so readers never observe a partially
//! written message.

pub mod archive;
pub mod envelope;
pub mod router;
pub mod store;

pub use archive::{ArchiveBucket, ArchiveStore};
pub use envelope::{AgentId, Envelope, EnvelopeError, MessageType, ResultStatus, PROTOCOL_VERSION};
pub use router::{Router, RouterConfig, RouterService, SweepReport};
pub use store::{PostboxError, PostboxStore};
