//! Core types and error definitions for the Switchyard hub.
//!
//! This crate provides the foundational types shared across all Switchyard
//! crates: the error type, the `{ type, data }` wire envelope with its typed
//! inbound/outbound messages, capability tags, the periodic ticker used by
//! every background loop, and the contracts for external collaborators.
//!
//! # Main types
//!
//! - [`SwitchyardError`]: Unified error enum for all hub components.
//! - [`SwitchyardResult`]: Convenience alias for `Result<T, SwitchyardError>`.
//! - [`Envelope`]: The raw wire frame.
//! - [`InboundMessage`] / [`OutboundMessage`]: Typed messages per `type` tag.
//! - [`Capability`] / [`CapabilitySet`]: Closed set of work tags with superset matching.
//! - [`spawn_periodic`]: Cancellable fixed-interval loop.

/// Collaborator contracts (job queue, broadcast relay).
pub mod boundary;
/// Capability tags and sets.
pub mod capability;
/// Error types.
pub mod error;
/// Wire envelope and typed messages.
pub mod message;
/// Cancellable periodic loops.
pub mod ticker;

pub use boundary::{
    BroadcastRelay, InMemoryJobQueue, IntegrationJob, JobQueue, NoopRelay, RetryPolicy,
};
pub use capability::{Capability, CapabilitySet};
pub use error::{SwitchyardError, SwitchyardResult};
pub use message::{
    ConnectionKind, Envelope, Heartbeat, InboundMessage, MessageKind, OutboundMessage,
    ReportedStatus, ServiceRestartRequest, TaskAssignment, TaskUpdate, WorkerRegistration,
};
pub use ticker::spawn_periodic;
pub use tokio_util::sync::CancellationToken;
