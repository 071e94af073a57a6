//! Connection registry and WebSocket gateway.
//!
//! The [`ConnectionRegistry`] owns every live duplex connection, assigns
//! identities, tracks liveness and fans messages out. The [`GatewayServer`]
//! wraps it in an axum router so workers, services and dashboards can
//! connect over WebSocket.

/// Connection registry and inbound dispatch.
pub mod connection;
/// API-key authentication for status endpoints.
pub mod middleware;
/// axum router and socket handling.
pub mod server;

pub use connection::{
    handler_fn, ConnectionEvent, ConnectionHandle, ConnectionInfo, ConnectionRegistry,
    MessageHandler, OutboundFrame, RegistryConfig,
};
pub use middleware::{AuthConfig, Principal};
pub use server::{GatewayServer, StatusSource};
