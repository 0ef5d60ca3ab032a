/// Core Server Framework Module
///
/// This module contains the relay implementation:
/// - config.rs: environment-driven configuration
/// - error.rs: error type shared by HTTP and WebSocket paths
/// - hub.rs: connection and room registry with fan-out
/// - logging.rs: tracing subscriber setup
/// - protocol.rs: JSON frame formats
/// - registry.rs: client event registry
/// - server.rs: Actix Web routes and server startup
/// - session.rs: WebSocket and server-sent-event sessions

pub mod config;
pub mod error;
pub mod hub;
pub mod logging;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
