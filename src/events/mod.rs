/// Client Events
///
/// Built-in events a connected client can send. Each module exports a
/// `register` function that adds its events to the registry during server
/// initialization.

pub mod echo;
pub mod relay;
pub mod rooms;
