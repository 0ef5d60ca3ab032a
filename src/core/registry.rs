/// Event Registry
///
/// Maps client event names to handlers. Each event module exports a
/// `register` function that adds its events during server initialization,
/// and the registry is then shared read-only by every session.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

use crate::core::error::RelayError;
use crate::core::hub::Hub;

/// Public description of a client event, listed on `/events`.
#[derive(Serialize, Debug, Clone)]
pub struct EventSpec {
    pub name: String,
    pub description: String,
}

/// What a handler knows about the caller.
pub struct EventContext<'a> {
    pub conn_id: &'a str,
    pub hub: &'a Hub,
}

/// Event handler function type.
///
/// Handlers receive the caller context and the frame's `data` and return
/// the acknowledgement payload. They must be Send + Sync because the
/// registry is shared across worker threads.
pub type EventHandler =
    Box<dyn Fn(&EventContext<'_>, Value) -> Result<Value, RelayError> + Send + Sync>;

#[derive(Default)]
pub struct EventRegistry {
    specs: Vec<EventSpec>,
    handlers: HashMap<String, EventHandler>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Registering a name twice replaces the handler.
    pub fn register<F>(&mut self, spec: EventSpec, handler: F)
    where
        F: Fn(&EventContext<'_>, Value) -> Result<Value, RelayError> + Send + Sync + 'static,
    {
        let name = spec.name.clone();
        let handler: EventHandler = Box::new(handler);
        if self.handlers.insert(name.clone(), handler).is_some() {
            self.specs.retain(|s| s.name != name);
        }
        self.specs.push(spec);
    }

    pub fn dispatch(&self, ctx: &EventContext<'_>, event: &str, data: Value) -> Result<Value, RelayError> {
        match self.handlers.get(event) {
            Some(handler) => handler(ctx, data),
            None => Err(RelayError::UnknownEvent(event.to_string())),
        }
    }

    pub fn specs(&self) -> &[EventSpec] {
        &self.specs
    }
}

/// Pull a required string field out of event data.
pub fn required_str<'a>(data: &'a Value, field: &str) -> Result<&'a str, RelayError> {
    data.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| RelayError::InvalidFrame(format!("missing required field: {field}")))
}
