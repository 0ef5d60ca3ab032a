/// Relay Event
///
/// `broadcast` forwards an event from the caller to every other client, or
/// to the other members of one room. Clients may only target rooms they
/// have joined.

use serde_json::{Value, json};

use crate::core::error::RelayError;
use crate::core::hub::{Target, validate_room};
use crate::core::protocol::{EventFrame, validate_relay_event};
use crate::core::registry::{EventRegistry, EventSpec, required_str};

pub fn register(registry: &mut EventRegistry) {
    let spec = EventSpec {
        name: "broadcast".to_string(),
        description: "Relay an event to other clients. Data: {\"event\": string, \"data\"?: any, \"room\"?: string}."
            .to_string(),
    };
    registry.register(spec, |ctx, data| {
        let event = validate_relay_event(required_str(&data, "event")?)?;
        let payload = data.get("data").cloned().unwrap_or(Value::Null);

        let (target, frame) = match data.get("room") {
            None | Some(Value::Null) => (Target::All, EventFrame::new(event, payload)),
            Some(Value::String(room)) => {
                let room = validate_room(room)?;
                if !ctx.hub.is_member(ctx.conn_id, &room) {
                    return Err(RelayError::NotInRoom(room));
                }
                let frame = EventFrame::new(event, payload).in_room(room.as_str());
                (Target::Room(room), frame)
            }
            Some(_) => {
                return Err(RelayError::InvalidFrame("room must be a string".to_string()));
            }
        };

        let delivered = ctx
            .hub
            .broadcast(&target, &frame.from_conn(ctx.conn_id), Some(ctx.conn_id))?;
        Ok(json!({ "delivered": delivered }))
    });
}
