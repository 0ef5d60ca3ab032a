/// Room Events
///
/// `join`, `leave` and `rooms` manage the caller's room membership. Other
/// members are notified by the hub with `joined` / `left` events.

use serde_json::json;

use crate::core::registry::{EventRegistry, EventSpec, required_str};

pub fn register(registry: &mut EventRegistry) {
    registry.register(
        EventSpec {
            name: "join".to_string(),
            description: "Join a room. Data: {\"room\": string}.".to_string(),
        },
        |ctx, data| {
            let room = required_str(&data, "room")?.trim();
            let members = ctx.hub.join(ctx.conn_id, room)?;
            Ok(json!({ "room": room, "members": members }))
        },
    );

    registry.register(
        EventSpec {
            name: "leave".to_string(),
            description: "Leave a room. Data: {\"room\": string}.".to_string(),
        },
        |ctx, data| {
            let room = required_str(&data, "room")?.trim();
            let left = ctx.hub.leave(ctx.conn_id, room)?;
            Ok(json!({ "room": room, "left": left }))
        },
    );

    registry.register(
        EventSpec {
            name: "rooms".to_string(),
            description: "List the rooms the caller has joined.".to_string(),
        },
        |ctx, _| {
            let rooms = ctx.hub.rooms_of(ctx.conn_id)?;
            Ok(json!({ "rooms": rooms }))
        },
    );
}
