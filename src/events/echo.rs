/// Echo Event
///
/// Returns the frame's data unchanged. Useful for clients measuring round
/// trips and for checking that a connection is alive end to end.

use crate::core::registry::{EventRegistry, EventSpec};

pub fn register(registry: &mut EventRegistry) {
    let spec = EventSpec {
        name: "echo".to_string(),
        description: "Send the data back to the caller.".to_string(),
    };
    registry.register(spec, |_, data| Ok(data));
}
