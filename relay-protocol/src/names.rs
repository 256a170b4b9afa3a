//! Command and event names.
//!
//! Names are `"<entity> <verb>"`. Commands flow client → relay, events
//! flow relay → client; `room add`, `user edit` and `message add` are both.

// Commands
pub const ROOM_ADD: &str = "room add";
pub const ROOM_SUBSCRIBE: &str = "room subscribe";
pub const ROOM_UNSUBSCRIBE: &str = "room unsubscribe";
pub const USER_EDIT: &str = "user edit";
pub const USER_SUBSCRIBE: &str = "user subscribe";
pub const USER_UNSUBSCRIBE: &str = "user unsubscribe";
pub const MESSAGE_ADD: &str = "message add";
pub const MESSAGE_SUBSCRIBE: &str = "message subscribe";
pub const MESSAGE_UNSUBSCRIBE: &str = "message unsubscribe";

// Events
pub const USER_ADD: &str = "user add";
pub const USER_REMOVE: &str = "user remove";
pub const ERROR: &str = "error";

/// Every command the relay registers at startup.
pub const COMMANDS: &[&str] = &[
    ROOM_ADD,
    ROOM_SUBSCRIBE,
    ROOM_UNSUBSCRIBE,
    USER_EDIT,
    USER_SUBSCRIBE,
    USER_UNSUBSCRIBE,
    MESSAGE_ADD,
    MESSAGE_SUBSCRIBE,
    MESSAGE_UNSUBSCRIBE,
];

/// Builds an event name from an entity and a verb, e.g. `("user", "edit")`.
pub fn event_name(entity: &str, verb: &str) -> String {
    format!("{} {}", entity, verb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_name() {
        assert_eq!(event_name("user", "edit"), USER_EDIT);
        assert_eq!(event_name("room", "add"), ROOM_ADD);
        assert_eq!(event_name("user", "remove"), USER_REMOVE);
    }

    #[test]
    fn test_commands_unique() {
        let mut sorted = COMMANDS.to_vec();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), COMMANDS.len());
    }
}
