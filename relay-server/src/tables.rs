//! Store tables used by the relay.

pub const USER: &str = "user";
pub const ROOM: &str = "room";
pub const MESSAGE: &str = "message";

/// Tables created at startup.
pub const ALL: &[&str] = &[USER, ROOM, MESSAGE];

/// Tables whose records do not outlive the process.
pub const EPHEMERAL: &[&str] = &[USER];
