//! Command name to handler routing.

use crate::connection::Connection;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;

/// A command handler. Receives the issuing connection and the raw payload.
pub type Handler = for<'a> fn(&'a Connection, Value) -> BoxFuture<'a, ()>;

/// Static mapping from command names to handlers.
///
/// Built once at startup and shared read-only afterwards.
#[derive(Default)]
pub struct CommandRouter {
    rules: HashMap<String, Handler>,
}

impl CommandRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler. A later registration under the same name wins.
    pub fn register(&mut self, name: impl Into<String>, handler: Handler) {
        let name = name.into();
        if self.rules.insert(name.clone(), handler).is_some() {
            tracing::warn!("Replacing handler for command '{}'", name);
        } else {
            tracing::info!("Registered handler for command '{}'", name);
        }
    }

    /// Looks up the handler for a command name.
    pub fn resolve(&self, name: &str) -> Option<Handler> {
        self.rules.get(name).copied()
    }

    /// Returns registered command names, sorted.
    pub fn commands(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.rules.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl std::fmt::Debug for CommandRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRouter")
            .field("commands", &self.commands())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_conn: &Connection, _data: Value) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }

    fn other(_conn: &Connection, _data: Value) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }

    #[test]
    fn test_resolve() {
        let mut router = CommandRouter::new();
        assert!(router.is_empty());
        router.register("room add", noop);

        assert!(router.resolve("room add").is_some());
        assert!(router.resolve("room remove").is_none());
        assert!(router.resolve("").is_none());
    }

    #[test]
    fn test_register_overwrites() {
        let mut router = CommandRouter::new();
        router.register("room add", noop);
        router.register("room add", other);
        router.register("room subscribe", noop);

        assert_eq!(router.len(), 2);
        assert_eq!(router.commands(), vec!["room add", "room subscribe"]);
    }
}
