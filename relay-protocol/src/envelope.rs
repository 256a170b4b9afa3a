//! The named, payload-carrying unit exchanged between client and relay.

use crate::names;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A command (client → relay) or event (relay → client).
///
/// Fields are private so an envelope cannot change after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    name: String,

    /// Opaque payload. Absent on the wire decodes as `null`.
    #[serde(default)]
    data: Value,
}

impl Envelope {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    /// Creates an envelope with a `null` payload.
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, Value::Null)
    }

    /// Creates an `error` event carrying a human-readable message.
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(names::ERROR, Value::String(message.into()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Returns whether this is an `error` event.
    pub fn is_error(&self) -> bool {
        self.name == names::ERROR
    }

    /// Returns the error message if this is an `error` event.
    pub fn error_message(&self) -> Option<&str> {
        if self.is_error() {
            self.data.as_str()
        } else {
            None
        }
    }

    /// Consumes the envelope, returning its name and payload.
    pub fn into_parts(self) -> (String, Value) {
        (self.name, self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_wire_shape() {
        let env = Envelope::new("room add", json!({"name": "general"}));
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value, json!({"name": "room add", "data": {"name": "general"}}));
    }

    #[test]
    fn test_missing_data_is_null() {
        let env: Envelope = serde_json::from_str(r#"{"name":"room subscribe"}"#).unwrap();
        assert_eq!(env.name(), "room subscribe");
        assert!(env.data().is_null());
    }

    #[test]
    fn test_missing_name_rejected() {
        let result = serde_json::from_str::<Envelope>(r#"{"data":{}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_error_envelope() {
        let env = Envelope::error("boom");
        assert!(env.is_error());
        assert_eq!(env.error_message(), Some("boom"));

        let env = Envelope::named("room add");
        assert!(!env.is_error());
        assert_eq!(env.error_message(), None);
    }

    #[test]
    fn test_into_parts() {
        let (name, data) = Envelope::new("user edit", json!({"name": "ada"})).into_parts();
        assert_eq!(name, "user edit");
        assert_eq!(data["name"], "ada");
    }
}
