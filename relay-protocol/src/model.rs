//! Domain records stored by the relay and carried in envelope payloads.
//!
//! Field names follow the browser client's camelCase convention.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A connected user. One record exists per live connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
}

impl User {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
        }
    }
}

/// A chat room.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Room {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
}

impl Room {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
        }
    }
}

/// What a client submits with `message add`.
///
/// Authorship and timestamp are never taken from the client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MessageDraft {
    pub room_id: String,
    pub body: String,
}

/// A stored chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub room_id: String,
    pub body: String,
    pub author: String,
    #[serde(with = "fixed_rfc3339")]
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    /// Stamps a draft with server-side authorship and creation time.
    ///
    /// Returns `None` if the body is empty after trimming.
    pub fn from_draft(
        draft: MessageDraft,
        author: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Option<Self> {
        let body = draft.body.trim();
        if body.is_empty() {
            return None;
        }
        Some(Self {
            id: None,
            room_id: draft.room_id,
            body: body.to_string(),
            author: author.into(),
            created_at,
        })
    }
}

/// RFC 3339 with a fixed microsecond precision, so stored timestamps
/// order correctly as strings.
mod fixed_rfc3339 {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Micros, true))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&s)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_room_decode_ignores_missing_fields() {
        let room: Room = serde_json::from_value(json!({})).unwrap();
        assert_eq!(room, Room::default());

        let room: Room = serde_json::from_value(json!({"name": "general"})).unwrap();
        assert_eq!(room.name, "general");
        assert!(room.id.is_none());
    }

    #[test]
    fn test_room_decode_rejects_wrong_shape() {
        assert!(serde_json::from_value::<Room>(json!("general")).is_err());
        assert!(serde_json::from_value::<Room>(json!({"name": 7})).is_err());
    }

    #[test]
    fn test_user_serialize_skips_missing_id() {
        let value = serde_json::to_value(User::named("anonymous")).unwrap();
        assert_eq!(value, json!({"name": "anonymous"}));
    }

    #[test]
    fn test_draft_ignores_spoofed_fields() {
        let draft: MessageDraft = serde_json::from_value(json!({
            "roomId": "R1",
            "body": "hello",
            "author": "mallory",
            "createdAt": "1970-01-01T00:00:00Z",
        }))
        .unwrap();
        assert_eq!(draft.room_id, "R1");
        assert_eq!(draft.body, "hello");
    }

    #[test]
    fn test_from_draft_trims_and_stamps() {
        let now = Utc::now();
        let draft = MessageDraft {
            room_id: "R1".to_string(),
            body: "  hi \n".to_string(),
        };
        let msg = ChatMessage::from_draft(draft, "ada", now).unwrap();
        assert_eq!(msg.body, "hi");
        assert_eq!(msg.author, "ada");
        assert_eq!(msg.created_at, now);

        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["roomId"], "R1");
        assert!(value["createdAt"].is_string());
        assert!(value.get("id").is_none());
    }

    #[test]
    fn test_created_at_sorts_as_string() {
        let draft = |body: &str| MessageDraft {
            room_id: "R1".to_string(),
            body: body.to_string(),
        };
        let earlier = "2024-01-01T00:00:01Z".parse::<DateTime<Utc>>().unwrap();
        let later = "2024-01-01T00:00:01.500Z".parse::<DateTime<Utc>>().unwrap();

        let a = serde_json::to_value(ChatMessage::from_draft(draft("a"), "x", earlier).unwrap()).unwrap();
        let b = serde_json::to_value(ChatMessage::from_draft(draft("b"), "x", later).unwrap()).unwrap();
        assert_eq!(a["createdAt"], "2024-01-01T00:00:01.000000Z");
        assert!(a["createdAt"].as_str().unwrap() < b["createdAt"].as_str().unwrap());

        let back: ChatMessage = serde_json::from_value(b).unwrap();
        assert_eq!(back.created_at, later);
    }

    #[test]
    fn test_from_draft_discards_blank_body() {
        let draft = MessageDraft {
            room_id: "R1".to_string(),
            body: " \t\n ".to_string(),
        };
        assert!(ChatMessage::from_draft(draft, "ada", Utc::now()).is_none());
    }
}
