//! Message and metadata payloads carried inside relay/direct frames.
//!
//! The relay treats these as opaque JSON; only the orchestrators at either
//! end decode them. Field names on the wire are camelCase and the envelope
//! is flat (`text`, `attachment`, `groupName`, ... sit next to `id`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ConversationId, PeerId};

/// One chat message. `id` is supplied by the caller and must be passed
/// through every tier unmodified: consumers dedupe on it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    pub id: String,
    #[serde(rename = "chatId", default)]
    pub conversation_id: ConversationId,
    #[serde(rename = "senderId")]
    pub sender: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub body: MessageBody,
    #[serde(default)]
    pub is_group: bool,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub group: Option<GroupMeta>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MessageBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    /// Free-form kind, e.g. `image` or `file`.
    pub kind: String,
    #[serde(with = "base64_bytes")]
    pub bytes: Vec<u8>,
    pub file_name: String,
}

/// Group metadata attached to group messages so that a recipient who has
/// never seen the group can create it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GroupMeta {
    #[serde(rename = "groupName")]
    pub name: String,
    #[serde(default)]
    pub participants: Vec<PeerId>,
    #[serde(default)]
    pub admins: Vec<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<PeerId>,
}

/// Roster change for a group conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GroupRosterUpdate {
    #[serde(rename = "groupId")]
    pub conversation_id: ConversationId,
    #[serde(rename = "groupName")]
    pub display_name: String,
    #[serde(default)]
    pub participants: Vec<PeerId>,
    #[serde(default)]
    pub admins: Vec<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl MessageEnvelope {
    /// Plain text message stamped with the current time.
    pub fn text(
        id: impl Into<String>,
        conversation_id: ConversationId,
        sender: PeerId,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            conversation_id,
            sender,
            sender_name: None,
            timestamp: Utc::now(),
            body: MessageBody {
                text: Some(text.into()),
                attachment: None,
            },
            is_group: false,
            group: None,
        }
    }

    pub fn with_sender_name(mut self, name: impl Into<String>) -> Self {
        self.sender_name = Some(name.into());
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.body.attachment = Some(attachment);
        self
    }

    /// Mark the envelope as belonging to a group conversation.
    pub fn into_group(mut self, meta: GroupMeta) -> Self {
        self.is_group = true;
        self.group = Some(meta);
        self
    }

    pub fn to_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_text_envelope_is_flat_on_the_wire() {
        let env = MessageEnvelope::text("m1", "c1".into(), "peer_abc".into(), "hi");
        let value = env.to_value().unwrap();

        assert_eq!(value["id"], "m1");
        assert_eq!(value["chatId"], "c1");
        assert_eq!(value["senderId"], "peer_abc");
        assert_eq!(value["text"], "hi");
        assert_eq!(value["isGroup"], false);
        assert!(value.get("groupName").is_none());
        assert!(value.get("attachment").is_none());
        assert!(value["timestamp"].is_i64());
    }

    #[test]
    fn test_decode_payload_without_group_fields() {
        let value = json!({
            "id": "m7",
            "senderId": "peer_xyz",
            "senderName": "Xyz",
            "timestamp": 1_700_000_000_000i64,
            "text": "hello"
        });
        let env = MessageEnvelope::from_value(value).unwrap();

        assert_eq!(env.id, "m7");
        assert!(env.conversation_id.is_empty());
        assert_eq!(env.sender_name.as_deref(), Some("Xyz"));
        assert_eq!(env.body.text.as_deref(), Some("hello"));
        assert!(!env.is_group);
        assert!(env.group.is_none());
        assert_eq!(env.timestamp.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_group_meta_and_attachment() {
        let mut env = MessageEnvelope::text("g1", "grp".into(), "peer_a".into(), "yo")
            .with_attachment(Attachment {
                kind: "file".into(),
                bytes: vec![0, 1, 2, 255],
                file_name: "a.bin".into(),
            })
            .into_group(GroupMeta {
                name: "Friends".into(),
                participants: vec!["peer_a".into(), "peer_b".into()],
                admins: vec!["peer_a".into()],
                created_by: Some("peer_a".into()),
            });
        env.timestamp = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();

        let value = env.to_value().unwrap();
        assert_eq!(value["groupName"], "Friends");
        assert_eq!(value["createdBy"], "peer_a");
        assert_eq!(value["attachment"]["bytes"], "AAEC/w==");
        assert_eq!(value["attachment"]["fileName"], "a.bin");

        let back = MessageEnvelope::from_value(value).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn test_roster_update_wire_keys() {
        let update = GroupRosterUpdate {
            conversation_id: "grp".into(),
            display_name: "Friends".into(),
            participants: vec!["peer_a".into()],
            admins: vec![],
            avatar: None,
        };
        let value = serde_json::to_value(&update).unwrap();
        assert_eq!(value["groupId"], "grp");
        assert_eq!(value["groupName"], "Friends");
        assert!(value.get("avatar").is_none());
    }
}
