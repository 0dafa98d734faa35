use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ChannelId);
id_newtype!(MessageId);

impl MessageId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Delivery status of a locally originated message. Never serialized onto the
/// wire: the client keeps it next to the message, not inside it, and absence
/// means "sent".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendStatus {
    Pending,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    pub id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// The atomic unit of conversation. `id` is the merge key and is stable
/// across retries; `created_at` is the only ordering and cursor field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub sender: Sender,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// A message body is present when either the text or the attachment
    /// reference is non-empty.
    pub fn has_body(&self) -> bool {
        let text_present = self.text.as_deref().is_some_and(|t| !t.trim().is_empty());
        let image_present = self
            .image_url
            .as_deref()
            .is_some_and(|u| !u.trim().is_empty());
        text_present || image_present
    }

    /// Short body used as the push-notification preview.
    pub fn preview(&self) -> String {
        match self.text.as_deref().filter(|t| !t.trim().is_empty()) {
            Some(text) => text.to_string(),
            None => "You received an image".to_string(),
        }
    }
}

/// An incoming submit before the server has filled in defaults. `id` and
/// `created_at` stay optional so retries can carry a previously assigned id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDraft {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    pub channel_id: ChannelId,
    pub sender: Sender,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl From<Message> for MessageDraft {
    fn from(message: Message) -> Self {
        Self {
            id: Some(message.id),
            channel_id: message.channel_id,
            sender: message.sender,
            text: message.text,
            image_url: message.image_url,
            created_at: Some(message.created_at),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSummary {
    pub channel_id: ChannelId,
    pub description: String,
}
