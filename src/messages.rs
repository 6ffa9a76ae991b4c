use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::Identity;

/// What a browser sends. Only the body is trusted; any sender or
/// timestamp fields the peer includes are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientMessage {
    pub body: String,
}

/// A message as it is fanned out to every participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub body: String,
    #[serde(rename = "senderName")]
    pub sender_name: String,
    #[serde(rename = "senderAvatarURL")]
    pub sender_avatar_url: String,
    #[serde(rename = "sentAt")]
    pub sent_at: DateTime<Utc>,
}

impl ChatMessage {
    /// Stamps a client body with the server's view of who sent it and when.
    pub fn stamp(body: String, sender: &Identity, sent_at: DateTime<Utc>) -> Self {
        ChatMessage {
            body,
            sender_name: sender.name.clone(),
            sender_avatar_url: sender.avatar_url.clone(),
            sent_at,
        }
    }
}
