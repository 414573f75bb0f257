use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;

/// Opaque binary payload carried alongside message text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub mime: String,
    pub filename: String,
    #[serde(default)]
    pub data: Vec<u8>,
}

impl Attachment {
    pub fn new(mime: impl Into<String>, filename: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            mime: mime.into(),
            filename: filename.into(),
            data,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    #[default]
    Direct,
    Group,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub channel_id: String,
    pub sender_id: String,
    pub chat_id: String,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Always carries `message_id` and `timestamp`.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub chat_type: ChatType,
    #[serde(skip, default = "Instant::now")]
    pub received_at: Instant,
}

impl InboundMessage {
    pub fn new(channel_id: &str, sender_id: &str, chat_id: &str, content: &str) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            sender_id: sender_id.to_string(),
            chat_id: chat_id.to_string(),
            content: content.to_string(),
            attachments: Vec::new(),
            metadata: BTreeMap::new(),
            chat_type: ChatType::Direct,
            received_at: Instant::now(),
        }
    }

    pub fn with_chat_type(mut self, chat_type: ChatType) -> Self {
        self.chat_type = chat_type;
        self
    }

    /// Direct chats key on the sender, group chats on the chat.
    pub fn session_key(&self) -> String {
        match self.chat_type {
            ChatType::Direct => format!("{}:{}", self.channel_id, self.sender_id),
            ChatType::Group => format!("{}:{}", self.channel_id, self.chat_id),
        }
    }

    pub fn message_id(&self) -> Option<&str> {
        self.metadata.get("message_id").map(String::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel_id: String,
    pub chat_id: String,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_message_id: Option<String>,
}

impl OutboundMessage {
    pub fn new(channel_id: &str, chat_id: &str, content: &str) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            chat_id: chat_id.to_string(),
            content: content.to_string(),
            attachments: Vec::new(),
            reply_to_message_id: None,
        }
    }

    /// Builds the reply addressed back to the conversation `inbound` came from.
    pub fn reply_to(inbound: &InboundMessage, content: &str) -> Self {
        Self {
            channel_id: inbound.channel_id.clone(),
            chat_id: inbound.chat_id.clone(),
            content: content.to_string(),
            attachments: Vec::new(),
            reply_to_message_id: inbound.message_id().map(str::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_key_policy() {
        let dm = InboundMessage::new("telegram", "42", "42", "hi");
        assert_eq!(dm.session_key(), "telegram:42");

        let group = InboundMessage::new("telegram", "42", "-100", "hi").with_chat_type(ChatType::Group);
        assert_eq!(group.session_key(), "telegram:-100");
    }

    #[test]
    fn test_reply_targets_origin() {
        let mut inbound = InboundMessage::new("discord", "u1", "c9", "ping");
        inbound.metadata.insert("message_id".into(), "m77".into());
        let out = OutboundMessage::reply_to(&inbound, "pong");
        assert_eq!(out.channel_id, "discord");
        assert_eq!(out.chat_id, "c9");
        assert_eq!(out.reply_to_message_id.as_deref(), Some("m77"));
    }
}
