use std::borrow::Cow;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const TITLE_WORDS: usize = 10;
const UNTITLED: &str = "New chat";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// Atomic unit of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    /// An included text file.
    File {
        name: String,
        contents: String,
    },
    Image {
        mime_type: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: Value,
    },
    ToolResult {
        call_id: String,
        payload: String,
        #[serde(default, skip_serializing_if = "is_false")]
        is_error: bool,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    /// Text as a model without native document input should see it. Files
    /// are inlined between `---` fences under their name.
    pub fn as_text(&self) -> Option<Cow<'_, str>> {
        match self {
            ContentBlock::Text { text } => Some(Cow::Borrowed(text.as_str())),
            ContentBlock::File { name, contents } => {
                Some(Cow::Owned(format!("`{name}`\n---\n{contents}\n---")))
            }
            _ => None,
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(self, ContentBlock::Image { .. })
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// A tool invocation requested by a provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

impl ToolCallRequest {
    pub fn to_block(&self) -> ContentBlock {
        ContentBlock::ToolCall {
            id: self.id.clone(),
            name: self.name.clone(),
            arguments: self.arguments.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
    pub timestamp: DateTime<Utc>,
    /// Call-scoped failure shown to the user. Never sent to a provider.
    #[serde(default, skip_serializing_if = "is_false")]
    pub error: bool,
}

impl Message {
    pub fn new(role: Role, content: Vec<ContentBlock>) -> Self {
        Self {
            role,
            content,
            timestamp: Utc::now(),
            error: false,
        }
    }

    pub fn user(content: Vec<ContentBlock>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![ContentBlock::text(text)])
    }

    pub fn tool_result(call_id: &str, payload: impl Into<String>, is_error: bool) -> Self {
        Self::new(
            Role::Tool,
            vec![ContentBlock::ToolResult {
                call_id: call_id.to_string(),
                payload: payload.into(),
                is_error,
            }],
        )
    }

    pub fn error_turn(text: impl Into<String>) -> Self {
        Self {
            error: true,
            ..Self::assistant_text(text)
        }
    }

    /// Concatenated text and inlined files, separated by blank lines.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentBlock::as_text)
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = (&str, &str, &Value)> {
        self.content.iter().filter_map(|block| match block {
            ContentBlock::ToolCall {
                id,
                name,
                arguments,
            } => Some((id.as_str(), name.as_str(), arguments)),
            _ => None,
        })
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls().next().is_some()
    }

    pub fn has_images(&self) -> bool {
        self.content.iter().any(ContentBlock::is_image)
    }

    /// Whether this message belongs in a provider request.
    pub fn is_transmitted(&self) -> bool {
        !self.error
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    #[default]
    Stop,
    Length,
    ToolCalls,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Ordered message sequence for one session plus its metadata.
///
/// Only the conversation manager mutates the sequence; everything else
/// reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub usage: TokenUsage,
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new(model: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: now.format("%Y%m%d_%H%M%S").to_string(),
            title: UNTITLED.to_string(),
            model: model.into(),
            created_at: now,
            updated_at: now,
            usage: TokenUsage::default(),
            messages: Vec::new(),
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub(crate) fn push(&mut self, message: Message) {
        self.updated_at = message.timestamp;
        self.messages.push(message);
        if self.title == UNTITLED {
            self.title = self.derive_title();
        }
    }

    pub(crate) fn truncate(&mut self, len: usize) {
        self.messages.truncate(len);
        self.updated_at = Utc::now();
    }

    pub fn last_user_index(&self) -> Option<usize> {
        self.messages
            .iter()
            .rposition(|message| message.role == Role::User)
    }

    fn derive_title(&self) -> String {
        let Some(first) = self
            .messages
            .iter()
            .find(|message| message.role == Role::User)
        else {
            return UNTITLED.to_string();
        };
        let text = first.text();
        let words: Vec<&str> = text.split_whitespace().collect();
        if words.is_empty() {
            return UNTITLED.to_string();
        }
        let mut title = words
            .iter()
            .take(TITLE_WORDS)
            .copied()
            .collect::<Vec<_>>()
            .join(" ");
        if words.len() > TITLE_WORDS {
            title.push_str("...");
        }
        title
    }

    /// True when every tool_result references exactly one earlier tool_call.
    pub fn tool_links_are_consistent(&self) -> bool {
        let mut seen: Vec<&str> = Vec::new();
        for message in &self.messages {
            for block in &message.content {
                match block {
                    ContentBlock::ToolCall { id, .. } => seen.push(id),
                    ContentBlock::ToolResult { call_id, .. } => {
                        let matches = seen.iter().filter(|&&id| id == call_id.as_str()).count();
                        if matches != 1 {
                            return false;
                        }
                    }
                    _ => {}
                }
            }
        }
        true
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serializes only the message array.
    pub fn messages_to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.messages)
    }

    /// Rebuilds a conversation from a bare message array.
    pub fn from_messages_json(model: &str, json: &str) -> Result<Self, serde_json::Error> {
        let messages: Vec<Message> = serde_json::from_str(json)?;
        let mut conversation = Conversation::new(model);
        if let Some(first) = messages.first() {
            conversation.created_at = first.timestamp;
            conversation.id = first.timestamp.format("%Y%m%d_%H%M%S").to_string();
        }
        for message in messages {
            conversation.push(message);
        }
        Ok(conversation)
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
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
    use serde_json::json;

    fn tool_exchange() -> Conversation {
        let mut conversation = Conversation::new("gpt-4.1");
        conversation.push(Message::user(vec![ContentBlock::text("What's 2+2?")]));
        conversation.push(Message::new(
            Role::Assistant,
            vec![ContentBlock::ToolCall {
                id: "call_1".to_string(),
                name: "add".to_string(),
                arguments: json!({"a": 2, "b": 2}),
            }],
        ));
        conversation.push(Message::tool_result("call_1", "4", false));
        conversation.push(Message::assistant_text("2+2 is 4."));
        conversation
    }

    #[test]
    fn roles_serialize_lowercase() {
        assert_eq!(serde_json::to_value(Role::Tool).unwrap(), json!("tool"));
        assert_eq!(Role::Assistant.as_str(), "assistant");
    }

    #[test]
    fn tool_blocks_keep_call_ids_through_json() {
        let conversation = tool_exchange();
        let restored = Conversation::from_json(&conversation.to_json().unwrap()).unwrap();
        assert_eq!(restored, conversation);
        assert!(restored.tool_links_are_consistent());

        let value: Value = serde_json::from_str(&conversation.messages_to_json().unwrap()).unwrap();
        assert_eq!(value[1]["content"][0]["type"], "tool_call");
        assert_eq!(value[1]["content"][0]["id"], "call_1");
        assert_eq!(value[2]["role"], "tool");
        assert_eq!(value[2]["content"][0]["call_id"], "call_1");
        assert!(value[2]["content"][0].get("is_error").is_none());
    }

    #[test]
    fn image_bytes_are_base64_in_json() {
        let message = Message::user(vec![ContentBlock::Image {
            mime_type: "image/png".to_string(),
            data: vec![0x89, b'P', b'N', b'G'],
            name: Some("dot.png".to_string()),
        }]);
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["content"][0]["data"], "iVBORw==");
        let restored: Message = serde_json::from_value(value).unwrap();
        assert_eq!(restored, message);
    }

    #[test]
    fn message_array_rebuilds_conversation() {
        let original = tool_exchange();
        let json = original.messages_to_json().unwrap();
        let restored = Conversation::from_messages_json("gpt-4.1", &json).unwrap();
        assert_eq!(restored.messages(), original.messages());
        assert_eq!(restored.title, "What's 2+2?");
    }

    #[test]
    fn dangling_tool_result_is_detected() {
        let mut conversation = Conversation::new("m");
        conversation.push(Message::user(vec![ContentBlock::text("hi")]));
        conversation.push(Message::tool_result("missing", "oops", true));
        assert!(!conversation.tool_links_are_consistent());
    }

    #[test]
    fn title_uses_first_ten_words() {
        let mut conversation = Conversation::new("m");
        assert_eq!(conversation.title, "New chat");
        conversation.push(Message::user(vec![ContentBlock::text(
            "one two three four five six seven eight nine ten eleven",
        )]));
        assert_eq!(
            conversation.title,
            "one two three four five six seven eight nine ten..."
        );
        conversation.push(Message::user(vec![ContentBlock::text("later")]));
        assert_eq!(
            conversation.title,
            "one two three four five six seven eight nine ten..."
        );
    }

    #[test]
    fn error_turns_are_not_transmitted() {
        let turn = Message::error_turn("rate limited");
        assert_eq!(turn.role, Role::Assistant);
        assert!(!turn.is_transmitted());
        let value = serde_json::to_value(&turn).unwrap();
        assert_eq!(value["error"], true);
    }
}
