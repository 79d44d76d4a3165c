use crate::Attachment;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The role of the participant that authored a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// A human end-user.
    User,
    /// The model.
    Assistant,
    /// A system-level instruction.
    System,
}

impl Role {
    /// Wire name used by chat-completions endpoints.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// A single unit of conversation.
///
/// Content is append-only while [`Message::is_streaming`] is true and frozen
/// once the message is finished. User and system messages are finished at
/// creation; assistant messages built by the stream decoder start streaming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier, assigned once at creation.
    pub id: Uuid,
    /// The role of the message author.
    pub role: Role,
    content: String,
    /// Images sent alongside the text.
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    streaming: bool,
    /// UTC timestamp of when the message was created or sent.
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Creates a finished message with the given role and content.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            attachments: Vec::new(),
            streaming: false,
            timestamp: Utc::now(),
        }
    }

    /// Creates a new message with [`Role::User`].
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Creates a new message with [`Role::Assistant`].
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Creates a new message with [`Role::System`].
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Creates an assistant message that is still receiving content.
    pub fn streaming(initial: impl Into<String>) -> Self {
        Self {
            streaming: true,
            ..Self::assistant(initial)
        }
    }

    /// Adds an attachment.
    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// The text content.
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Whether content may still grow.
    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Whether any attachment is present.
    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }

    /// Appends a delta. Returns `false` and leaves content untouched if the
    /// message is already finished.
    pub fn append(&mut self, delta: &str) -> bool {
        if !self.streaming {
            return false;
        }
        self.content.push_str(delta);
        true
    }

    /// Freezes the content.
    pub fn finish(&mut self) {
        self.streaming = false;
    }
}
