//! Request and response bodies of the chat-completions endpoint.

use crate::config::ModelSettings;
use crate::context::ContextWindow;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tabchat_core::{Message, Role};
use tracing::warn;

/// Detail level requested for image parts.
pub const IMAGE_DETAIL: &str = "auto";

/// Stop sequence(s) for a non-streaming completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StopSequence {
    /// A single stop string.
    One(String),
    /// Up to four stop strings.
    Many(Vec<String>),
}

/// Body of a non-streaming, prompt-style completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Prompt text.
    pub prompt: String,
    /// Upper bound on generated tokens.
    pub max_tokens: u32,
    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Nucleus sampling mass.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    /// Number of choices to generate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
    /// Always `false` for this request shape.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    /// Number of log probabilities to return per token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logprobs: Option<u32>,
    /// Echo the prompt back in the completion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub echo: Option<bool>,
    /// Where generation stops.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopSequence>,
    /// Penalty for tokens already present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    /// Penalty proportional to token frequency.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    /// Server-side candidates to pick the best from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_of: Option<u32>,
    /// Per-token logit adjustments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logit_bias: Option<HashMap<String, f32>>,
    /// End-user identifier for abuse monitoring.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

impl CompletionRequest {
    /// A request carrying only the prompt and a token limit.
    pub fn new(prompt: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            prompt: prompt.into(),
            max_tokens,
            temperature: None,
            top_p: None,
            n: None,
            stream: Some(false),
            logprobs: None,
            echo: None,
            stop: None,
            presence_penalty: None,
            frequency_penalty: None,
            best_of: None,
            logit_bias: None,
            user: None,
        }
    }

    /// A request whose sampling options come from `settings`.
    pub fn with_settings(prompt: impl Into<String>, settings: &ModelSettings) -> Self {
        Self {
            temperature: Some(settings.temperature),
            top_p: Some(settings.top_p),
            frequency_penalty: Some(settings.frequency_penalty),
            ..Self::new(prompt, settings.max_tokens)
        }
    }

    /// Uses the flattened history of `context` as the prompt.
    pub fn from_history(context: &ContextWindow, settings: &ModelSettings) -> Self {
        Self::with_settings(context.context_string(), settings)
    }

    /// Sets the stop sequence(s).
    pub fn stop(mut self, stop: StopSequence) -> Self {
        self.stop = Some(stop);
        self
    }

    /// Sets the end-user identifier.
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }
}

/// One generated alternative.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CompletionChoice {
    /// Generated text.
    #[serde(default)]
    pub text: String,
    /// Position among the returned choices.
    #[serde(default)]
    pub index: u32,
    /// Raw log-probability data, when requested.
    #[serde(default)]
    pub logprobs: Option<serde_json::Value>,
    /// Why generation stopped (`stop`, `length`, ...).
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens in the prompt.
    #[serde(default)]
    pub prompt_tokens: u32,
    /// Tokens generated.
    #[serde(default)]
    pub completion_tokens: u32,
    /// Sum of both.
    #[serde(default)]
    pub total_tokens: u32,
}

/// Body of a non-streaming completion response.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// Provider-assigned completion id.
    #[serde(default)]
    pub id: String,
    /// Object type, e.g. `text_completion`.
    #[serde(default)]
    pub object: String,
    /// Unix timestamp of creation.
    #[serde(default)]
    pub created: i64,
    /// Model that served the request.
    #[serde(default)]
    pub model: String,
    /// Generated alternatives.
    #[serde(default)]
    pub choices: Vec<CompletionChoice>,
    /// Token accounting.
    #[serde(default)]
    pub usage: Usage,
}

impl CompletionResponse {
    /// Text of the first choice, if any.
    pub fn text(&self) -> Option<&str> {
        self.choices.first().map(|c| c.text.as_str())
    }
}

/// One element of a multimodal message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Plain text.
    Text {
        /// The message text.
        text: String,
    },
    /// An inline image.
    ImageUrl {
        /// Image location and detail level.
        image_url: ImageUrl,
    },
}

/// Image reference inside an `image_url` part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    /// A `data:` URL carrying the base64 payload.
    pub url: String,
    /// Requested detail level.
    pub detail: String,
}

/// Message content: plain text for the system prompt, parts otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ApiContent {
    /// A bare string.
    Text(String),
    /// Text and image parts.
    Parts(Vec<ContentPart>),
}

/// One message as sent on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiMessage {
    /// `system`, `user` or `assistant`.
    pub role: String,
    /// Message body.
    pub content: ApiContent,
}

/// Body of a streaming chat request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamRequest {
    /// Model identifier.
    pub model: String,
    /// System prompt followed by the conversation.
    pub messages: Vec<ApiMessage>,
    /// Upper bound on generated tokens.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
    /// Nucleus sampling mass.
    pub top_p: f32,
    /// Top-k sampling; omitted when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    /// Penalty proportional to token frequency.
    pub frequency_penalty: f32,
    /// Always `true`.
    pub stream: bool,
}

impl StreamRequest {
    /// Builds the request: the system prompt first, then every message as
    /// content parts. Attachments are dropped when `allow_images` is false.
    pub fn build(
        model: &str,
        system_prompt: &str,
        messages: &[Message],
        settings: &ModelSettings,
        allow_images: bool,
    ) -> Self {
        let mut api_messages = Vec::with_capacity(messages.len() + 1);
        api_messages.push(ApiMessage {
            role: Role::System.as_str().to_string(),
            content: ApiContent::Text(system_prompt.to_string()),
        });
        api_messages.extend(messages.iter().map(|m| ApiMessage {
            role: m.role.as_str().to_string(),
            content: ApiContent::Parts(content_parts(m, allow_images)),
        }));

        Self {
            model: model.to_string(),
            messages: api_messages,
            max_tokens: settings.max_tokens,
            temperature: settings.temperature,
            top_p: settings.top_p,
            top_k: settings.top_k,
            frequency_penalty: settings.frequency_penalty,
            stream: true,
        }
    }
}

/// Converts one message into its text part (if non-empty) followed by one
/// image part per usable attachment.
pub fn content_parts(message: &Message, allow_images: bool) -> Vec<ContentPart> {
    let mut parts = Vec::with_capacity(1 + message.attachments.len());
    if !message.content().is_empty() {
        parts.push(ContentPart::Text {
            text: message.content().to_string(),
        });
    }

    if message.has_attachments() && !allow_images {
        warn!(
            message_id = %message.id,
            count = message.attachments.len(),
            "Model does not accept attachments, dropping them"
        );
        return parts;
    }

    for attachment in &message.attachments {
        if !attachment.has_payload() {
            warn!(
                message_id = %message.id,
                attachment_id = attachment.id.as_deref().unwrap_or("-"),
                "Attachment has no base64 payload, skipping"
            );
            continue;
        }
        parts.push(ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: attachment.data_url(),
                detail: IMAGE_DETAIL.to_string(),
            },
        });
    }
    parts
}

/// One decoded `data:` frame of a streaming response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamChunk {
    /// Usually a single choice.
    #[serde(default)]
    pub choices: Vec<StreamChoice>,
}

/// One choice within a frame.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamChoice {
    /// The increment.
    #[serde(default)]
    pub delta: StreamDelta,
}

/// Incremental message fields; only `content` is used.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamDelta {
    /// New text, absent on role-only frames.
    #[serde(default)]
    pub content: Option<String>,
}

impl StreamChunk {
    /// `choices[0].delta.content`, or empty when absent.
    pub fn into_delta(self) -> String {
        self.choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.content)
            .unwrap_or_default()
    }
}
