//! Streaming chat-completions client for tabbed conversations.
//!
//! The pieces, leaves first:
//!
//! - [`ContextWindow`] keeps one conversation's history under an estimated
//!   token budget.
//! - [`CompletionClient`] talks to an OpenAI-compatible endpoint, with
//!   retry on 5xx for plain completions and single-flight cancellable
//!   streaming.
//! - [`StreamDecoder`] turns the `data:` byte stream into [`StreamEvent`]s.
//! - [`ConversationTab`] ties a rendered message list to its context window.

/// Model configuration and environment defaults.
pub mod config;
/// Token-budgeted conversation history.
pub mod context;
/// Retry loop for non-streaming completions.
pub mod retry;
/// Decoding of `data:` frame streams into message events.
pub mod stream;
/// Conversation tabs.
pub mod tab;
/// HTTP transport, streaming and cancellation.
pub mod transport;
/// Request and response bodies.
pub mod wire;

pub use config::{EnvConfig, ModelConfig, ModelHandle, ModelSettings};
pub use context::{estimate_tokens, ContextWindow};
pub use retry::RetryPolicy;
pub use stream::{StreamDecoder, StreamEvent};
pub use tab::ConversationTab;
pub use transport::{ChatStream, CompletionClient, RequestPhase};
pub use wire::{CompletionRequest, CompletionResponse};
