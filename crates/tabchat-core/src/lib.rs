//! Core types and error definitions for tabchat.
//!
//! This crate holds the types shared by every part of the chat client: the
//! conversation [`Message`] and its [`Role`], image [`Attachment`]s, and the
//! unified [`ChatError`].
//!
//! # Main types
//!
//! - [`ChatError`]: Failure kinds of completion requests and streams.
//! - [`ChatResult`]: Convenience alias for `Result<T, ChatError>`.
//! - [`Role`]: Message role (user, assistant, system).
//! - [`Message`]: A single message within a conversation tab.
//! - [`Attachment`]: A base64 image payload with its MIME type.

/// Image attachment encoding.
pub mod attachment;
/// Error types.
pub mod error;
/// Tracing subscriber setup.
pub mod logging;
/// Conversation messages.
pub mod message;

pub use attachment::Attachment;
pub use error::{ChatError, ChatResult};
pub use message::{Message, Role};
