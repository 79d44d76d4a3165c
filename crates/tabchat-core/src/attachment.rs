//! Image attachments for multimodal messages.
//!
//! An [`Attachment`] is always held in its wire form: a base64 payload plus
//! the MIME type that goes into the `data:` URL of an image content part.

use crate::{ChatError, ChatResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// MIME type assumed when none is given and the bytes are not recognised.
pub const DEFAULT_IMAGE_MIME: &str = "image/jpeg";

/// A base64-encoded image attached to a [`crate::Message`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Base64 payload without any `data:` prefix. May be empty, in which
    /// case the attachment is skipped when building a request.
    pub base64: String,
    /// MIME type of the decoded image.
    #[serde(default = "default_mime")]
    pub mime_type: String,
    /// Optional caller-assigned identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

fn default_mime() -> String {
    DEFAULT_IMAGE_MIME.to_string()
}

impl Attachment {
    /// Encodes raw image bytes. When `mime_type` is `None` the type is
    /// sniffed from the magic number, falling back to [`DEFAULT_IMAGE_MIME`].
    pub fn from_bytes(bytes: &[u8], mime_type: Option<&str>) -> Self {
        let mime_type = mime_type
            .map(str::to_string)
            .unwrap_or_else(|| sniff_mime(bytes).to_string());
        Self {
            base64: STANDARD.encode(bytes),
            mime_type,
            id: None,
        }
    }

    /// Parses a `data:<mime>;base64,<payload>` URL.
    pub fn from_data_url(url: &str) -> ChatResult<Self> {
        let rest = url
            .strip_prefix("data:")
            .ok_or_else(|| ChatError::Config("attachment is not a data URL".into()))?;
        let (meta, payload) = rest
            .split_once(',')
            .ok_or_else(|| ChatError::Config("data URL has no payload".into()))?;
        let mime = meta
            .strip_suffix(";base64")
            .ok_or_else(|| ChatError::Config("data URL is not base64-encoded".into()))?;

        Ok(Self {
            base64: payload.trim().to_string(),
            mime_type: if mime.is_empty() {
                default_mime()
            } else {
                mime.to_string()
            },
            id: None,
        })
    }

    /// Attaches a caller-chosen identifier.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Whether there is a payload to send.
    pub fn has_payload(&self) -> bool {
        !self.base64.is_empty()
    }

    /// Renders the attachment as used in an `image_url` content part.
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.base64)
    }
}

fn sniff_mime(bytes: &[u8]) -> &'static str {
    match bytes {
        [0x89, b'P', b'N', b'G', ..] => "image/png",
        [0xFF, 0xD8, 0xFF, ..] => "image/jpeg",
        [b'G', b'I', b'F', b'8', ..] => "image/gif",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "image/webp",
        _ => DEFAULT_IMAGE_MIME,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_sniffs_png() {
        let png = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        let att = Attachment::from_bytes(&png, None);
        assert_eq!(att.mime_type, "image/png");
        assert_eq!(att.base64, STANDARD.encode(png));
    }

    #[test]
    fn test_unknown_bytes_default_to_jpeg() {
        let att = Attachment::from_bytes(b"plain", None);
        assert_eq!(att.mime_type, DEFAULT_IMAGE_MIME);
    }

    #[test]
    fn test_explicit_mime_wins() {
        let png = [0x89, b'P', b'N', b'G'];
        let att = Attachment::from_bytes(&png, Some("image/x-custom"));
        assert_eq!(att.mime_type, "image/x-custom");
    }

    #[test]
    fn test_data_url_parsing() {
        let att = Attachment::from_data_url("data:image/gif;base64,R0lGOD").unwrap();
        assert_eq!(att.mime_type, "image/gif");
        assert_eq!(att.base64, "R0lGOD");
        assert_eq!(att.data_url(), "data:image/gif;base64,R0lGOD");

        assert!(Attachment::from_data_url("https://example.com/cat.png").is_err());
        assert!(Attachment::from_data_url("data:image/png,raw").is_err());
    }
}
