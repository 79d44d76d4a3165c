//! Tracing subscriber bootstrap.

use crate::{ChatError, ChatResult};
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Output format of the installed subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

/// Installs the global fmt subscriber, filtered by `RUST_LOG` (default
/// `info`). Fails if a global subscriber is already set.
pub fn init(format: LogFormat) -> ChatResult<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let result = match format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    result.map_err(|e| ChatError::Config(format!("Failed to install tracing subscriber: {e}")))?;
    debug!(format = ?format, "Tracing subscriber installed");
    Ok(())
}

/// Masks an API key for log output, keeping only its first three and last
/// four characters.
pub fn redact_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "***".to_string();
    }
    let head: String = chars[..3].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}…{tail}")
}
