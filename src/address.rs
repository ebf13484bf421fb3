//! Address-bar input normalization.

use url::Url;

use crate::error::MirageError;

/// Normalize user input into an absolute http(s) URL.
///
/// Bare hosts like `example.com/docs` get an `https://` scheme. Anything that
/// still fails to parse, uses another scheme, or lacks a host is rejected.
pub fn normalize_url(input: &str) -> Result<String, MirageError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(MirageError::InvalidUrl("url must not be empty".to_string()));
    }

    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };

    let parsed =
        Url::parse(&candidate).map_err(|e| MirageError::InvalidUrl(format!("{trimmed}: {e}")))?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(MirageError::InvalidUrl(format!(
            "{trimmed}: unsupported scheme {}",
            parsed.scheme()
        )));
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(MirageError::InvalidUrl(format!("{trimmed}: missing host")));
    }

    Ok(parsed.to_string())
}
