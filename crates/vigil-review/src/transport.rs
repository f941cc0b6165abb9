//! Mapping of HTTP transport outcomes onto [`VigilError`].

use vigil_core::VigilError;

/// Classify a `reqwest` failure so retries and breakers can act on it.
pub(crate) fn transport_error(context: &str, err: reqwest::Error) -> VigilError {
    if err.is_timeout() {
        VigilError::Timeout(format!("{context}: {err}"))
    } else if let Some(status) = err.status() {
        VigilError::Http {
            status: status.as_u16(),
            message: format!("{context}: {err}"),
        }
    } else if err.is_decode() {
        VigilError::InvalidInput(format!("{context}: failed to decode response: {err}"))
    } else {
        VigilError::Connection(format!("{context}: {err}"))
    }
}

/// Pass a successful response through; turn any other status into [`VigilError::Http`].
pub(crate) async fn ensure_success(
    context: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, VigilError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let reason = status.canonical_reason().unwrap_or("error");
    let message = if body.is_empty() {
        format!("{context}: {reason}")
    } else {
        format!("{context}: {reason}: {}", truncate(&body, 200))
    };
    Err(VigilError::Http {
        status: status.as_u16(),
        message,
    })
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("short", 50), "short");
        assert_eq!(truncate("", 3), "");
    }
}
