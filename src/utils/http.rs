use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use thiserror::Error;

const MAX_ERROR_BODY_BYTES: usize = 64 * 1024;

/// Failure of a JSON call to one of the gateway's collaborators.
#[derive(Debug, Error)]
pub(crate) enum HttpCallError {
    #[error("request timed out: {0}")]
    Timeout(reqwest::Error),
    #[error("request failed: {0}")]
    Transport(reqwest::Error),
    #[error("status {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("invalid response body: {0}")]
    Decode(reqwest::Error),
}

impl HttpCallError {
    fn from_send(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err)
        } else {
            Self::Transport(err)
        }
    }
}

pub(crate) async fn send_checked_json<T: DeserializeOwned>(
    req: reqwest::RequestBuilder,
) -> Result<T, HttpCallError> {
    let response = req.send().await.map_err(HttpCallError::from_send)?;
    let status = response.status();
    if !status.is_success() {
        let body = response_text_truncated(response, MAX_ERROR_BODY_BYTES).await;
        return Err(HttpCallError::Status { status, body });
    }
    response.json::<T>().await.map_err(HttpCallError::Decode)
}

pub(crate) async fn response_text_truncated(
    response: reqwest::Response,
    max_bytes: usize,
) -> String {
    let max_bytes = max_bytes.max(1);
    let mut out = Vec::<u8>::new();
    let mut truncated = false;

    let mut stream = response.bytes_stream();
    while let Some(next) = stream.next().await {
        let Ok(chunk) = next else {
            break;
        };
        let remaining = max_bytes.saturating_sub(out.len());
        if chunk.len() <= remaining {
            out.extend_from_slice(chunk.as_ref());
        } else {
            out.extend_from_slice(&chunk.as_ref()[..remaining]);
            truncated = true;
            break;
        }
    }

    let mut body = String::from_utf8_lossy(&out).to_string();
    if truncated {
        if !body.is_empty() {
            body.push('\n');
        }
        body.push_str("...(truncated)");
    }
    body
}

pub(crate) fn join_base_url(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        return base.to_string();
    }
    let mut out = String::with_capacity(base.len() + 1 + path.len());
    out.push_str(base);
    out.push('/');
    out.push_str(path);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_base_url_normalizes_slashes() {
        assert_eq!(
            join_base_url("https://flow.example.com/", "/ai-orchestration-api/v1/models"),
            "https://flow.example.com/ai-orchestration-api/v1/models"
        );
        assert_eq!(
            join_base_url("https://api.openai.com", "v1/chat/completions?stream=true"),
            "https://api.openai.com/v1/chat/completions?stream=true"
        );
        assert_eq!(join_base_url("http://127.0.0.1:9/", "/"), "http://127.0.0.1:9");
    }
}
