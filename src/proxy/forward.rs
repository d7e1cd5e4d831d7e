use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue};
use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;

use crate::GatewayError;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

static REQUEST_ID_SEQ: AtomicU64 = AtomicU64::new(0);

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
];

/// Inbound credentials are placeholders from the vendor SDK and never leave the gateway.
const INBOUND_CREDENTIALS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "x-api-key",
    "api-key",
    "x-goog-api-key",
    "cookie",
];

/// Runs once when the upstream body fails after the status line arrived.
pub type BodyFailureHook = Box<dyn FnOnce(String) -> BoxFuture<'static, ()> + Send>;

/// Sends rewritten calls to whichever backend the pipeline resolved.
///
/// `timeout` bounds the wait for response headers and, separately, every gap
/// between body chunks. A long stream that keeps producing data is never cut.
#[derive(Clone, Debug)]
pub struct Forwarder {
    client: reqwest::Client,
    timeout: Duration,
}

impl Forwarder {
    pub fn new(timeout: Duration) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|err| GatewayError::Backend {
                message: format!("backend http client error: {err}"),
            })?;
        Ok(Self { client, timeout })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn send(
        &self,
        method: reqwest::Method,
        url: reqwest::Url,
        headers: HeaderMap,
        body: Option<Bytes>,
    ) -> Result<reqwest::Response, GatewayError> {
        let mut req = self.client.request(method, url).headers(headers);
        if let Some(body) = body {
            req = req.body(body);
        }
        let timed_out = || GatewayError::BackendTimeout {
            message: format!("no response within {:?}", self.timeout),
        };
        match tokio::time::timeout(self.timeout, req.send()).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) if err.is_timeout() => Err(timed_out()),
            Ok(Err(err)) => Err(GatewayError::Backend {
                message: format!("backend request failed: {err}"),
            }),
            Err(_) => Err(timed_out()),
        }
    }
}

pub fn sanitize_inbound_headers(headers: &mut HeaderMap) {
    headers.remove("host");
    headers.remove("content-length");
    for name in HOP_BY_HOP.iter().chain(INBOUND_CREDENTIALS) {
        headers.remove(*name);
    }
}

/// Hands the upstream response back unchanged apart from framing headers.
/// The body is streamed, so server-sent events flow through as they arrive.
///
/// A chunk gap longer than `idle_timeout`, or a transport error mid-body, ends
/// the stream with an error after `on_failure` has run. A caller that hangs up
/// just drops the stream and triggers nothing.
pub fn into_response(
    upstream: reqwest::Response,
    request_id: &str,
    idle_timeout: Duration,
    on_failure: Option<BodyFailureHook>,
) -> axum::response::Response {
    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
    headers.remove("content-length");
    insert_request_id(&mut headers, request_id);

    let body = guarded_body(upstream.bytes_stream().boxed(), idle_timeout, on_failure);
    let mut response = axum::response::Response::new(Body::from_stream(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn guarded_body(
    chunks: BoxStream<'static, reqwest::Result<Bytes>>,
    idle_timeout: Duration,
    on_failure: Option<BodyFailureHook>,
) -> impl futures_util::Stream<Item = std::io::Result<Bytes>> + Send + 'static {
    stream::unfold(Some((chunks, on_failure)), move |state| async move {
        let (mut chunks, mut on_failure) = state?;
        let failure = match tokio::time::timeout(idle_timeout, chunks.next()).await {
            Ok(Some(Ok(chunk))) => return Some((Ok(chunk), Some((chunks, on_failure)))),
            Ok(None) => return None,
            Ok(Some(Err(err))) => std::io::Error::other(err),
            Err(_) => std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("backend body stalled for {idle_timeout:?}"),
            ),
        };
        if let Some(hook) = on_failure.take() {
            hook(failure.to_string()).await;
        }
        Some((Err(failure), None))
    })
}

pub fn generate_request_id() -> String {
    let seq = REQUEST_ID_SEQ.fetch_add(1, Ordering::Relaxed);
    let ts_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0);
    format!("flow-{ts_ms}-{seq}")
}

/// Keeps a caller-supplied request id when it is a valid header value.
pub fn request_id_from(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty() && value.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(generate_request_id)
}

pub fn insert_request_id(headers: &mut HeaderMap, request_id: &str) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(REQUEST_ID_HEADER, value);
    }
}
