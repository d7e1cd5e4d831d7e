use std::sync::Arc;

use axum::body::{Body, to_bytes};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, Uri};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::FutureExt;
use serde_json::Value;
use tracing::Instrument;

use super::ProxyServices;
use super::forward::{
    BodyFailureHook, insert_request_id, into_response, request_id_from, sanitize_inbound_headers,
};
use crate::GatewayError;
use crate::credential::{Credential, CredentialKind};
use crate::utils::http::join_base_url;
use crate::vendor::{DirectAuth, InboundRequest, RouteKind, Vendor, VendorAdapter};

const MAX_REQUEST_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Delegated first, so a direct credential never shadows the orchestration route.
const ROUTE_ORDER: [RouteKind; 2] = [RouteKind::Delegated, RouteKind::Direct];

/// State one request accumulates on its way through the pipeline.
#[derive(Debug)]
pub struct RequestContext {
    pub request_id: String,
    pub vendor: Vendor,
    pub credential: Credential,
    pub token: String,
    pub model: String,
    route: Option<RouteKind>,
}

impl RequestContext {
    pub fn new(
        request_id: String,
        vendor: Vendor,
        credential: Credential,
        token: String,
        model: String,
    ) -> Self {
        Self {
            request_id,
            vendor,
            credential,
            token,
            model,
            route: None,
        }
    }

    /// Claims `route` for this request if nothing was dispatched yet and the
    /// credential can serve it. At most one claim ever succeeds.
    pub fn claim(&mut self, route: RouteKind, delegated_eligible: bool) -> bool {
        if self.route.is_some() {
            return false;
        }
        let serves = match (route, self.credential.kind()) {
            (RouteKind::Delegated, CredentialKind::Delegated) => delegated_eligible,
            (RouteKind::Direct, CredentialKind::Direct) => true,
            _ => false,
        };
        if serves {
            self.route = Some(route);
        }
        serves
    }

    pub fn route(&self) -> Option<RouteKind> {
        self.route
    }
}

struct Outbound {
    method: reqwest::Method,
    url: reqwest::Url,
    headers: HeaderMap,
    body: Option<Bytes>,
}

/// Runs the auth-select, token, eligibility, route and forward stages for
/// one vendor mount.
#[derive(Clone)]
pub struct ProxyPipeline {
    vendor: Vendor,
    adapter: Arc<dyn VendorAdapter>,
    services: Arc<ProxyServices>,
}

impl std::fmt::Debug for ProxyPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyPipeline")
            .field("vendor", &self.vendor)
            .finish_non_exhaustive()
    }
}

impl ProxyPipeline {
    pub fn new(adapter: Arc<dyn VendorAdapter>, services: Arc<ProxyServices>) -> Self {
        Self {
            vendor: adapter.vendor(),
            adapter,
            services,
        }
    }

    pub fn vendor(&self) -> Vendor {
        self.vendor
    }

    pub async fn handle(&self, request: Request<Body>) -> Response {
        let (parts, body) = request.into_parts();
        let request_id = request_id_from(&parts.headers);
        let path_and_query = self.relative_path(&parts.uri);
        let span = tracing::info_span!(
            "flow_gateway.proxy",
            request_id = %request_id,
            vendor = %self.vendor,
            method = %parts.method,
            path = %parts.uri.path(),
            client_id = tracing::field::Empty,
            route = tracing::field::Empty,
            model = tracing::field::Empty,
            status = tracing::field::Empty,
        );

        let result = self
            .run(request_id.clone(), parts, body, path_and_query)
            .instrument(span.clone())
            .await;
        match result {
            Ok(response) => response,
            Err(err) => {
                span.record("status", err.status().as_u16());
                tracing::warn!(parent: &span, code = err.code(), error = %err, "proxy request failed");
                let mut response = err.into_response();
                insert_request_id(response.headers_mut(), &request_id);
                response
            }
        }
    }

    /// Path below the vendor mount prefix, query string included.
    fn relative_path(&self, uri: &Uri) -> String {
        let path = uri
            .path()
            .strip_prefix(self.vendor.mount_prefix())
            .unwrap_or(uri.path());
        match uri.query() {
            Some(query) => format!("{path}?{query}"),
            None => path.to_string(),
        }
    }

    async fn run(
        &self,
        request_id: String,
        parts: Parts,
        body: Body,
        path_and_query: String,
    ) -> Result<Response, GatewayError> {
        let span = tracing::Span::current();
        let body = to_bytes(body, MAX_REQUEST_BODY_BYTES)
            .await
            .map_err(|err| GatewayError::invalid_request(format!("read request body: {err}")))?;
        let json = parse_json_body(&parts.headers, &body)?;

        let credential = self.select_credential().await?;
        span.record("client_id", credential.client_id());

        let token = self.services.tokens.token_for(&credential).await?;

        let model = self.adapter.extract_model(&InboundRequest {
            path: &path_and_query,
            body: json.as_ref(),
        })?;
        span.record("model", model.as_str());

        let mut ctx = RequestContext::new(request_id, self.vendor, credential, token, model);

        let allowed = match ctx.credential.kind() {
            CredentialKind::Delegated => self.services.allow_list.models_for(self.vendor).await?,
            CredentialKind::Direct => Vec::new(),
        };
        let eligible = allowed.iter().any(|model| model == &ctx.model);

        for route in ROUTE_ORDER {
            if !ctx.claim(route, eligible) {
                continue;
            }
            span.record("route", route.as_str());
            let outbound = match route {
                RouteKind::Delegated => {
                    self.delegated_call(&ctx, &parts, &path_and_query, json, &allowed)?
                }
                RouteKind::Direct => self.direct_call(&ctx, &parts, &path_and_query, body)?,
            };
            return self.forward(&ctx, outbound).await;
        }

        Err(GatewayError::NoEligibleRoute {
            vendor: self.vendor.to_string(),
            model: ctx.model,
        })
    }

    async fn select_credential(&self) -> Result<Credential, GatewayError> {
        let candidates: Vec<Credential> = self
            .services
            .credentials
            .list_credentials()
            .await?
            .into_iter()
            .filter(|credential| credential.applies_to(self.vendor))
            .collect();
        let ids: Vec<String> = candidates
            .iter()
            .map(|credential| credential.client_id().to_string())
            .collect();

        let selected = self
            .services
            .sampler
            .sample(self.services.config.traffic, self.vendor.as_str(), &ids)
            .await?;
        let credential = candidates
            .into_iter()
            .find(|credential| credential.client_id() == selected)
            .ok_or(GatewayError::NotFound {
                client_id: selected,
            })?;
        tracing::info!(credential = %credential.profile(), "selected credential");
        Ok(credential)
    }

    fn delegated_call(
        &self,
        ctx: &RequestContext,
        parts: &Parts,
        path_and_query: &str,
        json: Option<Value>,
        allowed: &[String],
    ) -> Result<Outbound, GatewayError> {
        let Credential::Delegated(delegated) = &ctx.credential else {
            return Err(GatewayError::configuration(
                "delegated route claimed by a direct credential",
            ));
        };
        let config = &self.services.config;
        let path = self.adapter.rewrite(RouteKind::Delegated, path_and_query)?;
        let url = parse_url(&join_base_url(ctx.credential.host(config)?, &path))?;

        let Some(Value::Object(mut fields)) = json else {
            return Err(GatewayError::invalid_request(
                "delegated calls need a json object body",
            ));
        };
        fields.insert("model".to_string(), Value::String(ctx.model.clone()));
        fields.insert(
            "allowedModels".to_string(),
            Value::Array(allowed.iter().cloned().map(Value::String).collect()),
        );
        let body = serde_json::to_vec(&Value::Object(fields))
            .map_err(|err| GatewayError::invalid_request(format!("encode body: {err}")))?;

        let mut headers = outbound_headers(&parts.headers, &ctx.request_id);
        let names = &config.headers;
        headers.insert(
            axum::http::header::AUTHORIZATION,
            header_value(&format!("Bearer {}", ctx.token))?,
        );
        headers.insert(header_name(&names.tenant)?, header_value(&delegated.tenant)?);
        headers.insert(header_name(&names.agent)?, header_value(&delegated.agent)?);
        headers.insert(
            axum::http::header::COOKIE,
            header_value(&format!("{}={}", names.token_cookie, ctx.token))?,
        );
        headers.insert(
            axum::http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );

        Ok(Outbound {
            method: parts.method.clone(),
            url,
            headers,
            body: Some(Bytes::from(body)),
        })
    }

    fn direct_call(
        &self,
        ctx: &RequestContext,
        parts: &Parts,
        path_and_query: &str,
        body: Bytes,
    ) -> Result<Outbound, GatewayError> {
        let path = self.adapter.rewrite(RouteKind::Direct, path_and_query)?;
        let mut url = parse_url(&join_base_url(
            ctx.credential.host(&self.services.config)?,
            &path,
        ))?;

        let mut headers = outbound_headers(&parts.headers, &ctx.request_id);
        match self.adapter.direct_auth() {
            DirectAuth::Bearer => {
                headers.insert(
                    axum::http::header::AUTHORIZATION,
                    header_value(&format!("Bearer {}", ctx.token))?,
                );
            }
            DirectAuth::Header(name) => {
                headers.insert(header_name(name)?, header_value(&ctx.token)?);
            }
            DirectAuth::Query(name) => set_query_param(&mut url, name, &ctx.token),
        }

        Ok(Outbound {
            method: parts.method.clone(),
            url,
            headers,
            body: (!body.is_empty()).then_some(body),
        })
    }

    async fn forward(&self, ctx: &RequestContext, outbound: Outbound) -> Result<Response, GatewayError> {
        let idle_timeout = self.services.forwarder.timeout();
        let span = tracing::Span::current();
        tracing::debug!(url = %redacted_url(&outbound.url), "forwarding");
        let sent = self
            .services
            .forwarder
            .send(outbound.method, outbound.url, outbound.headers, outbound.body)
            .await;

        let upstream = match sent {
            Ok(upstream) => upstream,
            Err(err) => {
                if err.is_backend_failure() {
                    self.demote(ctx).await;
                }
                return Err(err);
            }
        };

        let status = upstream.status();
        span.record("status", status.as_u16());
        if !status.is_success() {
            tracing::warn!(status = status.as_u16(), "backend returned an error status");
            self.demote(ctx).await;
            return Ok(into_response(upstream, &ctx.request_id, idle_timeout, None));
        }
        tracing::info!(status = status.as_u16(), "backend responded");
        Ok(into_response(
            upstream,
            &ctx.request_id,
            idle_timeout,
            Some(self.demote_on_body_failure(ctx, span)),
        ))
    }

    async fn demote(&self, ctx: &RequestContext) {
        demote_credential(&self.services, ctx.vendor, ctx.credential.client_id()).await;
    }

    /// A 200 whose body breaks off is still a failed call for the credential.
    fn demote_on_body_failure(&self, ctx: &RequestContext, span: tracing::Span) -> BodyFailureHook {
        let services = self.services.clone();
        let vendor = ctx.vendor;
        let client_id = ctx.credential.client_id().to_string();
        Box::new(move |reason: String| {
            async move {
                tracing::warn!(error = %reason, "backend body failed mid-stream");
                demote_credential(&services, vendor, &client_id).await;
            }
            .instrument(span)
            .boxed()
        })
    }
}

async fn demote_credential(services: &ProxyServices, vendor: Vendor, client_id: &str) {
    if let Err(err) = services.sampler.demote(vendor.as_str(), client_id).await {
        tracing::warn!(client_id, error = %err, "failed to record demotion");
    }
}

fn outbound_headers(inbound: &HeaderMap, request_id: &str) -> HeaderMap {
    let mut headers = inbound.clone();
    sanitize_inbound_headers(&mut headers);
    insert_request_id(&mut headers, request_id);
    headers
}

/// Only JSON bodies are inspected; anything else is forwarded as bytes.
fn parse_json_body(headers: &HeaderMap, body: &Bytes) -> Result<Option<Value>, GatewayError> {
    let is_json = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|ct| ct.to_ascii_lowercase().starts_with("application/json"));
    if !is_json || body.is_empty() {
        return Ok(None);
    }
    serde_json::from_slice(body)
        .map(Some)
        .map_err(|err| GatewayError::invalid_request(format!("invalid json body: {err}")))
}

fn parse_url(raw: &str) -> Result<reqwest::Url, GatewayError> {
    reqwest::Url::parse(raw)
        .map_err(|err| GatewayError::configuration(format!("invalid backend url {raw}: {err}")))
}

fn set_query_param(url: &mut reqwest::Url, name: &str, value: &str) {
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != name)
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    let mut pairs = url.query_pairs_mut();
    pairs.clear();
    for (key, value) in &kept {
        pairs.append_pair(key, value);
    }
    pairs.append_pair(name, value);
}

fn redacted_url(url: &reqwest::Url) -> String {
    let mut shown = url.clone();
    shown.set_query(None);
    shown.to_string()
}

fn header_name(name: &str) -> Result<HeaderName, GatewayError> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|err| GatewayError::configuration(format!("invalid header name {name}: {err}")))
}

fn header_value(value: &str) -> Result<HeaderValue, GatewayError> {
    HeaderValue::from_str(value)
        .map_err(|err| GatewayError::invalid_request(format!("invalid header value: {err}")))
}
