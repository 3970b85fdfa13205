use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use ureq::http::header::CONTENT_TYPE;
use ureq::http::{Response, Uri};
use ureq::typestate::{WithBody, WithoutBody};
use ureq::{Body, RequestBuilder};

use super::parse::{default_timeout_ms, parse_params, positive_timeout_ms, require_positive};
use super::{Params, Tool, ToolError};

pub const NETWORK: &str = "network";

/// Extra time the async side waits for the blocking request before giving up
/// on it. The client-side timeout normally fires first.
const WATCHDOG_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Patch,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RequestParams {
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Sent as JSON unless falsy (`null`, `false`, `0`, `""`).
    #[serde(default)]
    pub body: Option<Value>,
    /// Milliseconds.
    #[serde(default = "default_timeout_ms", deserialize_with = "positive_timeout_ms")]
    pub timeout: u64,
}

impl RequestParams {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: HttpMethod::Get,
            headers: BTreeMap::new(),
            body: None,
            timeout: default_timeout_ms(),
        }
    }
}

fn check_url(url: &str) -> Result<(), ToolError> {
    let uri: Uri = url
        .parse()
        .map_err(|e| ToolError::invalid(NETWORK, format!("invalid url '{url}': {e}")))?;
    match uri.scheme_str() {
        Some("http") | Some("https") if uri.host().is_some() => Ok(()),
        _ => Err(ToolError::invalid(NETWORK, format!("invalid url '{url}'"))),
    }
}

/// Performs HTTP requests.
///
/// A non-2xx status is an error carrying the status code. JSON responses come
/// back parsed, anything else as a string.
#[derive(Debug, Clone, Default)]
pub struct NetworkTool;

impl NetworkTool {
    pub fn new() -> Self {
        Self
    }

    pub fn parse(&self, params: &Params) -> Result<RequestParams, ToolError> {
        let request: RequestParams = parse_params(NETWORK, params)?;
        check_url(&request.url)?;
        require_positive(NETWORK, "timeout", request.timeout)?;
        Ok(request)
    }

    pub async fn request(&self, params: RequestParams) -> Result<Value, ToolError> {
        let timeout_ms = params.timeout;
        debug!(url = %params.url, method = ?params.method, timeout_ms, "http request");

        let call = tokio::task::spawn_blocking(move || send_blocking(&params));
        match tokio::time::timeout(Duration::from_millis(timeout_ms) + WATCHDOG_GRACE, call).await {
            Err(_) => Err(ToolError::Timeout(timeout_ms)),
            Ok(Err(join)) => Err(ToolError::Execution(format!("request task failed: {join}"))),
            Ok(Ok(result)) => result,
        }
    }
}

fn send_blocking(params: &RequestParams) -> Result<Value, ToolError> {
    let timeout_ms = params.timeout;
    let agent: ureq::Agent = ureq::Agent::config_builder()
        .timeout_global(Some(Duration::from_millis(timeout_ms)))
        .http_status_as_error(false)
        .build()
        .into();

    let body = match params.body.as_ref().filter(|b| is_truthy(b)) {
        Some(value) => Some(serde_json::to_vec(value).map_err(|e| ToolError::invalid(NETWORK, e.to_string()))?),
        None => None,
    };

    let url = params.url.as_str();
    let headers = &params.headers;
    let sent = match params.method {
        HttpMethod::Get => without_body(with_headers(agent.get(url), headers), body),
        HttpMethod::Delete => without_body(with_headers(agent.delete(url), headers), body),
        HttpMethod::Post => with_body(with_headers(agent.post(url), headers), body),
        HttpMethod::Put => with_body(with_headers(agent.put(url), headers), body),
        HttpMethod::Patch => with_body(with_headers(agent.patch(url), headers), body),
    };
    let mut response = sent.map_err(|e| classify(e, timeout_ms))?;

    let status = response.status();
    if !status.is_success() {
        return Err(ToolError::Http(status.as_u16()));
    }

    let is_json = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("application/json") || ct.contains("+json"));
    let text = response
        .body_mut()
        .read_to_string()
        .map_err(|e| classify(e, timeout_ms))?;

    if is_json && let Ok(parsed) = serde_json::from_str(&text) {
        return Ok(parsed);
    }
    Ok(Value::String(text))
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn with_headers<B>(mut request: RequestBuilder<B>, headers: &BTreeMap<String, String>) -> RequestBuilder<B> {
    for (name, value) in headers {
        request = request.header(name.as_str(), value.as_str());
    }
    request
}

fn without_body(request: RequestBuilder<WithoutBody>, body: Option<Vec<u8>>) -> Result<Response<Body>, ureq::Error> {
    match body {
        Some(bytes) => request
            .header("content-type", "application/json")
            .force_send_body()
            .send(&bytes[..]),
        None => request.call(),
    }
}

fn with_body(request: RequestBuilder<WithBody>, body: Option<Vec<u8>>) -> Result<Response<Body>, ureq::Error> {
    match body {
        Some(bytes) => request.header("content-type", "application/json").send(&bytes[..]),
        None => request.send_empty(),
    }
}

fn classify(error: ureq::Error, timeout_ms: u64) -> ToolError {
    match error {
        ureq::Error::Timeout(_) => ToolError::Timeout(timeout_ms),
        ureq::Error::Io(e) if e.kind() == std::io::ErrorKind::TimedOut => ToolError::Timeout(timeout_ms),
        ureq::Error::StatusCode(status) => ToolError::Http(status),
        other => ToolError::Network(other.to_string()),
    }
}

#[async_trait]
impl Tool for NetworkTool {
    fn name(&self) -> &str {
        NETWORK
    }

    fn description(&self) -> &str {
        "Provides network operations like HTTP requests"
    }

    fn validate(&self, params: &Params) -> bool {
        self.parse(params).is_ok()
    }

    async fn execute(&self, params: &Params) -> Result<Value, ToolError> {
        let request = self.parse(params)?;
        self.request(request).await
    }
}
