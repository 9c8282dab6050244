//! HTTP transport for federation requests
//!
//! Executes already-signed requests with fixed timeouts and classifies
//! transport-level failures. Non-2xx answers other than 301 and 404 are
//! returned as ordinary responses; the caller owns the retry policy.

use std::time::{Duration, Instant};

use http::HeaderMap;
use serde_json::{Map, Value};
use thiserror::Error;

use super::instance::InstancePath;
use crate::config::DeliveryConfig;
use crate::metrics::{FEDERATION_REQUEST_DURATION_SECONDS, FEDERATION_REQUESTS_TOTAL};

/// `Accept` header sent with every federation request.
pub const ACTIVITY_ACCEPT: &str =
    "application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

/// Content type for activity bodies.
pub const ACTIVITY_CONTENT_TYPE: &str = "application/activity+json";

/// Transport-level failure
///
/// Every variant is retried through the queue's backoff.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Target moved permanently")]
    MovedPermanently { location: Option<String> },

    #[error("Target not found")]
    NotFound,

    #[error("Request timed out")]
    Timeout,

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Request failed: {0}")]
    Request(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl TransportError {
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::MovedPermanently { .. } => "moved_permanently",
            TransportError::NotFound => "not_found",
            TransportError::Timeout => "timeout",
            TransportError::Connect(_) => "connect",
            TransportError::Request(_) => "request",
            TransportError::InvalidUrl(_) => "invalid_url",
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout
        } else if e.is_connect() {
            TransportError::Connect(e.to_string())
        } else if e.is_builder() {
            TransportError::InvalidUrl(e.to_string())
        } else {
            TransportError::Request(e.to_string())
        }
    }
}

/// A request ready to go on the wire
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: http::Method,
    pub target: InstancePath,
    /// Caller-supplied headers (Host, Date, Signature, Digest, ...)
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
    /// Overrides the client's total timeout for this request
    pub timeout: Option<Duration>,
}

/// A response that reached us, whatever its status
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub code: u16,
    /// Parsed body with `_address`, `_path` and `_code` attached
    pub body: Value,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn is_gone(&self) -> bool {
        self.code == 410
    }
}

/// Parse a response body, wrapping anything that is not a JSON object.
pub fn wrap_body(raw: &str, address: &str, path: &str, code: u16) -> Value {
    let mut object = match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        Ok(other) if !raw.trim().is_empty() => {
            let mut map = Map::new();
            map.insert("_result".to_string(), other);
            map
        }
        _ => {
            let mut map = Map::new();
            map.insert("_result".to_string(), Value::String(raw.to_string()));
            map
        }
    };

    object.insert("_address".to_string(), Value::String(address.to_string()));
    object.insert("_path".to_string(), Value::String(path.to_string()));
    object.insert("_code".to_string(), Value::from(code));
    Value::Object(object)
}

/// Outbound HTTP client
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Build the client from delivery settings.
    pub fn new(config: &DeliveryConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.timeout())
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| TransportError::Request(e.to_string()))?;

        Ok(Self { client })
    }

    /// Wrap an existing client (tests, custom TLS).
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Underlying client, shared with the key cache.
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Send a request
    ///
    /// # Errors
    /// - `MovedPermanently` for HTTP 301
    /// - `NotFound` for HTTP 404
    /// - `Timeout` / `Connect` / `Request` for network failures
    pub async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let TransportRequest {
            method,
            target,
            headers,
            body,
            timeout,
        } = request;

        let mut builder = self
            .client
            .request(method, target.uri.as_str())
            .header(http::header::ACCEPT, ACTIVITY_ACCEPT)
            .headers(headers);

        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(body) = body {
            builder = builder
                .header(http::header::CONTENT_TYPE, ACTIVITY_CONTENT_TYPE)
                .body(body);
        }

        let started = Instant::now();
        let result = builder.send().await;
        FEDERATION_REQUEST_DURATION_SECONDS
            .with_label_values(&["outbound"])
            .observe(started.elapsed().as_secs_f64());

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                let error = TransportError::from(e);
                FEDERATION_REQUESTS_TOTAL
                    .with_label_values(&["outbound", error.kind()])
                    .inc();
                tracing::debug!(address = %target.address, error = %error, "Transport failure");
                return Err(error);
            }
        };

        let code = response.status().as_u16();
        FEDERATION_REQUESTS_TOTAL
            .with_label_values(&["outbound", &code.to_string()])
            .inc();

        match code {
            301 => {
                let location = response
                    .headers()
                    .get(http::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                return Err(TransportError::MovedPermanently { location });
            }
            404 => return Err(TransportError::NotFound),
            _ => {}
        }

        let raw = response.text().await?;
        Ok(TransportResponse {
            code,
            body: wrap_body(&raw, &target.address, &target.path, code),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::Priority;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::post;

    async fn spawn_server(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn request_to(uri: &str) -> TransportRequest {
        TransportRequest {
            method: http::Method::POST,
            target: InstancePath::inbox(uri, Priority::High).unwrap(),
            headers: HeaderMap::new(),
            body: Some(b"{}".to_vec()),
            timeout: None,
        }
    }

    #[test]
    fn wrap_body_keeps_json_objects_and_attaches_metadata() {
        let body = wrap_body(r#"{"ok":true}"#, "example.org", "/inbox", 202);
        assert_eq!(body["ok"], true);
        assert_eq!(body["_address"], "example.org");
        assert_eq!(body["_path"], "/inbox");
        assert_eq!(body["_code"], 202);
    }

    #[test]
    fn wrap_body_wraps_non_json_text() {
        let body = wrap_body("accepted", "example.org", "/inbox", 200);
        assert_eq!(body["_result"], "accepted");
        assert_eq!(body["_code"], 200);
    }

    #[tokio::test]
    async fn classifies_301_and_404_as_errors() {
        let router = Router::new()
            .route(
                "/moved",
                post(|| async {
                    (
                        StatusCode::MOVED_PERMANENTLY,
                        [(http::header::LOCATION, "https://elsewhere.example/inbox")],
                    )
                }),
            )
            .route("/missing", post(|| async { StatusCode::NOT_FOUND }));
        let base = spawn_server(router).await;
        let transport = HttpTransport::new(&DeliveryConfig::default()).unwrap();

        match transport.send(request_to(&format!("{}/moved", base))).await {
            Err(TransportError::MovedPermanently { location }) => {
                assert_eq!(location.as_deref(), Some("https://elsewhere.example/inbox"))
            }
            other => panic!("expected moved permanently, got {other:?}"),
        }
        assert!(matches!(
            transport.send(request_to(&format!("{}/missing", base))).await,
            Err(TransportError::NotFound)
        ));
    }

    #[tokio::test]
    async fn other_statuses_are_returned_with_code() {
        let router = Router::new()
            .route("/gone", post(|| async { (StatusCode::GONE, "bye") }))
            .route("/broken", post(|| async { StatusCode::SERVICE_UNAVAILABLE }));
        let base = spawn_server(router).await;
        let transport = HttpTransport::new(&DeliveryConfig::default()).unwrap();

        let gone = transport
            .send(request_to(&format!("{}/gone", base)))
            .await
            .unwrap();
        assert!(gone.is_gone());
        assert_eq!(gone.body["_result"], "bye");

        let broken = transport
            .send(request_to(&format!("{}/broken", base)))
            .await
            .unwrap();
        assert_eq!(broken.code, 503);
        assert!(!broken.is_success());
    }

    #[tokio::test]
    async fn sends_activity_accept_header() {
        let router = Router::new().route(
            "/inbox",
            post(|headers: axum::http::HeaderMap| async move {
                let accept = headers
                    .get("accept")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                axum::Json(serde_json::json!({ "accept": accept }))
            }),
        );
        let base = spawn_server(router).await;
        let transport = HttpTransport::new(&DeliveryConfig::default()).unwrap();

        let response = transport
            .send(request_to(&format!("{}/inbox", base)))
            .await
            .unwrap();
        assert!(response.is_success());
        assert_eq!(response.body["accept"], ACTIVITY_ACCEPT);
    }

    #[tokio::test]
    async fn short_timeout_is_reported_as_timeout() {
        let router = Router::new().route(
            "/slow",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                StatusCode::ACCEPTED
            }),
        );
        let base = spawn_server(router).await;
        let transport = HttpTransport::new(&DeliveryConfig::default()).unwrap();

        let mut request = request_to(&format!("{}/slow", base));
        request.timeout = Some(Duration::from_millis(100));
        assert!(matches!(
            transport.send(request).await,
            Err(TransportError::Timeout)
        ));
    }
}
