//! Chat-completion forwarding to discovered services.
//!
//! The relay is a transparent forwarder: the client body goes upstream
//! untouched apart from the injected credential, and the upstream status and
//! body come back untouched. Failures are terminal for the one request; there
//! are no retries.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use anyhow::Context;
use axum::body::Bytes;
use axum::http::{header, HeaderValue, StatusCode};
use reqwest::Client;
use shared::protocol::CHAT_COMPLETIONS_PATH;
use crate::config::RelayConfig;
use crate::registry::ServiceRegistry;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("no AI services are currently available")]
    NoServices,

    #[error("x-ai-service header does not name a service")]
    InvalidTarget,

    #[error("service '{0}' is unavailable")]
    ServiceUnavailable(String),

    #[error("service '{0}' did not respond in time")]
    UpstreamTimeout(String),

    #[error("upstream credential is not configured; set {0}")]
    MissingCredential(String),
}

/// Upstream bearer credential. Never printed.
pub struct Credential(String);

impl Credential {
    fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential([redacted])")
    }
}

/// Where the upstream credential comes from. The value is read for each
/// outbound call and dropped when the call completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    /// Forward without an Authorization header
    None,
    /// Read from the named environment variable
    Env(String),
}

impl CredentialSource {
    fn load(&self) -> Result<Option<Credential>, RelayError> {
        match self {
            CredentialSource::None => Ok(None),
            CredentialSource::Env(var) => match std::env::var(var) {
                Ok(value) if !value.trim().is_empty() => Ok(Some(Credential(value.trim().to_string()))),
                _ => Err(RelayError::MissingCredential(var.clone())),
            },
        }
    }
}

/// Upstream reply, passed through verbatim
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub content_type: Option<HeaderValue>,
    pub body: Bytes,
}

pub struct RequestRelay {
    registry: Arc<ServiceRegistry>,
    client: Client,
    credential: CredentialSource,
}

impl RequestRelay {
    pub fn new(registry: Arc<ServiceRegistry>, config: &RelayConfig) -> anyhow::Result<Self> {
        let credential = match &config.credential_env {
            Some(var) => CredentialSource::Env(var.clone()),
            None => CredentialSource::None,
        };
        Self::with_timeout(
            registry,
            Duration::from_secs(config.upstream_timeout_secs),
            credential,
        )
    }

    pub fn with_timeout(
        registry: Arc<ServiceRegistry>,
        timeout: Duration,
        credential: CredentialSource,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            registry,
            client,
            credential,
        })
    }

    /// Name of the service to forward to: the requested one, or else the
    /// first registered service by name.
    pub fn select_target(&self, requested: Option<&str>) -> Result<String, RelayError> {
        match requested {
            Some(name) => Ok(name.to_string()),
            None => self
                .registry
                .snapshot()
                .into_keys()
                .min()
                .ok_or(RelayError::NoServices),
        }
    }

    /// Forward one chat-completion request body to `target`.
    ///
    /// The target can vanish between lookup and send; a connection failure
    /// then reports the same `ServiceUnavailable` as an absent target.
    pub async fn handle(&self, body: Bytes, target: &str) -> Result<UpstreamResponse, RelayError> {
        let endpoint = self
            .registry
            .lookup(target)
            .ok_or_else(|| RelayError::ServiceUnavailable(target.to_string()))?;

        let url = chat_completions_url(endpoint);
        let mut request = self
            .client
            .post(&url)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body);

        if let Some(credential) = self.credential.load()? {
            request = request.bearer_auth(credential.expose());
        }

        tracing::debug!(target_service = target, %url, "Forwarding chat completion");

        let response = request
            .send()
            .await
            .map_err(|e| transport_error(target, e))?;

        let status = response.status();
        let content_type = response.headers().get(header::CONTENT_TYPE).cloned();
        let body = response
            .bytes()
            .await
            .map_err(|e| transport_error(target, e))?;

        if status.is_success() {
            tracing::info!(target_service = target, status = status.as_u16(), "Relayed chat completion");
        } else {
            tracing::warn!(target_service = target, status = status.as_u16(), "Upstream returned an error");
        }

        Ok(UpstreamResponse {
            status,
            content_type,
            body,
        })
    }
}

fn chat_completions_url(endpoint: SocketAddr) -> String {
    format!("http://{}{}", endpoint, CHAT_COMPLETIONS_PATH)
}

fn transport_error(target: &str, e: reqwest::Error) -> RelayError {
    if e.is_timeout() {
        tracing::warn!(target_service = target, "Upstream timed out");
        RelayError::UpstreamTimeout(target.to_string())
    } else {
        tracing::warn!(target_service = target, "Upstream unreachable: {}", e);
        RelayError::ServiceUnavailable(target.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use axum::extract::State;
    use axum::http::HeaderMap;
    use axum::routing::post;
    use axum::Router;

    const CHAT_BODY: &str = r#"{"model":"llama3","messages":[{"role":"user","content":"hi"}]}"#;
    const REPLY_BODY: &str = r#"{"id":"chatcmpl-1","object":"chat.completion","choices":[{"index":0,"message":{"role":"assistant","content":"hello"},"finish_reason":"stop"}]}"#;

    #[derive(Clone, Default)]
    struct Upstream {
        hits: Arc<AtomicUsize>,
        last_auth: Arc<Mutex<Option<String>>>,
        last_body: Arc<Mutex<Option<Bytes>>>,
    }

    async fn ok_handler(State(upstream): State<Upstream>, headers: HeaderMap, body: Bytes) -> (StatusCode, [(header::HeaderName, &'static str); 1], &'static str) {
        upstream.hits.fetch_add(1, Ordering::SeqCst);
        *upstream.last_auth.lock().unwrap() = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        *upstream.last_body.lock().unwrap() = Some(body);
        (StatusCode::OK, [(header::CONTENT_TYPE, "application/json")], REPLY_BODY)
    }

    async fn spawn_upstream(router: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    async fn ok_upstream() -> (Upstream, SocketAddr) {
        let upstream = Upstream::default();
        let router = Router::new()
            .route(CHAT_COMPLETIONS_PATH, post(ok_handler))
            .with_state(upstream.clone());
        (upstream, spawn_upstream(router).await)
    }

    fn relay(registry: Arc<ServiceRegistry>, credential: CredentialSource) -> RequestRelay {
        RequestRelay::with_timeout(registry, Duration::from_secs(5), credential).unwrap()
    }

    #[tokio::test]
    async fn test_forwards_with_credential_and_returns_body_verbatim() {
        let (upstream, addr) = ok_upstream().await;
        let registry = Arc::new(ServiceRegistry::new());
        registry.upsert("laptop-1", addr);

        std::env::set_var("AI_RELAYD_TEST_KEY_FORWARD", "sk-test-123");
        let relay = relay(registry, CredentialSource::Env("AI_RELAYD_TEST_KEY_FORWARD".to_string()));

        let response = relay.handle(Bytes::from_static(CHAT_BODY.as_bytes()), "laptop-1").await.unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body, Bytes::from_static(REPLY_BODY.as_bytes()));
        assert_eq!(response.content_type.unwrap(), "application/json");
        assert_eq!(upstream.hits.load(Ordering::SeqCst), 1);
        assert_eq!(upstream.last_auth.lock().unwrap().as_deref(), Some("Bearer sk-test-123"));
        assert_eq!(
            upstream.last_body.lock().unwrap().as_ref().unwrap(),
            &Bytes::from_static(CHAT_BODY.as_bytes())
        );
    }

    #[tokio::test]
    async fn test_no_credential_source_sends_no_authorization() {
        let (upstream, addr) = ok_upstream().await;
        let registry = Arc::new(ServiceRegistry::new());
        registry.upsert("laptop-1", addr);

        let relay = relay(registry, CredentialSource::None);
        relay.handle(Bytes::from_static(CHAT_BODY.as_bytes()), "laptop-1").await.unwrap();

        assert_eq!(upstream.hits.load(Ordering::SeqCst), 1);
        assert!(upstream.last_auth.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_absent_service_is_unavailable_without_network_call() {
        let (upstream, addr) = ok_upstream().await;
        let registry = Arc::new(ServiceRegistry::new());
        registry.upsert("laptop-2", addr);

        let relay = relay(registry, CredentialSource::None);
        let err = relay.handle(Bytes::from_static(CHAT_BODY.as_bytes()), "laptop-1").await.unwrap_err();

        assert!(matches!(err, RelayError::ServiceUnavailable(ref name) if name == "laptop-1"));
        assert_eq!(upstream.hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_upstream_error_passes_through() {
        let router = Router::new().route(
            CHAT_COMPLETIONS_PATH,
            post(|| async {
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    [(header::CONTENT_TYPE, "application/json")],
                    r#"{"error":{"message":"rate limited"}}"#,
                )
            }),
        );
        let addr = spawn_upstream(router).await;
        let registry = Arc::new(ServiceRegistry::new());
        registry.upsert("laptop-1", addr);

        let relay = relay(registry, CredentialSource::None);
        let response = relay.handle(Bytes::from_static(CHAT_BODY.as_bytes()), "laptop-1").await.unwrap();

        assert_eq!(response.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.body, Bytes::from_static(br#"{"error":{"message":"rate limited"}}"#));
    }

    #[tokio::test]
    async fn test_slow_upstream_times_out() {
        let router = Router::new().route(
            CHAT_COMPLETIONS_PATH,
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                REPLY_BODY
            }),
        );
        let addr = spawn_upstream(router).await;
        let registry = Arc::new(ServiceRegistry::new());
        registry.upsert("laptop-1", addr);

        let relay = RequestRelay::with_timeout(registry, Duration::from_millis(200), CredentialSource::None).unwrap();
        let err = relay.handle(Bytes::from_static(CHAT_BODY.as_bytes()), "laptop-1").await.unwrap_err();

        assert!(matches!(err, RelayError::UpstreamTimeout(ref name) if name == "laptop-1"));
    }

    #[tokio::test]
    async fn test_unreachable_service_is_unavailable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let registry = Arc::new(ServiceRegistry::new());
        registry.upsert("laptop-1", addr);

        let relay = relay(registry, CredentialSource::None);
        let err = relay.handle(Bytes::from_static(CHAT_BODY.as_bytes()), "laptop-1").await.unwrap_err();

        assert!(matches!(err, RelayError::ServiceUnavailable(_)));
    }

    #[tokio::test]
    async fn test_missing_credential() {
        let (upstream, addr) = ok_upstream().await;
        let registry = Arc::new(ServiceRegistry::new());
        registry.upsert("laptop-1", addr);

        let relay = relay(registry, CredentialSource::Env("AI_RELAYD_TEST_KEY_NEVER_SET".to_string()));
        let err = relay.handle(Bytes::from_static(CHAT_BODY.as_bytes()), "laptop-1").await.unwrap_err();

        assert!(matches!(err, RelayError::MissingCredential(ref var) if var == "AI_RELAYD_TEST_KEY_NEVER_SET"));
        assert_eq!(upstream.hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_select_target() {
        let registry = Arc::new(ServiceRegistry::new());
        let relay = relay(registry.clone(), CredentialSource::None);

        assert!(matches!(relay.select_target(None), Err(RelayError::NoServices)));
        assert_eq!(relay.select_target(Some("laptop-9")).unwrap(), "laptop-9");

        registry.upsert("laptop-2", "10.0.0.2:80".parse().unwrap());
        registry.upsert("laptop-1", "10.0.0.1:80".parse().unwrap());
        assert_eq!(relay.select_target(None).unwrap(), "laptop-1");
    }

    #[test]
    fn test_chat_completions_url() {
        assert_eq!(
            chat_completions_url("192.168.1.10:8080".parse().unwrap()),
            "http://192.168.1.10:8080/v1/chat/completions"
        );
        assert_eq!(
            chat_completions_url("[fd00::1]:8080".parse().unwrap()),
            "http://[fd00::1]:8080/v1/chat/completions"
        );
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        let credential = Credential("sk-secret".to_string());
        assert!(!format!("{:?}", credential).contains("sk-secret"));
    }
}
