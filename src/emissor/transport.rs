use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, Identity, RequestBuilder, StatusCode};
use tracing::{debug, warn};

use super::TransmissionError;
use crate::pki::Credentials;

const MAX_WAIT: Duration = Duration::from_secs(30);

/// Timeout and retry policy of outbound calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSettings {
    pub timeout: Duration,
    /// Extra attempts after the first one
    pub max_retries: u32,
    /// Base of the exponential backoff
    pub backoff: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

/// Raw answer of the authority.
#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

impl HttpReply {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// HTTP client authenticated with the company certificate.
///
/// Retries with exponential backoff, honouring `Retry-After` when the server
/// sends it. GETs are retried on connect errors, timeouts and HTTP
/// 429/502/503/504. POSTs only on connect errors and 429/503, where the
/// request is known not to have been processed: replaying a DPS that was
/// accepted would burn its number.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    settings: TransportSettings,
}

impl HttpTransport {
    pub fn new(
        settings: &TransportSettings,
        credentials: Option<&Credentials>,
    ) -> Result<Self, TransmissionError> {
        let mut builder = Client::builder()
            .timeout(settings.timeout)
            .connect_timeout(settings.timeout);

        if let Some(credentials) = credentials {
            let identity = Identity::from_pem(&credentials.pem_bundle())
                .map_err(|e| TransmissionError::Identity(e.to_string()))?;
            builder = builder.identity(identity);
        }

        let client = builder
            .build()
            .map_err(|e| TransmissionError::Request(e.to_string()))?;
        Ok(Self {
            client,
            settings: settings.clone(),
        })
    }

    pub async fn get(&self, url: &str) -> Result<HttpReply, TransmissionError> {
        self.execute(Replay::Idempotent, |client| client.get(url))
            .await
    }

    pub async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<HttpReply, TransmissionError> {
        self.execute(Replay::Unprocessed, |client| client.post(url).json(body))
            .await
    }

    async fn execute<F>(
        &self,
        replay: Replay,
        build: F,
    ) -> Result<HttpReply, TransmissionError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let can_retry = attempt <= self.settings.max_retries;

            match build(&self.client).send().await {
                Ok(response) => {
                    let status = response.status();
                    if replay.status(status) && can_retry {
                        let wait = retry_after(response.headers())
                            .unwrap_or_else(|| backoff(self.settings.backoff, attempt));
                        warn!(%status, attempt, ?wait, "Authority busy, retrying");
                        tokio::time::sleep(wait).await;
                        continue;
                    }

                    let body = response.bytes().await.map_err(|e| {
                        TransmissionError::Unreachable {
                            attempts: attempt,
                            detail: e.to_string(),
                        }
                    })?;
                    debug!(%status, attempt, bytes = body.len(), "Authority answered");
                    return Ok(HttpReply {
                        status,
                        body: body.to_vec(),
                    });
                }
                Err(e) if replay.error(&e) && can_retry => {
                    let wait = backoff(self.settings.backoff, attempt);
                    warn!(error = %e, attempt, ?wait, "Authority unreachable, retrying");
                    tokio::time::sleep(wait).await;
                }
                Err(e) => {
                    return Err(TransmissionError::Unreachable {
                        attempts: attempt,
                        detail: e.to_string(),
                    });
                }
            }
        }
    }
}

/// Which failures a request may be sent again after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Replay {
    /// Safe to repeat even if the first attempt reached the authority.
    Idempotent,
    /// Only when the authority never processed the request.
    Unprocessed,
}

impl Replay {
    fn status(self, status: StatusCode) -> bool {
        match self {
            Replay::Idempotent => matches!(
                status,
                StatusCode::TOO_MANY_REQUESTS
                    | StatusCode::BAD_GATEWAY
                    | StatusCode::SERVICE_UNAVAILABLE
                    | StatusCode::GATEWAY_TIMEOUT
            ),
            Replay::Unprocessed => matches!(
                status,
                StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE
            ),
        }
    }

    fn error(self, error: &reqwest::Error) -> bool {
        match self {
            Replay::Idempotent => error.is_connect() || error.is_timeout(),
            Replay::Unprocessed => error.is_connect(),
        }
    }
}

fn backoff(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor).min(MAX_WAIT)
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let seconds: u64 = headers.get(RETRY_AFTER)?.to_str().ok()?.trim().parse().ok()?;
    Some(Duration::from_secs(seconds).min(MAX_WAIT))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use axum::{
        Router,
        http::HeaderValue,
        response::IntoResponse,
        routing::{get, post},
    };

    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let base = Duration::from_millis(500);
        assert_eq!(backoff(base, 1), Duration::from_millis(500));
        assert_eq!(backoff(base, 2), Duration::from_millis(1000));
        assert_eq!(backoff(base, 3), Duration::from_millis(2000));
        assert_eq!(backoff(base, 40), MAX_WAIT);
    }

    #[test]
    fn test_retry_after_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);
        headers.insert(RETRY_AFTER, HeaderValue::from_static("2"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(2)));
        headers.insert(RETRY_AFTER, HeaderValue::from_static("3600"));
        assert_eq!(retry_after(&headers), Some(MAX_WAIT));
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(Replay::Idempotent.status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(Replay::Idempotent.status(StatusCode::TOO_MANY_REQUESTS));
        assert!(Replay::Idempotent.status(StatusCode::GATEWAY_TIMEOUT));
        assert!(!Replay::Idempotent.status(StatusCode::BAD_REQUEST));
        assert!(!Replay::Idempotent.status(StatusCode::INTERNAL_SERVER_ERROR));

        assert!(Replay::Unprocessed.status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(Replay::Unprocessed.status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!Replay::Unprocessed.status(StatusCode::BAD_GATEWAY));
        assert!(!Replay::Unprocessed.status(StatusCode::GATEWAY_TIMEOUT));
    }

    async fn flaky_server(failures: u32) -> (String, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let app = Router::new().route(
            "/",
            get(move || {
                let counter = counter.clone();
                async move {
                    let call = counter.fetch_add(1, Ordering::SeqCst);
                    if call < failures {
                        (StatusCode::SERVICE_UNAVAILABLE, [(RETRY_AFTER, "0")], "busy")
                            .into_response()
                    } else {
                        (StatusCode::OK, "ok").into_response()
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (format!("http://{addr}/"), calls)
    }

    fn settings(max_retries: u32) -> TransportSettings {
        TransportSettings {
            timeout: Duration::from_secs(5),
            max_retries,
            backoff: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let (url, calls) = flaky_server(2).await;
        let transport = HttpTransport::new(&settings(3), None).unwrap();

        let reply = transport.get(&url).await.unwrap();
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.text(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let (url, calls) = flaky_server(10).await;
        let transport = HttpTransport::new(&settings(1), None).unwrap();

        let reply = transport.get(&url).await.unwrap();
        assert_eq!(reply.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_post_is_not_replayed_after_timeout() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let app = Router::new().route(
            "/",
            post(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    "accepted"
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let settings = TransportSettings {
            timeout: Duration::from_millis(100),
            max_retries: 3,
            backoff: Duration::from_millis(10),
        };
        let transport = HttpTransport::new(&settings, None).unwrap();
        let err = transport
            .post_json(&format!("http://{addr}/"), &serde_json::json!({ "dps": "x" }))
            .await
            .unwrap_err();

        assert!(matches!(err, TransmissionError::Unreachable { attempts: 1, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_post_retried_when_busy() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let app = Router::new().route(
            "/",
            post(move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        (StatusCode::SERVICE_UNAVAILABLE, [(RETRY_AFTER, "0")], "busy")
                            .into_response()
                    } else {
                        (StatusCode::OK, "ok").into_response()
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let transport = HttpTransport::new(&settings(3), None).unwrap();
        let reply = transport
            .post_json(&format!("http://{addr}/"), &serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unreachable_host() {
        let transport = HttpTransport::new(&settings(1), None).unwrap();
        let err = transport.get("http://127.0.0.1:1/").await.unwrap_err();
        assert!(matches!(err, TransmissionError::Unreachable { attempts: 2, .. }));
    }
}
