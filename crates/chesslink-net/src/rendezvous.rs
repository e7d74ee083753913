//! Rendezvous client for peer discovery
//!
//! The rendezvous server is a small HTTP+JSON service that maps a session
//! token to the host's public address and, once the joiner arrives, the
//! joiner's address back to the host:
//!
//! ```text
//! host                         server                        joiner
//!  │ POST /sessions {token,addr}  │                              │
//!  │ GET /sessions/{t}/peer ────► │ {"status":"pending"}         │
//!  │                              │ ◄── POST /sessions/{t}/join  │
//!  │                              │ ──► {address: host}          │
//!  │ GET /sessions/{t}/peer ────► │ {"status":"found",address}   │
//! ```
//!
//! Transient failures (connect errors, timeouts, 5xx) are retried with
//! exponential backoff up to `max_attempts`. Everything else fails at once.

use std::time::Duration;

use reqwest::{RequestBuilder, Response, StatusCode};
use tracing::{debug, info, warn};
use url::Url;

use chesslink_core::protocol::{
    join_path, poll_path, register_path, JoinRequest, JoinResponse, RegisterRequest,
};
use chesslink_core::{FailureReason, PeerAddress, PollResponse, RendezvousConfig, SessionToken};

/// Rendezvous errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RendezvousError {
    /// Transient failures persisted through every attempt
    Unreachable { attempts: u32, last: String },
    /// The server has no session under this token
    TokenNotFound,
    /// Registration collided with a live session
    TokenTaken,
    /// The server answered with something we do not understand
    Protocol(String),
    /// The configured base URL is not usable
    InvalidUrl(String),
}

impl RendezvousError {
    pub fn reason(&self) -> FailureReason {
        match self {
            RendezvousError::TokenNotFound => FailureReason::TokenNotFound,
            _ => FailureReason::RendezvousUnreachable,
        }
    }
}

impl std::fmt::Display for RendezvousError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RendezvousError::Unreachable { attempts, last } => {
                write!(f, "Rendezvous unreachable after {} attempts: {}", attempts, last)
            }
            RendezvousError::TokenNotFound => write!(f, "Session token not found"),
            RendezvousError::TokenTaken => write!(f, "Session token already registered"),
            RendezvousError::Protocol(e) => write!(f, "Unexpected rendezvous response: {}", e),
            RendezvousError::InvalidUrl(e) => write!(f, "Invalid rendezvous URL: {}", e),
        }
    }
}

impl std::error::Error for RendezvousError {}

/// HTTP client for the rendezvous server
#[derive(Debug, Clone)]
pub struct RendezvousClient {
    base: Url,
    http: reqwest::Client,
    max_attempts: u32,
    backoff_initial: Duration,
    backoff_max: Duration,
}

impl RendezvousClient {
    /// Create a new rendezvous client
    pub fn new(config: &RendezvousConfig) -> Result<Self, RendezvousError> {
        let mut base = Url::parse(&config.base_url)
            .map_err(|e| RendezvousError::InvalidUrl(format!("{}: {}", config.base_url, e)))?;
        if base.cannot_be_a_base() {
            return Err(RendezvousError::InvalidUrl(config.base_url.clone()));
        }
        // Relative joins replace the last segment unless the path ends in '/'
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let mut builder = reqwest::Client::builder().timeout(config.request_timeout());
        if is_loopback(&base) {
            builder = builder.no_proxy();
        }
        let http = builder
            .build()
            .map_err(|e| RendezvousError::InvalidUrl(e.to_string()))?;

        Ok(Self {
            base,
            http,
            max_attempts: config.max_attempts.max(1),
            backoff_initial: config.backoff_initial(),
            backoff_max: config.backoff_max(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Publish the host's address under `token`
    pub async fn register(
        &self,
        token: SessionToken,
        address: PeerAddress,
    ) -> Result<(), RendezvousError> {
        let url = self.endpoint(register_path())?;
        let body = RegisterRequest { token, address };

        self.send_with_retry("register", || self.http.post(url.clone()).json(&body))
            .await?;
        info!("Registered session {} at {}", token, address);
        Ok(())
    }

    /// Ask once whether a joiner has arrived
    ///
    /// The host calls this on its own schedule; a `Pending` answer is not
    /// an error.
    pub async fn poll_for_peer(&self, token: SessionToken) -> Result<PollResponse, RendezvousError> {
        let url = self.endpoint(&poll_path(token))?;

        let response = self
            .send_with_retry("poll", || self.http.get(url.clone()))
            .await?;
        let poll: PollResponse = read_json(response).await?;
        debug!("Poll for session {}: {:?}", token, poll);
        Ok(poll)
    }

    /// Announce the joiner's address and learn the host's
    pub async fn lookup(
        &self,
        token: SessionToken,
        own_address: PeerAddress,
    ) -> Result<PeerAddress, RendezvousError> {
        let url = self.endpoint(&join_path(token))?;
        let body = JoinRequest {
            address: own_address,
        };

        let response = self
            .send_with_retry("join", || self.http.post(url.clone()).json(&body))
            .await?;
        let joined: JoinResponse = read_json(response).await?;
        info!("Session {} is hosted at {}", token, joined.address);
        Ok(joined.address)
    }

    fn endpoint(&self, path: &str) -> Result<Url, RendezvousError> {
        self.base
            .join(path)
            .map_err(|e| RendezvousError::InvalidUrl(e.to_string()))
    }

    /// Send a request, retrying transient failures with exponential backoff
    async fn send_with_retry<F>(&self, op: &str, build: F) -> Result<Response, RendezvousError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut delay = self.backoff_initial;
        let mut attempt = 0;

        loop {
            attempt += 1;

            let failure = match build().send().await {
                Ok(response) => match response.status() {
                    status if status.is_success() => return Ok(response),
                    StatusCode::NOT_FOUND => return Err(RendezvousError::TokenNotFound),
                    StatusCode::CONFLICT => return Err(RendezvousError::TokenTaken),
                    status if status.is_server_error() => format!("HTTP {}", status),
                    status => {
                        return Err(RendezvousError::Protocol(format!("HTTP {}", status)));
                    }
                },
                Err(e) if e.is_builder() => return Err(RendezvousError::Protocol(e.to_string())),
                Err(e) => e.to_string(),
            };

            if attempt >= self.max_attempts {
                warn!("Rendezvous {} failed after {} attempts: {}", op, attempt, failure);
                return Err(RendezvousError::Unreachable {
                    attempts: attempt,
                    last: failure,
                });
            }

            debug!(
                "Rendezvous {} attempt {} failed ({}), retrying in {:?}",
                op, attempt, failure, delay
            );
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(self.backoff_max);
        }
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, RendezvousError> {
    response
        .json::<T>()
        .await
        .map_err(|e| RendezvousError::Protocol(e.to_string()))
}

fn is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(url::Host::Ipv4(ip)) => ip.is_loopback(),
        Some(url::Host::Ipv6(ip)) => ip.is_loopback(),
        Some(url::Host::Domain(name)) => name.eq_ignore_ascii_case("localhost"),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{spawn_black_hole_http, spawn_status_http, FakeRendezvous};
    use std::net::SocketAddr;
    use std::sync::atomic::Ordering;
    use std::time::Instant;

    fn config(base_url: String) -> RendezvousConfig {
        RendezvousConfig {
            base_url,
            request_timeout_ms: 200,
            max_attempts: 3,
            backoff_initial_ms: 20,
            backoff_max_ms: 40,
            poll_interval_ms: 50,
            max_wait_ms: 1000,
        }
    }

    fn addr(s: &str) -> PeerAddress {
        s.parse::<SocketAddr>().unwrap().into()
    }

    #[test]
    fn test_base_url_gets_trailing_slash() {
        let client = RendezvousClient::new(&config("http://127.0.0.1:9/api".into())).unwrap();
        assert_eq!(client.base_url().as_str(), "http://127.0.0.1:9/api/");
        let token = SessionToken::new(12).unwrap();
        assert_eq!(
            client.endpoint(&poll_path(token)).unwrap().as_str(),
            "http://127.0.0.1:9/api/sessions/12/peer"
        );
    }

    #[test]
    fn test_invalid_url() {
        assert!(matches!(
            RendezvousClient::new(&config("not a url".into())),
            Err(RendezvousError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_error_reasons() {
        assert_eq!(RendezvousError::TokenNotFound.reason(), FailureReason::TokenNotFound);
        assert_eq!(
            RendezvousError::Unreachable {
                attempts: 3,
                last: "refused".into()
            }
            .reason(),
            FailureReason::RendezvousUnreachable
        );
        assert_eq!(
            RendezvousError::Protocol("HTTP 400".into()).reason(),
            FailureReason::RendezvousUnreachable
        );
    }

    #[tokio::test]
    async fn test_register_poll_and_lookup() {
        let server = FakeRendezvous::spawn().await;
        let client = RendezvousClient::new(&config(server.base_url())).unwrap();
        let token = SessionToken::new(2_803_636_820).unwrap();
        let host = addr("203.0.113.5:51820");
        let joiner = addr("198.51.100.7:4000");

        client.register(token, host).await.unwrap();
        assert_eq!(client.poll_for_peer(token).await.unwrap(), PollResponse::Pending);

        assert_eq!(client.lookup(token, joiner).await.unwrap(), host);
        assert_eq!(
            client.poll_for_peer(token).await.unwrap(),
            PollResponse::Found { address: joiner }
        );
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_taken() {
        let server = FakeRendezvous::spawn().await;
        let client = RendezvousClient::new(&config(server.base_url())).unwrap();
        let token = SessionToken::new(5).unwrap();

        client.register(token, addr("203.0.113.5:1")).await.unwrap();
        assert_eq!(
            client.register(token, addr("203.0.113.5:2")).await,
            Err(RendezvousError::TokenTaken)
        );
    }

    #[tokio::test]
    async fn test_unknown_token_fails_without_retry() {
        let (server, hits) = spawn_status_http("404 Not Found", "").await;
        let client = RendezvousClient::new(&config(format!("http://{}", server))).unwrap();

        let result = client
            .lookup(SessionToken::new(1).unwrap(), addr("198.51.100.7:4000"))
            .await;
        assert_eq!(result, Err(RendezvousError::TokenNotFound));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let (server, hits) = spawn_status_http("503 Service Unavailable", "").await;
        let client = RendezvousClient::new(&config(format!("http://{}", server))).unwrap();

        let result = client.poll_for_peer(SessionToken::new(1).unwrap()).await;
        assert!(matches!(
            result,
            Err(RendezvousError::Unreachable { attempts: 3, .. })
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let (server, hits) = spawn_status_http("400 Bad Request", "").await;
        let client = RendezvousClient::new(&config(format!("http://{}", server))).unwrap();

        let result = client.poll_for_peer(SessionToken::new(1).unwrap()).await;
        assert!(matches!(result, Err(RendezvousError::Protocol(_))));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_malformed_body_is_protocol_error() {
        let (server, _) = spawn_status_http("200 OK", r#"{"status":"gone"}"#).await;
        let client = RendezvousClient::new(&config(format!("http://{}", server))).unwrap();

        let result = client.poll_for_peer(SessionToken::new(1).unwrap()).await;
        assert!(matches!(result, Err(RendezvousError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_silent_server_is_unreachable_within_budget() {
        let (server, _guard) = spawn_black_hole_http().await;
        let client = RendezvousClient::new(&config(format!("http://{}", server))).unwrap();

        let started = Instant::now();
        let result = client
            .register(SessionToken::new(1).unwrap(), addr("203.0.113.5:1"))
            .await;
        assert!(matches!(
            result,
            Err(RendezvousError::Unreachable { attempts: 3, .. })
        ));
        // 3 × 200ms timeouts plus 20ms + 40ms of backoff
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_silent_server_fails_lookup_within_budget() {
        let (server, _guard) = spawn_black_hole_http().await;
        let client = RendezvousClient::new(&config(format!("http://{}", server))).unwrap();

        let started = Instant::now();
        let result = client
            .lookup(SessionToken::new(1).unwrap(), addr("198.51.100.7:4000"))
            .await;
        assert!(matches!(
            result,
            Err(RendezvousError::Unreachable { attempts: 3, .. })
        ));
        assert_eq!(result.unwrap_err().reason(), FailureReason::RendezvousUnreachable);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_refused_connection_is_unreachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed = listener.local_addr().unwrap();
        drop(listener);

        let client = RendezvousClient::new(&config(format!("http://{}", closed))).unwrap();
        let result = client.poll_for_peer(SessionToken::new(1).unwrap()).await;
        assert_eq!(result.unwrap_err().reason(), FailureReason::RendezvousUnreachable);
    }
}
