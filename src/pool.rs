//! Pooled HTTP client used to relay plain requests to session backends
//!
//! Requests keep their method, path, query, headers and streaming body. The
//! target authority becomes `localhost:<port>` and `Origin` is rewritten to
//! match, so backends that check the origin of a request see themselves.

use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, HOST, ORIGIN};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::debug;

/// Host every backend listens on
pub const BACKEND_HOST: &str = "localhost";

/// `localhost:<port>`
pub fn backend_authority(port: u16) -> String {
    format!("{}:{}", BACKEND_HOST, port)
}

/// Origin value sent to the backend at `port`
pub fn backend_origin(port: u16) -> String {
    format!("http://{}", backend_authority(port))
}

/// Error type for relayed requests
#[derive(Debug)]
pub enum PoolError {
    /// The backend could not be reached or the exchange failed
    Client(hyper_util::client::legacy::Error),
    /// The rewritten request was invalid
    RequestBuild(String),
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::Client(e) => write!(f, "backend request failed: {}", e),
            PoolError::RequestBuild(s) => write!(f, "invalid backend request: {}", s),
        }
    }
}

impl std::error::Error for PoolError {}

impl From<hyper_util::client::legacy::Error> for PoolError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        PoolError::Client(err)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per backend
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Keep-alive connections to the session backends
pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self { client, config }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Relay `req` to the backend on `port` and stream back its response.
    ///
    /// Status and headers are copied as the backend sent them and the body is
    /// passed through without buffering.
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        port: u16,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let backend_req = rewrite_request(req, port)?;
        debug!(port, uri = %backend_req.uri(), "Requesting backend");

        let response = self.client.request(backend_req).await?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// Point a request at `localhost:<port>` over plain HTTP
fn rewrite_request<B>(req: Request<B>, port: u16) -> Result<Request<B>, PoolError> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri = format!("http://{}{}", backend_authority(port), path);

    let (parts, body) = req.into_parts();
    let mut builder = Request::builder().method(parts.method).uri(&uri);

    for (key, value) in parts.headers.iter() {
        if key == HOST || key == ORIGIN {
            continue;
        }
        builder = builder.header(key, value);
    }

    let host = HeaderValue::from_str(&backend_authority(port))
        .map_err(|e| PoolError::RequestBuild(e.to_string()))?;
    let origin = HeaderValue::from_str(&backend_origin(port))
        .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

    builder
        .header(HOST, host)
        .header(ORIGIN, origin)
        .body(body)
        .map_err(|e| PoolError::RequestBuild(e.to_string()))
}
