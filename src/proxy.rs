//! Public listener and request routing
//!
//! `/entry/{token}/{user}` checks access and redirects to the user's base
//! URL. `/proxy/{token}/{user}/...` checks access and relays to the user's
//! backend, plain or upgraded.

use crate::auth::AuthGuard;
use crate::error::{json_error_response, ProxyErrorCode};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::process::base_url;
use crate::session::{Session, SessionRegistry};
use crate::websocket::{handle_upgrade, is_upgrade_request};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, LOCATION};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";

const NO_SUCH_SESSION: &str = "no such session setup at startup";

/// Everything a request handler needs, shared by all connections
struct GateState {
    registry: Arc<SessionRegistry>,
    auth: AuthGuard,
    pool: ConnectionPool,
}

/// The authenticating reverse proxy in front of the session backends
pub struct ProxyServer {
    state: Arc<GateState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    /// The registry is taken frozen, so the server cannot exist before
    /// startup has finished.
    pub fn new(
        registry: Arc<SessionRegistry>,
        auth: AuthGuard,
        shutdown_rx: watch::Receiver<bool>,
        pool_config: PoolConfig,
    ) -> Self {
        let state = Arc::new(GateState {
            registry,
            auth,
            pool: ConnectionPool::new(pool_config),
        });
        Self {
            state,
            shutdown_rx,
        }
    }

    /// Accept connections on `listener` until shutdown is signalled
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(
            addr = %addr,
            sessions = self.state.registry.len(),
            "Proxy server listening (HTTP/1.1 and HTTP/2)"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, state).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<GateState>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { handle_request(req, state).await }
    });

    // HTTP/1.1 connections can still be upgraded to WebSocket
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

/// Where a request path leads
#[derive(Debug, PartialEq, Eq)]
enum Route {
    Entry { token: String, user: String },
    Proxy { token: String, user: String },
    /// Strict-slash redirect to the given location
    Redirect(String),
    NotFound,
}

fn decode_segment(segment: &str) -> Option<String> {
    if segment.is_empty() {
        return None;
    }
    urlencoding::decode(segment).ok().map(|s| s.into_owned())
}

fn route(path: &str, query: Option<&str>) -> Route {
    let Some(path) = path.strip_prefix('/') else {
        return Route::NotFound;
    };

    let parts: Vec<&str> = path.splitn(4, '/').collect();
    let (kind, raw_token, raw_user, rest) = match parts.as_slice() {
        [kind, token, user] => (*kind, *token, *user, None),
        [kind, token, user, rest] => (*kind, *token, *user, Some(*rest)),
        _ => return Route::NotFound,
    };

    let (Some(token), Some(user)) = (decode_segment(raw_token), decode_segment(raw_user)) else {
        return Route::NotFound;
    };

    match (kind, rest) {
        ("entry", None) => Route::Entry { token, user },
        ("entry", Some("")) => Route::Redirect(format!("/entry/{}/{}", raw_token, raw_user)),
        ("proxy", None) => {
            let mut location = format!("/proxy/{}/{}/", raw_token, raw_user);
            if let Some(q) = query {
                location.push('?');
                location.push_str(q);
            }
            Route::Redirect(location)
        }
        ("proxy", Some(_)) => Route::Proxy { token, user },
        _ => Route::NotFound,
    }
}

async fn handle_request(
    mut req: Request<Incoming>,
    state: Arc<GateState>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        req.headers_mut().insert(X_REQUEST_ID, value);
    }

    match route(req.uri().path(), req.uri().query()) {
        Route::Entry { token, user } => {
            debug!(user, method = %req.method(), request_id, "Entry request");
            Ok(handle_entry(&state, &token, &user, &request_id))
        }
        Route::Proxy { token, user } => {
            debug!(user, method = %req.method(), request_id, "Proxy request");
            Ok(handle_proxy(req, &state, &token, user, request_id).await)
        }
        Route::Redirect(location) => Ok(redirect(StatusCode::MOVED_PERMANENTLY, &location)),
        Route::NotFound => {
            debug!(method = %req.method(), request_id, "No route for request");
            Ok(json_error_response(ProxyErrorCode::NotFound, "Not found"))
        }
    }
}

/// Run both checks, then find the user's session
fn authorize(
    state: &GateState,
    token: &str,
    user: &str,
    request_id: &str,
) -> Result<Arc<Session>, Response<BoxBody<Bytes, hyper::Error>>> {
    if !state.auth.assert_permission(token, user) {
        warn!(user, request_id, "Rejected unauthorized request");
        return Err(json_error_response(
            ProxyErrorCode::NotAuthorized,
            "Not authorized",
        ));
    }

    state.registry.get(user).ok_or_else(|| {
        error!(user, request_id, "Authorized user has no session");
        json_error_response(ProxyErrorCode::NoSuchSession, NO_SUCH_SESSION)
    })
}

/// Send the user to their backend, handing over the session token
fn handle_entry(
    state: &GateState,
    token: &str,
    user: &str,
    request_id: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let session = match authorize(state, token, user, request_id) {
        Ok(session) => session,
        Err(response) => return response,
    };

    let location = entry_location(state.auth.token(), &session.user, &session.token);
    info!(user, port = session.port, request_id, "Redirecting to session");
    redirect(StatusCode::FOUND, &location)
}

/// The user's base URL with the session token as `token` query value.
///
/// The path is left exactly as the backend was told it is served under.
/// Only the token is escaped, since base64 `+`, `/` and `=` would not
/// survive query decoding.
fn entry_location(shared_token: &str, user: &str, session_token: &str) -> String {
    format!(
        "{}?token={}",
        base_url(shared_token, user),
        urlencoding::encode(session_token)
    )
}

async fn handle_proxy(
    req: Request<Incoming>,
    state: &GateState,
    token: &str,
    user: String,
    request_id: String,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let session = match authorize(state, token, &user, &request_id) {
        Ok(session) => session,
        Err(response) => return response,
    };
    let port = session.port;

    if is_upgrade_request(&req) {
        return handle_upgrade(req, port, user, request_id).await;
    }

    match state.pool.send_request(req, port).await {
        Ok(response) => response,
        Err(e) => {
            error!(user, port, request_id, error = %e, "Failed to forward request");
            json_error_response(ProxyErrorCode::BackendUnreachable, e.to_string())
        }
    }
}

fn redirect(status: StatusCode, location: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header(LOCATION, location)
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}
