//! WebSocket upgrade relay
//!
//! The proxy dials the backend first, replaying the client's own handshake
//! headers including its `Sec-WebSocket-Key`. The backend's accept value is
//! checked against that key by the client handshake and then handed to the
//! client unchanged, so the client validates it against its own challenge.
//! Only after the backend accepted does the client get `101`; the two sockets
//! are then joined by a pair of message pumps.

use crate::error::{json_error_response, ProxyErrorCode};
use crate::pool::{backend_authority, backend_origin};
use futures::{Sink, SinkExt, Stream, StreamExt};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::{
    HeaderValue, CONNECTION, HOST, ORIGIN, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_EXTENSIONS,
    SEC_WEBSOCKET_PROTOCOL, UPGRADE,
};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::{Message, Role};
use tokio_tungstenite::tungstenite::{self, Error as WsError};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info};

/// True when any `Connection` header value contains `Upgrade` (case-sensitive)
pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    req.headers()
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.contains("Upgrade"))
}

/// Build the handshake request for the backend on `port`.
///
/// All client headers are replayed except `Host` and `Origin`, which point
/// at the backend, and `Sec-WebSocket-Extensions`, since messages are
/// relayed whole and no extension is negotiated on either leg.
fn build_backend_request<B>(
    req: &Request<B>,
    port: u16,
) -> Result<tungstenite::handshake::client::Request, String> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri = format!("ws://{}{}", backend_authority(port), path);

    let mut builder = tungstenite::http::Request::builder()
        .method(req.method().clone())
        .uri(&uri);

    for (name, value) in req.headers() {
        if name == HOST || name == ORIGIN || name == SEC_WEBSOCKET_EXTENSIONS {
            continue;
        }
        builder = builder.header(name, value);
    }

    builder
        .header(HOST, backend_authority(port))
        .header(ORIGIN, backend_origin(port))
        .body(())
        .map_err(|e| e.to_string())
}

/// Handle a WebSocket upgrade for the session backend on `port`
pub async fn handle_upgrade(
    req: Request<Incoming>,
    port: u16,
    user: String,
    request_id: String,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let backend_req = match build_backend_request(&req, port) {
        Ok(r) => r,
        Err(e) => {
            error!(user, request_id, error = %e, "Invalid upgrade request");
            return json_error_response(ProxyErrorCode::UpgradeFailed, e);
        }
    };
    debug!(user, request_id, uri = %backend_req.uri(), "Dialing backend");

    let stream = match TcpStream::connect(backend_authority(port)).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(user, port, request_id, error = %e, "Failed to connect to backend for upgrade");
            return json_error_response(
                ProxyErrorCode::UpgradeFailed,
                format!("failed to connect to backend: {}", e),
            );
        }
    };

    let (backend_ws, backend_resp) = match tokio_tungstenite::client_async(backend_req, stream).await {
        Ok(pair) => pair,
        Err(e) => {
            error!(user, port, request_id, error = %e, "WebSocket handshake with backend failed");
            return json_error_response(
                ProxyErrorCode::UpgradeFailed,
                format!("WebSocket handshake with backend failed: {}", e),
            );
        }
    };

    let mut response = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(CONNECTION, HeaderValue::from_static("Upgrade"))
        .header(UPGRADE, HeaderValue::from_static("websocket"));
    for name in [SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_PROTOCOL] {
        if let Some(value) = backend_resp.headers().get(&name) {
            response = response.header(name, value.clone());
        }
    }
    let response = response
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder");

    info!(user, port, request_id, "WebSocket upgrade accepted by backend");

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let client_ws =
                    WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
                relay(client_ws, backend_ws, user, request_id).await;
            }
            Err(e) => {
                error!(user, request_id, error = %e, "Failed to upgrade client connection");
            }
        }
    });

    response
}

/// Join two WebSocket connections until either direction stops.
///
/// Each direction runs as its own task. When one ends, the other is aborted
/// and both connections are dropped.
pub async fn relay<C, B>(
    client: WebSocketStream<C>,
    backend: WebSocketStream<B>,
    user: String,
    request_id: String,
) where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (client_tx, client_rx) = client.split();
    let (backend_tx, backend_rx) = backend.split();

    let mut upstream = tokio::spawn(pump(client_rx, backend_tx));
    let mut downstream = tokio::spawn(pump(backend_rx, client_tx));

    let (direction, result) = tokio::select! {
        r = &mut upstream => {
            downstream.abort();
            ("client->backend", r)
        }
        r = &mut downstream => {
            upstream.abort();
            ("backend->client", r)
        }
    };

    match result {
        Ok(Ok(forwarded)) => {
            debug!(user, request_id, direction, forwarded, "WebSocket relay closed");
        }
        Ok(Err(e)) => {
            debug!(user, request_id, direction, error = %e, "WebSocket relay ended with error");
        }
        Err(e) => {
            debug!(user, request_id, direction, error = %e, "WebSocket relay task failed");
        }
    }
}

/// Copy messages from `source` to `sink` one at a time.
///
/// Text and binary messages keep their type. Ping and pong are answered by
/// each socket itself. A close frame is passed on and ends the pump.
async fn pump<S, K>(mut source: S, mut sink: K) -> Result<u64, WsError>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
    K: Sink<Message, Error = WsError> + Unpin,
{
    let mut forwarded = 0u64;

    let result = loop {
        match source.next().await {
            Some(Ok(msg @ (Message::Text(_) | Message::Binary(_)))) => {
                if let Err(e) = sink.send(msg).await {
                    break Err(e);
                }
                forwarded += 1;
            }
            Some(Ok(Message::Close(frame))) => {
                let _ = sink.send(Message::Close(frame)).await;
                break Ok(forwarded);
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
            Some(Err(e)) => break Err(e),
            None => break Ok(forwarded),
        }
    };

    let _ = sink.close().await;
    result
}
