//! Sessiongate - an authenticating gateway in front of per-user backends
//!
//! At startup one backend is provisioned and launched for every configured
//! user, each on its own local port with its own session token. While running,
//! the gateway:
//! - Checks a shared secret token and a user allow-list on every request
//! - Redirects `/entry/{token}/{user}` to the user's proxied base URL
//! - Relays `/proxy/{token}/{user}/...` to that user's backend, including
//!   WebSocket upgrades
//! - Stops every backend and runs its stop script on shutdown

pub mod auth;
pub mod config;
pub mod error;
pub mod pool;
pub mod process;
pub mod proxy;
pub mod session;
pub mod websocket;
