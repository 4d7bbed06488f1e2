//! Relay networking for the SCP client
//!
//! This crate provides:
//! - A single [`RelayTransport`] contract over two transports: a multiplexed
//!   WebSocket stream ([`StreamTransport`]) and HTTP calls with deferred-result
//!   polling ([`RequestTransport`])
//! - Request/response correlation over the stream ([`CorrelationRouter`])
//! - Shared in-flight results ([`ResultCache`]) and backoff ([`RetryPolicy`])
//! - [`FetchFacade`], the entry point the rest of the client uses

pub mod cache;
pub mod facade;
pub mod framing;
pub mod http;
pub mod retry;
pub mod router;
pub mod transport;
pub mod websocket;

pub use cache::{cache_key, ResultCache};
pub use facade::{FetchFacade, NetConfig};
pub use framing::{ClientMessage, FrameError, RelayMessage};
pub use http::{ApiTransport, HttpApi, PollConfig, RequestTransport};
pub use retry::RetryPolicy;
pub use router::{Connection, ConnectionState, Connector, CorrelationRouter};
pub use transport::{RelayTransport, SubmitResponse, TransportError, TransportKind};
pub use websocket::{StreamTransport, WebSocketConnector};
