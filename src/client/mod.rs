//! Client side of the streaming protocol
//!
//! [`ClientSessionManager`] owns at most one session and drives it over a
//! [`Transport`]: the socket endpoint, HTTP with server-sent events, or an
//! in-process bridge.

mod config;
mod http;
mod local;
mod manager;
mod transport;
mod watchdog;
mod ws;

pub use config::ClientConfig;
pub use http::{HttpTransport, SseDecoder};
pub use local::LocalTransport;
pub use manager::{ClientSessionManager, SessionStatus};
pub use transport::{OpenRequest, Transport, TransportEvent, TransportLink, TransportSession};
pub use watchdog::Watchdog;
pub use ws::WsTransport;
