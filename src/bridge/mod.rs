//! Server-side session bridge
//!
//! - `SessionRegistry` maps a session id to exactly one live upstream stream
//! - `SessionBridge` relays client chunks upstream and backend output back to
//!   the client transport, with idempotent close and drain-for-answer

mod registry;
mod session;

pub use registry::{CloseMode, PendingWrite, SessionInfo, SessionRegistry, SessionState, SessionTicket, WriteOutcome};
pub use session::{OpenedSession, SessionBridge};
