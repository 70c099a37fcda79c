//! Relay engine: per-connection sessions, the acceptor/registry server, the
//! forwarding pumps, and the process-wide relay-id counter.

pub mod copy;
pub mod id;
mod server;
mod session;

pub use server::{RelayServer, SERVER_SWEEP_PERIOD};
pub use session::{RelayConfig, RelaySession, RelaySessionSnapshot, SessionState};
