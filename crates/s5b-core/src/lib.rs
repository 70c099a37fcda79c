//! Core of the balancer: upstream pool, health prober, relay engine, and the
//! state monitor operations.
//!
//! Data flow: [`relay::RelayServer`] accepts a client, asks
//! [`pool::UpstreamPool`] for a backend, and runs one [`relay`] session that
//! forwards bytes both ways until either side closes. Independently,
//! [`pool::HealthChecker`] schedules [`probe`] sessions against every backend
//! and feeds latency/health back into the pool. [`monitor`] exposes pool
//! snapshots and control operations over a small HTTP surface.

pub mod errors;
pub mod monitor;
pub mod net;
pub mod pool;
pub mod probe;
pub mod relay;
pub mod socks5;

pub use errors::RelayError;
