//! Gateway module: session setup and the resources it hands out.
//!
//! - **[`service`]**: [`GatewayService`] validates connection requests,
//!   resolves the relay connection, attaches to the session queues and
//!   spawns the matching tunnel handler.
//! - **[`validation`]**: field-by-field request checks.
//! - **[`ports`]**: the consumer-side port pool.
//! - **[`tls`]**: TLS for the local legs.

pub mod ports;
pub mod service;
pub mod tls;
pub mod validation;

pub use ports::{PortGuard, PortPool};
pub use service::{GatewayService, GatewaySettings};
pub use tls::LocalTls;
