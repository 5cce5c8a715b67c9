//! Tunnel sessions: the two handler variants, the registry they live in
//! and the task that reclaims idle ones.

pub mod consumer;
pub mod handler;
pub mod provider;
pub mod registry;
pub mod removal;

#[cfg(test)]
pub(crate) mod testing;

pub use consumer::{ConsumerSetup, ConsumerSideSocketThread};
pub use handler::{SessionExit, Teardown, TunnelHandler, TunnelState};
pub use provider::{ProviderSetup, ProviderSideSocketThreadHandler};
pub use registry::{SessionKey, SessionRegistry};
pub use removal::ConnectionRemovalTask;
