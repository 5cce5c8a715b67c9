//! Relay side of the gateway: broker bindings, the shared connection pool
//! and per-session queue attachments.

pub mod channel;
pub mod memory;
pub mod pool;
pub mod redis_relay;

pub use channel::{RelayChannel, RelayInbound};
pub use memory::{MemoryBroker, MemoryConnector};
pub use pool::RelayPool;
pub use redis_relay::RedisConnector;
