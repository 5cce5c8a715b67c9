//! relaytun-core: shared protocol library for the relay tunnel gateway.
//!
//! Provides the encrypted envelope format and its cryptographer, gateway key
//! material, the control command grammar, session queue naming, the
//! connection API messages, CBOR framing and the abstract relay transport.

pub mod codec;
pub mod control;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod keys;
pub mod messages;
pub mod queue;
pub mod transport;

// Re-export commonly used items at crate root.
pub use codec::{cbor_decode, cbor_encode, frame_encode, read_frame, write_frame};
pub use control::ControlCommand;
pub use crypto::{Cryptographer, DEFAULT_MAX_MESSAGE_SIZE};
pub use envelope::{EncryptedEnvelope, MessageType};
pub use error::{ErrorKind, GatewayError, GatewayResult};
pub use keys::{GatewayKeyPair, GatewayPublicKey};
pub use queue::{generate_queue_id, QueueNames, Role};
pub use transport::{
    BoxFuture, MessageSink, QueueProducer, RelayConnector, RelayEndpoint, RelayLink, Subscription,
};
