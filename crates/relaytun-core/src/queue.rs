//! Session queue naming.
//!
//! A tunnel session is carried by four queues, all derived from the
//! provider gateway's common name and the session's queue id:
//!
//! ```text
//! REQ-<peer>-<id>          consumer side → provider side, data
//! REQ-<peer>-<id>-CTRL     consumer side → provider side, control
//! RESP-<peer>-<id>         provider side → consumer side, data
//! RESP-<peer>-<id>-CTRL    provider side → consumer side, control
//! ```

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Length of a generated queue id.
pub const QUEUE_ID_LENGTH: usize = 48;

pub const REQUEST_PREFIX: &str = "REQ-";
pub const RESPONSE_PREFIX: &str = "RESP-";
pub const CONTROL_SUFFIX: &str = "-CTRL";

/// Which end of the tunnel a gateway terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Consumer,
    Provider,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Consumer => f.write_str("consumer"),
            Role::Provider => f.write_str("provider"),
        }
    }
}

/// Generate a random alphanumeric queue id from the OS RNG.
pub fn generate_queue_id() -> String {
    rand::rngs::OsRng
        .sample_iter(&Alphanumeric)
        .take(QUEUE_ID_LENGTH)
        .map(char::from)
        .collect()
}

/// Whether `queue_id` has the shape [`generate_queue_id`] produces.
pub fn is_valid_queue_id(queue_id: &str) -> bool {
    queue_id.len() == QUEUE_ID_LENGTH && queue_id.chars().all(|c| c.is_ascii_alphanumeric())
}

/// The four queue names of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueNames {
    pub request: String,
    pub request_control: String,
    pub response: String,
    pub response_control: String,
}

/// The two queues one side reads (or writes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuePair<'a> {
    pub data: &'a str,
    pub control: &'a str,
}

impl QueueNames {
    pub fn derive(peer_name: &str, queue_id: &str) -> Self {
        let request = format!("{REQUEST_PREFIX}{peer_name}-{queue_id}");
        let response = format!("{RESPONSE_PREFIX}{peer_name}-{queue_id}");
        Self {
            request_control: format!("{request}{CONTROL_SUFFIX}"),
            response_control: format!("{response}{CONTROL_SUFFIX}"),
            request,
            response,
        }
    }

    /// Queues the given side consumes from.
    pub fn inbound(&self, role: Role) -> QueuePair<'_> {
        match role {
            Role::Consumer => QueuePair {
                data: &self.response,
                control: &self.response_control,
            },
            Role::Provider => QueuePair {
                data: &self.request,
                control: &self.request_control,
            },
        }
    }

    /// Queues the given side publishes to.
    pub fn outbound(&self, role: Role) -> QueuePair<'_> {
        match role {
            Role::Consumer => self.inbound(Role::Provider),
            Role::Provider => self.inbound(Role::Consumer),
        }
    }
}
