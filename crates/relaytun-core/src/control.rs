//! Control command grammar carried inside CONTROL envelopes.
//!
//! ```text
//! "CLOSE "  <queue id>    tear the session down immediately
//! "SWITCH " <queue id>    flip the receiver from echo to producer mode
//! ```
//!
//! A command is only accepted on the control queue whose name ends in
//! `-<queue id>-CTRL`; anything else is treated as a spoofing attempt.

use crate::error::{GatewayError, GatewayResult};
use crate::queue::CONTROL_SUFFIX;

const CLOSE_KEYWORD: &str = "CLOSE";
const SWITCH_KEYWORD: &str = "SWITCH";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Close { queue_id: String },
    Switch { queue_id: String },
}

impl ControlCommand {
    pub fn close(queue_id: impl Into<String>) -> Self {
        ControlCommand::Close {
            queue_id: queue_id.into(),
        }
    }

    pub fn switch(queue_id: impl Into<String>) -> Self {
        ControlCommand::Switch {
            queue_id: queue_id.into(),
        }
    }

    pub fn queue_id(&self) -> &str {
        match self {
            ControlCommand::Close { queue_id } | ControlCommand::Switch { queue_id } => queue_id,
        }
    }

    pub fn to_wire(&self) -> String {
        match self {
            ControlCommand::Close { queue_id } => format!("{CLOSE_KEYWORD} {queue_id}"),
            ControlCommand::Switch { queue_id } => format!("{SWITCH_KEYWORD} {queue_id}"),
        }
    }

    /// Parse the plaintext of a CONTROL envelope.
    pub fn parse(payload: &[u8]) -> GatewayResult<Self> {
        let text = std::str::from_utf8(payload)
            .map_err(|_| GatewayError::Authorization("control command is not UTF-8".into()))?;
        let (keyword, queue_id) = text.split_once(' ').ok_or_else(|| {
            GatewayError::Authorization(format!("malformed control command: {text:?}"))
        })?;
        if queue_id.is_empty() || queue_id.contains(char::is_whitespace) {
            return Err(GatewayError::Authorization(format!(
                "malformed control command: {text:?}"
            )));
        }

        match keyword {
            CLOSE_KEYWORD => Ok(Self::close(queue_id)),
            SWITCH_KEYWORD => Ok(Self::switch(queue_id)),
            other => Err(GatewayError::Authorization(format!(
                "unknown control command {other:?}"
            ))),
        }
    }

    /// Parse a command and check it belongs to `control_queue`.
    pub fn parse_for_queue(payload: &[u8], control_queue: &str) -> GatewayResult<Self> {
        let command = Self::parse(payload)?;
        let expected_suffix = format!("-{}{CONTROL_SUFFIX}", command.queue_id());
        if !control_queue.ends_with(&expected_suffix) {
            return Err(GatewayError::Authorization(format!(
                "control command for queue {} arrived on {control_queue}",
                command.queue_id()
            )));
        }
        Ok(command)
    }
}

impl std::fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_wire())
    }
}
