//! The encrypted envelope exchanged over relay queues.
//!
//! An envelope is a CBOR map carrying the message type, the sender's public
//! key, the sender's ephemeral X25519 key, the AEAD nonce, the ciphertext and
//! an Ed25519 signature over everything before it. See [`crate::crypto`] for
//! how the fields are produced and checked.

use crate::codec::{cbor_decode, cbor_encode};
use crate::error::GatewayResult;
use serde::{Deserialize, Serialize};

/// Current envelope format version.
pub const ENVELOPE_VERSION: u8 = 1;

/// Distinguishes tunneled bytes from control commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum MessageType {
    Raw = 0x01,
    Control = 0x02,
}

impl From<MessageType> for u8 {
    fn from(t: MessageType) -> u8 {
        t as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = String;
    fn try_from(v: u8) -> Result<Self, String> {
        match v {
            0x01 => Ok(Self::Raw),
            0x02 => Ok(Self::Control),
            other => Err(format!("unknown message type 0x{other:02x}")),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageType::Raw => f.write_str("RAW"),
            MessageType::Control => f.write_str("CONTROL"),
        }
    }
}

/// Wire unit of the tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    pub version: u8,
    pub message_type: MessageType,
    /// Sender's public key (32 bytes).
    #[serde(with = "serde_bytes")]
    pub sender: Vec<u8>,
    /// Sender's per-envelope X25519 key (32 bytes).
    #[serde(with = "serde_bytes")]
    pub ephemeral: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub nonce: Vec<u8>,
    /// ChaCha20-Poly1305 output, tag appended.
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

impl EncryptedEnvelope {
    pub fn to_bytes(&self) -> GatewayResult<Vec<u8>> {
        cbor_encode(self)
    }

    pub fn from_bytes(raw: &[u8]) -> GatewayResult<Self> {
        cbor_decode(raw)
    }

    /// Associated data bound into the AEAD: header fields plus both parties.
    pub(crate) fn associated_data(&self, recipient: &[u8]) -> Vec<u8> {
        let mut aad = Vec::with_capacity(2 + self.sender.len() + recipient.len());
        aad.push(self.version);
        aad.push(self.message_type.into());
        aad.extend_from_slice(&self.sender);
        aad.extend_from_slice(recipient);
        aad
    }

    /// Bytes covered by the sender's signature.
    pub(crate) fn signed_bytes(&self, recipient: &[u8]) -> Vec<u8> {
        let mut data = self.associated_data(recipient);
        data.extend_from_slice(&self.ephemeral);
        data.extend_from_slice(&self.nonce);
        data.extend_from_slice(&self.ciphertext);
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_tags() {
        assert_eq!(u8::from(MessageType::Raw), 0x01);
        assert_eq!(MessageType::try_from(0x02).unwrap(), MessageType::Control);
        assert!(MessageType::try_from(0x7f).is_err());
    }

    #[test]
    fn cbor_round_trip_keeps_fields() {
        let env = EncryptedEnvelope {
            version: ENVELOPE_VERSION,
            message_type: MessageType::Control,
            sender: vec![1; 32],
            ephemeral: vec![2; 32],
            nonce: vec![3; 12],
            ciphertext: vec![4; 20],
            signature: vec![5; 64],
        };
        let bytes = env.to_bytes().unwrap();
        assert_eq!(EncryptedEnvelope::from_bytes(&bytes).unwrap(), env);
    }

    #[test]
    fn garbage_is_not_an_envelope() {
        assert!(EncryptedEnvelope::from_bytes(b"CLOSE abc").is_err());
        assert!(EncryptedEnvelope::from_bytes(&[]).is_err());
    }
}
