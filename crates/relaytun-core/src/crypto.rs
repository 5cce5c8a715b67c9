//! The cryptographer: seals tunnel payloads for a peer gateway and opens
//! payloads a peer sealed for us.
//!
//! Each envelope uses a fresh X25519 ephemeral key. The shared secret with
//! the recipient's agreement key is run through HKDF-SHA256 (salted with the
//! ephemeral and recipient keys) to obtain a ChaCha20-Poly1305 key. The header
//! and both public keys are bound in as associated data, and the whole
//! envelope is signed with the sender's Ed25519 key.
//!
//! Every failure while opening an envelope is an
//! [`GatewayError::Authorization`]: nothing undecryptable is ever handed back
//! as data.

use crate::envelope::{EncryptedEnvelope, MessageType, ENVELOPE_VERSION};
use crate::error::{GatewayError, GatewayResult};
use crate::keys::{GatewayKeyPair, GatewayPublicKey, PUBLIC_KEY_LEN};
use ed25519_dalek::Signature;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305, NONCE_LEN};
use ring::hkdf;
use ring::rand::{SecureRandom, SystemRandom};

/// Default cap on the plaintext carried by one envelope (64 KiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

const HKDF_INFO: &[u8] = b"relaytun envelope v1";

/// Envelope overhead allowance on top of the payload when accepting raw bytes.
const ENVELOPE_OVERHEAD: usize = 512;

pub struct Cryptographer {
    keys: GatewayKeyPair,
    max_message_size: usize,
    rng: SystemRandom,
}

impl Cryptographer {
    pub fn new(keys: GatewayKeyPair) -> Self {
        Self::with_max_message_size(keys, DEFAULT_MAX_MESSAGE_SIZE)
    }

    pub fn with_max_message_size(keys: GatewayKeyPair, max_message_size: usize) -> Self {
        Self {
            keys,
            max_message_size,
            rng: SystemRandom::new(),
        }
    }

    pub fn public_key(&self) -> GatewayPublicKey {
        self.keys.public_key()
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Encrypt `payload` for `recipient` and sign the result.
    pub fn encode(
        &self,
        message_type: MessageType,
        payload: &[u8],
        recipient: &GatewayPublicKey,
    ) -> GatewayResult<EncryptedEnvelope> {
        if payload.len() > self.max_message_size {
            return Err(GatewayError::Codec(format!(
                "payload of {} bytes exceeds maximum message size {}",
                payload.len(),
                self.max_message_size
            )));
        }

        let ephemeral = x25519_dalek::EphemeralSecret::random_from_rng(rand::rngs::OsRng);
        let ephemeral_public = x25519_dalek::PublicKey::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(&recipient.agreement_key());
        if !shared.was_contributory() {
            return Err(GatewayError::Authorization(
                "recipient key yields a non-contributory secret".into(),
            ));
        }

        let mut nonce = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce)
            .map_err(|_| GatewayError::Other("system RNG failure".into()))?;

        let mut envelope = EncryptedEnvelope {
            version: ENVELOPE_VERSION,
            message_type,
            sender: self.keys.public_key().as_bytes().to_vec(),
            ephemeral: ephemeral_public.as_bytes().to_vec(),
            nonce: nonce.to_vec(),
            ciphertext: Vec::new(),
            signature: Vec::new(),
        };

        let key = derive_key(shared.as_bytes(), ephemeral_public.as_bytes(), recipient.as_bytes())?;
        let aad = envelope.associated_data(recipient.as_bytes());
        let mut in_out = payload.to_vec();
        key.seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce),
            Aad::from(aad.as_slice()),
            &mut in_out,
        )
        .map_err(|_| GatewayError::Other("envelope encryption failed".into()))?;
        envelope.ciphertext = in_out;

        let signature = self.keys.sign(&envelope.signed_bytes(recipient.as_bytes()));
        envelope.signature = signature.to_bytes().to_vec();
        Ok(envelope)
    }

    /// Verify and decrypt an envelope `sender` addressed to this gateway.
    ///
    /// Fails with [`GatewayError::Authorization`] when the envelope is not
    /// from `sender`, was not sealed for our key, has been tampered with, or
    /// carries a different message type than `expected`.
    pub fn decode(
        &self,
        envelope: &EncryptedEnvelope,
        expected: MessageType,
        sender: &GatewayPublicKey,
    ) -> GatewayResult<Vec<u8>> {
        if envelope.version != ENVELOPE_VERSION {
            return Err(GatewayError::Authorization(format!(
                "unsupported envelope version {}",
                envelope.version
            )));
        }
        if envelope.sender.as_slice() != sender.as_bytes() {
            return Err(GatewayError::Authorization(
                "envelope was not sent by the expected peer".into(),
            ));
        }

        let recipient = self.keys.public_key();
        let signature = Signature::from_slice(&envelope.signature)
            .map_err(|_| GatewayError::Authorization("malformed envelope signature".into()))?;
        if !sender.verify(&envelope.signed_bytes(recipient.as_bytes()), &signature) {
            return Err(GatewayError::Authorization(
                "envelope signature does not verify for this recipient".into(),
            ));
        }

        if envelope.message_type != expected {
            return Err(GatewayError::Authorization(format!(
                "expected {expected} envelope, got {}",
                envelope.message_type
            )));
        }

        let ephemeral_bytes: [u8; PUBLIC_KEY_LEN] = envelope
            .ephemeral
            .as_slice()
            .try_into()
            .map_err(|_| GatewayError::Authorization("malformed ephemeral key".into()))?;
        let ephemeral = x25519_dalek::PublicKey::from(ephemeral_bytes);
        let shared = self.keys.agreement_secret().diffie_hellman(&ephemeral);
        if !shared.was_contributory() {
            return Err(GatewayError::Authorization(
                "ephemeral key yields a non-contributory secret".into(),
            ));
        }

        let nonce = Nonce::try_assume_unique_for_key(&envelope.nonce)
            .map_err(|_| GatewayError::Authorization("malformed nonce".into()))?;
        let key = derive_key(shared.as_bytes(), &ephemeral_bytes, recipient.as_bytes())?;
        let aad = envelope.associated_data(recipient.as_bytes());
        let mut in_out = envelope.ciphertext.clone();
        let plaintext_len = key
            .open_in_place(nonce, Aad::from(aad.as_slice()), &mut in_out)
            .map_err(|_| GatewayError::Authorization("envelope decryption failed".into()))?
            .len();
        in_out.truncate(plaintext_len);
        Ok(in_out)
    }

    /// [`encode`](Self::encode) and serialize for the wire.
    pub fn seal(
        &self,
        message_type: MessageType,
        payload: &[u8],
        recipient: &GatewayPublicKey,
    ) -> GatewayResult<Vec<u8>> {
        self.encode(message_type, payload, recipient)?.to_bytes()
    }

    /// Parse wire bytes and [`decode`](Self::decode) them.
    pub fn open(
        &self,
        raw: &[u8],
        expected: MessageType,
        sender: &GatewayPublicKey,
    ) -> GatewayResult<Vec<u8>> {
        if raw.len() > self.max_message_size + ENVELOPE_OVERHEAD {
            return Err(GatewayError::Authorization(format!(
                "envelope of {} bytes exceeds maximum message size",
                raw.len()
            )));
        }
        let envelope = EncryptedEnvelope::from_bytes(raw)
            .map_err(|e| GatewayError::Authorization(format!("unreadable envelope: {e}")))?;
        self.decode(&envelope, expected, sender)
    }
}

fn derive_key(shared: &[u8], ephemeral: &[u8], recipient: &[u8]) -> GatewayResult<LessSafeKey> {
    let mut salt_bytes = Vec::with_capacity(ephemeral.len() + recipient.len());
    salt_bytes.extend_from_slice(ephemeral);
    salt_bytes.extend_from_slice(recipient);

    let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, &salt_bytes);
    let prk = salt.extract(shared);
    let info = [HKDF_INFO];
    let okm = prk
        .expand(&info, &CHACHA20_POLY1305)
        .map_err(|_| GatewayError::Other("envelope key derivation failed".into()))?;
    Ok(LessSafeKey::new(UnboundKey::from(okm)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Cryptographer, Cryptographer) {
        (
            Cryptographer::new(GatewayKeyPair::generate()),
            Cryptographer::new(GatewayKeyPair::generate()),
        )
    }

    #[test]
    fn round_trip_across_payload_sizes() {
        let (alice, bob) = pair();
        for size in [1, 2, 1500, 8192, DEFAULT_MAX_MESSAGE_SIZE] {
            let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let wire = alice
                .seal(MessageType::Raw, &payload, &bob.public_key())
                .unwrap();
            let opened = bob
                .open(&wire, MessageType::Raw, &alice.public_key())
                .unwrap();
            assert_eq!(opened, payload, "size {size}");
        }
    }

    #[test]
    fn oversized_payload_is_refused() {
        let (alice, bob) = pair();
        let payload = vec![0u8; DEFAULT_MAX_MESSAGE_SIZE + 1];
        assert!(alice
            .encode(MessageType::Raw, &payload, &bob.public_key())
            .is_err());
    }

    #[test]
    fn wrong_recipient_fails_closed() {
        let (alice, bob) = pair();
        let eve = Cryptographer::new(GatewayKeyPair::generate());
        let envelope = alice
            .encode(MessageType::Raw, b"secret", &bob.public_key())
            .unwrap();

        let err = eve
            .decode(&envelope, MessageType::Raw, &alice.public_key())
            .unwrap_err();
        assert!(matches!(err, GatewayError::Authorization(_)));
    }

    #[test]
    fn unexpected_sender_fails_closed() {
        let (alice, bob) = pair();
        let mallory = GatewayKeyPair::generate().public_key();
        let envelope = alice
            .encode(MessageType::Raw, b"hi", &bob.public_key())
            .unwrap();
        let err = bob
            .decode(&envelope, MessageType::Raw, &mallory)
            .unwrap_err();
        assert!(matches!(err, GatewayError::Authorization(_)));
    }

    #[test]
    fn control_envelope_is_not_raw() {
        let (alice, bob) = pair();
        let envelope = alice
            .encode(MessageType::Control, b"CLOSE x", &bob.public_key())
            .unwrap();
        let err = bob
            .decode(&envelope, MessageType::Raw, &alice.public_key())
            .unwrap_err();
        assert!(matches!(err, GatewayError::Authorization(_)));

        let raw = alice
            .encode(MessageType::Raw, b"data", &bob.public_key())
            .unwrap();
        let err = bob
            .decode(&raw, MessageType::Control, &alice.public_key())
            .unwrap_err();
        assert!(matches!(err, GatewayError::Authorization(_)));
    }

    #[test]
    fn retagged_envelope_breaks_signature() {
        let (alice, bob) = pair();
        let mut envelope = alice
            .encode(MessageType::Control, b"CLOSE x", &bob.public_key())
            .unwrap();
        envelope.message_type = MessageType::Raw;
        assert!(bob
            .decode(&envelope, MessageType::Raw, &alice.public_key())
            .is_err());
    }

    #[test]
    fn tampered_ciphertext_fails_closed() {
        let (alice, bob) = pair();
        let mut envelope = alice
            .encode(MessageType::Raw, b"payload", &bob.public_key())
            .unwrap();
        envelope.ciphertext[0] ^= 0xff;
        let err = bob
            .decode(&envelope, MessageType::Raw, &alice.public_key())
            .unwrap_err();
        assert!(matches!(err, GatewayError::Authorization(_)));
    }

    #[test]
    fn garbage_wire_bytes_fail_closed() {
        let (alice, bob) = pair();
        let err = bob
            .open(b"plain text", MessageType::Raw, &alice.public_key())
            .unwrap_err();
        assert!(matches!(err, GatewayError::Authorization(_)));
    }
}
