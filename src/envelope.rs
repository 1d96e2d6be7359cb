//! src/envelope.rs
//!
//! The wire codec. Every frame on every transport is a single
//! self-describing envelope: the sender's full identity plus one signed
//! tactical message, serialised as canonical JSON.
//!
//! Canonical form is `serde_json::to_vec` over the typed structs: struct
//! fields emit in declaration order, payload maps emit with sorted keys, and
//! no insignificant whitespace is produced. Identical input therefore yields
//! byte-identical output, which is what makes the detached-signature scheme
//! sound: the signing input is the envelope with an empty-string signature,
//! reconstructed the same way on both ends.

use crate::crypto::{self, Identity};
use crate::domain::{NodeIdentity, TacticalMessage};
use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD as B64, Engine};
use serde::{Deserialize, Serialize};

/// Wire format version. Changing envelope semantics requires bumping this.
pub const WIRE_VERSION: &str = "1.0";

/// The complete on-wire record. One frame carries one envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: String,
    pub sender_identity: NodeIdentity,
    pub message: TacticalMessage,
}

impl Envelope {
    /// Canonical byte encoding; also the signing input when
    /// `message.signature` is empty.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Builds, signs, and serialises the envelope for `message`:
/// sign(canonical(envelope with empty signature)), then re-serialise with
/// the signature placed into the message.
pub fn encode_signed(identity: &Identity, mut message: TacticalMessage) -> Result<Vec<u8>> {
    message.signature = String::new();
    let mut envelope = Envelope {
        version: WIRE_VERSION.to_string(),
        sender_identity: identity.node.clone(),
        message,
    };

    let signing_input = envelope.canonical_bytes()?;
    let signature = identity.sign(&signing_input);
    envelope.message.signature = B64.encode(signature.to_bytes());

    envelope.canonical_bytes()
}

/// Parses a frame and authenticates it against the verify key the envelope
/// itself advertises. Callers apply their own trust policy to that key
/// afterwards (see the node runtime's first-use pinning).
pub fn decode_verified(bytes: &[u8]) -> Result<Envelope> {
    let envelope: Envelope = serde_json::from_slice(bytes)?;

    if envelope.version != WIRE_VERSION {
        return Err(Error::Verification("unsupported envelope version"));
    }
    let signature = envelope.message.signature.clone();
    if signature.is_empty() {
        return Err(Error::Verification("unsigned envelope"));
    }

    let mut unsigned = envelope.clone();
    unsigned.message.signature = String::new();
    let signing_input = unsigned.canonical_bytes()?;

    if !crypto::verify(&signing_input, &signature, &envelope.sender_identity.verify_key) {
        return Err(Error::Verification("signature check failed"));
    }

    Ok(envelope)
}

// --- Unit Tests ---
