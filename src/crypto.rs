//! src/crypto.rs
//!
//! The node's long-term cryptographic identity. This module is responsible
//! for:
//!   - Generating and persisting the keypairs (Ed25519 for signing, X25519
//!     for sealing) together with the operator-supplied profile fields.
//!   - Signing outgoing envelopes and verifying incoming ones.
//!   - Authenticated public-key sealing for directed payloads.
//!
//! The key file is JSON beneath the application root and is readable only by
//! the owning user. It is written once at first boot and never rotated.

use crate::domain::{now_ms, NodeIdentity};
use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD as B64, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fs;
use std::io;
use std::path::Path;
use x25519_dalek::{PublicKey as EncPublicKey, StaticSecret};

const NONCE_LEN: usize = 12;
const SEAL_CONTEXT: &[u8] = b"tacnet-seal-v1";

/// Operator-supplied fields baked into the identity at first boot.
#[derive(Clone, Debug)]
pub struct NodeProfile {
    pub callsign: String,
    pub unit: String,
    pub rank: String,
    pub role: String,
    pub clearance_level: u8,
}

/// The node's secret keys plus its public `NodeIdentity`.
pub struct Identity {
    signing_key: SigningKey,
    enc_secret: StaticSecret,
    pub node: NodeIdentity,
}

/// On-disk form. Secret halves only; public keys are re-derived on load.
#[derive(Serialize, Deserialize)]
struct KeyFile {
    node_id: String,
    callsign: String,
    unit: String,
    rank: String,
    role: String,
    clearance_level: u8,
    created: u64,
    signing_key: String,
    enc_secret: String,
}

impl Identity {
    /// Generates a fresh identity: random 128-bit id, fresh X25519 and
    /// Ed25519 keypairs.
    fn generate(profile: &NodeProfile) -> Self {
        let mut secret_key_bytes = [0u8; 32];
        OsRng.fill_bytes(&mut secret_key_bytes);
        let signing_key = SigningKey::from_bytes(&secret_key_bytes);
        let enc_secret = StaticSecret::random_from_rng(OsRng);

        let node = NodeIdentity {
            node_id: uuid::Uuid::new_v4().to_string(),
            callsign: profile.callsign.clone(),
            unit: profile.unit.clone(),
            rank: profile.rank.clone(),
            role: profile.role.clone(),
            clearance_level: profile.clearance_level,
            public_key: B64.encode(EncPublicKey::from(&enc_secret).as_bytes()),
            verify_key: B64.encode(signing_key.verifying_key().as_bytes()),
            created: now_ms(),
        };

        Self {
            signing_key,
            enc_secret,
            node,
        }
    }

    /// Loads the identity from `path`, or generates and persists a fresh one
    /// when the file is absent or unparseable. A failure to persist is fatal.
    pub fn load_or_generate<P: AsRef<Path>>(path: P, profile: &NodeProfile) -> Result<Self> {
        match fs::read(path.as_ref()) {
            Ok(bytes) => match serde_json::from_slice::<KeyFile>(&bytes) {
                Ok(file) => Self::from_key_file(file),
                Err(e) => {
                    tracing::warn!(error = %e, "Key file unparseable. Generating a fresh identity.");
                    let identity = Self::generate(profile);
                    identity.persist(path.as_ref())?;
                    Ok(identity)
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let identity = Self::generate(profile);
                identity.persist(path.as_ref())?;
                tracing::info!(node_id = %identity.node.short_id(), "Generated new node identity");
                Ok(identity)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn from_key_file(file: KeyFile) -> Result<Self> {
        let signing_key = SigningKey::from_bytes(&decode_key32(&file.signing_key)?);
        let enc_secret = StaticSecret::from(decode_key32(&file.enc_secret)?);

        let node = NodeIdentity {
            node_id: file.node_id,
            callsign: file.callsign,
            unit: file.unit,
            rank: file.rank,
            role: file.role,
            clearance_level: file.clearance_level,
            public_key: B64.encode(EncPublicKey::from(&enc_secret).as_bytes()),
            verify_key: B64.encode(signing_key.verifying_key().as_bytes()),
            created: file.created,
        };

        Ok(Self {
            signing_key,
            enc_secret,
            node,
        })
    }

    fn persist(&self, path: &Path) -> Result<()> {
        let file = KeyFile {
            node_id: self.node.node_id.clone(),
            callsign: self.node.callsign.clone(),
            unit: self.node.unit.clone(),
            rank: self.node.rank.clone(),
            role: self.node.role.clone(),
            clearance_level: self.node.clearance_level,
            created: self.node.created,
            signing_key: B64.encode(self.signing_key.to_bytes()),
            enc_secret: B64.encode(self.enc_secret.to_bytes()),
        };
        let bytes = serde_json::to_vec_pretty(&file)
            .map_err(|e| Error::Crypto(format!("key file encode: {e}")))?;
        fs::write(path, bytes)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }

    /// Signs `bytes` with the node's Ed25519 key.
    pub fn sign(&self, bytes: &[u8]) -> Signature {
        self.signing_key.sign(bytes)
    }

    /// Seals `plaintext` for the holder of `recipient_pub`: X25519
    /// Diffie-Hellman, HKDF-SHA256 key derivation, ChaCha20-Poly1305 with a
    /// fresh nonce prepended to the ciphertext.
    pub fn seal(&self, plaintext: &[u8], recipient_pub: &str) -> Result<Vec<u8>> {
        let cipher = self.box_cipher(recipient_pub)?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| Error::Crypto("seal failed".into()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Opens a payload sealed by the holder of `sender_pub`.
    pub fn open(&self, sealed: &[u8], sender_pub: &str) -> Result<Vec<u8>> {
        if sealed.len() <= NONCE_LEN {
            return Err(Error::Crypto("sealed payload too short".into()));
        }
        let cipher = self.box_cipher(sender_pub)?;
        let nonce = Nonce::from_slice(&sealed[..NONCE_LEN]);
        cipher
            .decrypt(nonce, &sealed[NONCE_LEN..])
            .map_err(|_| Error::Crypto("open failed".into()))
    }

    /// Derives the pairwise cipher shared with `peer_pub`. Both directions
    /// of a pair derive the same key.
    fn box_cipher(&self, peer_pub: &str) -> Result<ChaCha20Poly1305> {
        let peer = EncPublicKey::from(decode_key32(peer_pub)?);
        let shared = self.enc_secret.diffie_hellman(&peer);

        let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
        let mut key_bytes = [0u8; 32];
        hk.expand(SEAL_CONTEXT, &mut key_bytes)
            .map_err(|_| Error::Crypto("key derivation failed".into()))?;

        Ok(ChaCha20Poly1305::new(Key::from_slice(&key_bytes)))
    }
}

/// Verifies an Ed25519 signature over `bytes`. Returns `false` on any
/// malformed input; never panics.
pub fn verify(bytes: &[u8], signature_b64: &str, verify_key_b64: &str) -> bool {
    let Ok(sig_bytes) = B64.decode(signature_b64) else {
        return false;
    };
    let Ok(sig_array) = <[u8; 64]>::try_from(sig_bytes.as_slice()) else {
        return false;
    };
    let signature = Signature::from_bytes(&sig_array);

    let Ok(key_bytes) = decode_key32(verify_key_b64) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };

    key.verify(bytes, &signature).is_ok()
}

fn decode_key32(b64: &str) -> Result<[u8; 32]> {
    let bytes = B64
        .decode(b64)
        .map_err(|_| Error::Crypto("invalid base64 key".into()))?;
    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| Error::Crypto("invalid key length".into()))
}

// --- Unit Tests ---
