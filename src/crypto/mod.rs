//! Cryptographic primitives for NetworkNeuron
//!
//! This module provides all cryptographic functionality for the overlay:
//! - Ed25519 node identity and message signing
//! - X25519 key agreement for tunnel keys
//! - HKDF-based key derivation
//! - Identity persistence

pub mod encryption;
pub mod random;

use std::fs;
use std::path::Path;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey as DhPublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::error::{CryptoError, Error, Result};
use crate::protocol::NodeId;

/// Ed25519 keypair backing a node's identity
#[derive(Debug, Clone)]
pub struct NodeKeypair {
    pub signing_key: SigningKey,
    pub verifying_key: VerifyingKey,
}

impl NodeKeypair {
    /// Generate a new keypair
    pub fn generate() -> Self {
        let mut rng = OsRng;
        let signing_key = SigningKey::generate(&mut rng);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Create from an existing secret key
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(secret);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    /// The node id is the verifying key
    pub fn node_id(&self) -> NodeId {
        self.verifying_key.to_bytes()
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Detached signature over arbitrary bytes
    pub fn sign(&self, data: &[u8]) -> [u8; 64] {
        self.signing_key.sign(data).to_bytes()
    }

    /// Verify a detached signature made with this keypair
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        verify_signature(&self.node_id(), data, signature)
    }
}

/// Verify a detached signature against a node id (Ed25519 verifying key bytes)
pub fn verify_signature(node_id: &NodeId, data: &[u8], signature: &[u8]) -> bool {
    let verifying_key = match VerifyingKey::from_bytes(node_id) {
        Ok(key) => key,
        Err(_) => return false,
    };
    let sig_bytes: [u8; 64] = match signature.try_into() {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    verifying_key
        .verify(data, &Signature::from_bytes(&sig_bytes))
        .is_ok()
}

/// Long-lived node identity: signing keypair plus the X25519 half used for
/// tunnel key agreement. Generated or loaded at startup, never rotated
/// mid-session.
#[derive(Clone)]
pub struct NodeIdentity {
    pub node_id: NodeId,
    pub keypair: NodeKeypair,
    dh_secret: StaticSecret,
    pub dh_public: [u8; 32],
}

impl NodeIdentity {
    pub fn generate() -> Self {
        let keypair = NodeKeypair::generate();
        let dh_secret = StaticSecret::random_from_rng(OsRng);
        let dh_public = DhPublicKey::from(&dh_secret).to_bytes();
        Self {
            node_id: keypair.node_id(),
            keypair,
            dh_secret,
            dh_public,
        }
    }

    /// Sign data with the identity keypair
    pub fn sign(&self, data: &[u8]) -> [u8; 64] {
        self.keypair.sign(data)
    }

    /// X25519 shared secret with a remote node's DH public key
    pub fn shared_secret(&self, remote_dh_public: &[u8; 32]) -> [u8; 32] {
        self.dh_secret
            .diffie_hellman(&DhPublicKey::from(*remote_dh_public))
            .to_bytes()
    }

    /// Load from the identity blob, or generate and persist a fresh one
    pub fn load_or_generate<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            let blob = IdentityBlob::load(&path)?;
            Ok(blob.into_identity())
        } else {
            let identity = Self::generate();
            IdentityBlob::from_identity(&identity, Vec::new()).save(&path)?;
            Ok(identity)
        }
    }
}

impl std::fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("node_id", &hex::encode(self.node_id))
            .finish_non_exhaustive()
    }
}

/// Persisted identity state: keypair material plus last-known peer addresses
#[derive(Serialize, Deserialize)]
pub struct IdentityBlob {
    pub signing_secret: [u8; 32],
    pub dh_secret: [u8; 32],
    pub known_peers: Vec<(NodeId, String)>,
}

impl IdentityBlob {
    pub fn from_identity(identity: &NodeIdentity, known_peers: Vec<(NodeId, String)>) -> Self {
        Self {
            signing_secret: identity.keypair.secret_bytes(),
            dh_secret: identity.dh_secret.to_bytes(),
            known_peers,
        }
    }

    pub fn into_identity(self) -> NodeIdentity {
        let secret = Zeroizing::new(self.signing_secret);
        let keypair = NodeKeypair::from_secret_bytes(&secret);
        let dh_secret = StaticSecret::from(self.dh_secret);
        let dh_public = DhPublicKey::from(&dh_secret).to_bytes();
        NodeIdentity {
            node_id: keypair.node_id(),
            keypair,
            dh_secret,
            dh_public,
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read(path)?;
        bincode::deserialize(&data)
            .map_err(|e| Error::Crypto(CryptoError::KeyGen(format!("identity blob: {}", e))))
    }

    /// Write through a temp file then rename, so a crash never leaves a
    /// truncated identity on disk.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let data = bincode::serialize(self)?;
        let temp = path.as_ref().with_extension("tmp");
        fs::write(&temp, data)?;
        fs::rename(temp, path)?;
        Ok(())
    }
}

/// Derive a 32-byte key from a shared secret via HKDF-SHA256
pub fn derive_key(shared_secret: &[u8], salt: &[u8], info: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(Some(salt), shared_secret);
    let mut output = [0u8; 32];
    hk.expand(info, &mut output)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    output
}
