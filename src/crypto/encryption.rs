//! Packet encryption for NetworkNeuron
//!
//! ChaCha20-Poly1305 AEAD with the protocol tag as associated data. The
//! symmetric key for a packet is either the session-scoped tunnel key for the
//! (sender, receiver) pair, or an ephemeral per-packet key wrapped to the
//! recipient's X25519 public key. Keys never travel in plaintext.

use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use rand::rngs::OsRng;
use x25519_dalek::{EphemeralSecret, PublicKey as DhPublicKey};

use crate::crypto::{derive_key, NodeIdentity};
use crate::error::{CryptoError, Error, Result};
use crate::protocol::wire::DataPacketPayload;
use crate::protocol::{DataPacket, KeyMode, PROTOCOL_AAD};

const TUNNEL_INFO: &[u8] = b"networkneuron/tunnel";
const WRAP_INFO: &[u8] = b"networkneuron/wrap";

/// Encrypt with explicit nonce and associated data
pub fn encrypt(key: &[u8; 32], nonce: &[u8; 12], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| Error::Crypto(CryptoError::AuthFail))
}

/// Decrypt and authenticate. Any bit flip in ciphertext, tag, nonce, or
/// associated data fails with `CryptoError::AuthFail`.
pub fn decrypt(key: &[u8; 32], nonce: &[u8; 12], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| Error::Crypto(CryptoError::AuthFail))
}

/// Session-scoped tunnel key for a peer pair, derived once from the static
/// X25519 shared secret. Both ends compute the same key.
pub fn tunnel_key(local: &NodeIdentity, remote_dh_public: &[u8; 32]) -> [u8; 32] {
    let shared = local.shared_secret(remote_dh_public);
    derive_key(&shared, PROTOCOL_AAD, TUNNEL_INFO)
}

/// Seal a data packet for the next hop according to the route's key mode
pub fn seal_packet(
    packet: &DataPacket,
    key_mode: KeyMode,
    local: &NodeIdentity,
    remote_dh_public: &[u8; 32],
) -> Result<DataPacketPayload> {
    let plaintext = bincode::serialize(packet)?;
    let nonce = super::random::random_nonce();

    match key_mode {
        KeyMode::Tunnel => {
            let key = tunnel_key(local, remote_dh_public);
            let body = encrypt(&key, &nonce, &plaintext, PROTOCOL_AAD)?;
            Ok(DataPacketPayload {
                encrypted: true,
                key_mode,
                ephemeral_public_key: None,
                nonce,
                body,
            })
        }
        KeyMode::Ephemeral => {
            let ephemeral = EphemeralSecret::random_from_rng(OsRng);
            let ephemeral_public = DhPublicKey::from(&ephemeral).to_bytes();
            let shared = ephemeral
                .diffie_hellman(&DhPublicKey::from(*remote_dh_public))
                .to_bytes();
            let key = derive_key(&shared, PROTOCOL_AAD, WRAP_INFO);
            let body = encrypt(&key, &nonce, &plaintext, PROTOCOL_AAD)?;
            Ok(DataPacketPayload {
                encrypted: true,
                key_mode,
                ephemeral_public_key: Some(ephemeral_public),
                nonce,
                body,
            })
        }
    }
}

/// Wrap a packet without encryption (routes with `encrypted = false`)
pub fn seal_plain(packet: &DataPacket) -> Result<DataPacketPayload> {
    Ok(DataPacketPayload {
        encrypted: false,
        key_mode: KeyMode::Tunnel,
        ephemeral_public_key: None,
        nonce: [0u8; 12],
        body: bincode::serialize(packet)?,
    })
}

/// Open a sealed data packet received from `remote_dh_public`
pub fn open_packet(
    payload: &DataPacketPayload,
    local: &NodeIdentity,
    remote_dh_public: &[u8; 32],
) -> Result<DataPacket> {
    if !payload.encrypted {
        return Ok(bincode::deserialize(&payload.body)?);
    }

    let key = match payload.key_mode {
        KeyMode::Tunnel => tunnel_key(local, remote_dh_public),
        KeyMode::Ephemeral => {
            let ephemeral_public = payload
                .ephemeral_public_key
                .ok_or(Error::Crypto(CryptoError::AuthFail))?;
            let shared = local.shared_secret(&ephemeral_public);
            derive_key(&shared, PROTOCOL_AAD, WRAP_INFO)
        }
    };

    let plaintext = decrypt(&key, &payload.nonce, &payload.body, PROTOCOL_AAD)?;
    Ok(bincode::deserialize(&plaintext)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_packet() -> DataPacket {
        DataPacket::new(
            [1u8; 16],
            [2u8; 32],
            "dest".to_string(),
            vec![[3u8; 32]],
            vec![0xAB; 256],
        )
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = [7u8; 32];
        let nonce = [1u8; 12];
        let plaintext = b"relay me";

        let ciphertext = encrypt(&key, &nonce, plaintext, PROTOCOL_AAD).unwrap();
        assert_ne!(&ciphertext[..plaintext.len().min(ciphertext.len())], plaintext);

        let decrypted = decrypt(&key, &nonce, &ciphertext, PROTOCOL_AAD).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_any_mutation_causes_auth_fail() {
        let key = [7u8; 32];
        let nonce = [1u8; 12];
        let ciphertext = encrypt(&key, &nonce, b"payload", PROTOCOL_AAD).unwrap();

        // Flip a ciphertext bit
        let mut tampered = ciphertext.clone();
        tampered[0] ^= 0x01;
        assert!(matches!(
            decrypt(&key, &nonce, &tampered, PROTOCOL_AAD),
            Err(Error::Crypto(CryptoError::AuthFail))
        ));

        // Flip a tag bit (the tag is the trailing 16 bytes)
        let mut tampered = ciphertext.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        assert!(matches!(
            decrypt(&key, &nonce, &tampered, PROTOCOL_AAD),
            Err(Error::Crypto(CryptoError::AuthFail))
        ));

        // Wrong nonce
        let wrong_nonce = [2u8; 12];
        assert!(matches!(
            decrypt(&key, &wrong_nonce, &ciphertext, PROTOCOL_AAD),
            Err(Error::Crypto(CryptoError::AuthFail))
        ));

        // Wrong associated data
        assert!(matches!(
            decrypt(&key, &nonce, &ciphertext, b"other-protocol"),
            Err(Error::Crypto(CryptoError::AuthFail))
        ));
    }

    #[test]
    fn test_tunnel_sealed_packet_roundtrip() {
        let alice = NodeIdentity::generate();
        let bob = NodeIdentity::generate();
        let packet = test_packet();

        let sealed = seal_packet(&packet, KeyMode::Tunnel, &alice, &bob.dh_public).unwrap();
        assert!(sealed.encrypted);
        assert!(sealed.ephemeral_public_key.is_none());

        let opened = open_packet(&sealed, &bob, &alice.dh_public).unwrap();
        assert_eq!(opened, packet);
    }

    #[test]
    fn test_ephemeral_sealed_packet_roundtrip() {
        let alice = NodeIdentity::generate();
        let bob = NodeIdentity::generate();
        let packet = test_packet();

        let sealed = seal_packet(&packet, KeyMode::Ephemeral, &alice, &bob.dh_public).unwrap();
        assert!(sealed.ephemeral_public_key.is_some());

        // Ephemeral mode does not need the sender's static DH key to open
        let opened = open_packet(&sealed, &bob, &[0u8; 32]).unwrap();
        assert_eq!(opened, packet);
    }

    #[test]
    fn test_wrong_recipient_cannot_open() {
        let alice = NodeIdentity::generate();
        let bob = NodeIdentity::generate();
        let eve = NodeIdentity::generate();
        let packet = test_packet();

        let sealed = seal_packet(&packet, KeyMode::Tunnel, &alice, &bob.dh_public).unwrap();
        assert!(matches!(
            open_packet(&sealed, &eve, &alice.dh_public),
            Err(Error::Crypto(CryptoError::AuthFail))
        ));
    }

    #[test]
    fn test_plain_packet_roundtrip() {
        let bob = NodeIdentity::generate();
        let packet = test_packet();
        let sealed = seal_plain(&packet).unwrap();
        assert!(!sealed.encrypted);
        let opened = open_packet(&sealed, &bob, &[0u8; 32]).unwrap();
        assert_eq!(opened, packet);
    }
}
