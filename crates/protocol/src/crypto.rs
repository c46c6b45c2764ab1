//! Cryptographic primitives for packets and channels.
//!
//! - Packet authentication: HMAC-SHA-512 tags (64 bytes, the packet's
//!   signature field).
//! - Channel keys: Argon2id over the password, salted with a digest of the
//!   channel name so one password yields unrelated keys in different channels.
//! - Key commitment: a SHA-256 digest of the channel key that can be published
//!   so joiners can check a password without learning anything about the key.
//! - Content encryption: ChaCha20-Poly1305 with a fresh random nonce per call.

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;

use crate::error::{ProtocolError, Result};

/// Length of a packet signature in bytes.
pub const SIGNATURE_LENGTH: usize = 64;

/// Length of a derived channel key in bytes.
pub const CHANNEL_KEY_LENGTH: usize = 32;

/// Length of a key commitment in bytes.
pub const COMMITMENT_LENGTH: usize = 32;

/// ChaCha20-Poly1305 nonce length.
pub const NONCE_LENGTH: usize = 12;

/// Poly1305 authentication tag length.
pub const TAG_LENGTH: usize = 16;

/// Bytes added to a plaintext by [`encrypt_content`].
pub const ENCRYPTION_OVERHEAD: usize = NONCE_LENGTH + TAG_LENGTH;

const CHANNEL_SALT_DOMAIN: &[u8] = b"bitchat-channel-salt:";
const COMMITMENT_DOMAIN: &[u8] = b"bitchat-key-commitment:";

type HmacSha512 = Hmac<Sha512>;

/// A 64-byte packet authentication tag.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature(pub [u8; SIGNATURE_LENGTH]);

impl Signature {
    /// Creates a new Signature from raw bytes.
    pub fn from_bytes(bytes: [u8; SIGNATURE_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Creates a Signature from a slice, if it has exactly 64 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; SIGNATURE_LENGTH] = bytes.try_into().ok()?;
        Some(Self(array))
    }

    /// An all-zero placeholder for packets that have not been signed yet.
    pub fn zeroed() -> Self {
        Self([0u8; SIGNATURE_LENGTH])
    }

    /// Returns the raw bytes of this signature.
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LENGTH] {
        &self.0
    }
}

impl Default for Signature {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({}…)", hex::encode(&self.0[..8]))
    }
}

/// A 32-byte symmetric channel key.
#[derive(Clone)]
pub struct ChannelKey([u8; CHANNEL_KEY_LENGTH]);

impl ChannelKey {
    /// Wraps raw key bytes.
    pub fn from_bytes(bytes: [u8; CHANNEL_KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Creates a key from a slice, if it has exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; CHANNEL_KEY_LENGTH] = bytes.try_into().ok()?;
        Some(Self(array))
    }

    /// Returns the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; CHANNEL_KEY_LENGTH] {
        &self.0
    }

    /// The public commitment to this key.
    pub fn commitment(&self) -> KeyCommitment {
        let mut hasher = Sha256::new();
        hasher.update(COMMITMENT_DOMAIN);
        hasher.update(self.0);
        KeyCommitment(hasher.finalize().into())
    }
}

impl PartialEq for ChannelKey {
    fn eq(&self, other: &Self) -> bool {
        self.0[..].ct_eq(&other.0[..]).into()
    }
}

impl Eq for ChannelKey {}

impl std::fmt::Debug for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ChannelKey([REDACTED])")
    }
}

/// One-way commitment to a channel key.
///
/// Safe to publish: it reveals nothing about the key or the password, but a
/// peer holding a candidate key can check it matches.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyCommitment([u8; COMMITMENT_LENGTH]);

impl KeyCommitment {
    /// Wraps raw commitment bytes, e.g. as received from a channel announcement.
    pub fn from_bytes(bytes: [u8; COMMITMENT_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Returns the raw commitment bytes.
    pub fn as_bytes(&self) -> &[u8; COMMITMENT_LENGTH] {
        &self.0
    }

    /// Lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses the form produced by [`KeyCommitment::to_hex`].
    pub fn from_hex(hex_str: &str) -> Option<Self> {
        let bytes = hex::decode(hex_str).ok()?;
        bytes.try_into().ok().map(Self)
    }

    /// Whether `key` is the key this commitment was made to.
    pub fn verify(&self, key: &ChannelKey) -> bool {
        self.0[..].ct_eq(&key.commitment().as_bytes()[..]).into()
    }
}

impl std::fmt::Debug for KeyCommitment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyCommitment({})", self.to_hex())
    }
}

/// Argon2id cost parameters for channel key derivation.
///
/// Every peer of a channel must use the same parameters, otherwise the same
/// password derives different keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub memory_kib: u32,
    /// Number of passes.
    pub iterations: u32,
    /// Degree of parallelism (lanes).
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

/// Generates the 64-byte authentication tag of `data` under `key`.
///
/// Deterministic: the same data and key always give the same tag.
pub fn generate_signature(data: &[u8], key: &[u8]) -> Signature {
    let mut mac =
        <HmacSha512 as Mac>::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    let tag = mac.finalize().into_bytes();

    let mut bytes = [0u8; SIGNATURE_LENGTH];
    bytes.copy_from_slice(&tag);
    Signature(bytes)
}

/// Checks `signature` against `data` and `key` in constant time.
///
/// Returns `false` for any mismatch, including a signature of the wrong length.
pub fn verify_signature(data: &[u8], signature: &[u8], key: &[u8]) -> bool {
    if signature.len() != SIGNATURE_LENGTH {
        return false;
    }
    let Ok(mut mac) = <HmacSha512 as Mac>::new_from_slice(key) else {
        return false;
    };
    mac.update(data);
    mac.verify_slice(signature).is_ok()
}

/// Encrypts `plaintext` under `key`.
///
/// Output format: nonce (12 bytes) || ciphertext || tag (16 bytes).
pub fn encrypt_content(plaintext: &[u8], key: &ChannelKey) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));

    let mut nonce_bytes = [0u8; NONCE_LENGTH];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| ProtocolError::Encryption)?;

    let mut output = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

/// Decrypts data produced by [`encrypt_content`].
///
/// Wrong key, tampering and truncation all yield the same
/// [`ProtocolError::Decryption`].
pub fn decrypt_content(ciphertext: &[u8], key: &ChannelKey) -> Result<Vec<u8>> {
    if ciphertext.len() < ENCRYPTION_OVERHEAD {
        return Err(ProtocolError::Decryption);
    }

    let (nonce_bytes, sealed) = ciphertext.split_at(NONCE_LENGTH);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), sealed)
        .map_err(|_| ProtocolError::Decryption)
}

/// Encrypts a UTF-8 string.
pub fn encrypt_text(text: &str, key: &ChannelKey) -> Result<Vec<u8>> {
    encrypt_content(text.as_bytes(), key)
}

/// Decrypts to a UTF-8 string.
pub fn decrypt_text(ciphertext: &[u8], key: &ChannelKey) -> Result<String> {
    let plaintext = decrypt_content(ciphertext, key)?;
    String::from_utf8(plaintext).map_err(|_| ProtocolError::Decryption)
}

/// Derives the 32-byte key of `channel` from `password` with default
/// [`KdfParams`].
pub fn derive_channel_key(password: &str, channel: &str) -> Result<ChannelKey> {
    derive_channel_key_with(&KdfParams::default(), password, channel)
}

/// Derives a channel key with explicit Argon2id parameters.
pub fn derive_channel_key_with(
    params: &KdfParams,
    password: &str,
    channel: &str,
) -> Result<ChannelKey> {
    let argon2_params = Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(CHANNEL_KEY_LENGTH),
    )?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let salt = channel_salt(channel);
    let mut key = [0u8; CHANNEL_KEY_LENGTH];
    argon2.hash_password_into(password.as_bytes(), &salt, &mut key)?;

    Ok(ChannelKey(key))
}

/// Salt bound to the channel name; Argon2 requires at least 8 bytes, which
/// short names like `#a` would not provide.
fn channel_salt(channel: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(CHANNEL_SALT_DOMAIN);
    hasher.update(channel.as_bytes());
    hasher.finalize().into()
}
