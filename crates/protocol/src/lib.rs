//! # bitchat Protocol Library
//!
//! Wire-level core of the bitchat mesh chat protocol: peers exchange signed,
//! optionally encrypted, TTL-bounded packets over a short-range radio link.
//!
//! ## Overview
//!
//! - **Packet Codec**: the outer envelope every peer relays
//! - **Message Codec**: the chat message carried inside a packet
//! - **Padding**: fixed block sizes so payload length leaks little
//! - **Crypto**: packet signatures, channel keys, key commitments and
//!   authenticated content encryption
//! - **Channel Manager**: membership, password protection and ownership
//! - **Delivery Tracker**: delivery status and acknowledgments
//! - **Duplicate Filter**: bloom filter bounding relay storms
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │              ChatMessage                │  flags + length-prefixed fields
//! ├─────────────────────────────────────────┤
//! │        Channel encryption (opt.)        │  ChaCha20-Poly1305, Argon2id key
//! ├─────────────────────────────────────────┤
//! │               Padding                   │  256 / 512 / 1024 / ... blocks
//! ├─────────────────────────────────────────┤
//! │               Packet                    │  HMAC-SHA-512 signed, TTL
//! ├─────────────────────────────────────────┤
//! │         Transport (BLE mesh)            │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use bitchat_protocol::{pad_to_optimal, unpad, ChatMessage, Packet, PacketType, PeerId};
//!
//! let network_key = b"mesh key";
//!
//! // Build a chat message and wrap it in a signed broadcast packet
//! let message = ChatMessage::new("alice", "hello @bob", "peer1").with_mentions();
//! let payload = pad_to_optimal(&message.encode().unwrap()).unwrap();
//! let packet = Packet::new(
//!     PacketType::BroadcastMessage,
//!     PeerId::from_name("peer1"),
//!     PeerId::BROADCAST,
//!     7,
//!     payload,
//! )
//! .signed(network_key);
//!
//! // On the receiving side
//! let received = Packet::decode(&packet.encode()).unwrap();
//! assert!(received.verify(network_key));
//! let decoded = ChatMessage::decode(&unpad(&received.payload)).unwrap();
//! assert_eq!(decoded.mentions, vec!["bob"]);
//! ```
//!
//! ## Modules
//!
//! - [`packet`]: packet envelope and peer ids
//! - [`message`]: chat message codec
//! - [`padding`]: block padding
//! - [`crypto`]: signatures, key derivation, encryption
//! - [`channel`]: channel manager
//! - [`delivery`]: delivery tracker, acks and receipts
//! - [`dedup`]: duplicate filter
//! - [`keychain`]: key storage collaborator
//! - [`error`]: Error types

pub mod channel;
pub mod crypto;
pub mod dedup;
pub mod delivery;
pub mod error;
pub mod keychain;
pub mod message;
pub mod packet;
pub mod padding;

pub use channel::{is_valid_channel_name, ChannelAnnouncement, ChannelManager};
pub use crypto::{
    decrypt_content, decrypt_text, derive_channel_key, derive_channel_key_with, encrypt_content,
    encrypt_text, generate_signature, verify_signature, ChannelKey, KdfParams, KeyCommitment,
    Signature, SIGNATURE_LENGTH,
};
pub use dedup::DuplicateFilter;
pub use delivery::{DeliveryAck, DeliveryTracker, ReadReceipt};
pub use error::{ProtocolError, Result};
pub use keychain::{peer_channel_key_id, Keychain, KeychainError, KeychainResult, MemoryKeychain};
#[cfg(feature = "system-keychain")]
pub use keychain::SystemKeychain;
pub use message::{parse_mentions, ChatMessage, DeliveryStatus};
pub use packet::{
    Packet, PacketType, PeerId, DEFAULT_TTL, MIN_PACKET_SIZE, PEER_ID_LENGTH, PROTOCOL_VERSION,
};
pub use padding::{optimal_block_size, pad, pad_to_optimal, unpad, BLOCK_SIZES};
