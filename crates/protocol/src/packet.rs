//! Outer packet envelope exchanged between peers.
//!
//! # Wire Format
//!
//! All integers are big-endian:
//! - 1 byte: version (only [`PROTOCOL_VERSION`] is accepted)
//! - 1 byte: packet type code
//! - 8 bytes: timestamp, IEEE-754 `f64` bits, seconds since the Unix epoch
//! - 16 bytes: sender id
//! - 16 bytes: recipient id
//! - 1 byte: ttl
//! - 4 bytes: payload length
//! - N bytes: payload
//! - 64 bytes: signature
//!
//! Packets come from untrusted peers, so [`Packet::decode`] never fails
//! loudly; malformed input simply yields `None`.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::crypto::{generate_signature, verify_signature, Signature, SIGNATURE_LENGTH};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Length of a peer id in bytes.
pub const PEER_ID_LENGTH: usize = 16;

/// Header size: version, type, timestamp, sender, recipient, ttl, length.
pub const PACKET_HEADER_SIZE: usize = 1 + 1 + 8 + PEER_ID_LENGTH + PEER_ID_LENGTH + 1 + 4;

/// Smallest valid frame: a header, an empty payload and the signature.
pub const MIN_PACKET_SIZE: usize = PACKET_HEADER_SIZE + SIGNATURE_LENGTH;

/// Default hop budget for locally originated packets.
pub const DEFAULT_TTL: u8 = 7;

/// A 16-byte peer identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PeerId(pub [u8; PEER_ID_LENGTH]);

impl PeerId {
    /// Recipient id meaning "all peers": eight 0xFF bytes then eight zeros.
    pub const BROADCAST: PeerId = PeerId([
        0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00,
    ]);

    /// Wraps raw id bytes.
    pub fn from_bytes(bytes: [u8; PEER_ID_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Builds an id from a short textual name, zero-padded (or truncated)
    /// to 16 bytes.
    pub fn from_name(name: &str) -> Self {
        let mut bytes = [0u8; PEER_ID_LENGTH];
        let source = name.as_bytes();
        let len = source.len().min(PEER_ID_LENGTH);
        bytes[..len].copy_from_slice(&source[..len]);
        Self(bytes)
    }

    /// Parses a 32-character hex id.
    pub fn from_hex(s: &str) -> Option<Self> {
        let decoded = hex::decode(s).ok()?;
        let bytes: [u8; PEER_ID_LENGTH] = decoded.try_into().ok()?;
        Some(Self(bytes))
    }

    /// Returns the raw id bytes.
    pub fn as_bytes(&self) -> &[u8; PEER_ID_LENGTH] {
        &self.0
    }

    /// Whether this is the broadcast sentinel.
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.to_hex())
    }
}

/// Packet type discriminant.
///
/// Codes not in the table decode to [`PacketType::Unknown`] and re-encode
/// unchanged, so newer peers' packets can still be relayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// Peer presence announcement.
    Announce,
    /// Key exchange handshake.
    KeyExchange,
    /// Peer departure.
    Leave,
    /// Chat message, private or channel.
    Message,
    /// Chat message to every peer.
    BroadcastMessage,
    /// Channel metadata announcement.
    ChannelAnnounce,
    /// Delivery acknowledgment.
    Ack,
    /// Read receipt.
    Receipt,
    /// Any code outside the table.
    Unknown(u8),
}

impl PacketType {
    /// The wire code of this type.
    pub fn code(self) -> u8 {
        match self {
            PacketType::Announce => 0x01,
            PacketType::KeyExchange => 0x02,
            PacketType::Leave => 0x03,
            PacketType::Message => 0x04,
            PacketType::BroadcastMessage => 0x05,
            PacketType::ChannelAnnounce => 0x08,
            PacketType::Ack => 0x0A,
            PacketType::Receipt => 0x0C,
            PacketType::Unknown(code) => code,
        }
    }

    /// Maps a wire code to a type.
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => PacketType::Announce,
            0x02 => PacketType::KeyExchange,
            0x03 => PacketType::Leave,
            0x04 => PacketType::Message,
            0x05 => PacketType::BroadcastMessage,
            0x08 => PacketType::ChannelAnnounce,
            0x0A => PacketType::Ack,
            0x0C => PacketType::Receipt,
            other => PacketType::Unknown(other),
        }
    }

    /// Lowercase name as used in logs and CLI output.
    pub fn name(self) -> String {
        match self {
            PacketType::Announce => "announce".into(),
            PacketType::KeyExchange => "key_exchange".into(),
            PacketType::Leave => "leave".into(),
            PacketType::Message => "message".into(),
            PacketType::BroadcastMessage => "broadcast_message".into(),
            PacketType::ChannelAnnounce => "channel_announce".into(),
            PacketType::Ack => "ack".into(),
            PacketType::Receipt => "receipt".into(),
            PacketType::Unknown(code) => format!("unknown(0x{code:02x})"),
        }
    }

    /// Whether the payload carries a [`ChatMessage`](crate::ChatMessage).
    pub fn carries_chat_message(self) -> bool {
        matches!(self, PacketType::Message | PacketType::BroadcastMessage)
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Current time as fractional seconds since the Unix epoch.
pub fn now_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// A signed, TTL-bounded packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Protocol version.
    pub version: u8,
    /// Packet type.
    pub packet_type: PacketType,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    /// Originating peer.
    pub sender_id: PeerId,
    /// Addressed peer, or [`PeerId::BROADCAST`].
    pub recipient_id: PeerId,
    /// Remaining hop budget.
    pub ttl: u8,
    /// Type-specific payload.
    pub payload: Vec<u8>,
    /// Authentication tag over [`Packet::signing_bytes`].
    pub signature: Signature,
}

impl Packet {
    /// Creates an unsigned version-1 packet stamped with the current time.
    pub fn new(
        packet_type: PacketType,
        sender_id: PeerId,
        recipient_id: PeerId,
        ttl: u8,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            packet_type,
            timestamp: now_timestamp(),
            sender_id,
            recipient_id,
            ttl,
            payload,
            signature: Signature::zeroed(),
        }
    }

    /// Whether this packet is addressed to every peer.
    pub fn is_broadcast(&self) -> bool {
        self.recipient_id.is_broadcast()
    }

    /// Encodes the packet to its wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut output = Vec::with_capacity(MIN_PACKET_SIZE + self.payload.len());
        self.write_header(&mut output, self.ttl);
        output.extend_from_slice(&self.payload);
        output.extend_from_slice(self.signature.as_bytes());
        output
    }

    /// Decodes a packet, returning `None` for anything malformed.
    pub fn decode(data: &[u8]) -> Option<Packet> {
        if data.is_empty() {
            debug!("rejecting packet: empty input");
            return None;
        }
        if data.len() < MIN_PACKET_SIZE {
            debug!(len = data.len(), "rejecting packet: shorter than minimum frame");
            return None;
        }

        let version = data[0];
        if version != PROTOCOL_VERSION {
            debug!(version, "rejecting packet: unsupported version");
            return None;
        }

        let packet_type = PacketType::from_code(data[1]);
        let timestamp = f64::from_bits(u64::from_be_bytes(data[2..10].try_into().ok()?));
        let sender_id = PeerId(data[10..26].try_into().ok()?);
        let recipient_id = PeerId(data[26..42].try_into().ok()?);
        let ttl = data[42];
        let payload_len = u32::from_be_bytes(data[43..47].try_into().ok()?) as usize;

        let expected = MIN_PACKET_SIZE.checked_add(payload_len)?;
        if data.len() != expected {
            debug!(
                len = data.len(),
                expected, "rejecting packet: length field does not match frame"
            );
            return None;
        }

        let payload_end = PACKET_HEADER_SIZE + payload_len;
        let payload = data[PACKET_HEADER_SIZE..payload_end].to_vec();
        let signature = Signature::from_slice(&data[payload_end..])?;

        Some(Packet {
            version,
            packet_type,
            timestamp,
            sender_id,
            recipient_id,
            ttl,
            payload,
            signature,
        })
    }

    /// Bytes covered by the signature: the full frame minus the signature,
    /// with ttl zeroed since relays decrement it.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut output = Vec::with_capacity(PACKET_HEADER_SIZE + self.payload.len());
        self.write_header(&mut output, 0);
        output.extend_from_slice(&self.payload);
        output
    }

    /// Signs the packet in place with `key`.
    pub fn sign(&mut self, key: &[u8]) {
        self.signature = generate_signature(&self.signing_bytes(), key);
    }

    /// Builder form of [`Packet::sign`].
    pub fn signed(mut self, key: &[u8]) -> Self {
        self.sign(key);
        self
    }

    /// Checks the signature against `key`.
    pub fn verify(&self, key: &[u8]) -> bool {
        verify_signature(&self.signing_bytes(), self.signature.as_bytes(), key)
    }

    /// The copy a relay forwards: ttl decremented, or `None` once exhausted.
    pub fn relayed(&self) -> Option<Packet> {
        let ttl = self.ttl.checked_sub(1)?;
        Some(Packet {
            ttl,
            ..self.clone()
        })
    }

    fn write_header(&self, output: &mut Vec<u8>, ttl: u8) {
        output.push(self.version);
        output.push(self.packet_type.code());
        output.extend_from_slice(&self.timestamp.to_bits().to_be_bytes());
        output.extend_from_slice(self.sender_id.as_bytes());
        output.extend_from_slice(self.recipient_id.as_bytes());
        output.push(ttl);
        // Payloads are bounded by the transport MTU, far below u32::MAX.
        output.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8] = b"mesh-network-key";

    fn sample_packet(packet_type: PacketType, payload: &[u8]) -> Packet {
        Packet {
            version: PROTOCOL_VERSION,
            packet_type,
            timestamp: 1_700_000_000.123_456,
            sender_id: PeerId::from_name("peer1"),
            recipient_id: PeerId::from_name("peer2"),
            ttl: 100,
            payload: payload.to_vec(),
            signature: Signature::zeroed(),
        }
    }

    #[test]
    fn test_packet_roundtrip() {
        let packet = sample_packet(PacketType::Message, b"Hello, world!");
        let encoded = packet.encode();
        assert_eq!(encoded.len(), MIN_PACKET_SIZE + 13);

        let decoded = Packet::decode(&encoded).unwrap();
        assert_eq!(decoded.version, packet.version);
        assert_eq!(decoded.packet_type, packet.packet_type);
        assert_eq!(decoded.sender_id, packet.sender_id);
        assert_eq!(decoded.recipient_id, packet.recipient_id);
        assert!((decoded.timestamp - packet.timestamp).abs() < 0.001);
        assert_eq!(decoded.payload, packet.payload);
        assert_eq!(decoded.signature, packet.signature);
        assert_eq!(decoded.ttl, packet.ttl);
    }

    #[test]
    fn test_broadcast_packet() {
        let mut packet = sample_packet(PacketType::BroadcastMessage, b"Broadcast message");
        packet.recipient_id = PeerId::BROADCAST;

        let decoded = Packet::decode(&packet.encode()).unwrap();
        assert_eq!(decoded.recipient_id.as_bytes()[..8], [0xFF; 8]);
        assert_eq!(decoded.recipient_id.as_bytes()[8..], [0x00; 8]);
        assert!(decoded.is_broadcast());
        assert_eq!(decoded.packet_type, PacketType::BroadcastMessage);
        assert_eq!(decoded.ttl, 100);
    }

    #[test]
    fn test_packet_with_signature() {
        let mut packet = sample_packet(PacketType::Message, b"Signed message");
        packet.signature = Signature::from_bytes([0xAB; 64]);

        let decoded = Packet::decode(&packet.encode()).unwrap();
        assert_eq!(decoded.signature.as_bytes(), &[0xAB; 64]);
        assert_eq!(decoded.payload, b"Signed message");
    }

    #[test]
    fn test_decode_empty_returns_none() {
        assert!(Packet::decode(&[]).is_none());
    }

    #[test]
    fn test_decode_truncated_returns_none() {
        let encoded = sample_packet(PacketType::Message, b"Test").encode();
        assert!(Packet::decode(&encoded[..encoded.len() / 2]).is_none());
        assert!(Packet::decode(&encoded[..encoded.len() - 1]).is_none());
    }

    #[test]
    fn test_decode_trailing_bytes_returns_none() {
        let mut encoded = sample_packet(PacketType::Message, b"Test").encode();
        encoded.push(0);
        assert!(Packet::decode(&encoded).is_none());
    }

    #[test]
    fn test_decode_unsupported_version_returns_none() {
        let mut packet = sample_packet(PacketType::Message, b"Test");
        packet.version = 99;
        assert!(Packet::decode(&packet.encode()).is_none());
    }

    #[test]
    fn test_decode_huge_length_field_returns_none() {
        let mut encoded = sample_packet(PacketType::Message, b"").encode();
        encoded[43..47].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(Packet::decode(&encoded).is_none());
    }

    #[test]
    fn test_empty_payload_is_minimum_frame() {
        let encoded = sample_packet(PacketType::Announce, b"").encode();
        assert_eq!(encoded.len(), MIN_PACKET_SIZE);
        assert!(Packet::decode(&encoded).unwrap().payload.is_empty());
    }

    #[test]
    fn test_known_types_roundtrip() {
        let types = [
            PacketType::Announce,
            PacketType::KeyExchange,
            PacketType::Leave,
            PacketType::Message,
            PacketType::BroadcastMessage,
            PacketType::ChannelAnnounce,
            PacketType::Ack,
            PacketType::Receipt,
        ];
        for packet_type in types {
            let decoded = Packet::decode(&sample_packet(packet_type, b"x").encode()).unwrap();
            assert_eq!(decoded.packet_type, packet_type);
            assert_eq!(PacketType::from_code(packet_type.code()), packet_type);
        }
    }

    #[test]
    fn test_unknown_type_roundtrips() {
        let packet = sample_packet(PacketType::from_code(0x42), b"future");
        assert_eq!(packet.packet_type, PacketType::Unknown(0x42));

        let encoded = packet.encode();
        assert_eq!(encoded[1], 0x42);
        let decoded = Packet::decode(&encoded).unwrap();
        assert_eq!(decoded.packet_type, PacketType::Unknown(0x42));
        assert_eq!(decoded.packet_type.name(), "unknown(0x42)");
    }

    #[test]
    fn test_sign_and_verify() {
        let packet = sample_packet(PacketType::Message, b"payload").signed(KEY);
        assert!(packet.verify(KEY));
        assert!(!packet.verify(b"other-key"));

        let mut tampered = packet.clone();
        tampered.payload[0] ^= 0x01;
        assert!(!tampered.verify(KEY));

        let mut spoofed = packet.clone();
        spoofed.sender_id = PeerId::from_name("mallory");
        assert!(!spoofed.verify(KEY));
    }

    #[test]
    fn test_signature_survives_relay() {
        let packet = sample_packet(PacketType::Message, b"payload").signed(KEY);
        let relayed = packet.relayed().unwrap();
        assert_eq!(relayed.ttl, 99);
        assert!(relayed.verify(KEY));

        let decoded = Packet::decode(&relayed.encode()).unwrap();
        assert!(decoded.verify(KEY));
    }

    #[test]
    fn test_relay_exhausted_ttl() {
        let mut packet = sample_packet(PacketType::Message, b"payload");
        packet.ttl = 1;
        let last_hop = packet.relayed().unwrap();
        assert_eq!(last_hop.ttl, 0);
        assert!(last_hop.relayed().is_none());
    }

    #[test]
    fn test_peer_id_from_name_pads() {
        let id = PeerId::from_name("peer1");
        assert_eq!(&id.as_bytes()[..5], b"peer1");
        assert_eq!(&id.as_bytes()[5..], &[0u8; 11]);

        let long = PeerId::from_name("a-very-long-peer-identifier");
        assert_eq!(long.as_bytes(), b"a-very-long-peer");
    }

    #[test]
    fn test_peer_id_hex_roundtrip() {
        let id = PeerId::from_name("peer1");
        let hex = id.to_string();
        assert_eq!(hex.len(), 32);
        assert_eq!(PeerId::from_hex(&hex), Some(id));
        assert_eq!(PeerId::from_hex("abcd"), None);
        assert_eq!(PeerId::from_hex("not hex"), None);
    }

    #[test]
    fn test_broadcast_sentinel() {
        assert!(PeerId::BROADCAST.is_broadcast());
        assert!(!PeerId::from_name("peer1").is_broadcast());
        assert_eq!(
            PeerId::BROADCAST.to_hex(),
            "ffffffffffffffff0000000000000000"
        );
    }

    #[test]
    fn test_new_packet_defaults() {
        let packet = Packet::new(
            PacketType::Message,
            PeerId::from_name("a"),
            PeerId::BROADCAST,
            DEFAULT_TTL,
            b"x".to_vec(),
        );
        assert_eq!(packet.version, PROTOCOL_VERSION);
        assert!(packet.timestamp > 0.0);
        assert_eq!(packet.signature, Signature::zeroed());
    }
}
