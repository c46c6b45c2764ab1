//! Print packet and message test vectors for interop testing.
//!
//! Run with: cargo run --package bitchat-protocol --example test_vectors

use bitchat_protocol::{ChatMessage, DeliveryStatus, Packet, PacketType, PeerId, Signature};

const NETWORK_KEY: &[u8] = b"bitchat-test-vectors";

fn main() {
    // Test vector 1: empty announce, unsigned
    let announce = Packet {
        version: 1,
        packet_type: PacketType::Announce,
        timestamp: 1_704_067_200.0,
        sender_id: PeerId::from_name("peer1"),
        recipient_id: PeerId::BROADCAST,
        ttl: 7,
        payload: vec![],
        signature: Signature::zeroed(),
    };
    print_test_vector("announce_unsigned", &announce.encode());

    // Test vector 2: signed broadcast chat message
    let message = ChatMessage {
        id: "00000000-0000-4000-8000-000000000001".to_string(),
        sender: "alice".to_string(),
        content: "Hello @bob".to_string(),
        timestamp: 1_704_067_200.5,
        is_relay: false,
        original_sender: None,
        is_private: false,
        recipient_nickname: None,
        sender_peer_id: "peer1".to_string(),
        mentions: vec!["bob".to_string()],
        channel: Some("#general".to_string()),
        is_encrypted: false,
        encrypted_content: None,
        delivery_status: DeliveryStatus::Pending,
    };
    let payload = message.encode().expect("message encoding failed");
    print_test_vector("chat_message", &payload);

    let broadcast = Packet {
        packet_type: PacketType::BroadcastMessage,
        payload,
        ..announce.clone()
    }
    .signed(NETWORK_KEY);
    print_test_vector("broadcast_signed", &broadcast.encode());

    // Test vector 3: unknown future type
    let future = Packet {
        packet_type: PacketType::Unknown(0x42),
        payload: b"future".to_vec(),
        ..announce
    };
    print_test_vector("unknown_type", &future.encode());
}

fn print_test_vector(name: &str, bytes: &[u8]) {
    println!("{} = {}", name, hex::encode(bytes));
}
