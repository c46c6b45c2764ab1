//! End-to-end channel scenarios: password-gated joins and an encrypted
//! message travelling through the full packet pipeline.

use std::sync::Arc;

use bitchat_protocol::{
    pad_to_optimal, peer_channel_key_id, unpad, ChannelManager, ChatMessage, Keychain,
    MemoryKeychain, Packet, PacketType, PeerId, ProtocolError,
};

const NETWORK_KEY: &[u8] = b"integration-mesh";

fn logged(manager: &ChannelManager<Arc<MemoryKeychain>>, text: &str) -> bool {
    manager
        .get_system_messages()
        .iter()
        .any(|m| m.content == text)
}

#[test]
fn test_password_protected_channel_flow() {
    let keychain = Arc::new(MemoryKeychain::new());
    let mut manager = ChannelManager::new(Arc::clone(&keychain));

    // Peer A creates the channel
    manager
        .create_channel("#secret", Some("password"), "peer_a")
        .unwrap();
    assert!(manager.is_password_protected("#secret"));
    assert_eq!(manager.channel_creator("#secret"), Some("peer_a"));
    let commitment = *manager.key_commitment("#secret").unwrap();

    // Peer B joins with the right password
    manager
        .join_channel("#secret", Some("password"), "peer_b")
        .unwrap();
    assert!(manager.is_joined("#secret"));
    assert!(logged(&manager, "Joined #secret successfully"));
    let stored = keychain
        .retrieve_key(&peer_channel_key_id("peer_b", "#secret"))
        .unwrap()
        .unwrap();
    assert_eq!(stored, manager.channel_key("#secret").unwrap().as_bytes());

    // Peer C gets the password wrong
    let err = manager
        .join_channel("#secret", Some("wrong"), "peer_c")
        .unwrap_err();
    assert!(matches!(err, ProtocolError::KeyCommitment(_)));
    assert_eq!(
        err.to_string(),
        "Key commitment verification failed for #secret"
    );
    assert!(logged(
        &manager,
        "Key commitment verification failed for #secret"
    ));
    assert!(keychain
        .retrieve_key(&peer_channel_key_id("peer_c", "#secret"))
        .unwrap()
        .is_none());

    // The failed attempt leaves the channel key untouched
    assert_eq!(manager.key_commitment("#secret"), Some(&commitment));
}

#[test]
fn test_encrypted_message_through_packet_pipeline() {
    let mut sender = ChannelManager::new(Arc::new(MemoryKeychain::new()));
    let mut receiver = ChannelManager::new(Arc::new(MemoryKeychain::new()));

    sender
        .create_channel("#ops", Some("correct horse"), "peer_a")
        .unwrap();
    receiver
        .join_channel("#ops", Some("correct horse"), "peer_b")
        .unwrap();

    // Sender side: encrypt, encode, pad, frame, sign
    let message = ChatMessage::new("alice", "meet at dawn", "peer_a").with_channel("#ops");
    let encrypted = sender.encrypt_for_channel(message.clone()).unwrap();
    assert!(encrypted.content.is_empty());

    let payload = pad_to_optimal(&encrypted.encode().unwrap()).unwrap();
    let wire = Packet::new(
        PacketType::BroadcastMessage,
        PeerId::from_name("peer_a"),
        PeerId::BROADCAST,
        7,
        payload,
    )
    .signed(NETWORK_KEY)
    .encode();

    // Receiver side: decode, verify, unpad, decode, decrypt
    let packet = Packet::decode(&wire).unwrap();
    assert!(packet.verify(NETWORK_KEY));
    let decoded = ChatMessage::decode(&unpad(&packet.payload)).unwrap();
    assert!(decoded.is_encrypted);

    let received = receiver.receive_message(decoded).unwrap();
    assert_eq!(received.id, message.id);
    assert_eq!(received.content, "meet at dawn");
    assert!(!received.is_encrypted);
    assert_eq!(receiver.channel_messages("#ops").len(), 1);
}

#[test]
fn test_wrong_password_cannot_read_channel() {
    let mut sender = ChannelManager::new(Arc::new(MemoryKeychain::new()));
    let mut eavesdropper = ChannelManager::new(Arc::new(MemoryKeychain::new()));

    sender
        .create_channel("#ops", Some("correct horse"), "peer_a")
        .unwrap();
    let encrypted = sender
        .encrypt_for_channel(ChatMessage::new("alice", "secret plan", "peer_a").with_channel("#ops"))
        .unwrap();

    // Without a key the message is held, not decrypted
    let held = eavesdropper.receive_message(encrypted).unwrap();
    assert!(held.is_encrypted);
    assert!(eavesdropper.is_password_protected("#ops"));

    // A guessed password does not open the held ciphertext
    let err = eavesdropper
        .join_channel("#ops", Some("battery staple"), "peer_e")
        .unwrap_err();
    assert!(matches!(err, ProtocolError::KeyCommitment(_)));
    assert!(!eavesdropper.is_joined("#ops"));
    assert!(eavesdropper.channel_messages("#ops").is_empty());
}
