//! Mesh service: sends local traffic and runs the receive path.
//!
//! Every incoming packet goes through the same steps:
//!
//! 1. Drop echoes of our own packets
//! 2. Verify the signature against the mesh network key
//! 3. Check-and-insert into the seen set (one lock acquisition)
//! 4. Dispatch by type when addressed to us or broadcast
//! 5. Relay with ttl - 1 unless addressed to us or out of hops
//!
//! Shared state lives behind `std::sync::Mutex`; guards are always released
//! before the next `.await`. Channel operations that derive a key run on the
//! blocking pool.

use std::sync::{Arc, Mutex, MutexGuard};

use bitchat_protocol::{
    pad_to_optimal, unpad, ChannelAnnouncement, ChannelManager, ChatMessage, DeliveryAck,
    DeliveryStatus, DeliveryTracker, Keychain, Packet, PacketType, PeerId, ProtocolError,
    ReadReceipt,
};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{Config, ConfigError};
use crate::seen::SeenMessages;
use crate::transport::{Transport, TransportError};

/// Capacity of the event channel before slow subscribers start lagging.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Errors raised by the mesh service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Result alias for service operations.
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Events emitted to subscribers of the service.
#[derive(Debug, Clone)]
pub enum MeshEvent {
    /// A chat message addressed to us or broadcast, decrypted when possible.
    MessageReceived { from: PeerId, message: ChatMessage },
    /// A peer acknowledged one of our messages.
    AckReceived(DeliveryAck),
    /// A peer read one of our messages.
    ReceiptReceived(ReadReceipt),
    /// A peer announced itself.
    PeerAnnounced { peer_id: PeerId, nickname: String },
    /// A peer left the mesh.
    PeerLeft { peer_id: PeerId },
    /// A channel owner published the channel's metadata.
    ChannelAnnounced {
        from: PeerId,
        channel: String,
        creator_id: String,
        protected: bool,
    },
}

/// What the receive path did with a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processed; `relayed` tells whether a copy was forwarded.
    Accepted { relayed: bool },
    /// Already seen.
    Duplicate,
    /// Signature did not verify under the network key.
    InvalidSignature,
    /// Our own packet coming back from a relay.
    Echo,
}

/// One node on the mesh.
pub struct MeshService<T: Transport, K: Keychain> {
    transport: T,
    local_id: PeerId,
    nickname: String,
    network_key: [u8; 32],
    default_ttl: u8,
    pad_messages: bool,
    channels: Arc<Mutex<ChannelManager<K>>>,
    tracker: Mutex<DeliveryTracker>,
    seen: Mutex<SeenMessages>,
    events: broadcast::Sender<MeshEvent>,
}

impl<T: Transport, K: Keychain + 'static> MeshService<T, K> {
    /// Creates a service for `local_id` from a validated configuration.
    pub fn new(config: &Config, local_id: PeerId, transport: T, keychain: K) -> Result<Self> {
        config.validate()?;

        let network_key: [u8; 32] = Sha256::digest(config.mesh.network_key.as_bytes()).into();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            transport,
            local_id,
            nickname: config.node.nickname.clone(),
            network_key,
            default_ttl: config.mesh.default_ttl,
            pad_messages: config.mesh.pad_messages,
            channels: Arc::new(Mutex::new(ChannelManager::with_kdf_params(
                keychain,
                config.crypto,
            ))),
            tracker: Mutex::new(DeliveryTracker::new()),
            seen: Mutex::new(SeenMessages::new(config.mesh.dedup_capacity)?),
            events,
        })
    }

    /// This node's peer id.
    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    /// This node's nickname.
    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Subscribe to service events.
    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    /// Runs `f` against the channel manager on the calling thread.
    ///
    /// Must not derive keys: use the async channel operations for that.
    pub fn with_channels<R>(&self, f: impl FnOnce(&mut ChannelManager<K>) -> R) -> R {
        f(&mut lock(&self.channels))
    }

    /// Runs `f` against the channel manager on the blocking pool.
    async fn channel_op<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut ChannelManager<K>) -> R + Send + 'static,
    {
        let channels = Arc::clone(&self.channels);
        Ok(tokio::task::spawn_blocking(move || f(&mut lock(&channels))).await?)
    }

    /// Creates a channel owned by this node and announces it.
    pub async fn create_channel(&self, name: &str, password: Option<&str>) -> Result<()> {
        let (channel, password, local) = (
            name.to_string(),
            password.map(str::to_string),
            self.local_id.to_hex(),
        );
        self.channel_op(move |channels| {
            channels.create_channel(&channel, password.as_deref(), &local)
        })
        .await??;
        self.announce_channel(name).await
    }

    /// Joins a channel. A channel that did not exist yet is created, owned
    /// by us, and announced.
    pub async fn join_channel(&self, name: &str, password: Option<&str>) -> Result<()> {
        let (channel, password, local) = (
            name.to_string(),
            password.map(str::to_string),
            self.local_id.to_hex(),
        );
        let owned = self
            .channel_op(move |channels| {
                channels.join_channel(&channel, password.as_deref(), &local)?;
                Ok::<_, ProtocolError>(channels.channel_creator(&channel) == Some(local.as_str()))
            })
            .await??;
        if owned {
            self.announce_channel(name).await?;
        }
        Ok(())
    }

    /// Sets or replaces the password of a channel we own and announces the
    /// new commitment.
    pub async fn set_channel_password(&self, name: &str, password: &str) -> Result<()> {
        let (channel, password, local) =
            (name.to_string(), password.to_string(), self.local_id.to_hex());
        self.channel_op(move |channels| {
            channels.set_channel_password(&channel, &password, &local)
        })
        .await??;
        self.announce_channel(name).await
    }

    /// Opens a channel we own and announces it.
    pub async fn remove_channel_password(&self, name: &str) -> Result<()> {
        let local = self.local_id.to_hex();
        self.with_channels(|channels| channels.remove_channel_password(name, &local))?;
        self.announce_channel(name).await
    }

    /// Hands a channel we own to `new_owner` and announces the change.
    pub async fn transfer_ownership(&self, name: &str, new_owner: PeerId) -> Result<()> {
        let local = self.local_id.to_hex();
        self.with_channels(|channels| {
            channels.transfer_ownership(name, &new_owner.to_hex(), &local)
        })?;
        self.announce_channel(name).await
    }

    /// Broadcasts the current metadata of `name`.
    async fn announce_channel(&self, name: &str) -> Result<()> {
        let Some(announcement) = self.with_channels(|channels| channels.channel_announcement(name))
        else {
            return Ok(());
        };
        let packet = self.packet(
            PacketType::ChannelAnnounce,
            PeerId::BROADCAST,
            announcement.to_bytes()?,
        );
        self.transmit(&packet).await?;
        info!(
            channel = %name,
            protected = announcement.is_protected(),
            "announced channel"
        );
        Ok(())
    }

    /// Delivery status of a message we sent.
    pub fn delivery_status(&self, message_id: &str) -> Result<Option<DeliveryStatus>> {
        Ok(lock(&self.tracker).get_status(message_id)?)
    }

    /// Acks received for a message we sent.
    pub fn delivery_acks(&self, message_id: &str) -> Result<Vec<DeliveryAck>> {
        Ok(lock(&self.tracker).get_acks(message_id)?)
    }

    /// Peers the transport currently sees.
    pub async fn peers(&self) -> Vec<String> {
        self.transport.scan_peers().await
    }

    /// Starts advertising and broadcasts our nickname.
    pub async fn announce(&self) -> Result<()> {
        self.transport.start_advertising(self.local_id).await?;
        let packet = self.packet(
            PacketType::Announce,
            PeerId::BROADCAST,
            self.nickname.as_bytes().to_vec(),
        );
        self.transmit(&packet).await?;
        info!(peer = %self.local_id, nickname = %self.nickname, "announced on mesh");
        Ok(())
    }

    /// Tells the mesh we are leaving.
    pub async fn leave(&self) -> Result<()> {
        let packet = self.packet(PacketType::Leave, PeerId::BROADCAST, Vec::new());
        self.transmit(&packet).await
    }

    /// Handles a line of user input.
    ///
    /// Channel commands are applied locally and return `None`. Anything
    /// else is sent as a chat message, to `channel` when given, encrypted
    /// when that channel is protected.
    pub async fn send_text(&self, text: &str, channel: Option<&str>) -> Result<Option<ChatMessage>> {
        let local_hex = self.local_id.to_hex();
        let joining = matches!(text.split_whitespace().next(), Some("/join" | "/j"));
        let (command, local) = (text.to_string(), local_hex.clone());
        let handled = self
            .channel_op(move |channels| {
                if !channels.process_command(&command, &local)? {
                    return Ok(None);
                }
                let owned = channels
                    .current_channel()
                    .filter(|name| joining && channels.channel_creator(name) == Some(local.as_str()))
                    .map(str::to_string);
                Ok::<_, ProtocolError>(Some(owned))
            })
            .await??;
        if let Some(owned) = handled {
            if let Some(name) = owned {
                self.announce_channel(&name).await?;
            }
            return Ok(None);
        }

        let mut message = ChatMessage::new(&self.nickname, text, local_hex).with_mentions();
        let protected = match channel {
            Some(name) => {
                message = message.with_channel(name);
                self.with_channels(|channels| channels.is_password_protected(name))
            }
            None => false,
        };

        if protected {
            self.send_encrypted_channel_message(message).await.map(Some)
        } else {
            self.send_message(message, None).await.map(Some)
        }
    }

    /// Sends `message`, privately to `recipient` or broadcast when `None`.
    ///
    /// The message is tracked as pending, then sent or failed.
    pub async fn send_message(
        &self,
        message: ChatMessage,
        recipient: Option<PeerId>,
    ) -> Result<ChatMessage> {
        let encoded = message.encode()?;
        let payload = if self.pad_messages {
            pad_to_optimal(&encoded)?
        } else {
            encoded
        };

        let (packet_type, recipient_id) = match recipient {
            Some(peer) => (PacketType::Message, peer),
            None => (PacketType::BroadcastMessage, PeerId::BROADCAST),
        };
        let packet = self.packet(packet_type, recipient_id, payload);

        lock(&self.tracker).track_message(&message.id, DeliveryStatus::Pending)?;
        let sent = self.transmit(&packet).await;
        let status = if sent.is_ok() {
            DeliveryStatus::Sent
        } else {
            DeliveryStatus::Failed
        };
        lock(&self.tracker).track_message(&message.id, status)?;
        sent?;

        debug!(message_id = %message.id, recipient = %recipient_id, "message sent");
        Ok(message)
    }

    /// Encrypts `message` under its channel key and broadcasts it.
    pub async fn send_encrypted_channel_message(&self, message: ChatMessage) -> Result<ChatMessage> {
        let encrypted = self.with_channels(|channels| channels.encrypt_for_channel(message))?;
        self.send_message(encrypted, None).await
    }

    /// Acknowledges `message` to the peer that sent it.
    pub async fn send_delivery_ack(
        &self,
        message: &ChatMessage,
        to: PeerId,
        hop_count: u8,
    ) -> Result<DeliveryAck> {
        let ack = lock(&self.tracker).generate_ack(
            &message.id,
            &self.node_uuid(),
            &self.nickname,
            i64::from(hop_count),
        )?;
        let packet = self.packet(PacketType::Ack, to, ack.to_bytes()?);
        self.transmit(&packet).await?;
        debug!(message_id = %ack.message_id, to = %to, "delivery ack sent");
        Ok(ack)
    }

    /// Tells `to` that we read `message_id`.
    pub async fn send_read_receipt(&self, message_id: &str, to: PeerId) -> Result<ReadReceipt> {
        let receipt = ReadReceipt::new(message_id, self.node_uuid(), &self.nickname);
        let packet = self.packet(PacketType::Receipt, to, receipt.to_bytes()?);
        self.transmit(&packet).await?;
        Ok(receipt)
    }

    /// Receive loop. Returns once the transport is closed.
    pub async fn run(&self) {
        info!(peer = %self.local_id, "mesh service started");
        while self.process_next().await.is_some() {}
        info!(peer = %self.local_id, "transport closed, mesh service stopped");
    }

    /// Receives and handles a single packet. `None` once the transport is
    /// closed.
    pub async fn process_next(&self) -> Option<Disposition> {
        let packet = self.transport.receive_packet().await?;
        match self.handle_packet(packet).await {
            Ok(disposition) => Some(disposition),
            Err(err) => {
                warn!(error = %err, "failed to handle packet");
                Some(Disposition::Accepted { relayed: false })
            }
        }
    }

    /// Runs one packet through the receive path.
    ///
    /// Payload problems are logged and do not stop relaying; only a relay
    /// transport failure is returned as an error.
    pub async fn handle_packet(&self, packet: Packet) -> Result<Disposition> {
        if packet.sender_id == self.local_id {
            return Ok(Disposition::Echo);
        }

        if !packet.verify(&self.network_key) {
            warn!(
                sender = %packet.sender_id,
                packet_type = %packet.packet_type,
                "dropping packet with invalid signature"
            );
            return Ok(Disposition::InvalidSignature);
        }

        if lock(&self.seen).check_and_insert(packet.signing_bytes()) {
            debug!(sender = %packet.sender_id, "dropping duplicate packet");
            return Ok(Disposition::Duplicate);
        }

        let addressed_to_us = packet.recipient_id == self.local_id;
        if addressed_to_us || packet.is_broadcast() {
            if let Err(err) = self.dispatch(&packet).await {
                warn!(
                    sender = %packet.sender_id,
                    packet_type = %packet.packet_type,
                    error = %err,
                    "failed to process packet"
                );
            }
        }

        if addressed_to_us {
            return Ok(Disposition::Accepted { relayed: false });
        }

        match packet.relayed() {
            Some(copy) => {
                self.transport.send_packet(&copy, PeerId::BROADCAST).await?;
                debug!(sender = %copy.sender_id, ttl = copy.ttl, "relayed packet");
                Ok(Disposition::Accepted { relayed: true })
            }
            None => {
                debug!(sender = %packet.sender_id, "ttl exhausted, not relaying");
                Ok(Disposition::Accepted { relayed: false })
            }
        }
    }

    async fn dispatch(&self, packet: &Packet) -> Result<()> {
        match packet.packet_type {
            PacketType::Message | PacketType::BroadcastMessage => {
                let message = decode_chat_payload(&packet.payload)?;
                let message = self.with_channels(|channels| channels.receive_message(message))?;

                let direct = packet.recipient_id == self.local_id;
                let hop_count = self.default_ttl.saturating_sub(packet.ttl);
                self.emit(MeshEvent::MessageReceived {
                    from: packet.sender_id,
                    message: message.clone(),
                });

                if direct {
                    self.send_delivery_ack(&message, packet.sender_id, hop_count)
                        .await?;
                }
            }
            PacketType::Ack => {
                let ack = DeliveryAck::from_bytes(&packet.payload)?;
                lock(&self.tracker).process_ack(&ack)?;
                self.emit(MeshEvent::AckReceived(ack));
            }
            PacketType::Receipt => {
                let receipt = ReadReceipt::from_bytes(&packet.payload)?;
                lock(&self.tracker).process_receipt(&receipt)?;
                self.emit(MeshEvent::ReceiptReceived(receipt));
            }
            PacketType::Announce => {
                let nickname = String::from_utf8_lossy(&packet.payload).into_owned();
                info!(peer = %packet.sender_id, nickname = %nickname, "peer announced");
                self.emit(MeshEvent::PeerAnnounced {
                    peer_id: packet.sender_id,
                    nickname,
                });
            }
            PacketType::Leave => {
                info!(peer = %packet.sender_id, "peer left");
                self.emit(MeshEvent::PeerLeft {
                    peer_id: packet.sender_id,
                });
            }
            PacketType::ChannelAnnounce => {
                let announcement = ChannelAnnouncement::from_bytes(&packet.payload)?;
                let sender = packet.sender_id.to_hex();
                let accepted = self.with_channels(|channels| {
                    // Only the current owner may change a channel.
                    match channels.channel_creator(&announcement.channel) {
                        Some(owner) if owner != sender => Ok(false),
                        _ => channels.apply_announcement(&announcement).map(|()| true),
                    }
                })?;
                if !accepted {
                    warn!(
                        peer = %packet.sender_id,
                        channel = %announcement.channel,
                        "ignoring channel announcement from non-owner"
                    );
                    return Ok(());
                }

                info!(
                    peer = %packet.sender_id,
                    channel = %announcement.channel,
                    "learned channel"
                );
                self.emit(MeshEvent::ChannelAnnounced {
                    from: packet.sender_id,
                    protected: announcement.is_protected(),
                    channel: announcement.channel,
                    creator_id: announcement.creator_id,
                });
            }
            other => {
                debug!(packet_type = %other, "no local handler, relay only");
            }
        }
        Ok(())
    }

    /// Sends directly when the recipient is in range, otherwise floods.
    async fn transmit(&self, packet: &Packet) -> Result<()> {
        if packet.is_broadcast() {
            self.transport.send_packet(packet, PeerId::BROADCAST).await?;
            return Ok(());
        }
        match self.transport.send_packet(packet, packet.recipient_id).await {
            Err(TransportError::PeerNotFound(_)) => {
                debug!(recipient = %packet.recipient_id, "recipient not in range, flooding");
                self.transport.send_packet(packet, PeerId::BROADCAST).await?;
                Ok(())
            }
            other => Ok(other?),
        }
    }

    fn packet(&self, packet_type: PacketType, recipient_id: PeerId, payload: Vec<u8>) -> Packet {
        let packet = Packet::new(
            packet_type,
            self.local_id,
            recipient_id,
            self.default_ttl,
            payload,
        )
        .signed(&self.network_key);
        // Our own flood coming back through a relay is already known.
        lock(&self.seen).check_and_insert(packet.signing_bytes());
        packet
    }

    /// Acks and receipts identify the node by a UUID form of its peer id.
    fn node_uuid(&self) -> String {
        Uuid::from_bytes(*self.local_id.as_bytes()).to_string()
    }

    fn emit(&self, event: MeshEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Decodes a chat payload that may or may not be padded.
fn decode_chat_payload(payload: &[u8]) -> bitchat_protocol::Result<ChatMessage> {
    ChatMessage::decode(&unpad(payload)).or_else(|_| ChatMessage::decode(payload))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackHub;
    use bitchat_protocol::{KdfParams, MemoryKeychain};

    fn config(nickname: &str) -> Config {
        let mut config = Config::default();
        config.node.nickname = nickname.to_string();
        config.crypto = KdfParams {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
        };
        config
    }

    #[test]
    fn test_decode_chat_payload_padded_and_plain() {
        let message = ChatMessage::new("alice", "hello", "peer1");
        let encoded = message.encode().unwrap();
        let padded = pad_to_optimal(&encoded).unwrap();

        assert_eq!(decode_chat_payload(&encoded).unwrap(), message);
        assert_eq!(decode_chat_payload(&padded).unwrap(), message);
        assert!(decode_chat_payload(b"junk").is_err());
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let hub = LoopbackHub::new();
        let id = PeerId::from_name("alice");
        let mut bad = config("alice");
        bad.mesh.default_ttl = 0;

        let result = MeshService::new(&bad, id, hub.connect(id), MemoryKeychain::new());
        assert!(matches!(
            result,
            Err(ServiceError::Config(ConfigError::InvalidTtl(0)))
        ));
    }

    #[tokio::test]
    async fn test_own_packets_are_echoes() {
        let hub = LoopbackHub::new();
        let id = PeerId::from_name("alice");
        let service =
            MeshService::new(&config("alice"), id, hub.connect(id), MemoryKeychain::new()).unwrap();

        let packet = service.packet(PacketType::BroadcastMessage, PeerId::BROADCAST, vec![]);
        assert_eq!(service.handle_packet(packet).await.unwrap(), Disposition::Echo);
    }

    #[tokio::test]
    async fn test_node_uuid_is_valid() {
        let hub = LoopbackHub::new();
        let id = PeerId::from_name("alice");
        let service =
            MeshService::new(&config("alice"), id, hub.connect(id), MemoryKeychain::new()).unwrap();

        assert!(Uuid::parse_str(&service.node_uuid()).is_ok());
    }

    #[tokio::test]
    async fn test_commands_are_not_sent() {
        let hub = LoopbackHub::new();
        let id = PeerId::from_name("alice");
        let service =
            MeshService::new(&config("alice"), id, hub.connect(id), MemoryKeychain::new()).unwrap();

        assert!(service.send_text("/join #general", None).await.unwrap().is_none());
        assert!(service.with_channels(|c| c.is_joined("#general")));
        assert!(service.send_text("/leave", None).await.unwrap().is_none());
        assert!(!service.with_channels(|c| c.is_joined("#general")));
    }
}
