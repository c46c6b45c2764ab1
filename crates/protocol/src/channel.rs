//! Channel membership, password protection and ownership.
//!
//! A [`ChannelManager`] holds the channel state of one local node. Each
//! channel is either open or password-protected; a protected channel has a
//! derived key and a public [`KeyCommitment`] that joiners check their
//! password against. Independently the node tracks which channels it has
//! joined and which one is current. Creators publish a
//! [`ChannelAnnouncement`] so other nodes learn the owner and commitment
//! before they ever join.
//!
//! Every failed operation is returned as an error and also appended to the
//! system-message log, so the user-facing history shows it.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::crypto::{
    decrypt_content, decrypt_text, derive_channel_key_with, encrypt_text, ChannelKey, KdfParams,
    KeyCommitment,
};
use crate::error::{ProtocolError, Result};
use crate::keychain::{peer_channel_key_id, Keychain};
use crate::message::ChatMessage;

/// Whether `name` is `#` followed by one or more ASCII letters, digits or
/// underscores.
pub fn is_valid_channel_name(name: &str) -> bool {
    match name.strip_prefix('#') {
        Some(rest) => {
            !rest.is_empty() && rest.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    }
}

fn validate_channel_name(name: &str) -> Result<()> {
    if is_valid_channel_name(name) {
        Ok(())
    } else {
        Err(ProtocolError::InvalidChannelName(name.to_string()))
    }
}

/// Replaces the ciphertext of `message` with its plaintext.
fn decrypt_message(message: &mut ChatMessage, key: &ChannelKey) -> Result<()> {
    let ciphertext = message
        .encrypted_content
        .as_deref()
        .ok_or(ProtocolError::Decryption)?;
    message.content = decrypt_text(ciphertext, key)?;
    message.encrypted_content = None;
    message.is_encrypted = false;
    Ok(())
}

/// Public metadata a channel creator publishes to the mesh.
///
/// Carries the key commitment, never the key or the password, so any peer
/// can check a password locally before trusting the derived key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelAnnouncement {
    /// Channel name, including the leading `#`.
    pub channel: String,
    /// Peer id of the channel owner.
    pub creator_id: String,
    /// Hex key commitment; `None` for an open channel.
    pub key_commitment: Option<String>,
}

impl ChannelAnnouncement {
    /// Serialize to a MessagePack payload.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    /// Deserialize from a MessagePack payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// Whether the announced channel is password protected.
    pub fn is_protected(&self) -> bool {
        self.key_commitment.is_some()
    }

    /// The announced commitment, parsed.
    pub fn commitment(&self) -> Result<Option<KeyCommitment>> {
        self.key_commitment
            .as_deref()
            .map(|hex| {
                KeyCommitment::from_hex(hex)
                    .ok_or_else(|| ProtocolError::invalid("malformed key commitment"))
            })
            .transpose()
    }
}

/// Channel state of one local node.
pub struct ChannelManager<K: Keychain> {
    keychain: K,
    kdf_params: KdfParams,
    known: BTreeSet<String>,
    joined: BTreeSet<String>,
    current: Option<String>,
    protected: BTreeSet<String>,
    keys: HashMap<String, ChannelKey>,
    passwords: HashMap<String, String>,
    commitments: HashMap<String, KeyCommitment>,
    creators: HashMap<String, String>,
    /// Peer ids whose key for a channel sits in the keychain.
    key_holders: HashMap<String, BTreeSet<String>>,
    messages: HashMap<String, Vec<ChatMessage>>,
    /// Encrypted messages received before the key was known.
    pending: HashMap<String, Vec<ChatMessage>>,
    system_messages: Vec<ChatMessage>,
}

impl<K: Keychain> ChannelManager<K> {
    /// Creates a manager with default key derivation parameters.
    pub fn new(keychain: K) -> Self {
        Self::with_kdf_params(keychain, KdfParams::default())
    }

    /// Creates a manager with explicit key derivation parameters.
    pub fn with_kdf_params(keychain: K, kdf_params: KdfParams) -> Self {
        Self {
            keychain,
            kdf_params,
            known: BTreeSet::new(),
            joined: BTreeSet::new(),
            current: None,
            protected: BTreeSet::new(),
            keys: HashMap::new(),
            passwords: HashMap::new(),
            commitments: HashMap::new(),
            creators: HashMap::new(),
            key_holders: HashMap::new(),
            messages: HashMap::new(),
            pending: HashMap::new(),
            system_messages: Vec::new(),
        }
    }

    /// Creates `name`, owned by `creator_id`, protected when a password is
    /// given.
    pub fn create_channel(
        &mut self,
        name: &str,
        password: Option<&str>,
        creator_id: &str,
    ) -> Result<()> {
        let result = self.create_inner(name, password, creator_id);
        self.record(result)
    }

    /// Joins `name` as `peer_id`.
    ///
    /// A protected channel needs the password whose derived key matches the
    /// channel's commitment. Joining an unknown channel with a password
    /// creates it as a protected channel owned by the joiner.
    pub fn join_channel(
        &mut self,
        name: &str,
        password: Option<&str>,
        peer_id: &str,
    ) -> Result<()> {
        let result = self.join_inner(name, password, peer_id);
        self.record(result)
    }

    /// Leaves `name`. The current channel moves to another joined channel,
    /// if any.
    pub fn leave_channel(&mut self, name: &str) -> Result<()> {
        let result = self.leave_inner(name);
        self.record(result)
    }

    /// Handles `/join`, `/j` and `/leave`.
    ///
    /// Returns `Ok(false)` when `text` is not one of these commands.
    pub fn process_command(&mut self, text: &str, peer_id: &str) -> Result<bool> {
        let mut tokens = text.split_whitespace();
        match tokens.next() {
            Some("/join") | Some("/j") => {
                let Some(channel) = tokens.next() else {
                    let result = Err(ProtocolError::InvalidChannelName(String::new()));
                    return self.record(result);
                };
                let password = tokens.next();
                self.join_channel(channel, password, peer_id)?;
                Ok(true)
            }
            Some("/leave") => {
                let target = tokens
                    .next()
                    .map(str::to_string)
                    .or_else(|| self.current.clone());
                let Some(channel) = target else {
                    let result = Err(ProtocolError::invalid("Not in a channel"));
                    return self.record(result);
                };
                self.leave_channel(&channel)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Sets or replaces the password of `name`. Creator only.
    pub fn set_channel_password(
        &mut self,
        name: &str,
        new_password: &str,
        peer_id: &str,
    ) -> Result<()> {
        let result = self.set_password_inner(name, new_password, peer_id);
        self.record(result)
    }

    /// Makes `name` an open channel again. Creator only.
    pub fn remove_channel_password(&mut self, name: &str, peer_id: &str) -> Result<()> {
        let result = self.remove_password_inner(name, peer_id);
        self.record(result)
    }

    /// Hands ownership of `name` to `new_owner_id`. Creator only.
    pub fn transfer_ownership(
        &mut self,
        name: &str,
        new_owner_id: &str,
        peer_id: &str,
    ) -> Result<()> {
        let result = self.transfer_inner(name, new_owner_id, peer_id);
        self.record(result)
    }

    /// Accepts an incoming message.
    ///
    /// Encrypted channel messages are decrypted when the key is known.
    /// Otherwise the channel is marked protected and the message is held
    /// until a successful join. Plain messages pass through untouched.
    pub fn receive_message(&mut self, mut message: ChatMessage) -> Result<ChatMessage> {
        let Some(channel) = message.channel.clone() else {
            return Ok(message);
        };
        self.known.insert(channel.clone());

        if !message.is_encrypted {
            self.retain(&channel, message.clone());
            return Ok(message);
        }

        self.protected.insert(channel.clone());
        let Some(key) = self.keys.get(&channel).cloned() else {
            debug!(channel = %channel, "buffering encrypted message until key is known");
            self.pending
                .entry(channel.clone())
                .or_default()
                .push(message.clone());
            self.notice(format!(
                "Received encrypted message for {channel} without key"
            ));
            return Ok(message);
        };

        match decrypt_message(&mut message, &key) {
            Ok(()) => {
                self.notice(format!("Decrypted message in {channel}"));
                self.retain(&channel, message.clone());
                Ok(message)
            }
            Err(err) => {
                warn!(channel = %channel, "failed to decrypt channel message");
                self.notice(format!("Failed to decrypt message in {channel}"));
                Err(err)
            }
        }
    }

    /// Encrypts the content of a channel message under the channel key.
    ///
    /// The returned message has empty `content` and carries the ciphertext
    /// in `encrypted_content`.
    pub fn encrypt_for_channel(&mut self, message: ChatMessage) -> Result<ChatMessage> {
        let result = self.encrypt_inner(message);
        self.record(result)
    }

    /// Records what a peer announced about `name`: its owner and, for a
    /// protected channel, the key commitment joiners must match.
    ///
    /// A new commitment that the local key does not satisfy means the
    /// password changed; the stale key is dropped until the next join.
    /// `None` marks the channel open.
    pub fn learn_channel(
        &mut self,
        name: &str,
        creator_id: &str,
        commitment: Option<KeyCommitment>,
    ) -> Result<()> {
        let result = self.learn_inner(name, creator_id, commitment);
        self.record(result)
    }

    /// Applies a received [`ChannelAnnouncement`].
    pub fn apply_announcement(&mut self, announcement: &ChannelAnnouncement) -> Result<()> {
        let result = announcement.commitment();
        let commitment = self.record(result)?;
        self.learn_channel(&announcement.channel, &announcement.creator_id, commitment)
    }

    /// The announcement describing `name`, once it has an owner.
    pub fn channel_announcement(&self, name: &str) -> Option<ChannelAnnouncement> {
        let creator_id = self.creators.get(name)?;
        Some(ChannelAnnouncement {
            channel: name.to_string(),
            creator_id: creator_id.clone(),
            key_commitment: self.commitments.get(name).map(KeyCommitment::to_hex),
        })
    }

    /// Channels this node has joined, in name order.
    pub fn joined_channels(&self) -> &BTreeSet<String> {
        &self.joined
    }

    /// Whether this node has joined `name`.
    pub fn is_joined(&self, name: &str) -> bool {
        self.joined.contains(name)
    }

    /// The current channel, if any.
    pub fn current_channel(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Whether `name` is known to be password protected.
    pub fn is_password_protected(&self, name: &str) -> bool {
        self.protected.contains(name)
    }

    /// The key of `name`, if known.
    pub fn channel_key(&self, name: &str) -> Option<&ChannelKey> {
        self.keys.get(name)
    }

    /// The password of `name`, if known.
    pub fn channel_password(&self, name: &str) -> Option<&str> {
        self.passwords.get(name).map(String::as_str)
    }

    /// The creator of `name`, if known.
    pub fn channel_creator(&self, name: &str) -> Option<&str> {
        self.creators.get(name).map(String::as_str)
    }

    /// The key commitment of `name`, if known.
    pub fn key_commitment(&self, name: &str) -> Option<&KeyCommitment> {
        self.commitments.get(name)
    }

    /// Messages received in `name`, oldest first.
    pub fn channel_messages(&self, name: &str) -> &[ChatMessage] {
        self.messages.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Locally generated notices, oldest first.
    pub fn get_system_messages(&self) -> &[ChatMessage] {
        &self.system_messages
    }

    /// The injected keychain.
    pub fn keychain(&self) -> &K {
        &self.keychain
    }

    fn create_inner(&mut self, name: &str, password: Option<&str>, creator_id: &str) -> Result<()> {
        validate_channel_name(name)?;
        if let Some(existing) = self.creators.get(name) {
            if existing != creator_id {
                return Err(ProtocolError::invalid(format!(
                    "Channel {name} already exists"
                )));
            }
        }

        let key = password
            .map(|password| derive_channel_key_with(&self.kdf_params, password, name))
            .transpose()?;
        self.install_channel(name, password.zip(key), creator_id)
    }

    fn install_channel(
        &mut self,
        name: &str,
        protection: Option<(&str, ChannelKey)>,
        creator_id: &str,
    ) -> Result<()> {
        let protected = protection.is_some();
        if let Some((password, key)) = protection {
            self.store_key(creator_id, name, &key)?;
            self.commitments.insert(name.to_string(), key.commitment());
            self.keys.insert(name.to_string(), key);
            self.passwords.insert(name.to_string(), password.to_string());
            self.protected.insert(name.to_string());
        }
        self.known.insert(name.to_string());
        self.creators
            .insert(name.to_string(), creator_id.to_string());

        info!(channel = %name, protected, "created channel");
        self.notice(format!("Created channel {name}"));
        Ok(())
    }

    fn join_inner(&mut self, name: &str, password: Option<&str>, peer_id: &str) -> Result<()> {
        validate_channel_name(name)?;

        if !self.known.contains(name) {
            match password {
                Some(password) => {
                    let key = derive_channel_key_with(&self.kdf_params, password, name)?;
                    self.install_channel(name, Some((password, key)), peer_id)?;
                    self.finish_join(name);
                    return Ok(());
                }
                None => {
                    self.known.insert(name.to_string());
                }
            }
        }

        if self.protected.contains(name) {
            let password =
                password.ok_or_else(|| ProtocolError::PasswordRequired(name.to_string()))?;
            let candidate = derive_channel_key_with(&self.kdf_params, password, name)?;

            match self.commitments.get(name).copied() {
                Some(commitment) => {
                    if !commitment.verify(&candidate) {
                        warn!(channel = %name, "key commitment mismatch");
                        return Err(ProtocolError::KeyCommitment(name.to_string()));
                    }
                }
                None => {
                    // Only ciphertext has been seen; the key must open it.
                    if !self.pending_opens_with(name, &candidate) {
                        warn!(channel = %name, "password does not decrypt buffered messages");
                        return Err(ProtocolError::KeyCommitment(name.to_string()));
                    }
                    self.commitments
                        .insert(name.to_string(), candidate.commitment());
                }
            }

            self.store_key(peer_id, name, &candidate)?;
            self.keys.insert(name.to_string(), candidate);
            self.passwords.insert(name.to_string(), password.to_string());
        }

        self.finish_join(name);
        Ok(())
    }

    fn finish_join(&mut self, name: &str) {
        self.joined.insert(name.to_string());
        self.current = Some(name.to_string());
        info!(channel = %name, "joined channel");
        self.notice(format!("Joined {name} successfully"));

        self.decrypt_pending(name);
    }

    fn learn_inner(
        &mut self,
        name: &str,
        creator_id: &str,
        commitment: Option<KeyCommitment>,
    ) -> Result<()> {
        validate_channel_name(name)?;
        if creator_id.is_empty() {
            return Err(ProtocolError::invalid("creator_id cannot be empty"));
        }

        self.known.insert(name.to_string());
        self.creators
            .insert(name.to_string(), creator_id.to_string());

        match commitment {
            Some(commitment) => {
                let stale = self
                    .keys
                    .get(name)
                    .is_some_and(|key| !commitment.verify(key));
                if stale {
                    self.keys.remove(name);
                    self.passwords.remove(name);
                    self.forget_keys(name)?;
                    self.notice(format!("Password changed for {name}"));
                }
                self.commitments.insert(name.to_string(), commitment);
                self.protected.insert(name.to_string());
            }
            None => {
                if self.protected.remove(name) {
                    self.notice(format!("Password removed from {name}"));
                }
                self.keys.remove(name);
                self.passwords.remove(name);
                self.commitments.remove(name);
                self.forget_keys(name)?;
            }
        }

        debug!(channel = %name, creator = %creator_id, "learned channel metadata");
        Ok(())
    }

    fn leave_inner(&mut self, name: &str) -> Result<()> {
        validate_channel_name(name)?;
        if !self.joined.remove(name) {
            return Err(ProtocolError::invalid(format!("Not a member of {name}")));
        }
        if self.current.as_deref() == Some(name) {
            self.current = self.joined.iter().next().cloned();
        }
        info!(channel = %name, "left channel");
        self.notice(format!("Left {name}"));
        Ok(())
    }

    fn set_password_inner(&mut self, name: &str, new_password: &str, peer_id: &str) -> Result<()> {
        self.require_creator(name, peer_id, "set password for")?;

        let key = derive_channel_key_with(&self.kdf_params, new_password, name)?;
        self.forget_keys(name)?;
        self.store_key(peer_id, name, &key)?;
        self.commitments.insert(name.to_string(), key.commitment());
        self.keys.insert(name.to_string(), key);
        self.passwords
            .insert(name.to_string(), new_password.to_string());
        self.protected.insert(name.to_string());

        info!(channel = %name, "channel password set");
        self.notice(format!("Password set for {name}"));
        Ok(())
    }

    fn remove_password_inner(&mut self, name: &str, peer_id: &str) -> Result<()> {
        self.require_creator(name, peer_id, "remove password for")?;

        self.forget_keys(name)?;
        self.keys.remove(name);
        self.passwords.remove(name);
        self.commitments.remove(name);
        self.protected.remove(name);

        info!(channel = %name, "channel password removed");
        self.notice(format!("Password removed from {name}"));
        Ok(())
    }

    fn transfer_inner(&mut self, name: &str, new_owner_id: &str, peer_id: &str) -> Result<()> {
        self.require_creator(name, peer_id, "transfer ownership of")?;
        if new_owner_id.is_empty() {
            return Err(ProtocolError::invalid("new_owner_id cannot be empty"));
        }

        self.creators
            .insert(name.to_string(), new_owner_id.to_string());
        info!(channel = %name, new_owner = %new_owner_id, "channel ownership transferred");
        self.notice(format!("Ownership of {name} transferred to {new_owner_id}"));
        Ok(())
    }

    fn encrypt_inner(&mut self, mut message: ChatMessage) -> Result<ChatMessage> {
        let channel = message
            .channel
            .clone()
            .ok_or_else(|| ProtocolError::invalid("message has no channel"))?;
        let key = self
            .keys
            .get(&channel)
            .ok_or(ProtocolError::MissingChannelKey(channel))?;

        message.encrypted_content = Some(encrypt_text(&message.content, key)?);
        message.content.clear();
        message.is_encrypted = true;
        Ok(message)
    }

    fn require_creator(&self, name: &str, peer_id: &str, action: &'static str) -> Result<()> {
        if !self.known.contains(name) {
            return Err(ProtocolError::ChannelNotFound(name.to_string()));
        }
        if self.creators.get(name).map(String::as_str) != Some(peer_id) {
            warn!(channel = %name, peer = %peer_id, action, "rejected non-creator");
            return Err(ProtocolError::PermissionDenied {
                action,
                channel: name.to_string(),
            });
        }
        Ok(())
    }

    fn pending_opens_with(&self, name: &str, key: &ChannelKey) -> bool {
        self.pending.get(name).is_some_and(|messages| {
            messages.iter().any(|message| {
                message
                    .encrypted_content
                    .as_deref()
                    .is_some_and(|ciphertext| decrypt_content(ciphertext, key).is_ok())
            })
        })
    }

    fn decrypt_pending(&mut self, name: &str) {
        let Some(key) = self.keys.get(name).cloned() else {
            return;
        };
        let Some(buffered) = self.pending.remove(name) else {
            return;
        };

        let mut undecryptable = Vec::new();
        for mut message in buffered {
            match decrypt_message(&mut message, &key) {
                Ok(()) => {
                    self.notice(format!("Decrypted message in {name}"));
                    self.retain(name, message);
                }
                Err(_) => undecryptable.push(message),
            }
        }
        if !undecryptable.is_empty() {
            debug!(channel = %name, count = undecryptable.len(), "messages remain undecryptable");
            self.pending.insert(name.to_string(), undecryptable);
        }
    }

    fn store_key(&mut self, peer_id: &str, name: &str, key: &ChannelKey) -> Result<()> {
        self.keychain
            .store_key(&peer_channel_key_id(peer_id, name), key.as_bytes())?;
        self.key_holders
            .entry(name.to_string())
            .or_default()
            .insert(peer_id.to_string());
        Ok(())
    }

    /// Deletes every keychain entry held for `name`.
    fn forget_keys(&mut self, name: &str) -> Result<()> {
        if let Some(holders) = self.key_holders.remove(name) {
            for peer_id in holders {
                self.keychain
                    .delete_key(&peer_channel_key_id(&peer_id, name))?;
            }
        }
        Ok(())
    }

    fn retain(&mut self, channel: &str, message: ChatMessage) {
        self.messages
            .entry(channel.to_string())
            .or_default()
            .push(message);
    }

    fn notice(&mut self, text: String) {
        self.system_messages.push(ChatMessage::system(text));
    }

    /// Mirrors a failure into the system-message log.
    fn record<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.notice(err.to_string());
        }
        result
    }
}
