//! Transport collaborator for moving packets between peers.
//!
//! The mesh service only needs four things from the radio layer: send a
//! packet, receive the next packet, list nearby peers and advertise itself.
//! [`LoopbackHub`] provides an in-process implementation that carries
//! encoded bytes between [`LoopbackTransport`]s, used by tests and local
//! experiments.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

use bitchat_protocol::{Packet, PeerId};
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors raised by a transport.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),

    #[error("Transport closed")]
    Closed,

    #[error("Transport error: {0}")]
    Other(String),
}

/// A radio or in-process link to nearby peers.
///
/// Futures are boxed so transports can be held as trait objects and the
/// service's futures stay `Send`.
pub trait Transport: Send + Sync {
    /// Sends `packet` to `destination`, or to every peer for
    /// [`PeerId::BROADCAST`].
    fn send_packet<'a>(
        &'a self,
        packet: &'a Packet,
        destination: PeerId,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>>;

    /// Waits for the next packet. `None` once the transport is closed.
    fn receive_packet<'a>(&'a self) -> Pin<Box<dyn Future<Output = Option<Packet>> + Send + 'a>>;

    /// Identifiers of the peers currently in range.
    fn scan_peers<'a>(&'a self) -> Pin<Box<dyn Future<Output = Vec<String>> + Send + 'a>>;

    /// Makes `local_id` discoverable to nearby peers.
    fn start_advertising<'a>(
        &'a self,
        local_id: PeerId,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send_packet<'a>(
        &'a self,
        packet: &'a Packet,
        destination: PeerId,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>> {
        (**self).send_packet(packet, destination)
    }

    fn receive_packet<'a>(&'a self) -> Pin<Box<dyn Future<Output = Option<Packet>> + Send + 'a>> {
        (**self).receive_packet()
    }

    fn scan_peers<'a>(&'a self) -> Pin<Box<dyn Future<Output = Vec<String>> + Send + 'a>> {
        (**self).scan_peers()
    }

    fn start_advertising<'a>(
        &'a self,
        local_id: PeerId,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>> {
        (**self).start_advertising(local_id)
    }
}

#[derive(Default)]
struct HubState {
    links: HashMap<PeerId, mpsc::UnboundedSender<Vec<u8>>>,
    advertising: HashSet<PeerId>,
}

/// In-process medium connecting [`LoopbackTransport`]s.
///
/// Every connected peer is in range of every other.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
}

impl LoopbackHub {
    /// Creates an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches `peer` and returns its transport. Reconnecting replaces the
    /// previous link.
    pub fn connect(&self, peer: PeerId) -> LoopbackTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().links.insert(peer, tx);
        tracing::debug!(peer = %peer, "loopback peer connected");
        LoopbackTransport {
            local_id: peer,
            hub: self.clone(),
            inbox: tokio::sync::Mutex::new(rx),
        }
    }

    /// Detaches `peer`. Its transport yields `None` once drained.
    pub fn disconnect(&self, peer: PeerId) {
        let mut state = self.lock();
        state.links.remove(&peer);
        state.advertising.remove(&peer);
    }

    /// Delivers raw bytes to `peer` as if received over the air.
    pub fn inject(&self, peer: PeerId, bytes: Vec<u8>) -> Result<(), TransportError> {
        let state = self.lock();
        let link = state
            .links
            .get(&peer)
            .ok_or(TransportError::PeerNotFound(peer))?;
        link.send(bytes).map_err(|_| TransportError::Closed)
    }

    /// Peers currently attached.
    pub fn peers(&self) -> Vec<PeerId> {
        self.lock().links.keys().copied().collect()
    }

    fn deliver(&self, from: PeerId, destination: PeerId, bytes: Vec<u8>) -> Result<(), TransportError> {
        let state = self.lock();
        if destination.is_broadcast() {
            for (peer, link) in &state.links {
                if *peer != from {
                    // A peer that went away mid-broadcast is not an error.
                    let _ = link.send(bytes.clone());
                }
            }
            return Ok(());
        }

        let link = state
            .links
            .get(&destination)
            .ok_or(TransportError::PeerNotFound(destination))?;
        link.send(bytes).map_err(|_| TransportError::Closed)
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        // State is plain maps; recover it if a holder panicked.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One peer's end of a [`LoopbackHub`].
pub struct LoopbackTransport {
    local_id: PeerId,
    hub: LoopbackHub,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl LoopbackTransport {
    /// The peer this transport belongs to.
    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    async fn next_packet(&self) -> Option<Packet> {
        let mut inbox = self.inbox.lock().await;
        loop {
            let bytes = inbox.recv().await?;
            match Packet::decode(&bytes) {
                Some(packet) => return Some(packet),
                None => {
                    tracing::debug!(
                        peer = %self.local_id,
                        len = bytes.len(),
                        "dropping undecodable frame"
                    );
                }
            }
        }
    }
}

impl Transport for LoopbackTransport {
    fn send_packet<'a>(
        &'a self,
        packet: &'a Packet,
        destination: PeerId,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>> {
        Box::pin(async move {
            self.hub
                .deliver(self.local_id, destination, packet.encode())
        })
    }

    fn receive_packet<'a>(&'a self) -> Pin<Box<dyn Future<Output = Option<Packet>> + Send + 'a>> {
        Box::pin(self.next_packet())
    }

    fn scan_peers<'a>(&'a self) -> Pin<Box<dyn Future<Output = Vec<String>> + Send + 'a>> {
        Box::pin(async move {
            let state = self.hub.lock();
            let mut peers: Vec<String> = state
                .advertising
                .iter()
                .filter(|peer| **peer != self.local_id)
                .map(PeerId::to_hex)
                .collect();
            peers.sort();
            peers
        })
    }

    fn start_advertising<'a>(
        &'a self,
        local_id: PeerId,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.hub.lock();
            if !state.links.contains_key(&local_id) {
                return Err(TransportError::PeerNotFound(local_id));
            }
            state.advertising.insert(local_id);
            Ok(())
        })
    }
}
