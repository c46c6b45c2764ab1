//! # bitchat Node Library
//!
//! Service layer that turns the protocol core into a running mesh peer.
//!
//! ## Overview
//!
//! - **Mesh Service**: signs and sends local traffic; verifies,
//!   de-duplicates, dispatches and relays incoming packets
//! - **Transport**: the radio collaborator as a trait, with an in-process
//!   loopback hub for tests
//! - **Seen Set**: rotating duplicate filter for long-running nodes
//! - **Configuration**: TOML file with environment overrides
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bitchat_node::{Config, LoopbackHub, MeshService};
//! use bitchat_protocol::MemoryKeychain;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let local_id = config.peer_id();
//!
//!     let hub = LoopbackHub::new();
//!     let service = MeshService::new(&config, local_id, hub.connect(local_id), MemoryKeychain::new())?;
//!
//!     service.announce().await?;
//!     service.send_text("hello mesh", None).await?;
//!     service.run().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`service`]: Mesh service and events
//! - [`transport`]: Transport trait and loopback implementation
//! - [`seen`]: Rotating seen-packet set

pub mod config;
pub mod seen;
pub mod service;
pub mod transport;

// Re-export protocol for convenience
pub use bitchat_protocol as protocol;

pub use config::{Config, ConfigError};
pub use seen::SeenMessages;
pub use service::{Disposition, MeshEvent, MeshService, ServiceError};
pub use transport::{LoopbackHub, LoopbackTransport, Transport, TransportError};
