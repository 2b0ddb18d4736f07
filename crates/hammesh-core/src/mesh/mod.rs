//! Flood-routed mesh for amateur radio
//!
//! Stations are identified by callsign and every repeater relays every packet
//! it has not seen before. The stack is split into loose layers:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │ L7  Applications       ping · route request · switch · (beacon task)    │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │ L4  Transports         HMAC signing/verification · confirmation         │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │     Routing engine     dedup · loop rejection · peer tables · relaying  │
//! │     (Network)          modifiers rewrite relayed packets (R, RREQ)      │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │ L3  Packet             TO<FROM:IDENT,PARAMS MESSAGE                     │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │ L2  Frame              [encryption] + Reed-Solomon parity               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │     Radio trait        transmit · bits per second                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use hammesh_core::config::{keys, MemoryStore};
//! use hammesh_core::mesh::{Callsign, MeshConfig, Network, NullSink, Params, Radio};
//!
//! struct Loopback;
//!
//! impl Radio for Loopback {
//!     fn start_receive(&mut self) {}
//!     fn transmit(&mut self, _frame: &[u8]) -> bool { true }
//!     fn bits_per_second(&self) -> u32 { 1200 }
//! }
//!
//! let store = MemoryStore::new().with(keys::CALLSIGN, "PU5EPX");
//! let mut net = Network::new(
//!     Box::new(Loopback),
//!     Box::new(store),
//!     Box::new(NullSink),
//!     MeshConfig::default(),
//!     0,
//! )
//! .with_builtins(None);
//!
//! let id = net.send(Callsign::broadcast(), Params::new(), "hello").unwrap();
//! assert_eq!(id, 1);
//! net.tick(0); // routes the packet
//! net.tick(50); // transmits it
//! assert_eq!(net.stats().tx_frames, 1);
//! ```

pub mod callsign;
pub mod crypto;
pub mod fec;
pub mod neighbor;
pub mod network;
pub mod packet;
pub mod params;
pub mod protocols;
pub mod routing;
pub mod simulation;
pub mod traits;

// Re-export main types
pub use callsign::Callsign;
pub use crypto::{CipherKey, CryptoError, KeyCache};
pub use fec::FecError;
pub use neighbor::{PeerEntry, PeerTable};
pub use network::Network;
pub use packet::{Packet, PacketError, Signature};
pub use params::Params;
pub use routing::ReceiveLog;
pub use traits::{
    AppSink, Application, MeshConfig, MeshError, MeshResult, MeshStats, Modifier, NullSink,
    ProtocolContext, Radio, Reply, SwitchTarget, Transport, TransportRx,
};
