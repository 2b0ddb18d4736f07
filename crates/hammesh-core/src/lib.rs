//! # hammesh core
//!
//! Protocol stack for a flood-routed LoRa mesh of amateur radio stations.
//! The library is hardware independent: the host supplies a radio driver,
//! a key/value settings store and a monotonic clock, and the mesh does the
//! rest from cooperative tasks.
//!
//! ## Overview
//!
//! - **Packets**: textual L3 frames (`QB<PU5EPX:12,C hello`) protected by
//!   Reed-Solomon FEC and, optionally, AES encryption
//! - **Routing**: flooding with duplicate suppression, loop rejection and
//!   randomized relay delays
//! - **Protocols**: HMAC signing, confirmations, ping, route discovery,
//!   beacons and a replay-resistant remote switch
//! - **Simulation**: several nodes on a virtual channel and clock
//!
//! ## Host loop
//!
//! ```text
//! loop {
//!     wait until net.next_deadline() or a frame arrives
//!     if frame: net.radio_recv(&frame, rssi)
//!     net.tick(now_ms)
//! }
//! ```

pub mod config;
pub mod mesh;
pub mod scheduler;

// Re-export main types
pub use config::{ConfigStore, MemoryStore, NodeSettings};
pub use mesh::{Callsign, MeshConfig, MeshError, MeshResult, Network, Packet, Params};
pub use scheduler::{FnTask, Reschedule, Scheduler, Task};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{keys, ConfigStore, MemoryStore, NodeSettings};
    pub use crate::mesh::simulation::{MeshSimulator, SimConfig, Topology};
    pub use crate::mesh::{
        AppSink, Callsign, MeshConfig, MeshError, Network, Packet, Params, Radio, SwitchTarget,
    };
}
