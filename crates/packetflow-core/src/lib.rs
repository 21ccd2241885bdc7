//! Packetflow Core - Fundamental types for the packet-flow lesson engine
//!
//! This crate defines the types shared by every part of the simulation:
//! - Identifiers (PacketId, NodeId, ClientId, FileKey)
//! - Virtual time (SimTime)
//! - The packet model (PacketKind, TransitStatus, Packet)
//! - Lesson and connection phases
//! - The engine event stream and rejection taxonomy
//! - Error types for driver misuse

pub mod id;
pub mod time;
pub mod packet;
pub mod phase;
pub mod event;
pub mod error;

pub use id::*;
pub use time::*;
pub use packet::*;
pub use phase::*;
pub use event::*;
pub use error::*;
