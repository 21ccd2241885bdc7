//! Error types for the packet-flow simulation
//!
//! `SimError` covers driver misuse only: referencing entities or nodes that
//! do not exist, or moves that are mechanically impossible. Protocol-level
//! refusals (wrong destination, out-of-order frames, scripted loss) are
//! never errors; they surface as `EngineEvent`s and the lesson continues.

use thiserror::Error;

use crate::{NodeId, PacketId};

/// Driver misuse errors
#[derive(Error, Debug)]
pub enum SimError {
    #[error("Unknown packet: {0:?}")]
    UnknownPacket(PacketId),

    #[error("Unknown node: {0:?}")]
    UnknownNode(NodeId),

    #[error("Packet {packet:?} is not in slot {node:?}")]
    NotInSlot { packet: PacketId, node: NodeId },

    #[error("Packet {packet:?} is already placed in slot {node:?}")]
    AlreadyPlaced { packet: PacketId, node: NodeId },

    #[error("Slot {node:?} is full (capacity {capacity})")]
    SlotFull { node: NodeId, capacity: usize },

    #[error("Invalid scenario: {0}")]
    InvalidScenario(&'static str),
}

/// Result type for simulation operations
pub type SimResult<T> = Result<T, SimError>;
