//! Packet model
//!
//! Every draggable entity in a lesson is a `Packet`. Control packets carry
//! no payload; data fragments carry an MTU-sized slice of the file payload;
//! broadcast frames carry their frame payload. A packet is owned by exactly
//! one node slot at a time (or held by the driver mid-drag) and is destroyed
//! once the protocol consumes it.

use bytes::Bytes;

use crate::{FileKey, PacketId};

/// Packet kind - determines how an arrival is interpreted
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PacketKind {
    /// Whole un-fragmented file, larger than the MTU
    File,
    /// Connection request (learner-sent)
    Syn,
    /// Connection grant (engine response)
    SynAck,
    /// Handshake completion (learner-sent)
    Ack,
    /// One MTU-sized fragment of the file
    Data,
    /// Teardown request (learner-sent)
    Fin,
    /// Teardown grant (engine response)
    FinAck,
    /// Broadcast frame (unreliable phase)
    Frame,
}

impl PacketKind {
    /// Control packets carry no sequence number and no payload
    #[inline]
    pub fn is_control(self) -> bool {
        matches!(
            self,
            PacketKind::Syn
                | PacketKind::SynAck
                | PacketKind::Ack
                | PacketKind::Fin
                | PacketKind::FinAck
        )
    }

    /// Responses the engine emits on its own (never seeded as draggable)
    #[inline]
    pub fn is_response(self) -> bool {
        matches!(self, PacketKind::SynAck | PacketKind::FinAck)
    }
}

impl std::fmt::Display for PacketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            PacketKind::File => "FILE",
            PacketKind::Syn => "SYN",
            PacketKind::SynAck => "SYN-ACK",
            PacketKind::Ack => "ACK",
            PacketKind::Data => "DATA",
            PacketKind::Fin => "FIN",
            PacketKind::FinAck => "FIN-ACK",
            PacketKind::Frame => "FRAME",
        };
        write!(f, "{}", label)
    }
}

/// Where a packet is in its lifecycle, as shown to the learner
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransitStatus {
    /// Sitting in a slot, ready to be dragged
    Ready,
    /// Picked up by the driver, not in any slot
    Held,
    /// Traveling across the wire
    InFlight,
    /// Refused at its destination, about to bounce back
    Rejected,
    /// Dropped in transit (scripted loss)
    Lost,
    /// Arrived out of order, waiting for the gap to fill
    Buffered,
    /// Accepted in order at the receiver
    Delivered,
    /// Absorbed by the protocol; the entity is gone
    Consumed,
}

impl std::fmt::Display for TransitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TransitStatus::Ready => "ready",
            TransitStatus::Held => "held",
            TransitStatus::InFlight => "in-flight",
            TransitStatus::Rejected => "rejected",
            TransitStatus::Lost => "lost",
            TransitStatus::Buffered => "buffered",
            TransitStatus::Delivered => "delivered",
            TransitStatus::Consumed => "consumed",
        };
        write!(f, "{}", label)
    }
}

/// A draggable entity in the lesson
#[derive(Clone, Debug)]
pub struct Packet {
    /// Entity identity
    pub id: PacketId,
    /// Kind, fixed at creation
    pub kind: PacketKind,
    /// Sequence number for data fragments, frame number for frames
    pub seq: Option<u32>,
    /// File this packet belongs to
    pub file: FileKey,
    /// Payload bytes (empty for control packets)
    pub payload: Bytes,
    /// Lifecycle status
    pub status: TransitStatus,
}

impl Packet {
    /// Whole un-fragmented file entity
    pub fn file(id: PacketId, file: FileKey, payload: Bytes) -> Self {
        Packet {
            id,
            kind: PacketKind::File,
            seq: None,
            file,
            payload,
            status: TransitStatus::Ready,
        }
    }

    /// One MTU-sized data fragment
    pub fn data(id: PacketId, file: FileKey, seq: u32, payload: Bytes) -> Self {
        Packet {
            id,
            kind: PacketKind::Data,
            seq: Some(seq),
            file,
            payload,
            status: TransitStatus::Ready,
        }
    }

    /// Control packet (SYN, SYN-ACK, ACK, FIN, FIN-ACK)
    pub fn control(id: PacketId, kind: PacketKind, file: FileKey) -> Self {
        debug_assert!(kind.is_control());
        Packet {
            id,
            kind,
            seq: None,
            file,
            payload: Bytes::new(),
            status: TransitStatus::Ready,
        }
    }

    /// Broadcast frame
    pub fn frame(id: PacketId, file: FileKey, number: u32, payload: Bytes) -> Self {
        Packet {
            id,
            kind: PacketKind::Frame,
            seq: Some(number),
            file,
            payload,
            status: TransitStatus::Ready,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_predicates() {
        assert!(PacketKind::Syn.is_control());
        assert!(PacketKind::FinAck.is_control());
        assert!(!PacketKind::Data.is_control());
        assert!(!PacketKind::Frame.is_control());

        assert!(PacketKind::SynAck.is_response());
        assert!(!PacketKind::Ack.is_response());
    }

    #[test]
    fn test_data_fragment_carries_seq() {
        let p = Packet::data(PacketId::new(1), FileKey::new(1), 3, Bytes::from_static(b"abcd"));
        assert_eq!(p.seq, Some(3));
        assert_eq!(p.status, TransitStatus::Ready);
        assert_eq!(p.payload.len(), 4);
    }

    #[test]
    fn test_control_packet_empty_payload() {
        let p = Packet::control(PacketId::new(2), PacketKind::Syn, FileKey::new(1));
        assert!(p.payload.is_empty());
        assert_eq!(p.seq, None);
    }
}
