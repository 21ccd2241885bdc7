//! Engine event stream
//!
//! Everything the UI needs to render comes out of the engine as events:
//! entity status changes, phase transitions, protocol signals, and the
//! one-shot lesson-complete marker. Protocol outcomes (rejections,
//! buffering, scripted loss) are events, not errors: they are part of the
//! lesson, and the simulation always continues past them.

use crate::{ClientId, ConnPhase, FileKey, LessonPhase, PacketId, TransitStatus};

/// One entity status change, annotated with protocol numbers where relevant
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatusUpdate {
    pub id: PacketId,
    pub status: TransitStatus,
    /// Sequence number of the fragment (or frame number), if any
    pub seq: Option<u32>,
    /// Cumulative ack produced by this event, for receiver-side data events
    pub ack: Option<u32>,
}

impl StatusUpdate {
    pub fn new(id: PacketId, status: TransitStatus) -> Self {
        StatusUpdate {
            id,
            status,
            seq: None,
            ack: None,
        }
    }

    pub fn with_seq(mut self, seq: u32) -> Self {
        self.seq = Some(seq);
        self
    }

    pub fn with_ack(mut self, ack: u32) -> Self {
        self.ack = Some(ack);
        self
    }
}

/// Why a placement was refused
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
    /// Placed on a node that this packet may not target
    WrongDestination,
    /// Kind not accepted in the current phase (e.g. data before handshake)
    WrongPhase,
    /// Whole file exceeds the MTU and must be fragmented first
    PayloadTooLarge,
    /// Broadcast frame sent out of strict order
    OutOfOrderFrame { sent: u32, expected: u32 },
    /// Connection already torn down
    ConnectionClosed,
    /// Action impossible from the current connection state
    InvalidTransition,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::WrongDestination => write!(f, "wrong destination"),
            RejectReason::WrongPhase => write!(f, "not accepted in this phase"),
            RejectReason::PayloadTooLarge => write!(f, "payload exceeds MTU"),
            RejectReason::OutOfOrderFrame { sent, expected } => {
                write!(f, "frame {} sent, frame {} expected", sent, expected)
            }
            RejectReason::ConnectionClosed => write!(f, "connection is closed"),
            RejectReason::InvalidTransition => write!(f, "invalid transition"),
        }
    }
}

/// Events drained from the engine after each `advance`
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineEvent {
    /// An entity changed lifecycle status
    StatusChanged(StatusUpdate),
    /// Lesson moved to a new phase
    PhaseChanged { from: LessonPhase, to: LessonPhase },
    /// A connection moved to a new state
    ConnectionPhase {
        client: ClientId,
        from: ConnPhase,
        to: ConnPhase,
    },
    /// Three duplicate acks: the named sequence must be resent
    RetransmitNeeded { client: ClientId, seq: u32 },
    /// Scripted loss consumed an in-flight fragment
    SimulatedLoss { id: PacketId, seq: u32 },
    /// Every fragment of the file has been received and assembled
    FileComplete { file: FileKey },
    /// One broadcast frame fanned out to its receivers
    FrameDelivered {
        number: u32,
        delivered: Vec<ClientId>,
        missed: Vec<ClientId>,
    },
    /// A placement was refused and the entity will bounce back
    Rejected { id: PacketId, reason: RejectReason },
    /// Terminal one-shot: the whole lesson is done
    LessonComplete,
}
