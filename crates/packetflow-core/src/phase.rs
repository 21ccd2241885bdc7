//! Lesson and connection phases
//!
//! `LessonPhase` drives what the learner is asked to do next;
//! `ConnPhase` is the per-client handshake/teardown state. Neither can
//! skip states: transitions happen only through the engine.

/// Top-level lesson progression
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LessonPhase {
    /// Drag the whole file, watch it get refused, receive fragments
    Fragmentation,
    /// SYN / SYN-ACK / ACK exchange
    Handshake,
    /// Ordered data delivery with cumulative acks
    Transfer,
    /// FIN / FIN-ACK exchange
    Teardown,
    /// Unreliable frame fan-out
    Broadcast,
    /// Terminal state, nothing left to do
    Complete,
}

impl LessonPhase {
    /// Phases whose timers belong to the reliable-delivery batch
    #[inline]
    pub fn is_reliable(self) -> bool {
        matches!(
            self,
            LessonPhase::Fragmentation
                | LessonPhase::Handshake
                | LessonPhase::Transfer
                | LessonPhase::Teardown
        )
    }
}

impl std::fmt::Display for LessonPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            LessonPhase::Fragmentation => "fragmentation",
            LessonPhase::Handshake => "handshake",
            LessonPhase::Transfer => "transfer",
            LessonPhase::Teardown => "teardown",
            LessonPhase::Broadcast => "broadcast",
            LessonPhase::Complete => "complete",
        };
        write!(f, "{}", label)
    }
}

/// Per-client connection state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum ConnPhase {
    /// No connection (before SYN or after FIN-ACK)
    #[default]
    Closed,
    /// SYN seen, SYN-ACK in flight or awaiting the learner's ACK
    SynReceived,
    /// Handshake done, data accepted
    Established,
    /// FIN seen, FIN-ACK traveling back
    Closing,
}

impl ConnPhase {
    /// Data fragments are only accepted here
    #[inline]
    pub fn accepts_data(self) -> bool {
        matches!(self, ConnPhase::Established)
    }
}

impl std::fmt::Display for ConnPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ConnPhase::Closed => "closed",
            ConnPhase::SynReceived => "syn-received",
            ConnPhase::Established => "established",
            ConnPhase::Closing => "closing",
        };
        write!(f, "{}", label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reliable_phases() {
        assert!(LessonPhase::Fragmentation.is_reliable());
        assert!(LessonPhase::Teardown.is_reliable());
        assert!(!LessonPhase::Broadcast.is_reliable());
        assert!(!LessonPhase::Complete.is_reliable());
    }

    #[test]
    fn test_data_acceptance() {
        assert!(ConnPhase::Established.accepts_data());
        assert!(!ConnPhase::Closed.accepts_data());
        assert!(!ConnPhase::SynReceived.accepts_data());
        assert!(!ConnPhase::Closing.accepts_data());
    }

    #[test]
    fn test_phase_labels() {
        assert_eq!(LessonPhase::Handshake.to_string(), "handshake");
        assert_eq!(ConnPhase::SynReceived.to_string(), "syn-received");
    }
}
