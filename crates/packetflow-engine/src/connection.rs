//! Per-client reliable-delivery state machine
//!
//! Pure state, no timers and no entities: the engine feeds it arrivals and
//! it answers with outcomes.
//!
//! - only the smallest missing sequence is deliverable; later sequences are
//!   buffered (head-of-line blocking), earlier ones are duplicates
//! - the cumulative ack is always the smallest missing sequence
//! - every event that leaves the ack unchanged counts as a duplicate ack;
//!   at the threshold a one-shot retransmit signal fires and stays latched
//!   until the ack advances
//! - handshake and teardown transitions cannot skip states

use std::collections::BTreeSet;

use packetflow_core::{ClientId, ConnPhase};

/// How a data arrival was classified
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DataOutcome {
    /// In order; `flushed` lists buffered sequences released by the gap fill
    Delivered { flushed: Vec<u32> },
    /// Out of order, held until the gap fills
    Buffered,
    /// Sequence already received or already buffered; nothing stored
    Duplicate,
}

/// Result of feeding one data arrival to the machine
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataEvent {
    pub outcome: DataOutcome,
    /// Cumulative ack after this event
    pub ack: u32,
    /// Sequence to resend, set at most once per stalled ack value
    pub retransmit: Option<u32>,
}

/// One client's connection
#[derive(Clone, Debug)]
pub struct Connection {
    pub client: ClientId,
    phase: ConnPhase,
    /// Fragments the file splits into; sequences run 1..=total
    total: u32,
    received: BTreeSet<u32>,
    buffered: BTreeSet<u32>,
    dup_acks: u32,
    last_ack: Option<u32>,
    /// Ack value the one-shot signal already fired for
    signaled_ack: Option<u32>,
    retransmit_allowed: bool,
    dup_ack_threshold: u32,
}

impl Connection {
    pub fn new(client: ClientId, total: u32, dup_ack_threshold: u32) -> Self {
        Connection {
            client,
            phase: ConnPhase::Closed,
            total,
            received: BTreeSet::new(),
            buffered: BTreeSet::new(),
            dup_acks: 0,
            last_ack: None,
            signaled_ack: None,
            retransmit_allowed: false,
            dup_ack_threshold,
        }
    }

    #[inline]
    pub fn phase(&self) -> ConnPhase {
        self.phase
    }

    #[inline]
    pub fn total(&self) -> u32 {
        self.total
    }

    /// Smallest sequence not yet received; `total + 1` once all arrived
    pub fn expected_seq(&self) -> u32 {
        (1..=self.total)
            .find(|s| !self.received.contains(s))
            .unwrap_or(self.total + 1)
    }

    /// Cumulative ack: all sequences before this one have been received
    #[inline]
    pub fn ack_number(&self) -> u32 {
        self.expected_seq()
    }

    pub fn received_count(&self) -> u32 {
        self.received.len() as u32
    }

    pub fn buffered_count(&self) -> u32 {
        self.buffered.len() as u32
    }

    pub fn buffered_seqs(&self) -> Vec<u32> {
        self.buffered.iter().copied().collect()
    }

    #[inline]
    pub fn dup_acks(&self) -> u32 {
        self.dup_acks
    }

    #[inline]
    pub fn retransmit_allowed(&self) -> bool {
        self.retransmit_allowed
    }

    /// Sequence the signal fired for, while it is still missing
    pub fn pending_retransmit(&self) -> Option<u32> {
        self.signaled_ack.filter(|s| !self.received.contains(s))
    }

    pub fn is_complete(&self) -> bool {
        self.received.len() as u32 == self.total
    }

    // Handshake and teardown. Each transition is valid from exactly one
    // state; anything else is refused and left unchanged.

    pub fn open(&mut self) -> bool {
        if self.phase == ConnPhase::Closed {
            self.phase = ConnPhase::SynReceived;
            true
        } else {
            false
        }
    }

    pub fn establish(&mut self) -> bool {
        if self.phase == ConnPhase::SynReceived {
            self.phase = ConnPhase::Established;
            self.received.clear();
            self.buffered.clear();
            self.dup_acks = 0;
            self.last_ack = None;
            self.signaled_ack = None;
            true
        } else {
            false
        }
    }

    pub fn begin_close(&mut self) -> bool {
        if self.phase == ConnPhase::Established {
            self.phase = ConnPhase::Closing;
            true
        } else {
            false
        }
    }

    pub fn close(&mut self) -> bool {
        if self.phase == ConnPhase::Closing {
            self.phase = ConnPhase::Closed;
            true
        } else {
            false
        }
    }

    /// Feed one data arrival. Caller must have checked the phase accepts
    /// data.
    pub fn on_data(&mut self, seq: u32) -> DataEvent {
        debug_assert!(self.phase.accepts_data());
        debug_assert!(seq >= 1 && seq <= self.total);

        let expected = self.expected_seq();

        let outcome = if self.received.contains(&seq) || self.buffered.contains(&seq) {
            DataOutcome::Duplicate
        } else if seq == expected {
            self.received.insert(seq);
            let flushed = self.flush_run();
            DataOutcome::Delivered { flushed }
        } else {
            self.buffered.insert(seq);
            DataOutcome::Buffered
        };

        let ack = self.ack_number();
        let retransmit = self.note_ack(ack);
        DataEvent {
            outcome,
            ack,
            retransmit,
        }
    }

    /// Re-check the reorder buffer for a flushable run. Normally a no-op
    /// because gap fills flush immediately in `on_data`.
    pub fn flush_buffered(&mut self) -> Option<DataEvent> {
        let flushed = self.flush_run();
        if flushed.is_empty() {
            return None;
        }
        let ack = self.ack_number();
        let retransmit = self.note_ack(ack);
        Some(DataEvent {
            outcome: DataOutcome::Delivered { flushed },
            ack,
            retransmit,
        })
    }

    /// Move the contiguous buffered run starting at the expected sequence
    /// into `received`. Returns the released sequences in order.
    fn flush_run(&mut self) -> Vec<u32> {
        let mut flushed = Vec::new();
        loop {
            let next = self.expected_seq();
            if self.buffered.remove(&next) {
                self.received.insert(next);
                flushed.push(next);
            } else {
                break;
            }
        }
        flushed
    }

    /// Track the ack an event produced. An unchanged ack is a duplicate;
    /// at the threshold the one-shot signal fires and unlocks retransmit.
    fn note_ack(&mut self, ack: u32) -> Option<u32> {
        match self.last_ack {
            Some(prev) if prev == ack => {
                self.dup_acks += 1;
                if self.dup_acks >= self.dup_ack_threshold && self.signaled_ack != Some(ack) {
                    self.signaled_ack = Some(ack);
                    self.retransmit_allowed = true;
                    return Some(ack);
                }
                None
            }
            _ => {
                self.last_ack = Some(ack);
                self.dup_acks = 0;
                self.signaled_ack = None;
                None
            }
        }
    }
}
