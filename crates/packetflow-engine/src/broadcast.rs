//! Unreliable broadcast
//!
//! Frames go out in strict order, fan out to every client after one
//! propagation delay, and are never acknowledged, retried, or buffered.
//! Which client gets which frame is decided up front by a static delivery
//! matrix, either written out row by row or derived from a seed so the
//! same seed always produces the same losses.

use packetflow_core::ClientId;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Precomputed per-frame, per-client delivery outcomes
#[derive(Clone, Debug)]
pub struct DeliveryMatrix {
    clients: Vec<ClientId>,
    /// `rows[frame - 1][client_index]`
    rows: Vec<Vec<bool>>,
}

impl DeliveryMatrix {
    pub fn from_rows(clients: Vec<ClientId>, rows: Vec<Vec<bool>>) -> Self {
        debug_assert!(rows.iter().all(|r| r.len() == clients.len()));
        DeliveryMatrix { clients, rows }
    }

    /// Derive the matrix from a seed. Same seed, same matrix.
    pub fn seeded(clients: Vec<ClientId>, frames: u32, rate: f64, seed: u64) -> Self {
        let rate = rate.clamp(0.0, 1.0);
        let mut rng = StdRng::seed_from_u64(seed);
        let rows = (0..frames)
            .map(|_| clients.iter().map(|_| rng.gen_bool(rate)).collect())
            .collect();
        DeliveryMatrix { clients, rows }
    }

    pub fn clients(&self) -> &[ClientId] {
        &self.clients
    }

    pub fn frame_count(&self) -> u32 {
        self.rows.len() as u32
    }

    pub fn delivered(&self, frame: u32, client: ClientId) -> bool {
        let Some(idx) = self.clients.iter().position(|&c| c == client) else {
            return false;
        };
        self.rows
            .get(frame.saturating_sub(1) as usize)
            .and_then(|row| row.get(idx))
            .copied()
            .unwrap_or(false)
    }

    /// Split the clients into (delivered, missed) for one frame
    pub fn outcomes(&self, frame: u32) -> (Vec<ClientId>, Vec<ClientId>) {
        self.clients
            .iter()
            .copied()
            .partition(|&c| self.delivered(frame, c))
    }
}

/// Whether a frame send was accepted
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Accepted,
    /// Out of strict order; the frame bounces back
    Bounced { expected: u32 },
}

/// Broadcast progress for one lesson
#[derive(Clone, Debug)]
pub struct BroadcastState {
    matrix: DeliveryMatrix,
    total: u32,
    last_sent: u32,
    complete: bool,
}

impl BroadcastState {
    pub fn new(matrix: DeliveryMatrix, total: u32) -> Self {
        BroadcastState {
            matrix,
            total,
            last_sent: 0,
            complete: false,
        }
    }

    #[inline]
    pub fn matrix(&self) -> &DeliveryMatrix {
        &self.matrix
    }

    #[inline]
    pub fn total(&self) -> u32 {
        self.total
    }

    #[inline]
    pub fn frames_sent(&self) -> u32 {
        self.last_sent
    }

    #[inline]
    pub fn expected_next(&self) -> u32 {
        self.last_sent + 1
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Strict ordering: frame `n` is accepted only directly after `n - 1`.
    pub fn try_send(&mut self, number: u32) -> SendOutcome {
        if number != self.last_sent + 1 {
            return SendOutcome::Bounced {
                expected: self.last_sent + 1,
            };
        }
        self.last_sent = number;
        SendOutcome::Accepted
    }

    /// Apply one frame's fan-out. Returns true when this was the final
    /// frame and the broadcast is now complete.
    pub fn on_fanout(&mut self, number: u32) -> bool {
        if number == self.total && !self.complete {
            self.complete = true;
            return true;
        }
        false
    }
}
