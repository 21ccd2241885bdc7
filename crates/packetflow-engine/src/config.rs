//! Simulation configuration and lesson scenarios
//!
//! All delays are pedagogical constants: long enough for a learner to watch,
//! short enough to keep the lesson moving. Nothing here is RFC-accurate.

use std::time::Duration;

use bytes::Bytes;
use packetflow_core::ClientId;

/// Engine timing and protocol constants
#[derive(Clone, Debug)]
pub struct SimConfig {
    /// Wire travel time for one direction
    pub propagation: Duration,
    /// Receiver-side pause before a response entity launches,
    /// also the fragmentation-gate processing time
    pub processing: Duration,
    /// Time a refused entity takes to bounce back to its origin
    pub bounce: Duration,
    /// Time a lost entity stays visible before fading out
    pub fade: Duration,
    /// Visible gap between consecutive buffered-flush releases
    pub buffer_step: Duration,
    /// Pause between the last delivered fragment and file assembly
    pub assembly: Duration,
    /// Largest data payload a single fragment may carry, in bytes
    pub mtu: usize,
    /// Duplicate acks required to trigger the retransmit signal
    pub dup_ack_threshold: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            propagation: Duration::from_millis(900),
            processing: Duration::from_millis(450),
            bounce: Duration::from_millis(600),
            fade: Duration::from_millis(500),
            buffer_step: Duration::from_millis(350),
            assembly: Duration::from_millis(1500),
            mtu: 4,
            dup_ack_threshold: 3,
        }
    }
}

impl SimConfig {
    /// Compressed delays for tests and benches
    pub fn fast() -> Self {
        SimConfig {
            propagation: Duration::from_millis(90),
            processing: Duration::from_millis(45),
            bounce: Duration::from_millis(60),
            fade: Duration::from_millis(50),
            buffer_step: Duration::from_millis(35),
            assembly: Duration::from_millis(150),
            mtu: 4,
            dup_ack_threshold: 3,
        }
    }
}

/// How broadcast frames reach each client
#[derive(Clone, Debug)]
pub enum DeliveryPlan {
    /// Derive the matrix from a seed; same seed, same matrix
    Seeded { seed: u64, rate: f64 },
    /// Explicit rows, `rows[frame - 1][client_index]`
    Explicit(Vec<Vec<bool>>),
}

/// One lesson attempt: the file, the peer, the scripted loss,
/// and the broadcast fan-out
#[derive(Clone, Debug)]
pub struct Scenario {
    /// File payload to fragment and transfer
    pub payload: Bytes,
    /// The single reliable-phase peer
    pub reliable_client: ClientId,
    /// Sequence dropped in transit until the retransmit signal fires
    pub drop_seq: Option<u32>,
    /// Broadcast receivers, in fan-out order
    pub broadcast_clients: Vec<ClientId>,
    /// Frames to send in the broadcast phase
    pub frame_count: u32,
    /// Payload carried by each frame
    pub frame_payload: Bytes,
    /// Per-frame, per-client delivery outcomes
    pub delivery: DeliveryPlan,
}

impl Scenario {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Scenario {
            payload: payload.into(),
            reliable_client: ClientId::new(1),
            drop_seq: None,
            broadcast_clients: vec![ClientId::new(2), ClientId::new(3), ClientId::new(4)],
            frame_count: 3,
            frame_payload: Bytes::from_static(b"live"),
            delivery: DeliveryPlan::Seeded { seed: 7, rate: 0.7 },
        }
    }

    pub fn with_reliable_client(mut self, client: ClientId) -> Self {
        self.reliable_client = client;
        self
    }

    pub fn with_drop_seq(mut self, seq: u32) -> Self {
        self.drop_seq = Some(seq);
        self
    }

    pub fn with_broadcast_clients(mut self, clients: Vec<ClientId>) -> Self {
        self.broadcast_clients = clients;
        self
    }

    pub fn with_frame_count(mut self, count: u32) -> Self {
        self.frame_count = count;
        self
    }

    pub fn with_frame_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.frame_payload = payload.into();
        self
    }

    pub fn with_delivery(mut self, plan: DeliveryPlan) -> Self {
        self.delivery = plan;
        self
    }

    /// Fragments the payload will split into under the given MTU
    pub fn fragment_count(&self, mtu: usize) -> u32 {
        if self.payload.is_empty() || mtu == 0 {
            return 0;
        }
        self.payload.len().div_ceil(mtu) as u32
    }
}
