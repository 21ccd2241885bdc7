//! Scripted end-to-end walkthroughs
//!
//! A walkthrough drives one whole lesson through the driver, collects the
//! event log and the engine counters, and checks the cross-cutting
//! invariants no single unit test sees:
//! - lesson phases only ever move forward
//! - receiver acks never decrease
//! - frames fan out strictly in order
//! - every scripted loss is eventually signalled for retransmit

use packetflow_core::{EngineEvent, LessonPhase};
use packetflow_engine::{Scenario, SimConfig, SimStats};

use crate::driver::{DriverError, LessonDriver};
use crate::scenarios;

/// How one walkthrough run is driven
#[derive(Clone, Debug)]
pub struct WalkthroughConfig {
    pub scenario: Scenario,
    pub config: SimConfig,
    /// Seed for a shuffled first transfer pass; `None` sends in order
    pub shuffle_seed: Option<u64>,
}

impl WalkthroughConfig {
    /// Smallest lesson, sent in order
    pub fn minimal() -> Self {
        WalkthroughConfig {
            scenario: scenarios::minimal(),
            config: SimConfig::fast(),
            shuffle_seed: None,
        }
    }

    /// The classroom default, sent in order
    pub fn standard() -> Self {
        WalkthroughConfig {
            scenario: scenarios::standard(),
            config: SimConfig::fast(),
            shuffle_seed: None,
        }
    }

    /// Scripted loss on sequence 2
    pub fn lossy() -> Self {
        WalkthroughConfig {
            scenario: scenarios::lossy(),
            config: SimConfig::fast(),
            shuffle_seed: None,
        }
    }

    /// The classroom default with a seeded out-of-order transfer
    pub fn shuffled(seed: u64) -> Self {
        WalkthroughConfig {
            shuffle_seed: Some(seed),
            ..Self::standard()
        }
    }
}

/// What one walkthrough run produced
#[derive(Debug)]
pub struct WalkthroughResult {
    /// Did the lesson reach its terminal phase?
    pub completed: bool,
    /// Driver error that cut the script short, if any
    pub error: Option<String>,
    /// Phases in the order they were entered, starting at fragmentation
    pub phases_seen: Vec<LessonPhase>,
    /// Engine counters at the end of the run
    pub stats: SimStats,
    /// The full event log
    pub events: Vec<EngineEvent>,
    /// Invariant violations found in the log
    pub violations: Vec<String>,
}

impl WalkthroughResult {
    pub fn passed(&self) -> bool {
        self.completed && self.error.is_none() && self.violations.is_empty()
    }
}

/// Runs a scripted lesson front to back
pub struct LessonWalkthrough {
    config: WalkthroughConfig,
}

impl LessonWalkthrough {
    pub fn new(config: WalkthroughConfig) -> Self {
        LessonWalkthrough { config }
    }

    pub fn run(&self) -> WalkthroughResult {
        let mut driver =
            match LessonDriver::new(self.config.scenario.clone(), self.config.config.clone()) {
                Ok(driver) => driver,
                Err(err) => {
                    return WalkthroughResult {
                        completed: false,
                        error: Some(err.to_string()),
                        phases_seen: Vec::new(),
                        stats: SimStats::default(),
                        events: Vec::new(),
                        violations: Vec::new(),
                    }
                }
            };
        let outcome = self.drive(&mut driver);

        let events = driver.take_log();
        let mut phases_seen = vec![LessonPhase::Fragmentation];
        for event in &events {
            if let EngineEvent::PhaseChanged { to, .. } = event {
                phases_seen.push(*to);
            }
        }

        WalkthroughResult {
            completed: driver.is_complete(),
            error: outcome.err().map(|e| e.to_string()),
            phases_seen,
            stats: driver.sim().stats().clone(),
            violations: check_invariants(&events),
            events,
        }
    }

    fn drive(&self, driver: &mut LessonDriver) -> Result<(), DriverError> {
        driver.run_fragmentation()?;
        driver.run_handshake()?;
        match self.config.shuffle_seed {
            Some(seed) => driver.run_transfer_shuffled(seed)?,
            None => driver.run_transfer()?,
        }
        driver.run_teardown()?;
        driver.run_broadcast()
    }
}

/// Log-level invariants that hold for every lesson, regardless of scenario
fn check_invariants(events: &[EngineEvent]) -> Vec<String> {
    let mut violations = Vec::new();

    let order = [
        LessonPhase::Fragmentation,
        LessonPhase::Handshake,
        LessonPhase::Transfer,
        LessonPhase::Teardown,
        LessonPhase::Broadcast,
        LessonPhase::Complete,
    ];
    let mut rank = 0usize;
    for event in events {
        if let EngineEvent::PhaseChanged { to, .. } = event {
            match order.iter().position(|p| p == to) {
                Some(next) if next >= rank => rank = next,
                Some(_) => violations.push(format!("phase moved backwards to {}", to)),
                None => {}
            }
        }
    }

    let mut last_ack = 0u32;
    for event in events {
        if let EngineEvent::StatusChanged(update) = event {
            if let Some(ack) = update.ack {
                if ack < last_ack {
                    violations.push(format!("ack regressed from {} to {}", last_ack, ack));
                }
                last_ack = last_ack.max(ack);
            }
        }
    }

    let mut last_frame = 0u32;
    for event in events {
        if let EngineEvent::FrameDelivered { number, .. } = event {
            if *number != last_frame + 1 {
                violations.push(format!("frame {} fanned out after {}", number, last_frame));
            }
            last_frame = *number;
        }
    }

    let mut unsignalled: Vec<u32> = Vec::new();
    for event in events {
        match event {
            EngineEvent::SimulatedLoss { seq, .. } => unsignalled.push(*seq),
            EngineEvent::RetransmitNeeded { seq, .. } => unsignalled.retain(|s| s != seq),
            _ => {}
        }
    }
    for seq in unsignalled {
        violations.push(format!("fragment {} was lost and never signalled", seq));
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use packetflow_core::{ClientId, PacketKind, RejectReason};
    use std::time::Duration;

    fn full_ladder() -> Vec<LessonPhase> {
        vec![
            LessonPhase::Fragmentation,
            LessonPhase::Handshake,
            LessonPhase::Transfer,
            LessonPhase::Teardown,
            LessonPhase::Broadcast,
            LessonPhase::Complete,
        ]
    }

    #[test]
    fn test_minimal_walkthrough_passes() {
        let result = LessonWalkthrough::new(WalkthroughConfig::minimal()).run();
        assert!(result.passed(), "violations: {:?}", result.violations);
        assert_eq!(result.phases_seen, full_ladder());
        assert_eq!(result.stats.losses, 0);
        assert_eq!(result.stats.retransmit_signals, 0);
    }

    #[test]
    fn test_standard_walkthrough_passes() {
        let result = LessonWalkthrough::new(WalkthroughConfig::standard()).run();
        assert!(result.passed(), "violations: {:?}", result.violations);
        assert!(result
            .events
            .iter()
            .any(|e| matches!(e, EngineEvent::FileComplete { .. })));
        assert!(result
            .events
            .iter()
            .any(|e| matches!(e, EngineEvent::LessonComplete)));
    }

    #[test]
    fn test_lossy_walkthrough_retransmits() {
        let result = LessonWalkthrough::new(WalkthroughConfig::lossy()).run();
        assert!(result.passed(), "violations: {:?}", result.violations);
        assert_eq!(result.stats.losses, 1);
        assert_eq!(result.stats.retransmit_signals, 1);
        assert!(result
            .events
            .iter()
            .any(|e| matches!(e, EngineEvent::SimulatedLoss { seq: 2, .. })));
        assert!(result
            .events
            .iter()
            .any(|e| matches!(e, EngineEvent::RetransmitNeeded { seq: 2, .. })));
    }

    #[test]
    fn test_shuffled_transfers_pass() {
        for seed in [1, 7, 23] {
            let result = LessonWalkthrough::new(WalkthroughConfig::shuffled(seed)).run();
            assert!(
                result.passed(),
                "seed {}: error {:?}, violations {:?}",
                seed,
                result.error,
                result.violations
            );
        }
    }

    #[test]
    fn test_identical_runs_produce_identical_logs() {
        let a = LessonWalkthrough::new(WalkthroughConfig::standard()).run();
        let b = LessonWalkthrough::new(WalkthroughConfig::standard()).run();
        assert_eq!(a.events, b.events);
    }

    #[test]
    fn test_seeded_broadcast_is_reproducible() {
        let config = WalkthroughConfig {
            scenario: scenarios::frame_flood(),
            config: SimConfig::fast(),
            shuffle_seed: None,
        };
        let a = LessonWalkthrough::new(config.clone()).run();
        let b = LessonWalkthrough::new(config).run();

        assert!(a.passed(), "violations: {:?}", a.violations);
        assert_eq!(a.events, b.events);
        // Every frame reaches every client exactly once as a coin flip.
        assert_eq!(a.stats.frames_delivered + a.stats.frames_missed, 8 * 4);
    }

    #[test]
    fn test_broadcast_matrix_is_respected() {
        let result = LessonWalkthrough::new(WalkthroughConfig::standard()).run();
        assert!(result.passed());

        let fanouts: Vec<(u32, Vec<ClientId>, Vec<ClientId>)> = result
            .events
            .iter()
            .filter_map(|e| match e {
                EngineEvent::FrameDelivered {
                    number,
                    delivered,
                    missed,
                } => Some((*number, delivered.clone(), missed.clone())),
                _ => None,
            })
            .collect();

        let c = |n: u64| ClientId::new(n);
        assert_eq!(
            fanouts,
            vec![
                (1, vec![c(2), c(3), c(4)], vec![]),
                (2, vec![c(2), c(4)], vec![c(3)]),
                (3, vec![c(3), c(4)], vec![c(2)]),
            ]
        );
    }

    #[test]
    fn test_wrong_destination_recovers() {
        let mut driver = LessonDriver::fast(scenarios::minimal()).unwrap();
        driver.run_fragmentation().unwrap();

        // Skipping the wire gets refused, then the lesson continues.
        let syn = driver.at_sender(PacketKind::Syn).unwrap();
        let inbox = driver
            .sim()
            .topology()
            .receiver_id(ClientId::new(1))
            .unwrap();
        driver.lift(syn).unwrap();
        driver.sim_mut().place_entity(syn, inbox).unwrap();
        driver.settle();

        assert!(driver.log().iter().any(|e| matches!(
            e,
            EngineEvent::Rejected {
                reason: RejectReason::WrongDestination,
                ..
            }
        )));

        driver.run_handshake().unwrap();
        driver.run_transfer().unwrap();
        driver.run_teardown().unwrap();
        driver.run_broadcast().unwrap();
        assert!(driver.is_complete());
    }

    #[test]
    fn test_out_of_order_frame_bounces() {
        let mut driver = LessonDriver::fast(scenarios::minimal()).unwrap();
        driver.run_reliable().unwrap();

        // Frame 2 before frame 1 is refused and returns to the tray.
        let frame2 = driver.frame_at_sender(2).unwrap();
        driver.send_and_settle(frame2).unwrap();

        assert!(driver.log().iter().any(|e| matches!(
            e,
            EngineEvent::Rejected {
                reason: RejectReason::OutOfOrderFrame {
                    sent: 2,
                    expected: 1,
                },
                ..
            }
        )));
        assert_eq!(driver.frame_at_sender(2), Some(frame2));

        driver.run_broadcast().unwrap();
        assert!(driver.is_complete());
    }

    #[test]
    fn test_lifted_frame_relaunches_fanout() {
        let mut driver = LessonDriver::fast(scenarios::minimal()).unwrap();
        driver.run_reliable().unwrap();

        // Accept frame 1, then snatch it off the wire mid-fan-out.
        let frame1 = driver.frame_at_sender(1).unwrap();
        driver.send(frame1).unwrap();
        driver.step(Duration::from_millis(10));
        driver.lift(frame1).unwrap();
        driver.settle();

        assert!(!driver
            .log()
            .iter()
            .any(|e| matches!(e, EngineEvent::FrameDelivered { number: 1, .. })));

        // Replacing the same frame re-launches the fan-out rather than
        // bouncing it as a duplicate send.
        let wire = driver.sim().topology().wire_id();
        driver.sim_mut().place_entity(frame1, wire).unwrap();
        driver.settle();

        assert!(driver
            .log()
            .iter()
            .any(|e| matches!(e, EngineEvent::FrameDelivered { number: 1, .. })));

        driver.send_frame(2).unwrap();
        assert!(driver.is_complete());
    }

    #[test]
    fn test_inbox_frame_bounces_back_to_its_inbox() {
        let mut driver = LessonDriver::fast(scenarios::minimal()).unwrap();
        driver.run_reliable().unwrap();
        driver.send_frame(1).unwrap();

        // Frame 1 left a copy in each client inbox. Dragging one copy
        // back onto the wire is a stale send; it must bounce to the
        // inbox it came from, not to the sender tray.
        let inbox = driver
            .sim()
            .topology()
            .receiver_id(ClientId::new(2))
            .unwrap();
        let copy = driver
            .sim()
            .topology()
            .get(inbox)
            .unwrap()
            .members()
            .first()
            .copied()
            .unwrap();
        let wire = driver.sim().topology().wire_id();
        driver.lift(copy).unwrap();
        driver.sim_mut().place_entity(copy, wire).unwrap();
        driver.settle();

        assert!(driver.log().iter().any(|e| matches!(
            e,
            EngineEvent::Rejected {
                reason: RejectReason::OutOfOrderFrame { sent: 1, .. },
                ..
            }
        )));
        assert_eq!(driver.sim().topology().slot_of(copy), Some(inbox));
        assert_eq!(driver.sim().pending_timers(), 0);

        driver.send_frame(2).unwrap();
        assert!(driver.is_complete());
    }

    #[test]
    fn test_empty_payload_is_refused_up_front() {
        let config = WalkthroughConfig {
            scenario: Scenario::new(&b""[..]),
            config: SimConfig::fast(),
            shuffle_seed: None,
        };
        let result = LessonWalkthrough::new(config).run();

        assert!(!result.completed);
        assert!(result.error.unwrap().contains("payload"));
        assert!(result.events.is_empty());
    }

    #[test]
    fn test_data_on_closing_connection_rejected() {
        let mut driver = LessonDriver::fast(scenarios::minimal()).unwrap();
        driver.run_fragmentation().unwrap();
        driver.run_handshake().unwrap();
        driver.run_transfer().unwrap();

        // Send FIN but stop the clock right after it lands, while the
        // FIN-ACK is still being processed on the far side.
        let fin = driver.at_sender(PacketKind::Fin).unwrap();
        driver.send(fin).unwrap();
        driver.step(Duration::from_millis(100));

        // A delivered fragment pulled back onto the wire now hits a
        // closing connection.
        let fragment = driver
            .sim()
            .packets()
            .find(|p| p.kind == PacketKind::Data && p.seq == Some(1))
            .map(|p| p.id)
            .unwrap();
        let wire = driver.sim().topology().wire_id();
        driver.lift(fragment).unwrap();
        driver.sim_mut().place_entity(fragment, wire).unwrap();
        driver.step(Duration::from_millis(10));

        assert!(driver.log().iter().any(|e| matches!(
            e,
            EngineEvent::Rejected {
                reason: RejectReason::ConnectionClosed,
                ..
            }
        )));

        // The lesson still finishes cleanly.
        driver.settle();
        assert_eq!(driver.phase(), LessonPhase::Broadcast);
        driver.run_broadcast().unwrap();
        assert!(driver.is_complete());
    }

    #[test]
    fn test_reset_midway_replays_cleanly() {
        let mut driver = LessonDriver::fast(scenarios::minimal()).unwrap();
        driver.run_fragmentation().unwrap();
        driver.run_handshake().unwrap();
        driver.send_fragment(1).unwrap();

        driver.sim_mut().reset_connection();
        driver.settle();
        assert_eq!(driver.phase(), LessonPhase::Handshake);

        driver.run_handshake().unwrap();
        driver.run_transfer().unwrap();
        driver.run_teardown().unwrap();
        driver.run_broadcast().unwrap();
        assert!(driver.is_complete());
    }
}
