//! Named scenario presets
//!
//! Each preset is a complete lesson description. Explicit delivery
//! matrices are preferred over seeded ones wherever a test wants to
//! assert exact broadcast outcomes.

use packetflow_core::ClientId;
use packetflow_engine::{DeliveryPlan, Scenario};

/// Smallest complete lesson: two fragments, two frames, nothing lost.
pub fn minimal() -> Scenario {
    Scenario::new(&b"minimal!"[..])
        .with_broadcast_clients(vec![ClientId::new(2), ClientId::new(3)])
        .with_frame_count(2)
        .with_delivery(DeliveryPlan::Explicit(vec![
            vec![true, true],
            vec![true, true],
        ]))
}

/// The classroom default: three fragments, three frames, a mixed matrix.
pub fn standard() -> Scenario {
    Scenario::new(&b"hello packetflow"[..])
        .with_frame_count(3)
        .with_delivery(DeliveryPlan::Explicit(vec![
            vec![true, true, true],
            vec![true, false, true],
            vec![false, true, true],
        ]))
}

/// Six fragments with sequence 2 scripted to drop. Fragments 3, 4 and 5
/// repeat the stalled ack, so the third duplicate trips the retransmit
/// signal without any extra learner moves.
pub fn lossy() -> Scenario {
    Scenario::new(&b"the quick brown fox jmps"[..])
        .with_drop_seq(2)
        .with_frame_count(2)
        .with_delivery(DeliveryPlan::Explicit(vec![
            vec![true, true, true],
            vec![true, true, false],
        ]))
}

/// Broadcast-heavy: a tiny reliable half, then eight frames across four
/// clients with a seeded coin per delivery.
pub fn frame_flood() -> Scenario {
    Scenario::new(&b"tiny"[..])
        .with_broadcast_clients(vec![
            ClientId::new(2),
            ClientId::new(3),
            ClientId::new(4),
            ClientId::new(5),
        ])
        .with_frame_count(8)
        .with_delivery(DeliveryPlan::Seeded {
            seed: 42,
            rate: 0.5,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preset_fragment_counts() {
        // Counts at the default MTU of 4 bytes.
        assert_eq!(minimal().fragment_count(4), 2);
        assert_eq!(standard().fragment_count(4), 4);
        assert_eq!(lossy().fragment_count(4), 6);
        assert_eq!(frame_flood().fragment_count(4), 1);
    }

    #[test]
    fn test_matrices_match_client_sets() {
        for scenario in [minimal(), standard(), lossy()] {
            if let DeliveryPlan::Explicit(rows) = &scenario.delivery {
                assert_eq!(rows.len() as u32, scenario.frame_count);
                for row in rows {
                    assert_eq!(row.len(), scenario.broadcast_clients.len());
                }
            }
        }
    }

    #[test]
    fn test_lossy_drops_an_early_sequence() {
        let scenario = lossy();
        let drop = scenario.drop_seq.unwrap();
        // The drop must leave enough later fragments to reach the
        // duplicate-ack threshold of 3.
        assert!(scenario.fragment_count(4) - drop >= 3);
    }
}
