//! Lesson narration
//!
//! One pure function from the current phase plus aggregate counters to a
//! short instruction string. Recomputed on demand; identical inputs always
//! produce identical text.

use packetflow_core::{ConnPhase, LessonPhase};

/// Aggregate counters the narration is derived from
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct HintInputs {
    pub conn_phase: Option<ConnPhase>,
    pub fragments_total: u32,
    pub fragments_received: u32,
    pub fragments_buffered: u32,
    pub dup_acks: u32,
    pub pending_retransmit: Option<u32>,
    pub losses: u64,
    pub frames_sent: u32,
    pub frames_total: u32,
}

/// Narration for the current lesson state
pub fn hint(phase: LessonPhase, inputs: &HintInputs) -> String {
    match phase {
        LessonPhase::Fragmentation => {
            "Drag the file onto the wire. It will not fit: anything larger than \
             the MTU has to be split into fragments first."
                .to_string()
        }
        LessonPhase::Handshake => match inputs.conn_phase {
            Some(ConnPhase::SynReceived) => {
                "The server answered with SYN-ACK. Send your ACK across the wire \
                 to finish the handshake."
                    .to_string()
            }
            _ => "No connection yet. Send the SYN packet across the wire to ask \
                  the server to talk."
                .to_string(),
        },
        LessonPhase::Transfer => {
            if let Some(seq) = inputs.pending_retransmit {
                return format!(
                    "Three duplicate ACKs for the same value: fragment {} was lost. \
                     Send it again.",
                    seq
                );
            }
            if inputs.losses > 0 && inputs.fragments_buffered > 0 {
                return format!(
                    "A fragment faded out on the wire. Keep sending the rest: \
                     {} duplicate ACK(s) so far, three trigger the retransmit.",
                    inputs.dup_acks
                );
            }
            if inputs.fragments_buffered > 0 {
                return format!(
                    "{} fragment(s) arrived early and are waiting in the buffer. \
                     Deliver the missing one to release them.",
                    inputs.fragments_buffered
                );
            }
            if inputs.fragments_received == 0 {
                format!(
                    "Connection established. Send the {} fragments across the wire, \
                     in any order you like.",
                    inputs.fragments_total
                )
            } else {
                format!(
                    "{} of {} fragments delivered. Keep them coming.",
                    inputs.fragments_received, inputs.fragments_total
                )
            }
        }
        LessonPhase::Teardown => match inputs.conn_phase {
            Some(ConnPhase::Closing) => {
                "FIN sent. The server's FIN-ACK is on its way back; the connection \
                 closes when it lands."
                    .to_string()
            }
            _ => "Every fragment arrived and the file is assembled. Send FIN to \
                  close the connection politely."
                .to_string(),
        },
        LessonPhase::Broadcast => {
            if inputs.frames_sent == 0 {
                format!(
                    "Now the unreliable way: broadcast {} frames in order. \
                     No ACKs, no retries; some receivers will simply miss frames.",
                    inputs.frames_total
                )
            } else {
                format!(
                    "Frame {} of {} sent. Frames must go out strictly in order.",
                    inputs.frames_sent, inputs.frames_total
                )
            }
        }
        LessonPhase::Complete => {
            "Lesson complete: reliable delivery costs handshakes, ordering and \
             retransmits; broadcast is cheap but lossy."
                .to_string()
        }
    }
}
