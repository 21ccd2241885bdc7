//! Packetflow Engine - the timer-driven packet-flow state machine
//!
//! One `FlowSim` per lesson attempt. The driver places and removes entities
//! on node slots; `advance` observes those moves, applies the protocol
//! rules, and pumps the virtual-time timer queue. Everything the UI renders
//! comes back out as `EngineEvent`s.
//!
//! - `config` - pedagogical delays, MTU, scenario description
//! - `sched` - deterministic cancelable timer queue
//! - `slots` - node slots and the membership observation diff
//! - `registry` - packet entity store
//! - `connection` - per-client reliable-delivery state machine
//! - `broadcast` - strict-order unreliable fan-out
//! - `hint` - narration for the current phase
//! - `engine` - the `FlowSim` context tying it all together

pub mod config;
pub mod sched;
pub mod slots;
pub mod registry;
pub mod connection;
pub mod broadcast;
pub mod hint;
pub mod engine;

pub use config::*;
pub use sched::*;
pub use slots::*;
pub use registry::*;
pub use connection::*;
pub use broadcast::*;
pub use hint::*;
pub use engine::*;
