//! Packetflow Test Harness - Lesson scripting and engine validation
//!
//! This crate provides:
//! - A lesson driver that plays the learner's drag-and-drop role
//! - Named scenario presets for common lesson shapes
//! - Scripted end-to-end walkthroughs with invariant checks
//! - Criterion benchmarks for the hot paths

pub mod driver;
pub mod scenarios;
pub mod walkthrough;

pub use driver::*;
pub use scenarios::*;
pub use walkthrough::*;
