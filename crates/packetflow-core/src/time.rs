//! Virtual time for the packet-flow simulation
//!
//! All progress runs on one logical timeline. `SimTime` is microseconds
//! since the lesson attempt started; it only ever moves forward via
//! `FlowSim::advance`, never from a wall clock.

use std::ops::{Add, Sub};
use std::time::Duration;

/// Virtual simulation time - microseconds since lesson start
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SimTime(pub u64);

impl SimTime {
    pub const ZERO: SimTime = SimTime(0);

    #[inline]
    pub fn from_micros(micros: u64) -> Self {
        SimTime(micros)
    }

    #[inline]
    pub fn from_millis(millis: u64) -> Self {
        SimTime(millis * 1000)
    }

    #[inline]
    pub fn from_secs_f64(secs: f64) -> Self {
        SimTime((secs * 1_000_000.0) as u64)
    }

    #[inline]
    pub fn as_micros(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn as_millis(self) -> u64 {
        self.0 / 1000
    }

    #[inline]
    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    #[inline]
    pub fn saturating_add(self, duration: Duration) -> Self {
        SimTime(self.0.saturating_add(duration.as_micros() as u64))
    }
}

impl Add<Duration> for SimTime {
    type Output = SimTime;

    #[inline]
    fn add(self, rhs: Duration) -> Self::Output {
        SimTime(self.0 + rhs.as_micros() as u64)
    }
}

impl Sub<SimTime> for SimTime {
    type Output = Duration;

    #[inline]
    fn sub(self, rhs: SimTime) -> Self::Output {
        Duration::from_micros(self.0.saturating_sub(rhs.0))
    }
}

impl std::fmt::Debug for SimTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t+{:.3}ms", self.0 as f64 / 1000.0)
    }
}
