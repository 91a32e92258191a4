//! Guest-visible clocks.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use weh_common::Errno;
use weh_common::abi::clockid;

/// WASI clock identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockId {
    /// Wall-clock time since the Unix epoch.
    Realtime,
    /// Monotonic time since an arbitrary origin.
    Monotonic,
    /// CPU time of the process.
    ProcessCpuTime,
    /// CPU time of the calling thread.
    ThreadCpuTime,
}

impl ClockId {
    /// Decode a raw `clockid`; unknown ids yield `INVAL`.
    pub fn from_raw(raw: u32) -> Result<Self, Errno> {
        match raw {
            clockid::REALTIME => Ok(Self::Realtime),
            clockid::MONOTONIC => Ok(Self::Monotonic),
            clockid::PROCESS_CPUTIME_ID => Ok(Self::ProcessCpuTime),
            clockid::THREAD_CPUTIME_ID => Ok(Self::ThreadCpuTime),
            _ => Err(Errno::Inval),
        }
    }
}

/// Time source for the guest.
pub trait Clock: Send {
    /// Current time of `id` in nanoseconds.
    fn now(&self, id: ClockId) -> Result<u64, Errno>;

    /// Resolution of `id` in nanoseconds.
    fn resolution(&self, id: ClockId) -> Result<u64, Errno>;

    /// Block the calling thread.
    fn sleep(&self, duration: Duration);
}

/// Host clocks.
///
/// The CPU-time clocks are approximated by the monotonic time elapsed since
/// the clock was created.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Create a clock whose monotonic origin is now.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self, id: ClockId) -> Result<u64, Errno> {
        let elapsed = match id {
            ClockId::Realtime => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_err(|_| Errno::Overflow)?,
            ClockId::Monotonic | ClockId::ProcessCpuTime | ClockId::ThreadCpuTime => {
                self.origin.elapsed()
            }
        };
        u64::try_from(elapsed.as_nanos()).map_err(|_| Errno::Overflow)
    }

    fn resolution(&self, _id: ClockId) -> Result<u64, Errno> {
        Ok(1_000)
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_id_from_raw() {
        assert_eq!(ClockId::from_raw(0), Ok(ClockId::Realtime));
        assert_eq!(ClockId::from_raw(1), Ok(ClockId::Monotonic));
        assert_eq!(ClockId::from_raw(3), Ok(ClockId::ThreadCpuTime));
        assert_eq!(ClockId::from_raw(9), Err(Errno::Inval));
    }

    #[test]
    fn test_monotonic_never_goes_backwards() {
        let clock = SystemClock::new();
        let a = clock.now(ClockId::Monotonic).unwrap();
        let b = clock.now(ClockId::Monotonic).unwrap();
        assert!(b >= a);
    }

    #[test]
    fn test_realtime_is_after_2020() {
        let clock = SystemClock::new();
        let now = clock.now(ClockId::Realtime).unwrap();
        assert!(now > 1_577_836_800 * 1_000_000_000);
    }
}
