use rustix::time::{clock_gettime, ClockId};
use std::time::Duration;

/// Current value of `CLOCK_MONOTONIC`.
pub(crate) fn monotonic_time() -> Duration {
    let tp = clock_gettime(ClockId::Monotonic);
    Duration::new(tp.tv_sec as u64, tp.tv_nsec as u32)
}

/// Current value of `CLOCK_MONOTONIC` in milliseconds, truncated to the
/// 32 bits input events carry on the wire.
pub(crate) fn monotonic_msec() -> u32 {
    monotonic_time().as_millis() as u32
}
