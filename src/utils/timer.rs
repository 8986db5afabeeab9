use std::io;
use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};
use std::time::Duration;

use rustix::time::{
    timerfd_create, timerfd_settime, Itimerspec, TimerfdClockId, TimerfdFlags, TimerfdTimerFlags,
    Timespec,
};

/// A timerfd-backed timer.
///
/// Used for frame pacing in the synthetic backends and for the pageflip
/// watchdog of the DRM pipeline. Being a plain file descriptor it registers
/// with the event loop like every other source in this crate.
#[derive(Debug)]
pub(crate) struct TimerFd {
    fd: OwnedFd,
}

impl TimerFd {
    pub(crate) fn new() -> io::Result<TimerFd> {
        let fd = timerfd_create(
            TimerfdClockId::Monotonic,
            TimerfdFlags::CLOEXEC | TimerfdFlags::NONBLOCK,
        )?;
        Ok(TimerFd { fd })
    }

    /// Arm the timer to fire once after `delay`.
    pub(crate) fn set_oneshot(&self, delay: Duration) -> io::Result<()> {
        self.set(delay, None)
    }

    /// Arm the timer to fire after `delay` and every `interval` afterwards.
    pub(crate) fn set_repeating(&self, delay: Duration, interval: Duration) -> io::Result<()> {
        self.set(delay, Some(interval))
    }

    pub(crate) fn disarm(&self) -> io::Result<()> {
        self.set(Duration::ZERO, None)
    }

    fn set(&self, delay: Duration, interval: Option<Duration>) -> io::Result<()> {
        let spec = Itimerspec {
            it_interval: timespec(interval.unwrap_or(Duration::ZERO)),
            it_value: timespec(delay),
        };
        timerfd_settime(&self.fd, TimerfdTimerFlags::empty(), &spec)?;
        Ok(())
    }

    /// Consume a pending expiration. Must be called once the fd polls
    /// readable, otherwise the event loop will spin.
    pub(crate) fn read(&self) -> u64 {
        let mut buf = [0u8; 8];
        match rustix::io::read(&self.fd, &mut buf) {
            Ok(8) => u64::from_ne_bytes(buf),
            _ => 0,
        }
    }
}

fn timespec(d: Duration) -> Timespec {
    Timespec {
        tv_sec: d.as_secs() as _,
        tv_nsec: d.subsec_nanos() as _,
    }
}

impl AsFd for TimerFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
