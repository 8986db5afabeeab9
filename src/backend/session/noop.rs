//!
//! Fallback [`Session`] without any session manager.
//!
//! Opens device nodes directly with `open(2)`. This only works if the
//! process has sufficient permissions on the nodes (seatless setups,
//! containers, CI). The session is always active and VT switching is not
//! available.

use std::os::unix::io::OwnedFd;
use std::path::Path;

use rustix::fs::{self, Mode, OFlags};
use rustix::io::Errno;
use tracing::{debug, info};

use super::{is_managed_device_path, AsErrno, Session};

/// [`Session`] that opens devices directly, always active.
#[derive(Debug, Clone)]
pub struct NoopSession {
    seat: String,
}

/// Errors of the noop session.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The path does not point to a managed device node
    #[error("path is not a managed device node")]
    NotManaged,
    /// Opening the device failed
    #[error("failed to open device: {0}")]
    FailedToOpenDevice(#[source] Errno),
    /// VT switching is not supported without a session manager
    #[error("vt switching is not supported")]
    VtUnsupported,
}

impl AsErrno for Error {
    fn as_errno(&self) -> Option<i32> {
        match self {
            Error::FailedToOpenDevice(errno) => Some(errno.raw_os_error()),
            _ => None,
        }
    }
}

impl NoopSession {
    /// Creates a new noop session on the seat named by `XDG_SEAT`
    /// (default `seat0`).
    pub fn new() -> NoopSession {
        let seat = std::env::var("XDG_SEAT").unwrap_or_else(|_| String::from("seat0"));
        info!(seat, "Initialized noop session");
        NoopSession { seat }
    }
}

impl Default for NoopSession {
    fn default() -> Self {
        NoopSession::new()
    }
}

impl Session for NoopSession {
    type Error = Error;

    fn open(&mut self, path: &Path, flags: OFlags) -> Result<OwnedFd, Self::Error> {
        if !is_managed_device_path(path) {
            return Err(Error::NotManaged);
        }
        debug!("Opening device: {:?}", path);
        fs::open(path, flags | OFlags::RDWR | OFlags::CLOEXEC | OFlags::NOCTTY, Mode::empty())
            .map_err(Error::FailedToOpenDevice)
    }

    fn close(&mut self, fd: OwnedFd) -> Result<(), Self::Error> {
        debug!("Closing device: {:?}", fd);
        drop(fd);
        Ok(())
    }

    fn change_vt(&mut self, _vt: i32) -> Result<(), Self::Error> {
        Err(Error::VtUnsupported)
    }

    fn is_active(&self) -> bool {
        true
    }

    fn seat(&self) -> String {
        self.seat.clone()
    }
}
