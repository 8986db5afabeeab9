//!
//! Abstraction of different session apis.
//!
//! Sessions provide a way for multiple graphical systems to run in parallel
//! by providing mechanisms to switch between and handle device access and
//! permissions for every running instance. They are crucial to allow
//! unprivileged processes to use graphical or input devices.
//!
//! The following mechanisms are provided:
//!  - logind - brokered through `org.freedesktop.login1` over D-Bus
//!  - direct - legacy tty / virtual terminal kernel api
//!  - noop   - plain `open(2)`, for seats without VT switching
//!
//! [`auto::AutoSession`] picks the first of these that works.
//!
//! A session splits into two halves: the [`Session`] itself, a clonable
//! handle used to open and close devices, and a *notifier*, a
//! [`calloop::EventSource`] producing [`SessionEvent`]s when the seat is
//! paused or activated, or when single devices are revoked and re-issued.

use std::os::unix::io::OwnedFd;
use std::path::Path;

use rustix::fs::OFlags;

pub mod auto;
#[cfg(feature = "backend_session_logind")]
pub mod logind;

pub mod direct;
pub mod noop;

/// General session interface.
///
/// Provides a way to open and close devices and change the active vt.
pub trait Session {
    /// Error type of the implementation
    type Error: AsErrno;

    /// Opens a device at the given `path` with the given flags.
    ///
    /// Only device nodes under `/dev/dri` and `/dev/input` are served.
    /// While the session is inactive, DRM devices are opened without master
    /// and evdev devices may be handed out revoked.
    fn open(&mut self, path: &Path, flags: OFlags) -> Result<OwnedFd, Self::Error>;

    /// Close a previously opened file descriptor, releasing the device.
    fn close(&mut self, fd: OwnedFd) -> Result<(), Self::Error>;

    /// Change the currently active virtual terminal.
    fn change_vt(&mut self, vt: i32) -> Result<(), Self::Error>;

    /// Check if this session is currently active.
    fn is_active(&self) -> bool;

    /// Which seat this session is on.
    fn seat(&self) -> String;
}

/// Events generated by the notifier half of a session.
#[derive(Debug)]
pub enum SessionEvent {
    /// The session has been paused. DRM devices have lost master, input
    /// devices are revoked; observers must stop using derived state.
    Pause,
    /// The session became active again. DRM master has been reacquired;
    /// observers should rescan their devices.
    Activate,
    /// A single device has been paused.
    DevicePause {
        /// `dev_t` of the paused device
        device: u64,
    },
    /// A single device is valid again, optionally with a replacement fd
    /// that must be used instead of the previously opened one.
    DeviceActivate {
        /// `dev_t` of the re-activated device
        device: u64,
        /// Replacement file descriptor, if the session manager issued one
        fd: Option<OwnedFd>,
    },
}

/// Allows errors to be described by an error number
pub trait AsErrno: std::fmt::Debug {
    /// Returns the error number representing this error, if any
    fn as_errno(&self) -> Option<i32>;
}

impl AsErrno for () {
    fn as_errno(&self) -> Option<i32> {
        None
    }
}

/// Checks that `path` points into one of the device directories a session
/// is allowed to serve.
pub(crate) fn is_managed_device_path(path: &Path) -> bool {
    path.starts_with("/dev/dri") || path.starts_with("/dev/input")
}

#[cfg(test)]
mod tests {
    use super::is_managed_device_path;
    use std::path::Path;

    #[test]
    fn device_path_restriction() {
        assert!(is_managed_device_path(Path::new("/dev/dri/card0")));
        assert!(is_managed_device_path(Path::new("/dev/dri/renderD128")));
        assert!(is_managed_device_path(Path::new("/dev/input/event3")));
        assert!(!is_managed_device_path(Path::new("/dev/tty0")));
        assert!(!is_managed_device_path(Path::new("/etc/passwd")));
        assert!(!is_managed_device_path(Path::new("dev/dri/card0")));
    }
}
