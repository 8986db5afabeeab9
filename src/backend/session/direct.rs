//!
//! Implementation of the [`Session`] trait through the legacy vt kernel
//! interface.
//!
//! This requires write permissions for the given tty device and any devices
//! opened through this interface. This means it will almost certainly
//! require root permissions. Use this session type *only* as a fallback or
//! for testing, if anything better is available.
//!
//! The session grabs the current virtual terminal in process mode: the
//! kernel raises `SIGUSR2` for every VT release and acquisition request,
//! which the notifier receives through a signalfd registered with the event
//! loop and answers with `VT_RELDISP`.

use std::io;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::path::Path;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use calloop::{EventSource, Interest, Mode as CalloopMode, Poll, PostAction, Readiness, Token, TokenFactory};
use rustix::fs::{fstat, major, minor, Mode, OFlags};
use tracing::{debug, error, info, info_span, warn};

use super::{is_managed_device_path, AsErrno, Session, SessionEvent};

#[allow(dead_code)]
mod tty {
    use std::io;
    use std::os::unix::io::{AsRawFd, BorrowedFd};

    pub const KDGETMODE: libc::c_ulong = 0x4B3B;
    pub const KDSETMODE: libc::c_ulong = 0x4B3A;
    pub const KD_TEXT: libc::c_int = 0x00;
    pub const KD_GRAPHICS: libc::c_int = 0x01;

    pub const KDGKBMODE: libc::c_ulong = 0x4B44;
    pub const KDSKBMODE: libc::c_ulong = 0x4B45;
    pub const K_OFF: libc::c_int = 0x04;

    pub const VT_SETMODE: libc::c_ulong = 0x5602;
    pub const VT_RELDISP: libc::c_ulong = 0x5605;
    pub const VT_ACTIVATE: libc::c_ulong = 0x5606;
    pub const VT_WAITACTIVE: libc::c_ulong = 0x5607;

    pub const VT_AUTO: libc::c_char = 0x00;
    pub const VT_PROCESS: libc::c_char = 0x01;
    pub const VT_ACKACQ: libc::c_int = 0x02;

    #[repr(C)]
    #[derive(Debug, Clone, Copy, Default)]
    pub struct VtMode {
        /// vt mode
        pub mode: libc::c_char,
        /// if set, hang on writes if not active
        pub waitv: libc::c_char,
        /// signal to raise on release req
        pub relsig: libc::c_short,
        /// signal to raise on acquisition
        pub acqsig: libc::c_short,
        /// unused, set to 0
        pub frsig: libc::c_short,
    }

    pub fn ioctl_int(fd: BorrowedFd<'_>, request: libc::c_ulong, arg: libc::c_int) -> io::Result<()> {
        if unsafe { libc::ioctl(fd.as_raw_fd(), request as _, arg) } < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    pub fn ioctl_read_int(fd: BorrowedFd<'_>, request: libc::c_ulong) -> io::Result<libc::c_int> {
        let mut val: libc::c_int = 0;
        if unsafe { libc::ioctl(fd.as_raw_fd(), request as _, &mut val) } < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(val)
        }
    }

    pub fn set_vt_mode(fd: BorrowedFd<'_>, mode: &VtMode) -> io::Result<()> {
        if unsafe { libc::ioctl(fd.as_raw_fd(), VT_SETMODE as _, mode) } < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

const TTY_MAJOR: u32 = 4;

fn is_tty_device(dev: u64) -> bool {
    major(dev) == TTY_MAJOR && minor(dev) != 0
}

/// [`Session`] via the virtual terminal direct kernel interface
#[derive(Debug, Clone)]
pub struct DirectSession {
    tty: Arc<OwnedFd>,
    active: Arc<AtomicBool>,
    vt: i32,
    seat: String,
}

/// Notifier of the [`DirectSession`], a [`calloop::EventSource`] over the
/// VT signal.
#[derive(Debug)]
pub struct DirectSessionNotifier {
    tty: Arc<OwnedFd>,
    active: Arc<AtomicBool>,
    signal_fd: OwnedFd,
    old_keyboard_mode: libc::c_int,
    token: Option<Token>,
    span: tracing::Span,
}

/// Errors of the direct session.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failed to open the tty device
    #[error("failed to open tty `{0}`: {1}")]
    FailedToOpenTTY(String, #[source] io::Error),
    /// The process is not attached to a tty
    #[error("not running from a tty")]
    NotRunningFromTTY,
    /// Another compositor already put the tty into graphics mode
    #[error("the tty is already in graphics mode, is another compositor running?")]
    TTYAlreadyInGraphicsMode,
    /// One of the tty setup ioctls failed
    #[error("failed to set up tty {0}: {1}")]
    FailedToSetupTTY(i32, #[source] io::Error),
    /// Creating the signalfd failed
    #[error("failed to create signalfd: {0}")]
    FailedToCreateSignalFd(#[source] io::Error),
    /// The path does not point to a managed device node
    #[error("path is not a managed device node")]
    NotManaged,
    /// Opening a device failed
    #[error("failed to open device: {0}")]
    FailedToOpenDevice(#[source] rustix::io::Errno),
    /// The VT change ioctl failed
    #[error("failed to change vt: {0}")]
    FailedToChangeVt(#[source] io::Error),
}

impl AsErrno for Error {
    fn as_errno(&self) -> Option<i32> {
        match self {
            Error::FailedToOpenDevice(errno) => Some(errno.raw_os_error()),
            Error::FailedToOpenTTY(_, err) | Error::FailedToChangeVt(err) => err.raw_os_error(),
            _ => None,
        }
    }
}

impl DirectSession {
    /// Tries to create a new session via the legacy virtual terminal
    /// interface.
    ///
    /// If no tty device path is provided, the tty this process was started
    /// from is used.
    pub fn new(tty: Option<&Path>) -> Result<(DirectSession, DirectSessionNotifier), Error> {
        let span = info_span!("backend_session", session_type = "direct/vt");
        let _guard = span.enter();

        let fd = match tty {
            Some(path) => rustix::fs::open(
                path,
                OFlags::RDWR | OFlags::CLOEXEC | OFlags::NOCTTY,
                Mode::empty(),
            )
            .map_err(|err| {
                Error::FailedToOpenTTY(path.to_string_lossy().into_owned(), err.into())
            })?,
            None => {
                // stdin
                rustix::io::dup(unsafe { BorrowedFd::borrow_raw(0) })
                    .map_err(|err| Error::FailedToOpenTTY(String::from("<stdin>"), err.into()))?
            }
        };

        let (vt, old_keyboard_mode) = setup_tty(fd.as_fd())?;
        info!(vt, "Running from tty");

        let signal_fd = create_signal_fd().map_err(Error::FailedToCreateSignalFd)?;

        let tty = Arc::new(fd);
        let active = Arc::new(AtomicBool::new(true));
        let seat = String::from("seat0");

        drop(_guard);
        Ok((
            DirectSession {
                tty: tty.clone(),
                active: active.clone(),
                vt,
                seat,
            },
            DirectSessionNotifier {
                tty,
                active,
                signal_fd,
                old_keyboard_mode,
                token: None,
                span,
            },
        ))
    }

    /// The number of the virtual terminal used by this session.
    pub fn vt(&self) -> i32 {
        self.vt
    }
}

fn setup_tty(tty: BorrowedFd<'_>) -> Result<(i32, libc::c_int), Error> {
    let stat = fstat(tty).map_err(|_| Error::NotRunningFromTTY)?;
    if !is_tty_device(stat.st_rdev) {
        return Err(Error::NotRunningFromTTY);
    }

    let vt = minor(stat.st_rdev) as i32;

    let mode = tty::ioctl_read_int(tty, tty::KDGETMODE).map_err(|_| Error::NotRunningFromTTY)?;
    if mode != tty::KD_TEXT {
        return Err(Error::TTYAlreadyInGraphicsMode);
    }

    tty::ioctl_int(tty, tty::VT_ACTIVATE, vt).map_err(|err| Error::FailedToSetupTTY(vt, err))?;
    tty::ioctl_int(tty, tty::VT_WAITACTIVE, vt).map_err(|err| Error::FailedToSetupTTY(vt, err))?;

    let old_keyboard_mode =
        tty::ioctl_read_int(tty, tty::KDGKBMODE).map_err(|err| Error::FailedToSetupTTY(vt, err))?;
    tty::ioctl_int(tty, tty::KDSKBMODE, tty::K_OFF)
        .map_err(|err| Error::FailedToSetupTTY(vt, err))?;
    tty::ioctl_int(tty, tty::KDSETMODE, tty::KD_GRAPHICS)
        .map_err(|err| Error::FailedToSetupTTY(vt, err))?;

    let mode = tty::VtMode {
        mode: tty::VT_PROCESS,
        relsig: libc::SIGUSR2 as libc::c_short,
        acqsig: libc::SIGUSR2 as libc::c_short,
        ..Default::default()
    };
    tty::set_vt_mode(tty, &mode).map_err(|err| Error::FailedToSetupTTY(vt, err))?;

    Ok((vt, old_keyboard_mode))
}

/// Blocks `SIGUSR2` for the process and returns a signalfd delivering it.
fn create_signal_fd() -> io::Result<OwnedFd> {
    unsafe {
        let mut mask: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut mask);
        libc::sigaddset(&mut mask, libc::SIGUSR2);
        if libc::pthread_sigmask(libc::SIG_BLOCK, &mask, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = libc::signalfd(-1, &mask, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(OwnedFd::from_raw_fd(fd))
    }
}

impl Session for DirectSession {
    type Error = Error;

    fn open(&mut self, path: &Path, flags: OFlags) -> Result<OwnedFd, Self::Error> {
        if !is_managed_device_path(path) {
            return Err(Error::NotManaged);
        }
        debug!("Opening device: {:?}", path);
        rustix::fs::open(
            path,
            flags | OFlags::CLOEXEC | OFlags::NOCTTY | OFlags::NONBLOCK,
            Mode::empty(),
        )
        .map_err(Error::FailedToOpenDevice)
    }

    fn close(&mut self, fd: OwnedFd) -> Result<(), Self::Error> {
        debug!("Closing device: {:?}", fd);
        drop(fd);
        Ok(())
    }

    fn change_vt(&mut self, vt: i32) -> Result<(), Self::Error> {
        tty::ioctl_int(self.tty.as_fd(), tty::VT_ACTIVATE, vt).map_err(Error::FailedToChangeVt)
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn seat(&self) -> String {
        // the VT api can only drive seat0
        self.seat.clone()
    }
}

impl DirectSessionNotifier {
    fn signal_received(&mut self, mut callback: impl FnMut(SessionEvent)) {
        if self.active.load(Ordering::SeqCst) {
            info!(parent: &self.span, "Session is about to become inactive");
            self.active.store(false, Ordering::SeqCst);
            callback(SessionEvent::Pause);
            if let Err(err) = tty::ioctl_int(self.tty.as_fd(), tty::VT_RELDISP, 1) {
                error!(parent: &self.span, "Unable to release tty lock: {}", err);
            }
        } else {
            debug!(parent: &self.span, "Session will become active again");
            if let Err(err) = tty::ioctl_int(self.tty.as_fd(), tty::VT_RELDISP, tty::VT_ACKACQ) {
                error!(parent: &self.span, "Unable to acquire tty lock: {}", err);
            }
            self.active.store(true, Ordering::SeqCst);
            callback(SessionEvent::Activate);
        }
    }

    fn drain_signals(&mut self) -> usize {
        // each pending signal is one siginfo record
        let mut count = 0;
        let mut buf = [0u8; std::mem::size_of::<libc::signalfd_siginfo>()];
        while matches!(rustix::io::read(&self.signal_fd, &mut buf), Ok(n) if n > 0) {
            count += 1;
        }
        count
    }
}

impl Drop for DirectSessionNotifier {
    fn drop(&mut self) {
        let _guard = self.span.enter();
        info!("Deallocating tty");
        let tty = self.tty.as_fd();
        if let Err(err) = tty::ioctl_int(tty, tty::KDSKBMODE, self.old_keyboard_mode) {
            warn!("Unable to restore vt keyboard mode: {}", err);
        }
        if let Err(err) = tty::ioctl_int(tty, tty::KDSETMODE, tty::KD_TEXT) {
            warn!("Unable to restore vt text mode: {}", err);
        }
        if let Err(err) = tty::set_vt_mode(
            tty,
            &tty::VtMode {
                mode: tty::VT_AUTO,
                ..Default::default()
            },
        ) {
            error!("Failed to reset vt handling: {}", err);
        }
    }
}

impl EventSource for DirectSessionNotifier {
    type Event = SessionEvent;
    type Metadata = ();
    type Ret = ();
    type Error = io::Error;

    fn process_events<F>(
        &mut self,
        _: Readiness,
        token: Token,
        mut callback: F,
    ) -> io::Result<PostAction>
    where
        F: FnMut(SessionEvent, &mut ()),
    {
        if Some(token) == self.token {
            let pending = self.drain_signals();
            for _ in 0..pending {
                self.signal_received(|event| callback(event, &mut ()));
            }
        }
        Ok(PostAction::Continue)
    }

    fn register(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        let token = factory.token();
        unsafe {
            poll.register(
                self.signal_fd.as_fd(),
                Interest::READ,
                CalloopMode::Level,
                token,
            )?;
        }
        self.token = Some(token);
        Ok(())
    }

    fn reregister(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        let token = factory.token();
        poll.reregister(
            self.signal_fd.as_fd(),
            Interest::READ,
            CalloopMode::Level,
            token,
        )?;
        self.token = Some(token);
        Ok(())
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        self.token = None;
        poll.unregister(self.signal_fd.as_fd())
    }
}
