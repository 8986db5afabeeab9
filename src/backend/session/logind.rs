//!
//! Implementation of the [`Session`] trait through the logind dbus interface.
//!
//! This requires systemd-logind (or elogind) to be available and the process
//! to be started inside a logind session. Device access is brokered through
//! `TakeDevice`/`ReleaseDevice`, so no special permissions on the device
//! nodes are needed.
//!
//! The notifier listens for `PauseDevice`/`ResumeDevice` and for the
//! session `Active` property: on a VT switch away, logind revokes the
//! devices and the notifier emits [`SessionEvent::Pause`]; on a switch back
//! it re-issues DRM master (optionally with a replacement fd) and the
//! notifier emits [`SessionEvent::Activate`].

use std::cell::RefCell;
use std::collections::VecDeque;
use std::os::unix::io::{BorrowedFd, FromRawFd, OwnedFd};
use std::path::Path;
use std::rc::{Rc, Weak};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use calloop::{EventSource, Interest, Mode, Poll, PostAction, Readiness, Token, TokenFactory};
use dbus::{
    arg::{prop_cast, PropMap},
    blocking::LocalConnection,
    message::MatchRule,
    Path as DbusPath,
};
use rustix::fs::{major, makedev, minor, OFlags};
use tracing::{debug, error, info, info_span, instrument, warn};

use super::{is_managed_device_path, AsErrno, Session, SessionEvent};

const LOGIND_DEST: &str = "org.freedesktop.login1";
const SESSION_INTERFACE: &str = "org.freedesktop.login1.Session";
const DBUS_TIMEOUT: Duration = Duration::from_millis(1000);

type EventQueue = Rc<RefCell<VecDeque<SessionEvent>>>;

struct LogindSessionImpl {
    conn: LocalConnection,
    session_path: DbusPath<'static>,
    active: Arc<AtomicBool>,
    seat: String,
    vt: Option<i32>,
}

/// [`Session`] via the logind dbus interface
#[derive(Clone)]
pub struct LogindSession {
    internal: Weak<LogindSessionImpl>,
    seat: String,
    span: tracing::Span,
}

impl std::fmt::Debug for LogindSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogindSession").field("seat", &self.seat).finish()
    }
}

/// Notifier of the [`LogindSession`], a [`calloop::EventSource`] over the
/// dbus connection.
pub struct LogindSessionNotifier {
    internal: Rc<LogindSessionImpl>,
    pending: EventQueue,
    token: Option<Token>,
    span: tracing::Span,
}

impl std::fmt::Debug for LogindSessionNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogindSessionNotifier")
            .field("session_path", &self.internal.session_path)
            .finish()
    }
}

/// Errors of the logind session.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No logind session could be found for this process
    #[error("failed to get logind session: {0}")]
    FailedToGetSession(#[source] dbus::Error),
    /// Connecting to the system bus failed
    #[error("failed to connect to the system dbus: {0}")]
    FailedDbusConnection(#[source] dbus::Error),
    /// A dbus method call failed
    #[error("dbus call `{0}` failed: {1}")]
    Call(&'static str, #[source] dbus::Error),
    /// Installing a dbus signal match failed
    #[error("failed to set up dbus match rule: {0}")]
    Match(#[source] dbus::Error),
    /// Failed to stat a device node
    #[error("failed to stat device: {0}")]
    FailedToStatDevice(#[source] rustix::io::Errno),
    /// The path does not point to a managed device node
    #[error("path is not a managed device node")]
    NotManaged,
    /// The session is already closed
    #[error("session is already closed")]
    SessionLost,
}

impl AsErrno for Error {
    fn as_errno(&self) -> Option<i32> {
        match self {
            Error::FailedToStatDevice(errno) => Some(errno.raw_os_error()),
            _ => None,
        }
    }
}

impl LogindSession {
    /// Tries to create a new session via the logind dbus interface.
    pub fn new() -> Result<(LogindSession, LogindSessionNotifier), Error> {
        let span = info_span!("backend_session", session_type = "logind");
        let _guard = span.enter();

        let session_id = std::env::var("XDG_SESSION_ID").unwrap_or_else(|_| String::from("auto"));
        let seat = std::env::var("XDG_SEAT").unwrap_or_else(|_| String::from("seat0"));
        let vt = std::env::var("XDG_VTNR").ok().and_then(|vt| vt.parse().ok());

        let conn = LocalConnection::new_system().map_err(Error::FailedDbusConnection)?;

        let session_path = {
            let proxy = conn.with_proxy(LOGIND_DEST, "/org/freedesktop/login1", DBUS_TIMEOUT);
            let (path,): (DbusPath<'static>,) = proxy
                .method_call(
                    "org.freedesktop.login1.Manager",
                    "GetSession",
                    (session_id.clone(),),
                )
                .map_err(Error::FailedToGetSession)?;
            path
        };
        info!(id = %session_id, seat = %seat, path = %session_path, "Session found");

        // Activate (switch to) the session and take control
        {
            let proxy = conn.with_proxy(LOGIND_DEST, session_path.clone(), DBUS_TIMEOUT);
            let _: () = proxy
                .method_call(SESSION_INTERFACE, "Activate", ())
                .map_err(|err| Error::Call("Activate", err))?;
            let _: () = proxy
                .method_call(SESSION_INTERFACE, "TakeControl", (false,))
                .map_err(|err| Error::Call("TakeControl", err))?;
        }

        let active = Arc::new(AtomicBool::new(true));
        let pending: EventQueue = Rc::new(RefCell::new(VecDeque::new()));

        add_signal_matches(&conn, &session_path, &active, &pending)?;

        let internal = Rc::new(LogindSessionImpl {
            conn,
            session_path,
            active,
            seat: seat.clone(),
            vt,
        });

        drop(_guard);
        Ok((
            LogindSession {
                internal: Rc::downgrade(&internal),
                seat,
                span: span.clone(),
            },
            LogindSessionNotifier {
                internal,
                pending,
                token: None,
                span,
            },
        ))
    }
}

fn add_signal_matches(
    conn: &LocalConnection,
    session_path: &DbusPath<'static>,
    active: &Arc<AtomicBool>,
    pending: &EventQueue,
) -> Result<(), Error> {
    {
        let active = active.clone();
        let pending = pending.clone();
        let rule = MatchRule::new_signal("org.freedesktop.login1.Manager", "SessionRemoved")
            .with_sender(LOGIND_DEST)
            .with_path("/org/freedesktop/login1");
        conn.add_match(rule, move |(_id, _path): (String, DbusPath<'static>), _, _| {
            error!("Session got closed by logind");
            // this session will never live again, put it to sleep forever
            active.store(false, Ordering::SeqCst);
            pending.borrow_mut().push_back(SessionEvent::Pause);
            true
        })
        .map_err(Error::Match)?;
    }

    {
        let pending = pending.clone();
        let path = session_path.clone();
        let rule = MatchRule::new_signal(SESSION_INTERFACE, "PauseDevice")
            .with_sender(LOGIND_DEST)
            .with_path(session_path.clone());
        conn.add_match(
            rule,
            move |(major, minor, pause_type): (u32, u32, String), conn: &LocalConnection, _| {
                debug!(
                    "Request of type \"{}\" to pause device ({},{})",
                    pause_type, major, minor
                );
                pending.borrow_mut().push_back(SessionEvent::DevicePause {
                    device: makedev(major, minor),
                });
                // "force" and "gone" expect no acknowledgement, "pause" does.
                if pause_type == "pause" {
                    let proxy = conn.with_proxy(LOGIND_DEST, path.clone(), DBUS_TIMEOUT);
                    let result: Result<(), _> =
                        proxy.method_call(SESSION_INTERFACE, "PauseDeviceComplete", (major, minor));
                    if let Err(err) = result {
                        warn!("Failed to acknowledge device pause: {}", err);
                    }
                }
                true
            },
        )
        .map_err(Error::Match)?;
    }

    {
        let pending = pending.clone();
        let rule = MatchRule::new_signal(SESSION_INTERFACE, "ResumeDevice")
            .with_sender(LOGIND_DEST)
            .with_path(session_path.clone());
        conn.add_match(
            rule,
            move |(major, minor, fd): (u32, u32, dbus::arg::OwnedFd), _, _| {
                debug!("Reactivating device ({},{})", major, minor);
                let fd = unsafe { OwnedFd::from_raw_fd(fd.into_fd()) };
                pending.borrow_mut().push_back(SessionEvent::DeviceActivate {
                    device: makedev(major, minor),
                    fd: Some(fd),
                });
                true
            },
        )
        .map_err(Error::Match)?;
    }

    {
        let active = active.clone();
        let pending = pending.clone();
        let rule = MatchRule::new_signal("org.freedesktop.DBus.Properties", "PropertiesChanged")
            .with_sender(LOGIND_DEST)
            .with_path(session_path.clone());
        conn.add_match(
            rule,
            move |(_interface, changed, _invalidated): (String, PropMap, Vec<String>), _, _| {
                if let Some(&new_active) = prop_cast::<bool>(&changed, "Active") {
                    let was_active = active.swap(new_active, Ordering::SeqCst);
                    if new_active != was_active {
                        pending.borrow_mut().push_back(if new_active {
                            SessionEvent::Activate
                        } else {
                            SessionEvent::Pause
                        });
                    }
                }
                true
            },
        )
        .map_err(Error::Match)?;
    }

    Ok(())
}

impl LogindSessionNotifier {
    /// Creates a new session handle belonging to this notifier.
    pub fn session(&self) -> LogindSession {
        LogindSession {
            internal: Rc::downgrade(&self.internal),
            seat: self.internal.seat.clone(),
            span: self.span.clone(),
        }
    }

    /// The VT of this session, if it runs on one.
    pub fn vt(&self) -> Option<i32> {
        self.internal.vt
    }
}

impl Session for LogindSession {
    type Error = Error;

    #[instrument(parent = &self.span, skip(self, flags))]
    fn open(&mut self, path: &Path, flags: OFlags) -> Result<OwnedFd, Self::Error> {
        let session = self.internal.upgrade().ok_or(Error::SessionLost)?;
        if !is_managed_device_path(path) {
            return Err(Error::NotManaged);
        }
        let _ = flags; // logind decides the open flags itself

        let stat = rustix::fs::stat(path).map_err(Error::FailedToStatDevice)?;
        let proxy = session
            .conn
            .with_proxy(LOGIND_DEST, session.session_path.clone(), DBUS_TIMEOUT);
        let (fd, _paused): (dbus::arg::OwnedFd, bool) = proxy
            .method_call(
                SESSION_INTERFACE,
                "TakeDevice",
                (major(stat.st_rdev), minor(stat.st_rdev)),
            )
            .map_err(|err| Error::Call("TakeDevice", err))?;
        debug!("Opened device: {:?}", path);
        Ok(unsafe { OwnedFd::from_raw_fd(fd.into_fd()) })
    }

    #[instrument(parent = &self.span, skip(self))]
    fn close(&mut self, fd: OwnedFd) -> Result<(), Self::Error> {
        let session = self.internal.upgrade().ok_or(Error::SessionLost)?;
        let stat = rustix::fs::fstat(&fd).map_err(Error::FailedToStatDevice)?;
        let proxy = session
            .conn
            .with_proxy(LOGIND_DEST, session.session_path.clone(), DBUS_TIMEOUT);
        let result: () = proxy
            .method_call(
                SESSION_INTERFACE,
                "ReleaseDevice",
                (major(stat.st_rdev), minor(stat.st_rdev)),
            )
            .map_err(|err| Error::Call("ReleaseDevice", err))?;
        // the fd itself is closed on drop
        Ok(result)
    }

    #[instrument(parent = &self.span, skip(self))]
    fn change_vt(&mut self, vt: i32) -> Result<(), Self::Error> {
        let session = self.internal.upgrade().ok_or(Error::SessionLost)?;
        let proxy = session
            .conn
            .with_proxy(LOGIND_DEST, "/org/freedesktop/login1/seat/self", DBUS_TIMEOUT);
        proxy
            .method_call("org.freedesktop.login1.Seat", "SwitchTo", (vt as u32,))
            .map_err(|err| Error::Call("SwitchTo", err))
    }

    fn is_active(&self) -> bool {
        self.internal
            .upgrade()
            .map(|internal| internal.active.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn seat(&self) -> String {
        self.seat.clone()
    }
}

impl Drop for LogindSessionNotifier {
    fn drop(&mut self) {
        info!(parent: &self.span, "Closing logind session");
        // release control again, dropping the connection does the rest
        let proxy = self.internal.conn.with_proxy(
            LOGIND_DEST,
            self.internal.session_path.clone(),
            DBUS_TIMEOUT,
        );
        let result: Result<(), _> = proxy.method_call(SESSION_INTERFACE, "ReleaseControl", ());
        if let Err(err) = result {
            warn!(parent: &self.span, "Failed to release session control: {}", err);
        }
    }
}

impl EventSource for LogindSessionNotifier {
    type Event = SessionEvent;
    type Metadata = ();
    type Ret = ();
    type Error = std::io::Error;

    #[profiling::function]
    fn process_events<F>(
        &mut self,
        _: Readiness,
        token: Token,
        mut callback: F,
    ) -> std::io::Result<PostAction>
    where
        F: FnMut(SessionEvent, &mut ()),
    {
        if Some(token) == self.token {
            // drain everything the bus has for us, the match callbacks
            // translate the signals into queued events
            loop {
                match self.internal.conn.process(Duration::from_millis(0)) {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(err) => {
                        // connection lost, downgrade to inactive for good
                        error!(parent: &self.span, "Lost dbus connection: {}", err);
                        if self.internal.active.swap(false, Ordering::SeqCst) {
                            callback(SessionEvent::Pause, &mut ());
                        }
                        return Ok(PostAction::Disable);
                    }
                }
            }
        }
        while let Some(event) = self.pending.borrow_mut().pop_front() {
            callback(event, &mut ());
        }
        Ok(PostAction::Continue)
    }

    fn register(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        let token = factory.token();
        let watch = self.internal.conn.channel().watch();
        unsafe {
            poll.register(
                BorrowedFd::borrow_raw(watch.fd),
                Interest::READ,
                Mode::Level,
                token,
            )?;
        }
        self.token = Some(token);
        Ok(())
    }

    fn reregister(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        let token = factory.token();
        let watch = self.internal.conn.channel().watch();
        poll.reregister(
            unsafe { BorrowedFd::borrow_raw(watch.fd) },
            Interest::READ,
            Mode::Level,
            token,
        )?;
        self.token = Some(token);
        Ok(())
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        let watch = self.internal.conn.channel().watch();
        self.token = None;
        poll.unregister(unsafe { BorrowedFd::borrow_raw(watch.fd) })
    }
}
