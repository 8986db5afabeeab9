//!
//! Implementation of the [`Session`] trait through various implementations
//! automatically choosing the best available interface.
//!
//! The interfaces are tried in the following priority:
//!  1. logind over D-Bus (no special process permissions needed)
//!  2. direct virtual terminal ioctls (requires tty write access)
//!  3. noop (plain `open(2)`, always active, no VT switching)
//!
//! [`AutoSession::new`] returns the session handle together with its
//! notifier. The notifier is a [`calloop::EventSource`] producing
//! [`SessionEvent`]s and must be inserted into the event loop for the
//! session state to be tracked:
//!
//! ```no_run
//! use scanout::backend::session::{auto::AutoSession, SessionEvent};
//!
//! let mut event_loop = calloop::EventLoop::<()>::try_new().unwrap();
//! let (session, notifier) = AutoSession::new().unwrap();
//! event_loop
//!     .handle()
//!     .insert_source(notifier, |event, _, _| match event {
//!         SessionEvent::Pause => { /* stop rendering, input is revoked */ }
//!         SessionEvent::Activate => { /* rescan outputs, resume */ }
//!         _ => {}
//!     })
//!     .unwrap();
//! ```

use std::os::unix::io::OwnedFd;
use std::path::Path;

use calloop::{EventSource, Poll, PostAction, Readiness, Token, TokenFactory};
use rustix::fs::OFlags;
use tracing::{info, warn};

use super::{direct, noop, AsErrno, Session, SessionEvent};
#[cfg(feature = "backend_session_logind")]
use super::logind;

/// [`Session`] using the best available interface.
#[derive(Debug, Clone)]
pub enum AutoSession {
    /// Logind session
    #[cfg(feature = "backend_session_logind")]
    Logind(logind::LogindSession),
    /// Direct / tty session
    Direct(direct::DirectSession),
    /// Noop session
    Noop(noop::NoopSession),
}

/// Notifier of the [`AutoSession`].
#[derive(Debug)]
pub enum AutoSessionNotifier {
    /// Logind session notifier
    #[cfg(feature = "backend_session_logind")]
    Logind(logind::LogindSessionNotifier),
    /// Direct / tty session notifier
    Direct(direct::DirectSessionNotifier),
    /// The noop session emits no events
    Noop,
}

/// Errors of the [`AutoSession`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Logind session error
    #[cfg(feature = "backend_session_logind")]
    #[error(transparent)]
    Logind(#[from] logind::Error),
    /// Direct session error
    #[error(transparent)]
    Direct(#[from] direct::Error),
    /// Noop session error
    #[error(transparent)]
    Noop(#[from] noop::Error),
}

impl AsErrno for Error {
    fn as_errno(&self) -> Option<i32> {
        match self {
            #[cfg(feature = "backend_session_logind")]
            Error::Logind(err) => err.as_errno(),
            Error::Direct(err) => err.as_errno(),
            Error::Noop(err) => err.as_errno(),
        }
    }
}

impl AutoSession {
    /// Tries to create a new session via the best available interface.
    pub fn new() -> Option<(AutoSession, AutoSessionNotifier)> {
        #[cfg(feature = "backend_session_logind")]
        {
            info!("Trying to create a logind session");
            match logind::LogindSession::new() {
                Ok((session, notifier)) => {
                    return Some((
                        AutoSession::Logind(session),
                        AutoSessionNotifier::Logind(notifier),
                    ))
                }
                Err(err) => {
                    warn!("Failed to create logind session: {}", err);
                }
            }
        }

        info!("Trying to create a tty session");
        match direct::DirectSession::new(None) {
            Ok((session, notifier)) => {
                return Some((
                    AutoSession::Direct(session),
                    AutoSessionNotifier::Direct(notifier),
                ))
            }
            Err(err) => {
                warn!("Failed to create direct session: {}", err);
            }
        }

        info!("Falling back to a noop session");
        Some((
            AutoSession::Noop(noop::NoopSession::new()),
            AutoSessionNotifier::Noop,
        ))
    }

    /// The VT this session runs on, if any.
    pub fn vt(&self) -> Option<i32> {
        match self {
            #[cfg(feature = "backend_session_logind")]
            AutoSession::Logind(_) => std::env::var("XDG_VTNR").ok().and_then(|vt| vt.parse().ok()),
            AutoSession::Direct(session) => Some(session.vt()),
            AutoSession::Noop(_) => None,
        }
    }
}

impl Session for AutoSession {
    type Error = Error;

    fn open(&mut self, path: &Path, flags: OFlags) -> Result<OwnedFd, Self::Error> {
        match self {
            #[cfg(feature = "backend_session_logind")]
            AutoSession::Logind(session) => session.open(path, flags).map_err(Into::into),
            AutoSession::Direct(session) => session.open(path, flags).map_err(Into::into),
            AutoSession::Noop(session) => session.open(path, flags).map_err(Into::into),
        }
    }

    fn close(&mut self, fd: OwnedFd) -> Result<(), Self::Error> {
        match self {
            #[cfg(feature = "backend_session_logind")]
            AutoSession::Logind(session) => session.close(fd).map_err(Into::into),
            AutoSession::Direct(session) => session.close(fd).map_err(Into::into),
            AutoSession::Noop(session) => session.close(fd).map_err(Into::into),
        }
    }

    fn change_vt(&mut self, vt: i32) -> Result<(), Self::Error> {
        match self {
            #[cfg(feature = "backend_session_logind")]
            AutoSession::Logind(session) => session.change_vt(vt).map_err(Into::into),
            AutoSession::Direct(session) => session.change_vt(vt).map_err(Into::into),
            AutoSession::Noop(session) => session.change_vt(vt).map_err(Into::into),
        }
    }

    fn is_active(&self) -> bool {
        match self {
            #[cfg(feature = "backend_session_logind")]
            AutoSession::Logind(session) => session.is_active(),
            AutoSession::Direct(session) => session.is_active(),
            AutoSession::Noop(session) => session.is_active(),
        }
    }

    fn seat(&self) -> String {
        match self {
            #[cfg(feature = "backend_session_logind")]
            AutoSession::Logind(session) => session.seat(),
            AutoSession::Direct(session) => session.seat(),
            AutoSession::Noop(session) => session.seat(),
        }
    }
}

impl EventSource for AutoSessionNotifier {
    type Event = SessionEvent;
    type Metadata = ();
    type Ret = ();
    type Error = std::io::Error;

    fn process_events<F>(
        &mut self,
        readiness: Readiness,
        token: Token,
        callback: F,
    ) -> std::io::Result<PostAction>
    where
        F: FnMut(SessionEvent, &mut ()),
    {
        match self {
            #[cfg(feature = "backend_session_logind")]
            AutoSessionNotifier::Logind(notifier) => notifier.process_events(readiness, token, callback),
            AutoSessionNotifier::Direct(notifier) => notifier.process_events(readiness, token, callback),
            AutoSessionNotifier::Noop => Ok(PostAction::Continue),
        }
    }

    fn register(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        match self {
            #[cfg(feature = "backend_session_logind")]
            AutoSessionNotifier::Logind(notifier) => notifier.register(poll, factory),
            AutoSessionNotifier::Direct(notifier) => notifier.register(poll, factory),
            AutoSessionNotifier::Noop => Ok(()),
        }
    }

    fn reregister(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        match self {
            #[cfg(feature = "backend_session_logind")]
            AutoSessionNotifier::Logind(notifier) => notifier.reregister(poll, factory),
            AutoSessionNotifier::Direct(notifier) => notifier.reregister(poll, factory),
            AutoSessionNotifier::Noop => Ok(()),
        }
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        match self {
            #[cfg(feature = "backend_session_logind")]
            AutoSessionNotifier::Logind(notifier) => notifier.unregister(poll),
            AutoSessionNotifier::Direct(notifier) => notifier.unregister(poll),
            AutoSessionNotifier::Noop => Ok(()),
        }
    }
}
