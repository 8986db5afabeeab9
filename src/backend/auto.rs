//! Automatic backend selection.
//!
//! [`auto_create`] inspects the environment and assembles the backend tree
//! most compositors want:
//!
//! | Environment            | Backend tree                              |
//! |------------------------|-------------------------------------------|
//! | `WAYLAND_DISPLAY` set  | nested Wayland                            |
//! | `DISPLAY` set          | nested X11                                |
//! | `WLR_BACKENDS` set     | explicit comma-separated list             |
//! | otherwise              | Multi { libinput, DRM } atop a session    |
//!
//! `WLR_WL_OUTPUTS` and `WLR_X11_OUTPUTS` control how many nested outputs
//! are created (default 1).

use rustix::fs::OFlags;
use std::os::unix::io::OwnedFd;
use tracing::{info, warn};

use super::multi::MultiBackend;
#[cfg(feature = "backend_session")]
use super::session::{
    auto::{AutoSession, AutoSessionNotifier},
    Session,
};
use super::BackendError;
use crate::utils::fd::DeviceFd;

/// The backends the selector can instantiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Nested Wayland client backend
    Wayland,
    /// Nested X11 client backend
    X11,
    /// Direct DRM/KMS backend
    Drm,
    /// Libinput input backend
    Libinput,
    /// Headless backend
    Headless,
    /// RDP remoting backend
    Rdp,
    /// Noop backend
    Noop,
}

/// Errors of the auto-selector.
#[derive(Debug, thiserror::Error)]
pub enum AutoError {
    /// `WLR_BACKENDS` names a backend this crate does not know
    #[error("unknown backend `{0}` in WLR_BACKENDS")]
    UnknownBackend(String),
    /// The selected backend is not compiled in
    #[error("backend `{0}` is not available in this build")]
    Unavailable(&'static str),
    /// No session could be created for the chosen backends
    #[error("no session available")]
    NoSession,
    /// No GPU was found on the seat
    #[error("no gpu found on the seat")]
    NoGpu,
    /// Opening the GPU device through the session failed
    #[error("failed to open the gpu device: {0}")]
    OpenDevice(String),
    /// Creating one of the backends failed
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Environment snapshot the decision is made from.
#[derive(Debug, Default, Clone)]
struct SelectionEnv {
    wayland_display: bool,
    x11_display: bool,
    explicit: Option<String>,
}

impl SelectionEnv {
    fn capture() -> SelectionEnv {
        SelectionEnv {
            wayland_display: std::env::var_os("WAYLAND_DISPLAY").is_some(),
            x11_display: std::env::var_os("DISPLAY").is_some(),
            explicit: std::env::var("WLR_BACKENDS").ok(),
        }
    }
}

fn parse_backend_list(list: &str) -> Result<Vec<BackendKind>, AutoError> {
    list.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| match name {
            "wayland" => Ok(BackendKind::Wayland),
            "x11" => Ok(BackendKind::X11),
            "drm" => Ok(BackendKind::Drm),
            "libinput" => Ok(BackendKind::Libinput),
            "headless" => Ok(BackendKind::Headless),
            "rdp" => Ok(BackendKind::Rdp),
            "noop" => Ok(BackendKind::Noop),
            other => Err(AutoError::UnknownBackend(other.to_owned())),
        })
        .collect()
}

/// The decision table itself, separated from construction.
fn select(env: &SelectionEnv) -> Result<Vec<BackendKind>, AutoError> {
    if env.wayland_display {
        return Ok(vec![BackendKind::Wayland]);
    }
    if env.x11_display {
        return Ok(vec![BackendKind::X11]);
    }
    if let Some(list) = &env.explicit {
        return parse_backend_list(list);
    }
    Ok(vec![BackendKind::Libinput, BackendKind::Drm])
}

fn output_count(var: &str) -> u32 {
    match std::env::var(var) {
        Ok(value) => match value.parse::<i64>() {
            Ok(count) if count >= 0 => count as u32,
            _ => {
                warn!("{} specified with an invalid count, ignoring", var);
                1
            }
        },
        Err(_) => 1,
    }
}

/// Session half of the tree built by [`auto_create`].
#[cfg(feature = "backend_session")]
pub type SessionPair = (AutoSession, AutoSessionNotifier);
/// Session half of the tree built by [`auto_create`] (session support
/// disabled in this build).
#[cfg(not(feature = "backend_session"))]
pub type SessionPair = ();

/// Builds the backend tree for the current environment.
///
/// Returns the composed backend plus, when the direct DRM/libinput path was
/// chosen, the session it runs on. Insert the backend *and* the session
/// notifier into your event loop, and forward
/// [`SessionEvent`](crate::backend::session::SessionEvent)s to
/// [`Backend::suspend`](super::Backend::suspend)/
/// [`resume`](super::Backend::resume).
pub fn auto_create() -> Result<(MultiBackend, Option<SessionPair>), AutoError> {
    let env = SelectionEnv::capture();
    let kinds = select(&env)?;
    info!("Selected backends: {:?}", kinds);

    let mut multi = MultiBackend::new();
    let mut session: Option<SessionPair> = None;

    for kind in kinds {
        match kind {
            BackendKind::Wayland => {
                #[cfg(feature = "backend_wayland")]
                {
                    let mut backend =
                        super::wayland::WaylandBackend::new().map_err(BackendError::Wayland)?;
                    for _ in 0..output_count("WLR_WL_OUTPUTS") {
                        backend.create_output().map_err(BackendError::Wayland)?;
                    }
                    multi.add(backend)?;
                }
                #[cfg(not(feature = "backend_wayland"))]
                return Err(AutoError::Unavailable("wayland"));
            }
            BackendKind::X11 => {
                #[cfg(feature = "backend_x11")]
                {
                    let mut backend = super::x11::X11Backend::new().map_err(BackendError::X11)?;
                    for _ in 0..output_count("WLR_X11_OUTPUTS") {
                        backend.create_output().map_err(BackendError::X11)?;
                    }
                    multi.add(backend)?;
                }
                #[cfg(not(feature = "backend_x11"))]
                return Err(AutoError::Unavailable("x11"));
            }
            BackendKind::Headless => {
                #[cfg(feature = "backend_headless")]
                {
                    let mut backend =
                        super::headless::HeadlessBackend::new().map_err(BackendError::Io)?;
                    backend.add_default_output();
                    multi.add(backend)?;
                }
                #[cfg(not(feature = "backend_headless"))]
                return Err(AutoError::Unavailable("headless"));
            }
            BackendKind::Noop => {
                #[cfg(feature = "backend_noop")]
                {
                    let mut backend = super::noop::NoopBackend::new().map_err(BackendError::Io)?;
                    backend.add_output();
                    multi.add(backend)?;
                }
                #[cfg(not(feature = "backend_noop"))]
                return Err(AutoError::Unavailable("noop"));
            }
            BackendKind::Rdp => {
                #[cfg(feature = "backend_rdp")]
                {
                    let backend = super::rdp::RdpBackend::new(Default::default())
                        .map_err(BackendError::Io)?;
                    multi.add(backend)?;
                }
                #[cfg(not(feature = "backend_rdp"))]
                return Err(AutoError::Unavailable("rdp"));
            }
            BackendKind::Libinput => {
                #[cfg(all(feature = "backend_libinput", feature = "backend_session"))]
                {
                    let (session_handle, _) = ensure_session(&mut session)?;
                    let seat = session_handle.seat();
                    let backend = super::libinput::LibinputBackend::new(session_handle, &seat)
                        .map_err(BackendError::Libinput)?;
                    multi.add(backend)?;
                }
                #[cfg(not(all(feature = "backend_libinput", feature = "backend_session")))]
                return Err(AutoError::Unavailable("libinput"));
            }
            BackendKind::Drm => {
                #[cfg(all(
                    feature = "backend_drm",
                    feature = "backend_udev",
                    feature = "backend_session"
                ))]
                {
                    let (mut session_handle, seat) = ensure_session(&mut session)?;
                    let gpu = super::udev::primary_gpu(&seat)
                        .ok()
                        .flatten()
                        .or_else(|| {
                            super::udev::all_gpus(&seat)
                                .ok()
                                .and_then(|mut gpus| gpus.drain(..).next())
                        })
                        .ok_or(AutoError::NoGpu)?;
                    info!("Using gpu {:?}", gpu);
                    let fd: OwnedFd = session_handle
                        .open(
                            &gpu,
                            OFlags::RDWR | OFlags::CLOEXEC | OFlags::NOCTTY | OFlags::NONBLOCK,
                        )
                        .map_err(|err| AutoError::OpenDevice(format!("{:?}", err)))?;
                    let backend = super::drm::DrmBackend::new(DeviceFd::from(fd))
                        .map_err(BackendError::Drm)?;
                    multi.add(backend)?;
                }
                #[cfg(not(all(
                    feature = "backend_drm",
                    feature = "backend_udev",
                    feature = "backend_session"
                )))]
                return Err(AutoError::Unavailable("drm"));
            }
        }
    }

    Ok((multi, session))
}

#[cfg(feature = "backend_session")]
fn ensure_session(
    session: &mut Option<SessionPair>,
) -> Result<(AutoSession, String), AutoError> {
    if session.is_none() {
        *session = AutoSession::new();
    }
    let (handle, _) = session.as_ref().ok_or(AutoError::NoSession)?;
    let seat = handle.seat();
    Ok((handle.clone(), seat))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wayland_display_wins() {
        let env = SelectionEnv {
            wayland_display: true,
            x11_display: true,
            explicit: Some(String::from("headless")),
        };
        assert_eq!(select(&env).unwrap(), vec![BackendKind::Wayland]);
    }

    #[test]
    fn x11_display_comes_second() {
        let env = SelectionEnv {
            wayland_display: false,
            x11_display: true,
            explicit: None,
        };
        assert_eq!(select(&env).unwrap(), vec![BackendKind::X11]);
    }

    #[test]
    fn explicit_list_is_honored() {
        let env = SelectionEnv {
            wayland_display: false,
            x11_display: false,
            explicit: Some(String::from("headless,headless")),
        };
        assert_eq!(
            select(&env).unwrap(),
            vec![BackendKind::Headless, BackendKind::Headless]
        );
    }

    #[test]
    fn explicit_list_accepts_every_backend() {
        let env = SelectionEnv {
            explicit: Some(String::from("drm, libinput, wayland,x11,headless,rdp,noop")),
            ..Default::default()
        };
        assert_eq!(
            select(&env).unwrap(),
            vec![
                BackendKind::Drm,
                BackendKind::Libinput,
                BackendKind::Wayland,
                BackendKind::X11,
                BackendKind::Headless,
                BackendKind::Rdp,
                BackendKind::Noop,
            ]
        );
    }

    #[test]
    fn unknown_backend_is_an_error() {
        let env = SelectionEnv {
            explicit: Some(String::from("headless,fbdev")),
            ..Default::default()
        };
        assert!(matches!(
            select(&env),
            Err(AutoError::UnknownBackend(name)) if name == "fbdev"
        ));
    }

    #[test]
    fn default_is_libinput_and_drm() {
        let env = SelectionEnv::default();
        assert_eq!(
            select(&env).unwrap(),
            vec![BackendKind::Libinput, BackendKind::Drm]
        );
    }
}
