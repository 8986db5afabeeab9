//! Backend creation and composition helpers
//!
//! A backend bridges one source of outputs and input devices (a DRM device,
//! a libinput context, a parent wayland or X11 session, or a synthetic
//! environment) into the uniform event stream of [`BackendEvent`]. Every
//! backend is a [`calloop::EventSource`]; insert it into your event loop and
//! react to the events it produces.
//!
//! Heterogeneous backends compose through [`multi::MultiBackend`], and
//! [`auto`] selects a backend tree from the environment, which is what most
//! compositors want at startup:
//!
//! ```no_run
//! use scanout::backend::{auto, Backend, BackendEvent};
//!
//! let mut event_loop = calloop::EventLoop::<()>::try_new().unwrap();
//! let (mut backend, _session) = auto::auto_create().unwrap();
//! backend.start().unwrap();
//! event_loop
//!     .handle()
//!     .insert_source(backend, |event, _, _state| match event {
//!         BackendEvent::NewOutput { output: _ } => { /* pick a mode, commit */ }
//!         BackendEvent::Frame { output: _ } => { /* render the next frame */ }
//!         BackendEvent::Input(_event) => { /* feed the seat */ }
//!         _ => {}
//!     })
//!     .unwrap();
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::output::{Mode, Output, PresentMeta};
use crate::utils::wake::Waker;

pub mod allocator;
pub mod input;

#[cfg(feature = "backend_session")]
pub mod session;

#[cfg(feature = "backend_udev")]
pub mod udev;

#[cfg(feature = "backend_drm")]
pub mod drm;

#[cfg(feature = "backend_libinput")]
pub mod libinput;

#[cfg(feature = "backend_headless")]
pub mod headless;

#[cfg(feature = "backend_noop")]
pub mod noop;

#[cfg(feature = "backend_wayland")]
pub mod wayland;

#[cfg(feature = "backend_x11")]
pub mod x11;

#[cfg(feature = "backend_rdp")]
pub mod rdp;

pub mod auto;
pub mod multi;

use self::input::{InputDevice, InputEvent};

/// Events produced by every backend.
#[derive(Debug)]
pub enum BackendEvent {
    /// A new output became available. The compositor should pick a mode and
    /// start committing frames.
    NewOutput {
        /// The new output
        output: Output,
    },
    /// A new input device capability was exposed.
    NewInput {
        /// The new device
        device: InputDevice,
    },
    /// User input.
    Input(InputEvent),
    /// The output is ready for the next frame to be rendered and committed.
    Frame {
        /// The output that became ready
        output: Output,
    },
    /// A previously committed frame reached the screen.
    Present {
        /// The presenting output
        output: Output,
        /// Timing and precision data of the presentation
        meta: PresentMeta,
    },
    /// The mode of an output changed outside of compositor control, e.g. a
    /// nested parent window was resized.
    ModeChanged {
        /// The affected output
        output: Output,
        /// The new current mode
        mode: Mode,
    },
    /// The output is going away. Handles remain safe to hold but all
    /// operations on them fail.
    OutputDestroyed {
        /// The destroyed output
        output: Output,
    },
    /// The input device is going away.
    InputDestroyed {
        /// The destroyed device
        device: InputDevice,
    },
}

/// Errors produced by backend lifecycle operations and event dispatch.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The backend was already started
    #[error("the backend was already started")]
    AlreadyStarted,
    /// An io error occurred while driving the backend
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The DRM device failed
    #[cfg(feature = "backend_drm")]
    #[error(transparent)]
    Drm(#[from] drm::DrmError),
    /// The libinput context failed
    #[cfg(feature = "backend_libinput")]
    #[error(transparent)]
    Libinput(#[from] libinput::LibinputError),
    /// The nested wayland connection failed
    #[cfg(feature = "backend_wayland")]
    #[error(transparent)]
    Wayland(#[from] wayland::WaylandError),
    /// The nested X11 connection failed
    #[cfg(feature = "backend_x11")]
    #[error(transparent)]
    X11(#[from] x11::X11Error),
    /// The RDP listener failed
    #[cfg(feature = "backend_rdp")]
    #[error(transparent)]
    Rdp(#[from] rdp::RdpError),
}

/// Common contract of all backends.
///
/// Backends are created in a stopped state: outputs and input devices
/// already known at creation time are only announced once [`start`] is
/// called, so that no event is lost before the source is inserted into the
/// loop. Teardown is plain `Drop`.
///
/// [`start`]: Backend::start
pub trait Backend {
    /// Announce initial outputs/inputs and begin event production.
    fn start(&mut self) -> Result<(), BackendError>;

    /// Whether [`start`](Backend::start) has been called successfully.
    fn is_started(&self) -> bool;

    /// Stop talking to paused devices. Called when the session is
    /// deactivated; a no-op for backends without session-bound devices.
    fn suspend(&mut self) {}

    /// Resume after a session re-activation. Backends with modesetting
    /// state re-announce their outputs for re-initialization.
    fn resume(&mut self) {}
}

/// Queue carrying events emitted outside of a source dispatch, drained the
/// next time the owning event source fires. Pushing wakes the loop through
/// an eventfd.
#[derive(Debug, Clone)]
pub(crate) struct EventQueue {
    events: Arc<Mutex<VecDeque<BackendEvent>>>,
    waker: Waker,
}

impl EventQueue {
    pub(crate) fn new() -> std::io::Result<EventQueue> {
        Ok(EventQueue {
            events: Arc::new(Mutex::new(VecDeque::new())),
            waker: Waker::new()?,
        })
    }

    pub(crate) fn push(&self, event: BackendEvent) {
        self.events.lock().unwrap().push_back(event);
        self.waker.wake();
    }

    pub(crate) fn waker(&self) -> &Waker {
        &self.waker
    }

    pub(crate) fn drain(&self, mut callback: impl FnMut(BackendEvent)) {
        loop {
            // don't hold the lock across the callback, it may push again
            let event = self.events.lock().unwrap().pop_front();
            match event {
                Some(event) => callback(event),
                None => break,
            }
        }
    }
}
