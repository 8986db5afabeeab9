//! Composition of several backends behind a single event stream.
//!
//! [`MultiBackend`] owns an ordered list of child backends, forwards the
//! lifecycle operations to each of them in order and re-emits their events
//! unchanged from one [`calloop::EventSource`]. This is the tree the
//! [auto-selector](super::auto) returns: typically a DRM backend paired
//! with a libinput backend, or several synthetic backends.

use calloop::{EventSource, Poll, PostAction, Readiness, Token, TokenFactory};
use tracing::{info, warn};

use super::{Backend, BackendError, BackendEvent};

/// Any of the backends of this crate, the unit of composition.
#[derive(Debug)]
pub enum AnyBackend {
    /// A DRM/KMS backend
    #[cfg(feature = "backend_drm")]
    Drm(super::drm::DrmBackend),
    /// A libinput backend
    #[cfg(feature = "backend_libinput")]
    Libinput(super::libinput::LibinputBackend),
    /// A nested Wayland backend
    #[cfg(feature = "backend_wayland")]
    Wayland(super::wayland::WaylandBackend),
    /// A nested X11 backend
    #[cfg(feature = "backend_x11")]
    X11(super::x11::X11Backend),
    /// A headless backend
    #[cfg(feature = "backend_headless")]
    Headless(super::headless::HeadlessBackend),
    /// An RDP remoting backend
    #[cfg(feature = "backend_rdp")]
    Rdp(super::rdp::RdpBackend),
    /// A noop backend
    #[cfg(feature = "backend_noop")]
    Noop(super::noop::NoopBackend),
    /// A nested multi backend
    Multi(Box<MultiBackend>),
}

macro_rules! dispatch {
    ($self:expr, $backend:pat => $body:expr) => {
        match $self {
            #[cfg(feature = "backend_drm")]
            AnyBackend::Drm($backend) => $body,
            #[cfg(feature = "backend_libinput")]
            AnyBackend::Libinput($backend) => $body,
            #[cfg(feature = "backend_wayland")]
            AnyBackend::Wayland($backend) => $body,
            #[cfg(feature = "backend_x11")]
            AnyBackend::X11($backend) => $body,
            #[cfg(feature = "backend_headless")]
            AnyBackend::Headless($backend) => $body,
            #[cfg(feature = "backend_rdp")]
            AnyBackend::Rdp($backend) => $body,
            #[cfg(feature = "backend_noop")]
            AnyBackend::Noop($backend) => $body,
            AnyBackend::Multi($backend) => $body,
        }
    };
}

impl Backend for AnyBackend {
    fn start(&mut self) -> Result<(), BackendError> {
        dispatch!(self, backend => backend.start())
    }

    fn is_started(&self) -> bool {
        dispatch!(self, backend => backend.is_started())
    }

    fn suspend(&mut self) {
        dispatch!(self, backend => backend.suspend())
    }

    fn resume(&mut self) {
        dispatch!(self, backend => backend.resume())
    }
}

impl EventSource for AnyBackend {
    type Event = BackendEvent;
    type Metadata = ();
    type Ret = ();
    type Error = BackendError;

    fn process_events<F>(
        &mut self,
        readiness: Readiness,
        token: Token,
        callback: F,
    ) -> Result<PostAction, BackendError>
    where
        F: FnMut(BackendEvent, &mut ()),
    {
        dispatch!(self, backend => backend.process_events(readiness, token, callback))
    }

    fn register(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        dispatch!(self, backend => backend.register(poll, factory))
    }

    fn reregister(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        dispatch!(self, backend => backend.reregister(poll, factory))
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        dispatch!(self, backend => backend.unregister(poll))
    }
}

#[cfg(feature = "backend_drm")]
impl From<super::drm::DrmBackend> for AnyBackend {
    fn from(backend: super::drm::DrmBackend) -> Self {
        AnyBackend::Drm(backend)
    }
}
#[cfg(feature = "backend_libinput")]
impl From<super::libinput::LibinputBackend> for AnyBackend {
    fn from(backend: super::libinput::LibinputBackend) -> Self {
        AnyBackend::Libinput(backend)
    }
}
#[cfg(feature = "backend_wayland")]
impl From<super::wayland::WaylandBackend> for AnyBackend {
    fn from(backend: super::wayland::WaylandBackend) -> Self {
        AnyBackend::Wayland(backend)
    }
}
#[cfg(feature = "backend_x11")]
impl From<super::x11::X11Backend> for AnyBackend {
    fn from(backend: super::x11::X11Backend) -> Self {
        AnyBackend::X11(backend)
    }
}
#[cfg(feature = "backend_headless")]
impl From<super::headless::HeadlessBackend> for AnyBackend {
    fn from(backend: super::headless::HeadlessBackend) -> Self {
        AnyBackend::Headless(backend)
    }
}
#[cfg(feature = "backend_rdp")]
impl From<super::rdp::RdpBackend> for AnyBackend {
    fn from(backend: super::rdp::RdpBackend) -> Self {
        AnyBackend::Rdp(backend)
    }
}
#[cfg(feature = "backend_noop")]
impl From<super::noop::NoopBackend> for AnyBackend {
    fn from(backend: super::noop::NoopBackend) -> Self {
        AnyBackend::Noop(backend)
    }
}
impl From<MultiBackend> for AnyBackend {
    fn from(backend: MultiBackend) -> Self {
        AnyBackend::Multi(Box::new(backend))
    }
}

/// An ordered list of backends behind one event stream.
#[derive(Debug, Default)]
pub struct MultiBackend {
    children: Vec<AnyBackend>,
    started: bool,
}

impl MultiBackend {
    /// Creates an empty multi backend.
    pub fn new() -> MultiBackend {
        MultiBackend {
            children: Vec::new(),
            started: false,
        }
    }

    /// Appends a child backend.
    ///
    /// If the multi backend was already started the child is started
    /// immediately.
    pub fn add(&mut self, backend: impl Into<AnyBackend>) -> Result<(), BackendError> {
        let mut backend = backend.into();
        if self.started && !backend.is_started() {
            backend.start()?;
        }
        self.children.push(backend);
        Ok(())
    }

    /// The composed child backends.
    pub fn backends(&self) -> &[AnyBackend] {
        &self.children
    }

    /// Mutable access to the composed child backends.
    pub fn backends_mut(&mut self) -> &mut [AnyBackend] {
        &mut self.children
    }
}

impl Backend for MultiBackend {
    /// Starts every child in order.
    ///
    /// The first failure aborts the startup and is returned; children
    /// started before the failure stay started and are torn down cleanly
    /// when the multi backend is dropped.
    fn start(&mut self) -> Result<(), BackendError> {
        if self.started {
            return Err(BackendError::AlreadyStarted);
        }
        info!("Starting {} composed backends", self.children.len());
        for (idx, child) in self.children.iter_mut().enumerate() {
            if let Err(err) = child.start() {
                warn!("Failed to start backend {}: {}", idx, err);
                return Err(err);
            }
        }
        self.started = true;
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.started
    }

    fn suspend(&mut self) {
        for child in &mut self.children {
            child.suspend();
        }
    }

    fn resume(&mut self) {
        for child in &mut self.children {
            child.resume();
        }
    }
}

impl EventSource for MultiBackend {
    type Event = BackendEvent;
    type Metadata = ();
    type Ret = ();
    type Error = BackendError;

    fn process_events<F>(
        &mut self,
        readiness: Readiness,
        token: Token,
        mut callback: F,
    ) -> Result<PostAction, BackendError>
    where
        F: FnMut(BackendEvent, &mut ()),
    {
        // children ignore tokens that are not theirs, so the event is
        // simply offered to each of them.
        //
        // The callback is erased to `dyn FnMut` before recursing into
        // children: `AnyBackend::Multi` makes this function mutually
        // recursive with `AnyBackend::process_events` through a generic
        // parameter, which without erasure makes the compiler try to
        // monomorphize an unbounded chain of `&mut &mut ... F` types.
        let mut callback: &mut dyn FnMut(BackendEvent, &mut ()) = &mut callback;
        let mut action = PostAction::Continue;
        for child in &mut self.children {
            match child.process_events(readiness, token, &mut callback)? {
                PostAction::Continue => {}
                other => action = other,
            }
        }
        Ok(action)
    }

    fn register(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        for child in &mut self.children {
            child.register(poll, factory)?;
        }
        Ok(())
    }

    fn reregister(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        for child in &mut self.children {
            child.reregister(poll, factory)?;
        }
        Ok(())
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        for child in &mut self.children {
            child.unregister(poll)?;
        }
        Ok(())
    }
}

#[cfg(all(test, feature = "backend_noop"))]
mod tests {
    use super::*;
    use crate::backend::noop::NoopBackend;
    use std::time::{Duration, Instant};

    /// Events of every child come out of the one composed source.
    #[test]
    fn children_events_are_reemitted() {
        let mut event_loop = calloop::EventLoop::<Vec<BackendEvent>>::try_new().unwrap();

        let mut first = NoopBackend::new().unwrap();
        first.add_output();
        let mut second = NoopBackend::new().unwrap();
        second.add_output();
        second.add_output();

        let mut multi = MultiBackend::new();
        multi.add(first).unwrap();
        multi.add(second).unwrap();
        multi.start().unwrap();
        assert!(multi.is_started());

        event_loop
            .handle()
            .insert_source(multi, |event, _, events| events.push(event))
            .unwrap();

        let mut events = Vec::new();
        let deadline = Instant::now() + Duration::from_millis(500);
        while events.len() < 3 && Instant::now() < deadline {
            event_loop
                .dispatch(Some(Duration::from_millis(20)), &mut events)
                .unwrap();
        }
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, BackendEvent::NewOutput { .. }))
                .count(),
            3
        );
    }

    /// Children added after start are started on the spot.
    #[test]
    fn late_children_are_started() {
        let mut multi = MultiBackend::new();
        multi.start().unwrap();

        let mut child = NoopBackend::new().unwrap();
        child.add_output();
        assert!(!child.is_started());
        multi.add(child).unwrap();
        assert!(multi.backends()[0].is_started());
    }

    /// A second start is rejected.
    #[test]
    fn double_start_is_rejected() {
        let mut multi = MultiBackend::new();
        multi.start().unwrap();
        assert!(matches!(multi.start(), Err(BackendError::AlreadyStarted)));
    }
}
