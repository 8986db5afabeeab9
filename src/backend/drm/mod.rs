//! DRM/KMS output backend
//!
//! [`DrmBackend`] drives the outputs of one GPU: it scans connectors,
//! reserves a CRTC and a primary (and, if available, cursor) plane for
//! every connected display, performs modesets and schedules pageflips, and
//! re-emits kernel pageflip completions as
//! [`Frame`](crate::backend::BackendEvent::Frame)/
//! [`Present`](crate::backend::BackendEvent::Present) events.
//!
//! The device file descriptor is opened by the
//! [`Session`](crate::backend::session::Session) and only borrowed here;
//! on session pause the backend stops committing and on resume every
//! output is re-announced for a fresh modeset.
//!
//! Commits follow a strict per-output ordering: while a pageflip is in
//! flight, further commits are rejected with
//! [`OutputError::FramePending`](crate::output::OutputError::FramePending)
//! until the next `Frame` event. A watchdog makes sure a lost pageflip
//! event cannot stall the compositor forever.

use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd};
use std::sync::Arc;
use std::time::Instant;

use calloop::{EventSource, Interest, Mode as CalloopMode, Poll, PostAction, Readiness, Token, TokenFactory};
use drm::control::{connector, crtc, Device as ControlDevice, Event as DrmEvent, ResourceHandles};
use tracing::{debug, info, info_span, trace, warn};

pub(crate) mod atomic;
pub(crate) mod bo;
pub(crate) mod device;
pub(crate) mod edid;
mod error;
pub(crate) mod fb;
pub(crate) mod legacy;
pub(crate) mod modes;
pub(crate) mod output;
pub(crate) mod props;

pub use self::device::DrmDeviceFd;
pub use self::error::DrmError;

use self::device::{planes_for_crtc, DrmDeviceInner};
use self::edid::EdidInfo;
use self::output::{DrmOutputInner, Watchdog};
use super::{Backend, BackendError, BackendEvent, EventQueue};
use crate::output::{Output, OutputKind, OutputModeState};
use crate::utils::fd::{DevPath, DeviceFd};

/// Backend driving the outputs of one DRM device.
pub struct DrmBackend {
    dev: Arc<DrmDeviceInner>,
    resources: ResourceHandles,
    outputs: Vec<Arc<DrmOutputInner>>,
    saved_crtcs: Vec<(crtc::Handle, crtc::Info)>,
    /// Bitfield over the index into [`ResourceHandles::crtcs`].
    taken_crtcs: u32,
    queue: EventQueue,
    watchdog: Arc<Watchdog>,
    started: bool,
    #[cfg(feature = "backend_udev")]
    monitor: Option<udev::MonitorSocket>,
    drm_token: Option<Token>,
    timer_token: Option<Token>,
    wake_token: Option<Token>,
    #[cfg(feature = "backend_udev")]
    udev_token: Option<Token>,
    span: tracing::Span,
}

impl std::fmt::Debug for DrmBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrmBackend")
            .field("device", &self.dev.fd.dev_path())
            .field("outputs", &self.outputs.len())
            .finish_non_exhaustive()
    }
}

impl DrmBackend {
    /// Creates a new backend on an open DRM node.
    ///
    /// The fd should come from a [`Session`](crate::backend::session::Session)
    /// so that it carries DRM master when the seat is active.
    pub fn new(fd: DeviceFd) -> Result<DrmBackend, DrmError> {
        let span = info_span!("backend_drm", device = ?fd.dev_path());
        let _guard = span.enter();

        let dev = Arc::new(DrmDeviceInner::new(fd)?);
        let resources = dev.fd.resource_handles().map_err(|source| DrmError::Access {
            errmsg: "Error loading drm resources",
            dev: dev.fd.dev_path(),
            source,
        })?;

        // Save the pre-session crtc state, to be restored on teardown so a
        // getty running on the tty becomes visible again.
        let mut saved_crtcs = Vec::new();
        for &crtc in resources.crtcs() {
            if let Ok(info) = dev.fd.get_crtc(crtc) {
                saved_crtcs.push((crtc, info));
            }
        }

        #[cfg(feature = "backend_udev")]
        let monitor = match udev::MonitorBuilder::new().and_then(|b| b.match_subsystem("drm")).and_then(|b| b.listen()) {
            Ok(monitor) => Some(monitor),
            Err(err) => {
                warn!("Failed to create udev monitor, hotplug disabled: {}", err);
                None
            }
        };

        let queue = EventQueue::new().map_err(|source| DrmError::Access {
            errmsg: "Failed to create event queue",
            dev: dev.fd.dev_path(),
            source,
        })?;
        let watchdog = Arc::new(Watchdog::new().map_err(|source| DrmError::Access {
            errmsg: "Failed to create pageflip watchdog",
            dev: dev.fd.dev_path(),
            source,
        })?);

        drop(_guard);
        Ok(DrmBackend {
            dev,
            resources,
            outputs: Vec::new(),
            saved_crtcs,
            taken_crtcs: 0,
            queue,
            watchdog,
            started: false,
            #[cfg(feature = "backend_udev")]
            monitor,
            drm_token: None,
            timer_token: None,
            wake_token: None,
            #[cfg(feature = "backend_udev")]
            udev_token: None,
            span,
        })
    }

    /// The `dev_t` of the underlying DRM node.
    pub fn device_id(&self) -> u64 {
        self.dev.dev_id
    }

    /// Whether the device uses the atomic commit path.
    pub fn is_atomic(&self) -> bool {
        self.dev.caps.atomic
    }

    /// Handles to the currently live outputs.
    pub fn outputs(&self) -> Vec<Output> {
        self.outputs
            .iter()
            .filter_map(|inner| inner.public_handle())
            .collect()
    }

    /// The overlay planes usable with the crtc of `output`, as pairs of
    /// plane id and supported fourcc codes.
    ///
    /// Putting content onto them is up to the compositor; this backend only
    /// drives the primary and cursor planes itself.
    pub fn overlay_planes(&self, output: &Output) -> Vec<(u32, Vec<u32>)> {
        self.outputs
            .iter()
            .find(|inner| {
                inner
                    .public_handle()
                    .map(|handle| handle == *output)
                    .unwrap_or(false)
            })
            .map(|inner| {
                inner
                    .planes
                    .overlays
                    .iter()
                    .map(|plane| (plane.handle.into(), plane.formats.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Rescan the connectors of the device.
    ///
    /// Called automatically on start, on hotplug uevents and on session
    /// resume; may be called manually after an external configuration
    /// change. New connected connectors are announced with
    /// [`BackendEvent::NewOutput`], vanished ones with
    /// [`BackendEvent::OutputDestroyed`].
    #[profiling::function]
    pub fn scan_connectors(&mut self) -> Result<(), DrmError> {
        let span = self.span.clone();
        let _guard = span.enter();

        // connectors may appear at runtime (MST), refresh the handle list
        self.resources = self
            .dev
            .fd
            .resource_handles()
            .map_err(|source| DrmError::Access {
                errmsg: "Error loading drm resources",
                dev: self.dev.fd.dev_path(),
                source,
            })?;

        let mut seen = Vec::new();
        let connectors: Vec<_> = self.resources.connectors().to_vec();
        for conn in connectors {
            let info = match self.dev.fd.get_connector(conn, false) {
                Ok(info) => info,
                Err(err) => {
                    debug!("Failed to probe connector {:?}: {}", conn, err);
                    continue;
                }
            };
            let connected = info.state() == connector::State::Connected;
            if connected {
                seen.push(conn);
            }
            let known = self.outputs.iter().any(|o| o.connector == conn);
            if connected && !known {
                if let Err(err) = self.connect(info) {
                    warn!("Failed to bring up connector {:?}: {}", conn, err);
                }
            }
        }

        // everything we drive that is no longer connected goes away
        let mut removed = Vec::new();
        self.outputs.retain(|inner| {
            if seen.contains(&inner.connector) {
                true
            } else {
                removed.push(inner.clone());
                false
            }
        });
        for inner in removed {
            self.disconnect(&inner);
        }

        Ok(())
    }

    /// Allocate a crtc for `info` and announce the new output.
    fn connect(&mut self, info: connector::Info) -> Result<(), DrmError> {
        let conn = info.handle();
        let (crtc, crtc_bit) = self.pick_crtc(&info)?;

        let conn_props = props::connector_props(&self.dev.fd, conn)?;
        let crtc_props = props::crtc_props(&self.dev.fd, crtc)?;
        let planes = planes_for_crtc(&self.dev, &self.resources, crtc)?;
        if self.dev.caps.universal_planes && planes.primary.is_none() {
            return Err(DrmError::NoPrimaryPlane(crtc));
        }

        let kernel_modes: Vec<_> = info.modes().to_vec();
        let modes: Vec<_> = kernel_modes.iter().map(modes::mode_info).collect();

        let name = connector_name(&info);
        let (make, model, serial) = match EdidInfo::for_connector(&self.dev.fd, conn, &conn_props) {
            Some(edid) => (edid.manufacturer, edid.model, edid.serial),
            None => (String::from("Unknown"), String::from("Unknown"), None),
        };
        let physical_size = info
            .size()
            .map(|(w, h)| (w as i32, h as i32))
            .unwrap_or((0, 0));

        info!(
            connector = %name,
            ?crtc,
            modes = modes.len(),
            "Connector is connected"
        );

        let inner = Arc::new(DrmOutputInner::new(
            self.dev.clone(),
            conn,
            crtc,
            crtc_bit,
            conn_props,
            crtc_props,
            planes,
            kernel_modes,
            self.queue.clone(),
            self.watchdog.clone(),
        ));

        let output = Output::new(
            name,
            make,
            model,
            serial,
            physical_size,
            OutputModeState {
                modes,
                current: None,
                enabled: true,
            },
            OutputKind::Drm(Arc::downgrade(&inner)),
        );
        *inner.output.lock().unwrap() = Arc::downgrade(&output.inner);

        self.taken_crtcs |= 1 << crtc_bit;
        self.outputs.push(inner);
        if self.started {
            self.queue.push(BackendEvent::NewOutput { output });
        }
        Ok(())
    }

    fn disconnect(&mut self, inner: &Arc<DrmOutputInner>) {
        let _guard = self.span.enter();
        info!(connector = ?inner.connector, "Connector disconnected");
        self.taken_crtcs &= !(1 << inner.crtc_bit);
        self.restore_crtc(inner.crtc);
        if let Some(output) = inner.public_handle() {
            self.queue.push(BackendEvent::OutputDestroyed { output });
        }
    }

    /// Choose a crtc out of the connector's possible encoders, preferring
    /// the one the connector is already routed through.
    fn pick_crtc(&self, info: &connector::Info) -> Result<(crtc::Handle, u32), DrmError> {
        // restore path: keep the crtc the display manager left us on
        if let Some(encoder) = info.current_encoder() {
            if let Ok(encoder) = self.dev.fd.get_encoder(encoder) {
                if let Some(crtc) = encoder.crtc() {
                    if let Some(bit) = self.crtc_bit(crtc) {
                        if self.taken_crtcs & (1 << bit) == 0 {
                            return Ok((crtc, bit));
                        }
                    }
                }
            }
        }

        for &encoder in info.encoders() {
            let Ok(encoder) = self.dev.fd.get_encoder(encoder) else {
                continue;
            };
            for crtc in self.resources.filter_crtcs(encoder.possible_crtcs()) {
                if let Some(bit) = self.crtc_bit(crtc) {
                    if self.taken_crtcs & (1 << bit) == 0 {
                        return Ok((crtc, bit));
                    }
                }
            }
        }
        Err(DrmError::NoSuitableCrtc(info.handle()))
    }

    fn crtc_bit(&self, crtc: crtc::Handle) -> Option<u32> {
        self.resources
            .crtcs()
            .iter()
            .position(|&c| c == crtc)
            .map(|idx| idx as u32)
    }

    /// Put a crtc back into the state it had before we claimed it.
    fn restore_crtc(&self, crtc: crtc::Handle) {
        let Some((_, saved)) = self.saved_crtcs.iter().find(|(c, _)| *c == crtc) else {
            return;
        };
        if !self.dev.is_active() {
            return;
        }
        let result = self.dev.fd.set_crtc(
            crtc,
            saved.framebuffer(),
            saved.position(),
            &[],
            saved.mode(),
        );
        if let Err(err) = result {
            debug!("Failed to restore crtc {:?}: {}", crtc, err);
        }
    }

    fn dispatch_drm_events(&mut self, mut callback: impl FnMut(BackendEvent)) {
        let events = match self.dev.fd.receive_events() {
            Ok(events) => events,
            Err(err) => {
                warn!("Error processing drm events: {}", err);
                return;
            }
        };
        for event in events {
            match event {
                DrmEvent::PageFlip(flip) => {
                    trace!("Pageflip event on {:?}", flip.crtc);
                    let result = self
                        .outputs
                        .iter()
                        .find(|o| o.crtc == flip.crtc)
                        .and_then(|o| o.on_page_flip(flip.frame, flip.duration));
                    if let Some(flip) = result {
                        if let Some(meta) = flip.meta {
                            callback(BackendEvent::Present {
                                output: flip.output.clone(),
                                meta,
                            });
                        }
                        callback(BackendEvent::Frame { output: flip.output });
                    }
                }
                _ => {
                    trace!("Unhandled drm event");
                }
            }
        }
        self.rearm_watchdog();
    }

    fn dispatch_timeouts(&mut self, mut callback: impl FnMut(BackendEvent)) {
        let now = Instant::now();
        for inner in &self.outputs {
            if let Some(flip) = inner.check_timeout(now) {
                // the commit is presumed lost, synthesize a frame so the
                // compositor can make forward progress
                callback(BackendEvent::Frame { output: flip.output });
            }
        }
        self.rearm_watchdog();
    }

    fn rearm_watchdog(&self) {
        self.watchdog.disarm();
        if let Some(deadline) = self.outputs.iter().filter_map(|o| o.deadline()).min() {
            self.watchdog.arm(deadline);
        }
    }

    #[cfg(feature = "backend_udev")]
    fn dispatch_udev(&mut self) {
        let mut changed = false;
        if let Some(monitor) = &self.monitor {
            for event in monitor.iter() {
                if event.event_type() == udev::EventType::Change
                    && event.devnum() == Some(self.dev.dev_id)
                {
                    changed = true;
                }
            }
        }
        if changed {
            debug!("Device changed, rescanning connectors");
            if let Err(err) = self.scan_connectors() {
                warn!("Connector rescan failed: {}", err);
            }
        }
    }
}

impl Backend for DrmBackend {
    fn start(&mut self) -> Result<(), BackendError> {
        if self.started {
            return Err(BackendError::AlreadyStarted);
        }
        let span = self.span.clone();
        let _guard = span.enter();
        info!("Starting drm backend");
        // outputs found by the initial scan are announced through the queue
        self.started = true;
        self.scan_connectors().map_err(BackendError::Drm)?;
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.started
    }

    /// Session pause: reject further commits and silently drop in-flight
    /// state. Pending pageflips produce no frame events.
    fn suspend(&mut self) {
        let _guard = self.span.enter();
        info!("Pausing drm backend");
        self.dev.set_active(false);
        self.watchdog.disarm();
        for inner in &self.outputs {
            inner.pause();
        }
        self.dev.drop_master();
    }

    /// Session resume: reacquire master, force a modeset on every output
    /// and re-announce them so the compositor re-initializes.
    fn resume(&mut self) {
        let span = self.span.clone();
        let _guard = span.enter();
        info!("Resuming drm backend");
        self.dev.acquire_master();
        self.dev.set_active(true);
        for inner in &self.outputs {
            inner.resume();
            if let Some(output) = inner.public_handle() {
                self.queue.push(BackendEvent::NewOutput { output });
            }
        }
        // pick up hotplug that happened while we were away
        if let Err(err) = self.scan_connectors() {
            warn!("Connector rescan after resume failed: {}", err);
        }
    }
}

impl Drop for DrmBackend {
    fn drop(&mut self) {
        let crtcs: Vec<_> = self.outputs.iter().map(|o| o.crtc).collect();
        self.outputs.clear();
        for crtc in crtcs {
            self.restore_crtc(crtc);
        }
    }
}

fn connector_name(info: &connector::Info) -> String {
    use connector::Interface;
    let kind = match info.interface() {
        Interface::VGA => "VGA",
        Interface::DVII => "DVI-I",
        Interface::DVID => "DVI-D",
        Interface::DVIA => "DVI-A",
        Interface::Composite => "Composite",
        Interface::SVideo => "SVIDEO",
        Interface::LVDS => "LVDS",
        Interface::Component => "Component",
        Interface::NinePinDIN => "DIN",
        Interface::DisplayPort => "DP",
        Interface::HDMIA => "HDMI-A",
        Interface::HDMIB => "HDMI-B",
        Interface::TV => "TV",
        Interface::EmbeddedDisplayPort => "eDP",
        Interface::Virtual => "Virtual",
        Interface::DSI => "DSI",
        Interface::DPI => "DPI",
        _ => "Unknown",
    };
    format!("{}-{}", kind, info.interface_id())
}

impl EventSource for DrmBackend {
    type Event = BackendEvent;
    type Metadata = ();
    type Ret = ();
    type Error = BackendError;

    #[profiling::function]
    fn process_events<F>(
        &mut self,
        _: Readiness,
        token: Token,
        mut callback: F,
    ) -> Result<PostAction, BackendError>
    where
        F: FnMut(BackendEvent, &mut ()),
    {
        if Some(token) == self.drm_token {
            self.dispatch_drm_events(|event| callback(event, &mut ()));
        } else if Some(token) == self.timer_token {
            self.watchdog.timer.read();
            self.dispatch_timeouts(|event| callback(event, &mut ()));
        } else if Some(token) == self.wake_token {
            self.queue.waker().clear();
        }
        #[cfg(feature = "backend_udev")]
        if Some(token) == self.udev_token {
            self.dispatch_udev();
        }

        self.queue.drain(|event| callback(event, &mut ()));
        Ok(PostAction::Continue)
    }

    fn register(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        let drm_token = factory.token();
        let timer_token = factory.token();
        let wake_token = factory.token();
        unsafe {
            poll.register(self.dev.fd.as_fd(), Interest::READ, CalloopMode::Level, drm_token)?;
            poll.register(
                self.watchdog.timer.as_fd(),
                Interest::READ,
                CalloopMode::Level,
                timer_token,
            )?;
            poll.register(
                self.queue.waker().as_fd(),
                Interest::READ,
                CalloopMode::Level,
                wake_token,
            )?;
        }
        self.drm_token = Some(drm_token);
        self.timer_token = Some(timer_token);
        self.wake_token = Some(wake_token);

        #[cfg(feature = "backend_udev")]
        if let Some(monitor) = &self.monitor {
            let udev_token = factory.token();
            unsafe {
                poll.register(
                    BorrowedFd::borrow_raw(monitor.as_raw_fd()),
                    Interest::READ,
                    CalloopMode::Level,
                    udev_token,
                )?;
            }
            self.udev_token = Some(udev_token);
        }
        Ok(())
    }

    fn reregister(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        self.unregister(poll)?;
        self.register(poll, factory)
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        if self.drm_token.take().is_some() {
            poll.unregister(self.dev.fd.as_fd())?;
        }
        if self.timer_token.take().is_some() {
            poll.unregister(self.watchdog.timer.as_fd())?;
        }
        if self.wake_token.take().is_some() {
            poll.unregister(self.queue.waker().as_fd())?;
        }
        #[cfg(feature = "backend_udev")]
        if self.udev_token.take().is_some() {
            if let Some(monitor) = &self.monitor {
                poll.unregister(unsafe { BorrowedFd::borrow_raw(monitor.as_raw_fd()) })?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    /// The crtc allocation math: a connector may only take a crtc out of
    /// its possible set that is not already taken, and unplugging frees
    /// the bit again.
    #[test]
    fn crtc_mask_allocation() {
        fn pick(possible: u32, taken: u32) -> Option<u32> {
            (0..32).find(|bit| possible & (1 << bit) != 0 && taken & (1 << bit) == 0)
        }

        let mut taken = 0u32;

        // two connectors able to use both crtcs, one limited to crtc 1
        let a = pick(0b11, taken).unwrap();
        taken |= 1 << a;
        assert_eq!(a, 0);

        let b = pick(0b10, taken).unwrap();
        taken |= 1 << b;
        assert_eq!(b, 1);

        // everything taken
        assert_eq!(pick(0b11, taken), None);

        // unplugging connector a frees its crtc for the next scan
        taken &= !(1 << a);
        assert_eq!(pick(0b11, taken), Some(0));
    }
}
