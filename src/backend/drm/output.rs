//! Per-output scanout pipeline: modeset state machine, pageflip
//! scheduling, hardware cursor, gamma and DPMS.

use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use drm::control::{
    connector, crtc, framebuffer, AtomicCommitFlags, Device as ControlDevice, Mode as KernelMode,
    PageFlipFlags,
};
use tracing::{debug, trace, warn};

use super::atomic;
use super::device::{DrmDeviceInner, Planes};
use super::error::DrmError;
use super::fb::DrmFramebuffer;
use super::legacy;
use super::modes;
use super::props::{self, ConnectorProps, CrtcProps};
use crate::backend::allocator::dmabuf::Dmabuf;
use crate::backend::allocator::dumb::DumbBuffer;
use crate::backend::allocator::format::{get_bpp, get_depth};
use crate::backend::allocator::{Buffer, Fourcc};
use crate::backend::{BackendEvent, EventQueue};
use crate::output::{CursorImage, Mode, Output, OutputError, OutputInner, PresentFlags, PresentMeta};
use crate::utils::fd::DevPath;
use crate::utils::timer::TimerFd;

/// How long to wait for a pageflip completion before making forward
/// progress without one.
pub(crate) const FLIP_TIMEOUT: Duration = Duration::from_secs(1);

/// Tracks the single in-flight commit of an output and derives the
/// monotonic presentation sequence from the kernel frame counter.
#[derive(Debug, Default)]
pub(crate) struct FlipTracker {
    pending: bool,
    last_frame: u32,
    wraps: u32,
    seq: u64,
}

impl FlipTracker {
    /// Latch a new commit. Fails while the previous one is in flight.
    pub(crate) fn begin(&mut self) -> Result<(), DrmError> {
        if self.pending {
            return Err(DrmError::FramePending);
        }
        self.pending = true;
        Ok(())
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.pending
    }

    /// Complete the in-flight commit with the kernel frame counter value,
    /// returning the new presentation sequence.
    pub(crate) fn complete(&mut self, frame: u32) -> u64 {
        self.pending = false;
        if frame < self.last_frame {
            self.wraps += 1;
        }
        self.last_frame = frame;
        let seq = ((self.wraps as u64) << 32) | frame as u64;
        // timeouts may have advanced the sequence past the counter
        self.seq = if seq > self.seq { seq } else { self.seq + 1 };
        self.seq
    }

    /// Give up on the in-flight commit, advancing the sequence.
    pub(crate) fn timeout(&mut self) -> u64 {
        self.pending = false;
        self.seq += 1;
        self.seq
    }

    /// Forget the in-flight commit without a frame, used on session pause.
    pub(crate) fn abandon(&mut self) {
        self.pending = false;
    }
}

/// Watchdog shared between the backend source and its outputs. Arming is
/// earliest-deadline-wins; the backend rearms after every expiry scan.
#[derive(Debug)]
pub(crate) struct Watchdog {
    pub(crate) timer: TimerFd,
    armed: Mutex<Option<Instant>>,
}

impl Watchdog {
    pub(crate) fn new() -> std::io::Result<Watchdog> {
        Ok(Watchdog {
            timer: TimerFd::new()?,
            armed: Mutex::new(None),
        })
    }

    pub(crate) fn arm(&self, deadline: Instant) {
        let mut armed = self.armed.lock().unwrap();
        if armed.map(|current| deadline < current).unwrap_or(true) {
            let delay = deadline.saturating_duration_since(Instant::now());
            // zero would disarm a timerfd, round up instead
            let delay = delay.max(Duration::from_millis(1));
            if self.timer.set_oneshot(delay).is_ok() {
                *armed = Some(deadline);
            }
        }
    }

    pub(crate) fn disarm(&self) {
        *self.armed.lock().unwrap() = None;
        let _ = self.timer.disarm();
    }
}

struct BlackBuffer {
    dev: Arc<DrmDeviceInner>,
    // dropped after the framebuffer referencing it
    _dumb: DumbBuffer,
    fb: framebuffer::Handle,
    size: (u16, u16),
}

impl Drop for BlackBuffer {
    fn drop(&mut self) {
        let _ = self.dev.fd.destroy_framebuffer(self.fb);
    }
}

struct CursorBuffer {
    dev: Arc<DrmDeviceInner>,
    dumb: DumbBuffer,
    fb: framebuffer::Handle,
}

impl Drop for CursorBuffer {
    fn drop(&mut self) {
        let _ = self.dev.fd.destroy_framebuffer(self.fb);
    }
}

/// Turn a dumb buffer into a legacy framebuffer, with depth and bpp derived
/// from its format.
fn add_dumb_framebuffer(
    dev: &DrmDeviceInner,
    buffer: &DumbBuffer,
) -> Result<framebuffer::Handle, DrmError> {
    let fourcc = buffer.format().code;
    let depth = get_depth(fourcc)
        .ok_or(DrmError::UnsupportedBuffer("format has no framebuffer depth"))? as u32;
    let bpp = get_bpp(fourcc)
        .ok_or(DrmError::UnsupportedBuffer("format has no framebuffer bpp"))? as u32;
    dev.fd
        .add_framebuffer(buffer.handle(), depth, bpp)
        .map_err(|source| DrmError::Access {
            errmsg: "Failed to create framebuffer",
            dev: dev.fd.dev_path(),
            source,
        })
}

#[derive(Default)]
struct CursorState {
    // double-buffered cursor BOs, uploads go to the back one
    buffers: [Option<CursorBuffer>; 2],
    front: usize,
    hotspot: (i32, i32),
    position: (i32, i32),
    visible: bool,
}

/// What a completed or timed out pageflip asks the backend to emit.
pub(crate) struct FlipResult {
    pub output: Output,
    pub meta: Option<PresentMeta>,
}

pub(crate) struct PipelineState {
    /// Whether the next commit must be a full modeset.
    needs_modeset: bool,
    pending_mode: Option<KernelMode>,
    current_mode: Option<KernelMode>,
    mode_blob: Option<u64>,
    enabled: bool,
    pending_fb: Option<DrmFramebuffer>,
    queued_fb: Option<DrmFramebuffer>,
    current_fb: Option<DrmFramebuffer>,
    black_fb: Option<BlackBuffer>,
    pub(crate) flip: FlipTracker,
    pub(crate) deadline: Option<Instant>,
    cursor: CursorState,
}

/// Backend side of one connector/crtc pair.
pub(crate) struct DrmOutputInner {
    pub(crate) dev: Arc<DrmDeviceInner>,
    pub(crate) connector: connector::Handle,
    pub(crate) crtc: crtc::Handle,
    /// Bit of this crtc in the backend's `taken_crtcs` mask.
    pub(crate) crtc_bit: u32,
    pub(crate) conn_props: ConnectorProps,
    pub(crate) crtc_props: CrtcProps,
    pub(crate) planes: Planes,
    pub(crate) kernel_modes: Vec<KernelMode>,
    pub(crate) queue: EventQueue,
    pub(crate) watchdog: Arc<Watchdog>,
    pub(crate) state: Mutex<PipelineState>,
    pub(crate) output: Mutex<Weak<OutputInner>>,
}

impl std::fmt::Debug for DrmOutputInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrmOutputInner")
            .field("connector", &self.connector)
            .field("crtc", &self.crtc)
            .finish_non_exhaustive()
    }
}

impl DrmOutputInner {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        dev: Arc<DrmDeviceInner>,
        connector: connector::Handle,
        crtc: crtc::Handle,
        crtc_bit: u32,
        conn_props: ConnectorProps,
        crtc_props: CrtcProps,
        planes: Planes,
        kernel_modes: Vec<KernelMode>,
        queue: EventQueue,
        watchdog: Arc<Watchdog>,
    ) -> DrmOutputInner {
        DrmOutputInner {
            dev,
            connector,
            crtc,
            crtc_bit,
            conn_props,
            crtc_props,
            planes,
            kernel_modes,
            queue,
            watchdog,
            state: Mutex::new(PipelineState {
                needs_modeset: true,
                pending_mode: None,
                current_mode: None,
                mode_blob: None,
                enabled: true,
                pending_fb: None,
                queued_fb: None,
                current_fb: None,
                black_fb: None,
                flip: FlipTracker::default(),
                deadline: None,
                cursor: CursorState::default(),
            }),
            output: Mutex::new(Weak::new()),
        }
    }

    pub(crate) fn public_handle(&self) -> Option<Output> {
        self.output
            .lock()
            .unwrap()
            .upgrade()
            .map(|inner| Output { inner })
    }

    fn sync_current_mode(&self, mode: &KernelMode) {
        if let Some(inner) = self.output.lock().unwrap().upgrade() {
            inner.state.lock().unwrap().current = Some(modes::mode_info(mode));
        }
    }

    pub(crate) fn set_mode(&self, mode: Mode) -> Result<(), OutputError> {
        let kernel_mode = self
            .kernel_modes
            .iter()
            .find(|k| {
                let info = modes::mode_info(k);
                info.size == mode.size && info.refresh == mode.refresh
            })
            .copied()
            .ok_or(OutputError::InvalidMode)?;
        let mut state = self.state.lock().unwrap();
        state.pending_mode = Some(kernel_mode);
        Ok(())
    }

    pub(crate) fn set_custom_mode(&self, size: (i32, i32), refresh: i32) -> Result<(), OutputError> {
        if size.0 <= 0 || size.1 <= 0 || refresh < 0 {
            return Err(OutputError::InvalidMode);
        }
        let raw = modes::generate_cvt(size.0 as u32, size.1 as u32, refresh as u32);
        let mut state = self.state.lock().unwrap();
        state.pending_mode = Some(KernelMode::from(raw));
        Ok(())
    }

    pub(crate) fn attach_buffer(&self, buffer: &Dmabuf) -> Result<(), OutputError> {
        if !self.dev.is_active() {
            return Err(OutputError::Inactive);
        }
        let mut state = self.state.lock().unwrap();
        let mode = state
            .pending_mode
            .or(state.current_mode)
            .ok_or(OutputError::InvalidMode)?;
        let (w, h) = mode.size();
        if buffer.size() != (w as u32, h as u32) {
            return Err(DrmError::UnsupportedBuffer("buffer does not match the mode size").into());
        }
        let fb = self.dev.fb_cache.get_or_import(&self.dev, buffer)?;
        state.pending_fb = Some(fb);
        Ok(())
    }

    /// Submit the pending state. At most one commit may be in flight; see
    /// [`FlipTracker`].
    #[profiling::function]
    pub(crate) fn commit(&self) -> Result<(), OutputError> {
        if !self.dev.is_active() {
            return Err(OutputError::Inactive);
        }
        let mut state = self.state.lock().unwrap();

        if !state.enabled {
            // a disabled output owns its crtc but commits no frames; keep
            // the compositor unblocked anyway
            drop(state);
            if let Some(output) = self.public_handle() {
                self.queue.push(BackendEvent::Frame { output });
            }
            return Ok(());
        }

        if state.flip.is_pending() {
            return Err(OutputError::FramePending);
        }

        let modeset = state.needs_modeset
            || match (state.pending_mode, state.current_mode) {
                (Some(pending), Some(current)) => pending != current,
                (Some(_), None) => true,
                _ => false,
            };
        let mode = state
            .pending_mode
            .or(state.current_mode)
            .ok_or(OutputError::InvalidMode)?;

        let (fb, queued) = match state.pending_fb.take() {
            Some(fb) => {
                let handle = fb.handle();
                (handle, Some(fb))
            }
            None if modeset => (self.black_framebuffer(&mut state, &mode)?, None),
            None => return Err(DrmError::NoMode.into()),
        };

        let result = if self.dev.caps.atomic {
            self.commit_atomic(&mut state, &mode, fb, modeset)
        } else {
            self.commit_legacy(&mut state, &mode, fb, modeset)
        };

        match result {
            Ok(flip_submitted) => {
                state.pending_mode = Some(mode);
                state.queued_fb = queued;
                if modeset {
                    state.current_mode = Some(mode);
                    state.needs_modeset = false;
                }
                if flip_submitted {
                    state.flip.begin().expect("latch checked above");
                    let deadline = Instant::now() + FLIP_TIMEOUT;
                    state.deadline = Some(deadline);
                    self.watchdog.arm(deadline);
                    drop(state);
                } else {
                    // no kernel event will arrive, make progress ourselves
                    state.current_fb = state.queued_fb.take().or_else(|| state.current_fb.take());
                    drop(state);
                    if let Some(output) = self.public_handle() {
                        self.queue.push(BackendEvent::Frame { output });
                    }
                }
                if modeset {
                    self.sync_current_mode(&mode);
                }
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Atomic commit path. Returns whether a pageflip event is expected.
    fn commit_atomic(
        &self,
        state: &mut PipelineState,
        mode: &KernelMode,
        fb: framebuffer::Handle,
        modeset: bool,
    ) -> Result<bool, DrmError> {
        let primary = primary_plane(&self.planes, self.crtc)?;

        if modeset {
            let blob = self
                .dev
                .fd
                .create_property_blob(mode)
                .map_err(|source| DrmError::Access {
                    errmsg: "Failed to create property blob for mode",
                    dev: self.dev.fd.dev_path(),
                    source,
                })?;
            let new_blob = atomic::blob_id(&blob);

            let req = atomic::modeset_request(
                self.connector,
                &self.conn_props,
                self.crtc,
                &self.crtc_props,
                primary,
                new_blob,
                fb,
                mode,
            )?;

            let flags = AtomicCommitFlags::ALLOW_MODESET | AtomicCommitFlags::PAGE_FLIP_EVENT;
            match self.dev.fd.atomic_commit(flags, req.clone()) {
                Ok(()) => {
                    if let Some(old) = state.mode_blob.replace(new_blob) {
                        self.dev.destroy_blob(old);
                    }
                    Ok(true)
                }
                Err(err) => {
                    debug!("Atomic modeset failed, testing configuration: {}", err);
                    // one TEST_ONLY retry disambiguates a transient error
                    // from an invalid configuration
                    let test = self.dev.fd.atomic_commit(
                        AtomicCommitFlags::ALLOW_MODESET | AtomicCommitFlags::TEST_ONLY,
                        req,
                    );
                    self.dev.destroy_blob(new_blob);
                    match test {
                        Ok(()) => Err(DrmError::Busy),
                        Err(_) => {
                            state.needs_modeset = true;
                            state.pending_mode = None;
                            Err(DrmError::TestFailed(self.crtc))
                        }
                    }
                }
            }
        } else {
            let req = atomic::pageflip_request(self.crtc, primary, fb, mode)?;
            let flags = AtomicCommitFlags::PAGE_FLIP_EVENT | AtomicCommitFlags::NONBLOCK;
            match self.dev.fd.atomic_commit(flags, req) {
                Ok(()) => Ok(true),
                Err(err) if busy(&err) => Err(DrmError::Busy),
                Err(_) => {
                    state.needs_modeset = true;
                    Err(DrmError::TestFailed(self.crtc))
                }
            }
        }
    }

    /// Legacy commit path. Returns whether a pageflip event is expected.
    fn commit_legacy(
        &self,
        state: &mut PipelineState,
        mode: &KernelMode,
        fb: framebuffer::Handle,
        modeset: bool,
    ) -> Result<bool, DrmError> {
        if modeset {
            legacy::set_crtc(&self.dev, self.crtc, fb, &[self.connector], Some(*mode))?;
            // SetCrtc has no completion event, and flipping to the very
            // same framebuffer right away is rejected by some drivers
            return Ok(false);
        }
        match self
            .dev
            .fd
            .page_flip(self.crtc, fb, PageFlipFlags::EVENT, None)
        {
            Ok(()) => Ok(true),
            Err(err) if busy(&err) => Err(DrmError::Busy),
            Err(_) => {
                state.needs_modeset = true;
                Err(DrmError::TestFailed(self.crtc))
            }
        }
    }

    fn black_framebuffer(
        &self,
        state: &mut PipelineState,
        mode: &KernelMode,
    ) -> Result<framebuffer::Handle, DrmError> {
        let size = mode.size();
        if let Some(black) = &state.black_fb {
            if black.size == size {
                return Ok(black.fb);
            }
        }
        // dumb buffers come back zeroed, which scans out as black
        let dumb = DumbBuffer::create(&self.dev, size.0 as u32, size.1 as u32, Fourcc::Xrgb8888)?;
        let fb = add_dumb_framebuffer(&self.dev, &dumb)?;
        state.black_fb = Some(BlackBuffer {
            dev: self.dev.clone(),
            _dumb: dumb,
            fb,
            size,
        });
        Ok(fb)
    }

    /// Called by the backend when the kernel delivers the pageflip event
    /// for this crtc.
    pub(crate) fn on_page_flip(&self, frame: u32, time: Duration) -> Option<FlipResult> {
        let mut state = self.state.lock().unwrap();
        if !state.flip.is_pending() {
            trace!("Spurious pageflip event on {:?}", self.crtc);
            return None;
        }
        let seq = state.flip.complete(frame);
        state.deadline = None;
        // rotate: the queued buffer is being scanned out now, the previous
        // front buffer (and its BO references) can go
        if let Some(queued) = state.queued_fb.take() {
            state.current_fb = Some(queued);
        }
        let refresh = state
            .current_mode
            .as_ref()
            .map(modes::mode_info)
            .and_then(|m| m.refresh_interval());
        drop(state);

        let output = self.public_handle()?;
        Some(FlipResult {
            output,
            meta: Some(PresentMeta {
                time: Some(time),
                sequence: seq,
                refresh,
                flags: PresentFlags::VSYNC | PresentFlags::HW_CLOCK | PresentFlags::HW_COMPLETION,
            }),
        })
    }

    /// Expire the watchdog if this output's commit ran out of time.
    pub(crate) fn check_timeout(&self, now: Instant) -> Option<FlipResult> {
        let mut state = self.state.lock().unwrap();
        let deadline = state.deadline?;
        if deadline > now || !state.flip.is_pending() {
            return None;
        }
        warn!(
            "Pageflip on {:?} did not complete within {:?}, continuing without it",
            self.crtc, FLIP_TIMEOUT
        );
        state.flip.timeout();
        state.deadline = None;
        if let Some(queued) = state.queued_fb.take() {
            state.current_fb = Some(queued);
        }
        drop(state);
        let output = self.public_handle()?;
        Some(FlipResult { output, meta: None })
    }

    /// Currently armed watchdog deadline, for rearming after a scan.
    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.state.lock().unwrap().deadline
    }

    pub(crate) fn enable(&self, enable: bool) -> Result<(), OutputError> {
        if !self.dev.is_active() {
            return Err(OutputError::Inactive);
        }
        let mut state = self.state.lock().unwrap();
        if state.enabled == enable {
            return Ok(());
        }

        if self.dev.caps.atomic {
            let req = atomic::active_request(self.crtc, &self.crtc_props, enable)?;
            self.dev
                .fd
                .atomic_commit(AtomicCommitFlags::ALLOW_MODESET, req)
                .map_err(|source| DrmError::Access {
                    errmsg: "Failed to toggle crtc",
                    dev: self.dev.fd.dev_path(),
                    source,
                })?;
        } else {
            legacy::set_dpms(&self.dev, self.connector, &self.conn_props, enable)?;
        }

        state.enabled = enable;
        if !enable {
            state.flip.abandon();
            state.deadline = None;
        }
        drop(state);
        if let Some(inner) = self.output.lock().unwrap().upgrade() {
            inner.state.lock().unwrap().enabled = enable;
        }
        Ok(())
    }

    pub(crate) fn set_cursor(&self, image: Option<&CursorImage<'_>>) -> Result<bool, OutputError> {
        if !self.dev.is_active() {
            return Err(OutputError::Inactive);
        }
        let mut state = self.state.lock().unwrap();
        let (max_w, max_h) = self.dev.caps.cursor_size;

        let image = match image {
            Some(image) => image,
            None => {
                state.cursor.visible = false;
                let result = if let (true, Some(cursor)) =
                    (self.dev.caps.atomic, self.planes.cursor.as_ref())
                {
                    atomic::cursor_request(self.crtc, cursor, None, (0, 0), (max_w, max_h)).and_then(
                        |req| {
                            self.dev
                                .fd
                                .atomic_commit(AtomicCommitFlags::NONBLOCK, req)
                                .map_err(|source| DrmError::Access {
                                    errmsg: "Failed to hide cursor",
                                    dev: self.dev.fd.dev_path(),
                                    source,
                                })
                        },
                    )
                } else {
                    legacy::clear_cursor(&self.dev, self.crtc)
                };
                return result.map(|()| true).map_err(Into::into);
            }
        };

        if image.size.0 > max_w || image.size.1 > max_h {
            return Ok(false);
        }

        // upload into the back buffer of the double-buffered pair
        let back = (state.cursor.front + 1) % 2;
        if state.cursor.buffers[back].is_none() {
            state.cursor.buffers[back] = Some(self.create_cursor_buffer()?);
        }
        {
            let buffer = state.cursor.buffers[back].as_mut().unwrap();
            let mut mapping = buffer.dumb.map()?;
            let dst = mapping.as_mut();
            let dst_stride = (max_w * 4) as usize;
            dst.fill(0);
            for row in 0..image.size.1 as usize {
                let src_start = row * image.stride as usize;
                let len = (image.size.0 * 4) as usize;
                let dst_start = row * dst_stride;
                dst[dst_start..dst_start + len]
                    .copy_from_slice(&image.pixels[src_start..src_start + len]);
            }
        }
        state.cursor.front = back;
        state.cursor.hotspot = image.hotspot;
        state.cursor.visible = true;

        let position = state.cursor.position;
        let buffer = state.cursor.buffers[back].as_ref().unwrap();
        let result = if let (true, Some(cursor)) = (self.dev.caps.atomic, self.planes.cursor.as_ref())
        {
            atomic::cursor_request(self.crtc, cursor, Some(buffer.fb), position, (max_w, max_h))
                .and_then(|req| {
                    self.dev
                        .fd
                        .atomic_commit(AtomicCommitFlags::NONBLOCK, req)
                        .map_err(|source| DrmError::Access {
                            errmsg: "Failed to set cursor",
                            dev: self.dev.fd.dev_path(),
                            source,
                        })
                })
        } else {
            legacy::set_cursor(&self.dev, self.crtc, buffer.dumb.handle(), image.hotspot)
        };

        match result {
            Ok(()) => Ok(true),
            Err(err) => {
                debug!("Hardware cursor rejected: {}", err);
                Ok(false)
            }
        }
    }

    pub(crate) fn move_cursor(&self, x: i32, y: i32) -> Result<bool, OutputError> {
        if !self.dev.is_active() {
            return Err(OutputError::Inactive);
        }
        let mut state = self.state.lock().unwrap();
        state.cursor.position = (x - state.cursor.hotspot.0, y - state.cursor.hotspot.1);
        let position = state.cursor.position;
        if !state.cursor.visible {
            return Ok(true);
        }

        // position-only updates never schedule a pageflip
        let result = if let (true, Some(cursor)) = (self.dev.caps.atomic, self.planes.cursor.as_ref())
        {
            atomic::cursor_move_request(cursor, position).and_then(|req| {
                self.dev
                    .fd
                    .atomic_commit(AtomicCommitFlags::NONBLOCK, req)
                    .map_err(|source| DrmError::Access {
                        errmsg: "Failed to move cursor",
                        dev: self.dev.fd.dev_path(),
                        source,
                    })
            })
        } else {
            legacy::move_cursor(&self.dev, self.crtc, position)
        };

        match result {
            Ok(()) => Ok(true),
            Err(err) => {
                debug!("Hardware cursor move rejected: {}", err);
                Ok(false)
            }
        }
    }

    fn create_cursor_buffer(&self) -> Result<CursorBuffer, DrmError> {
        let (w, h) = self.dev.caps.cursor_size;
        let dumb = DumbBuffer::create(&self.dev, w, h, Fourcc::Argb8888)?;
        let fb = add_dumb_framebuffer(&self.dev, &dumb)?;
        Ok(CursorBuffer {
            dev: self.dev.clone(),
            dumb,
            fb,
        })
    }

    pub(crate) fn gamma_size(&self) -> Result<u32, OutputError> {
        if let Some(prop) = self.crtc_props.gamma_lut_size {
            if let Some(size) = props::current_value(&self.dev.fd, self.crtc, prop) {
                return Ok(size as u32);
            }
        }
        let info = self
            .dev
            .fd
            .get_crtc(self.crtc)
            .map_err(|source| DrmError::Access {
                errmsg: "Failed to get crtc info",
                dev: self.dev.fd.dev_path(),
                source,
            })?;
        Ok(info.gamma_length())
    }

    pub(crate) fn set_gamma(
        &self,
        red: &[u16],
        green: &[u16],
        blue: &[u16],
    ) -> Result<(), OutputError> {
        if !self.dev.is_active() {
            return Err(OutputError::Inactive);
        }
        let size = self.gamma_size()? as usize;
        if size == 0 {
            return Err(OutputError::Unsupported);
        }
        if red.len() != size || green.len() != size || blue.len() != size {
            return Err(OutputError::InvalidConfig);
        }

        if let (true, Some(prop)) = (self.dev.caps.atomic, self.crtc_props.gamma_lut) {
            // GAMMA_LUT wants an array of drm_color_lut entries
            let mut data = Vec::with_capacity(size * 8);
            for i in 0..size {
                data.extend_from_slice(&red[i].to_ne_bytes());
                data.extend_from_slice(&green[i].to_ne_bytes());
                data.extend_from_slice(&blue[i].to_ne_bytes());
                data.extend_from_slice(&0u16.to_ne_bytes());
            }
            let blob = self.dev.create_blob(&mut data)?;
            let result = atomic::gamma_request(self.crtc, prop, blob).and_then(|req| {
                self.dev
                    .fd
                    .atomic_commit(AtomicCommitFlags::empty(), req)
                    .map_err(|source| DrmError::Access {
                        errmsg: "Failed to set gamma lut",
                        dev: self.dev.fd.dev_path(),
                        source,
                    })
            });
            self.dev.destroy_blob(blob);
            result.map_err(Into::into)
        } else {
            legacy::set_gamma(&self.dev, self.crtc, red, green, blue).map_err(Into::into)
        }
    }

    /// Session pause: drop in-flight state, no frame events for abandoned
    /// commits.
    pub(crate) fn pause(&self) {
        let mut state = self.state.lock().unwrap();
        state.flip.abandon();
        state.deadline = None;
        state.queued_fb = None;
    }

    /// Session resume: everything must be modeset again.
    pub(crate) fn resume(&self) {
        let mut state = self.state.lock().unwrap();
        state.needs_modeset = true;
    }
}

impl Drop for DrmOutputInner {
    fn drop(&mut self) {
        if let Some(blob) = self.state.lock().unwrap().mode_blob.take() {
            self.dev.destroy_blob(blob);
        }
    }
}

fn primary_plane(planes: &Planes, crtc: crtc::Handle) -> Result<&super::device::PlaneState, DrmError> {
    planes.primary.as_ref().ok_or(DrmError::NoPrimaryPlane(crtc))
}

fn busy(err: &std::io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EBUSY) | Some(libc::EAGAIN) | Some(libc::EINTR)
    )
}

#[cfg(test)]
mod tests {
    use super::FlipTracker;

    #[test]
    fn at_most_one_commit_in_flight() {
        let mut flip = FlipTracker::default();
        assert!(flip.begin().is_ok());
        // a second commit is rejected until the first completes
        assert!(flip.begin().is_err());
        assert!(flip.begin().is_err());
        flip.complete(1);
        assert!(flip.begin().is_ok());
    }

    #[test]
    fn sequence_is_monotonic_across_completions() {
        let mut flip = FlipTracker::default();
        let mut last = 0;
        for frame in [10u32, 11, 12, 100, 101] {
            flip.begin().unwrap();
            let seq = flip.complete(frame);
            assert!(seq > last);
            last = seq;
        }
    }

    #[test]
    fn sequence_survives_counter_wraparound() {
        let mut flip = FlipTracker::default();
        flip.begin().unwrap();
        let near_wrap = flip.complete(u32::MAX - 1);
        flip.begin().unwrap();
        let wrapped = flip.complete(3);
        assert!(wrapped > near_wrap);
    }

    #[test]
    fn timeout_unlatches_and_advances() {
        let mut flip = FlipTracker::default();
        flip.begin().unwrap();
        let timed_out = flip.timeout();
        assert!(!flip.is_pending());
        assert!(flip.begin().is_ok());
        let next = flip.complete(0);
        assert!(next > timed_out);
    }

    #[test]
    fn abandon_clears_without_frame() {
        let mut flip = FlipTracker::default();
        flip.begin().unwrap();
        flip.abandon();
        assert!(!flip.is_pending());
        assert!(flip.begin().is_ok());
    }
}
