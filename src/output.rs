//! Output
//!
//! This module provides the backend-independent handle to a display an
//! attached compositor renders to. Outputs are created and owned by their
//! backend; the compositor receives cheap-clone [`Output`] handles through
//! [`BackendEvent::NewOutput`](crate::backend::BackendEvent::NewOutput) and
//! drives presentation through them.
//!
//! A destroyed output is harmless: every operation on a handle whose backend
//! side is gone returns [`OutputError::Destroyed`].

use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::backend::allocator::dmabuf::Dmabuf;

/// A display mode: resolution and refresh rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mode {
    /// Resolution in pixels.
    pub size: (i32, i32),
    /// Vertical refresh rate in millihertz.
    pub refresh: i32,
    /// Whether the kernel/backend marked this mode as preferred.
    pub preferred: bool,
}

impl Mode {
    /// The refresh interval of this mode, if the refresh rate is known.
    pub fn refresh_interval(&self) -> Option<Duration> {
        if self.refresh <= 0 {
            return None;
        }
        Some(Duration::from_nanos(1_000_000_000_000u64 / self.refresh as u64))
    }
}

bitflags::bitflags! {
    /// How the presentation timestamp of a [`PresentMeta`] was obtained.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PresentFlags: u32 {
        /// The presentation was synchronized to the vblank.
        const VSYNC = 1;
        /// The timestamp comes from the display hardware clock.
        const HW_CLOCK = 2;
        /// Completion was signalled by the display hardware.
        const HW_COMPLETION = 4;
        /// The buffer was scanned out directly without a copy.
        const ZERO_COPY = 8;
    }
}

/// Payload of a [`BackendEvent::Present`](crate::backend::BackendEvent::Present).
///
/// Describes when the previously committed frame actually reached screen.
#[derive(Debug, Clone, Copy)]
pub struct PresentMeta {
    /// `CLOCK_MONOTONIC` timestamp of the scanout, if the backend knows it.
    pub time: Option<Duration>,
    /// Monotonically increasing presentation counter.
    pub sequence: u64,
    /// Refresh interval of the output at presentation time.
    pub refresh: Option<Duration>,
    /// Precision of the reported data.
    pub flags: PresentFlags,
}

/// An ARGB8888 cursor image to upload to the cursor plane.
#[derive(Debug, Clone, Copy)]
pub struct CursorImage<'a> {
    /// Pixel data, row-major ARGB8888.
    pub pixels: &'a [u8],
    /// Width and height in pixels.
    pub size: (u32, u32),
    /// Bytes per row.
    pub stride: u32,
    /// Hotspot position relative to the top-left corner.
    pub hotspot: (i32, i32),
}

/// Errors returned by operations on an [`Output`].
#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    /// The backend side of this output is gone.
    #[error("the output has been destroyed")]
    Destroyed,
    /// The output (or its backend) does not support the operation.
    #[error("operation is not supported by this output")]
    Unsupported,
    /// The requested mode is not advertised by or suitable for the output.
    #[error("mode is not suitable for this output")]
    InvalidMode,
    /// The previous commit has not completed yet. Wait for the next
    /// [`Frame`](crate::backend::BackendEvent::Frame) event and retry.
    #[error("a pageflip is still pending on this output")]
    FramePending,
    /// The session owning the underlying device is inactive. Not a failure;
    /// rendering resumes after the next session activation.
    #[error("the underlying device is currently inactive")]
    Inactive,
    /// The device rejected the configuration (atomic test failed). The
    /// pending state has been rolled back.
    #[error("the configuration was rejected by the device")]
    InvalidConfig,
    /// The device is temporarily busy. Retry after the next frame event.
    #[error("the device is busy, retry later")]
    Busy,
    /// Backend specific failure.
    #[error("backend error")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Handle to a single display output.
///
/// Clones refer to the same output. Handles stay valid after the output is
/// destroyed, but all operations on them fail with
/// [`OutputError::Destroyed`].
#[derive(Clone)]
pub struct Output {
    pub(crate) inner: Arc<OutputInner>,
}

pub(crate) struct OutputInner {
    pub(crate) name: String,
    pub(crate) make: String,
    pub(crate) model: String,
    pub(crate) serial: Option<String>,
    /// Physical dimensions in millimeters, (0, 0) if unknown.
    pub(crate) physical_size: (i32, i32),
    pub(crate) state: Mutex<OutputModeState>,
    pub(crate) kind: OutputKind,
}

#[derive(Debug, Default)]
pub(crate) struct OutputModeState {
    pub(crate) modes: Vec<Mode>,
    pub(crate) current: Option<Mode>,
    pub(crate) enabled: bool,
}

pub(crate) enum OutputKind {
    #[cfg(feature = "backend_drm")]
    Drm(Weak<crate::backend::drm::output::DrmOutputInner>),
    #[cfg(feature = "backend_headless")]
    Headless(Weak<crate::backend::headless::HeadlessOutputInner>),
    #[cfg(feature = "backend_noop")]
    Noop,
    #[cfg(feature = "backend_wayland")]
    Wayland(Weak<crate::backend::wayland::WaylandOutputInner>),
    #[cfg(feature = "backend_x11")]
    X11(Weak<crate::backend::x11::X11OutputInner>),
    #[cfg(feature = "backend_rdp")]
    Rdp(Weak<crate::backend::rdp::RdpOutputInner>),
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Output")
            .field("name", &self.inner.name)
            .field("make", &self.inner.make)
            .field("model", &self.inner.model)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Output {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for Output {}

impl std::hash::Hash for Output {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.inner) as usize).hash(state);
    }
}

impl Output {
    pub(crate) fn new(
        name: String,
        make: String,
        model: String,
        serial: Option<String>,
        physical_size: (i32, i32),
        state: OutputModeState,
        kind: OutputKind,
    ) -> Output {
        Output {
            inner: Arc::new(OutputInner {
                name,
                make,
                model,
                serial,
                physical_size,
                state: Mutex::new(state),
                kind,
            }),
        }
    }

    /// Name of the output, e.g. `eDP-1` or `HEADLESS-1`.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Manufacturer as reported by the EDID, or the backend name.
    pub fn make(&self) -> &str {
        &self.inner.make
    }

    /// Model as reported by the EDID, or the backend name.
    pub fn model(&self) -> &str {
        &self.inner.model
    }

    /// Serial string as reported by the EDID, if any.
    pub fn serial(&self) -> Option<&str> {
        self.inner.serial.as_deref()
    }

    /// Physical dimensions in millimeters, `(0, 0)` if unknown.
    pub fn physical_size(&self) -> (i32, i32) {
        self.inner.physical_size
    }

    /// The modes advertised by this output.
    pub fn modes(&self) -> Vec<Mode> {
        self.inner.state.lock().unwrap().modes.clone()
    }

    /// The mode currently programmed, if any.
    pub fn current_mode(&self) -> Option<Mode> {
        self.inner.state.lock().unwrap().current
    }

    /// The advertised mode marked as preferred, falling back to the first.
    pub fn preferred_mode(&self) -> Option<Mode> {
        let state = self.inner.state.lock().unwrap();
        state
            .modes
            .iter()
            .find(|m| m.preferred)
            .or_else(|| state.modes.first())
            .copied()
    }

    /// Whether the output is currently enabled.
    pub fn is_enabled(&self) -> bool {
        self.inner.state.lock().unwrap().enabled
    }

    /// Select one of the advertised modes.
    ///
    /// The mode is applied by the next [`commit`](Output::commit).
    pub fn set_mode(&self, mode: Mode) -> Result<(), OutputError> {
        match &self.inner.kind {
            #[cfg(feature = "backend_drm")]
            OutputKind::Drm(inner) => inner.upgrade().ok_or(OutputError::Destroyed)?.set_mode(mode),
            _ => self.set_state_mode(mode, false),
        }
    }

    /// Construct and select a custom mode from width, height and refresh
    /// rate (mHz, 0 picks a default).
    pub fn set_custom_mode(&self, size: (i32, i32), refresh: i32) -> Result<(), OutputError> {
        match &self.inner.kind {
            #[cfg(feature = "backend_drm")]
            OutputKind::Drm(inner) => inner
                .upgrade()
                .ok_or(OutputError::Destroyed)?
                .set_custom_mode(size, refresh),
            #[cfg(feature = "backend_x11")]
            OutputKind::X11(inner) => inner
                .upgrade()
                .ok_or(OutputError::Destroyed)?
                .set_custom_mode(size, refresh),
            _ => {
                let mode = Mode {
                    size,
                    refresh: if refresh == 0 { 60_000 } else { refresh },
                    preferred: false,
                };
                self.set_state_mode(mode, true)
            }
        }
    }

    fn set_state_mode(&self, mode: Mode, custom: bool) -> Result<(), OutputError> {
        let mut state = self.inner.state.lock().unwrap();
        if !custom && !state.modes.contains(&mode) {
            return Err(OutputError::InvalidMode);
        }
        state.current = Some(mode);
        Ok(())
    }

    /// Enable or disable the output (DPMS).
    ///
    /// A disabled output keeps its CRTC but commits no frames.
    pub fn enable(&self, enable: bool) -> Result<(), OutputError> {
        match &self.inner.kind {
            #[cfg(feature = "backend_drm")]
            OutputKind::Drm(inner) => inner.upgrade().ok_or(OutputError::Destroyed)?.enable(enable),
            _ => {
                self.inner.state.lock().unwrap().enabled = enable;
                Ok(())
            }
        }
    }

    /// Attach a buffer to be presented by the next [`commit`](Output::commit).
    ///
    /// Backends that do not scan out client buffers (headless, noop, the
    /// nested backends without a renderer attached) accept and ignore the
    /// buffer contents.
    pub fn attach_buffer(&self, buffer: &Dmabuf) -> Result<(), OutputError> {
        match &self.inner.kind {
            #[cfg(feature = "backend_drm")]
            OutputKind::Drm(inner) => inner
                .upgrade()
                .ok_or(OutputError::Destroyed)?
                .attach_buffer(buffer),
            _ => Ok(()),
        }
    }

    /// Submit the pending state to the backend.
    ///
    /// At most one commit per output may be in flight: while the previous
    /// commit has not produced a [`Frame`](crate::backend::BackendEvent::Frame)
    /// event, further commits fail with [`OutputError::FramePending`].
    pub fn commit(&self) -> Result<(), OutputError> {
        match &self.inner.kind {
            #[cfg(feature = "backend_drm")]
            OutputKind::Drm(inner) => inner.upgrade().ok_or(OutputError::Destroyed)?.commit(),
            #[cfg(feature = "backend_headless")]
            OutputKind::Headless(inner) => inner.upgrade().ok_or(OutputError::Destroyed)?.commit(),
            #[cfg(feature = "backend_noop")]
            OutputKind::Noop => Ok(()),
            #[cfg(feature = "backend_wayland")]
            OutputKind::Wayland(inner) => inner.upgrade().ok_or(OutputError::Destroyed)?.commit(),
            #[cfg(feature = "backend_x11")]
            OutputKind::X11(inner) => inner.upgrade().ok_or(OutputError::Destroyed)?.commit(),
            #[cfg(feature = "backend_rdp")]
            OutputKind::Rdp(inner) => inner.upgrade().ok_or(OutputError::Destroyed)?.commit(),
        }
    }

    /// Upload a cursor image to the hardware cursor plane.
    ///
    /// Returns `Ok(false)` if this output has no usable cursor plane; the
    /// caller is expected to composite the cursor itself in that case.
    /// Passing `None` hides the cursor.
    pub fn set_cursor(&self, image: Option<&CursorImage<'_>>) -> Result<bool, OutputError> {
        match &self.inner.kind {
            #[cfg(feature = "backend_drm")]
            OutputKind::Drm(inner) => inner.upgrade().ok_or(OutputError::Destroyed)?.set_cursor(image),
            _ => Ok(false),
        }
    }

    /// Move the hardware cursor. Position-only updates never schedule a
    /// pageflip.
    pub fn move_cursor(&self, x: i32, y: i32) -> Result<bool, OutputError> {
        match &self.inner.kind {
            #[cfg(feature = "backend_drm")]
            OutputKind::Drm(inner) => inner.upgrade().ok_or(OutputError::Destroyed)?.move_cursor(x, y),
            _ => Ok(false),
        }
    }

    /// Size of the gamma lookup table, 0 if gamma is not supported.
    pub fn gamma_size(&self) -> Result<u32, OutputError> {
        match &self.inner.kind {
            #[cfg(feature = "backend_drm")]
            OutputKind::Drm(inner) => inner.upgrade().ok_or(OutputError::Destroyed)?.gamma_size(),
            _ => Ok(0),
        }
    }

    /// Program the gamma lookup table. All three slices must have the
    /// length reported by [`gamma_size`](Output::gamma_size).
    pub fn set_gamma(&self, red: &[u16], green: &[u16], blue: &[u16]) -> Result<(), OutputError> {
        match &self.inner.kind {
            #[cfg(feature = "backend_drm")]
            OutputKind::Drm(inner) => inner
                .upgrade()
                .ok_or(OutputError::Destroyed)?
                .set_gamma(red, green, blue),
            _ => {
                let _ = (red, green, blue);
                Err(OutputError::Unsupported)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(feature = "backend_noop")]
    fn noop_output(modes: Vec<Mode>) -> Output {
        Output::new(
            "TEST-1".into(),
            "test".into(),
            "test".into(),
            None,
            (0, 0),
            OutputModeState {
                modes,
                current: None,
                enabled: false,
            },
            OutputKind::Noop,
        )
    }

    #[cfg(feature = "backend_noop")]
    #[test]
    fn preferred_mode_selection() {
        let m1 = Mode {
            size: (1280, 720),
            refresh: 60_000,
            preferred: false,
        };
        let m2 = Mode {
            size: (1920, 1080),
            refresh: 60_000,
            preferred: true,
        };
        let output = noop_output(vec![m1, m2]);
        assert_eq!(output.preferred_mode(), Some(m2));

        let output = noop_output(vec![m1]);
        assert_eq!(output.preferred_mode(), Some(m1));

        let output = noop_output(vec![]);
        assert_eq!(output.preferred_mode(), None);
    }

    #[cfg(feature = "backend_noop")]
    #[test]
    fn set_mode_rejects_unadvertised() {
        let m1 = Mode {
            size: (1280, 720),
            refresh: 60_000,
            preferred: false,
        };
        let output = noop_output(vec![m1]);
        assert!(output.set_mode(m1).is_ok());
        assert_eq!(output.current_mode(), Some(m1));

        let bogus = Mode {
            size: (640, 480),
            refresh: 60_000,
            preferred: false,
        };
        assert!(matches!(output.set_mode(bogus), Err(OutputError::InvalidMode)));

        // custom modes are always accepted
        assert!(output.set_custom_mode((640, 480), 0).is_ok());
        assert_eq!(output.current_mode().unwrap().refresh, 60_000);
    }

    #[test]
    fn refresh_interval() {
        let mode = Mode {
            size: (1920, 1080),
            refresh: 60_000,
            preferred: false,
        };
        let interval = mode.refresh_interval().unwrap();
        assert_eq!(interval.as_nanos(), 16_666_666);

        let unknown = Mode {
            size: (1920, 1080),
            refresh: 0,
            preferred: false,
        };
        assert!(unknown.refresh_interval().is_none());
    }
}
