//! Nested Wayland backend
//!
//! Runs the compositor as a client of a parent Wayland compositor. Every
//! output is an xdg-toplevel window of the parent; resizing the parent
//! window synthesizes a custom mode change, the parent's frame callbacks
//! pace the frame events and the parent seat's devices are re-exposed as
//! input devices.
//!
//! Rendering is out of scope here as everywhere in this crate: commits
//! without an attached buffer map the window with a black wl_shm buffer so
//! the frame callback loop keeps running.

mod input;

use std::os::unix::io::{AsFd, OwnedFd};
use std::sync::{Arc, Mutex, Weak};

use calloop::{EventSource, Interest, Mode as CalloopMode, Poll, PostAction, Readiness, Token, TokenFactory};
use rustix::fs::MemfdFlags;
use tracing::{debug, info, info_span, trace, warn};
use wayland_client::protocol::{
    wl_buffer::{self, WlBuffer},
    wl_callback::{self, WlCallback},
    wl_compositor::WlCompositor,
    wl_registry::{self, WlRegistry},
    wl_shm::{self, WlShm},
    wl_shm_pool::{self, WlShmPool},
    wl_surface::{self, WlSurface},
};
use wayland_client::{
    ConnectError, Connection, Dispatch, EventQueue as WlEventQueue, Proxy, QueueHandle,
};
use wayland_protocols::xdg::shell::client::{
    xdg_surface::{self, XdgSurface},
    xdg_toplevel::{self, XdgToplevel},
    xdg_wm_base::{self, XdgWmBase},
};

use super::input::InputDevice;
use super::{Backend, BackendError, BackendEvent, EventQueue};
use crate::output::{Mode, Output, OutputError, OutputInner, OutputKind, OutputModeState};

pub(crate) use self::input::SeatState;

/// Errors of the nested Wayland backend.
#[derive(Debug, thiserror::Error)]
pub enum WaylandError {
    /// Connecting to the parent compositor failed
    #[error("failed to connect to the parent compositor: {0}")]
    Connect(#[from] ConnectError),
    /// The parent compositor is missing a required global
    #[error("the parent compositor does not advertise `{0}`")]
    MissingGlobal(&'static str),
    /// A protocol error occurred on the parent connection
    #[error("wayland protocol error: {0}")]
    Protocol(#[from] wayland_client::DispatchError),
    /// An io error occurred
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

const DEFAULT_SIZE: (i32, i32) = (1280, 720);

/// Backend side of one nested output window.
pub(crate) struct WaylandOutputInner {
    pub(crate) surface: WlSurface,
    xdg_surface: XdgSurface,
    toplevel: XdgToplevel,
    conn: Connection,
    qh: QueueHandle<WaylandState>,
    shm: WlShm,
    queue: EventQueue,
    pub(crate) output: Mutex<Weak<OutputInner>>,
    pub(crate) state: Mutex<WindowState>,
}

#[derive(Debug, Default)]
pub(crate) struct WindowState {
    pub(crate) size: (i32, i32),
    pub(crate) configured: bool,
    frame_pending: bool,
    buffer: Option<ShmBuffer>,
}

#[derive(Debug)]
struct ShmBuffer {
    buffer: WlBuffer,
    pool: WlShmPool,
    size: (i32, i32),
}

impl Drop for ShmBuffer {
    fn drop(&mut self) {
        self.buffer.destroy();
        self.pool.destroy();
    }
}

impl std::fmt::Debug for WaylandOutputInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaylandOutputInner")
            .field("surface", &self.surface.id())
            .finish_non_exhaustive()
    }
}

impl WaylandOutputInner {
    pub(crate) fn public_handle(&self) -> Option<Output> {
        self.output
            .lock()
            .unwrap()
            .upgrade()
            .map(|inner| Output { inner })
    }

    /// Commit the window: attach the placeholder buffer, request a frame
    /// callback and flush.
    pub(crate) fn commit(&self) -> Result<(), OutputError> {
        let mut state = self.state.lock().unwrap();
        if !state.configured {
            // first configure has not arrived yet, the commit after it
            // will map the window
            return Ok(());
        }
        let size = state.size;
        if state
            .buffer
            .as_ref()
            .map(|buffer| buffer.size != size)
            .unwrap_or(true)
        {
            state.buffer = match self.create_black_buffer(size) {
                Ok(buffer) => Some(buffer),
                Err(err) => return Err(OutputError::Backend(Box::new(err))),
            };
        }

        let buffer = state.buffer.as_ref().unwrap();
        self.surface.attach(Some(&buffer.buffer), 0, 0);
        self.surface
            .damage_buffer(0, 0, i32::MAX, i32::MAX);
        if !state.frame_pending {
            self.surface.frame(&self.qh, self.surface.clone());
            state.frame_pending = true;
        }
        self.surface.commit();
        let _ = self.conn.flush();
        Ok(())
    }

    fn create_black_buffer(&self, size: (i32, i32)) -> Result<ShmBuffer, std::io::Error> {
        let stride = size.0 * 4;
        let len = (stride * size.1) as usize;
        let fd: OwnedFd = rustix::fs::memfd_create("scanout-wl-shm", MemfdFlags::CLOEXEC)?.into();
        rustix::fs::ftruncate(&fd, len as u64)?;
        // freshly truncated pages are zeroed: opaque black in xrgb
        let pool = self.shm.create_pool(fd.as_fd(), len as i32, &self.qh, ());
        let buffer = pool.create_buffer(
            0,
            size.0,
            size.1,
            stride,
            wl_shm::Format::Xrgb8888,
            &self.qh,
            (),
        );
        Ok(ShmBuffer { buffer, pool, size })
    }

    fn frame_done(&self) {
        self.state.lock().unwrap().frame_pending = false;
        if let Some(output) = self.public_handle() {
            self.queue.push(BackendEvent::Frame { output });
        }
    }

    /// A configure from the parent changed the window size: synthesize a
    /// custom mode change.
    fn resized(&self, size: (i32, i32)) {
        let mode = Mode {
            size,
            refresh: 60_000,
            preferred: false,
        };
        if let Some(output) = self.public_handle() {
            {
                let mut state = output.inner.state.lock().unwrap();
                state.current = Some(mode);
            }
            self.queue.push(BackendEvent::ModeChanged { output, mode });
        }
    }
}

impl Drop for WaylandOutputInner {
    fn drop(&mut self) {
        self.toplevel.destroy();
        self.xdg_surface.destroy();
        self.surface.destroy();
        let _ = self.conn.flush();
    }
}

/// Protocol state, the dispatch target of the parent connection.
pub(crate) struct WaylandState {
    compositor: Option<WlCompositor>,
    wm_base: Option<XdgWmBase>,
    shm: Option<WlShm>,
    pub(crate) seat: SeatState,
    pub(crate) outputs: Vec<Arc<WaylandOutputInner>>,
    pub(crate) queue: EventQueue,
}

/// Backend running nested inside a parent Wayland compositor.
pub struct WaylandBackend {
    conn: Connection,
    wl_queue: WlEventQueue<WaylandState>,
    qh: QueueHandle<WaylandState>,
    state: WaylandState,
    queue: EventQueue,
    started: bool,
    counter: u32,
    conn_token: Option<Token>,
    wake_token: Option<Token>,
    span: tracing::Span,
}

impl std::fmt::Debug for WaylandBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaylandBackend")
            .field("outputs", &self.state.outputs.len())
            .finish_non_exhaustive()
    }
}

impl WaylandBackend {
    /// Connects to the parent compositor named by `WAYLAND_DISPLAY`.
    pub fn new() -> Result<WaylandBackend, WaylandError> {
        let span = info_span!("backend_wayland");
        let _guard = span.enter();

        let conn = Connection::connect_to_env()?;
        info!("Connected to parent wayland compositor");

        let mut wl_queue = conn.new_event_queue();
        let qh = wl_queue.handle();

        let display = conn.display();
        display.get_registry(&qh, ());

        let queue = EventQueue::new()?;
        let mut state = WaylandState {
            compositor: None,
            wm_base: None,
            shm: None,
            seat: SeatState::new(queue.clone()),
            outputs: Vec::new(),
            queue: queue.clone(),
        };

        // two roundtrips: one for the globals, one for the seat
        // capabilities announced in response to binding it
        wl_queue.roundtrip(&mut state)?;
        wl_queue.roundtrip(&mut state)?;

        if state.compositor.is_none() {
            return Err(WaylandError::MissingGlobal("wl_compositor"));
        }
        if state.wm_base.is_none() {
            return Err(WaylandError::MissingGlobal("xdg_wm_base"));
        }
        if state.shm.is_none() {
            return Err(WaylandError::MissingGlobal("wl_shm"));
        }

        drop(_guard);
        Ok(WaylandBackend {
            conn,
            wl_queue,
            qh,
            state,
            queue,
            started: false,
            counter: 0,
            conn_token: None,
            wake_token: None,
            span,
        })
    }

    /// Creates a new output window on the parent compositor.
    pub fn create_output(&mut self) -> Result<Output, WaylandError> {
        let _guard = self.span.enter();
        let compositor = self.state.compositor.as_ref().unwrap();
        let wm_base = self.state.wm_base.as_ref().unwrap();
        self.counter += 1;

        let surface = compositor.create_surface(&self.qh, ());
        let xdg_surface = wm_base.get_xdg_surface(&surface, &self.qh, ());
        let toplevel = xdg_surface.get_toplevel(&self.qh, ());
        toplevel.set_title(format!("scanout output {}", self.counter));
        toplevel.set_app_id(String::from("scanout"));
        // the initial commit without a buffer triggers the first configure
        surface.commit();
        let _ = self.conn.flush();

        let mode = Mode {
            size: DEFAULT_SIZE,
            refresh: 60_000,
            preferred: true,
        };
        let inner = Arc::new(WaylandOutputInner {
            surface,
            xdg_surface,
            toplevel,
            conn: self.conn.clone(),
            qh: self.qh.clone(),
            shm: self.state.shm.clone().unwrap(),
            queue: self.queue.clone(),
            output: Mutex::new(Weak::new()),
            state: Mutex::new(WindowState {
                size: DEFAULT_SIZE,
                ..Default::default()
            }),
        });
        let output = Output::new(
            format!("WL-{}", self.counter),
            String::from("wayland"),
            String::from("wayland"),
            None,
            (0, 0),
            OutputModeState {
                modes: vec![mode],
                current: Some(mode),
                enabled: true,
            },
            OutputKind::Wayland(Arc::downgrade(&inner)),
        );
        *inner.output.lock().unwrap() = Arc::downgrade(&output.inner);
        self.state.outputs.push(inner);

        info!("Created nested output window {}", self.counter);
        if self.started {
            self.queue.push(BackendEvent::NewOutput {
                output: output.clone(),
            });
        }
        Ok(output)
    }

    fn dispatch_connection(&mut self) -> Result<(), WaylandError> {
        let _ = self.conn.flush();
        if let Some(guard) = self.wl_queue.prepare_read() {
            let _ = guard.read();
        }
        self.wl_queue.dispatch_pending(&mut self.state)?;
        let _ = self.conn.flush();
        Ok(())
    }
}

impl Backend for WaylandBackend {
    fn start(&mut self) -> Result<(), BackendError> {
        if self.started {
            return Err(BackendError::AlreadyStarted);
        }
        let _guard = self.span.enter();
        info!(
            "Starting wayland backend with {} outputs",
            self.state.outputs.len()
        );
        self.started = true;
        for inner in &self.state.outputs {
            if let Some(output) = inner.public_handle() {
                self.queue.push(BackendEvent::NewOutput { output });
            }
        }
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.started
    }
}

impl EventSource for WaylandBackend {
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
        if Some(token) == self.conn_token {
            if let Err(err) = self.dispatch_connection() {
                warn!("Lost connection to the parent compositor: {}", err);
                return Ok(PostAction::Disable);
            }
        } else if Some(token) == self.wake_token {
            self.queue.waker().clear();
        }
        self.queue.drain(|event| callback(event, &mut ()));
        Ok(PostAction::Continue)
    }

    fn register(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        let conn_token = factory.token();
        let wake_token = factory.token();
        unsafe {
            poll.register(
                self.conn.backend().poll_fd(),
                Interest::READ,
                CalloopMode::Level,
                conn_token,
            )?;
            poll.register(
                self.queue.waker().as_fd(),
                Interest::READ,
                CalloopMode::Level,
                wake_token,
            )?;
        }
        self.conn_token = Some(conn_token);
        self.wake_token = Some(wake_token);
        Ok(())
    }

    fn reregister(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        self.unregister(poll)?;
        self.register(poll, factory)
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        if self.conn_token.take().is_some() {
            poll.unregister(self.conn.backend().poll_fd())?;
        }
        if self.wake_token.take().is_some() {
            poll.unregister(self.queue.waker().as_fd())?;
        }
        Ok(())
    }
}

//
// Protocol dispatch
//

impl Dispatch<WlRegistry, ()> for WaylandState {
    fn event(
        state: &mut Self,
        registry: &WlRegistry,
        event: wl_registry::Event,
        _: &(),
        _conn: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        if let wl_registry::Event::Global {
            name,
            interface,
            version,
        } = event
        {
            match interface.as_str() {
                "wl_compositor" => {
                    state.compositor =
                        Some(registry.bind::<WlCompositor, _, _>(name, version.min(4), qh, ()));
                }
                "xdg_wm_base" => {
                    state.wm_base =
                        Some(registry.bind::<XdgWmBase, _, _>(name, version.min(3), qh, ()));
                }
                "wl_shm" => {
                    state.shm = Some(registry.bind::<WlShm, _, _>(name, 1, qh, ()));
                }
                "wl_seat" => {
                    state.seat.bind(registry, name, version.min(7), qh);
                }
                _ => {}
            }
        }
    }
}

impl Dispatch<WlCompositor, ()> for WaylandState {
    fn event(
        _: &mut Self,
        _: &WlCompositor,
        _: <WlCompositor as Proxy>::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<XdgWmBase, ()> for WaylandState {
    fn event(
        _: &mut Self,
        wm_base: &XdgWmBase,
        event: xdg_wm_base::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let xdg_wm_base::Event::Ping { serial } = event {
            wm_base.pong(serial);
        }
    }
}

impl Dispatch<WlSurface, ()> for WaylandState {
    fn event(
        _: &mut Self,
        _: &WlSurface,
        _: wl_surface::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<XdgSurface, ()> for WaylandState {
    fn event(
        state: &mut Self,
        xdg_surface: &XdgSurface,
        event: xdg_surface::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let xdg_surface::Event::Configure { serial } = event {
            xdg_surface.ack_configure(serial);
            if let Some(inner) = state
                .outputs
                .iter()
                .find(|inner| inner.xdg_surface == *xdg_surface)
            {
                let was_configured = {
                    let mut window = inner.state.lock().unwrap();
                    std::mem::replace(&mut window.configured, true)
                };
                if !was_configured {
                    // map the window with the placeholder contents
                    let _ = inner.commit();
                }
            }
        }
    }
}

impl Dispatch<XdgToplevel, ()> for WaylandState {
    fn event(
        state: &mut Self,
        toplevel: &XdgToplevel,
        event: xdg_toplevel::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        let Some(inner) = state
            .outputs
            .iter()
            .find(|inner| inner.toplevel == *toplevel)
            .cloned()
        else {
            return;
        };
        match event {
            xdg_toplevel::Event::Configure { width, height, .. } => {
                if width > 0 && height > 0 {
                    let resized = {
                        let mut window = inner.state.lock().unwrap();
                        let changed = window.size != (width, height);
                        window.size = (width, height);
                        changed
                    };
                    if resized {
                        debug!("Parent window resized to {}x{}", width, height);
                        inner.resized((width, height));
                    }
                }
            }
            xdg_toplevel::Event::Close => {
                info!("Parent compositor closed an output window");
                if let Some(output) = inner.public_handle() {
                    state.queue.push(BackendEvent::OutputDestroyed { output });
                }
                state
                    .outputs
                    .retain(|candidate| !Arc::ptr_eq(candidate, &inner));
            }
            _ => {}
        }
    }
}

impl Dispatch<WlShm, ()> for WaylandState {
    fn event(
        _: &mut Self,
        _: &WlShm,
        _: wl_shm::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<WlShmPool, ()> for WaylandState {
    fn event(
        _: &mut Self,
        _: &WlShmPool,
        _: wl_shm_pool::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<WlBuffer, ()> for WaylandState {
    fn event(
        _: &mut Self,
        _: &WlBuffer,
        event: wl_buffer::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let wl_buffer::Event::Release = event {
            trace!("Parent released a buffer");
        }
    }
}

impl Dispatch<WlCallback, WlSurface> for WaylandState {
    fn event(
        state: &mut Self,
        _: &WlCallback,
        event: wl_callback::Event,
        surface: &WlSurface,
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let wl_callback::Event::Done { .. } = event {
            if let Some(inner) = state
                .outputs
                .iter()
                .find(|inner| inner.surface == *surface)
            {
                inner.frame_done();
            }
        }
    }
}

impl WaylandBackend {
    /// The input devices of the parent seat currently exposed.
    pub fn input_devices(&self) -> Vec<InputDevice> {
        self.state.seat.devices()
    }
}
