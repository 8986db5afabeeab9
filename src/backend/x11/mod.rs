//! Nested X11 backend
//!
//! Runs the compositor as a client of an X server, one window per output.
//! Window resizes become custom mode changes, core X11 input events are
//! translated into the uniform input taxonomy and a timer paces frame
//! events at 60Hz, mirroring what the X server would show anyway.

mod input;

use std::os::unix::io::AsFd;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use calloop::{EventSource, Interest, Mode as CalloopMode, Poll, PostAction, Readiness, Token, TokenFactory};
use tracing::{debug, info, info_span, warn};
use x11rb::connection::Connection;
use x11rb::protocol::xproto::{
    AtomEnum, ConfigureWindowAux, ConnectionExt, CreateWindowAux, EventMask, PropMode, WindowClass,
};
use x11rb::protocol::Event as X11Event;
use x11rb::rust_connection::RustConnection;
use x11rb::wrapper::ConnectionExt as _;

use super::input::{DeviceHandle, DeviceType, InputDevice};
use super::{Backend, BackendError, BackendEvent, EventQueue};
use crate::output::{Mode, Output, OutputError, OutputInner, OutputKind, OutputModeState};
use crate::utils::timer::TimerFd;

const DEFAULT_SIZE: (i32, i32) = (1280, 720);

/// Errors of the X11 backend.
#[derive(Debug, thiserror::Error)]
pub enum X11Error {
    /// Connecting to the X server failed
    #[error("failed to connect to the x server: {0}")]
    Connect(#[from] x11rb::errors::ConnectError),
    /// The connection to the X server broke
    #[error("x11 connection error: {0}")]
    Connection(#[from] x11rb::errors::ConnectionError),
    /// A request was rejected by the X server
    #[error("x11 request failed: {0}")]
    Reply(#[from] x11rb::errors::ReplyError),
    /// Allocating an X11 id failed
    #[error("x11 id allocation failed: {0}")]
    Id(#[from] x11rb::errors::ReplyOrIdError),
    /// An io error occurred
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Backend side of one X11 window output.
pub(crate) struct X11OutputInner {
    pub(crate) window: u32,
    conn: Arc<RustConnection>,
    queue: EventQueue,
    pub(crate) output: Mutex<Weak<OutputInner>>,
    pub(crate) size: Mutex<(i32, i32)>,
    frame_pending: Mutex<bool>,
}

impl std::fmt::Debug for X11OutputInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("X11OutputInner")
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

impl X11OutputInner {
    pub(crate) fn public_handle(&self) -> Option<Output> {
        self.output
            .lock()
            .unwrap()
            .upgrade()
            .map(|inner| Output { inner })
    }

    pub(crate) fn commit(&self) -> Result<(), OutputError> {
        *self.frame_pending.lock().unwrap() = true;
        Ok(())
    }

    /// Ask the X server to resize the window; the mode change is emitted
    /// once the matching ConfigureNotify arrives.
    pub(crate) fn set_custom_mode(&self, size: (i32, i32), _refresh: i32) -> Result<(), OutputError> {
        if size.0 <= 0 || size.1 <= 0 {
            return Err(OutputError::InvalidMode);
        }
        let aux = ConfigureWindowAux::new()
            .width(size.0 as u32)
            .height(size.1 as u32);
        self.conn
            .configure_window(self.window, &aux)
            .map_err(|err| OutputError::Backend(Box::new(X11Error::from(err))))?;
        self.conn
            .flush()
            .map_err(|err| OutputError::Backend(Box::new(X11Error::from(err))))?;
        Ok(())
    }

    fn resized(&self, size: (i32, i32)) {
        let mode = Mode {
            size,
            refresh: 60_000,
            preferred: false,
        };
        *self.size.lock().unwrap() = size;
        if let Some(output) = self.public_handle() {
            output.inner.state.lock().unwrap().current = Some(mode);
            self.queue.push(BackendEvent::ModeChanged { output, mode });
        }
    }
}

/// Backend running nested inside an X server.
pub struct X11Backend {
    conn: Arc<RustConnection>,
    screen: usize,
    wm_protocols: u32,
    wm_delete_window: u32,
    outputs: Vec<Arc<X11OutputInner>>,
    keyboard: InputDevice,
    pointer: InputDevice,
    timer: TimerFd,
    queue: EventQueue,
    started: bool,
    counter: u32,
    conn_token: Option<Token>,
    timer_token: Option<Token>,
    wake_token: Option<Token>,
    span: tracing::Span,
}

impl std::fmt::Debug for X11Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("X11Backend")
            .field("outputs", &self.outputs.len())
            .finish_non_exhaustive()
    }
}

impl X11Backend {
    /// Connects to the X server named by `DISPLAY`.
    pub fn new() -> Result<X11Backend, X11Error> {
        let span = info_span!("backend_x11");
        let _guard = span.enter();

        let (conn, screen) = x11rb::connect(None)?;
        info!("Connected to x server, screen {}", screen);

        let wm_protocols = conn.intern_atom(false, b"WM_PROTOCOLS")?.reply()?.atom;
        let wm_delete_window = conn.intern_atom(false, b"WM_DELETE_WINDOW")?.reply()?.atom;

        let keyboard = InputDevice::new(
            String::from("x11-keyboard"),
            DeviceType::Keyboard,
            0,
            0,
            DeviceHandle::Virtual,
        );
        let pointer = InputDevice::new(
            String::from("x11-pointer"),
            DeviceType::Pointer,
            0,
            0,
            DeviceHandle::Virtual,
        );

        let timer = TimerFd::new()?;
        let queue = EventQueue::new()?;

        drop(_guard);
        Ok(X11Backend {
            conn: Arc::new(conn),
            screen,
            wm_protocols,
            wm_delete_window,
            outputs: Vec::new(),
            keyboard,
            pointer,
            timer,
            queue,
            started: false,
            counter: 0,
            conn_token: None,
            timer_token: None,
            wake_token: None,
            span,
        })
    }

    /// Creates a new output window.
    pub fn create_output(&mut self) -> Result<Output, X11Error> {
        let _guard = self.span.enter();
        self.counter += 1;
        let screen = &self.conn.setup().roots[self.screen];

        let window = self.conn.generate_id()?;
        let aux = CreateWindowAux::new()
            .event_mask(
                EventMask::EXPOSURE
                    | EventMask::STRUCTURE_NOTIFY
                    | EventMask::KEY_PRESS
                    | EventMask::KEY_RELEASE
                    | EventMask::BUTTON_PRESS
                    | EventMask::BUTTON_RELEASE
                    | EventMask::POINTER_MOTION,
            )
            .background_pixel(screen.black_pixel);
        self.conn.create_window(
            x11rb::COPY_DEPTH_FROM_PARENT,
            window,
            screen.root,
            0,
            0,
            DEFAULT_SIZE.0 as u16,
            DEFAULT_SIZE.1 as u16,
            0,
            WindowClass::INPUT_OUTPUT,
            0,
            &aux,
        )?;

        let title = format!("scanout output {}", self.counter);
        self.conn.change_property8(
            PropMode::REPLACE,
            window,
            AtomEnum::WM_NAME,
            AtomEnum::STRING,
            title.as_bytes(),
        )?;
        self.conn.change_property32(
            PropMode::REPLACE,
            window,
            self.wm_protocols,
            AtomEnum::ATOM,
            &[self.wm_delete_window],
        )?;
        self.conn.map_window(window)?;
        self.conn.flush()?;

        let mode = Mode {
            size: DEFAULT_SIZE,
            refresh: 60_000,
            preferred: true,
        };
        let inner = Arc::new(X11OutputInner {
            window,
            conn: self.conn.clone(),
            queue: self.queue.clone(),
            output: Mutex::new(Weak::new()),
            size: Mutex::new(DEFAULT_SIZE),
            frame_pending: Mutex::new(false),
        });
        let output = Output::new(
            format!("X11-{}", self.counter),
            String::from("x11"),
            String::from("x11"),
            None,
            (0, 0),
            OutputModeState {
                modes: vec![mode],
                current: Some(mode),
                enabled: true,
            },
            OutputKind::X11(Arc::downgrade(&inner)),
        );
        *inner.output.lock().unwrap() = Arc::downgrade(&output.inner);
        self.outputs.push(inner);

        info!(window, "Created x11 output window");
        if self.started {
            self.queue.push(BackendEvent::NewOutput {
                output: output.clone(),
            });
        }
        Ok(output)
    }

    fn output_for_window(&self, window: u32) -> Option<&Arc<X11OutputInner>> {
        self.outputs.iter().find(|inner| inner.window == window)
    }

    fn dispatch_x11(&mut self, mut emit: impl FnMut(BackendEvent)) -> Result<(), X11Error> {
        while let Some(event) = self.conn.poll_for_event()? {
            match event {
                X11Event::ConfigureNotify(configure) => {
                    if let Some(inner) = self.output_for_window(configure.window) {
                        let size = (configure.width as i32, configure.height as i32);
                        if *inner.size.lock().unwrap() != size {
                            debug!("Window resized to {}x{}", size.0, size.1);
                            inner.resized(size);
                        }
                    }
                }
                X11Event::ClientMessage(message) => {
                    if message.format == 32
                        && message.data.as_data32()[0] == self.wm_delete_window
                    {
                        if let Some(inner) = self.output_for_window(message.window).cloned() {
                            info!("Window closed by the user");
                            if let Some(output) = inner.public_handle() {
                                emit(BackendEvent::OutputDestroyed { output });
                            }
                            self.outputs.retain(|o| !Arc::ptr_eq(o, &inner));
                        }
                    }
                }
                X11Event::DestroyNotify(destroy) => {
                    if let Some(inner) = self.output_for_window(destroy.window).cloned() {
                        if let Some(output) = inner.public_handle() {
                            emit(BackendEvent::OutputDestroyed { output });
                        }
                        self.outputs.retain(|o| !Arc::ptr_eq(o, &inner));
                    }
                }
                event => {
                    let window_size = |window: u32| {
                        self.output_for_window(window)
                            .map(|inner| *inner.size.lock().unwrap())
                    };
                    if let Some(event) =
                        input::translate(&event, &self.keyboard, &self.pointer, window_size)
                    {
                        emit(BackendEvent::Input(event));
                    }
                }
            }
        }
        Ok(())
    }

    fn frame_tick(&mut self, mut emit: impl FnMut(BackendEvent)) {
        self.timer.read();
        for inner in &self.outputs {
            let mut pending = inner.frame_pending.lock().unwrap();
            if *pending {
                *pending = false;
                drop(pending);
                if let Some(output) = inner.public_handle() {
                    emit(BackendEvent::Frame { output });
                }
            }
        }
    }
}

impl Backend for X11Backend {
    fn start(&mut self) -> Result<(), BackendError> {
        if self.started {
            return Err(BackendError::AlreadyStarted);
        }
        let _guard = self.span.enter();
        info!("Starting x11 backend with {} outputs", self.outputs.len());
        self.started = true;

        let interval = Duration::from_nanos(1_000_000_000 / 60);
        self.timer
            .set_repeating(interval, interval)
            .map_err(BackendError::Io)?;

        for inner in &self.outputs {
            *inner.frame_pending.lock().unwrap() = true;
            if let Some(output) = inner.public_handle() {
                self.queue.push(BackendEvent::NewOutput { output });
            }
        }
        self.queue.push(BackendEvent::NewInput {
            device: self.keyboard.clone(),
        });
        self.queue.push(BackendEvent::NewInput {
            device: self.pointer.clone(),
        });
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.started
    }
}

impl EventSource for X11Backend {
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
            if let Err(err) = self.dispatch_x11(|event| callback(event, &mut ())) {
                warn!("Lost connection to the x server: {}", err);
                return Ok(PostAction::Disable);
            }
        } else if Some(token) == self.timer_token {
            self.frame_tick(|event| callback(event, &mut ()));
        } else if Some(token) == self.wake_token {
            self.queue.waker().clear();
        }
        self.queue.drain(|event| callback(event, &mut ()));
        Ok(PostAction::Continue)
    }

    fn register(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        let conn_token = factory.token();
        let timer_token = factory.token();
        let wake_token = factory.token();
        unsafe {
            poll.register(
                self.conn.stream().as_fd(),
                Interest::READ,
                CalloopMode::Level,
                conn_token,
            )?;
            poll.register(
                self.timer.as_fd(),
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
        self.conn_token = Some(conn_token);
        self.timer_token = Some(timer_token);
        self.wake_token = Some(wake_token);
        Ok(())
    }

    fn reregister(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        self.unregister(poll)?;
        self.register(poll, factory)
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        if self.conn_token.take().is_some() {
            poll.unregister(self.conn.stream().as_fd())?;
        }
        if self.timer_token.take().is_some() {
            poll.unregister(self.timer.as_fd())?;
        }
        if self.wake_token.take().is_some() {
            poll.unregister(self.queue.waker().as_fd())?;
        }
        Ok(())
    }
}
