//! Headless backend
//!
//! Outputs without any presentation target, useful for tests, CI and
//! compositors that only serve remote or virtual clients. Frame events are
//! produced by a timer at the refresh rate of each output; commits succeed
//! unconditionally and buffer contents are discarded.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use calloop::{EventSource, Interest, Mode as CalloopMode, Poll, PostAction, Readiness, Token, TokenFactory};
use rustix::fd::AsFd;
use tracing::{info, info_span};

use super::{Backend, BackendError, BackendEvent, EventQueue};
use crate::output::{Mode, Output, OutputKind, OutputModeState};
use crate::utils::timer::TimerFd;

/// The mode headless outputs come up with if none is given.
const DEFAULT_MODE: Mode = Mode {
    size: (1280, 720),
    refresh: 60_000,
    preferred: true,
};

/// Backend side of a headless output.
#[derive(Debug)]
pub(crate) struct HeadlessOutputInner {
    output: Mutex<Weak<crate::output::OutputInner>>,
    /// Set while a commit is waiting for its frame event.
    frame_pending: Mutex<bool>,
}

impl HeadlessOutputInner {
    pub(crate) fn commit(&self) -> Result<(), crate::output::OutputError> {
        // nothing scans out; the next timer tick produces the frame event
        *self.frame_pending.lock().unwrap() = true;
        Ok(())
    }

    fn public_handle(&self) -> Option<Output> {
        self.output
            .lock()
            .unwrap()
            .upgrade()
            .map(|inner| Output { inner })
    }
}

/// Backend producing virtual outputs driven by a frame timer.
#[derive(Debug)]
pub struct HeadlessBackend {
    outputs: Vec<Arc<HeadlessOutputInner>>,
    timer: TimerFd,
    queue: EventQueue,
    started: bool,
    counter: u32,
    timer_token: Option<Token>,
    wake_token: Option<Token>,
    span: tracing::Span,
}

impl HeadlessBackend {
    /// Creates a new headless backend without any outputs.
    pub fn new() -> std::io::Result<HeadlessBackend> {
        let span = info_span!("backend_headless");
        let _guard = span.enter();
        info!("Creating headless backend");

        let timer = TimerFd::new()?;
        let queue = EventQueue::new()?;

        drop(_guard);
        Ok(HeadlessBackend {
            outputs: Vec::new(),
            timer,
            queue,
            started: false,
            counter: 0,
            timer_token: None,
            wake_token: None,
            span,
        })
    }

    /// Adds a new output of the given size.
    ///
    /// If the backend is already started the output is announced right
    /// away, otherwise announcement happens on [`start`](Backend::start).
    pub fn add_output(&mut self, size: (i32, i32)) -> Output {
        self.counter += 1;
        let mode = Mode {
            size,
            refresh: DEFAULT_MODE.refresh,
            preferred: true,
        };
        let inner = Arc::new(HeadlessOutputInner {
            output: Mutex::new(Weak::new()),
            frame_pending: Mutex::new(false),
        });
        let output = Output::new(
            format!("HEADLESS-{}", self.counter),
            String::from("headless"),
            String::from("headless"),
            None,
            (0, 0),
            OutputModeState {
                modes: vec![mode],
                current: Some(mode),
                enabled: true,
            },
            OutputKind::Headless(Arc::downgrade(&inner)),
        );
        *inner.output.lock().unwrap() = Arc::downgrade(&output.inner);
        self.outputs.push(inner);

        if self.started {
            self.queue.push(BackendEvent::NewOutput {
                output: output.clone(),
            });
        }
        output
    }

    /// Adds an output with the default 1280x720 mode.
    pub fn add_default_output(&mut self) -> Output {
        self.add_output(DEFAULT_MODE.size)
    }

    fn frame_tick(&mut self, mut callback: impl FnMut(BackendEvent)) {
        self.timer.read();
        for inner in &self.outputs {
            let mut pending = inner.frame_pending.lock().unwrap();
            if *pending {
                *pending = false;
                drop(pending);
                if let Some(output) = inner.public_handle() {
                    callback(BackendEvent::Frame { output });
                }
            }
        }
    }
}

impl Backend for HeadlessBackend {
    fn start(&mut self) -> Result<(), BackendError> {
        if self.started {
            return Err(BackendError::AlreadyStarted);
        }
        let _guard = self.span.enter();
        info!("Starting headless backend with {} outputs", self.outputs.len());
        self.started = true;

        // refresh-paced frame clock for all outputs
        let interval = DEFAULT_MODE
            .refresh_interval()
            .unwrap_or(Duration::from_millis(16));
        self.timer
            .set_repeating(interval, interval)
            .map_err(BackendError::Io)?;

        for inner in &self.outputs {
            // the first frame is free, the compositor starts the loop
            *inner.frame_pending.lock().unwrap() = true;
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

impl EventSource for HeadlessBackend {
    type Event = BackendEvent;
    type Metadata = ();
    type Ret = ();
    type Error = BackendError;

    fn process_events<F>(
        &mut self,
        _: Readiness,
        token: Token,
        mut callback: F,
    ) -> Result<PostAction, BackendError>
    where
        F: FnMut(BackendEvent, &mut ()),
    {
        if Some(token) == self.timer_token {
            self.frame_tick(|event| callback(event, &mut ()));
        } else if Some(token) == self.wake_token {
            self.queue.waker().clear();
        }
        self.queue.drain(|event| callback(event, &mut ()));
        Ok(PostAction::Continue)
    }

    fn register(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        let timer_token = factory.token();
        let wake_token = factory.token();
        unsafe {
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
        self.timer_token = Some(timer_token);
        self.wake_token = Some(wake_token);
        Ok(())
    }

    fn reregister(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        self.unregister(poll)?;
        self.register(poll, factory)
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        if self.timer_token.take().is_some() {
            poll.unregister(self.timer.as_fd())?;
        }
        if self.wake_token.take().is_some() {
            poll.unregister(self.queue.waker().as_fd())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use std::time::Instant;

    struct TestState {
        new_outputs: Vec<Output>,
        frames: Vec<Output>,
    }

    /// Two headless outputs announce themselves on start and a commit
    /// yields a frame event within 100ms.
    #[test]
    fn headless_boot_announces_outputs_and_frames() {
        let mut event_loop = calloop::EventLoop::<TestState>::try_new().unwrap();
        let mut backend = HeadlessBackend::new().unwrap();
        backend.add_default_output();
        backend.add_default_output();
        backend.start().unwrap();

        event_loop
            .handle()
            .insert_source(backend, |event, _, state| match event {
                BackendEvent::NewOutput { output } => state.new_outputs.push(output),
                BackendEvent::Frame { output } => state.frames.push(output),
                _ => {}
            })
            .unwrap();

        let mut state = TestState {
            new_outputs: Vec::new(),
            frames: Vec::new(),
        };

        let deadline = Instant::now() + Duration::from_millis(500);
        while state.new_outputs.len() < 2 && Instant::now() < deadline {
            event_loop
                .dispatch(Some(Duration::from_millis(50)), &mut state)
                .unwrap();
        }
        assert_eq!(state.new_outputs.len(), 2);
        for output in &state.new_outputs {
            assert_eq!(output.make(), "headless");
            assert_eq!(output.model(), "headless");
            assert!(output.commit().is_ok());
        }

        let committed = state.new_outputs.clone();
        let deadline = Instant::now() + Duration::from_millis(100);
        while state.frames.len() < 2 && Instant::now() < deadline {
            event_loop
                .dispatch(Some(Duration::from_millis(10)), &mut state)
                .unwrap();
        }
        for output in &committed {
            assert!(
                state.frames.contains(output),
                "no frame event for {:?}",
                output
            );
        }
    }

    /// Outputs added after start are announced immediately.
    #[test]
    fn hotplugged_output_is_announced() {
        let mut event_loop = calloop::EventLoop::<TestState>::try_new().unwrap();
        let mut backend = HeadlessBackend::new().unwrap();
        backend.start().unwrap();

        let handle = event_loop.handle();
        let mut state = TestState {
            new_outputs: Vec::new(),
            frames: Vec::new(),
        };

        // the backend is inserted first, then an output arrives at runtime
        let dispatcher = calloop::Dispatcher::new(backend, |event, _, state: &mut TestState| {
            if let BackendEvent::NewOutput { output } = event {
                state.new_outputs.push(output);
            }
        });
        handle.register_dispatcher(dispatcher.clone()).unwrap();

        dispatcher.as_source_mut().add_output((640, 480));

        let deadline = Instant::now() + Duration::from_millis(500);
        while state.new_outputs.is_empty() && Instant::now() < deadline {
            event_loop
                .dispatch(Some(Duration::from_millis(50)), &mut state)
                .unwrap();
        }
        assert_eq!(state.new_outputs.len(), 1);
        assert_eq!(state.new_outputs[0].current_mode().unwrap().size, (640, 480));
    }
}
