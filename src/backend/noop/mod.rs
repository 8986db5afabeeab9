//! Noop backend
//!
//! Outputs that accept commits but never produce frame events. Used as a
//! place to park views when no real backend is available (e.g. while all
//! outputs are unplugged) and in tests that only need output lifecycle.

use std::sync::{Arc, Mutex, Weak};

use calloop::{EventSource, Interest, Mode as CalloopMode, Poll, PostAction, Readiness, Token, TokenFactory};
use rustix::fd::AsFd;
use tracing::{info, info_span};

use super::{Backend, BackendError, BackendEvent, EventQueue};
use crate::output::{Mode, Output, OutputKind, OutputModeState};

/// Backend producing inert outputs.
#[derive(Debug)]
pub struct NoopBackend {
    outputs: Vec<Output>,
    queue: EventQueue,
    started: bool,
    counter: u32,
    wake_token: Option<Token>,
    span: tracing::Span,
}

impl NoopBackend {
    /// Creates a new noop backend without any outputs.
    pub fn new() -> std::io::Result<NoopBackend> {
        let span = info_span!("backend_noop");
        let _guard = span.enter();
        info!("Creating noop backend");
        let queue = EventQueue::new()?;
        drop(_guard);
        Ok(NoopBackend {
            outputs: Vec::new(),
            queue,
            started: false,
            counter: 0,
            wake_token: None,
            span,
        })
    }

    /// Adds a new output.
    ///
    /// Announced right away if the backend is started, otherwise on
    /// [`start`](Backend::start).
    pub fn add_output(&mut self) -> Output {
        self.counter += 1;
        let mode = Mode {
            size: (1280, 720),
            refresh: 0,
            preferred: true,
        };
        let output = Output::new(
            format!("NOOP-{}", self.counter),
            String::from("noop"),
            String::from("noop"),
            None,
            (0, 0),
            OutputModeState {
                modes: vec![mode],
                current: Some(mode),
                enabled: true,
            },
            OutputKind::Noop,
        );
        self.outputs.push(output.clone());
        if self.started {
            self.queue.push(BackendEvent::NewOutput {
                output: output.clone(),
            });
        }
        output
    }
}

impl Backend for NoopBackend {
    fn start(&mut self) -> Result<(), BackendError> {
        if self.started {
            return Err(BackendError::AlreadyStarted);
        }
        let _guard = self.span.enter();
        info!("Starting noop backend");
        self.started = true;
        for output in &self.outputs {
            self.queue.push(BackendEvent::NewOutput {
                output: output.clone(),
            });
        }
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.started
    }
}

impl EventSource for NoopBackend {
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
        if Some(token) == self.wake_token {
            self.queue.waker().clear();
            self.queue.drain(|event| callback(event, &mut ()));
        }
        Ok(PostAction::Continue)
    }

    fn register(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        let wake_token = factory.token();
        unsafe {
            poll.register(
                self.queue.waker().as_fd(),
                Interest::READ,
                CalloopMode::Level,
                wake_token,
            )?;
        }
        self.wake_token = Some(wake_token);
        Ok(())
    }

    fn reregister(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        self.unregister(poll)?;
        self.register(poll, factory)
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
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
    use std::time::{Duration, Instant};

    /// Commits on a noop output succeed but never produce frame events.
    #[test]
    fn commits_succeed_without_frames() {
        let mut event_loop = calloop::EventLoop::<Vec<BackendEvent>>::try_new().unwrap();
        let mut backend = NoopBackend::new().unwrap();
        let output = backend.add_output();
        backend.start().unwrap();

        event_loop
            .handle()
            .insert_source(backend, |event, _, events| events.push(event))
            .unwrap();

        let mut events = Vec::new();
        let deadline = Instant::now() + Duration::from_millis(200);
        while events.is_empty() && Instant::now() < deadline {
            event_loop
                .dispatch(Some(Duration::from_millis(20)), &mut events)
                .unwrap();
        }

        assert!(matches!(events.as_slice(), [BackendEvent::NewOutput { .. }]));
        assert!(output.commit().is_ok());

        events.clear();
        event_loop
            .dispatch(Some(Duration::from_millis(50)), &mut events)
            .unwrap();
        assert!(
            !events.iter().any(|e| matches!(e, BackendEvent::Frame { .. })),
            "noop outputs must not emit frames"
        );
    }
}
