//! RDP remoting backend
//!
//! Exposes the compositor to remote peers: the backend owns a TCP listener
//! and turns every accepted peer into one output plus a pointer and a
//! keyboard device; when the peer disconnects they are destroyed again.
//!
//! The RDP wire protocol itself (TLS negotiation, capability exchange,
//! surface encoding) is delegated to an embedder-provided
//! [`RdpPeerHandler`], the same way the original architecture delegates it
//! to an external RDP library. Without a handler installed, peer data is
//! discarded and the backend still provides the full output/input
//! lifecycle, which is what the rest of the stack cares about.

use std::io::Read;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex, Weak};

use calloop::{EventSource, Interest, Mode as CalloopMode, Poll, PostAction, Readiness, Token, TokenFactory};
use tracing::{debug, info, info_span, trace, warn};

use super::input::{
    ButtonState, DeviceHandle, DeviceType, InputDevice, InputEvent, KeyState, KeyboardKeyEvent,
    PointerButtonEvent, PointerMotionAbsoluteEvent,
};
use super::{Backend, BackendError, BackendEvent, EventQueue};
use crate::output::{Mode, Output, OutputError, OutputInner, OutputKind, OutputModeState};
use crate::utils::clock::monotonic_msec;

/// Errors of the RDP backend.
#[derive(Debug, thiserror::Error)]
pub enum RdpError {
    /// Binding the listening socket failed
    #[error("failed to bind the rdp listener on {0}: {1}")]
    Bind(SocketAddr, #[source] std::io::Error),
    /// An io error occurred
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct RdpConfig {
    /// Address to listen on, default `127.0.0.1`.
    pub address: std::net::IpAddr,
    /// Port to listen on, default 3389.
    pub port: u16,
    /// Path to the TLS certificate handed to the peer handler.
    pub tls_cert_path: Option<std::path::PathBuf>,
    /// Path to the TLS key handed to the peer handler.
    pub tls_key_path: Option<std::path::PathBuf>,
    /// Size of the output created for each peer.
    pub output_size: (i32, i32),
}

impl Default for RdpConfig {
    fn default() -> Self {
        RdpConfig {
            address: std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
            port: 3389,
            tls_cert_path: None,
            tls_key_path: None,
            output_size: (1024, 768),
        }
    }
}

/// Input decoded from the peer by the [`RdpPeerHandler`].
#[derive(Debug, Clone, Copy)]
pub enum RdpInput {
    /// Absolute pointer position, normalized to `[0, 1]`.
    PointerMotion {
        /// Normalized x position
        x: f64,
        /// Normalized y position
        y: f64,
    },
    /// A pointer button changed state.
    PointerButton {
        /// Raw evdev button code
        button: u32,
        /// Whether the button is now pressed
        pressed: bool,
    },
    /// A key changed state.
    Key {
        /// Raw evdev keycode
        keycode: u32,
        /// Whether the key is now pressed
        pressed: bool,
    },
}

/// Decodes the wire protocol of one or more peers.
///
/// Implementations wrap an actual RDP protocol library; the backend only
/// manages the connection and device lifecycle.
pub trait RdpPeerHandler {
    /// A peer socket was accepted.
    fn connected(&mut self, peer: &RdpPeer);
    /// Data arrived from the peer; returns the input it decoded.
    fn data(&mut self, peer: &RdpPeer, data: &[u8]) -> Vec<RdpInput>;
    /// The peer disconnected.
    fn disconnected(&mut self, peer: &RdpPeer);
}

/// Backend side of one peer's output.
#[derive(Debug)]
pub(crate) struct RdpOutputInner {
    queue: EventQueue,
    pub(crate) output: Mutex<Weak<OutputInner>>,
}

impl RdpOutputInner {
    pub(crate) fn commit(&self) -> Result<(), OutputError> {
        // content encoding is the peer handler's business; the frame loop
        // is unthrottled
        if let Some(output) = self.public_handle() {
            self.queue.push(BackendEvent::Frame { output });
        }
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

/// One accepted remote peer: its socket, output and input devices.
pub struct RdpPeer {
    stream: TcpStream,
    address: SocketAddr,
    output: Output,
    pointer: InputDevice,
    keyboard: InputDevice,
    // keeps the backend side of the output alive for the peer's lifetime
    _inner: Arc<RdpOutputInner>,
}

impl std::fmt::Debug for RdpPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RdpPeer")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl RdpPeer {
    /// The peer's socket, for the handler to write protocol data to.
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// The remote address of the peer.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// The output created for this peer.
    pub fn output(&self) -> &Output {
        &self.output
    }
}

/// Backend exposing outputs to remote RDP peers.
pub struct RdpBackend {
    config: RdpConfig,
    listener: Option<TcpListener>,
    peers: Vec<RdpPeer>,
    handler: Option<Box<dyn RdpPeerHandler>>,
    queue: EventQueue,
    started: bool,
    counter: u32,
    listener_token: Option<Token>,
    peer_tokens: Vec<Token>,
    wake_token: Option<Token>,
    span: tracing::Span,
}

impl std::fmt::Debug for RdpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RdpBackend")
            .field("config", &self.config)
            .field("peers", &self.peers.len())
            .finish_non_exhaustive()
    }
}

impl RdpBackend {
    /// Creates a new RDP backend. The listener is bound on
    /// [`start`](Backend::start).
    pub fn new(config: RdpConfig) -> std::io::Result<RdpBackend> {
        let span = info_span!("backend_rdp", address = %config.address, port = config.port);
        let _guard = span.enter();
        info!("Creating rdp backend");
        let queue = EventQueue::new()?;
        drop(_guard);
        Ok(RdpBackend {
            config,
            listener: None,
            peers: Vec::new(),
            handler: None,
            queue,
            started: false,
            counter: 0,
            listener_token: None,
            peer_tokens: Vec::new(),
            wake_token: None,
            span,
        })
    }

    /// Installs the protocol handler for accepted peers.
    pub fn set_peer_handler(&mut self, handler: Box<dyn RdpPeerHandler>) {
        self.handler = Some(handler);
    }

    /// The configuration this backend listens with.
    pub fn config(&self) -> &RdpConfig {
        &self.config
    }

    fn accept_pending(&mut self) {
        loop {
            let accepted = match &self.listener {
                Some(listener) => listener.accept(),
                None => return,
            };
            match accepted {
                Ok((stream, address)) => {
                    if let Err(err) = self.accept_peer(stream, address) {
                        warn!("Error initializing incoming peer: {}", err);
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!("Error accepting rdp peer: {}", err);
                    break;
                }
            }
        }
    }

    fn accept_peer(&mut self, stream: TcpStream, address: SocketAddr) -> std::io::Result<()> {
        let _guard = self.span.enter();
        stream.set_nonblocking(true)?;
        self.counter += 1;
        info!(peer = %address, "Accepted rdp peer");

        let mode = Mode {
            size: self.config.output_size,
            refresh: 60_000,
            preferred: true,
        };
        let inner = Arc::new(RdpOutputInner {
            queue: self.queue.clone(),
            output: Mutex::new(Weak::new()),
        });
        let output = Output::new(
            format!("RDP-{}", self.counter),
            String::from("rdp"),
            String::from("rdp"),
            None,
            (0, 0),
            OutputModeState {
                modes: vec![mode],
                current: Some(mode),
                enabled: true,
            },
            OutputKind::Rdp(Arc::downgrade(&inner)),
        );
        *inner.output.lock().unwrap() = Arc::downgrade(&output.inner);

        let pointer = InputDevice::new(
            format!("rdp-pointer-{}", self.counter),
            DeviceType::Pointer,
            0,
            0,
            DeviceHandle::Virtual,
        );
        let keyboard = InputDevice::new(
            format!("rdp-keyboard-{}", self.counter),
            DeviceType::Keyboard,
            0,
            0,
            DeviceHandle::Virtual,
        );

        let peer = RdpPeer {
            stream,
            address,
            output: output.clone(),
            pointer: pointer.clone(),
            keyboard: keyboard.clone(),
            _inner: inner,
        };
        if let Some(handler) = &mut self.handler {
            handler.connected(&peer);
        }
        self.peers.push(peer);

        self.queue.push(BackendEvent::NewOutput { output });
        self.queue.push(BackendEvent::NewInput { device: pointer });
        self.queue.push(BackendEvent::NewInput { device: keyboard });
        Ok(())
    }

    /// Reads from peer `idx`; returns false if the peer is gone.
    fn peer_data(&mut self, idx: usize) -> bool {
        let mut buf = [0u8; 4096];
        loop {
            let read = {
                let peer = &mut self.peers[idx];
                peer.stream.read(&mut buf)
            };
            match read {
                Ok(0) => return false,
                Ok(len) => {
                    let inputs = match &mut self.handler {
                        Some(handler) => handler.data(&self.peers[idx], &buf[..len]),
                        None => {
                            trace!("Discarding {} bytes of peer data, no handler", len);
                            Vec::new()
                        }
                    };
                    let peer = &self.peers[idx];
                    for input in inputs {
                        self.queue.push(BackendEvent::Input(translate(peer, input)));
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return true,
                Err(err) => {
                    debug!("Peer read error: {}", err);
                    return false;
                }
            }
        }
    }

    fn drop_peer(&mut self, idx: usize) {
        let peer = self.peers.remove(idx);
        let _guard = self.span.enter();
        info!(peer = %peer.address, "Rdp peer disconnected");
        if let Some(handler) = &mut self.handler {
            handler.disconnected(&peer);
        }
        self.queue.push(BackendEvent::OutputDestroyed {
            output: peer.output.clone(),
        });
        self.queue.push(BackendEvent::InputDestroyed {
            device: peer.pointer.clone(),
        });
        self.queue.push(BackendEvent::InputDestroyed {
            device: peer.keyboard.clone(),
        });
    }
}

fn translate(peer: &RdpPeer, input: RdpInput) -> InputEvent {
    let time_msec = monotonic_msec();
    match input {
        RdpInput::PointerMotion { x, y } => {
            InputEvent::PointerMotionAbsolute(PointerMotionAbsoluteEvent {
                device: peer.pointer.clone(),
                time_msec,
                x: x.clamp(0.0, 1.0),
                y: y.clamp(0.0, 1.0),
            })
        }
        RdpInput::PointerButton { button, pressed } => {
            InputEvent::PointerButton(PointerButtonEvent {
                device: peer.pointer.clone(),
                time_msec,
                button,
                state: if pressed {
                    ButtonState::Pressed
                } else {
                    ButtonState::Released
                },
            })
        }
        RdpInput::Key { keycode, pressed } => InputEvent::Keyboard(KeyboardKeyEvent {
            device: peer.keyboard.clone(),
            time_msec,
            key_code: keycode,
            state: if pressed {
                KeyState::Pressed
            } else {
                KeyState::Released
            },
        }),
    }
}

impl Backend for RdpBackend {
    fn start(&mut self) -> Result<(), BackendError> {
        if self.started {
            return Err(BackendError::AlreadyStarted);
        }
        let _guard = self.span.enter();
        info!("Starting rdp backend");
        let addr = SocketAddr::new(self.config.address, self.config.port);
        let listener = TcpListener::bind(addr)
            .map_err(|err| BackendError::Rdp(RdpError::Bind(addr, err)))?;
        listener.set_nonblocking(true).map_err(RdpError::Io)?;
        self.listener = Some(listener);
        self.started = true;
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.started
    }
}

impl EventSource for RdpBackend {
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
        let mut relayout = false;

        if Some(token) == self.listener_token {
            let known = self.peers.len();
            self.accept_pending();
            relayout = self.peers.len() != known;
        } else if Some(token) == self.wake_token {
            self.queue.waker().clear();
        } else if let Some(idx) = self.peer_tokens.iter().position(|t| *t == token) {
            if !self.peer_data(idx) {
                self.drop_peer(idx);
                relayout = true;
            }
        }

        self.queue.drain(|event| callback(event, &mut ()));
        Ok(if relayout {
            // peer set changed, the fd registrations must follow
            PostAction::Reregister
        } else {
            PostAction::Continue
        })
    }

    fn register(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        use std::os::unix::io::AsFd;
        if let Some(listener) = &self.listener {
            let token = factory.token();
            unsafe {
                poll.register(listener.as_fd(), Interest::READ, CalloopMode::Level, token)?;
            }
            self.listener_token = Some(token);
        }
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

        self.peer_tokens.clear();
        for peer in &self.peers {
            let token = factory.token();
            unsafe {
                poll.register(peer.stream.as_fd(), Interest::READ, CalloopMode::Level, token)?;
            }
            self.peer_tokens.push(token);
        }
        Ok(())
    }

    fn reregister(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        self.unregister(poll)?;
        self.register(poll, factory)
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        use std::os::unix::io::AsFd;
        if self.listener_token.take().is_some() {
            if let Some(listener) = &self.listener {
                poll.unregister(listener.as_fd())?;
            }
        }
        if self.wake_token.take().is_some() {
            poll.unregister(self.queue.waker().as_fd())?;
        }
        if !self.peer_tokens.is_empty() {
            self.peer_tokens.clear();
            for peer in &self.peers {
                // peers accepted after the last register are not in the
                // poll set yet, ignore those
                let _ = poll.unregister(peer.stream.as_fd());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use std::time::{Duration, Instant};

    /// An accepted peer produces one output and two input devices, its
    /// disconnection destroys them again.
    #[test]
    fn peer_lifecycle() {
        let mut event_loop = calloop::EventLoop::<Vec<BackendEvent>>::try_new().unwrap();
        let mut backend = RdpBackend::new(RdpConfig {
            port: 0, // any free port
            ..Default::default()
        })
        .unwrap();
        backend.start().unwrap();
        let addr = backend.listener.as_ref().unwrap().local_addr().unwrap();

        event_loop
            .handle()
            .insert_source(backend, |event, _, events| events.push(event))
            .unwrap();

        let mut events = Vec::new();
        let client = TcpStream::connect(addr).unwrap();

        let deadline = Instant::now() + Duration::from_millis(1000);
        while events.len() < 3 && Instant::now() < deadline {
            event_loop
                .dispatch(Some(Duration::from_millis(50)), &mut events)
                .unwrap();
        }
        assert!(events
            .iter()
            .any(|e| matches!(e, BackendEvent::NewOutput { output } if output.make() == "rdp")));
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, BackendEvent::NewInput { .. }))
                .count(),
            2
        );

        events.clear();
        drop(client);
        let deadline = Instant::now() + Duration::from_millis(1000);
        while events.len() < 3 && Instant::now() < deadline {
            event_loop
                .dispatch(Some(Duration::from_millis(50)), &mut events)
                .unwrap();
        }
        assert!(events
            .iter()
            .any(|e| matches!(e, BackendEvent::OutputDestroyed { .. })));
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, BackendEvent::InputDestroyed { .. }))
                .count(),
            2
        );
    }
}
