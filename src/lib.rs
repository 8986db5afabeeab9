#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![recursion_limit = "256"]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
// Allow acronyms like DRM
#![allow(clippy::upper_case_acronyms)]

//! # Scanout: system backends for wayland compositors
//!
//! This crate provides the machinery that sits between the kernel's
//! display/input stack and a compositor's scene logic: session and device
//! arbitration, DRM/KMS output driving, input normalization and a set of
//! auxiliary backends for development, testing and remoting.
//!
//! ## Structure of the crate
//!
//! Everything lives under [`backend`]: the [`session`](backend::session)
//! arbiter opens restricted device nodes and tracks VT activation, the
//! [`udev`](backend::udev) monitor discovers GPUs and watches for hotplug,
//! the [`drm`](backend::drm) pipeline owns CRTC/plane allocation and pageflip
//! scheduling, and [`libinput`](backend::libinput) translates evdev input
//! into the uniform event structs of [`backend::input`]. The
//! [`wayland`](backend::wayland), [`x11`](backend::x11),
//! [`headless`](backend::headless), [`rdp`](backend::rdp) and
//! [`noop`](backend::noop) backends implement the same contract for nested
//! and synthetic environments, [`multi`](backend::multi) composes several of
//! them behind one event stream, and [`auto`](backend::auto) picks a backend
//! tree from the environment.
//!
//! The [`output`] module holds the backend-independent
//! [`Output`](output::Output) handle the compositor renders to.
//!
//! ## The event loop
//!
//! Scanout is built around [`calloop`]: every file-descriptor owning machine
//! is an [`EventSource`](calloop::EventSource) that you insert into your
//! event loop, and all cross-boundary communication happens through the
//! [`BackendEvent`](backend::BackendEvent) values those sources produce.
//! Callback invocation is always sequential; no internal threads are
//! spawned. Rendering and the wayland protocol layer are deliberately out of
//! scope and consumed through the [`allocator`](backend::allocator) seam.

pub mod backend;
pub mod output;
pub mod utils;

pub mod reexports;
