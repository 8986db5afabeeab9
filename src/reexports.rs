//! Reexports of crates, that are part of the public api, for convenience

pub use calloop;
#[cfg(feature = "backend_session_logind")]
pub use dbus;
#[cfg(feature = "backend_drm")]
pub use drm;
pub use drm_fourcc;
#[cfg(feature = "backend_libinput")]
pub use input;
pub use rustix;
#[cfg(feature = "backend_udev")]
pub use udev;
#[cfg(feature = "backend_wayland")]
pub use wayland_client;
#[cfg(feature = "backend_wayland")]
pub use wayland_protocols;
#[cfg(feature = "backend_x11")]
pub use x11rb;
