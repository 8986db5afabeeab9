//! Various utility functions and types

pub mod fd;

pub(crate) mod clock;
pub(crate) mod timer;
pub(crate) mod wake;

pub use self::fd::{DevPath, DeviceFd};

/// This resource has been destroyed and can no longer be used.
#[derive(Debug)]
pub struct DeadResource;

impl std::fmt::Display for DeadResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("This resource has been destroyed and can no longer be used.")
    }
}

impl std::error::Error for DeadResource {}
