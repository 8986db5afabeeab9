use std::io;
use std::path::PathBuf;

use drm::control::{connector, crtc, Mode};

/// Errors of the DRM backend.
#[derive(Debug, thiserror::Error)]
pub enum DrmError {
    /// Unable to determine the device id of the drm node
    #[error("unable to get the device id of the drm node: {0}")]
    UnableToGetDeviceId(#[source] rustix::io::Errno),
    /// Device is currently paused
    #[error("device is currently paused, operation rejected")]
    DeviceInactive,
    /// A drm ioctl failed
    #[error("drm access error: {errmsg} on device `{dev:?}`: {source}")]
    Access {
        /// Description of the error kind
        errmsg: &'static str,
        /// Device the error originates from
        dev: Option<PathBuf>,
        /// Underlying io error
        #[source]
        source: io::Error,
    },
    /// No CRTC is left for the connector
    #[error("no crtc is available for connector `{0:?}`")]
    NoSuitableCrtc(connector::Handle),
    /// No primary plane is available for the crtc
    #[error("no primary plane is available for crtc `{0:?}`")]
    NoPrimaryPlane(crtc::Handle),
    /// The connector does not advertise the requested mode
    #[error("the requested mode is not suitable: {0:?}")]
    ModeNotSuitable(Mode),
    /// The commit for this state failed the device test
    #[error("the pending configuration was rejected by crtc `{0:?}`")]
    TestFailed(crtc::Handle),
    /// A pageflip is already pending
    #[error("a pageflip is still pending")]
    FramePending,
    /// The kernel reported EAGAIN/EBUSY for a commit that tested fine
    #[error("the device is busy, retry after the next frame")]
    Busy,
    /// No mode is set for the output
    #[error("no mode is currently set for the output")]
    NoMode,
    /// A property required for the atomic path is missing
    #[error("device is missing the `{name}` property on {obj}")]
    UnknownProperty {
        /// Name of the missing property
        name: &'static str,
        /// Object type the property was expected on
        obj: &'static str,
    },
    /// The buffer cannot be scanned out on this device
    #[error("the buffer is not suitable for scanout: {0}")]
    UnsupportedBuffer(&'static str),
}

impl From<DrmError> for crate::output::OutputError {
    fn from(err: DrmError) -> Self {
        use crate::output::OutputError;
        match err {
            DrmError::DeviceInactive => OutputError::Inactive,
            DrmError::FramePending => OutputError::FramePending,
            DrmError::ModeNotSuitable(_) | DrmError::NoMode => OutputError::InvalidMode,
            DrmError::TestFailed(_) => OutputError::InvalidConfig,
            DrmError::Busy => OutputError::Busy,
            err => OutputError::Backend(Box::new(err)),
        }
    }
}
