//! Legacy (pre-atomic) modesetting calls.
//!
//! Used when the device does not support the atomic api or it was
//! explicitly disabled. Mode changes go through `SetCrtc`, flips through
//! `PageFlip`, the cursor through the dedicated cursor ioctls and DPMS
//! through the connector property.

use drm::control::{
    connector, crtc, dumbbuffer::DumbBuffer, framebuffer, property, Device as ControlDevice,
    Mode as KernelMode,
};

use super::device::DrmDeviceInner;
use super::error::DrmError;
use super::props::ConnectorProps;
use crate::utils::fd::DevPath;

const DPMS_ON: u64 = 0;
const DPMS_OFF: u64 = 3;

pub(crate) fn set_crtc(
    dev: &DrmDeviceInner,
    crtc: crtc::Handle,
    fb: framebuffer::Handle,
    connectors: &[connector::Handle],
    mode: Option<KernelMode>,
) -> Result<(), DrmError> {
    dev.fd
        .set_crtc(crtc, Some(fb), (0, 0), connectors, mode)
        .map_err(|source| DrmError::Access {
            errmsg: "Error setting crtc",
            dev: dev.fd.dev_path(),
            source,
        })
}

pub(crate) fn set_dpms(
    dev: &DrmDeviceInner,
    conn: connector::Handle,
    props: &ConnectorProps,
    on: bool,
) -> Result<(), DrmError> {
    let dpms = props.dpms.ok_or(DrmError::UnknownProperty {
        name: "DPMS",
        obj: "connector",
    })?;
    dev.fd
        .set_property(
            conn,
            dpms,
            property::Value::UnsignedRange(if on { DPMS_ON } else { DPMS_OFF }).into(),
        )
        .map_err(|source| DrmError::Access {
            errmsg: "Error setting dpms",
            dev: dev.fd.dev_path(),
            source,
        })
}

pub(crate) fn set_cursor(
    dev: &DrmDeviceInner,
    crtc: crtc::Handle,
    buffer: &DumbBuffer,
    hotspot: (i32, i32),
) -> Result<(), DrmError> {
    dev.fd
        .set_cursor2(crtc, Some(buffer), hotspot)
        .map_err(|source| DrmError::Access {
            errmsg: "Failed to set hardware cursor",
            dev: dev.fd.dev_path(),
            source,
        })
}

pub(crate) fn clear_cursor(dev: &DrmDeviceInner, crtc: crtc::Handle) -> Result<(), DrmError> {
    dev.fd
        .set_cursor2::<DumbBuffer>(crtc, None, (0, 0))
        .map_err(|source| DrmError::Access {
            errmsg: "Failed to clear hardware cursor",
            dev: dev.fd.dev_path(),
            source,
        })
}

pub(crate) fn move_cursor(
    dev: &DrmDeviceInner,
    crtc: crtc::Handle,
    position: (i32, i32),
) -> Result<(), DrmError> {
    dev.fd
        .move_cursor(crtc, position)
        .map_err(|source| DrmError::Access {
            errmsg: "Failed to move hardware cursor",
            dev: dev.fd.dev_path(),
            source,
        })
}

pub(crate) fn set_gamma(
    dev: &DrmDeviceInner,
    crtc: crtc::Handle,
    red: &[u16],
    green: &[u16],
    blue: &[u16],
) -> Result<(), DrmError> {
    dev.fd
        .set_gamma(crtc, red, green, blue)
        .map_err(|source| DrmError::Access {
            errmsg: "Error setting gamma",
            dev: dev.fd.dev_path(),
            source,
        })
}
