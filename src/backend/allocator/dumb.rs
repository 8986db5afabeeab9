//! Module for [DumbBuffer](https://docs.kernel.org/gpu/drm-kms.html#dumb-buffer-objects) buffers
//!
//! Dumb buffers are the kernel's lowest common denominator scanout
//! allocation: always linear, CPU-mappable and zero-filled on creation.
//! The DRM pipeline uses them wherever no client buffer is involved, for
//! the black frame of an initial modeset and for the cursor plane.

use std::fmt;
use std::sync::Arc;

use drm::buffer::Buffer as DrmBuffer;
use drm::control::dumbbuffer::{DumbBuffer as Handle, DumbMapping};
use drm::control::Device as ControlDevice;

use super::format::get_bpp;
use super::{Buffer, Format, Fourcc, Modifier};
use crate::backend::drm::device::DrmDeviceInner;
use crate::backend::drm::DrmError;
use crate::utils::fd::DevPath;

/// Wrapper around raw DumbBuffer handles.
pub struct DumbBuffer {
    dev: Arc<DrmDeviceInner>,
    handle: Handle,
    format: Format,
}

impl fmt::Debug for DumbBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DumbBuffer")
            .field("handle", &self.handle)
            .field("format", &self.format)
            .finish()
    }
}

impl DumbBuffer {
    /// Allocate a new dumb buffer on the device. The bits per pixel are
    /// derived from the fourcc; dumb buffers are always linear.
    pub(crate) fn create(
        dev: &Arc<DrmDeviceInner>,
        width: u32,
        height: u32,
        fourcc: Fourcc,
    ) -> Result<DumbBuffer, DrmError> {
        let bpp = get_bpp(fourcc).ok_or(DrmError::UnsupportedBuffer(
            "format is not usable for dumb buffers",
        ))? as u32;
        let handle = dev
            .fd
            .create_dumb_buffer((width, height), fourcc, bpp)
            .map_err(|source| DrmError::Access {
                errmsg: "Failed to create dumb buffer",
                dev: dev.fd.dev_path(),
                source,
            })?;

        Ok(DumbBuffer {
            dev: dev.clone(),
            handle,
            format: Format {
                code: fourcc,
                modifier: Modifier::Linear,
            },
        })
    }

    /// Raw handle to the underlying buffer.
    ///
    /// Note: This handle will become invalid once the `DumbBuffer` wrapper
    /// is dropped or the device used to create it is closed. Do not copy
    /// this handle and assume it keeps being valid.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Map the buffer into process memory for CPU access.
    pub(crate) fn map(&mut self) -> Result<DumbMapping<'_>, DrmError> {
        let dev = self.dev.fd.dev_path();
        self.dev
            .fd
            .map_dumb_buffer(&mut self.handle)
            .map_err(|source| DrmError::Access {
                errmsg: "Failed to map dumb buffer",
                dev,
                source,
            })
    }
}

impl Buffer for DumbBuffer {
    fn size(&self) -> (u32, u32) {
        self.handle.size()
    }

    fn format(&self) -> Format {
        self.format
    }
}

impl Drop for DumbBuffer {
    fn drop(&mut self) {
        let _ = self.dev.fd.destroy_dumb_buffer(self.handle);
    }
}
