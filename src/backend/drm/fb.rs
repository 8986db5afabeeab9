//! Import of dmabufs into KMS framebuffers.
//!
//! A framebuffer binds the buffer objects of a dmabuf to a
//! (format, modifier, stride, offset) tuple the display engine can scan
//! out. Imports are cached per buffer and device; the GEM handles obtained
//! through the PRIME import are reference counted through the device's
//! [`BoHandleTable`](super::bo::BoHandleTable) and closed once the last
//! framebuffer using them is destroyed.

use std::collections::HashMap;
use std::os::unix::io::AsFd;
use std::sync::{Arc, Mutex, Weak};

use drm::buffer::{DrmFourcc, DrmModifier, Handle as BufferHandle, PlanarBuffer};
use drm::control::{framebuffer, Device as ControlDevice, FbCmd2Flags};
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use super::device::DrmDeviceInner;
use super::error::DrmError;
use crate::backend::allocator::dmabuf::{Dmabuf, WeakDmabuf};
use crate::backend::allocator::{Buffer, Fourcc, Modifier};
use crate::utils::fd::DevPath;

/// A framebuffer imported from a dmabuf, destroyed with its last clone.
#[derive(Debug, Clone)]
pub(crate) struct DrmFramebuffer(Arc<FramebufferInner>);

#[derive(Debug)]
struct FramebufferInner {
    dev: Arc<DrmDeviceInner>,
    fb: framebuffer::Handle,
    // unique GEM handles backing the planes, each holding one table ref
    handles: SmallVec<[u32; 4]>,
}

impl DrmFramebuffer {
    pub(crate) fn handle(&self) -> framebuffer::Handle {
        self.0.fb
    }
}

impl Drop for FramebufferInner {
    fn drop(&mut self) {
        if let Err(err) = self.dev.fd.destroy_framebuffer(self.fb) {
            debug!("Failed to destroy framebuffer: {}", err);
        }
        let mut table = self.dev.bo_table.lock().unwrap();
        for &handle in &self.handles {
            if table.unref_handle(handle) == 0 {
                // last user gone, hand the handle back to the kernel
                if let Err(err) = drm_ffi::gem::close(self.dev.fd.as_fd(), handle) {
                    warn!("Failed to close gem handle {}: {}", handle, err);
                }
            }
        }
    }
}

/// Cache of framebuffers already imported on a device, keyed by the buffer
/// identity.
#[derive(Debug, Default)]
pub(crate) struct FramebufferCache {
    entries: Mutex<HashMap<usize, (WeakDmabuf, Weak<FramebufferInner>)>>,
}

impl FramebufferCache {
    /// Get the cached import of `buffer` or import it now.
    pub(crate) fn get_or_import(
        &self,
        dev: &Arc<DrmDeviceInner>,
        buffer: &Dmabuf,
    ) -> Result<DrmFramebuffer, DrmError> {
        let key = Arc::as_ptr(&buffer.0) as usize;
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, (weak_buf, weak_fb)| {
            weak_buf.upgrade().is_some() && weak_fb.upgrade().is_some()
        });
        if let Some((_, weak_fb)) = entries.get(&key) {
            if let Some(inner) = weak_fb.upgrade() {
                trace!("Framebuffer cache hit for buffer {:x}", key);
                return Ok(DrmFramebuffer(inner));
            }
        }
        let fb = import_dmabuf(dev, buffer)?;
        entries.insert(key, (buffer.weak(), Arc::downgrade(&fb.0)));
        Ok(fb)
    }
}

struct PlanarDmabuf {
    size: (u32, u32),
    format: Fourcc,
    modifier: Option<DrmModifier>,
    pitches: [u32; 4],
    handles: [Option<BufferHandle>; 4],
    offsets: [u32; 4],
}

impl PlanarBuffer for PlanarDmabuf {
    fn size(&self) -> (u32, u32) {
        self.size
    }
    fn format(&self) -> DrmFourcc {
        self.format
    }
    fn modifier(&self) -> Option<DrmModifier> {
        self.modifier
    }
    fn pitches(&self) -> [u32; 4] {
        self.pitches
    }
    fn handles(&self) -> [Option<BufferHandle>; 4] {
        self.handles
    }
    fn offsets(&self) -> [u32; 4] {
        self.offsets
    }
}

/// Import `buffer` on `dev`, taking BO table references for its handles.
fn import_dmabuf(dev: &Arc<DrmDeviceInner>, buffer: &Dmabuf) -> Result<DrmFramebuffer, DrmError> {
    let mut handles: SmallVec<[Option<BufferHandle>; 4]> = SmallVec::new();
    for fd in buffer.handles() {
        let handle = dev
            .fd
            .prime_fd_to_buffer(fd)
            .map_err(|source| DrmError::Access {
                errmsg: "Failed to import dmabuf",
                dev: dev.fd.dev_path(),
                source,
            })?;
        handles.push(Some(handle));
    }

    let mut pitches = [0u32; 4];
    let mut offsets = [0u32; 4];
    let mut handle_arr = [None; 4];
    for (i, stride) in buffer.strides().enumerate() {
        pitches[i] = stride;
    }
    for (i, offset) in buffer.offsets().enumerate() {
        offsets[i] = offset;
    }
    for (i, handle) in handles.iter().enumerate() {
        handle_arr[i] = *handle;
    }

    // the same BO may back several planes, count each handle once
    let mut unique: SmallVec<[u32; 4]> = SmallVec::new();
    for handle in handles.iter().flatten() {
        let raw: u32 = (*handle).into();
        if !unique.contains(&raw) {
            unique.push(raw);
        }
    }
    {
        let mut table = dev.bo_table.lock().unwrap();
        for &handle in &unique {
            table.ref_handle(handle);
        }
    }

    let planar = PlanarDmabuf {
        size: buffer.size(),
        format: buffer.format().code,
        modifier: match buffer.modifier() {
            Modifier::Invalid => None,
            modifier => Some(modifier),
        },
        pitches,
        handles: handle_arr,
        offsets,
    };

    let flags = if planar.modifier.is_some() && dev.caps.addfb2_modifiers {
        FbCmd2Flags::MODIFIERS
    } else {
        FbCmd2Flags::empty()
    };

    let result = dev
        .fd
        .add_planar_framebuffer(&planar, flags)
        .map_err(|source| DrmError::Access {
            errmsg: "Failed to create framebuffer",
            dev: dev.fd.dev_path(),
            source,
        });

    let fb = match result {
        Ok(fb) => fb,
        Err(err) => {
            // roll the table refs back, nothing owns them now
            let mut table = dev.bo_table.lock().unwrap();
            for &handle in &unique {
                if table.unref_handle(handle) == 0 {
                    let _ = drm_ffi::gem::close(dev.fd.as_fd(), handle);
                }
            }
            return Err(err);
        }
    };

    Ok(DrmFramebuffer(Arc::new(FramebufferInner {
        dev: dev.clone(),
        fb,
        handles: unique,
    })))
}
