//! Module for [dmabuf](https://docs.kernel.org/driver-api/dma-buf.html) buffers.
//!
//! A dmabuf is the exported view of a buffer object: a set of file
//! descriptors (one per plane) together with the layout needed to interpret
//! them. It is the type client buffers and renderer targets arrive as at the
//! [`Output::attach_buffer`](crate::output::Output::attach_buffer) boundary,
//! where the DRM pipeline imports it into a KMS framebuffer.

use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};
use std::sync::{Arc, Weak};

use super::{Buffer, Format, Fourcc, Modifier};

/// Maximum amount of planes a dmabuf may have.
pub const MAX_PLANES: usize = 4;

#[derive(Debug)]
pub(crate) struct DmabufInternal {
    planes: Vec<Plane>,
    size: (u32, u32),
    format: Fourcc,
    modifier: Modifier,
}

#[derive(Debug)]
struct Plane {
    fd: OwnedFd,
    offset: u32,
    stride: u32,
}

/// Strong reference to a dmabuf handle.
///
/// Cloning is cheap; the file descriptors are closed once the last clone
/// (and every framebuffer imported from it) is gone.
#[derive(Debug, Clone)]
pub struct Dmabuf(pub(crate) Arc<DmabufInternal>);

/// Weak reference to a dmabuf handle, used for caching without keeping the
/// buffer alive.
#[derive(Debug, Clone)]
pub struct WeakDmabuf(pub(crate) Weak<DmabufInternal>);

impl PartialEq for Dmabuf {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Dmabuf {}

impl Buffer for Dmabuf {
    fn size(&self) -> (u32, u32) {
        self.0.size
    }

    fn format(&self) -> Format {
        Format {
            code: self.0.format,
            modifier: self.0.modifier,
        }
    }
}

/// Builder for a [`Dmabuf`] received from an external source.
#[derive(Debug)]
pub struct DmabufBuilder {
    internal: DmabufInternal,
}

impl DmabufBuilder {
    /// Add a plane to the construted Dmabuf
    ///
    /// *Note*: Each Dmabuf needs at least one plane
    pub fn add_plane(&mut self, fd: OwnedFd, offset: u32, stride: u32) -> bool {
        if self.internal.planes.len() == MAX_PLANES {
            return false;
        }
        self.internal.planes.push(Plane { fd, offset, stride });
        true
    }

    /// Build a `Dmabuf` out of the provided parameters and planes
    ///
    /// Returns `None` if the builder has no planes attached.
    pub fn build(self) -> Option<Dmabuf> {
        if self.internal.planes.is_empty() {
            return None;
        }
        Some(Dmabuf(Arc::new(self.internal)))
    }
}

impl Dmabuf {
    /// Create a new Dmabuf by initializing with values from an external source
    pub fn builder(size: (u32, u32), format: Fourcc, modifier: Modifier) -> DmabufBuilder {
        DmabufBuilder {
            internal: DmabufInternal {
                planes: Vec::with_capacity(MAX_PLANES),
                size,
                format,
                modifier,
            },
        }
    }

    /// The format modifier of this buffer.
    pub fn modifier(&self) -> Modifier {
        self.0.modifier
    }

    /// Amount of planes of this buffer.
    pub fn num_planes(&self) -> usize {
        self.0.planes.len()
    }

    /// Borrowed file descriptors of the planes.
    pub fn handles(&self) -> impl Iterator<Item = BorrowedFd<'_>> {
        self.0.planes.iter().map(|plane| plane.fd.as_fd())
    }

    /// Offsets of the planes.
    pub fn offsets(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.planes.iter().map(|plane| plane.offset)
    }

    /// Strides of the planes.
    pub fn strides(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.planes.iter().map(|plane| plane.stride)
    }

    /// Create a weak reference to this buffer.
    pub fn weak(&self) -> WeakDmabuf {
        WeakDmabuf(Arc::downgrade(&self.0))
    }
}

impl WeakDmabuf {
    /// Try to upgrade to a strong reference.
    pub fn upgrade(&self) -> Option<Dmabuf> {
        self.0.upgrade().map(Dmabuf)
    }
}
