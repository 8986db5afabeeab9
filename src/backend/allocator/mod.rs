//! Buffer allocation and format handling
//!
//! This crate does not render; client buffers and renderer buffers reach the
//! output pipelines through the small capability seam of this module. A
//! scanout-capable buffer is described by the [`Buffer`] trait and usually
//! handed over as a [`Dmabuf`](dmabuf::Dmabuf), the lingua franca between
//! allocators, renderers and KMS. The [`dumb`] allocator covers the cases
//! where the pipeline needs a buffer of its own, with the bpp/depth
//! bookkeeping of the [`format`] tables.

pub mod dmabuf;
#[cfg(feature = "backend_drm")]
pub mod dumb;
pub mod format;

pub use drm_fourcc::{
    DrmFormat as Format, DrmFourcc as Fourcc, DrmModifier as Modifier, DrmVendor as Vendor,
    UnrecognizedFourcc, UnrecognizedVendor,
};

/// Common trait describing common properties of most types of buffers.
pub trait Buffer {
    /// Width of the two-dimensional buffer
    fn width(&self) -> u32 {
        self.size().0
    }
    /// Height of the two-dimensional buffer
    fn height(&self) -> u32 {
        self.size().1
    }
    /// Size (width and height) of the buffer
    fn size(&self) -> (u32, u32);
    /// Pixel format of the buffer
    fn format(&self) -> Format;
}
