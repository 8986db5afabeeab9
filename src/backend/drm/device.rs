use std::os::unix::io::{AsFd, BorrowedFd};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex,
};

use drm::control::{crtc, plane, Device as ControlDevice, PlaneType};
use drm::{ClientCapability, Device as BasicDevice, DriverCapability};
use tracing::{debug, info, warn};

use super::bo::BoHandleTable;
use super::error::DrmError;
use super::fb::FramebufferCache;
use super::props::{self, PlaneProps};
use crate::utils::fd::{DevPath, DeviceFd};

/// Open DRM device node usable with the drm-rs control api.
#[derive(Debug, Clone)]
pub struct DrmDeviceFd(DeviceFd);

impl DrmDeviceFd {
    pub(crate) fn new(fd: DeviceFd) -> DrmDeviceFd {
        DrmDeviceFd(fd)
    }
}

impl AsFd for DrmDeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl BasicDevice for DrmDeviceFd {}
impl ControlDevice for DrmDeviceFd {}

/// Capabilities discovered once at device creation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DeviceCaps {
    pub atomic: bool,
    pub universal_planes: bool,
    pub addfb2_modifiers: bool,
    pub cursor_size: (u32, u32),
}

/// Shared per-GPU state: the fd, its capabilities and the buffer object
/// handle accounting.
#[derive(Debug)]
pub(crate) struct DrmDeviceInner {
    pub fd: DrmDeviceFd,
    pub dev_id: u64,
    pub caps: DeviceCaps,
    pub active: AtomicBool,
    pub privileged: bool,
    pub bo_table: Mutex<BoHandleTable>,
    pub fb_cache: FramebufferCache,
}

impl DrmDeviceInner {
    pub(crate) fn new(fd: DeviceFd) -> Result<DrmDeviceInner, DrmError> {
        let fd = DrmDeviceFd::new(fd);

        let stat = rustix::fs::fstat(&fd).map_err(DrmError::UnableToGetDeviceId)?;
        let dev_id = stat.st_rdev;

        // We want to modeset, so we better be the master if we run on a
        // bare tty. Newer kernels grant the capability implicitly if no
        // other master exists, so this failing is not fatal.
        let mut privileged = true;
        if fd.acquire_master_lock().is_err() {
            warn!("Unable to become drm master, assuming unprivileged mode");
            privileged = false;
        }

        let universal_planes = fd
            .set_client_capability(ClientCapability::UniversalPlanes, true)
            .is_ok();

        let no_atomic = std::env::var("SCANOUT_NO_ATOMIC")
            .map(|x| x == "1" || x.eq_ignore_ascii_case("true") || x.eq_ignore_ascii_case("yes"))
            .unwrap_or(false);
        if no_atomic {
            info!("SCANOUT_NO_ATOMIC is set, forcing the legacy commit path");
        }
        let atomic = !no_atomic
            && fd
                .set_client_capability(ClientCapability::Atomic, true)
                .is_ok();

        let addfb2_modifiers = fd
            .get_driver_capability(DriverCapability::AddFB2Modifiers)
            .map(|cap| cap != 0)
            .unwrap_or(false);

        let cursor_size = (
            fd.get_driver_capability(DriverCapability::CursorWidth).unwrap_or(64) as u32,
            fd.get_driver_capability(DriverCapability::CursorHeight).unwrap_or(64) as u32,
        );

        let caps = DeviceCaps {
            atomic,
            universal_planes,
            addfb2_modifiers,
            cursor_size,
        };
        info!(
            ?caps,
            device = ?fd.dev_path(),
            "Initialized drm device"
        );

        Ok(DrmDeviceInner {
            fd,
            dev_id,
            caps,
            active: AtomicBool::new(true),
            privileged,
            bo_table: Mutex::new(BoHandleTable::new()),
            fb_cache: FramebufferCache::default(),
        })
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    pub(crate) fn drop_master(&self) {
        if self.privileged {
            if let Err(err) = self.fd.release_master_lock() {
                warn!("Failed to drop drm master: {}", err);
            }
        }
    }

    pub(crate) fn acquire_master(&self) {
        if self.privileged {
            if let Err(err) = self.fd.acquire_master_lock() {
                warn!("Failed to reacquire drm master: {}", err);
            }
        }
    }

    /// Creates a property blob from raw bytes, returning its id.
    pub(crate) fn create_blob(&self, data: &mut [u8]) -> Result<u64, DrmError> {
        let blob =
            drm_ffi::mode::create_property_blob(self.fd.as_fd(), data).map_err(|source| {
                DrmError::Access {
                    errmsg: "Failed to create property blob",
                    dev: self.fd.dev_path(),
                    source,
                }
            })?;
        Ok(blob.blob_id as u64)
    }

    pub(crate) fn destroy_blob(&self, id: u64) {
        if let Err(err) = self.fd.destroy_property_blob(id) {
            debug!("Failed to destroy property blob {}: {}", id, err);
        }
    }
}

impl Drop for DrmDeviceInner {
    fn drop(&mut self) {
        info!(device = ?self.fd.dev_path(), "Dropping drm device");
        self.drop_master();
    }
}

/// A plane together with its scanned properties.
#[derive(Debug, Clone)]
pub(crate) struct PlaneState {
    pub handle: plane::Handle,
    pub props: PlaneProps,
    pub formats: Vec<u32>,
}

/// The planes usable with a given crtc.
#[derive(Debug, Default)]
pub(crate) struct Planes {
    pub primary: Option<PlaneState>,
    pub cursor: Option<PlaneState>,
    pub overlays: Vec<PlaneState>,
}

/// Enumerate the planes of `crtc`, sorted by type.
///
/// Without universal planes the kernel only exposes overlay planes;
/// primary and cursor are implicit in the legacy api and the returned set
/// is empty.
pub(crate) fn planes_for_crtc(
    dev: &DrmDeviceInner,
    resources: &drm::control::ResourceHandles,
    crtc: crtc::Handle,
) -> Result<Planes, DrmError> {
    let mut planes = Planes::default();
    if !dev.caps.universal_planes {
        return Ok(planes);
    }

    let plane_handles = dev.fd.plane_handles().map_err(|source| DrmError::Access {
        errmsg: "Error loading plane handles",
        dev: dev.fd.dev_path(),
        source,
    })?;

    for plane in plane_handles {
        let info = dev.fd.get_plane(plane).map_err(|source| DrmError::Access {
            errmsg: "Failed to get plane info",
            dev: dev.fd.dev_path(),
            source,
        })?;
        if !resources
            .filter_crtcs(info.possible_crtcs())
            .contains(&crtc)
        {
            continue;
        }
        let props = props::plane_props(&dev.fd, plane)?;
        let ty = props
            .plane_type
            .and_then(|prop| props::current_value(&dev.fd, plane, prop));
        let state = PlaneState {
            handle: plane,
            props,
            formats: info.formats().to_vec(),
        };
        match ty {
            Some(ty) if ty == PlaneType::Primary as u64 => {
                planes.primary.get_or_insert(state);
            }
            Some(ty) if ty == PlaneType::Cursor as u64 => {
                planes.cursor.get_or_insert(state);
            }
            _ => planes.overlays.push(state),
        }
    }

    Ok(planes)
}
