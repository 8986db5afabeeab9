//! Construction of atomic commit requests.
//!
//! A single request describes the full output state: the connector/crtc
//! link, the mode blob, and the source/destination rectangles of the
//! primary plane. Partial requests cover pageflips, cursor updates and
//! DPMS toggles.

use drm::control::atomic::AtomicModeReq;
use drm::control::{connector, crtc, framebuffer, plane, property, Mode as KernelMode};

use super::device::PlaneState;
use super::error::DrmError;
use super::props::{ConnectorProps, CrtcProps, PlaneProps};

/// Extracts the raw blob id out of a freshly created property blob value.
pub(crate) fn blob_id(value: &property::Value<'_>) -> u64 {
    u64::from(*value)
}

fn require(
    prop: Option<property::Handle>,
    name: &'static str,
    obj: &'static str,
) -> Result<property::Handle, DrmError> {
    prop.ok_or(DrmError::UnknownProperty { name, obj })
}

fn plane_source(
    req: &mut AtomicModeReq,
    plane: plane::Handle,
    props: &PlaneProps,
    fb: framebuffer::Handle,
    size: (u16, u16),
) -> Result<(), DrmError> {
    let (w, h) = (size.0 as u64, size.1 as u64);
    req.add_property(
        plane,
        require(props.fb_id, "FB_ID", "plane")?,
        property::Value::Framebuffer(Some(fb)),
    );
    req.add_property(
        plane,
        require(props.src_x, "SRC_X", "plane")?,
        property::Value::UnsignedRange(0),
    );
    req.add_property(
        plane,
        require(props.src_y, "SRC_Y", "plane")?,
        property::Value::UnsignedRange(0),
    );
    // SRC_* rectangles are 16.16 fixed point
    req.add_property(
        plane,
        require(props.src_w, "SRC_W", "plane")?,
        property::Value::UnsignedRange(w << 16),
    );
    req.add_property(
        plane,
        require(props.src_h, "SRC_H", "plane")?,
        property::Value::UnsignedRange(h << 16),
    );
    req.add_property(
        plane,
        require(props.crtc_x, "CRTC_X", "plane")?,
        property::Value::SignedRange(0),
    );
    req.add_property(
        plane,
        require(props.crtc_y, "CRTC_Y", "plane")?,
        property::Value::SignedRange(0),
    );
    req.add_property(
        plane,
        require(props.crtc_w, "CRTC_W", "plane")?,
        property::Value::UnsignedRange(w),
    );
    req.add_property(
        plane,
        require(props.crtc_h, "CRTC_H", "plane")?,
        property::Value::UnsignedRange(h),
    );
    Ok(())
}

/// Full state for an initial commit or a mode change.
#[allow(clippy::too_many_arguments)]
pub(crate) fn modeset_request(
    conn: connector::Handle,
    conn_props: &ConnectorProps,
    crtc: crtc::Handle,
    crtc_props: &CrtcProps,
    primary: &PlaneState,
    mode_blob: u64,
    fb: framebuffer::Handle,
    mode: &KernelMode,
) -> Result<AtomicModeReq, DrmError> {
    let mut req = AtomicModeReq::new();

    req.add_property(
        conn,
        require(conn_props.crtc_id, "CRTC_ID", "connector")?,
        property::Value::CRTC(Some(crtc)),
    );
    req.add_property(
        crtc,
        require(crtc_props.mode_id, "MODE_ID", "crtc")?,
        property::Value::Unknown(mode_blob),
    );
    req.add_property(
        crtc,
        require(crtc_props.active, "ACTIVE", "crtc")?,
        property::Value::Boolean(true),
    );

    req.add_property(
        primary.handle,
        require(primary.props.crtc_id, "CRTC_ID", "plane")?,
        property::Value::CRTC(Some(crtc)),
    );
    plane_source(&mut req, primary.handle, &primary.props, fb, mode.size())?;

    Ok(req)
}

/// Swap the framebuffer of the primary plane, nothing else.
pub(crate) fn pageflip_request(
    crtc: crtc::Handle,
    primary: &PlaneState,
    fb: framebuffer::Handle,
    mode: &KernelMode,
) -> Result<AtomicModeReq, DrmError> {
    let mut req = AtomicModeReq::new();
    req.add_property(
        primary.handle,
        require(primary.props.crtc_id, "CRTC_ID", "plane")?,
        property::Value::CRTC(Some(crtc)),
    );
    plane_source(&mut req, primary.handle, &primary.props, fb, mode.size())?;
    Ok(req)
}

/// Toggle the crtc without touching mode or planes.
pub(crate) fn active_request(
    crtc: crtc::Handle,
    crtc_props: &CrtcProps,
    active: bool,
) -> Result<AtomicModeReq, DrmError> {
    let mut req = AtomicModeReq::new();
    req.add_property(
        crtc,
        require(crtc_props.active, "ACTIVE", "crtc")?,
        property::Value::Boolean(active),
    );
    Ok(req)
}

/// Show, update or hide the cursor plane.
pub(crate) fn cursor_request(
    crtc: crtc::Handle,
    cursor: &PlaneState,
    fb: Option<framebuffer::Handle>,
    position: (i32, i32),
    size: (u32, u32),
) -> Result<AtomicModeReq, DrmError> {
    let mut req = AtomicModeReq::new();
    let props = &cursor.props;
    match fb {
        Some(fb) => {
            req.add_property(
                cursor.handle,
                require(props.crtc_id, "CRTC_ID", "plane")?,
                property::Value::CRTC(Some(crtc)),
            );
            req.add_property(
                cursor.handle,
                require(props.fb_id, "FB_ID", "plane")?,
                property::Value::Framebuffer(Some(fb)),
            );
            let (w, h) = (size.0 as u64, size.1 as u64);
            req.add_property(
                cursor.handle,
                require(props.src_x, "SRC_X", "plane")?,
                property::Value::UnsignedRange(0),
            );
            req.add_property(
                cursor.handle,
                require(props.src_y, "SRC_Y", "plane")?,
                property::Value::UnsignedRange(0),
            );
            req.add_property(
                cursor.handle,
                require(props.src_w, "SRC_W", "plane")?,
                property::Value::UnsignedRange(w << 16),
            );
            req.add_property(
                cursor.handle,
                require(props.src_h, "SRC_H", "plane")?,
                property::Value::UnsignedRange(h << 16),
            );
            req.add_property(
                cursor.handle,
                require(props.crtc_x, "CRTC_X", "plane")?,
                property::Value::SignedRange(position.0 as i64),
            );
            req.add_property(
                cursor.handle,
                require(props.crtc_y, "CRTC_Y", "plane")?,
                property::Value::SignedRange(position.1 as i64),
            );
            req.add_property(
                cursor.handle,
                require(props.crtc_w, "CRTC_W", "plane")?,
                property::Value::UnsignedRange(w),
            );
            req.add_property(
                cursor.handle,
                require(props.crtc_h, "CRTC_H", "plane")?,
                property::Value::UnsignedRange(h),
            );
        }
        None => {
            req.add_property(
                cursor.handle,
                require(props.crtc_id, "CRTC_ID", "plane")?,
                property::Value::CRTC(None),
            );
            req.add_property(
                cursor.handle,
                require(props.fb_id, "FB_ID", "plane")?,
                property::Value::Framebuffer(None),
            );
        }
    }
    Ok(req)
}

/// Move the cursor plane, position only.
pub(crate) fn cursor_move_request(
    cursor: &PlaneState,
    position: (i32, i32),
) -> Result<AtomicModeReq, DrmError> {
    let mut req = AtomicModeReq::new();
    let props = &cursor.props;
    req.add_property(
        cursor.handle,
        require(props.crtc_x, "CRTC_X", "plane")?,
        property::Value::SignedRange(position.0 as i64),
    );
    req.add_property(
        cursor.handle,
        require(props.crtc_y, "CRTC_Y", "plane")?,
        property::Value::SignedRange(position.1 as i64),
    );
    Ok(req)
}

/// Program the gamma lookup table blob.
pub(crate) fn gamma_request(
    crtc: crtc::Handle,
    gamma_lut: property::Handle,
    blob: u64,
) -> Result<AtomicModeReq, DrmError> {
    let mut req = AtomicModeReq::new();
    req.add_property(crtc, gamma_lut, property::Value::Unknown(blob));
    Ok(req)
}
