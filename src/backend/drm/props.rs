//! Resolution of named KMS properties to their per-device ids.
//!
//! Property ids are dynamic per device and object, so every connector, crtc
//! and plane gets its property table scanned once when it is taken into
//! use. The known names are kept in alphabetically sorted descriptor lists
//! and every reported property name is binary searched against them;
//! properties a device does not expose stay `None` and the caller decides
//! whether that is fatal (the atomic path needs `CRTC_ID`/`FB_ID`/`MODE_ID`/
//! `ACTIVE`, most others are optional).

use drm::control::{connector, crtc, plane, property, Device as ControlDevice, ResourceHandle};

use super::error::DrmError;
use crate::utils::fd::DevPath;

/// Property ids of a connector.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ConnectorProps {
    pub crtc_id: Option<property::Handle>,
    pub dpms: Option<property::Handle>,
    pub edid: Option<property::Handle>,
    pub link_status: Option<property::Handle>,
    pub non_desktop: Option<property::Handle>,
    pub path: Option<property::Handle>,
}

/// Property ids of a crtc.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct CrtcProps {
    pub active: Option<property::Handle>,
    pub gamma_lut: Option<property::Handle>,
    pub gamma_lut_size: Option<property::Handle>,
    pub mode_id: Option<property::Handle>,
    pub vrr_enabled: Option<property::Handle>,
    pub rotation: Option<property::Handle>,
}

/// Property ids of a plane.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct PlaneProps {
    pub crtc_h: Option<property::Handle>,
    pub crtc_id: Option<property::Handle>,
    pub crtc_w: Option<property::Handle>,
    pub crtc_x: Option<property::Handle>,
    pub crtc_y: Option<property::Handle>,
    pub fb_id: Option<property::Handle>,
    pub in_formats: Option<property::Handle>,
    pub src_h: Option<property::Handle>,
    pub src_w: Option<property::Handle>,
    pub src_x: Option<property::Handle>,
    pub src_y: Option<property::Handle>,
    pub rotation: Option<property::Handle>,
    pub plane_type: Option<property::Handle>,
}

// The descriptor lists map property names to slot indices. They must stay
// alphabetically sorted (ASCII order, uppercase first), binary search
// depends on it.

const CONNECTOR_INFO: &[(&str, usize)] = &[
    ("CRTC_ID", 0),
    ("DPMS", 1),
    ("EDID", 2),
    ("PATH", 5),
    ("link-status", 3),
    ("non-desktop", 4),
];

const CRTC_INFO: &[(&str, usize)] = &[
    ("ACTIVE", 0),
    ("GAMMA_LUT", 1),
    ("GAMMA_LUT_SIZE", 2),
    ("MODE_ID", 3),
    ("VRR_ENABLED", 4),
    ("rotation", 5),
];

const PLANE_INFO: &[(&str, usize)] = &[
    ("CRTC_H", 0),
    ("CRTC_ID", 1),
    ("CRTC_W", 2),
    ("CRTC_X", 3),
    ("CRTC_Y", 4),
    ("FB_ID", 5),
    ("IN_FORMATS", 6),
    ("SRC_H", 7),
    ("SRC_W", 8),
    ("SRC_X", 9),
    ("SRC_Y", 10),
    ("rotation", 11),
    ("type", 12),
];

/// Writes each reported `(name, id)` pair into the slot its descriptor
/// names. Unknown names are skipped, absent ones leave their slot `None`.
fn fill_slots<T: Copy>(
    info: &[(&str, usize)],
    props: impl IntoIterator<Item = (String, T)>,
    slots: &mut [Option<T>],
) {
    for (name, id) in props {
        if let Ok(entry) = info.binary_search_by(|(probe, _)| (*probe).cmp(name.as_str())) {
            slots[info[entry].1] = Some(id);
        }
    }
}

fn scan<T: ResourceHandle>(
    dev: &(impl ControlDevice + DevPath),
    handle: T,
    info: &[(&str, usize)],
    slots: &mut [Option<property::Handle>],
) -> Result<(), DrmError> {
    let props = dev.get_properties(handle).map_err(|source| DrmError::Access {
        errmsg: "Failed to get properties",
        dev: dev.dev_path(),
        source,
    })?;
    let (handles, _) = props.as_props_and_values();
    let named = handles.iter().filter_map(|prop| {
        let info = dev.get_property(*prop).ok()?;
        Some((info.name().to_string_lossy().into_owned(), *prop))
    });
    fill_slots(info, named, slots);
    Ok(())
}

pub(crate) fn connector_props(
    dev: &(impl ControlDevice + DevPath),
    conn: connector::Handle,
) -> Result<ConnectorProps, DrmError> {
    let mut slots = [None; 6];
    scan(dev, conn, CONNECTOR_INFO, &mut slots)?;
    Ok(ConnectorProps {
        crtc_id: slots[0],
        dpms: slots[1],
        edid: slots[2],
        link_status: slots[3],
        non_desktop: slots[4],
        path: slots[5],
    })
}

pub(crate) fn crtc_props(
    dev: &(impl ControlDevice + DevPath),
    crtc: crtc::Handle,
) -> Result<CrtcProps, DrmError> {
    let mut slots = [None; 6];
    scan(dev, crtc, CRTC_INFO, &mut slots)?;
    Ok(CrtcProps {
        active: slots[0],
        gamma_lut: slots[1],
        gamma_lut_size: slots[2],
        mode_id: slots[3],
        vrr_enabled: slots[4],
        rotation: slots[5],
    })
}

pub(crate) fn plane_props(
    dev: &(impl ControlDevice + DevPath),
    plane: plane::Handle,
) -> Result<PlaneProps, DrmError> {
    let mut slots = [None; 13];
    scan(dev, plane, PLANE_INFO, &mut slots)?;
    Ok(PlaneProps {
        crtc_h: slots[0],
        crtc_id: slots[1],
        crtc_w: slots[2],
        crtc_x: slots[3],
        crtc_y: slots[4],
        fb_id: slots[5],
        in_formats: slots[6],
        src_h: slots[7],
        src_w: slots[8],
        src_x: slots[9],
        src_y: slots[10],
        rotation: slots[11],
        plane_type: slots[12],
    })
}

/// Reads the current raw value of `prop` on `handle`, if the object has it.
pub(crate) fn current_value<T: ResourceHandle>(
    dev: &impl ControlDevice,
    handle: T,
    prop: property::Handle,
) -> Option<u64> {
    let props = dev.get_properties(handle).ok()?;
    let (handles, values) = props.as_props_and_values();
    handles
        .iter()
        .zip(values.iter())
        .find(|(h, _)| **h == prop)
        .map(|(_, v)| *v)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor_is_sorted(info: &[(&str, usize)]) -> bool {
        info.windows(2).all(|w| w[0].0 < w[1].0)
    }

    #[test]
    fn descriptors_are_sorted() {
        assert!(descriptor_is_sorted(CONNECTOR_INFO));
        assert!(descriptor_is_sorted(CRTC_INFO));
        assert!(descriptor_is_sorted(PLANE_INFO));
    }

    #[test]
    fn fills_exactly_the_reported_slots() {
        // kernel reports a subset, in arbitrary order, with noise
        let reported = vec![
            ("SRC_W".to_string(), 7u32),
            ("vendor-specific".to_string(), 99),
            ("CRTC_ID".to_string(), 3),
            ("type".to_string(), 1),
        ];
        let mut slots = [None; 13];
        fill_slots(PLANE_INFO, reported, &mut slots);

        assert_eq!(slots[1], Some(3)); // CRTC_ID
        assert_eq!(slots[8], Some(7)); // SRC_W
        assert_eq!(slots[12], Some(1)); // type
        for (idx, slot) in slots.iter().enumerate() {
            if ![1usize, 8, 12].contains(&idx) {
                assert_eq!(*slot, None, "slot {} must stay empty", idx);
            }
        }
    }

    #[test]
    fn order_of_reported_properties_is_irrelevant() {
        let names: Vec<&str> = CRTC_INFO.iter().map(|(name, _)| *name).collect();

        // try a handful of rotations of the reporting order
        for rotation in 0..names.len() {
            let mut rotated = names.clone();
            rotated.rotate_left(rotation);

            let reported: Vec<(String, u32)> = rotated
                .iter()
                .enumerate()
                .map(|(value, name)| (name.to_string(), value as u32 + 1))
                .collect();

            let mut slots = [None; 6];
            fill_slots(CRTC_INFO, reported.clone(), &mut slots);

            for (name, id) in reported {
                let entry = CRTC_INFO.iter().find(|(n, _)| *n == name).unwrap();
                assert_eq!(slots[entry.1], Some(id), "{} landed in the wrong slot", name);
            }
        }
    }

    #[test]
    fn every_subset_fills_its_own_slots() {
        // all 2^6 subsets of the crtc properties
        let names: Vec<&str> = CRTC_INFO.iter().map(|(name, _)| *name).collect();
        for mask in 0u32..(1 << names.len()) {
            let reported: Vec<(String, u32)> = names
                .iter()
                .enumerate()
                .filter(|(idx, _)| mask & (1 << idx) != 0)
                .map(|(idx, name)| (name.to_string(), idx as u32 + 100))
                .collect();

            let mut slots = [None; 6];
            fill_slots(CRTC_INFO, reported, &mut slots);

            for (idx, name) in names.iter().enumerate() {
                let entry = CRTC_INFO.iter().find(|(n, _)| n == name).unwrap();
                if mask & (1 << idx) != 0 {
                    assert_eq!(slots[entry.1], Some(idx as u32 + 100));
                } else {
                    assert_eq!(slots[entry.1], None);
                }
            }
        }
    }
}
