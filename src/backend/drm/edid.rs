//! Extraction of display identity from the connector EDID blob.

use drm::control::{connector, Device as ControlDevice};
use edid_rs::MonitorDescriptor;
use tracing::debug;

use super::props::{current_value, ConnectorProps};
use crate::utils::fd::DevPath;

/// Make, model and serial of a display as advertised by its EDID.
#[derive(Debug, Clone)]
pub(crate) struct EdidInfo {
    pub manufacturer: String,
    pub model: String,
    pub serial: Option<String>,
}

impl EdidInfo {
    /// Reads and parses the EDID blob of `conn`. Returns `None` if the
    /// connector has no EDID or it fails to parse; callers fall back to
    /// generic identity strings.
    pub(crate) fn for_connector(
        dev: &(impl ControlDevice + DevPath),
        conn: connector::Handle,
        props: &ConnectorProps,
    ) -> Option<EdidInfo> {
        let edid_prop = props.edid?;
        let blob_id = current_value(dev, conn, edid_prop)?;
        if blob_id == 0 {
            return None;
        }
        let data = dev.get_property_blob(blob_id).ok()?;
        let mut reader = std::io::Cursor::new(data);
        let edid = match edid_rs::parse(&mut reader) {
            Ok(edid) => edid,
            Err(err) => {
                debug!("Failed to parse EDID of {:?}: {}", conn, err);
                return None;
            }
        };
        Some(EdidInfo {
            manufacturer: manufacturer(&edid),
            model: model(&edid),
            serial: serial(&edid),
        })
    }
}

fn manufacturer(edid: &edid_rs::EDID) -> String {
    // the three PNP id letters; a full name would need the hwdata tables
    let id = edid.product.manufacturer_id;
    [id.0, id.1, id.2].iter().collect()
}

fn model(edid: &edid_rs::EDID) -> String {
    edid.descriptors
        .0
        .iter()
        .find_map(|desc| match desc {
            MonitorDescriptor::MonitorName(name) => Some(name.clone()),
            _ => None,
        })
        .unwrap_or_else(|| format!("{:#06x}", edid.product.product_code))
}

fn serial(edid: &edid_rs::EDID) -> Option<String> {
    edid.descriptors
        .0
        .iter()
        .find_map(|desc| match desc {
            MonitorDescriptor::SerialNumber(serial) => Some(serial.clone()),
            _ => None,
        })
        .or_else(|| {
            let serial = edid.product.serial_number;
            if serial != 0 {
                Some(serial.to_string())
            } else {
                None
            }
        })
}
