//!
//! Provides `udev` related functionality for automated device scanning.
//!
//! This module mainly provides the [`UdevBackend`], which enumerates the DRM
//! devices of a seat and monitors the kernel for hotplug events, emitting
//! [`UdevEvent`]s through the event loop. Additionally it contains the
//! utility functions used to pick a GPU at startup.

use std::collections::HashMap;
use std::ffi::OsString;
use std::io;
use std::os::unix::io::{AsRawFd, BorrowedFd};
use std::path::{Path, PathBuf};

use calloop::{EventSource, Interest, Mode, Poll, PostAction, Readiness, Token, TokenFactory};
use tracing::{debug, info, info_span, warn};
use udev::{Enumerator, EventType, MonitorBuilder, MonitorSocket};

/// Events produced by the [`UdevBackend`], keyed by the `dev_t` of the
/// affected device.
#[derive(Debug)]
pub enum UdevEvent {
    /// A new DRM device appeared on the seat.
    Added {
        /// `dev_t` of the new device
        device_id: u64,
        /// Path of the device node
        path: PathBuf,
    },
    /// A tracked device changed, usually meaning connectors were plugged or
    /// unplugged. Observers should rescan the device.
    Changed {
        /// `dev_t` of the changed device
        device_id: u64,
    },
    /// A tracked device was removed.
    Removed {
        /// `dev_t` of the removed device
        device_id: u64,
    },
}

/// Monitor for DRM devices of one seat.
///
/// Enumerates the GPUs present at creation time and emits [`UdevEvent`]s for
/// every device added, changed or removed while running. The initial device
/// set is available through [`UdevBackend::device_list`]; it is not replayed
/// as events.
pub struct UdevBackend {
    devices: HashMap<u64, PathBuf>,
    monitor: MonitorSocket,
    token: Option<Token>,
    span: tracing::Span,
}

impl std::fmt::Debug for UdevBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdevBackend")
            .field("devices", &self.devices)
            .finish_non_exhaustive()
    }
}

impl UdevBackend {
    /// Creates a new [`UdevBackend`] for the given seat.
    pub fn new<S: AsRef<str>>(seat: S) -> io::Result<UdevBackend> {
        let span = info_span!("backend_udev", seat = seat.as_ref());
        let _guard = span.enter();

        let devices = all_gpus(seat)?
            .into_iter()
            .flat_map(|path| match rustix::fs::stat(&path) {
                Ok(stat) => Some((stat.st_rdev, path)),
                Err(err) => {
                    warn!("Unable to get id of {:?}, skipping: {}", path, err);
                    None
                }
            })
            .collect::<HashMap<_, _>>();
        info!("Enumerated {} drm devices", devices.len());

        let monitor = MonitorBuilder::new()?.match_subsystem("drm")?.listen()?;

        drop(_guard);
        Ok(UdevBackend {
            devices,
            monitor,
            token: None,
            span,
        })
    }

    /// The devices tracked at creation time.
    pub fn device_list(&self) -> impl Iterator<Item = (u64, &Path)> {
        self.devices.iter().map(|(id, path)| (*id, path.as_path()))
    }
}

impl AsRawFd for UdevBackend {
    fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        self.monitor.as_raw_fd()
    }
}

impl EventSource for UdevBackend {
    type Event = UdevEvent;
    type Metadata = ();
    type Ret = ();
    type Error = io::Error;

    #[profiling::function]
    fn process_events<F>(
        &mut self,
        _: Readiness,
        token: Token,
        mut callback: F,
    ) -> io::Result<PostAction>
    where
        F: FnMut(UdevEvent, &mut ()),
    {
        if Some(token) != self.token {
            return Ok(PostAction::Continue);
        }
        let _guard = self.span.enter();
        for event in self.monitor.iter() {
            match event.event_type() {
                EventType::Add => {
                    if let (Some(path), Some(devnum)) = (event.devnode(), event.devnum()) {
                        // only primary nodes are worth announcing
                        if !path
                            .file_name()
                            .and_then(|name| name.to_str())
                            .map(|name| name.starts_with("card"))
                            .unwrap_or(false)
                        {
                            continue;
                        }
                        info!("Device added: {:?}", path);
                        if self.devices.insert(devnum, path.to_path_buf()).is_none() {
                            callback(
                                UdevEvent::Added {
                                    device_id: devnum,
                                    path: path.to_path_buf(),
                                },
                                &mut (),
                            );
                        }
                    }
                }
                EventType::Remove => {
                    if let Some(devnum) = event.devnum() {
                        if self.devices.remove(&devnum).is_some() {
                            info!("Device removed: {}", devnum);
                            callback(UdevEvent::Removed { device_id: devnum }, &mut ());
                        }
                    }
                }
                EventType::Change => {
                    if let Some(devnum) = event.devnum() {
                        if self.devices.contains_key(&devnum) {
                            debug!("Device changed: {}", devnum);
                            callback(UdevEvent::Changed { device_id: devnum }, &mut ());
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(PostAction::Continue)
    }

    fn register(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        let token = factory.token();
        unsafe {
            poll.register(
                BorrowedFd::borrow_raw(self.monitor.as_raw_fd()),
                Interest::READ,
                Mode::Level,
                token,
            )?;
        }
        self.token = Some(token);
        Ok(())
    }

    fn reregister(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        let token = factory.token();
        poll.reregister(
            unsafe { BorrowedFd::borrow_raw(self.monitor.as_raw_fd()) },
            Interest::READ,
            Mode::Level,
            token,
        )?;
        self.token = Some(token);
        Ok(())
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        self.token = None;
        poll.unregister(unsafe { BorrowedFd::borrow_raw(self.monitor.as_raw_fd()) })
    }
}

/// Returns the path of the primary GPU of the given seat, if any.
///
/// The device marked `boot_vga` wins; without one, the first device of the
/// seat is returned.
pub fn primary_gpu<S: AsRef<str>>(seat: S) -> io::Result<Option<PathBuf>> {
    let mut enumerator = Enumerator::new()?;
    enumerator.match_subsystem("drm")?;
    enumerator.match_sysname("card[0-9]*")?;

    let mut result = None;
    for device in enumerator.scan_devices()? {
        if device
            .property_value("ID_SEAT")
            .map(|x| x.to_os_string())
            .unwrap_or_else(|| OsString::from("seat0"))
            == *seat.as_ref()
        {
            if let Some(pci) = device.parent_with_subsystem(Path::new("pci"))? {
                if let Some(id) = pci.attribute_value("boot_vga") {
                    if id == "1" {
                        result = Some(device);
                        continue;
                    }
                }
            }
            if result.is_none() {
                result = Some(device);
            }
        }
    }
    Ok(result.and_then(|device| device.devnode().map(PathBuf::from)))
}

/// Returns the paths of all GPUs of the given seat.
pub fn all_gpus<S: AsRef<str>>(seat: S) -> io::Result<Vec<PathBuf>> {
    let mut enumerator = Enumerator::new()?;
    enumerator.match_subsystem("drm")?;
    enumerator.match_sysname("card[0-9]*")?;
    Ok(enumerator
        .scan_devices()?
        .filter(|device| {
            device
                .property_value("ID_SEAT")
                .map(|x| x.to_os_string())
                .unwrap_or_else(|| OsString::from("seat0"))
                == *seat.as_ref()
        })
        .flat_map(|device| device.devnode().map(PathBuf::from))
        .collect())
}
