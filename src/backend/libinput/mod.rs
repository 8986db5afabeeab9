// The pre-1.19 axis accessors are deprecated in favor of the Scroll*
// events, but they remain the portable surface.
#![allow(deprecated)]

//! Libinput input backend
//!
//! [`LibinputBackend`] wraps a libinput context bound to the session's udev
//! seat and translates its events into the uniform input taxonomy of
//! [`backend::input`](crate::backend::input).
//!
//! Devices advertising several capabilities (a keyboard with an integrated
//! trackpoint, say) are split: each capability is exposed as its own
//! [`InputDevice`], which maps better onto how wayland seats work. All
//! split devices share the same underlying [`input::Device`] handle.
//!
//! On session pause the libinput context is suspended (all evdev fds are
//! revoked), on resume it re-opens the devices through the session.

use std::collections::HashMap;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::Path;

use calloop::{EventSource, Interest, Mode, Poll, PostAction, Readiness, Token, TokenFactory};
use input::event::{self, EventTrait};
use input::{Libinput, LibinputInterface};
use rustix::fs::OFlags;
use smallvec::SmallVec;
use tracing::{debug, info, info_span, trace};

use super::input::{
    msec_from_usec, Axis, AxisSource, ButtonState, DeviceHandle, DeviceType, InputDevice,
    InputEvent, KeyState, KeyboardKeyEvent, PadSource, PointerAxisEvent, PointerButtonEvent,
    PointerMotionAbsoluteEvent, PointerMotionEvent, ProximityState, SwitchState, SwitchToggleEvent,
    SwitchType, TabletPadButtonEvent, TabletPadRingEvent, TabletPadStripEvent, TabletToolAxisEvent,
    TabletToolButtonEvent, TabletToolProximityEvent, TabletToolTipEvent, TabletToolType, TipState,
    TouchCancelEvent, TouchDownEvent, TouchFrameEvent, TouchMotionEvent, TouchSlot, TouchUpEvent,
};
use super::session::{AsErrno, Session};
use super::{Backend, BackendError, BackendEvent, EventQueue};

/// Errors of the libinput backend.
#[derive(Debug, thiserror::Error)]
pub enum LibinputError {
    /// Assigning the udev seat to the context failed
    #[error("failed to assign seat `{0}` to the libinput context")]
    FailedToAssignSeat(String),
    /// Creating the internal event queue failed
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Wrapper for types implementing the [`Session`] trait to provide a
/// [`LibinputInterface`] implementation.
#[derive(Debug)]
pub struct LibinputSessionInterface<S: Session>(S);

impl<S: Session> From<S> for LibinputSessionInterface<S> {
    fn from(session: S) -> LibinputSessionInterface<S> {
        LibinputSessionInterface(session)
    }
}

impl<S: Session> LibinputInterface for LibinputSessionInterface<S> {
    fn open_restricted(&mut self, path: &Path, flags: i32) -> Result<OwnedFd, i32> {
        self.0
            .open(path, OFlags::from_bits_truncate(flags as u32))
            .map_err(|err| err.as_errno().unwrap_or(1 /* EPERM by default */))
    }

    fn close_restricted(&mut self, fd: OwnedFd) {
        let _ = self.0.close(fd);
    }
}

/// Libinput based input backend.
///
/// Tracks the input devices of one udev seat through a libinput context.
pub struct LibinputBackend {
    context: Libinput,
    /// Split devices by libinput sysname.
    devices: HashMap<String, SmallVec<[InputDevice; 3]>>,
    queue: EventQueue,
    started: bool,
    token: Option<Token>,
    wake_token: Option<Token>,
    span: tracing::Span,
}

impl std::fmt::Debug for LibinputBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibinputBackend")
            .field("devices", &self.devices.len())
            .finish_non_exhaustive()
    }
}

impl LibinputBackend {
    /// Creates a new libinput context on the session's seat.
    pub fn new<S>(session: S, seat: &str) -> Result<LibinputBackend, LibinputError>
    where
        S: Session + 'static,
    {
        let span = info_span!("backend_libinput", seat = seat);
        let _guard = span.enter();
        info!("Initializing a libinput backend");

        let mut context = Libinput::new_with_udev(LibinputSessionInterface::from(session));
        context
            .udev_assign_seat(seat)
            .map_err(|_| LibinputError::FailedToAssignSeat(seat.to_owned()))?;

        let queue = EventQueue::new()?;

        drop(_guard);
        Ok(LibinputBackend {
            context,
            devices: HashMap::new(),
            queue,
            started: false,
            token: None,
            wake_token: None,
            span,
        })
    }

    /// Returns a reference to the underlying libinput context.
    pub fn context(&self) -> &Libinput {
        &self.context
    }

    fn device_for(&self, device: &input::Device, ty: DeviceType) -> Option<InputDevice> {
        self.devices
            .get(device.sysname())?
            .iter()
            .find(|dev| dev.device_type() == ty)
            .cloned()
    }

    fn device_added(&mut self, device: input::Device, mut emit: impl FnMut(BackendEvent)) {
        let name = device.name().to_owned();
        let sysname = device.sysname().to_owned();
        let types = split_device_types(|cap| device.has_capability(cap));
        debug!(
            "Added {} [{}:{}] with {} capabilities",
            name,
            device.id_vendor(),
            device.id_product(),
            types.len()
        );
        if types.is_empty() {
            return;
        }

        let mut split: SmallVec<[InputDevice; 3]> = SmallVec::new();
        for ty in types {
            let handle = InputDevice::new(
                name.clone(),
                ty,
                device.id_vendor(),
                device.id_product(),
                DeviceHandle::Libinput(device.clone()),
            );
            split.push(handle.clone());
            emit(BackendEvent::NewInput { device: handle });
        }
        self.devices.insert(sysname, split);
    }

    fn device_removed(&mut self, device: input::Device, mut emit: impl FnMut(BackendEvent)) {
        debug!("Removed {}", device.name());
        if let Some(split) = self.devices.remove(device.sysname()) {
            for handle in split {
                emit(BackendEvent::InputDestroyed { device: handle });
            }
        }
    }

    fn dispatch(&mut self, mut emit: impl FnMut(BackendEvent)) -> std::io::Result<()> {
        self.context.dispatch()?;
        while let Some(event) = self.context.next() {
            self.translate(event, &mut emit);
        }
        Ok(())
    }

    fn translate(&mut self, event: input::Event, emit: &mut impl FnMut(BackendEvent)) {
        use input::Event;
        match event {
            Event::Device(event::DeviceEvent::Added(added)) => {
                self.device_added(added.device(), emit);
            }
            Event::Device(event::DeviceEvent::Removed(removed)) => {
                self.device_removed(removed.device(), emit);
            }
            Event::Keyboard(event::KeyboardEvent::Key(key)) => {
                use input::event::keyboard::KeyboardEventTrait;
                let Some(device) = self.device_for(&key.device(), DeviceType::Keyboard) else {
                    trace!("Keyboard event for a device without keyboard capability");
                    return;
                };
                emit(BackendEvent::Input(InputEvent::Keyboard(KeyboardKeyEvent {
                    device,
                    time_msec: msec_from_usec(key.time_usec()),
                    key_code: key.key(),
                    state: match key.key_state() {
                        event::keyboard::KeyState::Pressed => KeyState::Pressed,
                        event::keyboard::KeyState::Released => KeyState::Released,
                    },
                })));
            }
            Event::Pointer(pointer) => self.translate_pointer(pointer, emit),
            Event::Touch(touch) => self.translate_touch(touch, emit),
            Event::Tablet(tool) => self.translate_tool(tool, emit),
            Event::TabletPad(pad) => self.translate_pad(pad, emit),
            Event::Switch(event::SwitchEvent::Toggle(toggle)) => {
                use input::event::switch::{Switch, SwitchEventTrait, SwitchState as LiSwitchState};
                let Some(device) = self.device_for(&toggle.device(), DeviceType::Switch) else {
                    return;
                };
                let Some(switch) = toggle.switch() else { return };
                emit(BackendEvent::Input(InputEvent::SwitchToggle(SwitchToggleEvent {
                    device,
                    time_msec: msec_from_usec(toggle.time_usec()),
                    switch: match switch {
                        Switch::Lid => SwitchType::Lid,
                        Switch::TabletMode => SwitchType::TabletMode,
                        _ => return,
                    },
                    state: match toggle.switch_state() {
                        LiSwitchState::On => SwitchState::On,
                        LiSwitchState::Off => SwitchState::Off,
                    },
                })));
            }
            _ => {
                trace!("Unhandled libinput event");
            }
        }
    }

    fn translate_pointer(&self, event: event::PointerEvent, emit: &mut impl FnMut(BackendEvent)) {
        use input::event::pointer::{self, PointerEventTrait};
        let device = match self.device_for(&event.device(), DeviceType::Pointer) {
            Some(device) => device,
            None => {
                trace!("Pointer event for a device without pointer capability");
                return;
            }
        };
        match event {
            pointer::PointerEvent::Motion(motion) => {
                emit(BackendEvent::Input(InputEvent::PointerMotion(PointerMotionEvent {
                    device,
                    time_msec: msec_from_usec(motion.time_usec()),
                    delta_x: motion.dx(),
                    delta_y: motion.dy(),
                    unaccel_dx: motion.dx_unaccelerated(),
                    unaccel_dy: motion.dy_unaccelerated(),
                })));
            }
            pointer::PointerEvent::MotionAbsolute(motion) => {
                emit(BackendEvent::Input(InputEvent::PointerMotionAbsolute(
                    PointerMotionAbsoluteEvent {
                        device,
                        time_msec: msec_from_usec(motion.time_usec()),
                        x: motion.absolute_x_transformed(1),
                        y: motion.absolute_y_transformed(1),
                    },
                )));
            }
            pointer::PointerEvent::Button(button) => {
                emit(BackendEvent::Input(InputEvent::PointerButton(PointerButtonEvent {
                    device,
                    time_msec: msec_from_usec(button.time_usec()),
                    button: button.button(),
                    state: match button.button_state() {
                        pointer::ButtonState::Pressed => ButtonState::Pressed,
                        pointer::ButtonState::Released => ButtonState::Released,
                    },
                })));
            }
            pointer::PointerEvent::Axis(axis) => {
                // one event per orientation, matching the per-axis shape of
                // the uniform taxonomy
                let time_msec = msec_from_usec(axis.time_usec());
                let source = match axis.axis_source() {
                    pointer::AxisSource::Wheel => AxisSource::Wheel,
                    pointer::AxisSource::Finger => AxisSource::Finger,
                    pointer::AxisSource::Continuous => AxisSource::Continuous,
                    pointer::AxisSource::WheelTilt => AxisSource::WheelTilt,
                };
                for (li_axis, orientation) in [
                    (pointer::Axis::Horizontal, Axis::Horizontal),
                    (pointer::Axis::Vertical, Axis::Vertical),
                ] {
                    if axis.has_axis(li_axis) {
                        emit(BackendEvent::Input(InputEvent::PointerAxis(PointerAxisEvent {
                            device: device.clone(),
                            time_msec,
                            source,
                            orientation,
                            delta: axis.axis_value(li_axis),
                            delta_discrete: axis.axis_value_discrete(li_axis).unwrap_or(0.0),
                        })));
                    }
                }
            }
            _ => {
                trace!("Unhandled libinput pointer event");
            }
        }
    }

    fn translate_touch(&self, event: event::TouchEvent, emit: &mut impl FnMut(BackendEvent)) {
        use input::event::touch::{self, TouchEventPosition, TouchEventSlot, TouchEventTrait};
        let device = match self.device_for(&event.device(), DeviceType::Touch) {
            Some(device) => device,
            None => return,
        };
        let slot_of = |seat_slot: Option<u32>| TouchSlot(seat_slot.unwrap_or(0));
        match event {
            touch::TouchEvent::Down(down) => {
                emit(BackendEvent::Input(InputEvent::TouchDown(TouchDownEvent {
                    device,
                    time_msec: msec_from_usec(down.time_usec()),
                    slot: slot_of(down.slot()),
                    x: down.x_transformed(1),
                    y: down.y_transformed(1),
                })));
            }
            touch::TouchEvent::Motion(motion) => {
                emit(BackendEvent::Input(InputEvent::TouchMotion(TouchMotionEvent {
                    device,
                    time_msec: msec_from_usec(motion.time_usec()),
                    slot: slot_of(motion.slot()),
                    x: motion.x_transformed(1),
                    y: motion.y_transformed(1),
                })));
            }
            touch::TouchEvent::Up(up) => {
                emit(BackendEvent::Input(InputEvent::TouchUp(TouchUpEvent {
                    device,
                    time_msec: msec_from_usec(up.time_usec()),
                    slot: slot_of(up.slot()),
                })));
            }
            touch::TouchEvent::Cancel(cancel) => {
                emit(BackendEvent::Input(InputEvent::TouchCancel(TouchCancelEvent {
                    device,
                    time_msec: msec_from_usec(cancel.time_usec()),
                    slot: slot_of(cancel.slot()),
                })));
            }
            touch::TouchEvent::Frame(frame) => {
                emit(BackendEvent::Input(InputEvent::TouchFrame(TouchFrameEvent {
                    device,
                    time_msec: msec_from_usec(frame.time_usec()),
                })));
            }
            _ => {}
        }
    }

    fn translate_tool(&self, event: event::TabletToolEvent, emit: &mut impl FnMut(BackendEvent)) {
        use input::event::tablet_tool::{self, TabletToolEventTrait};
        let device = match self.device_for(&event.device(), DeviceType::TabletTool) {
            Some(device) => device,
            None => return,
        };
        let tool_type = |tool: &tablet_tool::TabletTool| match tool.tool_type() {
            Some(tablet_tool::TabletToolType::Pen) => TabletToolType::Pen,
            Some(tablet_tool::TabletToolType::Eraser) => TabletToolType::Eraser,
            Some(tablet_tool::TabletToolType::Brush) => TabletToolType::Brush,
            Some(tablet_tool::TabletToolType::Pencil) => TabletToolType::Pencil,
            Some(tablet_tool::TabletToolType::Airbrush) => TabletToolType::Airbrush,
            Some(tablet_tool::TabletToolType::Mouse) => TabletToolType::Mouse,
            Some(tablet_tool::TabletToolType::Lens) => TabletToolType::Lens,
            _ => TabletToolType::Unknown,
        };
        match event {
            tablet_tool::TabletToolEvent::Axis(axis) => {
                emit(BackendEvent::Input(InputEvent::TabletToolAxis(TabletToolAxisEvent {
                    device,
                    time_msec: msec_from_usec(axis.time_usec()),
                    tool: tool_type(&axis.tool()),
                    x: axis.x_transformed(1),
                    y: axis.y_transformed(1),
                    pressure: axis.pressure(),
                    distance: axis.distance(),
                    tilt_x: axis.tilt_x(),
                    tilt_y: axis.tilt_y(),
                    rotation: axis.rotation(),
                    slider: axis.slider_position(),
                    wheel_delta: axis.wheel_delta(),
                })));
            }
            tablet_tool::TabletToolEvent::Proximity(proximity) => {
                emit(BackendEvent::Input(InputEvent::TabletToolProximity(
                    TabletToolProximityEvent {
                        device,
                        time_msec: msec_from_usec(proximity.time_usec()),
                        tool: tool_type(&proximity.tool()),
                        x: proximity.x_transformed(1),
                        y: proximity.y_transformed(1),
                        state: match proximity.proximity_state() {
                            tablet_tool::ProximityState::In => ProximityState::In,
                            tablet_tool::ProximityState::Out => ProximityState::Out,
                        },
                    },
                )));
            }
            tablet_tool::TabletToolEvent::Tip(tip) => {
                emit(BackendEvent::Input(InputEvent::TabletToolTip(TabletToolTipEvent {
                    device,
                    time_msec: msec_from_usec(tip.time_usec()),
                    tool: tool_type(&tip.tool()),
                    x: tip.x_transformed(1),
                    y: tip.y_transformed(1),
                    state: match tip.tip_state() {
                        tablet_tool::TipState::Down => TipState::Down,
                        tablet_tool::TipState::Up => TipState::Up,
                    },
                })));
            }
            tablet_tool::TabletToolEvent::Button(button) => {
                emit(BackendEvent::Input(InputEvent::TabletToolButton(
                    TabletToolButtonEvent {
                        device,
                        time_msec: msec_from_usec(button.time_usec()),
                        button: button.button(),
                        state: match button.button_state() {
                            event::pointer::ButtonState::Pressed => ButtonState::Pressed,
                            event::pointer::ButtonState::Released => ButtonState::Released,
                        },
                    },
                )));
            }
            _ => {}
        }
    }

    fn translate_pad(&self, event: event::TabletPadEvent, emit: &mut impl FnMut(BackendEvent)) {
        use input::event::tablet_pad::{self, TabletPadEventTrait};
        let device = match self.device_for(&event.device(), DeviceType::TabletPad) {
            Some(device) => device,
            None => return,
        };
        match event {
            tablet_pad::TabletPadEvent::Button(button) => {
                emit(BackendEvent::Input(InputEvent::TabletPadButton(TabletPadButtonEvent {
                    device,
                    time_msec: msec_from_usec(button.time_usec()),
                    button: button.button_number(),
                    state: match button.button_state() {
                        event::pointer::ButtonState::Pressed => ButtonState::Pressed,
                        event::pointer::ButtonState::Released => ButtonState::Released,
                    },
                })));
            }
            tablet_pad::TabletPadEvent::Ring(ring) => {
                emit(BackendEvent::Input(InputEvent::TabletPadRing(TabletPadRingEvent {
                    device,
                    time_msec: msec_from_usec(ring.time_usec()),
                    ring: ring.number(),
                    position: ring.position(),
                    source: PadSource::Unknown,
                })));
            }
            tablet_pad::TabletPadEvent::Strip(strip) => {
                emit(BackendEvent::Input(InputEvent::TabletPadStrip(TabletPadStripEvent {
                    device,
                    time_msec: msec_from_usec(strip.time_usec()),
                    strip: strip.number(),
                    position: strip.position(),
                    source: PadSource::Unknown,
                })));
            }
            _ => {}
        }
    }
}

/// Split a multi-capability device into the single-capability device types
/// the uniform api exposes.
fn split_device_types(
    has_capability: impl Fn(input::DeviceCapability) -> bool,
) -> SmallVec<[DeviceType; 3]> {
    use input::DeviceCapability;
    let mut types = SmallVec::new();
    if has_capability(DeviceCapability::Keyboard) {
        types.push(DeviceType::Keyboard);
    }
    if has_capability(DeviceCapability::Pointer) {
        types.push(DeviceType::Pointer);
    }
    if has_capability(DeviceCapability::Touch) {
        types.push(DeviceType::Touch);
    }
    if has_capability(DeviceCapability::TabletTool) {
        types.push(DeviceType::TabletTool);
    }
    if has_capability(DeviceCapability::TabletPad) {
        types.push(DeviceType::TabletPad);
    }
    if has_capability(DeviceCapability::Switch) {
        types.push(DeviceType::Switch);
    }
    types
}

impl Backend for LibinputBackend {
    fn start(&mut self) -> Result<(), BackendError> {
        if self.started {
            return Err(BackendError::AlreadyStarted);
        }
        let span = self.span.clone();
        let _guard = span.enter();
        info!("Starting libinput backend");
        self.started = true;
        // devices discovered by seat assignment are already queued inside
        // the context; flush them through the event queue so nothing is
        // lost before the first loop turn
        let queue = self.queue.clone();
        self.dispatch(|event| queue.push(event))
            .map_err(BackendError::Io)?;
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.started
    }

    /// Suspend the context, revoking all evdev fds.
    fn suspend(&mut self) {
        let _guard = self.span.enter();
        info!("Suspending libinput context");
        self.context.suspend();
    }

    /// Re-open the devices through the session.
    fn resume(&mut self) {
        let _guard = self.span.enter();
        info!("Resuming libinput context");
        if self.context.resume().is_err() {
            tracing::error!("Failed to resume libinput context");
        }
    }
}

impl AsRawFd for LibinputBackend {
    fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        self.context.as_raw_fd()
    }
}

impl EventSource for LibinputBackend {
    type Event = BackendEvent;
    type Metadata = ();
    type Ret = ();
    type Error = BackendError;

    #[profiling::function]
    fn process_events<F>(
        &mut self,
        _: Readiness,
        token: Token,
        mut callback: F,
    ) -> Result<PostAction, BackendError>
    where
        F: FnMut(BackendEvent, &mut ()),
    {
        if Some(token) == self.token {
            let _guard = self.span.clone().entered();
            let mut pending = Vec::new();
            self.dispatch(|event| pending.push(event))
                .map_err(BackendError::Io)?;
            for event in pending {
                callback(event, &mut ());
            }
        } else if Some(token) == self.wake_token {
            self.queue.waker().clear();
        }
        self.queue.drain(|event| callback(event, &mut ()));
        Ok(PostAction::Continue)
    }

    fn register(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        let token = factory.token();
        let wake_token = factory.token();
        unsafe {
            poll.register(
                BorrowedFd::borrow_raw(self.context.as_raw_fd()),
                Interest::READ,
                Mode::Level,
                token,
            )?;
            poll.register(
                self.queue.waker().as_fd(),
                Interest::READ,
                Mode::Level,
                wake_token,
            )?;
        }
        self.token = Some(token);
        self.wake_token = Some(wake_token);
        Ok(())
    }

    fn reregister(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        self.unregister(poll)?;
        self.register(poll, factory)
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        if self.token.take().is_some() {
            poll.unregister(unsafe { BorrowedFd::borrow_raw(self.context.as_raw_fd()) })?;
        }
        if self.wake_token.take().is_some() {
            poll.unregister(self.queue.waker().as_fd())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::split_device_types;
    use crate::backend::input::DeviceType;
    use input::DeviceCapability;

    #[test]
    fn multi_capability_device_is_split() {
        // a laptop-style keyboard advertising a pointer too becomes
        // exactly two devices
        let types = split_device_types(|cap| {
            matches!(cap, DeviceCapability::Keyboard | DeviceCapability::Pointer)
        });
        assert_eq!(types.as_slice(), &[DeviceType::Keyboard, DeviceType::Pointer]);
    }

    #[test]
    fn single_capability_stays_single() {
        let types = split_device_types(|cap| matches!(cap, DeviceCapability::Touch));
        assert_eq!(types.as_slice(), &[DeviceType::Touch]);
    }

    #[test]
    fn unexposed_capabilities_yield_nothing() {
        let types = split_device_types(|cap| matches!(cap, DeviceCapability::Gesture));
        assert!(types.is_empty());
    }
}
