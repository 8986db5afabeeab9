//! Uniform input event types emitted by all backends.
//!
//! Input backends normalize their native events into the plain value structs
//! of this module. Every event snapshots its payload at dispatch time and
//! carries a cheap-clone [`InputDevice`] handle identifying its source; a
//! receiver may keep the handle, but the event itself borrows nothing.
//!
//! A device exposes exactly one capability. Physical devices advertising
//! several capabilities (a laptop keyboard with a pointer stick, say) are
//! split by their backend into several [`InputDevice`]s sharing the same
//! underlying handle.

use std::fmt;
use std::sync::Arc;

bitflags::bitflags! {
    /// Keyboard led state, as written by [`InputDevice::led_update`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Led: u32 {
        /// Num lock
        const NUMLOCK = 1;
        /// Caps lock
        const CAPSLOCK = 2;
        /// Scroll lock
        const SCROLLLOCK = 4;
    }
}

/// The single capability an [`InputDevice`] exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    /// Produces key events
    Keyboard,
    /// Produces motion/button/axis events
    Pointer,
    /// Produces touch slot events
    Touch,
    /// A pen or similar tool on a drawing tablet
    TabletTool,
    /// The button/ring/strip cluster of a drawing tablet
    TabletPad,
    /// A lid or tablet-mode switch
    Switch,
}

/// Handle to a single-capability input device.
///
/// Clones refer to the same device; the handle keeps the underlying backend
/// device alive across event fan-out.
#[derive(Clone)]
pub struct InputDevice {
    pub(crate) inner: Arc<DeviceInner>,
}

pub(crate) struct DeviceInner {
    pub(crate) name: String,
    pub(crate) ty: DeviceType,
    pub(crate) vendor: u32,
    pub(crate) product: u32,
    pub(crate) handle: DeviceHandle,
}

pub(crate) enum DeviceHandle {
    /// A device owned by a libinput context.
    #[cfg(feature = "backend_libinput")]
    Libinput(input::Device),
    /// A device synthesized by one of the nested or remote backends.
    Virtual,
}

impl fmt::Debug for InputDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputDevice")
            .field("name", &self.inner.name)
            .field("type", &self.inner.ty)
            .finish_non_exhaustive()
    }
}

impl PartialEq for InputDevice {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for InputDevice {}

impl std::hash::Hash for InputDevice {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.inner) as usize).hash(state);
    }
}

impl InputDevice {
    pub(crate) fn new(
        name: String,
        ty: DeviceType,
        vendor: u32,
        product: u32,
        handle: DeviceHandle,
    ) -> InputDevice {
        InputDevice {
            inner: Arc::new(DeviceInner {
                name,
                ty,
                vendor,
                product,
                handle,
            }),
        }
    }

    /// Human readable device name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The capability this device exposes.
    pub fn device_type(&self) -> DeviceType {
        self.inner.ty
    }

    /// USB vendor/product id, if known.
    pub fn usb_id(&self) -> (u32, u32) {
        (self.inner.vendor, self.inner.product)
    }

    /// Write the keyboard led state.
    ///
    /// A no-op for devices that are not keyboards or have no leds.
    pub fn led_update(&self, leds: Led) {
        match &self.inner.handle {
            #[cfg(feature = "backend_libinput")]
            DeviceHandle::Libinput(device) => {
                if self.inner.ty == DeviceType::Keyboard {
                    let mut li_leds = input::Led::empty();
                    if leds.contains(Led::NUMLOCK) {
                        li_leds |= input::Led::NUMLOCK;
                    }
                    if leds.contains(Led::CAPSLOCK) {
                        li_leds |= input::Led::CAPSLOCK;
                    }
                    if leds.contains(Led::SCROLLLOCK) {
                        li_leds |= input::Led::SCROLLLOCK;
                    }
                    let mut device = device.clone();
                    device.led_update(li_leds);
                }
            }
            DeviceHandle::Virtual => {}
        }
    }

    /// The libinput device backing this handle, if it comes from the
    /// libinput backend. Several [`InputDevice`]s may share one libinput
    /// device, one per capability.
    #[cfg(feature = "backend_libinput")]
    pub fn libinput_device(&self) -> Option<&input::Device> {
        match &self.inner.handle {
            DeviceHandle::Libinput(device) => Some(device),
            #[allow(unreachable_patterns)]
            _ => None,
        }
    }
}

/// State of a key on a keyboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyState {
    /// Key was released
    Released,
    /// Key was pressed
    Pressed,
}

/// State of a button on a pointer device or tablet tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ButtonState {
    /// Button was released
    Released,
    /// Button was pressed
    Pressed,
}

/// Scroll axis orientation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    /// Horizontal scrolling
    Horizontal,
    /// Vertical scrolling
    Vertical,
}

/// Source of a scroll event, determining how deltas are to be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AxisSource {
    /// A scroll wheel with discrete steps.
    Wheel,
    /// Finger scrolling on a touchpad. The sequence is guaranteed to be
    /// terminated by a delta of 0, which may trigger kinetic scrolling.
    Finger,
    /// Continuous scrolling device, no terminating event guaranteed.
    Continuous,
    /// Tilting the scroll wheel sideways.
    WheelTilt,
}

/// Identifies one touch point on a multi-touch device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TouchSlot(pub u32);

/// Tablet tool variants as reported by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TabletToolType {
    /// A generic pen
    Pen,
    /// The eraser end of a pen
    Eraser,
    /// A paint brush tool
    Brush,
    /// A pencil tool
    Pencil,
    /// An airbrush tool
    Airbrush,
    /// A mouse resting on the tablet
    Mouse,
    /// A lens tool
    Lens,
    /// Tool type not covered by the above
    Unknown,
}

/// Whether a tablet tool is within sensing distance of the tablet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProximityState {
    /// Tool left the sensing range
    Out,
    /// Tool entered the sensing range
    In,
}

/// Whether a tablet tool touches the surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TipState {
    /// Tool was lifted off the surface
    Up,
    /// Tool touched the surface
    Down,
}

/// Kind of a toggle switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SwitchType {
    /// The laptop lid
    Lid,
    /// Convertible tablet-mode switch
    TabletMode,
}

/// Position of a toggle switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SwitchState {
    /// Switch is off
    Off,
    /// Switch is on
    On,
}

/// Source of a tablet pad ring/strip position update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PadSource {
    /// Update caused by a finger
    Finger,
    /// Source not known
    Unknown,
}

/// A key press or release.
#[derive(Debug, Clone)]
pub struct KeyboardKeyEvent {
    /// Source device
    pub device: InputDevice,
    /// Timestamp in milliseconds
    pub time_msec: u32,
    /// Raw evdev keycode (see `linux/input-event-codes.h`)
    pub key_code: u32,
    /// Press state
    pub state: KeyState,
}

/// Relative pointer motion.
#[derive(Debug, Clone)]
pub struct PointerMotionEvent {
    /// Source device
    pub device: InputDevice,
    /// Timestamp in milliseconds
    pub time_msec: u32,
    /// Accelerated motion on the x axis
    pub delta_x: f64,
    /// Accelerated motion on the y axis
    pub delta_y: f64,
    /// Raw, unaccelerated motion on the x axis
    pub unaccel_dx: f64,
    /// Raw, unaccelerated motion on the y axis
    pub unaccel_dy: f64,
}

/// Absolute pointer position, normalized to `[0, 1]` of the output area.
#[derive(Debug, Clone)]
pub struct PointerMotionAbsoluteEvent {
    /// Source device
    pub device: InputDevice,
    /// Timestamp in milliseconds
    pub time_msec: u32,
    /// Normalized x position
    pub x: f64,
    /// Normalized y position
    pub y: f64,
}

/// A pointer button press or release.
#[derive(Debug, Clone)]
pub struct PointerButtonEvent {
    /// Source device
    pub device: InputDevice,
    /// Timestamp in milliseconds
    pub time_msec: u32,
    /// Raw evdev button code (e.g. `BTN_LEFT` = 0x110)
    pub button: u32,
    /// Press state
    pub state: ButtonState,
}

/// Scrolling along one axis.
#[derive(Debug, Clone)]
pub struct PointerAxisEvent {
    /// Source device
    pub device: InputDevice,
    /// Timestamp in milliseconds
    pub time_msec: u32,
    /// What produced the event
    pub source: AxisSource,
    /// Axis orientation
    pub orientation: Axis,
    /// Scroll distance; see [`AxisSource`] for interpretation
    pub delta: f64,
    /// Scroll distance in discrete steps, 0 for continuous sources
    pub delta_discrete: f64,
}

/// A new touch point appeared.
#[derive(Debug, Clone)]
pub struct TouchDownEvent {
    /// Source device
    pub device: InputDevice,
    /// Timestamp in milliseconds
    pub time_msec: u32,
    /// The slot this touch point occupies
    pub slot: TouchSlot,
    /// Normalized x position
    pub x: f64,
    /// Normalized y position
    pub y: f64,
}

/// A touch point moved.
#[derive(Debug, Clone)]
pub struct TouchMotionEvent {
    /// Source device
    pub device: InputDevice,
    /// Timestamp in milliseconds
    pub time_msec: u32,
    /// The slot this touch point occupies
    pub slot: TouchSlot,
    /// Normalized x position
    pub x: f64,
    /// Normalized y position
    pub y: f64,
}

/// A touch point was lifted.
#[derive(Debug, Clone)]
pub struct TouchUpEvent {
    /// Source device
    pub device: InputDevice,
    /// Timestamp in milliseconds
    pub time_msec: u32,
    /// The slot this touch point occupied
    pub slot: TouchSlot,
}

/// A touch sequence was cancelled; all previous events of the slot should
/// be disregarded.
#[derive(Debug, Clone)]
pub struct TouchCancelEvent {
    /// Source device
    pub device: InputDevice,
    /// Timestamp in milliseconds
    pub time_msec: u32,
    /// The slot whose sequence was cancelled
    pub slot: TouchSlot,
}

/// End of a set of touch points updated at the same device sample time.
#[derive(Debug, Clone)]
pub struct TouchFrameEvent {
    /// Source device
    pub device: InputDevice,
    /// Timestamp in milliseconds
    pub time_msec: u32,
}

/// Axis update of a tablet tool.
#[derive(Debug, Clone)]
pub struct TabletToolAxisEvent {
    /// Source device
    pub device: InputDevice,
    /// Timestamp in milliseconds
    pub time_msec: u32,
    /// Kind of tool
    pub tool: TabletToolType,
    /// Normalized x position
    pub x: f64,
    /// Normalized y position
    pub y: f64,
    /// Pressure in `[0, 1]`
    pub pressure: f64,
    /// Distance from the surface in `[0, 1]`
    pub distance: f64,
    /// Tilt around the x axis in degrees
    pub tilt_x: f64,
    /// Tilt around the y axis in degrees
    pub tilt_y: f64,
    /// Absolute rotation in degrees
    pub rotation: f64,
    /// Slider position in `[-1, 1]`
    pub slider: f64,
    /// Relative wheel delta in degrees
    pub wheel_delta: f64,
}

/// A tablet tool entered or left sensing range.
#[derive(Debug, Clone)]
pub struct TabletToolProximityEvent {
    /// Source device
    pub device: InputDevice,
    /// Timestamp in milliseconds
    pub time_msec: u32,
    /// Kind of tool
    pub tool: TabletToolType,
    /// Normalized x position
    pub x: f64,
    /// Normalized y position
    pub y: f64,
    /// New proximity state
    pub state: ProximityState,
}

/// A tablet tool touched or left the surface.
#[derive(Debug, Clone)]
pub struct TabletToolTipEvent {
    /// Source device
    pub device: InputDevice,
    /// Timestamp in milliseconds
    pub time_msec: u32,
    /// Kind of tool
    pub tool: TabletToolType,
    /// Normalized x position
    pub x: f64,
    /// Normalized y position
    pub y: f64,
    /// New tip state
    pub state: TipState,
}

/// A button press on a tablet tool.
#[derive(Debug, Clone)]
pub struct TabletToolButtonEvent {
    /// Source device
    pub device: InputDevice,
    /// Timestamp in milliseconds
    pub time_msec: u32,
    /// Raw button code
    pub button: u32,
    /// Press state
    pub state: ButtonState,
}

/// A button press on a tablet pad.
#[derive(Debug, Clone)]
pub struct TabletPadButtonEvent {
    /// Source device
    pub device: InputDevice,
    /// Timestamp in milliseconds
    pub time_msec: u32,
    /// Index of the pressed button
    pub button: u32,
    /// Press state
    pub state: ButtonState,
}

/// Position update of a tablet pad ring.
#[derive(Debug, Clone)]
pub struct TabletPadRingEvent {
    /// Source device
    pub device: InputDevice,
    /// Timestamp in milliseconds
    pub time_msec: u32,
    /// Index of the ring
    pub ring: u32,
    /// Position in degrees, -1.0 when the interaction ended
    pub position: f64,
    /// What produced the update
    pub source: PadSource,
}

/// Position update of a tablet pad strip.
#[derive(Debug, Clone)]
pub struct TabletPadStripEvent {
    /// Source device
    pub device: InputDevice,
    /// Timestamp in milliseconds
    pub time_msec: u32,
    /// Index of the strip
    pub strip: u32,
    /// Position in `[0, 1]`, -1.0 when the interaction ended
    pub position: f64,
    /// What produced the update
    pub source: PadSource,
}

/// A switch changed position.
#[derive(Debug, Clone)]
pub struct SwitchToggleEvent {
    /// Source device
    pub device: InputDevice,
    /// Timestamp in milliseconds
    pub time_msec: u32,
    /// Which switch toggled
    pub switch: SwitchType,
    /// New position
    pub state: SwitchState,
}

/// Any input event a backend can produce.
#[derive(Debug, Clone)]
pub enum InputEvent {
    /// A key press or release
    Keyboard(KeyboardKeyEvent),
    /// Relative pointer motion
    PointerMotion(PointerMotionEvent),
    /// Absolute pointer motion
    PointerMotionAbsolute(PointerMotionAbsoluteEvent),
    /// A pointer button press or release
    PointerButton(PointerButtonEvent),
    /// Scrolling along an axis
    PointerAxis(PointerAxisEvent),
    /// A new touch point
    TouchDown(TouchDownEvent),
    /// A touch point moved
    TouchMotion(TouchMotionEvent),
    /// A touch point was lifted
    TouchUp(TouchUpEvent),
    /// A touch sequence was cancelled
    TouchCancel(TouchCancelEvent),
    /// End of a touch point set
    TouchFrame(TouchFrameEvent),
    /// Tablet tool axis update
    TabletToolAxis(TabletToolAxisEvent),
    /// Tablet tool proximity change
    TabletToolProximity(TabletToolProximityEvent),
    /// Tablet tool tip state change
    TabletToolTip(TabletToolTipEvent),
    /// Tablet tool button press
    TabletToolButton(TabletToolButtonEvent),
    /// Tablet pad button press
    TabletPadButton(TabletPadButtonEvent),
    /// Tablet pad ring update
    TabletPadRing(TabletPadRingEvent),
    /// Tablet pad strip update
    TabletPadStrip(TabletPadStripEvent),
    /// A switch changed position
    SwitchToggle(SwitchToggleEvent),
}

impl InputEvent {
    /// The device that produced this event.
    pub fn device(&self) -> &InputDevice {
        match self {
            InputEvent::Keyboard(e) => &e.device,
            InputEvent::PointerMotion(e) => &e.device,
            InputEvent::PointerMotionAbsolute(e) => &e.device,
            InputEvent::PointerButton(e) => &e.device,
            InputEvent::PointerAxis(e) => &e.device,
            InputEvent::TouchDown(e) => &e.device,
            InputEvent::TouchMotion(e) => &e.device,
            InputEvent::TouchUp(e) => &e.device,
            InputEvent::TouchCancel(e) => &e.device,
            InputEvent::TouchFrame(e) => &e.device,
            InputEvent::TabletToolAxis(e) => &e.device,
            InputEvent::TabletToolProximity(e) => &e.device,
            InputEvent::TabletToolTip(e) => &e.device,
            InputEvent::TabletToolButton(e) => &e.device,
            InputEvent::TabletPadButton(e) => &e.device,
            InputEvent::TabletPadRing(e) => &e.device,
            InputEvent::TabletPadStrip(e) => &e.device,
            InputEvent::SwitchToggle(e) => &e.device,
        }
    }

    /// Timestamp of this event in milliseconds.
    pub fn time_msec(&self) -> u32 {
        match self {
            InputEvent::Keyboard(e) => e.time_msec,
            InputEvent::PointerMotion(e) => e.time_msec,
            InputEvent::PointerMotionAbsolute(e) => e.time_msec,
            InputEvent::PointerButton(e) => e.time_msec,
            InputEvent::PointerAxis(e) => e.time_msec,
            InputEvent::TouchDown(e) => e.time_msec,
            InputEvent::TouchMotion(e) => e.time_msec,
            InputEvent::TouchUp(e) => e.time_msec,
            InputEvent::TouchCancel(e) => e.time_msec,
            InputEvent::TouchFrame(e) => e.time_msec,
            InputEvent::TabletToolAxis(e) => e.time_msec,
            InputEvent::TabletToolProximity(e) => e.time_msec,
            InputEvent::TabletToolTip(e) => e.time_msec,
            InputEvent::TabletToolButton(e) => e.time_msec,
            InputEvent::TabletPadButton(e) => e.time_msec,
            InputEvent::TabletPadRing(e) => e.time_msec,
            InputEvent::TabletPadStrip(e) => e.time_msec,
            InputEvent::SwitchToggle(e) => e.time_msec,
        }
    }
}

/// Convert a microsecond timestamp (as reported by libinput) to the
/// millisecond resolution events carry.
pub(crate) fn msec_from_usec(usec: u64) -> u32 {
    (usec / 1000) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usec_to_msec_truncates() {
        assert_eq!(msec_from_usec(0), 0);
        assert_eq!(msec_from_usec(999), 0);
        assert_eq!(msec_from_usec(1000), 1);
        assert_eq!(msec_from_usec(1999), 1);
        // KEY_A pressed at T microseconds arrives at ~T/1000
        assert_eq!(msec_from_usec(1_234_567), 1234);
    }

    #[test]
    fn usec_to_msec_is_monotonic() {
        let mut last = 0;
        for usec in (0..5_000_000u64).step_by(777) {
            let msec = msec_from_usec(usec);
            assert!(msec >= last);
            last = msec;
        }
    }
}
