//! Input device handling for the nested Wayland backend.
//!
//! The parent seat's pointer, keyboard and touch are exposed as virtual
//! input devices. Coordinates arrive surface-local and are normalized to
//! the `[0, 1]` range of the window they land on; timestamps are the
//! parent's millisecond timestamps, passed through unchanged.

use tracing::{debug, trace};
use wayland_client::protocol::{
    wl_keyboard::{self, WlKeyboard},
    wl_pointer::{self, WlPointer},
    wl_registry::WlRegistry,
    wl_seat::{self, WlSeat},
    wl_surface::WlSurface,
    wl_touch::{self, WlTouch},
};
use wayland_client::{Connection, Dispatch, QueueHandle, WEnum};

use super::WaylandState;
use crate::backend::input::{
    Axis, AxisSource, ButtonState, DeviceHandle, DeviceType, InputDevice, InputEvent, KeyState,
    KeyboardKeyEvent, PointerAxisEvent, PointerButtonEvent, PointerMotionAbsoluteEvent,
    TouchCancelEvent, TouchDownEvent, TouchFrameEvent, TouchMotionEvent, TouchSlot, TouchUpEvent,
};
use crate::backend::{BackendEvent, EventQueue};

/// Devices and focus state of the parent seat.
pub(crate) struct SeatState {
    queue: EventQueue,
    seat: Option<WlSeat>,
    pointer: Option<WlPointer>,
    keyboard: Option<WlKeyboard>,
    touch: Option<WlTouch>,
    pointer_device: Option<InputDevice>,
    keyboard_device: Option<InputDevice>,
    touch_device: Option<InputDevice>,
    pointer_focus: Option<WlSurface>,
    touch_focus: Option<WlSurface>,
    pointer_pos: (f64, f64),
    axis_source: AxisSource,
}

impl SeatState {
    pub(crate) fn new(queue: EventQueue) -> SeatState {
        SeatState {
            queue,
            seat: None,
            pointer: None,
            keyboard: None,
            touch: None,
            pointer_device: None,
            keyboard_device: None,
            touch_device: None,
            pointer_focus: None,
            touch_focus: None,
            pointer_pos: (0.0, 0.0),
            axis_source: AxisSource::Wheel,
        }
    }

    pub(crate) fn bind(
        &mut self,
        registry: &WlRegistry,
        name: u32,
        version: u32,
        qh: &QueueHandle<WaylandState>,
    ) {
        self.seat = Some(registry.bind::<WlSeat, _, _>(name, version, qh, ()));
    }

    pub(crate) fn devices(&self) -> Vec<InputDevice> {
        [
            self.pointer_device.clone(),
            self.keyboard_device.clone(),
            self.touch_device.clone(),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    fn new_device(&self, ty: DeviceType) -> InputDevice {
        let name = match ty {
            DeviceType::Keyboard => "wayland-keyboard",
            DeviceType::Pointer => "wayland-pointer",
            DeviceType::Touch => "wayland-touch",
            _ => "wayland-device",
        };
        let device = InputDevice::new(name.to_owned(), ty, 0, 0, DeviceHandle::Virtual);
        self.queue.push(BackendEvent::NewInput {
            device: device.clone(),
        });
        device
    }
}

impl WaylandState {
    /// Size of the window `surface` belongs to, for normalization.
    fn window_size(&self, surface: &WlSurface) -> Option<(f64, f64)> {
        self.outputs
            .iter()
            .find(|inner| inner.surface == *surface)
            .map(|inner| {
                let size = inner.state.lock().unwrap().size;
                (size.0 as f64, size.1 as f64)
            })
    }
}

impl Dispatch<WlSeat, ()> for WaylandState {
    fn event(
        state: &mut Self,
        seat: &WlSeat,
        event: wl_seat::Event,
        _: &(),
        _: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        if let wl_seat::Event::Capabilities { capabilities } = event {
            let WEnum::Value(capabilities) = capabilities else {
                return;
            };
            let seat_state = &mut state.seat;

            if capabilities.contains(wl_seat::Capability::Pointer) && seat_state.pointer.is_none() {
                debug!("Parent seat grew a pointer");
                seat_state.pointer = Some(seat.get_pointer(qh, ()));
                seat_state.pointer_device = Some(seat_state.new_device(DeviceType::Pointer));
            }
            if !capabilities.contains(wl_seat::Capability::Pointer) {
                if let (Some(pointer), Some(device)) =
                    (seat_state.pointer.take(), seat_state.pointer_device.take())
                {
                    pointer.release();
                    seat_state.queue.push(BackendEvent::InputDestroyed { device });
                }
            }

            if capabilities.contains(wl_seat::Capability::Keyboard) && seat_state.keyboard.is_none() {
                debug!("Parent seat grew a keyboard");
                seat_state.keyboard = Some(seat.get_keyboard(qh, ()));
                seat_state.keyboard_device = Some(seat_state.new_device(DeviceType::Keyboard));
            }
            if !capabilities.contains(wl_seat::Capability::Keyboard) {
                if let (Some(keyboard), Some(device)) =
                    (seat_state.keyboard.take(), seat_state.keyboard_device.take())
                {
                    keyboard.release();
                    seat_state.queue.push(BackendEvent::InputDestroyed { device });
                }
            }

            if capabilities.contains(wl_seat::Capability::Touch) && seat_state.touch.is_none() {
                debug!("Parent seat grew a touchscreen");
                seat_state.touch = Some(seat.get_touch(qh, ()));
                seat_state.touch_device = Some(seat_state.new_device(DeviceType::Touch));
            }
            if !capabilities.contains(wl_seat::Capability::Touch) {
                if let (Some(touch), Some(device)) =
                    (seat_state.touch.take(), seat_state.touch_device.take())
                {
                    touch.release();
                    seat_state.queue.push(BackendEvent::InputDestroyed { device });
                }
            }
        }
    }
}

impl Dispatch<WlPointer, ()> for WaylandState {
    fn event(
        state: &mut Self,
        _: &WlPointer,
        event: wl_pointer::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        let Some(device) = state.seat.pointer_device.clone() else {
            return;
        };
        match event {
            wl_pointer::Event::Enter {
                surface,
                surface_x,
                surface_y,
                ..
            } => {
                state.seat.pointer_focus = Some(surface);
                state.seat.pointer_pos = (surface_x, surface_y);
            }
            wl_pointer::Event::Leave { .. } => {
                state.seat.pointer_focus = None;
            }
            wl_pointer::Event::Motion {
                time,
                surface_x,
                surface_y,
            } => {
                state.seat.pointer_pos = (surface_x, surface_y);
                let Some(surface) = state.seat.pointer_focus.clone() else {
                    return;
                };
                let Some((w, h)) = state.window_size(&surface) else {
                    return;
                };
                state.queue.push(BackendEvent::Input(InputEvent::PointerMotionAbsolute(
                    PointerMotionAbsoluteEvent {
                        device,
                        time_msec: time,
                        x: (surface_x / w).clamp(0.0, 1.0),
                        y: (surface_y / h).clamp(0.0, 1.0),
                    },
                )));
            }
            wl_pointer::Event::Button {
                time,
                button,
                state: button_state,
                ..
            } => {
                let pressed = matches!(button_state, WEnum::Value(wl_pointer::ButtonState::Pressed));
                state.queue.push(BackendEvent::Input(InputEvent::PointerButton(
                    PointerButtonEvent {
                        device,
                        time_msec: time,
                        button,
                        state: if pressed {
                            ButtonState::Pressed
                        } else {
                            ButtonState::Released
                        },
                    },
                )));
            }
            wl_pointer::Event::AxisSource { axis_source } => {
                state.seat.axis_source = match axis_source {
                    WEnum::Value(wl_pointer::AxisSource::Finger) => AxisSource::Finger,
                    WEnum::Value(wl_pointer::AxisSource::Continuous) => AxisSource::Continuous,
                    WEnum::Value(wl_pointer::AxisSource::WheelTilt) => AxisSource::WheelTilt,
                    _ => AxisSource::Wheel,
                };
            }
            wl_pointer::Event::Axis { time, axis, value } => {
                let orientation = match axis {
                    WEnum::Value(wl_pointer::Axis::HorizontalScroll) => Axis::Horizontal,
                    _ => Axis::Vertical,
                };
                state.queue.push(BackendEvent::Input(InputEvent::PointerAxis(
                    PointerAxisEvent {
                        device,
                        time_msec: time,
                        source: state.seat.axis_source,
                        orientation,
                        delta: value,
                        delta_discrete: 0.0,
                    },
                )));
            }
            wl_pointer::Event::Frame => {
                trace!("Pointer frame");
            }
            _ => {}
        }
    }
}

impl Dispatch<WlKeyboard, ()> for WaylandState {
    fn event(
        state: &mut Self,
        _: &WlKeyboard,
        event: wl_keyboard::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        let Some(device) = state.seat.keyboard_device.clone() else {
            return;
        };
        match event {
            wl_keyboard::Event::Keymap { .. } => {
                // keymap interpretation is the protocol layer's business,
                // the fd is closed on drop
            }
            wl_keyboard::Event::Key {
                time,
                key,
                state: key_state,
                ..
            } => {
                let pressed = matches!(key_state, WEnum::Value(wl_keyboard::KeyState::Pressed));
                state.queue.push(BackendEvent::Input(InputEvent::Keyboard(KeyboardKeyEvent {
                    device,
                    time_msec: time,
                    key_code: key,
                    state: if pressed {
                        KeyState::Pressed
                    } else {
                        KeyState::Released
                    },
                })));
            }
            _ => {}
        }
    }
}

impl Dispatch<WlTouch, ()> for WaylandState {
    fn event(
        state: &mut Self,
        _: &WlTouch,
        event: wl_touch::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        let Some(device) = state.seat.touch_device.clone() else {
            return;
        };
        match event {
            wl_touch::Event::Down {
                time,
                surface,
                id,
                x,
                y,
                ..
            } => {
                let Some((w, h)) = state.window_size(&surface) else {
                    return;
                };
                state.seat.touch_focus = Some(surface);
                state.queue.push(BackendEvent::Input(InputEvent::TouchDown(TouchDownEvent {
                    device,
                    time_msec: time,
                    slot: TouchSlot(id as u32),
                    x: (x / w).clamp(0.0, 1.0),
                    y: (y / h).clamp(0.0, 1.0),
                })));
            }
            wl_touch::Event::Motion { time, id, x, y } => {
                let Some(surface) = state.seat.touch_focus.clone() else {
                    return;
                };
                let Some((w, h)) = state.window_size(&surface) else {
                    return;
                };
                state.queue.push(BackendEvent::Input(InputEvent::TouchMotion(TouchMotionEvent {
                    device,
                    time_msec: time,
                    slot: TouchSlot(id as u32),
                    x: (x / w).clamp(0.0, 1.0),
                    y: (y / h).clamp(0.0, 1.0),
                })));
            }
            wl_touch::Event::Up { time, id, .. } => {
                state.queue.push(BackendEvent::Input(InputEvent::TouchUp(TouchUpEvent {
                    device,
                    time_msec: time,
                    slot: TouchSlot(id as u32),
                })));
            }
            wl_touch::Event::Frame => {
                state.queue.push(BackendEvent::Input(InputEvent::TouchFrame(TouchFrameEvent {
                    device,
                    time_msec: crate::utils::clock::monotonic_msec(),
                })));
            }
            wl_touch::Event::Cancel => {
                state.seat.touch_focus = None;
                state.queue.push(BackendEvent::Input(InputEvent::TouchCancel(TouchCancelEvent {
                    device,
                    time_msec: crate::utils::clock::monotonic_msec(),
                    slot: TouchSlot(0),
                })));
            }
            _ => {}
        }
    }
}
