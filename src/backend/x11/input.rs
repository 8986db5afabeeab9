//! Translation of core X11 input events into the uniform taxonomy.

use x11rb::protocol::Event as X11Event;

use crate::backend::input::{
    Axis, AxisSource, ButtonState, InputDevice, InputEvent, KeyState, KeyboardKeyEvent,
    PointerAxisEvent, PointerButtonEvent, PointerMotionAbsoluteEvent,
};

/// X keycodes are evdev keycodes shifted by 8.
const KEYCODE_OFFSET: u8 = 8;

/// Linux button codes for the core X11 buttons 1..3.
const BTN_LEFT: u32 = 0x110;
const BTN_RIGHT: u32 = 0x111;
const BTN_MIDDLE: u32 = 0x112;

fn key_code(detail: u8) -> u32 {
    detail.saturating_sub(KEYCODE_OFFSET) as u32
}

fn button_code(detail: u8) -> Option<u32> {
    match detail {
        1 => Some(BTN_LEFT),
        2 => Some(BTN_MIDDLE),
        3 => Some(BTN_RIGHT),
        _ => None,
    }
}

/// X11 buttons 4..7 are the scroll wheel; one click is one discrete step.
fn axis_event(detail: u8) -> Option<(Axis, f64)> {
    match detail {
        4 => Some((Axis::Vertical, -15.0)),
        5 => Some((Axis::Vertical, 15.0)),
        6 => Some((Axis::Horizontal, -15.0)),
        7 => Some((Axis::Horizontal, 15.0)),
        _ => None,
    }
}

/// Translate a core X11 input event. `window_size` resolves the window an
/// event landed on for coordinate normalization.
pub(super) fn translate(
    event: &X11Event,
    keyboard: &InputDevice,
    pointer: &InputDevice,
    window_size: impl Fn(u32) -> Option<(i32, i32)>,
) -> Option<InputEvent> {
    match event {
        X11Event::KeyPress(key) => Some(InputEvent::Keyboard(KeyboardKeyEvent {
            device: keyboard.clone(),
            time_msec: key.time,
            key_code: key_code(key.detail),
            state: KeyState::Pressed,
        })),
        X11Event::KeyRelease(key) => Some(InputEvent::Keyboard(KeyboardKeyEvent {
            device: keyboard.clone(),
            time_msec: key.time,
            key_code: key_code(key.detail),
            state: KeyState::Released,
        })),
        X11Event::ButtonPress(button) => {
            if let Some((orientation, delta)) = axis_event(button.detail) {
                Some(InputEvent::PointerAxis(PointerAxisEvent {
                    device: pointer.clone(),
                    time_msec: button.time,
                    source: AxisSource::Wheel,
                    orientation,
                    delta,
                    delta_discrete: delta.signum(),
                }))
            } else {
                Some(InputEvent::PointerButton(PointerButtonEvent {
                    device: pointer.clone(),
                    time_msec: button.time,
                    button: button_code(button.detail)?,
                    state: ButtonState::Pressed,
                }))
            }
        }
        X11Event::ButtonRelease(button) => {
            // the scroll buttons already produced their axis event on press
            if axis_event(button.detail).is_some() {
                return None;
            }
            Some(InputEvent::PointerButton(PointerButtonEvent {
                device: pointer.clone(),
                time_msec: button.time,
                button: button_code(button.detail)?,
                state: ButtonState::Released,
            }))
        }
        X11Event::MotionNotify(motion) => {
            let (w, h) = window_size(motion.event)?;
            Some(InputEvent::PointerMotionAbsolute(PointerMotionAbsoluteEvent {
                device: pointer.clone(),
                time_msec: motion.time,
                x: (motion.event_x as f64 / w as f64).clamp(0.0, 1.0),
                y: (motion.event_y as f64 / h as f64).clamp(0.0, 1.0),
            }))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn x_keycodes_carry_the_evdev_offset() {
        // X keycode 38 is evdev KEY_A (30)
        assert_eq!(key_code(38), 30);
        assert_eq!(key_code(9), 1); // KEY_ESC
        assert_eq!(key_code(0), 0); // saturates instead of wrapping
    }

    #[test]
    fn core_buttons_map_to_linux_codes() {
        assert_eq!(button_code(1), Some(BTN_LEFT));
        assert_eq!(button_code(2), Some(BTN_MIDDLE));
        assert_eq!(button_code(3), Some(BTN_RIGHT));
        assert_eq!(button_code(4), None); // scroll, not a button
    }

    #[test]
    fn wheel_buttons_become_axis_events() {
        let (axis, delta) = axis_event(4).unwrap();
        assert_eq!(axis, Axis::Vertical);
        assert!(delta < 0.0);
        let (axis, delta) = axis_event(7).unwrap();
        assert_eq!(axis, Axis::Horizontal);
        assert!(delta > 0.0);
        assert!(axis_event(1).is_none());
    }
}
