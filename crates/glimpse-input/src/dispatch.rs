//! Wire input messages to sink calls.
//!
//! Viewer coordinates arrive normalized to `0..1` relative to the
//! selected display; the dispatcher denormalizes them against the
//! display bounds and forwards to the [`InputSink`].

use glimpse_capture::frame::DisplayInfo;
use glimpse_protocol::messages::{ChannelMessage, KeyModifiers, MouseButton};

use crate::keymap::resolve_scancode;

/// OS-level injection primitive (SendInput, XTest, CGEvent, or the
/// privileged recorder pipe).
pub trait InputSink: Send + Sync {
    fn mouse_move(&self, x: i32, y: i32);
    fn mouse_button(&self, button: MouseButton, pressed: bool, x: i32, y: i32);
    fn mouse_wheel(&self, dx: f32, dy: f32, x: i32, y: i32);
    fn key(&self, scan_code: u16, extended: bool, modifiers: KeyModifiers, pressed: bool);
}

fn denormalize(display: &DisplayInfo, x: f32, y: f32) -> (i32, i32) {
    let width = display.width().max(1) as f32;
    let height = display.height().max(1) as f32;
    #[allow(clippy::cast_possible_truncation)]
    let px = display.bounds.left + (x.clamp(0.0, 1.0) * (width - 1.0)).round() as i32;
    #[allow(clippy::cast_possible_truncation)]
    let py = display.bounds.top + (y.clamp(0.0, 1.0) * (height - 1.0)).round() as i32;
    (px, py)
}

/// Apply one input message against `display`. Non-input messages are
/// logged and ignored.
pub fn dispatch_input(sink: &dyn InputSink, display: &DisplayInfo, message: &ChannelMessage) {
    match message {
        ChannelMessage::MouseMove { x, y } => {
            let (px, py) = denormalize(display, *x, *y);
            sink.mouse_move(px, py);
        }
        ChannelMessage::MouseDown { button, x, y } => {
            let (px, py) = denormalize(display, *x, *y);
            sink.mouse_button(*button, true, px, py);
        }
        ChannelMessage::MouseUp { button, x, y } => {
            let (px, py) = denormalize(display, *x, *y);
            sink.mouse_button(*button, false, px, py);
        }
        ChannelMessage::MouseWheel { dx, dy, x, y } => {
            let (px, py) = denormalize(display, *x, *y);
            sink.mouse_wheel(*dx, *dy, px, py);
        }
        ChannelMessage::KeyDown {
            key_code,
            modifiers,
            scan_code,
            is_extended,
        } => {
            if let Some((scan, extended)) = resolve_scancode(*key_code, *scan_code, *is_extended) {
                sink.key(scan, extended, *modifiers, true);
            } else {
                tracing::debug!(key_code, "Unmapped key press ignored");
            }
        }
        ChannelMessage::KeyUp {
            key_code,
            modifiers,
            scan_code,
            is_extended,
        } => {
            if let Some((scan, extended)) = resolve_scancode(*key_code, *scan_code, *is_extended) {
                sink.key(scan, extended, *modifiers, false);
            } else {
                tracing::debug!(key_code, "Unmapped key release ignored");
            }
        }
        other => {
            tracing::warn!(kind = ?other.kind(), "Non-input message reached input dispatch");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glimpse_capture::frame::Rect;
    use std::sync::Mutex;

    #[derive(Debug, PartialEq)]
    enum Call {
        Move(i32, i32),
        Button(MouseButton, bool, i32, i32),
        Wheel(i32, i32),
        Key(u16, bool, bool),
    }

    #[derive(Default)]
    struct RecordingSink {
        calls: Mutex<Vec<Call>>,
    }

    impl InputSink for RecordingSink {
        fn mouse_move(&self, x: i32, y: i32) {
            self.calls.lock().unwrap().push(Call::Move(x, y));
        }
        fn mouse_button(&self, button: MouseButton, pressed: bool, x: i32, y: i32) {
            self.calls.lock().unwrap().push(Call::Button(button, pressed, x, y));
        }
        fn mouse_wheel(&self, _dx: f32, _dy: f32, x: i32, y: i32) {
            self.calls.lock().unwrap().push(Call::Wheel(x, y));
        }
        fn key(&self, scan_code: u16, extended: bool, _modifiers: KeyModifiers, pressed: bool) {
            self.calls.lock().unwrap().push(Call::Key(scan_code, extended, pressed));
        }
    }

    fn display() -> DisplayInfo {
        DisplayInfo {
            id: "d0".into(),
            friendly_name: "Primary".into(),
            is_primary: true,
            bounds: Rect::from_size(100, 50, 1920, 1080),
        }
    }

    #[test]
    fn mouse_coordinates_are_denormalized_into_display_bounds() {
        let sink = RecordingSink::default();
        dispatch_input(&sink, &display(), &ChannelMessage::MouseMove { x: 0.0, y: 0.0 });
        dispatch_input(&sink, &display(), &ChannelMessage::MouseMove { x: 1.0, y: 1.0 });

        let calls = sink.calls.lock().unwrap();
        assert_eq!(calls[0], Call::Move(100, 50));
        assert_eq!(calls[1], Call::Move(100 + 1919, 50 + 1079));
    }

    #[test]
    fn out_of_range_coordinates_are_clamped() {
        let sink = RecordingSink::default();
        dispatch_input(&sink, &display(), &ChannelMessage::MouseMove { x: -0.5, y: 2.0 });
        let calls = sink.calls.lock().unwrap();
        assert_eq!(calls[0], Call::Move(100, 50 + 1079));
    }

    #[test]
    fn buttons_carry_press_state() {
        let sink = RecordingSink::default();
        dispatch_input(
            &sink,
            &display(),
            &ChannelMessage::MouseDown {
                button: MouseButton::Right,
                x: 0.5,
                y: 0.5,
            },
        );
        dispatch_input(
            &sink,
            &display(),
            &ChannelMessage::MouseUp {
                button: MouseButton::Right,
                x: 0.5,
                y: 0.5,
            },
        );
        let calls = sink.calls.lock().unwrap();
        assert!(matches!(calls[0], Call::Button(MouseButton::Right, true, _, _)));
        assert!(matches!(calls[1], Call::Button(MouseButton::Right, false, _, _)));
    }

    #[test]
    fn keys_resolve_through_the_keymap() {
        let sink = RecordingSink::default();
        dispatch_input(
            &sink,
            &display(),
            &ChannelMessage::KeyDown {
                key_code: 0x41,
                modifiers: KeyModifiers::CTRL,
                scan_code: None,
                is_extended: None,
            },
        );
        let calls = sink.calls.lock().unwrap();
        assert_eq!(calls[0], Call::Key(0x1E, false, true));
    }

    #[test]
    fn unmapped_keys_are_dropped() {
        let sink = RecordingSink::default();
        dispatch_input(
            &sink,
            &display(),
            &ChannelMessage::KeyDown {
                key_code: 0x07,
                modifiers: KeyModifiers::empty(),
                scan_code: None,
                is_extended: None,
            },
        );
        assert!(sink.calls.lock().unwrap().is_empty());
    }
}
