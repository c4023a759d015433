//! Virtual-key to XT scancode mapping.
//!
//! Viewers send virtual-key codes (plus an optional scancode when the
//! client already knows it). The OS injection layer wants XT Set 1
//! scancodes with an `extended` flag for keys that carry the 0xE0
//! prefix in the PS/2 protocol; this module fills the gap for events
//! that arrive without a scancode.

/// Convert a virtual-key code to an XT Set 1 scancode.
///
/// Returns `(scan_code, extended)`, or `None` for unmapped keys.
#[must_use]
pub fn virtual_key_to_scancode(key_code: u16) -> Option<(u16, bool)> {
    #[allow(clippy::match_same_arms)]
    let mapped = match key_code {
        0x08 => (0x0E, false), // Backspace
        0x09 => (0x0F, false), // Tab
        0x0D => (0x1C, false), // Enter
        0x10 => (0x2A, false), // Shift (generic -> left)
        0x11 => (0x1D, false), // Ctrl (generic -> left)
        0x12 => (0x38, false), // Alt (generic -> left)
        0x13 => (0x46, true),  // Pause
        0x14 => (0x3A, false), // Caps Lock
        0x1B => (0x01, false), // Escape
        0x20 => (0x39, false), // Space
        0x21 => (0x49, true),  // Page Up
        0x22 => (0x51, true),  // Page Down
        0x23 => (0x4F, true),  // End
        0x24 => (0x47, true),  // Home
        0x25 => (0x4B, true),  // Left Arrow
        0x26 => (0x48, true),  // Up Arrow
        0x27 => (0x4D, true),  // Right Arrow
        0x28 => (0x50, true),  // Down Arrow
        0x2C => (0x37, true),  // Print Screen
        0x2D => (0x52, true),  // Insert
        0x2E => (0x53, true),  // Delete
        // Digits 0-9.
        0x30 => (0x0B, false),
        0x31 => (0x02, false),
        0x32 => (0x03, false),
        0x33 => (0x04, false),
        0x34 => (0x05, false),
        0x35 => (0x06, false),
        0x36 => (0x07, false),
        0x37 => (0x08, false),
        0x38 => (0x09, false),
        0x39 => (0x0A, false),
        // Letters A-Z.
        0x41 => (0x1E, false),
        0x42 => (0x30, false),
        0x43 => (0x2E, false),
        0x44 => (0x20, false),
        0x45 => (0x12, false),
        0x46 => (0x21, false),
        0x47 => (0x22, false),
        0x48 => (0x23, false),
        0x49 => (0x17, false),
        0x4A => (0x24, false),
        0x4B => (0x25, false),
        0x4C => (0x26, false),
        0x4D => (0x32, false),
        0x4E => (0x31, false),
        0x4F => (0x18, false),
        0x50 => (0x19, false),
        0x51 => (0x10, false),
        0x52 => (0x13, false),
        0x53 => (0x1F, false),
        0x54 => (0x14, false),
        0x55 => (0x16, false),
        0x56 => (0x2F, false),
        0x57 => (0x11, false),
        0x58 => (0x2D, false),
        0x59 => (0x15, false),
        0x5A => (0x2C, false),
        0x5B => (0x5B, true), // Left Win
        0x5C => (0x5C, true), // Right Win
        0x5D => (0x5D, true), // Menu
        // Keypad.
        0x60 => (0x52, false),
        0x61 => (0x4F, false),
        0x62 => (0x50, false),
        0x63 => (0x51, false),
        0x64 => (0x4B, false),
        0x65 => (0x4C, false),
        0x66 => (0x4D, false),
        0x67 => (0x47, false),
        0x68 => (0x48, false),
        0x69 => (0x49, false),
        0x6A => (0x37, false), // Keypad *
        0x6B => (0x4E, false), // Keypad +
        0x6D => (0x4A, false), // Keypad -
        0x6E => (0x53, false), // Keypad .
        0x6F => (0x35, true),  // Keypad /
        // Function row.
        0x70 => (0x3B, false),
        0x71 => (0x3C, false),
        0x72 => (0x3D, false),
        0x73 => (0x3E, false),
        0x74 => (0x3F, false),
        0x75 => (0x40, false),
        0x76 => (0x41, false),
        0x77 => (0x42, false),
        0x78 => (0x43, false),
        0x79 => (0x44, false),
        0x7A => (0x57, false), // F11
        0x7B => (0x58, false), // F12
        0x90 => (0x45, false), // Num Lock
        0x91 => (0x46, false), // Scroll Lock
        0xA0 => (0x2A, false), // Left Shift
        0xA1 => (0x36, false), // Right Shift
        0xA2 => (0x1D, false), // Left Ctrl
        0xA3 => (0x1D, true),  // Right Ctrl
        0xA4 => (0x38, false), // Left Alt
        0xA5 => (0x38, true),  // Right Alt
        0xBA => (0x27, false), // Semicolon
        0xBB => (0x0D, false), // Equal
        0xBC => (0x33, false), // Comma
        0xBD => (0x0C, false), // Minus
        0xBE => (0x34, false), // Period
        0xBF => (0x35, false), // Slash
        0xC0 => (0x29, false), // Grave
        0xDB => (0x1A, false), // Left Bracket
        0xDC => (0x2B, false), // Backslash
        0xDD => (0x1B, false), // Right Bracket
        0xDE => (0x28, false), // Apostrophe
        _ => return None,
    };
    Some(mapped)
}

/// Resolve the scancode for a key event: the client-provided scancode
/// wins, otherwise fall back to the virtual-key table.
#[must_use]
pub fn resolve_scancode(
    key_code: u16,
    scan_code: Option<u16>,
    is_extended: Option<bool>,
) -> Option<(u16, bool)> {
    if let Some(scan) = scan_code {
        return Some((scan, is_extended.unwrap_or(false)));
    }
    virtual_key_to_scancode(key_code)
}
