//! PS/2 keyboard scan-code translation.
//!
//! The IRQ1 handler feeds raw set-1 scan codes into [`handle_scancode`],
//! which tracks modifier state and emits KeyDown/KeyUp events into the
//! shared input ring.

use crate::input_events::{push_event, InputEvent};
use spin::Mutex;

/// Set-1 scan code to ASCII, unshifted. 0 = no printable mapping.
static SCANCODE_MAP: [u8; 128] = [
    0, 27, b'1', b'2', b'3', b'4', b'5', b'6', b'7', b'8', b'9', b'0', b'-', b'=', 8, b'\t',
    b'q', b'w', b'e', b'r', b't', b'y', b'u', b'i', b'o', b'p', b'[', b']', b'\n', 0, b'a', b's',
    b'd', b'f', b'g', b'h', b'j', b'k', b'l', b';', b'\'', b'`', 0, b'\\', b'z', b'x', b'c', b'v',
    b'b', b'n', b'm', b',', b'.', b'/', 0, b'*', 0, b' ', 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, b'7', b'8', b'9', b'-', b'4', b'5', b'6', b'+', b'1',
    b'2', b'3', b'0', b'.', 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
];

/// Shifted variants for the printable range.
static SCANCODE_MAP_SHIFT: [u8; 128] = [
    0, 27, b'!', b'@', b'#', b'$', b'%', b'^', b'&', b'*', b'(', b')', b'_', b'+', 8, b'\t',
    b'Q', b'W', b'E', b'R', b'T', b'Y', b'U', b'I', b'O', b'P', b'{', b'}', b'\n', 0, b'A', b'S',
    b'D', b'F', b'G', b'H', b'J', b'K', b'L', b':', b'"', b'~', 0, b'|', b'Z', b'X', b'C', b'V',
    b'B', b'N', b'M', b'<', b'>', b'?', 0, b'*', 0, b' ', 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, b'7', b'8', b'9', b'-', b'4', b'5', b'6', b'+', b'1',
    b'2', b'3', b'0', b'.', 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
];

const SC_LSHIFT: u8 = 0x2A;
const SC_RSHIFT: u8 = 0x36;
const SC_CAPS_LOCK: u8 = 0x3A;
const RELEASE_BIT: u8 = 0x80;

struct KeyboardState {
    shift: bool,
    caps_lock: bool,
}

static STATE: Mutex<KeyboardState> = Mutex::new(KeyboardState {
    shift: false,
    caps_lock: false,
});

fn translate(scancode: u8, shift: bool, caps_lock: bool) -> u8 {
    let code = (scancode & !RELEASE_BIT) as usize;
    let ascii = if shift {
        SCANCODE_MAP_SHIFT[code]
    } else {
        SCANCODE_MAP[code]
    };
    // Caps lock only inverts the letter range.
    if caps_lock && ascii.is_ascii_alphabetic() {
        ascii ^ 0x20
    } else {
        ascii
    }
}

/// Process one raw scan code from the controller.
///
/// Modifier keys update internal state without emitting events; everything
/// else becomes a KeyDown/KeyUp event on the input ring.
pub fn handle_scancode(scancode: u8) {
    let mut state = STATE.lock();
    let released = scancode & RELEASE_BIT != 0;
    let code = scancode & !RELEASE_BIT;

    match code {
        SC_LSHIFT | SC_RSHIFT => {
            state.shift = !released;
            return;
        }
        SC_CAPS_LOCK => {
            if !released {
                state.caps_lock = !state.caps_lock;
            }
            return;
        }
        _ => {}
    }

    let ascii = translate(code, state.shift, state.caps_lock);
    drop(state);

    if released {
        push_event(InputEvent::key_up(ascii, code));
    } else {
        push_event(InputEvent::key_down(ascii, code));
    }
}
