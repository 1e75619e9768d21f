//! Linux input event codes to HID usage pairs
//!
//! Element cookies encode the evdev event type and code as
//! `(type << 16) | code`, so a value read from the node maps straight back
//! to its element.

use hidseize::{usage, usage_page, ElementCookie, Usage, UsagePair};

pub const EV_KEY: u16 = 0x01;
pub const EV_REL: u16 = 0x02;
pub const EV_LED: u16 = 0x11;

pub const REL_X: u16 = 0x00;
pub const REL_Y: u16 = 0x01;
pub const REL_HWHEEL: u16 = 0x06;
pub const REL_WHEEL: u16 = 0x08;

pub const LED_NUML: u16 = 0x00;
pub const LED_CAPSL: u16 = 0x01;
pub const LED_SCROLLL: u16 = 0x02;

pub const BTN_LEFT: u16 = 0x110;
const BTN_TASK: u16 = 0x117;

/// (Linux KEY_* code, keyboard page usage)
const KEYBOARD: &[(u16, u32)] = &[
    (1, 0x29),   // ESC
    (2, 0x1E),   // 1
    (3, 0x1F),   // 2
    (4, 0x20),   // 3
    (5, 0x21),   // 4
    (6, 0x22),   // 5
    (7, 0x23),   // 6
    (8, 0x24),   // 7
    (9, 0x25),   // 8
    (10, 0x26),  // 9
    (11, 0x27),  // 0
    (12, 0x2D),  // MINUS
    (13, 0x2E),  // EQUAL
    (14, 0x2A),  // BACKSPACE
    (15, 0x2B),  // TAB
    (16, 0x14),  // Q
    (17, 0x1A),  // W
    (18, 0x08),  // E
    (19, 0x15),  // R
    (20, 0x17),  // T
    (21, 0x1C),  // Y
    (22, 0x18),  // U
    (23, 0x0C),  // I
    (24, 0x12),  // O
    (25, 0x13),  // P
    (26, 0x2F),  // LEFTBRACE
    (27, 0x30),  // RIGHTBRACE
    (28, 0x28),  // ENTER
    (29, 0xE0),  // LEFTCTRL
    (30, 0x04),  // A
    (31, 0x16),  // S
    (32, 0x07),  // D
    (33, 0x09),  // F
    (34, 0x0A),  // G
    (35, 0x0B),  // H
    (36, 0x0D),  // J
    (37, 0x0E),  // K
    (38, 0x0F),  // L
    (39, 0x33),  // SEMICOLON
    (40, 0x34),  // APOSTROPHE
    (41, 0x35),  // GRAVE
    (42, 0xE1),  // LEFTSHIFT
    (43, 0x31),  // BACKSLASH
    (44, 0x1D),  // Z
    (45, 0x1B),  // X
    (46, 0x06),  // C
    (47, 0x19),  // V
    (48, 0x05),  // B
    (49, 0x11),  // N
    (50, 0x10),  // M
    (51, 0x36),  // COMMA
    (52, 0x37),  // DOT
    (53, 0x38),  // SLASH
    (54, 0xE5),  // RIGHTSHIFT
    (55, 0x55),  // KPASTERISK
    (56, 0xE2),  // LEFTALT
    (57, 0x2C),  // SPACE
    (58, 0x39),  // CAPSLOCK
    (59, 0x3A),  // F1
    (60, 0x3B),  // F2
    (61, 0x3C),  // F3
    (62, 0x3D),  // F4
    (63, 0x3E),  // F5
    (64, 0x3F),  // F6
    (65, 0x40),  // F7
    (66, 0x41),  // F8
    (67, 0x42),  // F9
    (68, 0x43),  // F10
    (69, 0x53),  // NUMLOCK
    (70, 0x47),  // SCROLLLOCK
    (71, 0x5F),  // KP7
    (72, 0x60),  // KP8
    (73, 0x61),  // KP9
    (74, 0x56),  // KPMINUS
    (75, 0x5C),  // KP4
    (76, 0x5D),  // KP5
    (77, 0x5E),  // KP6
    (78, 0x57),  // KPPLUS
    (79, 0x59),  // KP1
    (80, 0x5A),  // KP2
    (81, 0x5B),  // KP3
    (82, 0x62),  // KP0
    (83, 0x63),  // KPDOT
    (85, 0x94),  // ZENKAKUHANKAKU
    (86, 0x64),  // 102ND
    (87, 0x44),  // F11
    (88, 0x45),  // F12
    (89, 0x87),  // RO
    (90, 0x92),  // KATAKANA
    (91, 0x93),  // HIRAGANA
    (92, 0x8A),  // HENKAN
    (93, 0x88),  // KATAKANAHIRAGANA
    (94, 0x8B),  // MUHENKAN
    (95, 0x8C),  // KPJPCOMMA
    (96, 0x58),  // KPENTER
    (97, 0xE4),  // RIGHTCTRL
    (98, 0x54),  // KPSLASH
    (99, 0x46),  // SYSRQ
    (100, 0xE6), // RIGHTALT
    (102, 0x4A), // HOME
    (103, 0x52), // UP
    (104, 0x4B), // PAGEUP
    (105, 0x50), // LEFT
    (106, 0x4F), // RIGHT
    (107, 0x4D), // END
    (108, 0x51), // DOWN
    (109, 0x4E), // PAGEDOWN
    (110, 0x49), // INSERT
    (111, 0x4C), // DELETE
    (117, 0x67), // KPEQUAL
    (119, 0x48), // PAUSE
    (121, 0x85), // KPCOMMA
    (122, 0x90), // HANGEUL
    (123, 0x91), // HANJA
    (124, 0x89), // YEN
    (125, 0xE3), // LEFTMETA
    (126, 0xE7), // RIGHTMETA
    (127, 0x65), // COMPOSE
    (183, 0x68), // F13
    (184, 0x69), // F14
    (185, 0x6A), // F15
    (186, 0x6B), // F16
    (187, 0x6C), // F17
    (188, 0x6D), // F18
    (189, 0x6E), // F19
    (190, 0x6F), // F20
    (191, 0x70), // F21
    (192, 0x71), // F22
    (193, 0x72), // F23
    (194, 0x73), // F24
];

/// (Linux KEY_* code, consumer page usage)
const CONSUMER: &[(u16, u32)] = &[
    (113, 0xE2), // MUTE
    (114, 0xEA), // VOLUMEDOWN
    (115, 0xE9), // VOLUMEUP
    (116, 0x30), // POWER
    (161, 0xB8), // EJECTCD
    (163, 0xB5), // NEXTSONG
    (164, 0xCD), // PLAYPAUSE
    (165, 0xB6), // PREVIOUSSONG
    (166, 0xB7), // STOPCD
    (168, 0xB4), // REWIND
    (208, 0xB3), // FASTFORWARD
    (224, 0x70), // BRIGHTNESSDOWN
    (225, 0x6F), // BRIGHTNESSUP
];

pub fn cookie(ev_type: u16, code: u16) -> ElementCookie {
    ElementCookie((u32::from(ev_type) << 16) | u32::from(code))
}

/// Inverse of [`cookie`]
pub fn split_cookie(cookie: ElementCookie) -> (u16, u16) {
    ((cookie.0 >> 16) as u16, (cookie.0 & 0xFFFF) as u16)
}

/// Usage for an `EV_KEY` code: keyboard key, consumer key or button
pub fn key_usage(code: u16) -> Option<UsagePair> {
    if (BTN_LEFT..=BTN_TASK).contains(&code) {
        let button = u32::from(code - BTN_LEFT) + 1;
        return Some(UsagePair::new(usage_page::BUTTON, Usage(button)));
    }
    if let Some(&(_, u)) = KEYBOARD.iter().find(|(c, _)| *c == code) {
        return Some(UsagePair::new(usage_page::KEYBOARD_OR_KEYPAD, Usage(u)));
    }
    CONSUMER
        .iter()
        .find(|(c, _)| *c == code)
        .map(|&(_, u)| UsagePair::new(usage_page::CONSUMER, Usage(u)))
}

pub fn relative_usage(code: u16) -> Option<UsagePair> {
    let pair = match code {
        REL_X => UsagePair::new(usage_page::GENERIC_DESKTOP, usage::generic_desktop::X),
        REL_Y => UsagePair::new(usage_page::GENERIC_DESKTOP, usage::generic_desktop::Y),
        REL_WHEEL => UsagePair::new(usage_page::GENERIC_DESKTOP, usage::generic_desktop::WHEEL),
        REL_HWHEEL => UsagePair::new(usage_page::CONSUMER, usage::consumer::AC_PAN),
        _ => return None,
    };
    Some(pair)
}

pub fn led_usage(code: u16) -> Option<UsagePair> {
    let led = match code {
        LED_NUML => usage::led::NUM_LOCK,
        LED_CAPSL => usage::led::CAPS_LOCK,
        LED_SCROLLL => usage::led::SCROLL_LOCK,
        _ => return None,
    };
    Some(UsagePair::new(usage_page::LEDS, led))
}

/// Transport name for a `BUS_*` id, as reported in device properties
pub fn transport_name(bus_type: u16) -> Option<&'static str> {
    match bus_type {
        0x01 => Some("PCI"),
        0x03 => Some("USB"),
        0x05 => Some("Bluetooth"),
        0x06 => Some("Virtual"),
        0x11 => Some("i8042"),
        0x18 => Some("I2C"),
        0x19 => Some("Host"),
        0x1C => Some("SPI"),
        _ => None,
    }
}
