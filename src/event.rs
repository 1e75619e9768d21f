//! Typed events and the raw-value decoder
//!
//! A drain cycle turns the handle's buffered [`HidValue`]s into one
//! [`EventQueue`]: momentary switches (keys, consumer keys, buttons) become
//! down/up entries, pointing axes are joined into a single motion entry, and
//! a release marker is appended after the up event that leaves nothing held.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::config::PointingMotionConfig;
use crate::platform::{HidElement, HidValue};
use crate::types::{
    usage, usage_page, AbsoluteTime, DeviceId, ElementCookie, Usage, UsagePage, UsagePair,
};

/// Largest magnitude of one decoded motion component
const POINTING_MOTION_LIMIT: i32 = 127;

// =============================================================================
// Event model
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyCode(pub u32);

impl KeyCode {
    /// The modifier this key sets, if it is one of the eight modifier keys
    pub fn modifier_flag(self) -> Option<ModifierFlag> {
        let flag = match self.0 {
            0xE0 => ModifierFlag::LeftControl,
            0xE1 => ModifierFlag::LeftShift,
            0xE2 => ModifierFlag::LeftOption,
            0xE3 => ModifierFlag::LeftCommand,
            0xE4 => ModifierFlag::RightControl,
            0xE5 => ModifierFlag::RightShift,
            0xE6 => ModifierFlag::RightOption,
            0xE7 => ModifierFlag::RightCommand,
            _ => return None,
        };
        Some(flag)
    }
}

/// Keyboard modifier, one per modifier key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ModifierFlag {
    LeftControl,
    LeftShift,
    LeftOption,
    LeftCommand,
    RightControl,
    RightShift,
    RightOption,
    RightCommand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConsumerKeyCode(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PointingButton(pub u32);

/// Relative pointer movement, one report's worth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PointingMotion {
    pub x: i32,
    pub y: i32,
    pub vertical_wheel: i32,
    pub horizontal_wheel: i32,
}

/// A usage pair that behaves like a key: pressed while non-zero
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MomentarySwitchEvent(UsagePair);

impl MomentarySwitchEvent {
    /// `None` unless the pair is a keyboard key, consumer key or button
    pub fn new(pair: UsagePair) -> Option<Self> {
        if is_key_code(pair) || is_consumer_key_code(pair) || is_pointing_button(pair) {
            Some(Self(pair))
        } else {
            None
        }
    }

    pub fn usage_pair(&self) -> UsagePair {
        self.0
    }

    pub fn to_event(self) -> Event {
        let code = self.0.usage.0;
        if is_key_code(self.0) {
            Event::KeyCode(KeyCode(code))
        } else if is_consumer_key_code(self.0) {
            Event::ConsumerKeyCode(ConsumerKeyCode(code))
        } else {
            Event::PointingButton(PointingButton(code))
        }
    }
}

fn is_key_code(pair: UsagePair) -> bool {
    pair.usage_page == usage_page::KEYBOARD_OR_KEYPAD && (0x04..=0xE7).contains(&pair.usage.0)
}

fn is_consumer_key_code(pair: UsagePair) -> bool {
    // ac_pan is a wheel, not a key.
    pair.usage_page == usage_page::CONSUMER
        && matches!(
            pair.usage.0,
            0x30 | 0x40..=0x48
                | 0x60..=0x70
                | 0xB3..=0xB8
                | 0xCD
                | 0xCF
                | 0xE2
                | 0xE5
                | 0xE7
                | 0xE9
                | 0xEA
                | 0x152
                | 0x153
                | 0x183..=0x1BA
                | 0x1BC..=0x1CB
                | 0x221
                | 0x223..=0x225
                | 0x227
                | 0x22A
                | 0x22D
                | 0x22E
        )
}

fn is_pointing_button(pair: UsagePair) -> bool {
    pair.usage_page == usage_page::BUTTON && pair.usage != usage::UNDEFINED
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    KeyCode(KeyCode),
    ConsumerKeyCode(ConsumerKeyCode),
    PointingButton(PointingButton),
    PointingMotion(PointingMotion),
    /// Echo of the caps lock LED element
    CapsLockStateChanged(bool),
    /// Every key and button on the device has been released
    DeviceKeysAndPointingButtonsAreReleased,
    #[default]
    None,
}

impl Event {
    pub fn momentary_switch(&self) -> Option<MomentarySwitchEvent> {
        let pair = match *self {
            Event::KeyCode(KeyCode(code)) => {
                UsagePair::new(usage_page::KEYBOARD_OR_KEYPAD, Usage(code))
            }
            Event::ConsumerKeyCode(ConsumerKeyCode(code)) => {
                UsagePair::new(usage_page::CONSUMER, Usage(code))
            }
            Event::PointingButton(PointingButton(code)) => {
                UsagePair::new(usage_page::BUTTON, Usage(code))
            }
            _ => return None,
        };
        MomentarySwitchEvent::new(pair)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    KeyDown,
    KeyUp,
    Single,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub device_id: DeviceId,
    pub time_stamp: AbsoluteTime,
    pub event: Event,
    pub event_type: EventType,
}

/// One drain cycle's worth of decoded entries
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventQueue {
    entries: Vec<Entry>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: Entry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }
}

impl IntoIterator for EventQueue {
    type Item = Entry;
    type IntoIter = std::vec::IntoIter<Entry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a EventQueue {
    type Item = &'a Entry;
    type IntoIter = std::slice::Iter<'a, Entry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

// =============================================================================
// Element table
// =============================================================================

/// Per-device element lookup, built once when the handle is created
#[derive(Debug, Clone, Default)]
pub struct ElementTable {
    by_cookie: HashMap<ElementCookie, HidElement>,
}

impl ElementTable {
    pub fn new(elements: impl IntoIterator<Item = HidElement>) -> Self {
        Self {
            by_cookie: elements.into_iter().map(|e| (e.cookie, e)).collect(),
        }
    }

    pub fn get(&self, cookie: ElementCookie) -> Option<&HidElement> {
        self.by_cookie.get(&cookie)
    }

    /// First element with the given usage, lowest cookie first
    pub fn find(&self, usage_page: UsagePage, usage: Usage) -> Option<&HidElement> {
        self.by_cookie
            .values()
            .filter(|e| e.usage_page == usage_page && e.usage == usage)
            .min_by_key(|e| e.cookie)
    }

    pub fn len(&self) -> usize {
        self.by_cookie.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_cookie.is_empty()
    }
}

// =============================================================================
// Decoding
// =============================================================================

fn adjust_pointing_motion_value(value: i64, multiplier: f64) -> i32 {
    let limit = POINTING_MOTION_LIMIT as f64;
    let scaled = (value as f64 * multiplier).trunc().clamp(-limit, limit) as i32;
    if scaled == 0 {
        return value.signum() as i32;
    }
    scaled
}

#[derive(Clone, Copy)]
enum Axis {
    X,
    Y,
    VerticalWheel,
    HorizontalWheel,
}

#[derive(Default)]
struct PendingMotion {
    time_stamp: Option<AbsoluteTime>,
    x: Option<i32>,
    y: Option<i32>,
    vertical_wheel: Option<i32>,
    horizontal_wheel: Option<i32>,
}

impl PendingMotion {
    fn slot(&mut self, axis: Axis) -> &mut Option<i32> {
        match axis {
            Axis::X => &mut self.x,
            Axis::Y => &mut self.y,
            Axis::VerticalWheel => &mut self.vertical_wheel,
            Axis::HorizontalWheel => &mut self.horizontal_wheel,
        }
    }

    fn take(&mut self) -> Option<(AbsoluteTime, PointingMotion)> {
        let pending = std::mem::take(self);
        let time_stamp = pending.time_stamp?;
        Some((
            time_stamp,
            PointingMotion {
                x: pending.x.unwrap_or(0),
                y: pending.y.unwrap_or(0),
                vertical_wheel: pending.vertical_wheel.unwrap_or(0),
                horizontal_wheel: pending.horizontal_wheel.unwrap_or(0),
            },
        ))
    }
}

struct QueueBuilder {
    device_id: DeviceId,
    last_time_stamp: AbsoluteTime,
    queue: EventQueue,
    motion: PendingMotion,
}

impl QueueBuilder {
    fn push(&mut self, time_stamp: AbsoluteTime, event: Event, event_type: EventType) {
        let time_stamp = time_stamp.max(self.last_time_stamp);
        self.last_time_stamp = time_stamp;
        self.queue.push(Entry {
            device_id: self.device_id,
            time_stamp,
            event,
            event_type,
        });
    }

    fn flush_motion(&mut self) {
        if let Some((time_stamp, motion)) = self.motion.take() {
            self.push(time_stamp, Event::PointingMotion(motion), EventType::Single);
        }
    }

    /// Store one axis value, flushing first if that axis is already set
    fn set_axis(&mut self, time_stamp: AbsoluteTime, axis: Axis, value: i32) {
        if self.motion.slot(axis).is_some() {
            self.flush_motion();
        }
        self.motion.time_stamp = Some(time_stamp);
        *self.motion.slot(axis) = Some(value);
    }
}

/// Decode raw values into entries, in arrival order
///
/// Values whose cookie is unknown or whose usage this core does not
/// interpret produce no entry. Entry timestamps never decrease.
pub fn make_queue(
    device_id: DeviceId,
    elements: &ElementTable,
    values: &[HidValue],
    motion: &PointingMotionConfig,
) -> EventQueue {
    let mut builder = QueueBuilder {
        device_id,
        last_time_stamp: AbsoluteTime::default(),
        queue: EventQueue::new(),
        motion: PendingMotion::default(),
    };

    for value in values {
        let Some(element) = elements.get(value.cookie) else {
            continue;
        };
        let pair = element.usage_pair();
        let ts = value.time_stamp;

        if let Some(switch) = MomentarySwitchEvent::new(pair) {
            builder.flush_motion();
            let event_type = if value.integer_value != 0 {
                EventType::KeyDown
            } else {
                EventType::KeyUp
            };
            builder.push(ts, switch.to_event(), event_type);
        } else if pair == UsagePair::new(usage_page::GENERIC_DESKTOP, usage::generic_desktop::X) {
            let v = adjust_pointing_motion_value(value.integer_value, motion.xy_multiplier);
            builder.set_axis(ts, Axis::X, v);
        } else if pair == UsagePair::new(usage_page::GENERIC_DESKTOP, usage::generic_desktop::Y) {
            let v = adjust_pointing_motion_value(value.integer_value, motion.xy_multiplier);
            builder.set_axis(ts, Axis::Y, v);
        } else if pair
            == UsagePair::new(usage_page::GENERIC_DESKTOP, usage::generic_desktop::WHEEL)
        {
            let v = adjust_pointing_motion_value(value.integer_value, motion.wheels_multiplier);
            builder.set_axis(ts, Axis::VerticalWheel, v);
        } else if pair == UsagePair::new(usage_page::CONSUMER, usage::consumer::AC_PAN) {
            let v = adjust_pointing_motion_value(value.integer_value, motion.wheels_multiplier);
            builder.set_axis(ts, Axis::HorizontalWheel, v);
        } else if pair == UsagePair::new(usage_page::LEDS, usage::led::CAPS_LOCK) {
            builder.flush_motion();
            builder.push(
                ts,
                Event::CapsLockStateChanged(value.integer_value != 0),
                EventType::Single,
            );
        }
    }

    builder.flush_motion();
    builder.queue
}

/// Keys and buttons currently held on one device
#[derive(Debug, Clone, Default)]
pub struct PressedKeys {
    pressed: BTreeSet<MomentarySwitchEvent>,
}

impl PressedKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.pressed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pressed.len()
    }

    pub fn clear(&mut self) {
        self.pressed.clear();
    }

    /// Copy `queue`, appending a release marker after each up event that
    /// empties the held set
    ///
    /// An up event for a key that is not held never produces a marker, so
    /// at most one marker follows each transition to fully released.
    pub fn insert_released_markers(&mut self, queue: EventQueue) -> EventQueue {
        let mut result = EventQueue::new();
        for entry in queue {
            result.push(entry);

            let Some(switch) = entry.event.momentary_switch() else {
                continue;
            };
            match entry.event_type {
                EventType::KeyDown => {
                    self.pressed.insert(switch);
                }
                EventType::KeyUp => {
                    if self.pressed.remove(&switch) && self.pressed.is_empty() {
                        result.push(Entry {
                            device_id: entry.device_id,
                            time_stamp: entry.time_stamp,
                            event: Event::DeviceKeysAndPointingButtonsAreReleased,
                            event_type: EventType::Single,
                        });
                    }
                }
                EventType::Single => {}
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_A: ElementCookie = ElementCookie(1);
    const KEY_B: ElementCookie = ElementCookie(2);
    const BUTTON_1: ElementCookie = ElementCookie(3);
    const X: ElementCookie = ElementCookie(4);
    const Y: ElementCookie = ElementCookie(5);
    const WHEEL: ElementCookie = ElementCookie(6);
    const PAN: ElementCookie = ElementCookie(7);
    const CAPS_LED: ElementCookie = ElementCookie(8);
    const MUTE: ElementCookie = ElementCookie(9);

    fn element(cookie: ElementCookie, page: UsagePage, usage: u32) -> HidElement {
        HidElement {
            cookie,
            usage_page: page,
            usage: Usage(usage),
            logical_min: 0,
            logical_max: 1,
        }
    }

    fn table() -> ElementTable {
        ElementTable::new([
            element(KEY_A, usage_page::KEYBOARD_OR_KEYPAD, 0x04),
            element(KEY_B, usage_page::KEYBOARD_OR_KEYPAD, 0x05),
            element(BUTTON_1, usage_page::BUTTON, 1),
            element(X, usage_page::GENERIC_DESKTOP, 0x30),
            element(Y, usage_page::GENERIC_DESKTOP, 0x31),
            element(WHEEL, usage_page::GENERIC_DESKTOP, 0x38),
            element(PAN, usage_page::CONSUMER, 0x238),
            element(CAPS_LED, usage_page::LEDS, 0x02),
            element(MUTE, usage_page::CONSUMER, 0xE2),
        ])
    }

    fn value(t: u64, cookie: ElementCookie, v: i64) -> HidValue {
        HidValue {
            time_stamp: AbsoluteTime(t),
            cookie,
            integer_value: v,
        }
    }

    fn decode(values: &[HidValue]) -> EventQueue {
        make_queue(
            DeviceId(1),
            &table(),
            values,
            &PointingMotionConfig::default(),
        )
    }

    fn events(queue: &EventQueue) -> Vec<(Event, EventType)> {
        queue.iter().map(|e| (e.event, e.event_type)).collect()
    }

    #[test]
    fn test_momentary_switches() {
        let queue = decode(&[
            value(1, KEY_A, 1),
            value(2, MUTE, 1),
            value(3, BUTTON_1, 1),
            value(4, KEY_A, 0),
        ]);
        assert_eq!(
            events(&queue),
            vec![
                (Event::KeyCode(KeyCode(0x04)), EventType::KeyDown),
                (Event::ConsumerKeyCode(ConsumerKeyCode(0xE2)), EventType::KeyDown),
                (Event::PointingButton(PointingButton(1)), EventType::KeyDown),
                (Event::KeyCode(KeyCode(0x04)), EventType::KeyUp),
            ]
        );
    }

    #[test]
    fn test_unknown_cookie_is_skipped() {
        let queue = decode(&[value(1, ElementCookie(99), 1)]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_motion_axes_are_joined() {
        let queue = decode(&[
            value(1, X, 5),
            value(1, Y, -3),
            value(1, WHEEL, 1),
            value(1, PAN, -1),
        ]);
        assert_eq!(
            events(&queue),
            vec![(
                Event::PointingMotion(PointingMotion {
                    x: 5,
                    y: -3,
                    vertical_wheel: 1,
                    horizontal_wheel: -1,
                }),
                EventType::Single
            )]
        );
    }

    #[test]
    fn test_repeated_axis_flushes_motion() {
        let queue = decode(&[value(1, X, 1), value(2, X, 2), value(2, Y, 4)]);
        assert_eq!(
            events(&queue),
            vec![
                (
                    Event::PointingMotion(PointingMotion {
                        x: 1,
                        ..Default::default()
                    }),
                    EventType::Single
                ),
                (
                    Event::PointingMotion(PointingMotion {
                        x: 2,
                        y: 4,
                        ..Default::default()
                    }),
                    EventType::Single
                ),
            ]
        );
    }

    #[test]
    fn test_motion_flushed_before_button() {
        let queue = decode(&[value(1, X, 1), value(2, BUTTON_1, 1)]);
        assert!(matches!(queue.entries()[0].event, Event::PointingMotion(_)));
        assert_eq!(
            queue.entries()[1].event,
            Event::PointingButton(PointingButton(1))
        );
    }

    #[test]
    fn test_adjust_pointing_motion_value() {
        assert_eq!(adjust_pointing_motion_value(10, 1.0), 10);
        assert_eq!(adjust_pointing_motion_value(500, 1.0), 127);
        assert_eq!(adjust_pointing_motion_value(-500, 1.0), -127);
        assert_eq!(adjust_pointing_motion_value(3, 0.1), 1);
        assert_eq!(adjust_pointing_motion_value(-3, 0.1), -1);
        assert_eq!(adjust_pointing_motion_value(0, 2.0), 0);
        assert_eq!(adjust_pointing_motion_value(10, 1.5), 15);
    }

    #[test]
    fn test_timestamps_never_decrease() {
        let queue = decode(&[value(10, KEY_A, 1), value(5, KEY_B, 1), value(7, KEY_A, 0)]);
        let stamps: Vec<u64> = queue.iter().map(|e| e.time_stamp.0).collect();
        assert_eq!(stamps, vec![10, 10, 10]);
    }

    #[test]
    fn test_caps_lock_led_echo() {
        let queue = decode(&[value(1, CAPS_LED, 1)]);
        assert_eq!(
            events(&queue),
            vec![(Event::CapsLockStateChanged(true), EventType::Single)]
        );
    }

    #[test]
    fn test_release_marker_after_last_up() {
        let mut pressed = PressedKeys::new();
        let queue = pressed.insert_released_markers(decode(&[
            value(1, KEY_A, 1),
            value(2, KEY_B, 1),
            value(3, KEY_A, 0),
        ]));
        assert!(!queue
            .iter()
            .any(|e| e.event == Event::DeviceKeysAndPointingButtonsAreReleased));

        let queue = pressed.insert_released_markers(decode(&[value(4, KEY_B, 0)]));
        assert_eq!(
            events(&queue),
            vec![
                (Event::KeyCode(KeyCode(0x05)), EventType::KeyUp),
                (Event::DeviceKeysAndPointingButtonsAreReleased, EventType::Single),
            ]
        );
        assert_eq!(queue.entries()[1].time_stamp, AbsoluteTime(4));
        assert!(pressed.is_empty());
    }

    #[test]
    fn test_no_marker_for_unheld_key_up() {
        let mut pressed = PressedKeys::new();
        let queue = pressed.insert_released_markers(decode(&[value(1, KEY_A, 0)]));
        assert_eq!(queue.len(), 1);

        let queue = pressed.insert_released_markers(decode(&[
            value(2, BUTTON_1, 1),
            value(3, KEY_A, 0),
            value(4, BUTTON_1, 0),
            value(5, BUTTON_1, 0),
        ]));
        let markers = queue
            .iter()
            .filter(|e| e.event == Event::DeviceKeysAndPointingButtonsAreReleased)
            .count();
        assert_eq!(markers, 1);
        assert_eq!(
            queue.entries()[3].event,
            Event::DeviceKeysAndPointingButtonsAreReleased
        );
    }

    #[test]
    fn test_momentary_switch_targets() {
        let pan = UsagePair::new(usage_page::CONSUMER, usage::consumer::AC_PAN);
        assert!(MomentarySwitchEvent::new(pan).is_none());
        let undefined_button = UsagePair::new(usage_page::BUTTON, usage::UNDEFINED);
        assert!(MomentarySwitchEvent::new(undefined_button).is_none());
        let play = UsagePair::new(usage_page::CONSUMER, Usage(0xCD));
        assert!(MomentarySwitchEvent::new(play).is_some());
    }

    #[test]
    fn test_modifier_flags() {
        assert_eq!(KeyCode(0xE0).modifier_flag(), Some(ModifierFlag::LeftControl));
        assert_eq!(KeyCode(0xE1).modifier_flag(), Some(ModifierFlag::LeftShift));
        assert_eq!(KeyCode(0xE7).modifier_flag(), Some(ModifierFlag::RightCommand));
        assert_eq!(KeyCode(0x04).modifier_flag(), None);
        assert_eq!(KeyCode(0xE8).modifier_flag(), None);
    }
}
