//! Which key, if any, the OS would be auto-repeating now
//!
//! Only the most recent non-modifier key repeats. Pressing another key takes
//! over; releasing the repeating key stops it. Releasing a different key
//! leaves the repeat running.

use crate::event::{Event, EventType};

#[derive(Debug, Default, Clone)]
pub struct KeyboardRepeatDetector {
    repeating: Option<Event>,
}

impl KeyboardRepeatDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one decoded event; anything but a key or consumer key is ignored
    pub fn update(&mut self, event: Event, event_type: EventType) {
        match event {
            Event::KeyCode(key) if key.modifier_flag().is_some() => return,
            Event::KeyCode(_) | Event::ConsumerKeyCode(_) => {}
            _ => return,
        }

        match event_type {
            EventType::KeyDown => self.repeating = Some(event),
            EventType::KeyUp => {
                if self.repeating == Some(event) {
                    self.repeating = None;
                }
            }
            EventType::Single => {}
        }
    }

    pub fn is_repeating(&self) -> bool {
        self.repeating.is_some()
    }

    pub fn repeating_event(&self) -> Option<Event> {
        self.repeating
    }

    pub fn clear(&mut self) {
        self.repeating = None;
    }
}
