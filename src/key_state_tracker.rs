//! Orphaned key-up detection
//!
//! A key-up with no observed key-down means the press was consumed elsewhere
//! (typically before the device was seized). Owners use the orphan to post a
//! compensating event so the downstream target does not see a stuck key.
//!
//! Only the first down of a key since [`KeyStateTracker::clear`] is recorded;
//! later down/up cycles never flag that key again.

use std::collections::BTreeSet;

use parking_lot::Mutex;

use crate::event::{EventType, MomentarySwitchEvent};
use crate::types::AbsoluteTime;

#[derive(Debug, Default)]
struct TrackerState {
    down_observed: BTreeSet<MomentarySwitchEvent>,
    orphans: BTreeSet<MomentarySwitchEvent>,
    last_time_stamp: Option<AbsoluteTime>,
}

#[derive(Debug, Default)]
pub struct KeyStateTracker {
    state: Mutex<TrackerState>,
}

impl KeyStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one event; updates older than the last accepted one are ignored
    pub fn update(&self, event: MomentarySwitchEvent, event_type: EventType, time_stamp: AbsoluteTime) {
        let mut state = self.state.lock();
        if state.last_time_stamp.is_some_and(|last| time_stamp < last) {
            return;
        }
        state.last_time_stamp = Some(time_stamp);

        match event_type {
            EventType::KeyDown => {
                state.down_observed.insert(event);
            }
            EventType::KeyUp => {
                if state.down_observed.contains(&event) {
                    state.orphans.remove(&event);
                } else {
                    state.orphans.insert(event);
                }
            }
            EventType::Single => {}
        }
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.down_observed.clear();
        state.orphans.clear();
        state.last_time_stamp = None;
    }

    /// The lowest orphaned key, if any
    pub fn find_orphan_key_up_event(&self) -> Option<MomentarySwitchEvent> {
        self.state.lock().orphans.first().copied()
    }
}
