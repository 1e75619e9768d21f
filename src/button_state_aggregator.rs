//! Pointing-button state merged across sources
//!
//! Several devices (or several remapping rules) may hold the same button
//! down at once. Each assertion is kept as its own record; a release cancels
//! exactly one outstanding press, so the button stays down until every
//! source has let go.

use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::{usage, usage_page, DeviceId, Usage, UsagePair};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    Increase,
    Decrease,
}

impl Polarity {
    fn weight(self) -> i64 {
        match self {
            Polarity::Increase => 1,
            Polarity::Decrease => -1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActivePointingButton {
    pub polarity: Polarity,
    pub usage_pair: UsagePair,
    pub device_id: DeviceId,
}

impl ActivePointingButton {
    pub fn new(polarity: Polarity, usage_pair: UsagePair, device_id: DeviceId) -> Self {
        Self {
            polarity,
            usage_pair,
            device_id,
        }
    }
}

/// Pressed state of buttons 1..=32, bit `n - 1` for button `n`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Buttons(u32);

impl Buttons {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Buttons outside 1..=32 are ignored
    pub fn insert(&mut self, button: u32) {
        if (1..=32).contains(&button) {
            self.0 |= 1u32 << (button - 1);
        }
    }

    pub fn contains(&self, button: u32) -> bool {
        (1..=32).contains(&button) && self.0 & (1u32 << (button - 1)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Buttons {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

#[derive(Debug, Default)]
pub struct ButtonStateAggregator {
    records: Mutex<Vec<ActivePointingButton>>,
}

impl ButtonStateAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one press, or cancel the oldest matching press
    ///
    /// A release with nothing to cancel is dropped, so the aggregate can
    /// never go negative.
    pub fn push_back(&self, record: ActivePointingButton) {
        if record.usage_pair.usage == usage::UNDEFINED {
            return;
        }

        let mut records = self.records.lock();
        match record.polarity {
            Polarity::Increase => records.push(record),
            Polarity::Decrease => {
                if let Some(index) = records.iter().position(|r| {
                    r.polarity == Polarity::Increase && r.usage_pair == record.usage_pair
                }) {
                    records.remove(index);
                }
            }
        }
    }

    /// Drop every record contributed by `device_id`
    pub fn erase_all(&self, device_id: DeviceId) {
        self.records.lock().retain(|r| r.device_id != device_id);
    }

    /// Same as [`erase_all`](Self::erase_all); pointing buttons carry no
    /// lock state to preserve
    pub fn erase_all_except_lock(&self, device_id: DeviceId) {
        self.erase_all(device_id);
    }

    pub fn reset(&self) {
        self.records.lock().clear();
    }

    pub fn is_pressed(&self, usage_pair: UsagePair) -> bool {
        let sum: i64 = self
            .records
            .lock()
            .iter()
            .filter(|r| r.usage_pair == usage_pair)
            .map(|r| r.polarity.weight())
            .sum();
        sum > 0
    }

    /// Bitset of the standard buttons currently pressed
    pub fn make_report_buttons(&self) -> Buttons {
        let records = self.records.lock();
        let mut buttons = Buttons::new();
        for button in 1..=32u32 {
            let pair = UsagePair::new(usage_page::BUTTON, Usage(button));
            let sum: i64 = records
                .iter()
                .filter(|r| r.usage_pair == pair)
                .map(|r| r.polarity.weight())
                .sum();
            if sum > 0 {
                buttons.insert(button);
            }
        }
        buttons
    }

    pub fn active_records(&self) -> Vec<ActivePointingButton> {
        self.records.lock().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}
