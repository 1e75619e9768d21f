//! Identifiers, HID usage constants and small shared enums

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

use serde::{Deserialize, Serialize};

// =============================================================================
// Identifiers
// =============================================================================

/// Process-local device id, assigned when a handle is created
///
/// Ids come from a global counter and are never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub u64);

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);

impl DeviceId {
    /// Allocate the next unused id
    pub fn next() -> Self {
        DeviceId(NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// OS-assigned id of one physical connection instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegistryEntryId(pub u64);

impl fmt::Display for RegistryEntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct VendorId(pub u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ProductId(pub u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct LocationId(pub u32);

/// Platform handle for one HID element within a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ElementCookie(pub u32);

// =============================================================================
// Usages
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UsagePage(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Usage(pub u32);

/// (usage_page, usage) pair identifying one device capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UsagePair {
    pub usage_page: UsagePage,
    pub usage: Usage,
}

impl UsagePair {
    pub const fn new(usage_page: UsagePage, usage: Usage) -> Self {
        Self { usage_page, usage }
    }

    /// Packed `(page << 32) | usage` form, handy as a map key
    #[inline]
    pub const fn key(&self) -> u64 {
        ((self.usage_page.0 as u64) << 32) | self.usage.0 as u64
    }
}

impl fmt::Display for UsagePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(0x{:02X}, 0x{:02X})", self.usage_page.0, self.usage.0)
    }
}

/// Usage pages this core interprets
pub mod usage_page {
    use super::UsagePage;

    pub const UNDEFINED: UsagePage = UsagePage(0x00);
    pub const GENERIC_DESKTOP: UsagePage = UsagePage(0x01);
    pub const KEYBOARD_OR_KEYPAD: UsagePage = UsagePage(0x07);
    pub const LEDS: UsagePage = UsagePage(0x08);
    pub const BUTTON: UsagePage = UsagePage(0x09);
    pub const CONSUMER: UsagePage = UsagePage(0x0C);
}

/// Usages this core interprets, grouped by page
pub mod usage {
    use super::Usage;

    pub const UNDEFINED: Usage = Usage(0x00);

    pub mod generic_desktop {
        use super::super::Usage;

        pub const POINTER: Usage = Usage(0x01);
        pub const MOUSE: Usage = Usage(0x02);
        pub const KEYBOARD: Usage = Usage(0x06);
        pub const X: Usage = Usage(0x30);
        pub const Y: Usage = Usage(0x31);
        pub const WHEEL: Usage = Usage(0x38);
    }

    pub mod led {
        use super::super::Usage;

        pub const NUM_LOCK: Usage = Usage(0x01);
        pub const CAPS_LOCK: Usage = Usage(0x02);
        pub const SCROLL_LOCK: Usage = Usage(0x03);
    }

    pub mod consumer {
        use super::super::Usage;

        pub const CONSUMER_CONTROL: Usage = Usage(0x01);
        pub const AC_PAN: Usage = Usage(0x238);
    }

    pub mod button {
        use super::super::Usage;

        pub const BUTTON_1: Usage = Usage(0x01);
        pub const BUTTON_32: Usage = Usage(0x20);
    }
}

// =============================================================================
// Time
// =============================================================================

/// Monotonic timestamp in nanoseconds since the first call in this process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct AbsoluteTime(pub u64);

impl AbsoluteTime {
    pub fn now() -> Self {
        static EPOCH: OnceLock<Instant> = OnceLock::new();
        let epoch = EPOCH.get_or_init(Instant::now);
        AbsoluteTime(epoch.elapsed().as_nanos() as u64)
    }
}

// =============================================================================
// Small enums
// =============================================================================

/// Eligibility verdict consulted by the grab retry loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrabbableState {
    /// The device may be seized now
    Grabbable,
    /// Something transient blocks the grab; retry later
    UngrabbableTemporarily,
    /// The device must never be seized
    UngrabbablePermanently,
    /// The device is in an error state; retried like a temporary block
    DeviceError,
    /// No verdict
    None,
}

/// How a device is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenMode {
    /// Other clients keep receiving input
    #[default]
    Shared,
    /// Exclusive access, other clients stop receiving input
    Seize,
}

/// HID report direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportType {
    Input,
    Output,
    Feature,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedState {
    On,
    Off,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_ids_are_unique() {
        let a = DeviceId::next();
        let b = DeviceId::next();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_usage_pair_key() {
        let pair = UsagePair::new(usage_page::CONSUMER, usage::consumer::AC_PAN);
        assert_eq!(pair.key(), (0x0C << 32) | 0x238);
        assert_eq!(pair.to_string(), "(0x0C, 0x238)");
    }

    #[test]
    fn test_absolute_time_is_monotonic() {
        let a = AbsoluteTime::now();
        let b = AbsoluteTime::now();
        assert!(b >= a);
    }
}
