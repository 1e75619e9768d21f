//! Platform abstraction
//!
//! The core never talks to the OS directly. A backend supplies a
//! [`DeviceRegistry`] that reports devices appearing and disappearing, and
//! one [`PlatformDevice`] per physical device. `hidseize-evdev` implements
//! these for Linux; [`crate::mock`] provides a scriptable in-memory version.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::DeviceError;
use crate::types::{
    AbsoluteTime, ElementCookie, LocationId, OpenMode, ProductId, RegistryEntryId, ReportType,
    Usage, UsagePage, UsagePair, VendorId,
};

/// One input or output element of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HidElement {
    pub cookie: ElementCookie,
    pub usage_page: UsagePage,
    pub usage: Usage,
    pub logical_min: i64,
    pub logical_max: i64,
}

impl HidElement {
    pub fn usage_pair(&self) -> UsagePair {
        UsagePair::new(self.usage_page, self.usage)
    }
}

/// One raw value change delivered by the value queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HidValue {
    pub time_stamp: AbsoluteTime,
    pub cookie: ElementCookie,
    pub integer_value: i64,
}

/// Attributes queried from the registry when a device appears
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDeviceProperties {
    pub vendor_id: VendorId,
    pub product_id: ProductId,
    pub location_id: Option<LocationId>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub transport: Option<String>,
    pub max_input_report_size: Option<usize>,
    /// Every (page, usage) collection the device advertises
    pub device_usages: Vec<UsagePair>,
}

impl RawDeviceProperties {
    pub fn conforms_to(&self, usage_page: UsagePage, usage: Usage) -> bool {
        self.device_usages
            .iter()
            .any(|pair| pair.usage_page == usage_page && pair.usage == usage)
    }
}

/// Matching criterion for registry observation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceFilter {
    pub usage_page: UsagePage,
    pub usage: Usage,
}

impl DeviceFilter {
    pub const fn new(usage_page: UsagePage, usage: Usage) -> Self {
        Self { usage_page, usage }
    }

    pub fn matches(&self, properties: &RawDeviceProperties) -> bool {
        properties.conforms_to(self.usage_page, self.usage)
    }
}

/// A raw input report exactly as the device sent it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawInputReport {
    pub report_type: ReportType,
    pub report_id: u32,
    pub bytes: Vec<u8>,
}

/// Invoked from the platform when queued values are ready to be copied
pub type ValueAvailableCallback = Arc<dyn Fn() + Send + Sync>;

/// Invoked from the platform for every raw input report
pub type InputReportCallback = Arc<dyn Fn(RawInputReport) + Send + Sync>;

/// One physical device as exposed by the platform
///
/// Methods are called from the owning handle's serial queue only. Callbacks
/// may fire from any thread but only while the device is scheduled.
pub trait PlatformDevice: Send + Sync {
    fn registry_entry_id(&self) -> RegistryEntryId;

    fn properties(&self) -> RawDeviceProperties;

    fn elements(&self) -> Vec<HidElement>;

    fn open(&self, mode: OpenMode) -> Result<(), DeviceError>;

    fn close(&self) -> Result<(), DeviceError>;

    /// Attach callback delivery
    fn schedule(&self);

    /// Detach callback delivery
    fn unschedule(&self);

    /// Create the value queue; values are buffered only once started
    fn create_value_queue(
        &self,
        depth: usize,
        callback: ValueAvailableCallback,
    ) -> Result<(), DeviceError>;

    fn start_queue(&self);

    fn stop_queue(&self);

    /// Pop the oldest buffered value without blocking
    fn copy_next_value(&self) -> Option<HidValue>;

    /// Install (`Some`) or remove (`None`) the raw report callback
    fn register_input_report_callback(
        &self,
        buffer_size: usize,
        callback: Option<InputReportCallback>,
    ) -> Result<(), DeviceError>;

    fn set_report(
        &self,
        report_type: ReportType,
        report_id: u32,
        bytes: &[u8],
    ) -> Result<(), DeviceError>;

    fn get_value(&self, cookie: ElementCookie) -> Result<i64, DeviceError>;

    fn set_value(&self, cookie: ElementCookie, value: i64) -> Result<(), DeviceError>;

    /// Cheap liveness probe
    fn exists(&self) -> bool;
}

/// Registry notification for one filter
#[derive(Clone)]
pub enum RegistryNotification {
    Matched(Arc<dyn PlatformDevice>),
    Terminated(RegistryEntryId),
}

impl fmt::Debug for RegistryNotification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryNotification::Matched(device) => f
                .debug_tuple("Matched")
                .field(&device.registry_entry_id())
                .finish(),
            RegistryNotification::Terminated(id) => f.debug_tuple("Terminated").field(id).finish(),
        }
    }
}

pub type RegistryCallback = Arc<dyn Fn(RegistryNotification) + Send + Sync>;

/// Source of device-appeared / device-terminated notifications
pub trait DeviceRegistry: Send + Sync {
    /// Begin observing devices matching `filter`
    ///
    /// Devices already present are reported as `Matched` before this returns
    /// or shortly after; a device may be reported more than once.
    fn watch(
        &self,
        filter: DeviceFilter,
        callback: RegistryCallback,
    ) -> Result<Box<dyn RegistryWatch>, DeviceError>;
}

/// An active observation; dropping it also cancels
pub trait RegistryWatch: Send {
    fn cancel(&mut self);
}
