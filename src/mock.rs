//! Scriptable in-memory platform
//!
//! `MockRegistry` and `MockDevice` implement the platform traits without any
//! hardware so the components can be driven deterministically: connect and
//! terminate devices, inject values and reports, and force failures.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::warn;

use crate::error::DeviceError;
use crate::platform::{
    DeviceFilter, DeviceRegistry, HidElement, HidValue, InputReportCallback, PlatformDevice,
    RawDeviceProperties, RawInputReport, RegistryCallback, RegistryNotification, RegistryWatch,
    ValueAvailableCallback,
};
use crate::types::{
    usage, usage_page, AbsoluteTime, ElementCookie, OpenMode, ProductId, RegistryEntryId,
    ReportType, Usage, UsagePage, UsagePair, VendorId,
};

// =============================================================================
// MockDevice
// =============================================================================

#[derive(Default)]
struct DeviceState {
    open_mode: Option<OpenMode>,
    open_count: usize,
    close_count: usize,
    open_errors: VecDeque<DeviceError>,
    persistent_open_error: Option<DeviceError>,
    close_errors: VecDeque<DeviceError>,
    scheduled: bool,
    value_callback: Option<ValueAvailableCallback>,
    queue_depth: usize,
    queue_started: bool,
    queue_error: Option<DeviceError>,
    values: VecDeque<HidValue>,
    dropped_values: usize,
    report_callback: Option<InputReportCallback>,
    report_buffer_size: usize,
    sent_reports: Vec<RawInputReport>,
    element_values: HashMap<ElementCookie, i64>,
    set_value_error: Option<DeviceError>,
    removed: bool,
}

pub struct MockDevice {
    registry_entry_id: RegistryEntryId,
    properties: RawDeviceProperties,
    elements: Vec<HidElement>,
    state: Mutex<DeviceState>,
}

impl MockDevice {
    pub fn new(
        registry_entry_id: RegistryEntryId,
        properties: RawDeviceProperties,
        elements: Vec<HidElement>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry_entry_id,
            properties,
            elements,
            state: Mutex::new(DeviceState::default()),
        })
    }

    /// Keyboard with keys a..z (cookies 4..=29, cookie == usage), left
    /// shift (0xE1) and a caps lock LED (cookie 1000)
    pub fn keyboard(registry_entry_id: RegistryEntryId) -> Arc<Self> {
        let mut elements: Vec<HidElement> = (0x04..=0x1D)
            .chain([0xE1])
            .map(|u| element(u, usage_page::KEYBOARD_OR_KEYPAD, Usage(u), 0, 1))
            .collect();
        elements.push(element(1000, usage_page::LEDS, usage::led::CAPS_LOCK, 0, 1));

        let properties = RawDeviceProperties {
            vendor_id: VendorId(0x05AC),
            product_id: ProductId(0x0250),
            manufacturer: Some("Mock".into()),
            product: Some("Mock Keyboard".into()),
            transport: Some("USB".into()),
            max_input_report_size: Some(8),
            device_usages: vec![UsagePair::new(
                usage_page::GENERIC_DESKTOP,
                usage::generic_desktop::KEYBOARD,
            )],
            ..Default::default()
        };
        Self::new(registry_entry_id, properties, elements)
    }

    /// Mouse with buttons 1..=3 (cookies 1..=3), X (10), Y (11) and
    /// wheel (12)
    pub fn mouse(registry_entry_id: RegistryEntryId) -> Arc<Self> {
        let mut elements: Vec<HidElement> = (1..=3)
            .map(|b| element(b, usage_page::BUTTON, Usage(b), 0, 1))
            .collect();
        elements.push(element(10, usage_page::GENERIC_DESKTOP, usage::generic_desktop::X, -127, 127));
        elements.push(element(11, usage_page::GENERIC_DESKTOP, usage::generic_desktop::Y, -127, 127));
        elements.push(element(12, usage_page::GENERIC_DESKTOP, usage::generic_desktop::WHEEL, -127, 127));

        let properties = RawDeviceProperties {
            vendor_id: VendorId(0x046D),
            product_id: ProductId(0xC077),
            product: Some("Mock Mouse".into()),
            transport: Some("USB".into()),
            device_usages: vec![
                UsagePair::new(usage_page::GENERIC_DESKTOP, usage::generic_desktop::POINTER),
                UsagePair::new(usage_page::GENERIC_DESKTOP, usage::generic_desktop::MOUSE),
            ],
            ..Default::default()
        };
        Self::new(registry_entry_id, properties, elements)
    }

    // ---- scripting ----

    pub fn fail_next_open(&self, error: DeviceError) {
        self.state.lock().open_errors.push_back(error);
    }

    /// Make every open fail with `error` until called with `None`
    pub fn fail_opens(&self, error: Option<DeviceError>) {
        self.state.lock().persistent_open_error = error;
    }

    pub fn fail_next_close(&self, error: DeviceError) {
        self.state.lock().close_errors.push_back(error);
    }

    pub fn fail_queue_creation(&self, error: DeviceError) {
        self.state.lock().queue_error = Some(error);
    }

    pub fn fail_set_value(&self, error: Option<DeviceError>) {
        self.state.lock().set_value_error = error;
    }

    /// Simulate the node vanishing from the system
    pub fn set_removed(&self, removed: bool) {
        self.state.lock().removed = removed;
    }

    /// Buffer values as the platform would and wake the consumer
    ///
    /// Values are dropped unless the queue is started; the oldest value is
    /// discarded, with a warning, when the queue is full.
    pub fn push_values(&self, values: &[HidValue]) {
        let callback = {
            let mut state = self.state.lock();
            if !state.queue_started {
                return;
            }
            let mut dropped = 0;
            for value in values {
                if state.values.len() >= state.queue_depth.max(1) {
                    state.values.pop_front();
                    dropped += 1;
                }
                state.values.push_back(*value);
            }
            if dropped > 0 {
                state.dropped_values += dropped;
                warn!(
                    "{} value queue full, dropped {} oldest values",
                    self.registry_entry_id, dropped
                );
            }
            if state.scheduled {
                state.value_callback.clone()
            } else {
                None
            }
        };
        if let Some(callback) = callback {
            callback();
        }
    }

    pub fn push_value(&self, cookie: u32, integer_value: i64) {
        self.push_values(&[HidValue {
            time_stamp: AbsoluteTime::now(),
            cookie: ElementCookie(cookie),
            integer_value,
        }]);
    }

    pub fn push_report(&self, report: RawInputReport) {
        let callback = {
            let state = self.state.lock();
            if !state.scheduled {
                return;
            }
            state.report_callback.clone()
        };
        if let Some(callback) = callback {
            callback(report);
        }
    }

    // ---- inspection ----

    pub fn open_mode(&self) -> Option<OpenMode> {
        self.state.lock().open_mode
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open_mode.is_some()
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().open_count
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().close_count
    }

    pub fn is_scheduled(&self) -> bool {
        self.state.lock().scheduled
    }

    pub fn is_queue_started(&self) -> bool {
        self.state.lock().queue_started
    }

    /// Values discarded so far because the queue was full
    pub fn dropped_value_count(&self) -> usize {
        self.state.lock().dropped_values
    }

    pub fn has_report_callback(&self) -> bool {
        self.state.lock().report_callback.is_some()
    }

    pub fn report_buffer_size(&self) -> usize {
        self.state.lock().report_buffer_size
    }

    pub fn sent_reports(&self) -> Vec<RawInputReport> {
        self.state.lock().sent_reports.clone()
    }

    pub fn element_value(&self, cookie: u32) -> Option<i64> {
        self.state
            .lock()
            .element_values
            .get(&ElementCookie(cookie))
            .copied()
    }
}

fn element(cookie: u32, page: UsagePage, usage: Usage, min: i64, max: i64) -> HidElement {
    HidElement {
        cookie: ElementCookie(cookie),
        usage_page: page,
        usage,
        logical_min: min,
        logical_max: max,
    }
}

impl PlatformDevice for MockDevice {
    fn registry_entry_id(&self) -> RegistryEntryId {
        self.registry_entry_id
    }

    fn properties(&self) -> RawDeviceProperties {
        self.properties.clone()
    }

    fn elements(&self) -> Vec<HidElement> {
        self.elements.clone()
    }

    fn open(&self, mode: OpenMode) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        if state.removed {
            return Err(DeviceError::NotFound);
        }
        if let Some(error) = state.open_errors.pop_front() {
            return Err(error);
        }
        if let Some(error) = state.persistent_open_error.clone() {
            return Err(error);
        }
        state.open_mode = Some(mode);
        state.open_count += 1;
        Ok(())
    }

    fn close(&self) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        if let Some(error) = state.close_errors.pop_front() {
            return Err(error);
        }
        if state.open_mode.take().is_none() {
            return Err(DeviceError::NotOpen);
        }
        state.close_count += 1;
        Ok(())
    }

    fn schedule(&self) {
        self.state.lock().scheduled = true;
    }

    fn unschedule(&self) {
        self.state.lock().scheduled = false;
    }

    fn create_value_queue(
        &self,
        depth: usize,
        callback: ValueAvailableCallback,
    ) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        if let Some(error) = state.queue_error.clone() {
            return Err(error);
        }
        state.queue_depth = depth;
        state.value_callback = Some(callback);
        Ok(())
    }

    fn start_queue(&self) {
        let mut state = self.state.lock();
        if state.value_callback.is_some() {
            state.queue_started = true;
        }
    }

    fn stop_queue(&self) {
        let mut state = self.state.lock();
        state.queue_started = false;
        state.values.clear();
    }

    fn copy_next_value(&self) -> Option<HidValue> {
        self.state.lock().values.pop_front()
    }

    fn register_input_report_callback(
        &self,
        buffer_size: usize,
        callback: Option<InputReportCallback>,
    ) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        state.report_buffer_size = buffer_size;
        state.report_callback = callback;
        Ok(())
    }

    fn set_report(
        &self,
        report_type: ReportType,
        report_id: u32,
        bytes: &[u8],
    ) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        if state.open_mode.is_none() {
            return Err(DeviceError::NotOpen);
        }
        state.sent_reports.push(RawInputReport {
            report_type,
            report_id,
            bytes: bytes.to_vec(),
        });
        Ok(())
    }

    fn get_value(&self, cookie: ElementCookie) -> Result<i64, DeviceError> {
        Ok(self
            .state
            .lock()
            .element_values
            .get(&cookie)
            .copied()
            .unwrap_or(0))
    }

    fn set_value(&self, cookie: ElementCookie, value: i64) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        if let Some(error) = state.set_value_error.clone() {
            return Err(error);
        }
        state.element_values.insert(cookie, value);
        Ok(())
    }

    fn exists(&self) -> bool {
        !self.state.lock().removed
    }
}

// =============================================================================
// MockRegistry
// =============================================================================

struct Watcher {
    id: u64,
    filter: DeviceFilter,
    callback: RegistryCallback,
}

#[derive(Default)]
struct RegistryState {
    next_watch_id: u64,
    watchers: Vec<Watcher>,
    devices: Vec<Arc<MockDevice>>,
    failing_filters: HashSet<DeviceFilter>,
}

/// In-memory device registry
#[derive(Clone, Default)]
pub struct MockRegistry {
    inner: Arc<Mutex<RegistryState>>,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `watch` fail for this filter
    pub fn fail_filter(&self, filter: DeviceFilter) {
        self.inner.lock().failing_filters.insert(filter);
    }

    /// Plug a device in; matching watchers are notified synchronously
    pub fn connect(&self, device: Arc<MockDevice>) {
        let callbacks = {
            let mut inner = self.inner.lock();
            inner.devices.push(Arc::clone(&device));
            Self::matching_callbacks(&inner, &device)
        };
        for callback in callbacks {
            callback(RegistryNotification::Matched(device.clone()));
        }
    }

    /// Repeat the appeared notification for an already-connected device
    pub fn renotify(&self, id: RegistryEntryId) {
        let targets = {
            let inner = self.inner.lock();
            inner
                .devices
                .iter()
                .filter(|d| d.registry_entry_id == id)
                .map(|d| (Arc::clone(d), Self::matching_callbacks(&inner, d)))
                .collect::<Vec<_>>()
        };
        for (device, callbacks) in targets {
            for callback in callbacks {
                callback(RegistryNotification::Matched(device.clone()));
            }
        }
    }

    /// Unplug a device; every watcher receives the termination
    pub fn terminate(&self, id: RegistryEntryId) {
        let callbacks = {
            let mut inner = self.inner.lock();
            for device in inner.devices.iter().filter(|d| d.registry_entry_id == id) {
                device.set_removed(true);
            }
            inner.devices.retain(|d| d.registry_entry_id != id);
            inner
                .watchers
                .iter()
                .map(|w| Arc::clone(&w.callback))
                .collect::<Vec<_>>()
        };
        for callback in callbacks {
            callback(RegistryNotification::Terminated(id));
        }
    }

    pub fn watch_count(&self) -> usize {
        self.inner.lock().watchers.len()
    }

    fn matching_callbacks(inner: &RegistryState, device: &MockDevice) -> Vec<RegistryCallback> {
        inner
            .watchers
            .iter()
            .filter(|w| w.filter.matches(&device.properties))
            .map(|w| Arc::clone(&w.callback))
            .collect()
    }
}

impl DeviceRegistry for MockRegistry {
    fn watch(
        &self,
        filter: DeviceFilter,
        callback: RegistryCallback,
    ) -> Result<Box<dyn RegistryWatch>, DeviceError> {
        let (id, existing) = {
            let mut inner = self.inner.lock();
            if inner.failing_filters.contains(&filter) {
                return Err(DeviceError::Unsupported(format!(
                    "no matcher for usage page 0x{:02X} usage 0x{:02X}",
                    filter.usage_page.0, filter.usage.0
                )));
            }
            let id = inner.next_watch_id;
            inner.next_watch_id += 1;
            inner.watchers.push(Watcher {
                id,
                filter,
                callback: Arc::clone(&callback),
            });
            let existing: Vec<Arc<MockDevice>> = inner
                .devices
                .iter()
                .filter(|d| filter.matches(&d.properties))
                .cloned()
                .collect();
            (id, existing)
        };

        for device in existing {
            callback(RegistryNotification::Matched(device));
        }

        Ok(Box::new(MockWatch {
            id,
            registry: Arc::downgrade(&self.inner),
        }))
    }
}

struct MockWatch {
    id: u64,
    registry: Weak<Mutex<RegistryState>>,
}

impl RegistryWatch for MockWatch {
    fn cancel(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().watchers.retain(|w| w.id != self.id);
        }
    }
}

impl Drop for MockWatch {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn keyboard_filter() -> DeviceFilter {
        DeviceFilter::new(usage_page::GENERIC_DESKTOP, usage::generic_desktop::KEYBOARD)
    }

    #[test]
    fn test_watch_reports_existing_and_new_devices() {
        let registry = MockRegistry::new();
        registry.connect(MockDevice::keyboard(RegistryEntryId(1)));
        registry.connect(MockDevice::mouse(RegistryEntryId(2)));

        let matched = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&matched);
        let mut watch = registry
            .watch(
                keyboard_filter(),
                Arc::new(move |n| {
                    if let RegistryNotification::Matched(_) = n {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                }),
            )
            .unwrap();
        assert_eq!(matched.load(Ordering::SeqCst), 1);

        registry.connect(MockDevice::keyboard(RegistryEntryId(3)));
        assert_eq!(matched.load(Ordering::SeqCst), 2);

        watch.cancel();
        registry.connect(MockDevice::keyboard(RegistryEntryId(4)));
        assert_eq!(matched.load(Ordering::SeqCst), 2);
        assert_eq!(registry.watch_count(), 0);
    }

    #[test]
    fn test_failing_filter() {
        let registry = MockRegistry::new();
        registry.fail_filter(keyboard_filter());
        assert!(registry.watch(keyboard_filter(), Arc::new(|_| {})).is_err());
    }

    #[test]
    fn test_values_dropped_until_queue_started() {
        let device = MockDevice::keyboard(RegistryEntryId(1));
        device.push_value(4, 1);
        assert!(device.copy_next_value().is_none());

        device
            .create_value_queue(2, Arc::new(|| {}))
            .unwrap();
        device.start_queue();
        device.push_value(4, 1);
        device.push_value(5, 1);
        assert_eq!(device.dropped_value_count(), 0);
        device.push_value(6, 1);
        assert_eq!(device.dropped_value_count(), 1);
        assert_eq!(device.copy_next_value().unwrap().cookie, ElementCookie(5));
        assert_eq!(device.copy_next_value().unwrap().cookie, ElementCookie(6));
        assert!(device.copy_next_value().is_none());
    }

    #[test]
    fn test_open_failures() {
        let device = MockDevice::mouse(RegistryEntryId(1));
        device.fail_next_open(DeviceError::ExclusiveAccess("busy".into()));
        assert!(device.open(OpenMode::Seize).is_err());
        assert!(device.open(OpenMode::Seize).is_ok());
        assert_eq!(device.open_mode(), Some(OpenMode::Seize));
        assert!(device.close().is_ok());
        assert_eq!(device.close(), Err(DeviceError::NotOpen));
    }
}
