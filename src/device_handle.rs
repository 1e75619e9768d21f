//! Ownership of one physical device
//!
//! A `DeviceHandle` wraps a [`PlatformDevice`] and serializes every operation
//! on it through its own [`Dispatcher`]. Public `async_*` methods only
//! enqueue; outcomes come back through the handle's signals. Once the monitor
//! marks the handle removed every operation becomes a no-op.
//!
//! ```text
//!   platform value callback ──► [handle queue] drain ──► make_queue
//!                                                  └──► release markers
//!                                                  └──► repeat/modifier/button state
//!                                                  └──► values_arrived(batch), unless disabled
//! ```

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::{Config, DeviceConfig, PointingMotionConfig};
use crate::device_properties::DeviceProperties;
use crate::dispatcher::Dispatcher;
use crate::error::DeviceError;
use crate::event::{
    make_queue, ElementTable, Event, EventQueue, EventType, ModifierFlag, PointingButton,
    PressedKeys,
};
use crate::keyboard_repeat_detector::KeyboardRepeatDetector;
use crate::platform::{PlatformDevice, RawInputReport};
use crate::signal::Signal;
use crate::types::{
    usage, usage_page, DeviceId, LedState, OpenMode, RegistryEntryId, ReportType,
};

/// Raw input report tagged with the device it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputReport {
    pub device_id: DeviceId,
    pub report_type: ReportType,
    pub report_id: u32,
    pub bytes: Vec<u8>,
}

/// What the device currently holds down, as seen through decoded events
#[derive(Default)]
struct InputState {
    pressed: PressedKeys,
    repeat_detector: KeyboardRepeatDetector,
    modifier_flags: BTreeSet<ModifierFlag>,
    pointing_buttons: BTreeSet<PointingButton>,
}

impl InputState {
    fn update(&mut self, queue: &EventQueue) {
        for entry in queue {
            self.repeat_detector.update(entry.event, entry.event_type);
            let down = match entry.event_type {
                EventType::KeyDown => true,
                EventType::KeyUp => false,
                EventType::Single => continue,
            };
            match entry.event {
                Event::KeyCode(key) => {
                    if let Some(flag) = key.modifier_flag() {
                        if down {
                            self.modifier_flags.insert(flag);
                        } else {
                            self.modifier_flags.remove(&flag);
                        }
                    }
                }
                Event::PointingButton(button) => {
                    if down {
                        self.pointing_buttons.insert(button);
                    } else {
                        self.pointing_buttons.remove(&button);
                    }
                }
                _ => {}
            }
        }
    }

    fn clear(&mut self) {
        self.pressed.clear();
        self.repeat_detector.clear();
        self.modifier_flags.clear();
        self.pointing_buttons.clear();
    }
}

#[derive(Default)]
struct HandleState {
    open_mode: Option<OpenMode>,
    scheduled: bool,
    queue_available: bool,
    queue_started: bool,
    report_enabled: bool,
    input: InputState,
}

pub struct DeviceHandle {
    weak_self: Weak<DeviceHandle>,
    properties: Arc<DeviceProperties>,
    device: Arc<dyn PlatformDevice>,
    elements: ElementTable,
    device_config: DeviceConfig,
    motion_config: PointingMotionConfig,
    removed: AtomicBool,
    disabled: AtomicBool,
    state: Mutex<HandleState>,
    dispatcher: Arc<Dispatcher>,

    opened: Signal<OpenMode>,
    open_failed: Signal<DeviceError>,
    closed: Signal<()>,
    close_failed: Signal<DeviceError>,
    values_arrived: Signal<Arc<EventQueue>>,
    report_arrived: Signal<InputReport>,
    device_disabled: Signal<()>,
    device_enabled: Signal<()>,
}

impl DeviceHandle {
    /// Wrap `device` and create its value queue
    ///
    /// A value queue that cannot be created is logged; the handle still
    /// works but never delivers values.
    pub fn new(
        device_id: DeviceId,
        device: Arc<dyn PlatformDevice>,
        config: &Config,
    ) -> Result<Arc<Self>, DeviceError> {
        let dispatcher = Arc::new(Dispatcher::new(format!("device-handle-{}", device_id))?);
        let properties = Arc::new(DeviceProperties::new(
            device_id,
            device.registry_entry_id(),
            device.properties(),
        ));
        let elements = ElementTable::new(device.elements());

        let handle = Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            properties,
            device,
            elements,
            device_config: config.device.clone(),
            motion_config: config.pointing_motion.clone(),
            removed: AtomicBool::new(false),
            disabled: AtomicBool::new(false),
            state: Mutex::new(HandleState::default()),
            dispatcher,
            opened: Signal::new(),
            open_failed: Signal::new(),
            closed: Signal::new(),
            close_failed: Signal::new(),
            values_arrived: Signal::new(),
            report_arrived: Signal::new(),
            device_disabled: Signal::new(),
            device_enabled: Signal::new(),
        });

        let weak = handle.weak_self.clone();
        let dispatcher = Arc::clone(&handle.dispatcher);
        let result = handle.device.create_value_queue(
            handle.device_config.value_queue_depth,
            Arc::new(move || {
                let weak = weak.clone();
                dispatcher.enqueue(move || {
                    if let Some(handle) = weak.upgrade() {
                        handle.drain_values();
                    }
                });
            }),
        );
        match result {
            Ok(()) => handle.state.lock().queue_available = true,
            Err(e) => warn!(
                "Failed to create value queue for {}: {}",
                handle.properties.name_for_log(),
                e
            ),
        }

        debug!("Created handle for {}", handle.properties.name_for_log());
        Ok(handle)
    }

    // ---- identity ----

    pub fn properties(&self) -> &Arc<DeviceProperties> {
        &self.properties
    }

    pub fn device_id(&self) -> DeviceId {
        self.properties.device_id
    }

    pub fn registry_entry_id(&self) -> RegistryEntryId {
        self.properties.registry_entry_id
    }

    pub fn name_for_log(&self) -> String {
        self.properties.name_for_log()
    }

    pub fn downgrade(&self) -> DeviceRef {
        DeviceRef {
            properties: Arc::clone(&self.properties),
            handle: self.weak_self.clone(),
        }
    }

    // ---- lifecycle ----

    /// One-way latch set by the monitor when the device disappears
    pub fn set_removed(&self) {
        self.removed.store(true, Ordering::Release);
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    pub fn is_opened(&self) -> bool {
        self.state.lock().open_mode.is_some()
    }

    /// Mode of the current open, `None` while closed
    pub fn open_mode(&self) -> Option<OpenMode> {
        self.state.lock().open_mode
    }

    /// Disabled devices stay opened and tracked but deliver no batches
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    // ---- input state ----

    /// Whether a non-modifier key is held and would be auto-repeating
    pub fn is_key_repeating(&self) -> bool {
        self.state.lock().input.repeat_detector.is_repeating()
    }

    pub fn pressed_modifier_flags(&self) -> Vec<ModifierFlag> {
        self.state.lock().input.modifier_flags.iter().copied().collect()
    }

    pub fn has_pressed_pointing_buttons(&self) -> bool {
        !self.state.lock().input.pointing_buttons.is_empty()
    }

    /// Best-effort liveness check; advisory only
    pub fn validate(&self) -> bool {
        !self.is_removed() && self.device.exists()
    }

    // ---- signals ----

    /// Carries the mode the device was opened with
    pub fn opened(&self) -> &Signal<OpenMode> {
        &self.opened
    }

    pub fn open_failed(&self) -> &Signal<DeviceError> {
        &self.open_failed
    }

    pub fn closed(&self) -> &Signal<()> {
        &self.closed
    }

    pub fn close_failed(&self) -> &Signal<DeviceError> {
        &self.close_failed
    }

    /// One decoded batch per drain cycle
    pub fn values_arrived(&self) -> &Signal<Arc<EventQueue>> {
        &self.values_arrived
    }

    pub fn report_arrived(&self) -> &Signal<InputReport> {
        &self.report_arrived
    }

    pub fn device_disabled(&self) -> &Signal<()> {
        &self.device_disabled
    }

    pub fn device_enabled(&self) -> &Signal<()> {
        &self.device_enabled
    }

    // ---- queue plumbing ----

    /// Run `f` on this handle's queue if the handle is still alive then
    pub(crate) fn enqueue<F>(&self, f: F)
    where
        F: FnOnce(&DeviceHandle) + Send + 'static,
    {
        let weak = self.weak_self.clone();
        self.dispatcher.enqueue(move || {
            if let Some(handle) = weak.upgrade() {
                f(&handle);
            }
        });
    }

    /// Run `f` on this handle's queue and wait for it
    ///
    /// Owners use this to disconnect from the handle's signals without
    /// racing a delivery already in flight.
    pub fn run_sync<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.dispatcher.run_sync(f)
    }

    // ---- async operations ----

    pub fn async_open(&self, mode: OpenMode) {
        self.enqueue(move |h| h.open(mode));
    }

    pub fn async_close(&self) {
        self.enqueue(|h| h.close());
    }

    pub fn async_schedule(&self) {
        self.enqueue(|h| h.schedule());
    }

    pub fn async_unschedule(&self) {
        self.enqueue(|h| h.unschedule());
    }

    pub fn async_enable_report_callback(&self) {
        self.enqueue(|h| h.enable_report_callback());
    }

    pub fn async_disable_report_callback(&self) {
        self.enqueue(|h| h.disable_report_callback());
    }

    pub fn async_start_value_queue(&self) {
        self.enqueue(|h| h.start_value_queue());
    }

    pub fn async_stop_value_queue(&self) {
        self.enqueue(|h| h.stop_value_queue());
    }

    /// Fire-and-forget report write; failures are logged
    pub fn async_set_report(&self, report_type: ReportType, report_id: u32, bytes: Vec<u8>) {
        self.enqueue(move |h| h.set_report(report_type, report_id, &bytes));
    }

    pub fn async_set_caps_lock_led_state(&self, state: LedState) {
        self.enqueue(move |h| h.set_caps_lock_led_state(state));
    }

    pub fn async_disable(&self) {
        self.enqueue(|h| h.set_disabled(true));
    }

    pub fn async_enable(&self) {
        self.enqueue(|h| h.set_disabled(false));
    }

    /// Current caps lock LED state, if the device has one
    pub fn caps_lock_led_state(&self) -> Option<LedState> {
        let element = self
            .elements
            .find(usage_page::LEDS, usage::led::CAPS_LOCK)?;
        match self.device.get_value(element.cookie) {
            Ok(value) if value == element.logical_max => Some(LedState::On),
            Ok(_) => Some(LedState::Off),
            Err(e) => {
                debug!("Failed to read caps lock LED of {}: {}", self.name_for_log(), e);
                None
            }
        }
    }

    // ---- queue-side implementations ----

    fn open(&self, mode: OpenMode) {
        if self.is_removed() {
            return;
        }
        if let Some(current) = self.state.lock().open_mode {
            if current != mode {
                debug!(
                    "{} is already opened ({:?}); close it before opening ({:?})",
                    self.name_for_log(),
                    current,
                    mode
                );
            }
            return;
        }

        match self.device.open(mode) {
            Ok(()) => {
                self.state.lock().open_mode = Some(mode);
                info!("{} is opened ({:?})", self.name_for_log(), mode);
                self.opened.emit(&mode);
            }
            Err(e) => {
                debug!("Failed to open {}: {}", self.name_for_log(), e);
                self.open_failed.emit(&e);
            }
        }
    }

    fn close(&self) {
        if self.is_removed() || self.state.lock().open_mode.is_none() {
            return;
        }

        match self.device.close() {
            Ok(()) => {
                {
                    let mut state = self.state.lock();
                    state.open_mode = None;
                    state.input.clear();
                }
                info!("{} is closed", self.name_for_log());
                self.closed.emit(&());
            }
            Err(e) => {
                // The platform still holds the device; keep the open mode so a
                // later close can retry.
                warn!("Failed to close {}: {}", self.name_for_log(), e);
                self.close_failed.emit(&e);
            }
        }
    }

    fn schedule(&self) {
        if self.is_removed() {
            return;
        }
        let mut state = self.state.lock();
        if !state.scheduled {
            self.device.schedule();
            state.scheduled = true;
        }
    }

    fn unschedule(&self) {
        if self.is_removed() {
            return;
        }
        let mut state = self.state.lock();
        if state.scheduled {
            self.device.unschedule();
            state.scheduled = false;
        }
    }

    fn report_buffer_size(&self) -> usize {
        match self.properties.max_input_report_size {
            Some(size) if size > 0 => size,
            _ => self.device_config.default_report_buffer_size,
        }
    }

    fn enable_report_callback(&self) {
        if self.is_removed() || self.state.lock().report_enabled {
            return;
        }

        let weak = self.weak_self.clone();
        let dispatcher = Arc::clone(&self.dispatcher);
        let device_id = self.device_id();
        let callback = Arc::new(move |report: RawInputReport| {
            let weak = weak.clone();
            dispatcher.enqueue(move || {
                if let Some(handle) = weak.upgrade() {
                    if handle.is_removed() {
                        return;
                    }
                    handle.report_arrived.emit(&InputReport {
                        device_id,
                        report_type: report.report_type,
                        report_id: report.report_id,
                        bytes: report.bytes,
                    });
                }
            });
        });

        match self
            .device
            .register_input_report_callback(self.report_buffer_size(), Some(callback))
        {
            Ok(()) => self.state.lock().report_enabled = true,
            Err(e) => warn!(
                "Failed to enable input reports for {}: {}",
                self.name_for_log(),
                e
            ),
        }
    }

    fn disable_report_callback(&self) {
        if self.is_removed() || !self.state.lock().report_enabled {
            return;
        }
        if let Err(e) = self.device.register_input_report_callback(0, None) {
            warn!(
                "Failed to disable input reports for {}: {}",
                self.name_for_log(),
                e
            );
        }
        self.state.lock().report_enabled = false;
    }

    fn start_value_queue(&self) {
        if self.is_removed() {
            return;
        }
        let mut state = self.state.lock();
        if state.queue_available && !state.queue_started {
            self.device.start_queue();
            state.queue_started = true;
        }
    }

    fn stop_value_queue(&self) {
        if self.is_removed() {
            return;
        }
        let mut state = self.state.lock();
        if state.queue_started {
            self.device.stop_queue();
            state.queue_started = false;
        }
    }

    fn set_report(&self, report_type: ReportType, report_id: u32, bytes: &[u8]) {
        if self.is_removed() {
            return;
        }
        if let Err(e) = self.device.set_report(report_type, report_id, bytes) {
            warn!(
                "Failed to send {:?} report 0x{:02X} to {}: {}",
                report_type,
                report_id,
                self.name_for_log(),
                e
            );
        }
    }

    fn set_caps_lock_led_state(&self, state: LedState) {
        if self.is_removed() {
            return;
        }
        let Some(element) = self.elements.find(usage_page::LEDS, usage::led::CAPS_LOCK) else {
            return;
        };
        let value = match state {
            LedState::On => element.logical_max,
            LedState::Off => element.logical_min,
        };
        if let Err(e) = self.device.set_value(element.cookie, value) {
            warn!(
                "Failed to set caps lock LED of {}: {}",
                self.name_for_log(),
                e
            );
        }
    }

    fn set_disabled(&self, disabled: bool) {
        if self.is_removed() || self.disabled.swap(disabled, Ordering::AcqRel) == disabled {
            return;
        }
        if disabled {
            info!("{} is disabled", self.name_for_log());
            self.device_disabled.emit(&());
        } else {
            info!("{} is enabled", self.name_for_log());
            self.device_enabled.emit(&());
        }
    }

    fn drain_values(&self) {
        if self.is_removed() {
            return;
        }

        let mut values = Vec::new();
        while let Some(value) = self.device.copy_next_value() {
            values.push(value);
        }
        if values.is_empty() {
            return;
        }

        let queue = make_queue(self.device_id(), &self.elements, &values, &self.motion_config);
        let queue = {
            let mut state = self.state.lock();
            let queue = state.input.pressed.insert_released_markers(queue);
            state.input.update(&queue);
            queue
        };
        if queue.is_empty() {
            return;
        }
        if self.is_disabled() {
            debug!(
                "{} is disabled; dropping {} events",
                self.name_for_log(),
                queue.len()
            );
            return;
        }
        self.values_arrived.emit(&Arc::new(queue));
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.report_enabled {
            let _ = self.device.register_input_report_callback(0, None);
        }
        if state.scheduled {
            self.device.unschedule();
        }
        if state.queue_started {
            self.device.stop_queue();
        }
        if state.open_mode.is_some() {
            if let Err(e) = self.device.close() {
                debug!(
                    "Close during teardown of {} failed: {}",
                    self.properties.name_for_log(),
                    e
                );
            }
        }
        self.dispatcher.terminate();
        debug!("Destroyed handle for {}", self.properties.name_for_log());
    }
}

/// Non-owning, validity-checked reference to a handle
#[derive(Clone)]
pub struct DeviceRef {
    properties: Arc<DeviceProperties>,
    handle: Weak<DeviceHandle>,
}

impl DeviceRef {
    pub fn properties(&self) -> &Arc<DeviceProperties> {
        &self.properties
    }

    pub fn device_id(&self) -> DeviceId {
        self.properties.device_id
    }

    /// The handle, unless it has been dropped or marked removed
    pub fn upgrade(&self) -> Option<Arc<DeviceHandle>> {
        self.handle.upgrade().filter(|h| !h.is_removed())
    }

    /// The handle even if marked removed; for teardown only
    pub(crate) fn upgrade_for_teardown(&self) -> Option<Arc<DeviceHandle>> {
        self.handle.upgrade()
    }
}

impl std::fmt::Debug for DeviceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRef")
            .field("device_id", &self.properties.device_id)
            .field("alive", &(self.handle.strong_count() > 0))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::KeyCode;
    use crate::mock::MockDevice;
    use crate::platform::HidValue;
    use crate::types::{AbsoluteTime, ElementCookie};
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn handle_for(device: &Arc<MockDevice>) -> Arc<DeviceHandle> {
        DeviceHandle::new(DeviceId::next(), device.clone(), &Config::default()).unwrap()
    }

    async fn next<T>(rx: &mut UnboundedReceiver<T>) -> T {
        timeout(WAIT, rx.recv()).await.unwrap().unwrap()
    }

    /// Wait until every job enqueued so far has run
    fn flush(handle: &DeviceHandle) {
        assert!(handle.run_sync(|| {}));
    }

    async fn open_and_start(handle: &DeviceHandle, device: &MockDevice) {
        handle.async_open(OpenMode::Seize);
        handle.async_start_value_queue();
        handle.async_schedule();
        flush(handle);
        assert!(device.is_scheduled() && device.is_queue_started());
    }

    fn value(t: u64, cookie: u32, v: i64) -> HidValue {
        HidValue {
            time_stamp: AbsoluteTime(t),
            cookie: ElementCookie(cookie),
            integer_value: v,
        }
    }

    #[tokio::test]
    async fn test_open_and_close_signals() {
        let device = MockDevice::keyboard(RegistryEntryId(1));
        let handle = handle_for(&device);
        let mut opened = handle.opened().subscribe();
        let mut closed = handle.closed().subscribe();

        handle.async_open(OpenMode::Seize);
        assert_eq!(next(&mut opened).await, OpenMode::Seize);
        assert_eq!(device.open_mode(), Some(OpenMode::Seize));
        assert_eq!(handle.open_mode(), Some(OpenMode::Seize));

        // Already opened, in any mode: no second platform open.
        handle.async_open(OpenMode::Seize);
        handle.async_open(OpenMode::Shared);
        handle.async_close();
        next(&mut closed).await;
        assert_eq!(device.open_count(), 1);
        assert!(!device.is_open());

        // Not opened: close is a no-op.
        handle.async_close();
        assert!(timeout(Duration::from_millis(100), closed.recv()).await.is_err());
        assert_eq!(device.close_count(), 1);
        assert_eq!(handle.open_mode(), None);
    }

    #[tokio::test]
    async fn test_open_failed_carries_error() {
        let device = MockDevice::keyboard(RegistryEntryId(1));
        device.fail_next_open(DeviceError::ExclusiveAccess("held".into()));
        let handle = handle_for(&device);
        let mut failed = handle.open_failed().subscribe();

        handle.async_open(OpenMode::Seize);
        assert_eq!(
            next(&mut failed).await,
            DeviceError::ExclusiveAccess("held".into())
        );
        assert!(!handle.is_opened());
    }

    #[tokio::test]
    async fn test_close_failure_keeps_device_opened() {
        let device = MockDevice::keyboard(RegistryEntryId(1));
        let handle = handle_for(&device);
        let mut opened = handle.opened().subscribe();
        let mut close_failed = handle.close_failed().subscribe();

        handle.async_open(OpenMode::Shared);
        next(&mut opened).await;
        device.fail_next_close(DeviceError::Platform(-536870203));
        handle.async_close();
        assert_eq!(next(&mut close_failed).await, DeviceError::Platform(-536870203));
        assert!(handle.is_opened());
    }

    #[tokio::test]
    async fn test_removed_handle_ignores_operations() {
        let device = MockDevice::keyboard(RegistryEntryId(1));
        let handle = handle_for(&device);
        let mut failed = handle.open_failed().subscribe();
        handle.set_removed();
        assert!(handle.downgrade().upgrade().is_none());

        handle.async_open(OpenMode::Seize);
        handle.async_schedule();
        handle.async_set_caps_lock_led_state(LedState::On);
        flush(&handle);
        assert!(failed.try_recv().is_err());
        assert_eq!(device.open_count(), 0);
        assert!(!device.is_scheduled());
        assert_eq!(device.element_value(1000), None);
        assert!(!handle.validate());
    }

    #[tokio::test]
    async fn test_values_arrive_as_one_batch_with_release_marker() {
        let device = MockDevice::keyboard(RegistryEntryId(1));
        let handle = handle_for(&device);
        let mut batches = handle.values_arrived().subscribe();
        open_and_start(&handle, &device).await;

        // a down, b down, a up: no marker
        device.push_values(&[value(1, 0x04, 1), value(2, 0x05, 1), value(3, 0x04, 0)]);
        let batch = next(&mut batches).await;
        assert_eq!(batch.len(), 3);
        assert!(!batch
            .iter()
            .any(|e| e.event == Event::DeviceKeysAndPointingButtonsAreReleased));

        device.push_value(0x05, 0);
        let batch = next(&mut batches).await;
        let kinds: Vec<_> = batch.iter().map(|e| (e.event, e.event_type)).collect();
        assert_eq!(
            kinds,
            vec![
                (Event::KeyCode(KeyCode(0x05)), EventType::KeyUp),
                (Event::DeviceKeysAndPointingButtonsAreReleased, EventType::Single),
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_values_emit_nothing() {
        let device = MockDevice::keyboard(RegistryEntryId(1));
        let handle = handle_for(&device);
        let mut batches = handle.values_arrived().subscribe();
        open_and_start(&handle, &device).await;

        device.push_value(9999, 1);
        flush(&handle);
        assert!(batches.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_report_callback_uses_advertised_size() {
        let device = MockDevice::keyboard(RegistryEntryId(1));
        let handle = handle_for(&device);
        let mut reports = handle.report_arrived().subscribe();

        handle.async_enable_report_callback();
        handle.async_schedule();
        flush(&handle);
        assert!(device.has_report_callback() && device.is_scheduled());
        assert_eq!(device.report_buffer_size(), 8);

        device.push_report(RawInputReport {
            report_type: ReportType::Input,
            report_id: 1,
            bytes: vec![0, 0, 4, 0, 0, 0, 0, 0],
        });
        let report = next(&mut reports).await;
        assert_eq!(report.device_id, handle.device_id());
        assert_eq!(report.bytes[2], 4);

        handle.async_disable_report_callback();
        flush(&handle);
        assert!(!device.has_report_callback());
    }

    #[tokio::test]
    async fn test_report_buffer_defaults_to_32() {
        let device = MockDevice::mouse(RegistryEntryId(1));
        let handle = handle_for(&device);
        handle.async_enable_report_callback();
        flush(&handle);
        assert_eq!(device.report_buffer_size(), 32);
    }

    #[tokio::test]
    async fn test_caps_lock_led() {
        let device = MockDevice::keyboard(RegistryEntryId(1));
        let handle = handle_for(&device);

        handle.async_set_caps_lock_led_state(LedState::On);
        flush(&handle);
        assert_eq!(device.element_value(1000), Some(1));
        assert_eq!(handle.caps_lock_led_state(), Some(LedState::On));

        handle.async_set_caps_lock_led_state(LedState::Off);
        flush(&handle);
        assert_eq!(device.element_value(1000), Some(0));

        // No LED element: silently nothing.
        let mouse = MockDevice::mouse(RegistryEntryId(2));
        let mouse_handle = handle_for(&mouse);
        mouse_handle.async_set_caps_lock_led_state(LedState::On);
        assert_eq!(mouse_handle.caps_lock_led_state(), None);
    }

    #[tokio::test]
    async fn test_set_report_is_fire_and_forget() {
        let device = MockDevice::keyboard(RegistryEntryId(1));
        let handle = handle_for(&device);
        let mut opened = handle.opened().subscribe();

        // Not open yet: the failure is only logged.
        handle.async_set_report(ReportType::Output, 0, vec![1]);
        handle.async_open(OpenMode::Shared);
        next(&mut opened).await;
        handle.async_set_report(ReportType::Output, 0, vec![2]);
        flush(&handle);
        assert_eq!(device.sent_reports()[0].bytes, vec![2]);
    }

    #[tokio::test]
    async fn test_drop_tears_down_platform_state() {
        let device = MockDevice::keyboard(RegistryEntryId(1));
        let handle = handle_for(&device);
        let mut opened = handle.opened().subscribe();
        open_and_start(&handle, &device).await;
        next(&mut opened).await;

        drop(handle);
        assert!(!device.is_open());
        assert!(!device.is_scheduled());
        assert!(!device.is_queue_started());
    }

    #[tokio::test]
    async fn test_queue_creation_failure_is_not_fatal() {
        let device = MockDevice::keyboard(RegistryEntryId(1));
        device.fail_queue_creation(DeviceError::Io("no queue".into()));
        let handle = handle_for(&device);
        let mut opened = handle.opened().subscribe();
        handle.async_start_value_queue();
        handle.async_open(OpenMode::Seize);
        next(&mut opened).await;
        assert!(!device.is_queue_started());
    }

    #[tokio::test]
    async fn test_modifiers_and_repeat_are_tracked() {
        let device = MockDevice::keyboard(RegistryEntryId(1));
        let handle = handle_for(&device);
        let mut batches = handle.values_arrived().subscribe();
        open_and_start(&handle, &device).await;

        // left shift down, a down
        device.push_values(&[value(1, 0xE1, 1), value(2, 0x04, 1)]);
        next(&mut batches).await;
        assert_eq!(handle.pressed_modifier_flags(), vec![ModifierFlag::LeftShift]);
        assert!(handle.is_key_repeating());

        device.push_value(0x04, 0);
        next(&mut batches).await;
        assert!(!handle.is_key_repeating());
        assert_eq!(handle.pressed_modifier_flags(), vec![ModifierFlag::LeftShift]);

        device.push_value(0xE1, 0);
        next(&mut batches).await;
        assert!(handle.pressed_modifier_flags().is_empty());
    }

    #[tokio::test]
    async fn test_close_forgets_held_input() {
        let device = MockDevice::mouse(RegistryEntryId(1));
        let handle = handle_for(&device);
        let mut batches = handle.values_arrived().subscribe();
        let mut closed = handle.closed().subscribe();
        open_and_start(&handle, &device).await;

        device.push_value(1, 1);
        next(&mut batches).await;
        assert!(handle.has_pressed_pointing_buttons());

        handle.async_close();
        next(&mut closed).await;
        assert!(!handle.has_pressed_pointing_buttons());
    }

    #[tokio::test]
    async fn test_disabled_device_delivers_nothing() {
        let device = MockDevice::keyboard(RegistryEntryId(1));
        let handle = handle_for(&device);
        let mut batches = handle.values_arrived().subscribe();
        let mut disabled = handle.device_disabled().subscribe();
        let mut enabled = handle.device_enabled().subscribe();
        open_and_start(&handle, &device).await;

        handle.async_disable();
        next(&mut disabled).await;
        assert!(handle.is_disabled());

        // Disabling twice signals once.
        handle.async_disable();
        device.push_value(0x04, 1);
        flush(&handle);
        assert!(batches.try_recv().is_err());
        assert!(disabled.try_recv().is_err());
        // Held keys are still tracked while disabled.
        assert!(handle.is_key_repeating());

        handle.async_enable();
        next(&mut enabled).await;
        device.push_value(0x04, 0);
        let batch = next(&mut batches).await;
        assert_eq!(batch.entries()[0].event, Event::KeyCode(KeyCode(0x04)));
        assert_eq!(
            batch.entries()[1].event,
            Event::DeviceKeysAndPointingButtonsAreReleased
        );
    }
}
