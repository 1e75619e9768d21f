//! Registry observer owning the active device set
//!
//! The monitor watches the platform registry for every configured filter and
//! keeps one [`DeviceHandle`] per matched registry entry. Registry callbacks
//! may arrive on any thread; each one is re-dispatched onto the monitor's own
//! queue, which is the only place the active set is mutated.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::device_handle::{DeviceHandle, DeviceRef};
use crate::dispatcher::Dispatcher;
use crate::error::DeviceError;
use crate::platform::{
    DeviceFilter, DeviceRegistry, PlatformDevice, RawDeviceProperties, RegistryCallback,
    RegistryNotification, RegistryWatch,
};
use crate::predicate::PredicateChain;
use crate::signal::Signal;
use crate::types::{DeviceId, RegistryEntryId};

pub struct DeviceMonitor {
    weak_self: Weak<DeviceMonitor>,
    registry: Arc<dyn DeviceRegistry>,
    config: Config,
    dispatcher: Arc<Dispatcher>,
    filters: Mutex<Vec<DeviceFilter>>,
    watches: Mutex<Vec<Box<dyn RegistryWatch>>>,
    started: AtomicBool,
    devices: Mutex<BTreeMap<RegistryEntryId, Arc<DeviceHandle>>>,

    device_detecting: PredicateChain<RawDeviceProperties, bool>,
    device_detected: Signal<DeviceRef>,
    device_removed: Signal<DeviceRef>,
}

impl DeviceMonitor {
    pub fn new(registry: Arc<dyn DeviceRegistry>, config: Config) -> Result<Arc<Self>, DeviceError> {
        let dispatcher = Arc::new(Dispatcher::new("device-monitor")?);
        Ok(Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            registry,
            config,
            dispatcher,
            filters: Mutex::new(Vec::new()),
            watches: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            devices: Mutex::new(BTreeMap::new()),
            device_detecting: PredicateChain::new(true),
            device_detected: Signal::new(),
            device_removed: Signal::new(),
        }))
    }

    /// Set the usage filters to observe; ignored once started
    pub fn configure(&self, filters: Vec<DeviceFilter>) {
        if self.started.load(Ordering::Acquire) {
            warn!("device monitor is already started, ignoring new filters");
            return;
        }
        *self.filters.lock() = filters;
    }

    /// Veto chain run over every candidate; the first `false` rejects it
    pub fn device_detecting(&self) -> &PredicateChain<RawDeviceProperties, bool> {
        &self.device_detecting
    }

    pub fn device_detected(&self) -> &Signal<DeviceRef> {
        &self.device_detected
    }

    /// Fired once per detected device when it leaves the system; the
    /// reference no longer upgrades
    pub fn device_removed(&self) -> &Signal<DeviceRef> {
        &self.device_removed
    }

    /// Begin observing the registry; returns immediately
    pub fn start(&self) {
        let weak = self.weak_self.clone();
        self.dispatcher.enqueue(move || {
            if let Some(monitor) = weak.upgrade() {
                monitor.start_watching();
            }
        });
    }

    /// Stop observing and release every handle
    ///
    /// No removal notifications are emitted for the released handles.
    pub fn stop(&self) {
        let weak = self.weak_self.clone();
        self.dispatcher.run_sync(move || {
            if let Some(monitor) = weak.upgrade() {
                monitor.stop_watching();
            }
        });
    }

    /// Point-in-time copy of the active devices, ordered by registry id
    pub fn snapshot(&self) -> Vec<DeviceRef> {
        self.devices
            .lock()
            .values()
            .map(|handle| handle.downgrade())
            .collect()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Wait until every notification received so far has been processed
    pub fn flush(&self) -> bool {
        self.dispatcher.run_sync(|| {})
    }

    fn start_watching(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }

        let filters = self.filters.lock().clone();
        let mut watches = Vec::with_capacity(filters.len());
        for filter in filters {
            match self.registry.watch(filter, self.registry_callback()) {
                Ok(watch) => watches.push(watch),
                Err(e) => warn!(
                    "Not observing usage page 0x{:02X} usage 0x{:02X}: {}",
                    filter.usage_page.0, filter.usage.0, e
                ),
            }
        }
        info!("device monitor started ({} filters observed)", watches.len());
        self.watches.lock().extend(watches);
    }

    fn registry_callback(&self) -> RegistryCallback {
        let weak = self.weak_self.clone();
        let dispatcher = Arc::clone(&self.dispatcher);
        Arc::new(move |notification: RegistryNotification| {
            let weak = weak.clone();
            dispatcher.enqueue(move || {
                if let Some(monitor) = weak.upgrade() {
                    monitor.handle_notification(notification);
                }
            });
        })
    }

    fn stop_watching(&self) {
        let watches = std::mem::take(&mut *self.watches.lock());
        for mut watch in watches {
            watch.cancel();
        }
        self.started.store(false, Ordering::Release);

        let devices = std::mem::take(&mut *self.devices.lock());
        for handle in devices.values() {
            handle.set_removed();
        }
        info!("device monitor stopped ({} devices released)", devices.len());
    }

    fn handle_notification(&self, notification: RegistryNotification) {
        // A callback already in flight when stop() ran.
        if !self.started.load(Ordering::Acquire) {
            return;
        }
        match notification {
            RegistryNotification::Matched(device) => self.on_matched(device),
            RegistryNotification::Terminated(id) => self.on_terminated(id),
        }
    }

    fn on_matched(&self, device: Arc<dyn PlatformDevice>) {
        let registry_entry_id = device.registry_entry_id();
        if self.devices.lock().contains_key(&registry_entry_id) {
            debug!("registry entry {} is already tracked", registry_entry_id);
            return;
        }

        if !self.device_detecting.evaluate(&device.properties()) {
            debug!("registry entry {} is ignored", registry_entry_id);
            return;
        }

        let handle = match DeviceHandle::new(DeviceId::next(), device, &self.config) {
            Ok(handle) => handle,
            Err(e) => {
                error!("Failed to create handle for registry entry {}: {}", registry_entry_id, e);
                return;
            }
        };

        info!("{} is matched", handle.name_for_log());
        match serde_json::to_string(handle.properties().as_ref()) {
            Ok(json) => debug!("{}", json),
            Err(e) => debug!("Failed to serialize device properties: {}", e),
        }

        let device_ref = handle.downgrade();
        self.devices.lock().insert(registry_entry_id, handle);
        self.device_detected.emit(&device_ref);
    }

    fn on_terminated(&self, registry_entry_id: RegistryEntryId) {
        let Some(handle) = self.devices.lock().remove(&registry_entry_id) else {
            return;
        };
        handle.set_removed();
        info!("{} is terminated", handle.name_for_log());
        self.device_removed.emit(&handle.downgrade());
    }
}

impl Drop for DeviceMonitor {
    fn drop(&mut self) {
        for mut watch in self.watches.get_mut().drain(..) {
            watch.cancel();
        }
        self.dispatcher.terminate();

        for handle in self.devices.get_mut().values() {
            handle.set_removed();
        }
        self.devices.get_mut().clear();
    }
}
