//! One `/dev/input/event*` node as a [`PlatformDevice`]

use std::collections::VecDeque;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use evdev::{Device, EventType, InputEvent};
use parking_lot::Mutex;
use tracing::{debug, warn};

use hidseize::platform::{InputReportCallback, ValueAvailableCallback};
use hidseize::{
    usage, usage_page, AbsoluteTime, DeviceError, ElementCookie, HidElement, HidValue, OpenMode,
    PlatformDevice, ProductId, RawDeviceProperties, RegistryEntryId, ReportType, UsagePair,
    VendorId,
};

use crate::usage_map::{self, EV_KEY, EV_LED, EV_REL};

/// Poll timeout of the reader thread; bounds how long close() waits
const READ_POLL_TIMEOUT_MS: i32 = 100;

/// Logical range advertised for relative axes
const RELATIVE_AXIS_RANGE: (i64, i64) = (-32768, 32767);

/// Value queue shared with the reader thread
#[derive(Default)]
struct ValueQueue {
    values: Mutex<VecDeque<HidValue>>,
    depth: AtomicUsize,
    started: AtomicBool,
    scheduled: AtomicBool,
    callback: Mutex<Option<ValueAvailableCallback>>,
}

impl ValueQueue {
    /// Append a batch, dropping the oldest values past `depth`
    ///
    /// Returns how many values were dropped.
    fn push(&self, name: &str, batch: Vec<HidValue>) -> usize {
        if batch.is_empty() || !self.started.load(Ordering::Acquire) {
            return 0;
        }
        let mut dropped = 0;
        {
            let depth = self.depth.load(Ordering::Relaxed).max(1);
            let mut values = self.values.lock();
            for value in batch {
                if values.len() >= depth {
                    values.pop_front();
                    dropped += 1;
                }
                values.push_back(value);
            }
        }
        if dropped > 0 {
            warn!("{} value queue full, dropped {} oldest values", name, dropped);
        }
        if self.scheduled.load(Ordering::Acquire) {
            let callback = self.callback.lock().clone();
            if let Some(callback) = callback {
                callback();
            }
        }
        dropped
    }
}

struct Reader {
    shutdown: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

struct OpenDevice {
    device: Arc<Mutex<Device>>,
    mode: OpenMode,
    reader: Reader,
}

pub struct EvdevDevice {
    path: PathBuf,
    registry_entry_id: RegistryEntryId,
    properties: RawDeviceProperties,
    elements: Vec<HidElement>,
    queue: Arc<ValueQueue>,
    open: Mutex<Option<OpenDevice>>,
}

impl EvdevDevice {
    /// Read identity and capabilities of the node at `path`
    ///
    /// The node is opened only for the duration of the probe.
    pub fn probe(path: impl AsRef<Path>) -> io::Result<Arc<Self>> {
        let device = Device::open(path.as_ref())?;
        Self::from_device(path, &device)
    }

    /// Build from a node the caller already opened, e.g. during enumeration
    pub(crate) fn from_device(path: impl AsRef<Path>, device: &Device) -> io::Result<Arc<Self>> {
        let path = path.as_ref().to_path_buf();
        let registry_entry_id = registry_entry_id(&path)?;

        Ok(Arc::new(Self {
            properties: properties_of(device),
            elements: elements_of(device),
            path,
            registry_entry_id,
            queue: Arc::new(ValueQueue::default()),
            open: Mutex::new(None),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_open_device<T>(
        &self,
        f: impl FnOnce(&mut Device) -> io::Result<T>,
    ) -> Result<T, DeviceError> {
        let open = self.open.lock();
        let Some(open) = open.as_ref() else {
            return Err(DeviceError::NotOpen);
        };
        let mut device = open.device.lock();
        f(&mut device).map_err(DeviceError::from)
    }
}

/// Registry id of a node: its device number, which udev reports on removal
pub(crate) fn registry_entry_id(path: &Path) -> io::Result<RegistryEntryId> {
    Ok(RegistryEntryId(std::fs::metadata(path)?.rdev()))
}

fn properties_of(device: &Device) -> RawDeviceProperties {
    let id = device.input_id();
    let keys = device.supported_keys();
    let has_key = |code: u16| keys.is_some_and(|k| k.contains(evdev::Key::new(code)));
    let has_rel = |code: u16| {
        device
            .supported_relative_axes()
            .is_some_and(|r| r.contains(evdev::RelativeAxisType(code)))
    };

    let mut device_usages = Vec::new();
    // KEY_A and KEY_SPACE
    if has_key(30) && has_key(57) {
        device_usages.push(UsagePair::new(
            usage_page::GENERIC_DESKTOP,
            usage::generic_desktop::KEYBOARD,
        ));
    }
    if has_key(usage_map::BTN_LEFT) && has_rel(usage_map::REL_X) {
        device_usages.push(UsagePair::new(
            usage_page::GENERIC_DESKTOP,
            usage::generic_desktop::POINTER,
        ));
        device_usages.push(UsagePair::new(
            usage_page::GENERIC_DESKTOP,
            usage::generic_desktop::MOUSE,
        ));
    }
    // KEY_VOLUMEUP
    if has_key(115) {
        device_usages.push(UsagePair::new(
            usage_page::CONSUMER,
            usage::consumer::CONSUMER_CONTROL,
        ));
    }

    RawDeviceProperties {
        vendor_id: VendorId(id.vendor()),
        product_id: ProductId(id.product()),
        location_id: None,
        manufacturer: None,
        product: device.name().map(String::from),
        serial_number: device.unique_name().map(String::from),
        transport: usage_map::transport_name(id.bus_type().0).map(String::from),
        max_input_report_size: None,
        device_usages,
    }
}

fn elements_of(device: &Device) -> Vec<HidElement> {
    let mut elements = Vec::new();
    let mut add = |ev_type: u16, code: u16, pair: UsagePair, range: (i64, i64)| {
        elements.push(HidElement {
            cookie: usage_map::cookie(ev_type, code),
            usage_page: pair.usage_page,
            usage: pair.usage,
            logical_min: range.0,
            logical_max: range.1,
        });
    };

    if let Some(keys) = device.supported_keys() {
        for key in keys.iter() {
            if let Some(pair) = usage_map::key_usage(key.code()) {
                add(EV_KEY, key.code(), pair, (0, 1));
            }
        }
    }
    if let Some(axes) = device.supported_relative_axes() {
        for axis in axes.iter() {
            if let Some(pair) = usage_map::relative_usage(axis.0) {
                add(EV_REL, axis.0, pair, RELATIVE_AXIS_RANGE);
            }
        }
    }
    if let Some(leds) = device.supported_leds() {
        for led in leds.iter() {
            if let Some(pair) = usage_map::led_usage(led.0) {
                add(EV_LED, led.0, pair, (0, 1));
            }
        }
    }
    elements
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fd belongs to an open evdev node owned by the caller.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above; only O_NONBLOCK is added.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Wait up to `timeout_ms` for the node to become readable
fn wait_readable(fd: RawFd, timeout_ms: i32) -> io::Result<bool> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    // SAFETY: pollfd is a valid, exclusively borrowed array of length 1.
    let rc = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
    match rc {
        n if n < 0 => {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                Ok(false)
            } else {
                Err(err)
            }
        }
        0 => Ok(false),
        _ if pollfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 => {
            Err(io::Error::from_raw_os_error(libc::ENODEV))
        }
        _ => Ok(true),
    }
}

fn to_value(event: &InputEvent, time_stamp: AbsoluteTime) -> Option<HidValue> {
    let ev_type = event.event_type().0;
    match ev_type {
        // Autorepeat is synthesized by the consumer, not the device.
        EV_KEY if event.value() == 2 => None,
        EV_KEY | EV_REL | EV_LED => Some(HidValue {
            time_stamp,
            cookie: usage_map::cookie(ev_type, event.code()),
            integer_value: i64::from(event.value()),
        }),
        _ => None,
    }
}

fn run_reader_loop(
    name: String,
    device: Arc<Mutex<Device>>,
    fd: RawFd,
    queue: Arc<ValueQueue>,
    shutdown: Arc<AtomicBool>,
) {
    debug!("{} reader thread started", name);

    while !shutdown.load(Ordering::Relaxed) {
        match wait_readable(fd, READ_POLL_TIMEOUT_MS) {
            Ok(false) => continue,
            Ok(true) => {}
            Err(e) => {
                warn!("{} is no longer readable: {}", name, e);
                break;
            }
        }

        let batch: Vec<HidValue> = {
            let mut device = device.lock();
            match device.fetch_events() {
                Ok(events) => {
                    let now = AbsoluteTime::now();
                    events.filter_map(|e| to_value(&e, now)).collect()
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Vec::new(),
                Err(e) => {
                    warn!("{} read failed: {}", name, e);
                    break;
                }
            }
        };
        queue.push(&name, batch);
    }

    debug!("{} reader thread exiting", name);
}

impl PlatformDevice for EvdevDevice {
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
        let mut open = self.open.lock();
        if open.is_some() {
            return Ok(());
        }

        let mut device = Device::open(&self.path)?;
        let fd = device.as_raw_fd();
        set_nonblocking(fd)?;
        if mode == OpenMode::Seize {
            device.grab()?;
        }

        let device = Arc::new(Mutex::new(device));
        let shutdown = Arc::new(AtomicBool::new(false));
        let name = self.path.display().to_string();
        let thread = {
            let device = Arc::clone(&device);
            let queue = Arc::clone(&self.queue);
            let shutdown = Arc::clone(&shutdown);
            let thread_name = format!("evdev-reader-{}", name);
            std::thread::Builder::new()
                .name(thread_name)
                .spawn(move || run_reader_loop(name, device, fd, queue, shutdown))?
        };

        *open = Some(OpenDevice {
            device,
            mode,
            reader: Reader { shutdown, thread },
        });
        Ok(())
    }

    fn close(&self) -> Result<(), DeviceError> {
        let Some(open) = self.open.lock().take() else {
            return Err(DeviceError::NotOpen);
        };

        open.reader.shutdown.store(true, Ordering::SeqCst);
        if open.reader.thread.join().is_err() {
            warn!("{} reader thread panicked", self.path.display());
        }

        if open.mode == OpenMode::Seize {
            // The grab is also released when the fd closes below.
            if let Err(e) = open.device.lock().ungrab() {
                debug!("Failed to ungrab {}: {}", self.path.display(), e);
            }
        }
        Ok(())
    }

    fn schedule(&self) {
        self.queue.scheduled.store(true, Ordering::Release);
    }

    fn unschedule(&self) {
        self.queue.scheduled.store(false, Ordering::Release);
    }

    fn create_value_queue(
        &self,
        depth: usize,
        callback: ValueAvailableCallback,
    ) -> Result<(), DeviceError> {
        self.queue.depth.store(depth, Ordering::Relaxed);
        *self.queue.callback.lock() = Some(callback);
        Ok(())
    }

    fn start_queue(&self) {
        self.queue.started.store(true, Ordering::Release);
    }

    fn stop_queue(&self) {
        self.queue.started.store(false, Ordering::Release);
        self.queue.values.lock().clear();
    }

    fn copy_next_value(&self) -> Option<HidValue> {
        self.queue.values.lock().pop_front()
    }

    fn register_input_report_callback(
        &self,
        _buffer_size: usize,
        _callback: Option<InputReportCallback>,
    ) -> Result<(), DeviceError> {
        // evdev delivers decoded events only; the callback never fires.
        Ok(())
    }

    fn set_report(
        &self,
        _report_type: ReportType,
        _report_id: u32,
        _bytes: &[u8],
    ) -> Result<(), DeviceError> {
        Err(DeviceError::Unsupported(
            "evdev nodes do not expose raw reports".into(),
        ))
    }

    fn get_value(&self, cookie: ElementCookie) -> Result<i64, DeviceError> {
        let (ev_type, code) = usage_map::split_cookie(cookie);
        match ev_type {
            EV_LED => self.with_open_device(|device| {
                let leds = device.get_led_state()?;
                Ok(i64::from(leds.contains(evdev::LedType(code))))
            }),
            EV_KEY => self.with_open_device(|device| {
                let keys = device.get_key_state()?;
                Ok(i64::from(keys.contains(evdev::Key::new(code))))
            }),
            _ => Ok(0),
        }
    }

    fn set_value(&self, cookie: ElementCookie, value: i64) -> Result<(), DeviceError> {
        let (ev_type, code) = usage_map::split_cookie(cookie);
        if ev_type != EV_LED {
            return Err(DeviceError::Unsupported(format!(
                "cannot write event type 0x{:02X}",
                ev_type
            )));
        }
        let value = i32::try_from(value).unwrap_or(1);
        self.with_open_device(|device| {
            device.send_events(&[InputEvent::new(EventType::LED, code, value)])
        })
    }

    fn exists(&self) -> bool {
        registry_entry_id(&self.path).is_ok_and(|id| id == self.registry_entry_id)
    }
}

impl Drop for EvdevDevice {
    fn drop(&mut self) {
        if self.open.get_mut().is_some() {
            let _ = self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_autorepeat_is_dropped() {
        let t = AbsoluteTime(5);
        let down = InputEvent::new(EventType::KEY, 30, 1);
        let repeat = InputEvent::new(EventType::KEY, 30, 2);
        let sync = InputEvent::new(EventType::SYNCHRONIZATION, 0, 0);

        let value = to_value(&down, t).unwrap();
        assert_eq!(value.cookie, usage_map::cookie(EV_KEY, 30));
        assert_eq!(value.integer_value, 1);
        assert!(to_value(&repeat, t).is_none());
        assert!(to_value(&sync, t).is_none());
    }

    #[test]
    fn test_relative_values_keep_sign() {
        let event = InputEvent::new(EventType::RELATIVE, usage_map::REL_X, -3);
        let value = to_value(&event, AbsoluteTime(1)).unwrap();
        assert_eq!(value.integer_value, -3);
    }

    #[test]
    fn test_value_queue_respects_start_and_depth() {
        let queue = ValueQueue::default();
        queue.depth.store(2, Ordering::Relaxed);
        let v = |c: u32| HidValue {
            time_stamp: AbsoluteTime(0),
            cookie: ElementCookie(c),
            integer_value: 1,
        };

        assert_eq!(queue.push("test", vec![v(1)]), 0);
        assert!(queue.values.lock().is_empty());

        queue.started.store(true, Ordering::Release);
        assert_eq!(queue.push("test", vec![v(1), v(2), v(3)]), 1);
        let cookies: Vec<u32> = queue.values.lock().iter().map(|v| v.cookie.0).collect();
        assert_eq!(cookies, vec![2, 3]);

        assert_eq!(queue.push("test", vec![v(4), v(5)]), 2);
        let cookies: Vec<u32> = queue.values.lock().iter().map(|v| v.cookie.0).collect();
        assert_eq!(cookies, vec![4, 5]);
    }
}
