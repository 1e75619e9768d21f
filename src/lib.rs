//! Device lifecycle, exclusive grabbing and event normalization for HID
//! input remappers
//!
//! This crate turns raw input-device activity into ordered, typed event
//! batches while taking exclusive control of the devices it manages:
//!
//! - [`DeviceMonitor`] watches the platform registry and owns one
//!   [`DeviceHandle`] per matched device
//! - [`DeviceHandle`] opens, schedules and decodes one device
//! - [`DeviceGrabber`] retries seizing a device until it succeeds, and
//!   otherwise observes it through a shared open
//! - [`KeyStateTracker`] and [`ButtonStateAggregator`] keep downstream
//!   key/button state consistent
//!
//! The platform is abstracted behind [`DeviceRegistry`] and
//! [`PlatformDevice`]; [`mock`] provides an in-memory implementation and the
//! `hidseize-evdev` crate a Linux one.

pub mod button_state_aggregator;
pub mod config;
pub mod device_grabber;
pub mod device_handle;
pub mod device_monitor;
pub mod device_properties;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod key_state_tracker;
pub mod keyboard_repeat_detector;
pub mod log_reducer;
pub mod mock;
pub mod platform;
pub mod predicate;
pub mod signal;
pub mod types;

pub use button_state_aggregator::{ActivePointingButton, ButtonStateAggregator, Buttons, Polarity};
pub use config::{Config, DeviceConfig, GrabberConfig, PointingMotionConfig};
pub use device_grabber::DeviceGrabber;
pub use device_handle::{DeviceHandle, DeviceRef, InputReport};
pub use device_monitor::DeviceMonitor;
pub use device_properties::DeviceProperties;
pub use dispatcher::{Dispatcher, Timer, TimerControl};
pub use error::{ConfigError, DeviceError};
pub use event::{
    ConsumerKeyCode, Entry, Event, EventQueue, EventType, KeyCode, ModifierFlag,
    MomentarySwitchEvent, PointingButton, PointingMotion,
};
pub use key_state_tracker::KeyStateTracker;
pub use keyboard_repeat_detector::KeyboardRepeatDetector;
pub use log_reducer::LogReducer;
pub use platform::{
    DeviceFilter, DeviceRegistry, HidElement, HidValue, PlatformDevice, RawDeviceProperties,
    RawInputReport, RegistryNotification, RegistryWatch,
};
pub use predicate::PredicateChain;
pub use signal::{Connection, Signal};
pub use types::{
    usage, usage_page, AbsoluteTime, DeviceId, ElementCookie, GrabbableState, LedState,
    LocationId, OpenMode, ProductId, RegistryEntryId, ReportType, Usage, UsagePage, UsagePair,
    VendorId,
};
