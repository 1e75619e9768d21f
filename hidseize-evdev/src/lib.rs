//! Linux backend for hidseize
//!
//! Implements the platform traits on top of evdev nodes:
//!
//! - [`EvdevRegistry`] enumerates `/dev/input/event*` and, with the
//!   `hotplug` feature, follows udev add/remove events
//! - [`EvdevDevice`] opens a node, seizes it with `EVIOCGRAB`, reads it on a
//!   reader thread and writes LEDs
//!
//! Linux event codes are translated to HID usage pairs by [`usage_map`].
//! evdev exposes no raw reports, so report writes fail with
//! [`DeviceError::Unsupported`](hidseize::DeviceError::Unsupported).

#![cfg(target_os = "linux")]

mod device;
mod registry;
pub mod usage_map;

pub use device::EvdevDevice;
pub use registry::EvdevRegistry;
