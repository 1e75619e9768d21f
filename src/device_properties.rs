//! Immutable identity of one connected device

use serde::Serialize;

use crate::platform::RawDeviceProperties;
use crate::types::{
    usage, usage_page, DeviceId, LocationId, ProductId, RegistryEntryId, Usage, UsagePage,
    UsagePair, VendorId,
};

/// Transports that only ever carry built-in hardware
const BUILT_IN_TRANSPORTS: &[&str] = &["SPI", "FIFO", "I2C", "i8042"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceProperties {
    pub device_id: DeviceId,
    pub registry_entry_id: RegistryEntryId,
    pub vendor_id: VendorId,
    pub product_id: ProductId,
    pub location_id: Option<LocationId>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub transport: Option<String>,
    pub max_input_report_size: Option<usize>,
    pub device_usages: Vec<UsagePair>,
    pub is_keyboard: bool,
    pub is_pointing_device: bool,
    pub is_built_in_keyboard: bool,
    pub is_built_in_trackpad: bool,
}

impl DeviceProperties {
    pub fn new(
        device_id: DeviceId,
        registry_entry_id: RegistryEntryId,
        raw: RawDeviceProperties,
    ) -> Self {
        let is_keyboard =
            raw.conforms_to(usage_page::GENERIC_DESKTOP, usage::generic_desktop::KEYBOARD);
        let is_pointing_device = raw
            .conforms_to(usage_page::GENERIC_DESKTOP, usage::generic_desktop::POINTER)
            || raw.conforms_to(usage_page::GENERIC_DESKTOP, usage::generic_desktop::MOUSE);

        let built_in = raw
            .product
            .as_deref()
            .is_some_and(|p| p.contains("Internal "))
            || raw
                .transport
                .as_deref()
                .is_some_and(|t| BUILT_IN_TRANSPORTS.contains(&t));

        Self {
            device_id,
            registry_entry_id,
            vendor_id: raw.vendor_id,
            product_id: raw.product_id,
            location_id: raw.location_id,
            manufacturer: raw.manufacturer,
            product: raw.product,
            serial_number: raw.serial_number,
            transport: raw.transport,
            max_input_report_size: raw.max_input_report_size,
            device_usages: raw.device_usages,
            is_keyboard,
            is_pointing_device,
            is_built_in_keyboard: built_in && is_keyboard && !is_pointing_device,
            is_built_in_trackpad: built_in && is_pointing_device && !is_keyboard,
        }
    }

    pub fn conforms_to(&self, usage_page: UsagePage, usage: Usage) -> bool {
        self.device_usages
            .iter()
            .any(|pair| pair.usage_page == usage_page && pair.usage == usage)
    }

    /// Human-readable name used in every log line about this device
    pub fn name_for_log(&self) -> String {
        let name = match &self.product {
            Some(product) if !product.is_empty() => product.clone(),
            _ => format!(
                "(vendor_id:0x{:04X}, product_id:0x{:04X})",
                self.vendor_id.0, self.product_id.0
            ),
        };
        format!("{} (device_id:{})", name, self.device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(product: Option<&str>, transport: Option<&str>, usages: &[(UsagePage, Usage)]) -> RawDeviceProperties {
        RawDeviceProperties {
            vendor_id: VendorId(0x05AC),
            product_id: ProductId(0x0342),
            product: product.map(String::from),
            transport: transport.map(String::from),
            device_usages: usages.iter().map(|(p, u)| UsagePair::new(*p, *u)).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_keyboard_and_pointing_flags() {
        let props = DeviceProperties::new(
            DeviceId(1),
            RegistryEntryId(10),
            raw(
                Some("USB Keyboard"),
                Some("USB"),
                &[(usage_page::GENERIC_DESKTOP, usage::generic_desktop::KEYBOARD)],
            ),
        );
        assert!(props.is_keyboard);
        assert!(!props.is_pointing_device);
        assert!(!props.is_built_in_keyboard);

        let props = DeviceProperties::new(
            DeviceId(2),
            RegistryEntryId(11),
            raw(
                None,
                None,
                &[(usage_page::GENERIC_DESKTOP, usage::generic_desktop::MOUSE)],
            ),
        );
        assert!(props.is_pointing_device);
    }

    #[test]
    fn test_built_in_detection() {
        let keyboard = DeviceProperties::new(
            DeviceId(1),
            RegistryEntryId(1),
            raw(
                Some("Apple Internal Keyboard / Trackpad"),
                Some("SPI"),
                &[(usage_page::GENERIC_DESKTOP, usage::generic_desktop::KEYBOARD)],
            ),
        );
        assert!(keyboard.is_built_in_keyboard);
        assert!(!keyboard.is_built_in_trackpad);

        let trackpad = DeviceProperties::new(
            DeviceId(2),
            RegistryEntryId(2),
            raw(
                Some("Touchpad"),
                Some("I2C"),
                &[(usage_page::GENERIC_DESKTOP, usage::generic_desktop::POINTER)],
            ),
        );
        assert!(trackpad.is_built_in_trackpad);

        let combo = DeviceProperties::new(
            DeviceId(3),
            RegistryEntryId(3),
            raw(
                Some("Apple Internal Keyboard / Trackpad"),
                None,
                &[
                    (usage_page::GENERIC_DESKTOP, usage::generic_desktop::KEYBOARD),
                    (usage_page::GENERIC_DESKTOP, usage::generic_desktop::MOUSE),
                ],
            ),
        );
        assert!(!combo.is_built_in_keyboard);
        assert!(!combo.is_built_in_trackpad);
    }

    #[test]
    fn test_name_for_log() {
        let named = DeviceProperties::new(
            DeviceId(7),
            RegistryEntryId(1),
            raw(Some("Magic Mouse"), None, &[]),
        );
        assert_eq!(named.name_for_log(), "Magic Mouse (device_id:7)");

        let unnamed = DeviceProperties::new(DeviceId(8), RegistryEntryId(1), raw(None, None, &[]));
        assert_eq!(
            unnamed.name_for_log(),
            "(vendor_id:0x05AC, product_id:0x0342) (device_id:8)"
        );
    }

    #[test]
    fn test_serializes_to_json() {
        let props = DeviceProperties::new(DeviceId(3), RegistryEntryId(4), raw(Some("Pad"), None, &[]));
        let json = serde_json::to_value(&props).unwrap();
        assert_eq!(json["device_id"], 3);
        assert_eq!(json["product"], "Pad");
        assert_eq!(json["is_keyboard"], false);
    }
}
