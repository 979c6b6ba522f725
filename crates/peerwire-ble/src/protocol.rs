//! BLE protocol constants and device naming

use uuid::Uuid;

// ----------------------------------------------------------------------------
// BLE Service and Characteristic UUIDs
// ----------------------------------------------------------------------------

/// peerwire BLE service UUID
pub const PEERWIRE_SERVICE_UUID: Uuid = Uuid::from_u128(0x7A1C0001_4B2E_4F0D_9C3A_5E61D2B8A0F1);

/// Characteristic the central writes chunks to
pub const PEERWIRE_TX_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x7A1C0002_4B2E_4F0D_9C3A_5E61D2B8A0F1);

/// Characteristic the peripheral notifies chunks on
pub const PEERWIRE_RX_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x7A1C0003_4B2E_4F0D_9C3A_5E61D2B8A0F1);

pub const DEFAULT_DEVICE_NAME_PREFIX: &str = "peerwire-";

// ----------------------------------------------------------------------------
// Device Names
// ----------------------------------------------------------------------------

/// Advertised device name for a logical name
pub fn device_name(prefix: &str, logical_name: &str) -> String {
    format!("{}{}", prefix, logical_name)
}

/// Logical name carried by an advertised device name, if it has our prefix
pub fn logical_name_from_device(device_name: &str, prefix: &str) -> Option<String> {
    device_name
        .strip_prefix(prefix)
        .filter(|rest| !rest.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_name_roundtrip() {
        let name = device_name(DEFAULT_DEVICE_NAME_PREFIX, "kitchen");
        assert_eq!(name, "peerwire-kitchen");
        assert_eq!(
            logical_name_from_device(&name, DEFAULT_DEVICE_NAME_PREFIX).as_deref(),
            Some("kitchen")
        );
    }

    #[test]
    fn foreign_or_bare_names_ignored() {
        assert!(logical_name_from_device("Headphones", DEFAULT_DEVICE_NAME_PREFIX).is_none());
        assert!(logical_name_from_device("peerwire-", DEFAULT_DEVICE_NAME_PREFIX).is_none());
    }
}
