//! Common types for the transport layer

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::error::TransportError;

/// Canonical hardware address of a peripheral.
///
/// Six hex octets, colon-separated, uppercase (`AA:BB:CC:DD:EE:FF`).
/// Parsing normalizes case; anything else is rejected, so a constructed
/// value is always in canonical form.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct DeviceAddress(String);

impl DeviceAddress {
    /// The canonical string form
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for DeviceAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DeviceAddress {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let octets: Vec<_> = s.split(':').collect();
        if octets.len() != 6 {
            return Err(TransportError::InvalidArgument(format!(
                "bad device address {s:?}: expected six colon-separated octets"
            )));
        }
        for octet in &octets {
            if octet.len() != 2 || !octet.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(TransportError::InvalidArgument(format!(
                    "bad device address {s:?}: octet {octet:?} is not two hex digits"
                )));
            }
        }
        Ok(DeviceAddress(s.to_uppercase()))
    }
}

impl Serialize for DeviceAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for DeviceAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A peripheral seen during a discovery scan
#[derive(Debug, Clone)]
pub struct DiscoveredPeripheral {
    /// Hardware address
    pub address: DeviceAddress,
    /// Advertised local name, if any
    pub local_name: Option<String>,
    /// Manufacturer-specific advertisement data, keyed by company id
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
}

/// Callback invoked for every notification on a subscribed characteristic.
///
/// Handlers must not block; heavy work belongs on a task fed by the handler.
pub type NotificationHandler = Arc<dyn Fn(&DeviceAddress, Uuid, &[u8]) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_parses_and_normalizes() {
        let addr: DeviceAddress = "aa:bb:cc:dd:ee:01".parse().unwrap();
        assert_eq!(addr.as_str(), "AA:BB:CC:DD:EE:01");
    }

    #[test]
    fn address_rejects_malformed() {
        assert!("AA:BB:CC:DD:EE".parse::<DeviceAddress>().is_err());
        assert!("AA:BB:CC:DD:EE:GG".parse::<DeviceAddress>().is_err());
        assert!("AABBCCDDEE01".parse::<DeviceAddress>().is_err());
        assert!("".parse::<DeviceAddress>().is_err());
    }
}
