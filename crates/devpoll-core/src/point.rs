//! Device and point data model.
//!
//! Points are addressed by their BACnet object identifier (object type plus
//! instance number). The textual form `analog-input:3` is used wherever an
//! identifier crosses a process boundary: the configuration store, the HTTP
//! gateway and the CLI.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// BACnet object type of a point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectType {
    /// analog-input (0)
    AnalogInput,
    /// analog-output (1)
    AnalogOutput,
    /// analog-value (2)
    AnalogValue,
    /// binary-input (3)
    BinaryInput,
    /// binary-output (4)
    BinaryOutput,
    /// binary-value (5)
    BinaryValue,
    /// device (8)
    Device,
    /// multi-state-input (13)
    MultiStateInput,
    /// multi-state-output (14)
    MultiStateOutput,
    /// multi-state-value (19)
    MultiStateValue,
    /// Any other standard or proprietary type, by numeric code
    Other(u16),
}

const NAMED_TYPES: [(ObjectType, &str, u16); 10] = [
    (ObjectType::AnalogInput, "analog-input", 0),
    (ObjectType::AnalogOutput, "analog-output", 1),
    (ObjectType::AnalogValue, "analog-value", 2),
    (ObjectType::BinaryInput, "binary-input", 3),
    (ObjectType::BinaryOutput, "binary-output", 4),
    (ObjectType::BinaryValue, "binary-value", 5),
    (ObjectType::Device, "device", 8),
    (ObjectType::MultiStateInput, "multi-state-input", 13),
    (ObjectType::MultiStateOutput, "multi-state-output", 14),
    (ObjectType::MultiStateValue, "multi-state-value", 19),
];

impl ObjectType {
    /// Numeric BACnet object type code.
    #[must_use]
    pub fn code(self) -> u16 {
        if let Self::Other(code) = self {
            return code;
        }
        NAMED_TYPES
            .iter()
            .find(|(ty, _, _)| *ty == self)
            .map_or(0, |(_, _, code)| *code)
    }

    /// Object type for a numeric code, preferring the named variant.
    #[must_use]
    pub fn from_code(code: u16) -> Self {
        NAMED_TYPES
            .iter()
            .find(|(_, _, c)| *c == code)
            .map_or(Self::Other(code), |(ty, _, _)| *ty)
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match NAMED_TYPES.iter().find(|(ty, _, _)| ty == self) {
            Some((_, name, _)) => f.write_str(name),
            None => write!(f, "{}", self.code()),
        }
    }
}

impl FromStr for ObjectType {
    type Err = PointIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some((ty, _, _)) = NAMED_TYPES.iter().find(|(_, name, _)| *name == s) {
            return Ok(*ty);
        }
        s.parse::<u16>()
            .map(Self::from_code)
            .map_err(|_| PointIdError::UnknownObjectType(s.to_string()))
    }
}

/// Stable identity of a point: its BACnet object identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PointId {
    /// Object type
    pub object_type: ObjectType,
    /// Object instance number (22 bits on the wire)
    pub instance: u32,
}

/// Largest instance number a BACnet object identifier can carry.
pub const MAX_INSTANCE: u32 = (1 << 22) - 1;

impl PointId {
    /// Create a point identifier.
    #[must_use]
    pub fn new(object_type: ObjectType, instance: u32) -> Self {
        Self {
            object_type,
            instance,
        }
    }
}

impl fmt::Display for PointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.object_type, self.instance)
    }
}

impl FromStr for PointId {
    type Err = PointIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ty, instance) = s
            .rsplit_once(':')
            .ok_or_else(|| PointIdError::Malformed(s.to_string()))?;
        let object_type = ty.parse()?;
        let instance: u32 = instance
            .parse()
            .map_err(|_| PointIdError::Malformed(s.to_string()))?;
        if instance > MAX_INSTANCE {
            return Err(PointIdError::InstanceOutOfRange(instance));
        }
        Ok(Self::new(object_type, instance))
    }
}

impl TryFrom<String> for PointId {
    type Error = PointIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PointId> for String {
    fn from(value: PointId) -> Self {
        value.to_string()
    }
}

/// Errors parsing point identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PointIdError {
    /// Not of the form `type:instance`
    #[error("malformed point identifier: {0}")]
    Malformed(String),
    /// Object type name not recognised and not numeric
    #[error("unknown object type: {0}")]
    UnknownObjectType(String),
    /// Instance exceeds 22 bits
    #[error("instance number {0} out of range")]
    InstanceOutOfRange(u32),
}

/// Change-of-value usage for a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CovMode {
    /// Polling only
    #[default]
    None,
    /// Unconfirmed COV notifications
    Unconfirmed,
    /// Confirmed COV notifications
    Confirmed,
}

impl CovMode {
    /// Parse a stored or operator-supplied value, falling back to `None` for
    /// anything unrecognised.
    #[must_use]
    pub fn parse_lenient(s: &str) -> Self {
        s.parse().unwrap_or_default()
    }

    /// Canonical upper-case name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Unconfirmed => "UNCONFIRMED",
            Self::Confirmed => "CONFIRMED",
        }
    }
}

impl fmt::Display for CovMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CovMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NONE" => Ok(Self::None),
            "UNCONFIRMED" => Ok(Self::Unconfirmed),
            "CONFIRMED" => Ok(Self::Confirmed),
            other => Err(format!("unknown COV mode: {other}")),
        }
    }
}

/// Network identity of a device: MAC address on its network plus the device
/// object instance number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkIdentity {
    /// MAC address (`ip:port` for BACnet/IP, a single byte for MS/TP)
    pub mac: String,
    /// Device object instance number
    pub instance_number: u32,
}

impl NetworkIdentity {
    /// Create a network identity.
    #[must_use]
    pub fn new(mac: impl Into<String>, instance_number: u32) -> Self {
        Self {
            mac: mac.into(),
            instance_number,
        }
    }
}

impl fmt::Display for NetworkIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.mac, self.instance_number)
    }
}

/// Persisted settings of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// Display name, also the device's node path in the store
    pub name: String,
    /// Network identity
    #[serde(flatten)]
    pub identity: NetworkIdentity,
    /// Polling interval in milliseconds
    pub poll_interval_ms: u64,
    /// COV usage
    #[serde(default)]
    pub cov_mode: CovMode,
    /// COV subscription lease, only meaningful when COV is used
    #[serde(default)]
    pub cov_lease_minutes: u32,
    /// Administrative enable state
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl DeviceSettings {
    /// Polling interval as a duration.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// A located device, as returned by the resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteDevice {
    /// Identity the device answered on
    #[serde(flatten)]
    pub identity: NetworkIdentity,
    /// Device object name, if read
    #[serde(default)]
    pub object_name: Option<String>,
    /// Vendor name, if read
    #[serde(default)]
    pub vendor_name: Option<String>,
    /// Model name, if read
    #[serde(default)]
    pub model_name: Option<String>,
}

impl RemoteDevice {
    /// A device known only by its identity.
    #[must_use]
    pub fn bare(identity: NetworkIdentity) -> Self {
        Self {
            identity,
            object_name: None,
            vendor_name: None,
            model_name: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_id_text_form() {
        let id: PointId = "analog-input:3".parse().unwrap();
        assert_eq!(id, PointId::new(ObjectType::AnalogInput, 3));
        assert_eq!(id.to_string(), "analog-input:3");
    }

    #[test]
    fn point_id_numeric_type_maps_to_named() {
        let id: PointId = "5:12".parse().unwrap();
        assert_eq!(id.object_type, ObjectType::BinaryValue);

        let proprietary: PointId = "600:1".parse().unwrap();
        assert_eq!(proprietary.object_type, ObjectType::Other(600));
        assert_eq!(proprietary.to_string(), "600:1");
    }

    #[test]
    fn point_id_rejects_garbage() {
        assert!(matches!(
            "analog-input".parse::<PointId>(),
            Err(PointIdError::Malformed(_))
        ));
        assert!(matches!(
            "thermostat:1".parse::<PointId>(),
            Err(PointIdError::UnknownObjectType(_))
        ));
        assert!(matches!(
            "analog-input:4194304".parse::<PointId>(),
            Err(PointIdError::InstanceOutOfRange(4_194_304))
        ));
    }

    #[test]
    fn point_id_serializes_as_string() {
        let id = PointId::new(ObjectType::MultiStateValue, 7);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"multi-state-value:7\"");
    }

    #[test]
    fn cov_mode_lenient_parse() {
        assert_eq!(CovMode::parse_lenient("CONFIRMED"), CovMode::Confirmed);
        assert_eq!(CovMode::parse_lenient("confirmed"), CovMode::None);
        assert_eq!(CovMode::parse_lenient(""), CovMode::None);
    }

    #[test]
    fn settings_defaults_from_json() {
        let settings: DeviceSettings = serde_json::from_value(serde_json::json!({
            "name": "ahu-1",
            "mac": "10.0.1.50:47808",
            "instance_number": 1001,
            "poll_interval_ms": 5000
        }))
        .unwrap();

        assert!(settings.enabled);
        assert_eq!(settings.cov_mode, CovMode::None);
        assert_eq!(settings.poll_interval(), Duration::from_secs(5));
    }
}
