//! Core value objects for the bluetree GATT model.

use core::fmt;

use bytes::Bytes;
use uuid::Uuid;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// An opaque identifier addressing one remote object at the broker.
///
/// Handles are stable for the lifetime of the remote object and are used
/// for every subsequent call targeting it. The textual form is
/// broker-defined (an object path for BlueZ) and carries no meaning the
/// core relies on beyond equality and ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ObjectHandle(String);

impl ObjectHandle {
    /// Create a handle from its broker-defined textual form.
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// The broker-defined textual form of the handle.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectHandle {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

impl From<String> for ObjectHandle {
    fn from(path: String) -> Self {
        Self::new(path)
    }
}

bitflags::bitflags! {
    /// Radio configurations a peripheral supports.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CoreConfigurations: u8 {
        /// Bluetooth Low Energy.
        const LOW_ENERGY = 0x01;
        /// Classic (BR/EDR).
        const BASE_RATE = 0x02;
    }
}

#[cfg(feature = "serde")]
impl Serialize for CoreConfigurations {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.bits())
    }
}

#[cfg(feature = "serde")]
impl<'de> Deserialize<'de> for CoreConfigurations {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u8::deserialize(deserializer).map(Self::from_bits_truncate)
    }
}

/// Description of a discovered peripheral.
///
/// Built by the discovery agent when a qualifying remote object is first
/// observed, and immutable afterwards. The broker object handle is the
/// address for all subsequent calls targeting the peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PeripheralInfo {
    address: String,
    name: String,
    core_configurations: CoreConfigurations,
    handle: ObjectHandle,
    services: Option<Vec<Uuid>>,
}

impl PeripheralInfo {
    /// Create a peripheral description.
    ///
    /// The display name falls back to the address when `name` is empty,
    /// so a valid peripheral never has a blank name.
    ///
    /// # Examples
    ///
    /// ```
    /// use bluetree_types::{ObjectHandle, PeripheralInfo};
    ///
    /// let info = PeripheralInfo::new("AA:BB:CC:DD:EE:FF", "", ObjectHandle::new("/dev_AA"));
    /// assert_eq!(info.name(), "AA:BB:CC:DD:EE:FF");
    /// assert!(info.is_valid());
    /// ```
    pub fn new(
        address: impl Into<String>,
        name: impl Into<String>,
        handle: ObjectHandle,
    ) -> Self {
        let address = address.into();
        let name = name.into();
        let name = if name.is_empty() {
            address.clone()
        } else {
            name
        };
        Self {
            address,
            name,
            core_configurations: CoreConfigurations::empty(),
            handle,
            services: None,
        }
    }

    /// Set the supported radio configurations.
    #[must_use]
    pub fn with_core_configurations(mut self, configs: CoreConfigurations) -> Self {
        self.core_configurations = configs;
        self
    }

    /// Set the advertised service identifiers.
    #[must_use]
    pub fn with_services(mut self, services: Vec<Uuid>) -> Self {
        self.services = Some(services);
        self
    }

    /// Stable hardware address of the peripheral.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Display name; the address when no alias was advertised.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Radio configurations the peripheral supports.
    #[must_use]
    pub fn core_configurations(&self) -> CoreConfigurations {
        self.core_configurations
    }

    /// Broker object handle used for all calls targeting the peripheral.
    #[must_use]
    pub fn handle(&self) -> &ObjectHandle {
        &self.handle
    }

    /// Advertised service identifiers, when the advertisement carried any.
    #[must_use]
    pub fn services(&self) -> Option<&[Uuid]> {
        self.services.as_deref()
    }

    /// A peripheral description is valid only with a non-empty address.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.address.is_empty()
    }
}

/// A single decoded characteristic capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[non_exhaustive]
pub enum Capability {
    /// Value may be broadcast in advertisements.
    Broadcast,
    /// Value may be read.
    Read,
    /// Value may be written without a response.
    WriteWithoutResponse,
    /// Value may be written with a response.
    Write,
    /// Value changes may be notified without acknowledgement.
    Notify,
    /// Value changes may be indicated with acknowledgement.
    Indicate,
    /// Value may be written with an authenticated signature.
    SignedWrite,
    /// Additional properties live in the extended-properties descriptor.
    ExtendedProperties,
}

impl Capability {
    /// Decode one raw broker capability token.
    ///
    /// Returns `None` for unrecognized tokens; callers drop those silently.
    #[must_use]
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "broadcast" => Some(Self::Broadcast),
            "read" => Some(Self::Read),
            "write-without-response" => Some(Self::WriteWithoutResponse),
            "write" => Some(Self::Write),
            "notify" => Some(Self::Notify),
            "indicate" => Some(Self::Indicate),
            "authenticated-signed-writes" => Some(Self::SignedWrite),
            "extended-properties" => Some(Self::ExtendedProperties),
            _ => None,
        }
    }
}

bitflags::bitflags! {
    /// The decoded capability set of a characteristic.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Capabilities: u8 {
        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const SIGNED_WRITE = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
    }
}

impl Capabilities {
    /// Decode a list of raw broker capability tokens.
    ///
    /// Each recognized token maps to exactly one flag; unrecognized tokens
    /// are dropped silently.
    ///
    /// # Examples
    ///
    /// ```
    /// use bluetree_types::{Capabilities, Capability};
    ///
    /// let caps = Capabilities::from_tokens(["read", "notify"].iter().map(|s| s.to_string()));
    /// assert!(caps.has(Capability::Read));
    /// assert!(caps.has(Capability::Notify));
    /// assert!(!caps.has(Capability::Write));
    ///
    /// let none = Capabilities::from_tokens(["bogus".to_string()]);
    /// assert!(none.is_empty());
    /// ```
    pub fn from_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut caps = Self::empty();
        for token in tokens {
            if let Some(capability) = Capability::from_token(token.as_ref()) {
                caps |= Self::from(capability);
            }
        }
        caps
    }

    /// Whether the set contains the given capability.
    #[must_use]
    pub fn has(&self, capability: Capability) -> bool {
        self.contains(Self::from(capability))
    }
}

impl From<Capability> for Capabilities {
    fn from(capability: Capability) -> Self {
        match capability {
            Capability::Broadcast => Self::BROADCAST,
            Capability::Read => Self::READ,
            Capability::WriteWithoutResponse => Self::WRITE_WITHOUT_RESPONSE,
            Capability::Write => Self::WRITE,
            Capability::Notify => Self::NOTIFY,
            Capability::Indicate => Self::INDICATE,
            Capability::SignedWrite => Self::SIGNED_WRITE,
            Capability::ExtendedProperties => Self::EXTENDED_PROPERTIES,
        }
    }
}

#[cfg(feature = "serde")]
impl Serialize for Capabilities {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.bits())
    }
}

#[cfg(feature = "serde")]
impl<'de> Deserialize<'de> for Capabilities {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u8::deserialize(deserializer).map(Self::from_bits_truncate)
    }
}

/// A GATT descriptor in the public model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    /// GATT identifier of the descriptor.
    pub uuid: Uuid,
    /// Broker object handle of the descriptor.
    pub handle: ObjectHandle,
    /// Last-known raw value; empty before a read completes.
    pub value: Bytes,
}

/// A GATT characteristic in the public model, with its nested descriptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristic {
    /// GATT identifier of the characteristic.
    pub uuid: Uuid,
    /// Broker object handle of the characteristic.
    pub handle: ObjectHandle,
    /// Numeric attribute handle; 0 when the broker did not report one.
    pub att_handle: u16,
    /// Last-known raw value; empty before a read completes.
    pub value: Bytes,
    /// Decoded capability set.
    pub capabilities: Capabilities,
    /// Descriptors belonging to this characteristic.
    pub descriptors: Vec<Descriptor>,
}

impl Characteristic {
    /// Whether the characteristic declares the read capability.
    #[must_use]
    pub fn is_readable(&self) -> bool {
        self.capabilities.has(Capability::Read)
    }
}

/// Primary/included classification of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ServiceKind {
    /// A primary service.
    Primary,
    /// A service included by another service.
    Included,
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Included => write!(f, "included"),
        }
    }
}

/// Detail-resolution progress of one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ServiceState {
    /// Details have not been requested yet.
    DiscoveryRequired,
    /// Value reads are in flight.
    DiscoveringServices,
    /// Every issued read has completed.
    ServiceDiscovered,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DiscoveryRequired => write!(f, "discovery required"),
            Self::DiscoveringServices => write!(f, "discovering services"),
            Self::ServiceDiscovered => write!(f, "service discovered"),
        }
    }
}

/// A GATT service in the public model.
///
/// An owned snapshot of the controller's resolved state: mutating it never
/// aliases the controller's summary maps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    /// GATT identifier of the service.
    pub uuid: Uuid,
    /// Broker object handle of the service.
    pub handle: ObjectHandle,
    /// Display name.
    pub name: String,
    /// Primary/included classification.
    pub kind: ServiceKind,
    /// Detail-resolution progress.
    pub state: ServiceState,
    /// Characteristics belonging to this service, each with its descriptors.
    pub characteristics: Vec<Characteristic>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peripheral_name_falls_back_to_address() {
        let info = PeripheralInfo::new("11:22:33:44:55:66", "", ObjectHandle::new("/dev_11"));
        assert_eq!(info.name(), "11:22:33:44:55:66");

        let named = PeripheralInfo::new("AA:BB:CC:DD:EE:FF", "Sensor", ObjectHandle::new("/dev_AA"));
        assert_eq!(named.name(), "Sensor");
        assert_eq!(named.address(), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn peripheral_validity_requires_address() {
        let info = PeripheralInfo::new("", "Sensor", ObjectHandle::new("/dev"));
        assert!(!info.is_valid());

        let info = PeripheralInfo::new("AA:BB:CC:DD:EE:FF", "Sensor", ObjectHandle::new("/dev"));
        assert!(info.is_valid());
    }

    #[test]
    fn capability_tokens_decode() {
        let caps = Capabilities::from_tokens(["read", "notify"]);
        assert!(caps.has(Capability::Read));
        assert!(caps.has(Capability::Notify));
        assert!(!caps.has(Capability::Indicate));
    }

    #[test]
    fn unrecognized_tokens_are_dropped() {
        let caps = Capabilities::from_tokens(["bogus"]);
        assert!(caps.is_empty());

        let mixed = Capabilities::from_tokens(["bogus", "write", "also-bogus"]);
        assert_eq!(mixed, Capabilities::WRITE);
    }

    #[test]
    fn all_tokens_map_to_exactly_one_flag() {
        let tokens = [
            "broadcast",
            "read",
            "write-without-response",
            "write",
            "notify",
            "indicate",
            "authenticated-signed-writes",
            "extended-properties",
        ];
        for token in tokens {
            let caps = Capabilities::from_tokens([token]);
            assert_eq!(caps.bits().count_ones(), 1, "token {token} should set one flag");
        }
    }

    #[test]
    fn object_handle_display_matches_input() {
        let handle = ObjectHandle::new("/org/bluez/hci0/dev_AA_BB");
        assert_eq!(handle.to_string(), "/org/bluez/hci0/dev_AA_BB");
        assert_eq!(handle.as_str(), "/org/bluez/hci0/dev_AA_BB");
    }

    #[cfg(feature = "serde")]
    #[test]
    fn service_state_serializes_snake_case() {
        let json = serde_json::to_string(&ServiceState::ServiceDiscovered).unwrap();
        assert_eq!(json, "\"service_discovered\"");
    }
}
