//! Remote object shapes recognized at the broker.
//!
//! The object broker exposes the peripheral's state as a hierarchy of
//! remote objects, each implementing one or more named interfaces with
//! typed properties. These are the BlueZ names; the core matches objects
//! against them when partitioning an enumeration into the GATT model.

// --- Interface names ---

/// Adapter-shaped object: owns the scan lifecycle.
pub const ADAPTER_INTERFACE: &str = "org.bluez.Adapter1";

/// Device-shaped object: one remote peripheral.
pub const DEVICE_INTERFACE: &str = "org.bluez.Device1";

/// Service-shaped object: one GATT service under a connected peripheral.
pub const SERVICE_INTERFACE: &str = "org.bluez.GattService1";

/// Characteristic-shaped object: one GATT characteristic under a service.
pub const CHARACTERISTIC_INTERFACE: &str = "org.bluez.GattCharacteristic1";

/// Descriptor-shaped object: one GATT descriptor under a characteristic.
pub const DESCRIPTOR_INTERFACE: &str = "org.bluez.GattDescriptor1";

// --- Device properties ---

/// Stable hardware address of a peripheral.
pub const PROP_ADDRESS: &str = "Address";

/// Advertised display name; falls back to the address when unset.
pub const PROP_ALIAS: &str = "Alias";

/// Advertised service identifiers, when present.
pub const PROP_UUIDS: &str = "UUIDs";

/// Whether the broker has finished resolving the peripheral's GATT tree.
pub const PROP_SERVICES_RESOLVED: &str = "ServicesResolved";

// --- Service / characteristic / descriptor properties ---

/// GATT identifier of a service, characteristic, or descriptor.
pub const PROP_UUID: &str = "UUID";

/// Primary (as opposed to included) service flag.
pub const PROP_PRIMARY: &str = "Primary";

/// Owning service handle on a characteristic object.
pub const PROP_SERVICE: &str = "Service";

/// Owning characteristic handle on a descriptor object.
pub const PROP_CHARACTERISTIC: &str = "Characteristic";

/// Raw capability tokens on a characteristic object.
pub const PROP_FLAGS: &str = "Flags";

/// Numeric attribute handle on a characteristic object.
pub const PROP_HANDLE: &str = "Handle";

/// Last-known raw value of a characteristic or descriptor.
pub const PROP_VALUE: &str = "Value";

// --- Methods ---

/// Start active scanning on an adapter-shaped object.
pub const METHOD_START_DISCOVERY: &str = "StartDiscovery";

/// Stop active scanning on an adapter-shaped object.
pub const METHOD_STOP_DISCOVERY: &str = "StopDiscovery";

/// Open a connection to a device-shaped object.
pub const METHOD_CONNECT: &str = "Connect";

/// Close the connection to a device-shaped object.
pub const METHOD_DISCONNECT: &str = "Disconnect";

/// Read the value of a characteristic- or descriptor-shaped object.
/// Takes an empty options map and returns a byte sequence.
pub const METHOD_READ_VALUE: &str = "ReadValue";
