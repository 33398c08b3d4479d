//! Platform-agnostic types for the bluetree GATT discovery stack.
//!
//! This crate holds the value objects shared across the stack: the
//! description of a discovered peripheral, the public GATT model
//! (services, characteristics, descriptors), and the broker-facing
//! interface names used to recognize remote object shapes.
//!
//! All types here are plain data: immutable once built, cheap to clone,
//! and free of broker or transport behavior. The state machines that
//! produce them live in `bluetree-core`.

pub mod interfaces;
pub mod types;

pub use types::{
    Capabilities, Capability, Characteristic, CoreConfigurations, Descriptor, ObjectHandle,
    PeripheralInfo, Service, ServiceKind, ServiceState,
};
