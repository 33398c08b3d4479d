//! Discovery, connection, and GATT-tree resolution over an object broker.
//!
//! This crate reconstructs a typed in-memory model of a wireless
//! peripheral's GATT object tree (services → characteristics →
//! descriptors) by driving an external object broker that exposes the
//! peripheral's state as remote objects with properties and change
//! notifications.
//!
//! # Components
//!
//! - [`DiscoveryAgent`]: owns the scan lifecycle and reports each
//!   qualifying peripheral exactly once per cycle
//! - [`ConnectionController`]: owns connect/disconnect for one
//!   peripheral and resolves its service/characteristic/descriptor tree
//! - [`ServiceSession`]: fans out value reads for one service and
//!   signals completion exactly once, after every read has returned
//! - [`ObjectBroker`]: the broker seam, with [`MockBroker`] for tests
//!   and `BluezBroker` over the system bus on Linux
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use bluetree_core::{ConnectionController, CoreEvent, DiscoveryAgent, ObjectBroker};
//! use bluetree_types::ObjectHandle;
//!
//! # async fn example(broker: Arc<dyn ObjectBroker>) -> bluetree_core::Result<()> {
//! // Scan for peripherals
//! let agent = DiscoveryAgent::new(Arc::clone(&broker), ObjectHandle::new("/org/bluez/hci0"));
//! let mut events = agent.subscribe();
//! agent.start().await?;
//!
//! let device = loop {
//!     match events.recv().await {
//!         Ok(CoreEvent::DeviceDiscovered { device }) => break device,
//!         Ok(CoreEvent::DiscoveryFinished) | Err(_) => return Ok(()),
//!         _ => {}
//!     }
//! };
//!
//! // Connect and resolve the GATT tree
//! let controller = ConnectionController::new(broker, device);
//! controller.connect_to_device().await?;
//! controller.discover_services().await?;
//!
//! // Fetch the values of one service
//! for uuid in controller.services() {
//!     if let Some(session) = controller.create_session(&uuid) {
//!         session.discover_details().await?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Concurrency
//!
//! Every broker call is non-blocking; completions are delivered when the
//! corresponding future resolves. Components may be driven from any task
//! but never require more than one: internal state lives behind short,
//! non-awaiting critical sections. Calling `stop()` or
//! `disconnect_from_device()` while calls are outstanding does not
//! cancel them; their completions still run and are written defensively
//! against stale state.

pub mod broker;
pub mod controller;
pub mod discovery;
pub mod error;
pub mod events;
pub mod mock;
pub mod session;

#[cfg(target_os = "linux")]
pub mod bluez;

// Core exports
pub use broker::{
    InterfaceMap, ObjectAdded, ObjectBroker, ObjectMap, PropertyChange, PropertyMap,
    PropertyWatch, Value,
};
pub use controller::{ConnectionController, ConnectionOptions, ControllerState};
pub use discovery::{DiscoveryAgent, DiscoveryOptions};
pub use error::{BrokerError, Error, ErrorKind, Result};
pub use events::{CoreEvent, EventDispatcher, EventReceiver, EventSender};
pub use mock::{MockBroker, MockBrokerBuilder};
pub use session::{ServiceSession, SessionOptions};

#[cfg(target_os = "linux")]
pub use bluez::BluezBroker;

// Re-export the model types for convenience
pub use bluetree_types::{
    Capabilities, Capability, Characteristic, Descriptor, ObjectHandle, PeripheralInfo, Service,
    ServiceKind, ServiceState,
};
