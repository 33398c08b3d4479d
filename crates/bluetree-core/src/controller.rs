//! Connection lifecycle and GATT-tree resolution for one peripheral.
//!
//! The [`ConnectionController`] opens and closes the connection, watches
//! the peripheral's property changes, and, once the broker reports
//! service resolution complete, partitions one object enumeration into
//! service, characteristic, and descriptor summaries. The resolved
//! summaries are projected into owned [`Service`] snapshots on demand.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use bluetree_types::interfaces::{
    CHARACTERISTIC_INTERFACE, DESCRIPTOR_INTERFACE, DEVICE_INTERFACE, METHOD_CONNECT,
    METHOD_DISCONNECT, PROP_CHARACTERISTIC, PROP_FLAGS, PROP_HANDLE, PROP_PRIMARY, PROP_SERVICE,
    PROP_SERVICES_RESOLVED, PROP_UUID, PROP_VALUE, SERVICE_INTERFACE,
};
use bluetree_types::{
    Capabilities, Characteristic, Descriptor, ObjectHandle, PeripheralInfo, Service, ServiceKind,
    ServiceState,
};

use crate::broker::{with_deadline, InterfaceMap, ObjectBroker, ObjectMap, Value};
use crate::error::{ErrorKind, Result};
use crate::events::{CoreEvent, EventDispatcher, EventReceiver};
use crate::session::{ServiceSession, SessionOptions};

/// Options for a connection.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Deadline applied to every broker call the controller issues.
    pub call_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(10),
        }
    }
}

impl ConnectionOptions {
    /// Create new options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-call deadline.
    #[must_use]
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }
}

/// Coarse connection state.
///
/// Resolution progress is tracked separately: see
/// [`ConnectionController::is_resolved`] and per-session
/// [`ServiceState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// No open connection handle.
    Unconnected,
    /// A connection handle is held.
    Connected,
}

/// Raw broker-sourced cache entry for one GATT service.
#[derive(Debug, Clone)]
struct ServiceSummary {
    handle: ObjectHandle,
    primary: bool,
}

/// Raw broker-sourced cache entry for one GATT characteristic.
#[derive(Debug, Clone)]
struct CharacteristicSummary {
    uuid: Uuid,
    handle: ObjectHandle,
    service: ObjectHandle,
    flags: Vec<String>,
    att_handle: u16,
    value: Bytes,
}

/// Raw broker-sourced cache entry for one GATT descriptor.
#[derive(Debug, Clone)]
struct DescriptorSummary {
    uuid: Uuid,
    handle: ObjectHandle,
    characteristic: ObjectHandle,
    value: Bytes,
}

/// Summary maps exclusively owned by the controller for one connection.
///
/// Characteristics are keyed by (owning-service handle, UUID) and
/// descriptors by (owning-characteristic handle, UUID), so equal UUIDs
/// under different owners never collide. Sorted maps keep event emission
/// deterministic.
struct Guarded {
    connected: bool,
    resolved: bool,
    resolving: bool,
    services: BTreeMap<Uuid, ServiceSummary>,
    characteristics: BTreeMap<(ObjectHandle, Uuid), CharacteristicSummary>,
    descriptors: BTreeMap<(ObjectHandle, Uuid), DescriptorSummary>,
    watch_task: Option<JoinHandle<()>>,
}

impl Guarded {
    fn new() -> Self {
        Self {
            connected: false,
            resolved: false,
            resolving: false,
            services: BTreeMap::new(),
            characteristics: BTreeMap::new(),
            descriptors: BTreeMap::new(),
            watch_task: None,
        }
    }

    fn clear_summaries(&mut self) {
        self.services.clear();
        self.characteristics.clear();
        self.descriptors.clear();
        self.resolved = false;
    }

    /// Fold one enumerated object into the summary maps.
    ///
    /// Objects without the expected identifier or owner handle are
    /// skipped without error.
    fn ingest(&mut self, handle: &ObjectHandle, interfaces: &InterfaceMap) {
        if let Some(props) = interfaces.get(SERVICE_INTERFACE) {
            if let Some(uuid) = parse_uuid(props.get(PROP_UUID)) {
                let primary = props
                    .get(PROP_PRIMARY)
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                debug!(service = %uuid, primary, "service summary");
                self.services.insert(
                    uuid,
                    ServiceSummary {
                        handle: handle.clone(),
                        primary,
                    },
                );
            }
        }

        if let Some(props) = interfaces.get(CHARACTERISTIC_INTERFACE) {
            if let (Some(uuid), Some(service)) = (
                parse_uuid(props.get(PROP_UUID)),
                props.get(PROP_SERVICE).and_then(Value::as_handle),
            ) {
                let flags = props
                    .get(PROP_FLAGS)
                    .and_then(Value::as_string_list)
                    .map(<[String]>::to_vec)
                    .unwrap_or_default();
                let att_handle = props
                    .get(PROP_HANDLE)
                    .and_then(Value::as_u16)
                    .unwrap_or(0);
                let value = props
                    .get(PROP_VALUE)
                    .and_then(Value::as_bytes)
                    .cloned()
                    .unwrap_or_default();
                debug!(characteristic = %uuid, "characteristic summary");
                self.characteristics.insert(
                    (service.clone(), uuid),
                    CharacteristicSummary {
                        uuid,
                        handle: handle.clone(),
                        service: service.clone(),
                        flags,
                        att_handle,
                        value,
                    },
                );
            }
        }

        if let Some(props) = interfaces.get(DESCRIPTOR_INTERFACE) {
            if let (Some(uuid), Some(characteristic)) = (
                parse_uuid(props.get(PROP_UUID)),
                props.get(PROP_CHARACTERISTIC).and_then(Value::as_handle),
            ) {
                let value = props
                    .get(PROP_VALUE)
                    .and_then(Value::as_bytes)
                    .cloned()
                    .unwrap_or_default();
                debug!(descriptor = %uuid, "descriptor summary");
                self.descriptors.insert(
                    (characteristic.clone(), uuid),
                    DescriptorSummary {
                        uuid,
                        handle: handle.clone(),
                        characteristic: characteristic.clone(),
                        value,
                    },
                );
            }
        }
    }

    fn ingest_all(&mut self, objects: &ObjectMap) {
        for (handle, interfaces) in objects {
            self.ingest(handle, interfaces);
        }
    }

    /// Project one service summary into an owned public model snapshot.
    fn project_service(&self, uuid: &Uuid) -> Option<Service> {
        let summary = self.services.get(uuid)?;

        let mut characteristics = Vec::new();
        for cs in self.characteristics.values() {
            if cs.service != summary.handle {
                continue;
            }
            let descriptors: Vec<Descriptor> = self
                .descriptors
                .values()
                .filter(|ds| ds.characteristic == cs.handle)
                .map(|ds| Descriptor {
                    uuid: ds.uuid,
                    handle: ds.handle.clone(),
                    value: ds.value.clone(),
                })
                .collect();
            characteristics.push(Characteristic {
                uuid: cs.uuid,
                handle: cs.handle.clone(),
                att_handle: cs.att_handle,
                value: cs.value.clone(),
                capabilities: Capabilities::from_tokens(&cs.flags),
                descriptors,
            });
        }

        let kind = if summary.primary {
            ServiceKind::Primary
        } else {
            ServiceKind::Included
        };

        Some(Service {
            uuid: *uuid,
            handle: summary.handle.clone(),
            name: uuid.to_string(),
            kind,
            state: ServiceState::DiscoveryRequired,
            characteristics,
        })
    }
}

fn parse_uuid(value: Option<&Value>) -> Option<Uuid> {
    value.and_then(Value::as_str).and_then(|s| s.parse().ok())
}

struct Shared {
    broker: Arc<dyn ObjectBroker>,
    peripheral: PeripheralInfo,
    options: ConnectionOptions,
    events: EventDispatcher,
    guarded: Mutex<Guarded>,
}

/// Owns the connect/disconnect lifecycle for one target peripheral.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use bluetree_core::{ConnectionController, ObjectBroker};
/// use bluetree_types::PeripheralInfo;
///
/// # async fn example(
/// #     broker: Arc<dyn ObjectBroker>,
/// #     peripheral: PeripheralInfo,
/// # ) -> bluetree_core::Result<()> {
/// let controller = ConnectionController::new(broker, peripheral);
/// controller.connect_to_device().await?;
/// controller.discover_services().await?;
/// # Ok(())
/// # }
/// ```
pub struct ConnectionController {
    shared: Arc<Shared>,
}

impl ConnectionController {
    /// Create a controller for one peripheral with default options.
    pub fn new(broker: Arc<dyn ObjectBroker>, peripheral: PeripheralInfo) -> Self {
        Self::with_options(broker, peripheral, ConnectionOptions::default())
    }

    /// Create a controller for one peripheral with custom options.
    pub fn with_options(
        broker: Arc<dyn ObjectBroker>,
        peripheral: PeripheralInfo,
        options: ConnectionOptions,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                broker,
                peripheral,
                options,
                events: EventDispatcher::default(),
                guarded: Mutex::new(Guarded::new()),
            }),
        }
    }

    /// Subscribe to connection and resolution events.
    pub fn subscribe(&self) -> EventReceiver {
        self.shared.events.subscribe()
    }

    /// The peripheral this controller targets.
    pub fn peripheral(&self) -> &PeripheralInfo {
        &self.shared.peripheral
    }

    /// Coarse connection state.
    pub fn state(&self) -> ControllerState {
        if self.shared.lock().connected {
            ControllerState::Connected
        } else {
            ControllerState::Unconnected
        }
    }

    /// Whether the GATT tree has been resolved for this connection.
    pub fn is_resolved(&self) -> bool {
        self.shared.lock().resolved
    }

    /// Identifiers of every resolved service, in sorted order.
    pub fn services(&self) -> Vec<Uuid> {
        self.shared.lock().services.keys().copied().collect()
    }

    /// Open a connection to the peripheral.
    ///
    /// A connect attempt always starts from a blank slate: the summary
    /// maps and the resolved flag are cleared unconditionally, even when
    /// the call turns out to be a no-op because a connection is already
    /// held. On success the controller subscribes to the peripheral's
    /// property changes and emits a connected event; on failure it emits
    /// an error event and stays unconnected.
    pub async fn connect_to_device(&self) -> Result<()> {
        {
            let mut guarded = self.shared.lock();
            guarded.clear_summaries();
            if guarded.connected {
                debug!("already connected, ignoring connect");
                return Ok(());
            }
        }
        let handle = self.shared.peripheral.handle();
        info!(peripheral = %handle, "connecting to device");

        let connect = self
            .shared
            .broker
            .call(handle, DEVICE_INTERFACE, METHOD_CONNECT, Vec::new());
        match with_deadline(self.shared.options.call_timeout, connect).await {
            Ok(_) => {
                self.shared.lock().connected = true;
                self.spawn_property_watch().await;
                self.shared.events.send(CoreEvent::Connected {
                    address: self.shared.peripheral.address().to_string(),
                });
                Ok(())
            }
            Err(err) => {
                warn!("connecting failed: {err}");
                self.shared.events.send(CoreEvent::Error {
                    kind: ErrorKind::from(&err),
                });
                Err(err.into())
            }
        }
    }

    /// Close the connection to the peripheral.
    ///
    /// A no-op when no connection is held. The property-change
    /// subscription is released and the summary maps cleared regardless
    /// of the call's outcome.
    pub async fn disconnect_from_device(&self) -> Result<()> {
        {
            let guarded = self.shared.lock();
            if !guarded.connected {
                debug!("not connected, ignoring disconnect");
                return Ok(());
            }
        }
        let handle = self.shared.peripheral.handle();
        info!(peripheral = %handle, "disconnecting from device");

        let disconnect =
            self.shared
                .broker
                .call(handle, DEVICE_INTERFACE, METHOD_DISCONNECT, Vec::new());
        let result = with_deadline(self.shared.options.call_timeout, disconnect).await;

        {
            let mut guarded = self.shared.lock();
            if let Some(task) = guarded.watch_task.take() {
                task.abort();
            }
            guarded.connected = false;
            guarded.clear_summaries();
        }

        match result {
            Ok(_) => {
                self.shared.events.send(CoreEvent::Disconnected {
                    address: self.shared.peripheral.address().to_string(),
                });
                Ok(())
            }
            Err(err) => {
                warn!("disconnecting failed: {err}");
                self.shared.events.send(CoreEvent::Error {
                    kind: ErrorKind::from(&err),
                });
                Err(err.into())
            }
        }
    }

    /// Resolve the peripheral's GATT tree.
    ///
    /// Checks whether the broker has already resolved services; if so the
    /// tree is enumerated immediately, otherwise resolution is triggered
    /// later by the property-change notification reporting completion.
    /// There is no polling loop.
    pub async fn discover_services(&self) -> Result<()> {
        if !self.shared.lock().connected {
            warn!("discover_services while unconnected, ignoring");
            return Ok(());
        }
        let handle = self.shared.peripheral.handle();
        debug!(peripheral = %handle, "checking service resolution");

        let check =
            self.shared
                .broker
                .get_property(handle, DEVICE_INTERFACE, PROP_SERVICES_RESOLVED);
        match with_deadline(self.shared.options.call_timeout, check).await {
            Ok(value) => {
                if value.as_bool().unwrap_or(false) {
                    debug!("services already resolved");
                    self.shared.resolve_services().await
                } else {
                    debug!("services not yet resolved, waiting for notification");
                    Ok(())
                }
            }
            Err(err) => {
                warn!("service resolution check failed: {err}");
                self.shared.events.send(CoreEvent::Error {
                    kind: ErrorKind::from(&err),
                });
                Err(err.into())
            }
        }
    }

    /// Project the resolved state of one service into an owned snapshot.
    ///
    /// Pure and synchronous; returns `None` when the UUID is not among
    /// the resolved services. The snapshot carries independent copies;
    /// mutating it never aliases the controller's summary maps.
    pub fn create_service_object(&self, uuid: &Uuid) -> Option<Service> {
        let guarded = self.shared.lock();
        let service = guarded.project_service(uuid);
        if service.is_none() {
            debug!(service = %uuid, "service not found");
        }
        service
    }

    /// Build a detail-resolution session for one resolved service.
    ///
    /// Convenience over [`Self::create_service_object`] +
    /// [`ServiceSession::new`], reusing this controller's broker and call
    /// deadline.
    pub fn create_session(&self, uuid: &Uuid) -> Option<ServiceSession> {
        let service = self.create_service_object(uuid)?;
        let options = SessionOptions::new().call_timeout(self.shared.options.call_timeout);
        Some(ServiceSession::with_options(
            Arc::clone(&self.shared.broker),
            service,
            options,
        ))
    }

    /// Acquire the scoped property watch and spawn its dispatch task.
    async fn spawn_property_watch(&self) {
        let handle = self.shared.peripheral.handle();
        let watch = with_deadline(
            self.shared.options.call_timeout,
            self.shared.broker.watch_properties(handle),
        )
        .await;
        let mut watch = match watch {
            Ok(watch) => watch,
            Err(err) => {
                // Connected but without change notifications; an explicit
                // discover_services call can still resolve the tree.
                warn!("subscribing to property changes failed: {err}");
                self.shared.events.send(CoreEvent::Error {
                    kind: ErrorKind::from(&err),
                });
                return;
            }
        };

        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(async move {
            while let Some(change) = watch.changed().await {
                if change.interface != DEVICE_INTERFACE {
                    continue;
                }
                match change
                    .changed
                    .get(PROP_SERVICES_RESOLVED)
                    .and_then(Value::as_bool)
                {
                    Some(true) => {
                        debug!("notified: services resolved");
                        if let Err(err) = shared.resolve_services().await {
                            debug!("notified resolution failed: {err}");
                        }
                    }
                    Some(false) => debug!("notified: services not yet resolved"),
                    None => {}
                }
            }
        });
        self.shared.lock().watch_task = Some(task);
    }
}

impl Drop for ConnectionController {
    fn drop(&mut self) {
        if let Some(task) = self.shared.lock().watch_task.take() {
            task.abort();
        }
    }
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, Guarded> {
        self.guarded
            .lock()
            .expect("controller state lock poisoned - a thread panicked while holding the lock")
    }

    /// Enumerate the broker's objects and rebuild the summary maps.
    ///
    /// Idempotent: a duplicate trigger (explicit check racing the change
    /// notification, or repeated notifications) enumerates at most once.
    /// On error the resolved flag stays false so the caller may retry.
    async fn resolve_services(&self) -> Result<()> {
        {
            let mut guarded = self.lock();
            if guarded.resolved || guarded.resolving {
                debug!("resolution already complete or running");
                return Ok(());
            }
            guarded.resolving = true;
        }
        info!("resolving GATT object tree");

        match with_deadline(self.options.call_timeout, self.broker.enumerate_objects()).await {
            Ok(objects) => {
                let uuids: Vec<Uuid> = {
                    let mut guarded = self.lock();
                    guarded.resolving = false;
                    // The connection may have closed while the
                    // enumeration was in flight.
                    if !guarded.connected {
                        debug!("resolution completed after disconnect, discarding");
                        return Ok(());
                    }
                    guarded.ingest_all(&objects);
                    guarded.resolved = true;
                    guarded.services.keys().copied().collect()
                };
                info!("resolved {} service(s)", uuids.len());
                for uuid in uuids {
                    self.events.send(CoreEvent::ServiceDiscovered { uuid });
                }
                self.events.send(CoreEvent::DiscoveryFinished);
                Ok(())
            }
            Err(err) => {
                warn!("resolving services failed: {err}");
                self.lock().resolving = false;
                self.events.send(CoreEvent::Error {
                    kind: ErrorKind::from(&err),
                });
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PropertyMap;

    fn uuid(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    fn service_object(uuid: Uuid, primary: bool) -> InterfaceMap {
        let mut props = PropertyMap::new();
        props.insert(PROP_UUID.into(), Value::String(uuid.to_string()));
        props.insert(PROP_PRIMARY.into(), Value::Bool(primary));
        let mut interfaces = InterfaceMap::new();
        interfaces.insert(SERVICE_INTERFACE.into(), props);
        interfaces
    }

    fn characteristic_object(uuid: Uuid, service: &str, flags: &[&str]) -> InterfaceMap {
        let mut props = PropertyMap::new();
        props.insert(PROP_UUID.into(), Value::String(uuid.to_string()));
        props.insert(PROP_SERVICE.into(), Value::Handle(ObjectHandle::new(service)));
        props.insert(
            PROP_FLAGS.into(),
            Value::StringList(flags.iter().map(|s| s.to_string()).collect()),
        );
        props.insert(PROP_HANDLE.into(), Value::U16(0x0010));
        let mut interfaces = InterfaceMap::new();
        interfaces.insert(CHARACTERISTIC_INTERFACE.into(), props);
        interfaces
    }

    fn descriptor_object(uuid: Uuid, characteristic: &str) -> InterfaceMap {
        let mut props = PropertyMap::new();
        props.insert(PROP_UUID.into(), Value::String(uuid.to_string()));
        props.insert(
            PROP_CHARACTERISTIC.into(),
            Value::Handle(ObjectHandle::new(characteristic)),
        );
        let mut interfaces = InterfaceMap::new();
        interfaces.insert(DESCRIPTOR_INTERFACE.into(), props);
        interfaces
    }

    #[test]
    fn enumeration_partitions_into_summaries() {
        let mut guarded = Guarded::new();
        guarded.ingest(&ObjectHandle::new("/dev/service0001"), &service_object(uuid(1), true));
        guarded.ingest(
            &ObjectHandle::new("/dev/service0001/char0002"),
            &characteristic_object(uuid(2), "/dev/service0001", &["read"]),
        );
        guarded.ingest(
            &ObjectHandle::new("/dev/service0001/char0002/desc0003"),
            &descriptor_object(uuid(3), "/dev/service0001/char0002"),
        );

        assert_eq!(guarded.services.len(), 1);
        assert_eq!(guarded.characteristics.len(), 1);
        assert_eq!(guarded.descriptors.len(), 1);
    }

    #[test]
    fn projection_attaches_matching_characteristics_and_descriptors() {
        let mut guarded = Guarded::new();
        guarded.ingest(&ObjectHandle::new("/svc_a"), &service_object(uuid(0xA), true));
        guarded.ingest(&ObjectHandle::new("/svc_b"), &service_object(uuid(0xB), false));
        guarded.ingest(
            &ObjectHandle::new("/svc_a/char1"),
            &characteristic_object(uuid(0x10), "/svc_a", &["read", "notify"]),
        );
        guarded.ingest(
            &ObjectHandle::new("/svc_b/char2"),
            &characteristic_object(uuid(0x20), "/svc_b", &["write"]),
        );
        guarded.ingest(
            &ObjectHandle::new("/svc_a/char1/desc1"),
            &descriptor_object(uuid(0x30), "/svc_a/char1"),
        );

        let service = guarded.project_service(&uuid(0xA)).unwrap();
        assert_eq!(service.kind, ServiceKind::Primary);
        assert_eq!(service.state, ServiceState::DiscoveryRequired);
        assert_eq!(service.characteristics.len(), 1);
        assert_eq!(service.characteristics[0].uuid, uuid(0x10));
        assert!(service.characteristics[0].is_readable());
        assert_eq!(service.characteristics[0].descriptors.len(), 1);
        assert_eq!(service.characteristics[0].descriptors[0].uuid, uuid(0x30));

        let included = guarded.project_service(&uuid(0xB)).unwrap();
        assert_eq!(included.kind, ServiceKind::Included);
        assert_eq!(included.characteristics.len(), 1);
        assert_eq!(included.characteristics[0].uuid, uuid(0x20));
    }

    #[test]
    fn unknown_uuid_projects_to_none() {
        let guarded = Guarded::new();
        assert!(guarded.project_service(&uuid(0xDEAD)).is_none());
    }

    #[test]
    fn equal_uuids_under_different_services_do_not_collide() {
        let mut guarded = Guarded::new();
        guarded.ingest(&ObjectHandle::new("/svc_a"), &service_object(uuid(0xA), true));
        guarded.ingest(&ObjectHandle::new("/svc_b"), &service_object(uuid(0xB), true));
        // Same characteristic UUID under both services.
        guarded.ingest(
            &ObjectHandle::new("/svc_a/char1"),
            &characteristic_object(uuid(0x2902), "/svc_a", &["read"]),
        );
        guarded.ingest(
            &ObjectHandle::new("/svc_b/char1"),
            &characteristic_object(uuid(0x2902), "/svc_b", &["write"]),
        );

        assert_eq!(guarded.characteristics.len(), 2);
        let a = guarded.project_service(&uuid(0xA)).unwrap();
        let b = guarded.project_service(&uuid(0xB)).unwrap();
        assert_eq!(a.characteristics.len(), 1);
        assert_eq!(b.characteristics.len(), 1);
        assert!(a.characteristics[0].is_readable());
        assert!(!b.characteristics[0].is_readable());
    }

    #[test]
    fn malformed_objects_are_skipped() {
        let mut guarded = Guarded::new();
        // Service without a UUID property.
        let mut interfaces = InterfaceMap::new();
        interfaces.insert(SERVICE_INTERFACE.into(), PropertyMap::new());
        guarded.ingest(&ObjectHandle::new("/broken"), &interfaces);
        // Characteristic without an owning service.
        let mut props = PropertyMap::new();
        props.insert(PROP_UUID.into(), Value::String(uuid(5).to_string()));
        let mut interfaces = InterfaceMap::new();
        interfaces.insert(CHARACTERISTIC_INTERFACE.into(), props);
        guarded.ingest(&ObjectHandle::new("/orphan"), &interfaces);

        assert!(guarded.services.is_empty());
        assert!(guarded.characteristics.is_empty());
    }
}
