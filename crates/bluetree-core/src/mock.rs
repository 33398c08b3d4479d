//! Mock object broker for testing.
//!
//! [`MockBroker`] implements [`ObjectBroker`] over a scripted object
//! tree, so the discovery, connection, and session state machines can be
//! exercised without hardware or a bus.
//!
//! # Features
//!
//! - **Scripted objects**: build a device/service/characteristic tree
//!   with the builder, then enumerate it like a real broker
//! - **Failure injection**: make specific methods fail
//! - **Gated reads**: hold `ReadValue` completions and release them one
//!   at a time to control fan-out completion order
//! - **Pushable notifications**: inject object-added and
//!   property-change events
//! - **Call log**: count the calls each test expects

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, Semaphore};
use uuid::Uuid;

use bluetree_types::interfaces::{
    CHARACTERISTIC_INTERFACE, DESCRIPTOR_INTERFACE, DEVICE_INTERFACE, METHOD_READ_VALUE,
    PROP_ADDRESS, PROP_ALIAS, PROP_CHARACTERISTIC, PROP_FLAGS, PROP_HANDLE, PROP_PRIMARY,
    PROP_SERVICE, PROP_SERVICES_RESOLVED, PROP_UUID, PROP_VALUE, SERVICE_INTERFACE,
};
use bluetree_types::ObjectHandle;

use crate::broker::{
    InterfaceMap, ObjectAdded, ObjectBroker, ObjectMap, PropertyChange, PropertyMap,
    PropertyWatch, Value,
};
use crate::error::BrokerError;

/// One recorded remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    /// Target object handle.
    pub handle: ObjectHandle,
    /// Target interface.
    pub interface: String,
    /// Invoked method.
    pub method: String,
}

struct PropWatcher {
    id: u64,
    handle: ObjectHandle,
    sender: mpsc::UnboundedSender<PropertyChange>,
}

/// A scriptable in-memory object broker.
pub struct MockBroker {
    objects: Mutex<ObjectMap>,
    calls: Mutex<Vec<CallRecord>>,
    fail_methods: Mutex<HashSet<String>>,
    read_gate: Semaphore,
    reads_gated: AtomicBool,
    object_added_tx: broadcast::Sender<ObjectAdded>,
    watchers: Arc<Mutex<Vec<PropWatcher>>>,
    next_watch_id: AtomicU64,
}

impl std::fmt::Debug for MockBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockBroker")
            .field("objects", &self.locked_objects().len())
            .field("watches", &self.active_watch_count())
            .finish()
    }
}

impl MockBroker {
    /// Start building a scripted broker.
    pub fn builder() -> MockBrokerBuilder {
        MockBrokerBuilder::default()
    }

    fn locked_objects(&self) -> std::sync::MutexGuard<'_, ObjectMap> {
        self.objects
            .lock()
            .expect("mock object lock poisoned - a thread panicked while holding the lock")
    }

    /// Make every call to `method` fail until cleared.
    pub fn fail_method(&self, method: &str) {
        self.fail_methods
            .lock()
            .expect("mock fail lock poisoned - a thread panicked while holding the lock")
            .insert(method.to_string());
    }

    /// Stop failing calls to `method`.
    pub fn clear_failure(&self, method: &str) {
        self.fail_methods
            .lock()
            .expect("mock fail lock poisoned - a thread panicked while holding the lock")
            .remove(method);
    }

    fn should_fail(&self, method: &str) -> bool {
        self.fail_methods
            .lock()
            .expect("mock fail lock poisoned - a thread panicked while holding the lock")
            .contains(method)
    }

    /// Hold every subsequent `ReadValue` call until released.
    pub fn gate_reads(&self) {
        self.reads_gated.store(true, Ordering::SeqCst);
    }

    /// Let one held `ReadValue` call proceed.
    pub fn release_read(&self) {
        self.read_gate.add_permits(1);
    }

    /// Let `n` held `ReadValue` calls proceed.
    pub fn release_reads(&self, n: usize) {
        self.read_gate.add_permits(n);
    }

    /// Number of calls recorded for `method`.
    pub fn call_count(&self, method: &str) -> usize {
        self.calls
            .lock()
            .expect("mock call lock poisoned - a thread panicked while holding the lock")
            .iter()
            .filter(|record| record.method == method)
            .count()
    }

    /// Every recorded call, in order.
    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls
            .lock()
            .expect("mock call lock poisoned - a thread panicked while holding the lock")
            .clone()
    }

    fn record(&self, handle: &ObjectHandle, interface: &str, method: &str) {
        self.calls
            .lock()
            .expect("mock call lock poisoned - a thread panicked while holding the lock")
            .push(CallRecord {
                handle: handle.clone(),
                interface: interface.to_string(),
                method: method.to_string(),
            });
    }

    /// Number of live property-change subscriptions.
    pub fn active_watch_count(&self) -> usize {
        self.watchers
            .lock()
            .expect("mock watcher lock poisoned - a thread panicked while holding the lock")
            .len()
    }

    /// Add an object to the scripted tree at runtime.
    pub fn insert_object(&self, handle: ObjectHandle, interfaces: InterfaceMap) {
        self.locked_objects().insert(handle, interfaces);
    }

    /// Overwrite one property of a scripted object.
    pub fn set_property(
        &self,
        handle: &ObjectHandle,
        interface: &str,
        name: &str,
        value: Value,
    ) {
        let mut objects = self.locked_objects();
        if let Some(props) = objects
            .get_mut(handle)
            .and_then(|interfaces| interfaces.get_mut(interface))
        {
            props.insert(name.to_string(), value);
        }
    }

    /// Push an object-added notification for a scripted object.
    pub fn push_object_added(&self, handle: &ObjectHandle) {
        let interfaces = self.locked_objects().get(handle).cloned();
        if let Some(interfaces) = interfaces {
            let _ = self.object_added_tx.send(ObjectAdded {
                handle: handle.clone(),
                interfaces,
            });
        }
    }

    /// Push an object-added notification with an explicit shape.
    pub fn push_object_added_with(&self, handle: ObjectHandle, interfaces: InterfaceMap) {
        let _ = self.object_added_tx.send(ObjectAdded { handle, interfaces });
    }

    /// Push a property-change notification to matching watchers.
    pub fn push_properties_changed(
        &self,
        handle: &ObjectHandle,
        interface: &str,
        changed: PropertyMap,
    ) {
        let watchers = self
            .watchers
            .lock()
            .expect("mock watcher lock poisoned - a thread panicked while holding the lock");
        for watcher in watchers.iter().filter(|w| &w.handle == handle) {
            let _ = watcher.sender.send(PropertyChange {
                handle: handle.clone(),
                interface: interface.to_string(),
                changed: changed.clone(),
            });
        }
    }
}

#[async_trait]
impl ObjectBroker for MockBroker {
    async fn enumerate_objects(&self) -> Result<ObjectMap, BrokerError> {
        self.record(&ObjectHandle::new("/"), "ObjectManager", "EnumerateObjects");
        if self.should_fail("EnumerateObjects") {
            return Err(BrokerError::Failed("injected EnumerateObjects failure".into()));
        }
        Ok(self.locked_objects().clone())
    }

    async fn call(
        &self,
        handle: &ObjectHandle,
        interface: &str,
        method: &str,
        _args: Vec<Value>,
    ) -> Result<Value, BrokerError> {
        self.record(handle, interface, method);
        if self.should_fail(method) {
            return Err(BrokerError::Failed(format!("injected {method} failure")));
        }

        if method == METHOD_READ_VALUE {
            if self.reads_gated.load(Ordering::SeqCst) {
                let permit = self
                    .read_gate
                    .acquire()
                    .await
                    .map_err(|_| BrokerError::Failed("read gate closed".into()))?;
                permit.forget();
            }
            let value = self
                .locked_objects()
                .get(handle)
                .and_then(|interfaces| interfaces.get(interface))
                .and_then(|props| props.get(PROP_VALUE))
                .and_then(Value::as_bytes)
                .cloned()
                .unwrap_or_default();
            return Ok(Value::Bytes(value));
        }

        Ok(Value::Unit)
    }

    async fn get_property(
        &self,
        handle: &ObjectHandle,
        interface: &str,
        name: &str,
    ) -> Result<Value, BrokerError> {
        self.record(handle, interface, "GetProperty");
        if self.should_fail("GetProperty") {
            return Err(BrokerError::Failed("injected GetProperty failure".into()));
        }
        self.locked_objects()
            .get(handle)
            .and_then(|interfaces| interfaces.get(interface))
            .and_then(|props| props.get(name))
            .cloned()
            .ok_or_else(|| BrokerError::NotFound(format!("{handle} {interface}.{name}")))
    }

    fn object_added(&self) -> broadcast::Receiver<ObjectAdded> {
        self.object_added_tx.subscribe()
    }

    async fn watch_properties(&self, handle: &ObjectHandle) -> Result<PropertyWatch, BrokerError> {
        if self.should_fail("WatchProperties") {
            return Err(BrokerError::Failed("injected WatchProperties failure".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_watch_id.fetch_add(1, Ordering::SeqCst);
        {
            let mut watchers = self
                .watchers
                .lock()
                .expect("mock watcher lock poisoned - a thread panicked while holding the lock");
            watchers.push(PropWatcher {
                id,
                handle: handle.clone(),
                sender: tx,
            });
        }

        Ok(PropertyWatch::new(
            handle.clone(),
            rx,
            WatchRelease {
                id,
                watchers: Arc::clone(&self.watchers),
            },
        ))
    }
}

/// Deregisters the subscription at the broker when the watch is dropped.
struct WatchRelease {
    id: u64,
    watchers: Arc<Mutex<Vec<PropWatcher>>>,
}

impl Drop for WatchRelease {
    fn drop(&mut self) {
        if let Ok(mut watchers) = self.watchers.lock() {
            watchers.retain(|w| w.id != self.id);
        }
    }
}

/// Builder for a scripted [`MockBroker`].
#[derive(Default)]
pub struct MockBrokerBuilder {
    objects: ObjectMap,
}

impl MockBrokerBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an object with an explicit interface map.
    #[must_use]
    pub fn with_object(mut self, handle: impl Into<ObjectHandle>, interfaces: InterfaceMap) -> Self {
        self.objects.insert(handle.into(), interfaces);
        self
    }

    /// Add a device-shaped object.
    #[must_use]
    pub fn with_device(
        mut self,
        path: &str,
        address: &str,
        alias: Option<&str>,
    ) -> Self {
        let mut props = PropertyMap::new();
        props.insert(PROP_ADDRESS.into(), Value::String(address.into()));
        if let Some(alias) = alias {
            props.insert(PROP_ALIAS.into(), Value::String(alias.into()));
        }
        props.insert(PROP_SERVICES_RESOLVED.into(), Value::Bool(false));
        let mut interfaces = InterfaceMap::new();
        interfaces.insert(DEVICE_INTERFACE.into(), props);
        self.objects.insert(ObjectHandle::new(path), interfaces);
        self
    }

    /// Add a device-shaped object with a generated address.
    #[must_use]
    pub fn with_anonymous_device(self, path: &str) -> Self {
        let address = format!(
            "MO:CK:{:02X}:{:02X}:{:02X}:{:02X}",
            rand::random::<u8>(),
            rand::random::<u8>(),
            rand::random::<u8>(),
            rand::random::<u8>()
        );
        self.with_device(path, &address, None)
    }

    /// Add a service-shaped object.
    #[must_use]
    pub fn with_service(mut self, path: &str, uuid: Uuid, primary: bool) -> Self {
        let mut props = PropertyMap::new();
        props.insert(PROP_UUID.into(), Value::String(uuid.to_string()));
        props.insert(PROP_PRIMARY.into(), Value::Bool(primary));
        let mut interfaces = InterfaceMap::new();
        interfaces.insert(SERVICE_INTERFACE.into(), props);
        self.objects.insert(ObjectHandle::new(path), interfaces);
        self
    }

    /// Add a characteristic-shaped object.
    #[must_use]
    pub fn with_characteristic(
        mut self,
        path: &str,
        service_path: &str,
        uuid: Uuid,
        flags: &[&str],
        value: &[u8],
    ) -> Self {
        let mut props = PropertyMap::new();
        props.insert(PROP_UUID.into(), Value::String(uuid.to_string()));
        props.insert(
            PROP_SERVICE.into(),
            Value::Handle(ObjectHandle::new(service_path)),
        );
        props.insert(
            PROP_FLAGS.into(),
            Value::StringList(flags.iter().map(|s| s.to_string()).collect()),
        );
        props.insert(PROP_HANDLE.into(), Value::U16(0));
        props.insert(
            PROP_VALUE.into(),
            Value::Bytes(Bytes::copy_from_slice(value)),
        );
        let mut interfaces = InterfaceMap::new();
        interfaces.insert(CHARACTERISTIC_INTERFACE.into(), props);
        self.objects.insert(ObjectHandle::new(path), interfaces);
        self
    }

    /// Add a descriptor-shaped object.
    #[must_use]
    pub fn with_descriptor(
        mut self,
        path: &str,
        characteristic_path: &str,
        uuid: Uuid,
        value: &[u8],
    ) -> Self {
        let mut props = PropertyMap::new();
        props.insert(PROP_UUID.into(), Value::String(uuid.to_string()));
        props.insert(
            PROP_CHARACTERISTIC.into(),
            Value::Handle(ObjectHandle::new(characteristic_path)),
        );
        props.insert(
            PROP_VALUE.into(),
            Value::Bytes(Bytes::copy_from_slice(value)),
        );
        let mut interfaces = InterfaceMap::new();
        interfaces.insert(DESCRIPTOR_INTERFACE.into(), props);
        self.objects.insert(ObjectHandle::new(path), interfaces);
        self
    }

    /// Finish building.
    pub fn build(self) -> MockBroker {
        let (object_added_tx, _) = broadcast::channel(64);
        MockBroker {
            objects: Mutex::new(self.objects),
            calls: Mutex::new(Vec::new()),
            fail_methods: Mutex::new(HashSet::new()),
            read_gate: Semaphore::new(0),
            reads_gated: AtomicBool::new(false),
            object_added_tx,
            watchers: Arc::new(Mutex::new(Vec::new())),
            next_watch_id: AtomicU64::new(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn scripted_objects_enumerate() {
        let broker = MockBroker::builder()
            .with_device("/dev_AA", "AA:BB:CC:DD:EE:FF", Some("Sensor"))
            .with_service("/dev_AA/service0001", Uuid::from_u128(1), true)
            .build();

        let objects = broker.enumerate_objects().await.unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(broker.call_count("EnumerateObjects"), 1);
    }

    #[tokio::test]
    async fn read_value_replies_with_scripted_bytes() {
        let broker = MockBroker::builder()
            .with_characteristic(
                "/svc/char1",
                "/svc",
                Uuid::from_u128(2),
                &["read"],
                b"\x01\x02",
            )
            .build();

        let handle = ObjectHandle::new("/svc/char1");
        let reply = broker
            .call(
                &handle,
                CHARACTERISTIC_INTERFACE,
                METHOD_READ_VALUE,
                vec![Value::Dict(HashMap::new())],
            )
            .await
            .unwrap();
        assert_eq!(reply.as_bytes().unwrap().as_ref(), b"\x01\x02");
    }

    #[tokio::test]
    async fn injected_failures_surface() {
        let broker = MockBroker::builder().build();
        broker.fail_method("Connect");

        let err = broker
            .call(&ObjectHandle::new("/dev"), DEVICE_INTERFACE, "Connect", vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Failed(_)));

        broker.clear_failure("Connect");
        assert!(broker
            .call(&ObjectHandle::new("/dev"), DEVICE_INTERFACE, "Connect", vec![])
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn watches_are_counted_and_released_on_drop() {
        let broker = MockBroker::builder().build();
        let handle = ObjectHandle::new("/dev");

        let watch = broker.watch_properties(&handle).await.unwrap();
        assert_eq!(broker.active_watch_count(), 1);
        drop(watch);
        assert_eq!(broker.active_watch_count(), 0);
    }

    #[tokio::test]
    async fn property_changes_reach_matching_watchers_only() {
        let broker = MockBroker::builder().build();
        let dev_a = ObjectHandle::new("/dev_a");
        let dev_b = ObjectHandle::new("/dev_b");

        let mut watch_a = broker.watch_properties(&dev_a).await.unwrap();
        let _watch_b = broker.watch_properties(&dev_b).await.unwrap();

        let mut changed = PropertyMap::new();
        changed.insert(PROP_SERVICES_RESOLVED.into(), Value::Bool(true));
        broker.push_properties_changed(&dev_a, DEVICE_INTERFACE, changed);

        let change = watch_a.changed().await.unwrap();
        assert_eq!(change.handle, dev_a);
        assert_eq!(
            change.changed.get(PROP_SERVICES_RESOLVED).unwrap().as_bool(),
            Some(true)
        );
    }
}
