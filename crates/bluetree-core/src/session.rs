//! Per-service detail resolution.
//!
//! A [`ServiceSession`] owns an independent snapshot of one service's
//! characteristics and descriptors, fans out a value read for each of
//! them, and tracks completion with a pending counter: the session
//! reaches [`ServiceState::ServiceDiscovered`] exactly once, after every
//! issued read has returned, successfully or not.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, warn};
use uuid::Uuid;

use bluetree_types::interfaces::{
    CHARACTERISTIC_INTERFACE, DESCRIPTOR_INTERFACE, METHOD_READ_VALUE,
};
use bluetree_types::{Characteristic, ObjectHandle, Service, ServiceKind, ServiceState};

use crate::broker::{with_deadline, ObjectBroker, Value};
use crate::error::Result;
use crate::events::{CoreEvent, EventDispatcher, EventReceiver};

/// Options for a detail-resolution session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Deadline applied to every value read the session issues.
    pub call_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(10),
        }
    }
}

impl SessionOptions {
    /// Create new options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-read deadline.
    #[must_use]
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }
}

struct SessionGuarded {
    state: ServiceState,
    characteristics: Vec<Characteristic>,
    /// Outstanding read operations; the terminal transition fires when
    /// this reaches zero.
    pending: usize,
}

struct Shared {
    broker: Arc<dyn ObjectBroker>,
    options: SessionOptions,
    events: EventDispatcher,
    uuid: Uuid,
    handle: ObjectHandle,
    name: String,
    kind: ServiceKind,
    guarded: Mutex<SessionGuarded>,
}

/// One read operation in the fan-out.
enum ReadTarget {
    Characteristic {
        uuid: Uuid,
        handle: ObjectHandle,
        readable: bool,
    },
    Descriptor {
        uuid: Uuid,
        handle: ObjectHandle,
    },
}

/// Resolves the values of one service's characteristics and descriptors.
///
/// The session owns its snapshot: value updates during the fan-out never
/// alias the controller's summary maps. [`Self::characteristics`] may be
/// read while reads are still in flight; that is best-effort access, not
/// a synchronization point.
pub struct ServiceSession {
    shared: Arc<Shared>,
}

impl ServiceSession {
    /// Create a session over a service snapshot with default options.
    pub fn new(broker: Arc<dyn ObjectBroker>, service: Service) -> Self {
        Self::with_options(broker, service, SessionOptions::default())
    }

    /// Create a session over a service snapshot with custom options.
    pub fn with_options(
        broker: Arc<dyn ObjectBroker>,
        service: Service,
        options: SessionOptions,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                broker,
                options,
                events: EventDispatcher::default(),
                uuid: service.uuid,
                handle: service.handle,
                name: service.name,
                kind: service.kind,
                guarded: Mutex::new(SessionGuarded {
                    state: service.state,
                    characteristics: service.characteristics,
                    pending: 0,
                }),
            }),
        }
    }

    /// Subscribe to session state-change events.
    pub fn subscribe(&self) -> EventReceiver {
        self.shared.events.subscribe()
    }

    /// Identifier of the service this session resolves.
    pub fn uuid(&self) -> Uuid {
        self.shared.uuid
    }

    /// Broker object handle of the service.
    pub fn handle(&self) -> &ObjectHandle {
        &self.shared.handle
    }

    /// Display name of the service.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Primary/included classification of the service.
    pub fn kind(&self) -> ServiceKind {
        self.shared.kind
    }

    /// Current detail-resolution state.
    pub fn state(&self) -> ServiceState {
        self.shared.lock().state
    }

    /// The current characteristic list.
    ///
    /// May be observed while reads are in flight, in which case some
    /// values are still the pre-read snapshots.
    pub fn characteristics(&self) -> Vec<Characteristic> {
        self.shared.lock().characteristics.clone()
    }

    /// Fan out a value read for every characteristic and descriptor.
    ///
    /// Valid once, from [`ServiceState::DiscoveryRequired`]; calling
    /// again is a logged no-op. Characteristics without the read
    /// capability are skipped but still count as completed. A service
    /// with nothing to read completes synchronously without issuing any
    /// broker call.
    pub async fn discover_details(&self) -> Result<()> {
        let targets = {
            let mut guarded = self.shared.lock();
            if guarded.state != ServiceState::DiscoveryRequired {
                warn!(service = %self.shared.uuid, "details already requested, ignoring");
                return Ok(());
            }
            guarded.state = ServiceState::DiscoveringServices;

            let mut targets = Vec::new();
            for characteristic in &guarded.characteristics {
                targets.push(ReadTarget::Characteristic {
                    uuid: characteristic.uuid,
                    handle: characteristic.handle.clone(),
                    readable: characteristic.is_readable(),
                });
                for descriptor in &characteristic.descriptors {
                    targets.push(ReadTarget::Descriptor {
                        uuid: descriptor.uuid,
                        handle: descriptor.handle.clone(),
                    });
                }
            }
            guarded.pending = targets.len();
            targets
        };
        info!(
            service = %self.shared.uuid,
            pending = targets.len(),
            "discovering service details"
        );

        if targets.is_empty() {
            // Nothing to read; complete synchronously within this call.
            self.shared.lock().state = ServiceState::ServiceDiscovered;
            self.shared.events.send(CoreEvent::StateChanged {
                uuid: self.shared.uuid,
                state: ServiceState::ServiceDiscovered,
            });
            return Ok(());
        }

        for target in targets {
            match target {
                ReadTarget::Characteristic {
                    readable: false, ..
                } => {
                    // Skipped reads still count as completed.
                    self.shared.complete_one();
                }
                ReadTarget::Characteristic {
                    uuid,
                    handle,
                    readable: true,
                } => {
                    let shared = Arc::clone(&self.shared);
                    tokio::spawn(async move {
                        shared
                            .read_value(uuid, handle, CHARACTERISTIC_INTERFACE, true)
                            .await;
                    });
                }
                ReadTarget::Descriptor { uuid, handle } => {
                    let shared = Arc::clone(&self.shared);
                    tokio::spawn(async move {
                        shared
                            .read_value(uuid, handle, DESCRIPTOR_INTERFACE, false)
                            .await;
                    });
                }
            }
        }
        Ok(())
    }
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, SessionGuarded> {
        self.guarded
            .lock()
            .expect("session state lock poisoned - a thread panicked while holding the lock")
    }

    /// Issue one value read and merge the result into the snapshot.
    ///
    /// A failed or timed-out read is logged and leaves the previous
    /// value in place; the pending count is decremented either way.
    async fn read_value(
        &self,
        uuid: Uuid,
        handle: ObjectHandle,
        interface: &'static str,
        is_characteristic: bool,
    ) {
        let call = self.broker.call(
            &handle,
            interface,
            METHOD_READ_VALUE,
            vec![Value::Dict(HashMap::new())],
        );
        match with_deadline(self.options.call_timeout, call).await {
            Ok(reply) => match reply.as_bytes() {
                Some(bytes) => self.merge_value(&handle, is_characteristic, bytes.clone()),
                None => debug!(target_uuid = %uuid, "read returned a non-byte value"),
            },
            Err(err) => {
                // Degrade to "no value available"; resolution still completes.
                debug!(target_uuid = %uuid, "value read failed: {err}");
            }
        }
        self.complete_one();
    }

    /// Overwrite the stored value on the matching characteristic or
    /// descriptor.
    ///
    /// Matching is by broker handle: unlike UUIDs, handles stay unique
    /// when the same descriptor UUID repeats under several
    /// characteristics.
    fn merge_value(&self, handle: &ObjectHandle, is_characteristic: bool, bytes: Bytes) {
        let mut guarded = self.lock();
        if is_characteristic {
            if let Some(characteristic) = guarded
                .characteristics
                .iter_mut()
                .find(|c| &c.handle == handle)
            {
                debug!(characteristic = %characteristic.uuid, "updating characteristic value");
                characteristic.value = bytes;
            }
        } else {
            for characteristic in guarded.characteristics.iter_mut() {
                if let Some(descriptor) = characteristic
                    .descriptors
                    .iter_mut()
                    .find(|d| &d.handle == handle)
                {
                    debug!(descriptor = %descriptor.uuid, "updating descriptor value");
                    descriptor.value = bytes;
                    break;
                }
            }
        }
    }

    /// Record one completed (or skipped) read; fire the terminal
    /// transition when the last one lands.
    fn complete_one(&self) {
        let finished = {
            let mut guarded = self.lock();
            guarded.pending = guarded.pending.saturating_sub(1);
            if guarded.pending == 0 && guarded.state == ServiceState::DiscoveringServices {
                guarded.state = ServiceState::ServiceDiscovered;
                true
            } else {
                false
            }
        };
        if finished {
            info!(service = %self.uuid, "service details discovered");
            self.events.send(CoreEvent::StateChanged {
                uuid: self.uuid,
                state: ServiceState::ServiceDiscovered,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bluetree_types::Capabilities;

    fn empty_service(uuid: Uuid) -> Service {
        Service {
            uuid,
            handle: ObjectHandle::new("/svc"),
            name: uuid.to_string(),
            kind: ServiceKind::Primary,
            state: ServiceState::DiscoveryRequired,
            characteristics: Vec::new(),
        }
    }

    #[tokio::test]
    async fn empty_service_completes_synchronously() {
        let broker = Arc::new(crate::mock::MockBroker::builder().build());
        let uuid = Uuid::from_u128(0xE);
        let session = ServiceSession::new(broker.clone(), empty_service(uuid));
        let mut events = session.subscribe();

        assert_eq!(session.state(), ServiceState::DiscoveryRequired);
        session.discover_details().await.unwrap();
        assert_eq!(session.state(), ServiceState::ServiceDiscovered);

        // The event was emitted within discover_details itself.
        let event = events.try_recv().unwrap();
        assert!(matches!(
            event,
            CoreEvent::StateChanged {
                state: ServiceState::ServiceDiscovered,
                ..
            }
        ));
        // No broker call was issued.
        assert_eq!(broker.call_count(METHOD_READ_VALUE), 0);
    }

    #[tokio::test]
    async fn repeated_discover_details_is_a_no_op() {
        let broker = Arc::new(crate::mock::MockBroker::builder().build());
        let session = ServiceSession::new(broker, empty_service(Uuid::from_u128(0xF)));
        let mut events = session.subscribe();

        session.discover_details().await.unwrap();
        session.discover_details().await.unwrap();

        assert!(events.try_recv().is_ok());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn non_readable_characteristics_are_skipped_but_counted() {
        let broker = Arc::new(crate::mock::MockBroker::builder().build());
        let uuid = Uuid::from_u128(0x10);
        let mut service = empty_service(uuid);
        service.characteristics.push(Characteristic {
            uuid: Uuid::from_u128(0x11),
            handle: ObjectHandle::new("/svc/char1"),
            att_handle: 1,
            value: Bytes::new(),
            capabilities: Capabilities::from_tokens(["write"]),
            descriptors: Vec::new(),
        });

        let session = ServiceSession::new(broker.clone(), service);
        session.discover_details().await.unwrap();

        // The skipped read completed the session without any broker call.
        assert_eq!(session.state(), ServiceState::ServiceDiscovered);
        assert_eq!(broker.call_count(METHOD_READ_VALUE), 0);
    }
}
