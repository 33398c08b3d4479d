//! The object-broker contract the core consumes.
//!
//! The broker exposes the peripheral's live state as addressable remote
//! objects with typed properties and change notifications. The core only
//! ever sees this trait: [`crate::mock::MockBroker`] implements it for
//! tests, and `BluezBroker` implements it over the system bus on Linux.
//!
//! Every call is asynchronous; results are delivered when the future
//! resolves. Components wrap each call in [`with_deadline`] so a call
//! that never completes resolves through the same path as a failed one.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};

use bluetree_types::ObjectHandle;

use crate::error::BrokerError;

/// A typed property value at the broker.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new value
/// shapes in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Default)]
#[non_exhaustive]
pub enum Value {
    /// An empty reply (calls that return nothing).
    #[default]
    Unit,
    /// A boolean property.
    Bool(bool),
    /// A 16-bit numeric property (attribute handles).
    U16(u16),
    /// A text property.
    String(String),
    /// A byte-sequence property (raw values).
    Bytes(Bytes),
    /// A list of text properties (capability tokens, service identifiers).
    StringList(Vec<String>),
    /// A reference to another remote object.
    Handle(ObjectHandle),
    /// A string-keyed map (call options).
    Dict(HashMap<String, Value>),
}

impl Value {
    /// The boolean inside, if this is a boolean value.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The number inside, if this is a 16-bit numeric value.
    #[must_use]
    pub fn as_u16(&self) -> Option<u16> {
        match self {
            Self::U16(n) => Some(*n),
            _ => None,
        }
    }

    /// The text inside, if this is a text value.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// The bytes inside, if this is a byte-sequence value.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// The list inside, if this is a string-list value.
    #[must_use]
    pub fn as_string_list(&self) -> Option<&[String]> {
        match self {
            Self::StringList(list) => Some(list),
            _ => None,
        }
    }

    /// The handle inside, if this is an object-reference value.
    #[must_use]
    pub fn as_handle(&self) -> Option<&ObjectHandle> {
        match self {
            Self::Handle(handle) => Some(handle),
            _ => None,
        }
    }
}

/// Properties of one interface on one remote object.
pub type PropertyMap = HashMap<String, Value>;

/// The interfaces a remote object implements, with their properties.
pub type InterfaceMap = HashMap<String, PropertyMap>;

/// A full enumeration snapshot: every object the broker knows about.
pub type ObjectMap = HashMap<ObjectHandle, InterfaceMap>;

/// Notification that a new remote object appeared at the broker.
#[derive(Debug, Clone)]
pub struct ObjectAdded {
    /// Handle of the new object.
    pub handle: ObjectHandle,
    /// Interfaces and properties the object appeared with.
    pub interfaces: InterfaceMap,
}

/// Notification that properties changed on a watched remote object.
#[derive(Debug, Clone)]
pub struct PropertyChange {
    /// Handle of the mutated object.
    pub handle: ObjectHandle,
    /// Interface the changed properties belong to.
    pub interface: String,
    /// The changed properties and their new values.
    pub changed: PropertyMap,
}

/// A live property-change subscription scoped to one remote object.
///
/// The subscription is a resource: it is acquired on connect, delivers
/// changes through [`PropertyWatch::changed`], and is released at the
/// broker when the watch is dropped. Never leave one dangling past the
/// connection it belongs to.
pub struct PropertyWatch {
    handle: ObjectHandle,
    events: mpsc::UnboundedReceiver<PropertyChange>,
    // Broker-side release runs when this drops.
    _guard: Box<dyn std::any::Any + Send>,
}

impl PropertyWatch {
    /// Assemble a watch from its parts. Intended for broker implementors.
    pub fn new(
        handle: ObjectHandle,
        events: mpsc::UnboundedReceiver<PropertyChange>,
        guard: impl std::any::Any + Send,
    ) -> Self {
        Self {
            handle,
            events,
            _guard: Box::new(guard),
        }
    }

    /// The object this watch is scoped to.
    #[must_use]
    pub fn handle(&self) -> &ObjectHandle {
        &self.handle
    }

    /// Wait for the next property change.
    ///
    /// Returns `None` once the broker side has gone away.
    pub async fn changed(&mut self) -> Option<PropertyChange> {
        self.events.recv().await
    }
}

impl std::fmt::Debug for PropertyWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertyWatch")
            .field("handle", &self.handle)
            .finish()
    }
}

/// Request/response and notification surface of the object broker.
///
/// Implementations must be safe to share behind an `Arc` and to call from
/// spawned tasks; the core issues independent calls concurrently and makes
/// no ordering assumption across them.
#[async_trait]
pub trait ObjectBroker: Send + Sync {
    /// Enumerate every remote object the broker currently knows about.
    async fn enumerate_objects(&self) -> Result<ObjectMap, BrokerError>;

    /// Invoke a method on one remote object.
    async fn call(
        &self,
        handle: &ObjectHandle,
        interface: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, BrokerError>;

    /// Read one property of one remote object.
    async fn get_property(
        &self,
        handle: &ObjectHandle,
        interface: &str,
        name: &str,
    ) -> Result<Value, BrokerError>;

    /// Subscribe to object-added notifications.
    ///
    /// The broker pushes one event per newly appearing object for as long
    /// as the receiver is held.
    fn object_added(&self) -> broadcast::Receiver<ObjectAdded>;

    /// Acquire a property-change subscription scoped to one object.
    async fn watch_properties(&self, handle: &ObjectHandle) -> Result<PropertyWatch, BrokerError>;
}

/// Run a broker call with a deadline.
///
/// A call that outlives the deadline resolves to [`BrokerError::Timeout`],
/// taking the same completion path as any other failed call.
pub(crate) async fn with_deadline<T, F>(deadline: Duration, call: F) -> Result<T, BrokerError>
where
    F: Future<Output = Result<T, BrokerError>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(BrokerError::Timeout(deadline)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_accessors() {
        assert_eq!(Value::Bool(true).as_bool(), Some(true));
        assert_eq!(Value::U16(7).as_u16(), Some(7));
        assert_eq!(Value::String("x".into()).as_str(), Some("x"));
        assert_eq!(Value::Bool(true).as_str(), None);

        let handle = ObjectHandle::new("/dev");
        assert_eq!(Value::Handle(handle.clone()).as_handle(), Some(&handle));

        let list = Value::StringList(vec!["read".into()]);
        assert_eq!(list.as_string_list(), Some(&["read".to_string()][..]));
    }

    #[tokio::test]
    async fn deadline_converts_to_timeout_error() {
        let result: Result<Value, BrokerError> = with_deadline(Duration::from_millis(5), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Value::Unit)
        })
        .await;

        assert!(matches!(result, Err(BrokerError::Timeout(_))));
    }

    #[tokio::test]
    async fn deadline_passes_through_completed_calls() {
        let result = with_deadline(Duration::from_secs(1), async { Ok(Value::Bool(true)) }).await;
        assert_eq!(result.unwrap().as_bool(), Some(true));
    }
}
