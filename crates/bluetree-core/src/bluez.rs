//! BlueZ system-bus implementation of the object broker.
//!
//! Adapts the `org.bluez` D-Bus surface (ObjectManager enumeration,
//! method calls, Properties access, and the InterfacesAdded /
//! PropertiesChanged signals) to the [`ObjectBroker`] trait. D-Bus error
//! names are classified into [`BrokerError`] kinds so callers can tell a
//! missing object from a denied or timed-out call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dbus::arg::{self, ArgType, PropMap, RefArg};
use dbus::message::MatchRule;
use dbus::nonblock::stdintf::org_freedesktop_dbus::{ObjectManager, Properties};
use dbus::nonblock::{MsgMatch, Proxy, SyncConnection};
use dbus::Message;
use dbus_tokio::connection;
use futures::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use bluetree_types::interfaces::METHOD_READ_VALUE;
use bluetree_types::ObjectHandle;

use crate::broker::{
    InterfaceMap, ObjectAdded, ObjectBroker, ObjectMap, PropertyChange, PropertyMap,
    PropertyWatch, Value,
};
use crate::error::{BrokerError, Result};

const BLUEZ_BUS_NAME: &str = "org.bluez";
const OBJECT_MANAGER_PATH: &str = "/";

/// Per-proxy reply timeout; components apply their own deadlines on top.
const PROXY_TIMEOUT: Duration = Duration::from_secs(30);

/// Object broker backed by BlueZ on the D-Bus system bus.
pub struct BluezBroker {
    conn: Arc<SyncConnection>,
    object_added_tx: broadcast::Sender<ObjectAdded>,
    // Keep the InterfacesAdded subscription alive for the broker's lifetime.
    _added_match: MsgMatch,
    added_task: JoinHandle<()>,
    resource_task: JoinHandle<()>,
}

impl BluezBroker {
    /// Connect to the system bus and subscribe to object-added signals.
    pub async fn connect_system() -> Result<Self> {
        let (resource, conn) = connection::new_system_sync()
            .map_err(|err| BrokerError::Failed(format!("system bus unavailable: {err}")))?;

        let resource_task = tokio::spawn(async move {
            let err = resource.await;
            error!("lost connection to the system bus: {err}");
        });

        let (object_added_tx, _) = broadcast::channel(64);

        let rule = MatchRule::new_signal("org.freedesktop.DBus.ObjectManager", "InterfacesAdded")
            .with_sender(BLUEZ_BUS_NAME);
        let added_match = conn
            .add_match(rule)
            .await
            .map_err(map_dbus_error)?;
        let (added_match, stream) = added_match.stream();

        let tx = object_added_tx.clone();
        // Demarshal from the message here: the raw property maps are not
        // Send and must not cross the channel.
        let added_task = tokio::spawn(stream.for_each(move |(msg, ()): (Message, ())| {
            if let Ok((path, interfaces)) =
                msg.read2::<dbus::Path, HashMap<String, PropMap>>()
            {
                let event = ObjectAdded {
                    handle: ObjectHandle::new(path.to_string()),
                    interfaces: convert_interfaces(&interfaces),
                };
                debug!(handle = %event.handle, "object added");
                let _ = tx.send(event);
            }
            async {}
        }));

        Ok(Self {
            conn,
            object_added_tx,
            _added_match: added_match,
            added_task,
            resource_task,
        })
    }

    /// Handle of the default adapter object.
    pub fn default_adapter() -> ObjectHandle {
        ObjectHandle::new("/org/bluez/hci0")
    }

    fn proxy<'a>(&self, path: &'a str) -> Proxy<'a, Arc<SyncConnection>> {
        Proxy::new(BLUEZ_BUS_NAME, path, PROXY_TIMEOUT, Arc::clone(&self.conn))
    }
}

impl Drop for BluezBroker {
    fn drop(&mut self) {
        self.added_task.abort();
        self.resource_task.abort();
    }
}

#[async_trait]
impl ObjectBroker for BluezBroker {
    async fn enumerate_objects(&self) -> std::result::Result<ObjectMap, BrokerError> {
        let proxy = self.proxy(OBJECT_MANAGER_PATH);
        let objects = proxy
            .get_managed_objects()
            .await
            .map_err(map_dbus_error)?;

        let mut map = ObjectMap::new();
        for (path, interfaces) in &objects {
            map.insert(
                ObjectHandle::new(path.to_string()),
                convert_interfaces(interfaces),
            );
        }
        Ok(map)
    }

    async fn call(
        &self,
        handle: &ObjectHandle,
        interface: &str,
        method: &str,
        args: Vec<Value>,
    ) -> std::result::Result<Value, BrokerError> {
        let proxy = self.proxy(handle.as_str());

        if method == METHOD_READ_VALUE {
            // ReadValue takes an empty options map and returns bytes.
            let (bytes,): (Vec<u8>,) = proxy
                .method_call(interface, method, (PropMap::new(),))
                .await
                .map_err(map_dbus_error)?;
            return Ok(Value::Bytes(Bytes::from(bytes)));
        }

        if !args.is_empty() {
            warn!(method, "unsupported argument shape for BlueZ call");
            return Err(BrokerError::Failed(format!(
                "unsupported argument shape for {method}"
            )));
        }

        let _: () = proxy
            .method_call(interface, method, ())
            .await
            .map_err(map_dbus_error)?;
        Ok(Value::Unit)
    }

    async fn get_property(
        &self,
        handle: &ObjectHandle,
        interface: &str,
        name: &str,
    ) -> std::result::Result<Value, BrokerError> {
        let proxy = self.proxy(handle.as_str());
        let value: Box<dyn RefArg> = proxy
            .get(interface, name)
            .await
            .map_err(map_dbus_error)?;
        convert_value(value.as_ref()).ok_or_else(|| {
            BrokerError::InvalidReply(format!("{interface}.{name} has an unsupported shape"))
        })
    }

    fn object_added(&self) -> broadcast::Receiver<ObjectAdded> {
        self.object_added_tx.subscribe()
    }

    async fn watch_properties(
        &self,
        handle: &ObjectHandle,
    ) -> std::result::Result<PropertyWatch, BrokerError> {
        let rule = MatchRule::new_signal("org.freedesktop.DBus.Properties", "PropertiesChanged")
            .with_sender(BLUEZ_BUS_NAME)
            .with_path(handle.as_str().to_string());
        let msg_match = self.conn.add_match(rule).await.map_err(map_dbus_error)?;
        let (msg_match, stream) = msg_match.stream();

        let (tx, rx) = mpsc::unbounded_channel();
        let watched = handle.clone();
        let task = tokio::spawn(stream.for_each(move |(msg, ()): (Message, ())| {
            if let Ok((interface, changed, _invalidated)) =
                msg.read3::<String, PropMap, Vec<String>>()
            {
                let change = PropertyChange {
                    handle: watched.clone(),
                    interface,
                    changed: convert_props(&changed),
                };
                let _ = tx.send(change);
            }
            async {}
        }));

        Ok(PropertyWatch::new(
            handle.clone(),
            rx,
            WatchRelease {
                conn: Arc::clone(&self.conn),
                msg_match: Some(msg_match),
                task,
            },
        ))
    }
}

/// Removes the match rule at the bus when the watch is dropped.
struct WatchRelease {
    conn: Arc<SyncConnection>,
    msg_match: Option<MsgMatch>,
    task: JoinHandle<()>,
}

impl Drop for WatchRelease {
    fn drop(&mut self) {
        self.task.abort();
        if let Some(msg_match) = self.msg_match.take() {
            let conn = Arc::clone(&self.conn);
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    if let Err(err) = conn.remove_match(msg_match.token()).await {
                        debug!("removing property match failed: {err}");
                    }
                });
            }
        }
    }
}

/// Classify a D-Bus error by its name.
fn map_dbus_error(err: dbus::Error) -> BrokerError {
    let name = err.name().unwrap_or_default();
    let message = err.message().unwrap_or_default().to_string();
    match name {
        "org.freedesktop.DBus.Error.UnknownObject" | "org.bluez.Error.DoesNotExist" => {
            BrokerError::NotFound(message)
        }
        "org.freedesktop.DBus.Error.AccessDenied"
        | "org.bluez.Error.NotAuthorized"
        | "org.bluez.Error.NotPermitted" => BrokerError::PermissionDenied(message),
        "org.freedesktop.DBus.Error.NoReply" | "org.freedesktop.DBus.Error.Timeout" => {
            BrokerError::Timeout(PROXY_TIMEOUT)
        }
        _ => BrokerError::Failed(format!("{name}: {message}")),
    }
}

fn convert_interfaces(interfaces: &HashMap<String, PropMap>) -> InterfaceMap {
    interfaces
        .iter()
        .map(|(name, props)| (name.clone(), convert_props(props)))
        .collect()
}

fn convert_props(props: &PropMap) -> PropertyMap {
    let mut map = PropertyMap::new();
    for (name, variant) in props {
        if let Some(value) = convert_value(variant.0.as_ref()) {
            map.insert(name.clone(), value);
        }
    }
    map
}

/// Convert one demarshalled argument into a broker value.
///
/// Returns `None` for shapes the model has no use for; the property is
/// then dropped like any other unrecognized field.
fn convert_value(refarg: &(dyn RefArg + 'static)) -> Option<Value> {
    match refarg.arg_type() {
        ArgType::Boolean => refarg.as_i64().map(|v| Value::Bool(v != 0)),
        ArgType::UInt16 => refarg.as_u64().map(|v| Value::U16(v as u16)),
        ArgType::String => refarg.as_str().map(|s| Value::String(s.to_string())),
        ArgType::ObjectPath => refarg.as_str().map(|s| Value::Handle(ObjectHandle::new(s))),
        ArgType::Array => {
            if let Some(bytes) = arg::cast::<Vec<u8>>(refarg) {
                return Some(Value::Bytes(Bytes::copy_from_slice(bytes)));
            }
            if let Some(strings) = arg::cast::<Vec<String>>(refarg) {
                return Some(Value::StringList(strings.clone()));
            }
            // Demarshalled arrays are not always concrete vectors.
            let mut bytes = Vec::new();
            let mut strings = Vec::new();
            for element in refarg.as_iter()? {
                match element.arg_type() {
                    ArgType::Byte => bytes.push(element.as_u64()? as u8),
                    ArgType::String | ArgType::ObjectPath => {
                        strings.push(element.as_str()?.to_string());
                    }
                    _ => return None,
                }
            }
            if !strings.is_empty() {
                Some(Value::StringList(strings))
            } else {
                Some(Value::Bytes(Bytes::from(bytes)))
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dbus_error_names_classify() {
        let err = dbus::Error::new_custom("org.bluez.Error.DoesNotExist", "gone");
        assert!(matches!(map_dbus_error(err), BrokerError::NotFound(_)));

        let err = dbus::Error::new_custom("org.freedesktop.DBus.Error.AccessDenied", "no");
        assert!(matches!(
            map_dbus_error(err),
            BrokerError::PermissionDenied(_)
        ));

        let err = dbus::Error::new_custom("org.freedesktop.DBus.Error.NoReply", "slow");
        assert!(matches!(map_dbus_error(err), BrokerError::Timeout(_)));

        let err = dbus::Error::new_custom("org.bluez.Error.Failed", "bad");
        assert!(matches!(map_dbus_error(err), BrokerError::Failed(_)));
    }

    #[test]
    fn values_convert_from_refargs() {
        assert_eq!(convert_value(&true), Some(Value::Bool(true)));
        assert_eq!(convert_value(&0x0010u16), Some(Value::U16(0x0010)));
        assert_eq!(
            convert_value(&"AA:BB".to_string()),
            Some(Value::String("AA:BB".into()))
        );

        let flags = vec!["read".to_string(), "notify".to_string()];
        assert_eq!(
            convert_value(&flags),
            Some(Value::StringList(vec!["read".into(), "notify".into()]))
        );

        let raw = vec![0x01u8, 0x02];
        assert_eq!(
            convert_value(&raw),
            Some(Value::Bytes(Bytes::from_static(b"\x01\x02")))
        );
    }
}
