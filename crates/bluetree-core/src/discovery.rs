//! Peripheral discovery and scan lifecycle.
//!
//! The [`DiscoveryAgent`] owns one scan cycle at a time: it seeds results
//! from the objects the broker already knows about, requests active
//! scanning, reports every qualifying remote object exactly once, and
//! stops after a configurable scan duration.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bluetree_types::interfaces::{
    ADAPTER_INTERFACE, DEVICE_INTERFACE, METHOD_START_DISCOVERY, METHOD_STOP_DISCOVERY,
    PROP_ADDRESS, PROP_ALIAS, PROP_UUIDS,
};
use bluetree_types::{CoreConfigurations, ObjectHandle, PeripheralInfo};

use crate::broker::{with_deadline, InterfaceMap, ObjectBroker, Value};
use crate::error::{ErrorKind, Result};
use crate::events::{CoreEvent, EventDispatcher, EventReceiver};

/// Options for a scan cycle.
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// How long active scanning runs before the agent stops itself.
    pub scan_duration: Duration,
    /// Deadline applied to every broker call the agent issues.
    pub call_timeout: Duration,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            scan_duration: Duration::from_millis(5000),
            call_timeout: Duration::from_secs(10),
        }
    }
}

impl DiscoveryOptions {
    /// Create new options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the scan duration.
    #[must_use]
    pub fn scan_duration(mut self, duration: Duration) -> Self {
        self.scan_duration = duration;
        self
    }

    /// Set the per-call deadline.
    #[must_use]
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }
}

/// Scan lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Inactive,
    Starting,
    Active,
    Stopping,
}

struct ScanGuarded {
    state: ScanState,
    /// Handles already reported this cycle.
    seen: HashSet<ObjectHandle>,
    /// Cancels the armed scan timer, when one is armed.
    timer: Option<CancellationToken>,
}

struct Shared {
    broker: Arc<dyn ObjectBroker>,
    adapter: ObjectHandle,
    options: DiscoveryOptions,
    events: EventDispatcher,
    guarded: Mutex<ScanGuarded>,
}

/// Discovers peripherals through the object broker.
///
/// One agent drives one adapter. The object-added subscription is
/// established at construction and lives for the agent's lifetime;
/// notifications arriving while the agent is inactive are ignored.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use bluetree_core::{CoreEvent, DiscoveryAgent, ObjectBroker};
/// use bluetree_types::ObjectHandle;
///
/// # async fn example(broker: Arc<dyn ObjectBroker>) -> bluetree_core::Result<()> {
/// let agent = DiscoveryAgent::new(broker, ObjectHandle::new("/org/bluez/hci0"));
/// let mut events = agent.subscribe();
/// agent.start().await?;
/// while let Ok(event) = events.recv().await {
///     if let CoreEvent::DeviceDiscovered { device } = event {
///         println!("{} ({})", device.name(), device.address());
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct DiscoveryAgent {
    shared: Arc<Shared>,
    watch_task: JoinHandle<()>,
}

impl DiscoveryAgent {
    /// Create an agent with default options.
    pub fn new(broker: Arc<dyn ObjectBroker>, adapter: ObjectHandle) -> Self {
        Self::with_options(broker, adapter, DiscoveryOptions::default())
    }

    /// Create an agent with custom options.
    pub fn with_options(
        broker: Arc<dyn ObjectBroker>,
        adapter: ObjectHandle,
        options: DiscoveryOptions,
    ) -> Self {
        let shared = Arc::new(Shared {
            adapter,
            options,
            events: EventDispatcher::default(),
            guarded: Mutex::new(ScanGuarded {
                state: ScanState::Inactive,
                seen: HashSet::new(),
                timer: None,
            }),
            broker: Arc::clone(&broker),
        });

        // Subscription established for the agent's whole lifetime.
        let mut added = broker.object_added();
        let watcher = Arc::clone(&shared);
        let watch_task = tokio::spawn(async move {
            loop {
                match added.recv().await {
                    Ok(event) => watcher.report_discovered(&event.handle, &event.interfaces),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("missed {missed} object-added notifications");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Self { shared, watch_task }
    }

    /// Subscribe to discovery events.
    pub fn subscribe(&self) -> EventReceiver {
        self.shared.events.subscribe()
    }

    /// Whether a scan cycle is in progress.
    pub fn is_active(&self) -> bool {
        self.shared.lock().state != ScanState::Inactive
    }

    /// Start a scan cycle.
    ///
    /// Seeds results from the broker's already-known objects, then
    /// requests active scanning and arms the scan timer. Calling while a
    /// cycle is already running is a logged no-op.
    ///
    /// A seeding failure emits one error event and scanning is still
    /// requested; a scan-start failure resets the agent to inactive.
    pub async fn start(&self) -> Result<()> {
        {
            let mut guarded = self.shared.lock();
            if guarded.state != ScanState::Inactive {
                warn!("discovery already running, ignoring start");
                return Ok(());
            }
            guarded.state = ScanState::Starting;
            guarded.seen.clear();
        }
        info!("starting discovery");

        // Objects the broker cached before scanning began still count.
        let timeout = self.shared.options.call_timeout;
        match with_deadline(timeout, self.shared.broker.enumerate_objects()).await {
            Ok(objects) => {
                for (handle, interfaces) in &objects {
                    self.shared.report_discovered(handle, interfaces);
                }
            }
            Err(err) => {
                warn!("seeding from cached objects failed: {err}");
                self.shared.events.send(CoreEvent::Error {
                    kind: ErrorKind::from(&err),
                });
            }
        }

        self.shared.continue_scan().await
    }

    /// Stop the current scan cycle.
    ///
    /// Safe to call at any time; stopping an inactive agent or one that is
    /// already stopping is a no-op and never produces a duplicate
    /// discovery-finished event.
    pub async fn stop(&self) -> Result<()> {
        self.shared.do_stop().await
    }
}

impl Drop for DiscoveryAgent {
    fn drop(&mut self) {
        self.watch_task.abort();
    }
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, ScanGuarded> {
        self.guarded
            .lock()
            .expect("discovery state lock poisoned - a thread panicked while holding the lock")
    }

    /// Report one qualifying remote object, once per cycle.
    fn report_discovered(&self, handle: &ObjectHandle, interfaces: &InterfaceMap) {
        let Some(info) = peripheral_from_object(handle, interfaces) else {
            return;
        };
        {
            let mut guarded = self.lock();
            if guarded.state == ScanState::Inactive {
                return;
            }
            if !guarded.seen.insert(handle.clone()) {
                return;
            }
        }
        debug!(address = info.address(), name = info.name(), "device discovered");
        self.events.send(CoreEvent::DeviceDiscovered { device: info });
    }

    /// Request active scanning and arm the scan timer.
    async fn continue_scan(self: &Arc<Self>) -> Result<()> {
        debug!("requesting active scan");
        let start = self.broker.call(
            &self.adapter,
            ADAPTER_INTERFACE,
            METHOD_START_DISCOVERY,
            Vec::new(),
        );
        match with_deadline(self.options.call_timeout, start).await {
            Ok(_) => {
                let token = CancellationToken::new();
                {
                    let mut guarded = self.lock();
                    // A stop may have raced the acknowledgement.
                    if guarded.state != ScanState::Starting {
                        debug!("scan start acknowledged after stop, ignoring");
                        return Ok(());
                    }
                    guarded.state = ScanState::Active;
                    guarded.timer = Some(token.clone());
                }
                info!("scan active for {:?}", self.options.scan_duration);

                let shared = Arc::clone(self);
                let duration = self.options.scan_duration;
                tokio::spawn(async move {
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = sleep(duration) => {
                            if let Err(err) = shared.do_stop().await {
                                debug!("timed scan stop failed: {err}");
                            }
                        }
                    }
                });
                Ok(())
            }
            Err(err) => {
                warn!("starting scan failed: {err}");
                {
                    let mut guarded = self.lock();
                    guarded.state = ScanState::Inactive;
                    guarded.timer = None;
                }
                self.events.send(CoreEvent::Error {
                    kind: ErrorKind::from(&err),
                });
                Err(err.into())
            }
        }
    }

    async fn do_stop(&self) -> Result<()> {
        {
            let mut guarded = self.lock();
            match guarded.state {
                ScanState::Inactive => {
                    debug!("discovery not running, ignoring stop");
                    return Ok(());
                }
                ScanState::Stopping => {
                    debug!("stop already in progress");
                    return Ok(());
                }
                ScanState::Starting | ScanState::Active => {}
            }
            guarded.state = ScanState::Stopping;
            if let Some(timer) = guarded.timer.take() {
                timer.cancel();
            }
        }
        info!("stopping discovery");

        let stop = self.broker.call(
            &self.adapter,
            ADAPTER_INTERFACE,
            METHOD_STOP_DISCOVERY,
            Vec::new(),
        );
        match with_deadline(self.options.call_timeout, stop).await {
            Ok(_) => {
                self.lock().state = ScanState::Inactive;
                self.events.send(CoreEvent::DiscoveryFinished);
                Ok(())
            }
            Err(err) => {
                warn!("stopping scan failed: {err}");
                self.lock().state = ScanState::Inactive;
                self.events.send(CoreEvent::Error {
                    kind: ErrorKind::from(&err),
                });
                Err(err.into())
            }
        }
    }
}

/// Synthesize a peripheral description from a device-shaped remote object.
///
/// Returns `None` for objects that do not expose the device shape or that
/// carry an empty address; those are ignored without error.
fn peripheral_from_object(
    handle: &ObjectHandle,
    interfaces: &InterfaceMap,
) -> Option<PeripheralInfo> {
    let props = interfaces.get(DEVICE_INTERFACE)?;
    let address = props.get(PROP_ADDRESS)?.as_str()?;
    if address.is_empty() {
        return None;
    }
    let alias = props
        .get(PROP_ALIAS)
        .and_then(Value::as_str)
        .unwrap_or_default();

    let mut info = PeripheralInfo::new(address, alias, handle.clone())
        .with_core_configurations(CoreConfigurations::LOW_ENERGY);

    if let Some(uuids) = props.get(PROP_UUIDS).and_then(Value::as_string_list) {
        let services: Vec<_> = uuids.iter().filter_map(|s| s.parse().ok()).collect();
        info = info.with_services(services);
    }

    Some(info)
}
