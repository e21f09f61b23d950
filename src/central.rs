pub mod characteristic;
mod deferred;
pub mod device;
mod notification;
mod registry;
pub mod service;

use log::*;
use static_assertions::*;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::bus::*;
use crate::error::{BestEffort, Error, ErrorKind};
use crate::retry::RetryPolicy;
use crate::sync;
use crate::util::lock;
use crate::uuid::Uuid;

use device::{advertised_ids, Device};
use registry::Registry;

#[derive(Debug)]
#[non_exhaustive]
pub enum AdapterEvent {
    /// A device object passing the discovery filter appeared under the adapter.
    DeviceDiscovered {
        device: Device,
    },

    /// The bus removed the device object. The mirror is no longer in the registry.
    DeviceRemoved {
        device: Device,
    },

    ConnectionChanged {
        device: Device,
        connected: bool,
    },

    /// Services and characteristics of the device were (re-)enumerated.
    ServicesResolved {
        device: Device,
        characteristics: usize,
    },

    PoweredChanged {
        powered: bool,
    },
}

assert_impl_all!(AdapterEvent: Send);

/// Bus call timeouts. `None` leaves the timeout to the bus.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Timeouts {
    pub connect: Option<Duration>,
    pub pair: Option<Duration>,
    pub disconnect: Option<Duration>,
    /// Characteristic reads, writes and notification toggles.
    pub io: Option<Duration>,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Some(Duration::from_secs(30)),
            pair: Some(Duration::from_secs(30)),
            disconnect: Some(Duration::from_secs(10)),
            io: Some(Duration::from_secs(10)),
        }
    }
}

#[derive(Clone, Debug)]
pub(in crate) struct Config {
    pub(in crate) connect_poll: RetryPolicy,
    pub(in crate) disconnect_poll: RetryPolicy,
    pub(in crate) services_poll: RetryPolicy,
    pub(in crate) power_on_poll: RetryPolicy,
    pub(in crate) services_grace: Duration,
    pub(in crate) timeouts: Timeouts,
}

impl Default for Config {
    fn default() -> Self {
        let interval = Duration::from_millis(100);
        Self {
            connect_poll: RetryPolicy::new(50, interval),
            disconnect_poll: RetryPolicy::new(30, interval),
            services_poll: RetryPolicy::new(100, interval),
            power_on_poll: RetryPolicy::new(5, interval),
            services_grace: Duration::from_secs(2),
            timeouts: Timeouts::default(),
        }
    }
}

/// State shared by the adapter and every mirror created through it.
pub(in crate) struct Context {
    pub(in crate) session: Session,
    pub(in crate) config: Config,
    pub(in crate) events: sync::Sender<AdapterEvent>,
}

pub struct AdapterBuilder {
    service: String,
    config: Config,
}

impl AdapterBuilder {
    pub fn new() -> Self {
        Self {
            service: BLUEZ_SERVICE.to_owned(),
            config: Config::default(),
        }
    }

    /// Bus name of the Bluetooth daemon. Defaults to `org.bluez`.
    pub fn service(&mut self, v: impl Into<String>) -> &mut Self {
        self.service = v.into();
        self
    }

    /// How long to wait for a device to report itself connected after the connect call.
    pub fn connect_poll(&mut self, v: RetryPolicy) -> &mut Self {
        self.config.connect_poll = v;
        self
    }

    pub fn disconnect_poll(&mut self, v: RetryPolicy) -> &mut Self {
        self.config.disconnect_poll = v;
        self
    }

    /// How long [`Device::refresh_services`](device/struct.Device.html#method.refresh_services)
    /// waits for the services to be resolved before enumerating anyway.
    pub fn services_poll(&mut self, v: RetryPolicy) -> &mut Self {
        self.config.services_poll = v;
        self
    }

    pub fn power_on_poll(&mut self, v: RetryPolicy) -> &mut Self {
        self.config.power_on_poll = v;
        self
    }

    /// Delay between a connection and the automatic service enumeration, unless the device
    /// reports its services resolved first.
    pub fn services_grace(&mut self, v: Duration) -> &mut Self {
        self.config.services_grace = v;
        self
    }

    pub fn timeouts(&mut self, v: Timeouts) -> &mut Self {
        self.config.timeouts = v;
        self
    }

    /// Binds to the first adapter on `bus` and makes sure it's powered.
    pub fn initialize(&self, bus: Arc<dyn ObjectBus>)
        -> Result<(Adapter, sync::Receiver<AdapterEvent>), Error>
    {
        Adapter::build(self, bus)
    }
}

impl Default for AdapterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

assert_impl_all!(AdapterBuilder: Send, Sync);

/// Service UUIDs a device must advertise at least one of to be admitted into the registry.
///
/// The empty filter admits every device.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DiscoveryFilter {
    services: BTreeSet<Uuid>,
}

impl DiscoveryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn service(mut self, id: Uuid) -> Self {
        self.services.insert(id);
        self
    }

    pub fn services(mut self, ids: &[Uuid]) -> Self {
        self.services.extend(ids.iter().copied());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn service_ids(&self) -> impl Iterator<Item=Uuid> + '_ {
        self.services.iter().copied()
    }

    pub fn admits(&self, advertised: &BTreeSet<Uuid>) -> bool {
        self.services.is_empty() || !self.services.is_disjoint(advertised)
    }
}

assert_impl_all!(DiscoveryFilter: Send, Sync);

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum DiscoveryState {
    Idle,
    Scanning,
}

struct Shared {
    ctx: Arc<Context>,
    path: ObjectPath,
    scan: Mutex<DiscoveryState>,
    filter: Mutex<DiscoveryFilter>,
    registry: Mutex<Registry>,
    tokens: Mutex<Vec<SubscriptionToken>>,
}

impl Shared {
    fn subscribe(this: &Arc<Self>) -> Result<(), Error> {
        let routes: [(&str, &str, fn(&Shared, &Signal)); 3] = [
            (OBJECT_MANAGER_INTERFACE, INTERFACES_ADDED, Shared::on_interfaces_added),
            (OBJECT_MANAGER_INTERFACE, INTERFACES_REMOVED, Shared::on_interfaces_removed),
            (PROPERTIES_INTERFACE, PROPERTIES_CHANGED, Shared::on_properties_changed),
        ];
        for &(interface, member, route) in &routes {
            let weak = Arc::downgrade(this);
            let token = this.ctx.session.subscribe(interface, member, None, None,
                Box::new(move |signal: &Signal| {
                    if let Some(shared) = weak.upgrade() {
                        route(&shared, signal);
                    }
                }))
                .map_err(|e| Error::from_bus(ErrorKind::RemoteCallFailed,
                    format!("couldn't subscribe to {}", member), &e))?;
            lock(&this.tokens).push(token);
        }
        Ok(())
    }

    fn on_interfaces_added(&self, signal: &Signal) {
        if let SignalPayload::InterfacesAdded { path, interfaces } = &signal.payload {
            if let Some(props) = interfaces.get(DEVICE_INTERFACE) {
                self.admit(path, props);
            }
        }
    }

    fn on_interfaces_removed(&self, signal: &Signal) {
        let (path, interfaces) = match &signal.payload {
            SignalPayload::InterfacesRemoved { path, interfaces } => (path, interfaces),
            _ => return,
        };
        if interfaces.iter().any(|i| i == DEVICE_INTERFACE) {
            let removed = lock(&self.registry).remove_by_path(path);
            if let Some(device) = removed {
                info!("device removed: {} ({})", device.name(), device.address());
                device.mark_gone();
                self.ctx.events.send(AdapterEvent::DeviceRemoved { device });
            }
        } else if interfaces.iter().any(|i| i == GATT_CHARACTERISTIC_INTERFACE) {
            let owner = lock(&self.registry).owner_of(path).cloned();
            if let Some(device) = owner {
                device.remove_characteristic(path);
            }
        }
    }

    fn on_properties_changed(&self, signal: &Signal) {
        let (interface, changed) = match &signal.payload {
            SignalPayload::PropertiesChanged { interface, changed, .. } => (interface, changed),
            _ => return,
        };
        match interface.as_str() {
            DEVICE_INTERFACE => {
                let device = lock(&self.registry).by_path(&signal.path).cloned();
                match device {
                    Some(device) => device.apply_changes(changed),
                    None => trace!("change of unknown device {}", signal.path),
                }
            }
            ADAPTER_INTERFACE if signal.path == self.path => {
                if let Some(powered) = changed.get("Powered").and_then(|v| v.as_bool()) {
                    info!("adapter {} powered {}", self.path, if powered { "on" } else { "off" });
                    self.ctx.events.send(AdapterEvent::PoweredChanged { powered });
                }
            }
            _ => {}
        }
    }

    /// Mirrors a device object unless it's already known or rejected by the filter.
    fn admit(&self, path: &ObjectPath, props: &PropertyMap) -> Option<Device> {
        if !path.is_descendant_of(&self.path) {
            trace!("ignoring device {} of another adapter", path);
            return None;
        }
        let advertised = advertised_ids(props).unwrap_or_default();
        if !lock(&self.filter).admits(&advertised) {
            debug!("device {} filtered out", path);
            return None;
        }
        let mut replaced = None;
        let (device, known) = {
            let mut registry = lock(&self.registry);
            if registry.contains_path(path) {
                return None;
            }
            let device = match Device::from_properties(&self.ctx, path, props) {
                Some(v) => v,
                None => {
                    debug!("ignoring device {} without address", path);
                    return None;
                }
            };
            registry.insert(device.clone(), &mut replaced);
            (device, registry.len())
        };
        if let Some(old) = replaced {
            debug!("{} moved from {} to {}", old.address(), old.path(), path);
        }
        info!("device discovered: {} ({}), {} known", device.name(), device.address(), known);
        self.ctx.events.send(AdapterEvent::DeviceDiscovered { device: device.clone() });
        Some(device)
    }

    fn stop_discovery_locked(&self, scan: &mut DiscoveryState) -> BestEffort {
        if *scan == DiscoveryState::Idle {
            return BestEffort::NotNeeded;
        }
        let r = self.ctx.session.call(&self.path, ADAPTER_INTERFACE, "StopDiscovery", Vec::new(), None)
            .map(|_| ())
            .map_err(|e| Error::from_bus(ErrorKind::RemoteCallFailed,
                format!("couldn't stop discovery on {}", self.path), &e));
        match &r {
            Ok(()) => info!("discovery stopped on {}", self.path),
            Err(e) => warn!("{}", e),
        }
        *scan = DiscoveryState::Idle;
        BestEffort::from_call(r)
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let tokens = std::mem::take(self.tokens.get_mut().unwrap_or_else(|e| e.into_inner()));
        for token in tokens {
            self.ctx.session.unsubscribe(token);
        }
        {
            let mut scan = lock(&self.scan);
            let _ = self.stop_discovery_locked(&mut scan);
        }
        // Queued events may keep device handles alive, so disconnect here rather than on drop.
        let devices = lock(&self.registry).clear();
        debug!("adapter {} closed, releasing {} devices", self.path, devices.len());
        for device in &devices {
            let _ = device.teardown();
        }
    }
}

/// Mirror of the local adapter and the devices seen through it.
///
/// Cloning yields another handle to the same adapter. Signal subscriptions, discovery and the
/// device mirrors are released with the last handle.
#[derive(Clone)]
pub struct Adapter(Arc<Shared>);

assert_impl_all!(Adapter: Send, Sync);

impl Adapter {
    /// Binds to the first adapter on `bus` with the default configuration.
    pub fn initialize(bus: Arc<dyn ObjectBus>) -> Result<(Self, sync::Receiver<AdapterEvent>), Error> {
        AdapterBuilder::new().initialize(bus)
    }

    fn build(b: &AdapterBuilder, bus: Arc<dyn ObjectBus>)
        -> Result<(Self, sync::Receiver<AdapterEvent>), Error>
    {
        let session = Session::new(bus, &b.service);
        let objects = session.managed_objects()
            .map_err(|e| Error::from_bus(ErrorKind::RemoteCallFailed,
                format!("couldn't list objects of {}", b.service), &e))?;
        let path = objects.iter()
            .find(|(_, interfaces)| interfaces.contains_key(ADAPTER_INTERFACE))
            .map(|(path, _)| path.clone())
            .ok_or_else(|| Error::new(ErrorKind::NoAdapterFound,
                format!("no object of {} implements {}", b.service, ADAPTER_INTERFACE)))?;
        info!("using adapter {}", path);

        let (events, receiver) = sync::channel();
        let shared = Arc::new(Shared {
            ctx: Arc::new(Context {
                session,
                config: b.config.clone(),
                events,
            }),
            path,
            scan: Mutex::new(DiscoveryState::Idle),
            filter: Mutex::new(DiscoveryFilter::default()),
            registry: Mutex::new(Registry::default()),
            tokens: Mutex::new(Vec::new()),
        });
        Shared::subscribe(&shared)?;
        let adapter = Adapter(shared);
        if !adapter.is_powered().unwrap_or(false) {
            adapter.power_on()?;
        }
        Ok((adapter, receiver))
    }

    pub fn path(&self) -> &ObjectPath {
        &self.0.path
    }

    pub fn is_powered(&self) -> Result<bool, Error> {
        self.0.ctx.session.get_bool(&self.0.path, ADAPTER_INTERFACE, "Powered")
            .map_err(|e| Error::from_bus(ErrorKind::RemoteCallFailed,
                format!("couldn't read Powered of {}", self.0.path), &e))
    }

    /// Powers the adapter on and waits until it reports itself powered.
    pub fn power_on(&self) -> Result<(), Error> {
        info!("powering on {}", self.0.path);
        self.0.ctx.session.set(&self.0.path, ADAPTER_INTERFACE, "Powered", Value::Bool(true))
            .map_err(|e| Error::from_bus(ErrorKind::AdapterPowerOnFailed,
                format!("couldn't power on {}", self.0.path), &e))?;
        if self.0.ctx.config.power_on_poll.poll(|| self.is_powered().unwrap_or(false)) {
            Ok(())
        } else {
            Err(Error::new(ErrorKind::AdapterPowerOnFailed,
                format!("{} didn't report powered after {} checks", self.0.path,
                    self.0.ctx.config.power_on_poll.attempts)))
        }
    }

    /// Stops discovery, then powers the adapter off.
    pub fn power_off(&self) -> BestEffort {
        if let BestEffort::Failed(e) = self.stop_discovery() {
            debug!("powering off anyway: {}", e);
        }
        info!("powering off {}", self.0.path);
        BestEffort::from_call(self.0.ctx.session.set(&self.0.path, ADAPTER_INTERFACE, "Powered", Value::Bool(false))
            .map_err(|e| Error::from_bus(ErrorKind::RemoteCallFailed,
                format!("couldn't power off {}", self.0.path), &e)))
    }

    /// Starts discovery with `filter` deciding which devices are admitted. A running discovery
    /// is restarted.
    pub fn start_discovery(&self, filter: DiscoveryFilter) -> Result<(), Error> {
        let mut scan = lock(&self.0.scan);
        if *scan == DiscoveryState::Scanning {
            debug!("restarting discovery on {}", self.0.path);
            if let BestEffort::Failed(e) = self.0.stop_discovery_locked(&mut scan) {
                debug!("starting anyway: {}", e);
            }
        }
        *lock(&self.0.filter) = filter;
        self.0.ctx.session.call(&self.0.path, ADAPTER_INTERFACE, "StartDiscovery", Vec::new(), None)
            .map_err(|e| Error::from_bus(ErrorKind::DiscoveryStartFailed,
                format!("couldn't start discovery on {}", self.0.path), &e))?;
        *scan = DiscoveryState::Scanning;
        info!("discovery started on {}", self.0.path);
        Ok(())
    }

    /// Stops discovery. The state is `Idle` afterwards whatever the outcome of the bus call.
    pub fn stop_discovery(&self) -> BestEffort {
        let mut scan = lock(&self.0.scan);
        self.0.stop_discovery_locked(&mut scan)
    }

    pub fn discovery_state(&self) -> DiscoveryState {
        *lock(&self.0.scan)
    }

    pub fn is_discovering(&self) -> bool {
        self.discovery_state() == DiscoveryState::Scanning
    }

    pub fn discovery_filter(&self) -> DiscoveryFilter {
        lock(&self.0.filter).clone()
    }

    /// Replaces the filter for devices seen from now on. Devices already admitted stay.
    pub fn set_discovery_filter(&self, filter: DiscoveryFilter) {
        *lock(&self.0.filter) = filter;
    }

    /// Admits device objects already present under the adapter, then returns all known devices.
    pub fn known_devices(&self) -> Result<Vec<Device>, Error> {
        let objects = self.0.ctx.session.managed_objects()
            .map_err(|e| Error::from_bus(ErrorKind::RemoteCallFailed,
                format!("couldn't list objects of {}", self.0.path), &e))?;
        for (path, interfaces) in &objects {
            if let Some(props) = interfaces.get(DEVICE_INTERFACE) {
                self.0.admit(path, props);
            }
        }
        Ok(self.devices())
    }

    pub fn devices(&self) -> Vec<Device> {
        lock(&self.0.registry).all()
    }

    /// Looks up a device by hardware address, in any case.
    pub fn device(&self, address: &str) -> Result<Device, Error> {
        let address = normalize_address(address);
        lock(&self.0.registry).by_address(&address)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::DeviceNotFound,
                format!("no device with address {}", address)))
    }

    pub fn device_by_path(&self, path: &ObjectPath) -> Option<Device> {
        lock(&self.0.registry).by_path(path).cloned()
    }

    /// Disconnects the device if needed and forgets it.
    pub fn remove_device(&self, address: &str) -> Result<BestEffort, Error> {
        let device = self.device(address)?;
        let r = if device.is_connected() {
            BestEffort::from_call(device.disconnect())
        } else {
            BestEffort::NotNeeded
        };
        let removed = lock(&self.0.registry).remove_by_address(device.address());
        if removed.is_some() {
            info!("device {} forgotten", device.address());
        }
        Ok(r)
    }
}

fn normalize_address(address: &str) -> String {
    address.trim().to_ascii_uppercase()
}

#[cfg(test)]
pub(in crate) mod testing {
    use super::*;
    use crate::bus::memory::MemoryBus;

    /// Test logging, enabled with `RUST_LOG`.
    pub fn init_log() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    pub fn config() -> Config {
        init_log();
        let interval = Duration::from_millis(5);
        Config {
            connect_poll: RetryPolicy::new(20, interval),
            disconnect_poll: RetryPolicy::new(20, interval),
            services_poll: RetryPolicy::new(3, interval),
            power_on_poll: RetryPolicy::new(3, interval),
            services_grace: Duration::from_millis(100),
            timeouts: Timeouts::default(),
        }
    }

    pub fn builder() -> AdapterBuilder {
        AdapterBuilder {
            service: BLUEZ_SERVICE.to_owned(),
            config: config(),
        }
    }

    pub fn context(bus: &Arc<MemoryBus>) -> (Arc<Context>, sync::Receiver<AdapterEvent>) {
        context_with(bus, config())
    }

    pub fn context_with(bus: &Arc<MemoryBus>, config: Config)
        -> (Arc<Context>, sync::Receiver<AdapterEvent>)
    {
        let (events, receiver) = sync::channel();
        (Arc::new(Context {
            session: Session::new(bus.clone(), BLUEZ_SERVICE),
            config,
            events,
        }), receiver)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bus::memory::*;

    const HCI0: &str = "/org/bluez/hci0";

    fn bus() -> Arc<MemoryBus> {
        let bus = MemoryBus::bluez().unwrap();
        bus.add_object(&HCI0.into(), adapter_interfaces("00:11:22:33:44:55", true));
        bus
    }

    fn add_device(bus: &MemoryBus, address: &str, service_ids: &[&str]) -> ObjectPath {
        let adapter = ObjectPath::from(HCI0);
        let path = device_path(&adapter, address);
        bus.add_object(&path, device_interfaces(&adapter, address, None, service_ids));
        path
    }

    fn init(bus: &Arc<MemoryBus>) -> (Adapter, sync::Receiver<AdapterEvent>) {
        testing::builder().initialize(bus.clone()).unwrap()
    }

    #[test]
    fn no_adapter_found() {
        let bus = MemoryBus::bluez().unwrap();
        let err = testing::builder().initialize(bus.clone()).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NoAdapterFound);
        assert_eq!(bus.subscription_count(), 0);
    }

    #[test]
    fn listing_failure() {
        let bus = MemoryBus::new("org.example.other").unwrap();
        let err = testing::builder().initialize(bus).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::RemoteCallFailed);
    }

    #[test]
    fn powers_on_adapter() {
        let bus = MemoryBus::bluez().unwrap();
        bus.add_object(&HCI0.into(), adapter_interfaces("00:11:22:33:44:55", false));
        let (adapter, _events) = init(&bus);
        assert!(adapter.is_powered().unwrap());
        assert_eq!(bus.call_count("Set"), 1);
        assert_eq!(adapter.path().as_str(), HCI0);
    }

    #[test]
    fn power_on_failure() {
        let bus = MemoryBus::bluez().unwrap();
        bus.add_object(&HCI0.into(), adapter_interfaces("00:11:22:33:44:55", false));
        bus.on_set(ADAPTER_INTERFACE, "Powered", |_, _, _| Ok(()));
        let err = testing::builder().initialize(bus.clone()).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::AdapterPowerOnFailed);
        assert_eq!(bus.subscription_count(), 0);
    }

    #[test]
    fn stop_discovery_when_idle() {
        let bus = bus();
        let (adapter, _events) = init(&bus);
        assert!(matches!(adapter.stop_discovery(), BestEffort::NotNeeded));
        assert_eq!(bus.call_count("StopDiscovery"), 0);
        assert_eq!(adapter.discovery_state(), DiscoveryState::Idle);
    }

    #[test]
    fn discovery_restart() {
        let bus = bus();
        let (adapter, _events) = init(&bus);
        adapter.start_discovery(DiscoveryFilter::new()).unwrap();
        adapter.start_discovery(DiscoveryFilter::new().service(Uuid::from_u16(0x180d))).unwrap();
        assert!(adapter.is_discovering());
        assert_eq!(bus.call_count("StartDiscovery"), 2);
        assert_eq!(bus.call_count("StopDiscovery"), 1);
        assert_eq!(adapter.discovery_filter().service_ids().collect::<Vec<_>>(), vec![Uuid::from_u16(0x180d)]);

        assert!(matches!(adapter.stop_discovery(), BestEffort::Completed));
        assert!(!adapter.is_discovering());
    }

    #[test]
    fn discovery_failures() {
        let bus = bus();
        let (adapter, _events) = init(&bus);
        bus.on_method(ADAPTER_INTERFACE, "StartDiscovery",
            |_, _| Err(BusError::new("org.bluez.Error.NotReady", "Resource Not Ready")));
        let err = adapter.start_discovery(DiscoveryFilter::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DiscoveryStartFailed);
        assert!(!adapter.is_discovering());

        bus.on_method(ADAPTER_INTERFACE, "StartDiscovery", |_, _| Ok(Vec::new()));
        adapter.start_discovery(DiscoveryFilter::new()).unwrap();
        let r = adapter.stop_discovery();
        assert!(r.is_failed());
        assert!(!adapter.is_discovering());
    }

    #[test]
    fn filter_rejects_other_services() {
        let bus = bus();
        let (adapter, events) = init(&bus);
        adapter.start_discovery(DiscoveryFilter::new().service("0000180d-0000-1000-8000-00805f9b34fb".parse().unwrap())).unwrap();

        add_device(&bus, "AA:BB:CC:DD:EE:FF", &["0000180f-0000-1000-8000-00805f9b34fb"]);
        add_device(&bus, "11:22:33:44:55:66", &["0000180D-0000-1000-8000-00805F9B34FB", "180a"]);
        bus.flush();

        assert_eq!(adapter.device("AA:BB:CC:DD:EE:FF").unwrap_err().kind(), ErrorKind::DeviceNotFound);
        assert_eq!(adapter.device("11:22:33:44:55:66").unwrap().address(), "11:22:33:44:55:66");
        assert_eq!(adapter.devices().len(), 1);
        let discovered: Vec<_> = events.try_iter()
            .filter_map(|e| match e {
                AdapterEvent::DeviceDiscovered { device } => Some(device.address().to_owned()),
                _ => None,
            })
            .collect();
        assert_eq!(discovered, vec!["11:22:33:44:55:66".to_owned()]);
    }

    #[test]
    fn removed_device_is_forgotten() {
        let bus = bus();
        let (adapter, events) = init(&bus);
        let path = add_device(&bus, "AA:BB:CC:DD:EE:FF", &[]);
        bus.flush();
        let device = adapter.device("aa:bb:cc:dd:ee:ff").unwrap();
        device.connect().unwrap();
        bus.flush();
        let _ = events.try_iter().count();

        assert!(bus.remove_object(&path));
        bus.flush();
        assert_eq!(adapter.device("AA:BB:CC:DD:EE:FF").unwrap_err().kind(), ErrorKind::DeviceNotFound);
        assert!(adapter.device_by_path(&path).is_none());
        let tail: Vec<_> = events.try_iter().collect();
        assert_eq!(tail.len(), 2);
        assert!(matches!(&tail[0], AdapterEvent::ConnectionChanged { connected: false, .. }));
        assert!(matches!(&tail[1], AdapterEvent::DeviceRemoved { .. }));
        assert!(!device.is_connected());

        drop(device);
        assert_eq!(bus.call_count("Disconnect"), 0);
    }

    #[test]
    fn property_changes_reach_only_their_device() {
        let bus = bus();
        let (adapter, _events) = init(&bus);
        let a = add_device(&bus, "AA:BB:CC:DD:EE:FF", &[]);
        add_device(&bus, "11:22:33:44:55:66", &[]);
        bus.flush();

        bus.update_property(&a, DEVICE_INTERFACE, "Connected", true).unwrap();
        bus.flush();
        assert!(adapter.device("AA:BB:CC:DD:EE:FF").unwrap().is_connected());
        assert!(!adapter.device("11:22:33:44:55:66").unwrap().is_connected());
    }

    #[test]
    fn services_resolved_signal_enumerates() {
        let bus = bus();
        let (adapter, events) = init(&bus);
        let dev = add_device(&bus, "AA:BB:CC:DD:EE:FF", &["180d"]);
        let svc = dev.child("service000c");
        bus.add_object(&svc, service_interfaces(&dev, "180d"));
        bus.add_object(&svc.child("char000d"), characteristic_interfaces(&svc, "2a37", &["notify"]));
        bus.add_object(&svc.child("char0010"), characteristic_interfaces(&svc, "2a38", &["read"]));
        bus.flush();

        let device = adapter.device("AA:BB:CC:DD:EE:FF").unwrap();
        device.connect().unwrap();
        assert!(device.characteristics().is_empty());
        bus.update_property(&dev, DEVICE_INTERFACE, "ServicesResolved", true).unwrap();
        bus.flush();
        assert_eq!(device.characteristics().len(), 2);
        assert!(events.try_iter().any(|e| matches!(e, AdapterEvent::ServicesResolved { characteristics: 2, .. })));

        assert!(bus.remove_object(&svc.child("char0010")));
        bus.flush();
        assert_eq!(device.characteristics().len(), 1);
    }

    #[test]
    fn known_devices_admits_existing_objects() {
        let bus = bus();
        add_device(&bus, "AA:BB:CC:DD:EE:FF", &[]);
        let other = ObjectPath::from("/org/bluez/hci1");
        bus.add_object(&other.child("dev_11_22_33_44_55_66"),
            device_interfaces(&other, "11:22:33:44:55:66", None, &[]));
        bus.flush();
        let (adapter, _events) = init(&bus);
        assert!(adapter.devices().is_empty());

        let known = adapter.known_devices().unwrap();
        assert_eq!(known.len(), 1);
        assert_eq!(known[0].address(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(adapter.known_devices().unwrap().len(), 1);
    }

    #[test]
    fn remove_device_disconnects() {
        let bus = bus();
        let (adapter, _events) = init(&bus);
        add_device(&bus, "AA:BB:CC:DD:EE:FF", &[]);
        bus.flush();
        adapter.device("AA:BB:CC:DD:EE:FF").unwrap().connect().unwrap();

        assert!(matches!(adapter.remove_device("AA:BB:CC:DD:EE:FF").unwrap(), BestEffort::Completed));
        assert_eq!(bus.call_count("Disconnect"), 1);
        assert_eq!(adapter.device("AA:BB:CC:DD:EE:FF").unwrap_err().kind(), ErrorKind::DeviceNotFound);
        assert_eq!(adapter.remove_device("AA:BB:CC:DD:EE:FF").unwrap_err().kind(), ErrorKind::DeviceNotFound);
    }

    #[test]
    fn powered_changes_are_reported() {
        let bus = bus();
        let (adapter, events) = init(&bus);
        assert!(adapter.power_off().attempted());
        bus.flush();
        assert!(events.try_iter().any(|e| matches!(e, AdapterEvent::PoweredChanged { powered: false })));
        assert!(!adapter.is_powered().unwrap());
    }

    #[test]
    fn drop_releases_bus_resources() {
        let bus = bus();
        let (adapter, _events) = init(&bus);
        assert_eq!(bus.subscription_count(), 3);
        adapter.start_discovery(DiscoveryFilter::new()).unwrap();
        bus.flush();
        let clone = adapter.clone();
        drop(adapter);
        assert_eq!(bus.subscription_count(), 3);

        drop(clone);
        assert_eq!(bus.subscription_count(), 0);
        assert_eq!(bus.call_count("StopDiscovery"), 1);
    }

    #[test]
    fn closing_disconnects_despite_queued_events() {
        let bus = bus();
        let (adapter, events) = init(&bus);
        add_device(&bus, "AA:BB:CC:DD:EE:FF", &[]);
        add_device(&bus, "11:22:33:44:55:66", &[]);
        bus.flush();
        let device = adapter.device("AA:BB:CC:DD:EE:FF").unwrap();
        device.connect().unwrap();
        bus.flush();

        drop(adapter);
        assert_eq!(bus.call_count("Disconnect"), 1);
        assert!(!device.is_connected());

        drop(device);
        drop(events);
        assert_eq!(bus.call_count("Disconnect"), 1);
    }
}
