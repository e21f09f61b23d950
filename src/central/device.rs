use log::*;
use static_assertions::assert_impl_all;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::mem;
use std::sync::{Arc, Mutex, Weak};

use super::{AdapterEvent, Context};
use super::characteristic::Characteristic;
use super::deferred::DeferredJob;
use super::service::Service;
use crate::bus::*;
use crate::error::{BestEffort, Error, ErrorKind};
use crate::util::lock;
use crate::uuid::Uuid;

const UNKNOWN_NAME: &str = "Unknown Device";

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Connected, but the device hasn't reported its GATT table as fetched yet.
    ConnectedUnresolved,
    ConnectedResolved,
    Disconnecting,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Transition {
    Connecting,
    Disconnecting,
}

#[derive(Default)]
struct State {
    name: Option<String>,
    alias: Option<String>,
    connected: bool,
    services_resolved: bool,
    paired: bool,
    rssi: Option<i16>,
    service_ids: BTreeSet<Uuid>,
    transition: Option<Transition>,
    /// Set once the mirror stopped tracking the object, because the bus removed it or the
    /// adapter was closed. No teardown calls are made afterwards.
    gone: bool,
    /// Completed enumerations.
    generation: u64,
    services: BTreeMap<ObjectPath, Service>,
    characteristics: BTreeMap<ObjectPath, Characteristic>,
}

impl State {
    /// Applies the descriptive properties. Connection flags are handled separately since
    /// their edges drive the state machine.
    fn apply_descriptive(&mut self, props: &PropertyMap) {
        if let Some(v) = props.get("Name").and_then(|v| v.as_str()) {
            self.name = Some(v.to_owned());
        }
        if let Some(v) = props.get("Alias").and_then(|v| v.as_str()) {
            self.alias = Some(v.to_owned());
        }
        if let Some(v) = props.get("Paired").and_then(|v| v.as_bool()) {
            self.paired = v;
        }
        if let Some(v) = props.get("RSSI").and_then(|v| v.as_i16()) {
            self.rssi = Some(v);
        }
        if let Some(ids) = advertised_ids(props) {
            self.service_ids = ids;
        }
    }
}

/// Parses the `UUIDs` property, skipping malformed entries.
pub(in crate) fn advertised_ids(props: &PropertyMap) -> Option<BTreeSet<Uuid>> {
    let ids = props.get("UUIDs")?.as_str_array()?;
    Some(ids.iter()
        .filter_map(|s| s.parse::<Uuid>().map_err(|_| debug!("ignoring advertised UUID '{}'", s)).ok())
        .collect())
}

/// Mirror of one remote device.
///
/// Cloning yields another handle to the same mirror. When the last handle is dropped a
/// still-connected device is disconnected best-effort.
#[derive(Clone)]
pub struct Device(Arc<Inner>);

assert_impl_all!(Device: Send, Sync);

struct Inner {
    ctx: Arc<Context>,
    path: ObjectPath,
    address: String,
    state: Mutex<State>,
    resolve_job: Mutex<Option<DeferredJob>>,
}

impl Device {
    /// `None` if the object has no address.
    pub(in crate) fn from_properties(ctx: &Arc<Context>, path: &ObjectPath, props: &PropertyMap)
        -> Option<Self>
    {
        let address = props.get("Address")?.as_str()?.trim().to_ascii_uppercase();
        if address.is_empty() {
            return None;
        }
        let mut state = State::default();
        state.apply_descriptive(props);
        state.connected = props.get("Connected").and_then(|v| v.as_bool()).unwrap_or(false);
        state.services_resolved = state.connected
            && props.get("ServicesResolved").and_then(|v| v.as_bool()).unwrap_or(false);
        Some(Self(Arc::new(Inner {
            ctx: ctx.clone(),
            path: path.clone(),
            address,
            state: Mutex::new(state),
            resolve_job: Mutex::new(None),
        })))
    }

    pub fn path(&self) -> &ObjectPath {
        &self.0.path
    }

    /// Hardware address in upper case, e.g. `AA:BB:CC:DD:EE:FF`.
    pub fn address(&self) -> &str {
        &self.0.address
    }

    /// `Name`, else `Alias`, else `Unknown Device`.
    pub fn name(&self) -> String {
        let s = lock(&self.0.state);
        s.name.as_ref()
            .or_else(|| s.alias.as_ref())
            .cloned()
            .unwrap_or_else(|| UNKNOWN_NAME.to_owned())
    }

    pub fn alias(&self) -> Option<String> {
        lock(&self.0.state).alias.clone()
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.0.state).connected
    }

    pub fn services_resolved(&self) -> bool {
        lock(&self.0.state).services_resolved
    }

    pub fn is_paired(&self) -> bool {
        lock(&self.0.state).paired
    }

    /// Signal strength of the last advertisement seen during discovery.
    pub fn rssi(&self) -> Option<i16> {
        lock(&self.0.state).rssi
    }

    /// Service UUIDs the device advertises.
    pub fn service_ids(&self) -> BTreeSet<Uuid> {
        lock(&self.0.state).service_ids.clone()
    }

    pub fn state(&self) -> ConnectionState {
        let s = lock(&self.0.state);
        match (s.transition, s.connected) {
            (Some(Transition::Connecting), false) => ConnectionState::Connecting,
            (Some(Transition::Disconnecting), true) => ConnectionState::Disconnecting,
            (_, false) => ConnectionState::Disconnected,
            (_, true) if s.services_resolved => ConnectionState::ConnectedResolved,
            (_, true) => ConnectionState::ConnectedUnresolved,
        }
    }

    pub fn services(&self) -> Vec<Service> {
        lock(&self.0.state).services.values().cloned().collect()
    }

    /// Characteristics found by the last enumeration, in object path order.
    ///
    /// Empty from every connection edge until the next enumeration.
    pub fn characteristics(&self) -> Vec<Characteristic> {
        lock(&self.0.state).characteristics.values().cloned().collect()
    }

    /// Looks up a characteristic by service and characteristic UUID.
    ///
    /// A characteristic whose service wasn't seen during enumeration matches on its own UUID.
    pub fn characteristic(&self, service_id: Uuid, id: Uuid) -> Result<Characteristic, Error> {
        lock(&self.0.state).characteristics.values()
            .find(|c| c.matches(service_id, id))
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::CharacteristicNotFound,
                format!("{} has no characteristic {} in service {}", self.0.address, id, service_id)))
    }

    pub fn characteristic_by_path(&self, path: &ObjectPath) -> Option<Characteristic> {
        lock(&self.0.state).characteristics.get(path).cloned()
    }

    pub fn read(&self, service_id: Uuid, id: Uuid) -> Result<Vec<u8>, Error> {
        self.characteristic(service_id, id)?.read()
    }

    pub fn write(&self, service_id: Uuid, id: Uuid, value: &[u8]) -> Result<(), Error> {
        self.characteristic(service_id, id)?.write(value)
    }

    /// Enables notifications of a characteristic. See
    /// [`Characteristic::start_notifications`](../characteristic/struct.Characteristic.html#method.start_notifications).
    pub fn subscribe<F>(&self, service_id: Uuid, id: Uuid, callback: F) -> Result<(), Error>
        where F: Fn(&ObjectPath, &[u8]) + Send + Sync + 'static
    {
        self.characteristic(service_id, id)?.start_notifications(callback)
    }

    pub fn unsubscribe(&self, service_id: Uuid, id: Uuid) -> Result<BestEffort, Error> {
        Ok(self.characteristic(service_id, id)?.stop_notifications())
    }

    /// Connects and waits until the device reports itself connected.
    ///
    /// Returns immediately if already connected.
    pub fn connect(&self) -> Result<(), Error> {
        if self.is_connected() {
            debug!("{} is already connected", self.0.address);
            return Ok(());
        }
        info!("connecting to {} ({})", self.0.address, self.0.path);
        self.set_transition(Some(Transition::Connecting));
        let r = self.connect0();
        self.set_transition(None);
        r
    }

    fn connect0(&self) -> Result<(), Error> {
        let ctx = &self.0.ctx;
        ctx.session.call(&self.0.path, DEVICE_INTERFACE, "Connect", Vec::new(), ctx.config.timeouts.connect)
            .map_err(|e| Error::from_bus(ErrorKind::ConnectCallFailed,
                format!("couldn't connect to {}", self.0.address), &e))?;
        if ctx.config.connect_poll.poll(|| self.reload_connected() == Some(true)) {
            info!("connected to {}", self.0.address);
            Ok(())
        } else {
            Err(Error::new(ErrorKind::ConnectTimeout,
                format!("{} didn't report connected after {} checks", self.0.address,
                    ctx.config.connect_poll.attempts)))
        }
    }

    /// Disconnects and waits until the device reports itself disconnected.
    ///
    /// Returns immediately if not connected.
    pub fn disconnect(&self) -> Result<(), Error> {
        if !self.is_connected() {
            debug!("{} is already disconnected", self.0.address);
            return Ok(());
        }
        info!("disconnecting from {}", self.0.address);
        self.set_transition(Some(Transition::Disconnecting));
        let r = self.disconnect0();
        self.set_transition(None);
        r
    }

    fn disconnect0(&self) -> Result<(), Error> {
        let ctx = &self.0.ctx;
        ctx.session.call(&self.0.path, DEVICE_INTERFACE, "Disconnect", Vec::new(), ctx.config.timeouts.disconnect)
            .map_err(|e| Error::from_bus(ErrorKind::DisconnectCallFailed,
                format!("couldn't disconnect from {}", self.0.address), &e))?;
        if ctx.config.disconnect_poll.poll(|| self.reload_connected() == Some(false)) {
            Ok(())
        } else {
            Err(Error::new(ErrorKind::DisconnectTimeout,
                format!("{} still reports connected after {} checks", self.0.address,
                    ctx.config.disconnect_poll.attempts)))
        }
    }

    pub fn pair(&self) -> Result<(), Error> {
        let ctx = &self.0.ctx;
        info!("pairing with {}", self.0.address);
        ctx.session.call(&self.0.path, DEVICE_INTERFACE, "Pair", Vec::new(), ctx.config.timeouts.pair)
            .map_err(|e| Error::from_bus(ErrorKind::PairCallFailed,
                format!("couldn't pair with {}", self.0.address), &e))?;
        match ctx.session.get_bool(&self.0.path, DEVICE_INTERFACE, "Paired") {
            Ok(v) => lock(&self.0.state).paired = v,
            Err(e) => debug!("couldn't read Paired of {}: {}", self.0.path, e),
        }
        Ok(())
    }

    /// Waits for the device to report its services resolved, then enumerates its services and
    /// characteristics. Returns the number of characteristics found.
    ///
    /// Enumeration goes ahead even if the device never reports its services resolved.
    pub fn refresh_services(&self) -> Result<usize, Error> {
        self.refresh(None)
    }

    /// With `since` set, enumeration is skipped if another one completed after that generation.
    fn refresh(&self, since: Option<u64>) -> Result<usize, Error> {
        if !self.is_connected() {
            return Err(Error::new(ErrorKind::NotConnected,
                format!("{} must be connected to enumerate services", self.0.address)));
        }
        self.cancel_resolve();
        let resolved = self.0.ctx.config.services_poll.poll(|| self.reload_services_resolved());
        if !resolved {
            warn!("{} never reported services resolved, enumerating anyway", self.0.address);
        }
        match self.enumerate(since)? {
            0 => Err(Error::new(ErrorKind::NoCharacteristicsFound,
                format!("no characteristics found on {}", self.0.address))),
            n => Ok(n),
        }
    }

    fn reload_connected(&self) -> Option<bool> {
        match self.0.ctx.session.get_bool(&self.0.path, DEVICE_INTERFACE, "Connected") {
            Ok(v) => {
                self.observe_connected(v);
                Some(v)
            }
            Err(e) => {
                debug!("couldn't read Connected of {}: {}", self.0.path, e);
                None
            }
        }
    }

    fn reload_services_resolved(&self) -> bool {
        match self.0.ctx.session.get_bool(&self.0.path, DEVICE_INTERFACE, "ServicesResolved") {
            Ok(v) => {
                self.observe_services_resolved(v, false);
                v
            }
            Err(e) => {
                debug!("couldn't read ServicesResolved of {}: {}", self.0.path, e);
                false
            }
        }
    }

    /// Applies a `PropertiesChanged` batch for this device.
    pub(in crate) fn apply_changes(&self, changed: &PropertyMap) {
        lock(&self.0.state).apply_descriptive(changed);
        if let Some(v) = changed.get("Connected").and_then(|v| v.as_bool()) {
            self.observe_connected(v);
        }
        if let Some(v) = changed.get("ServicesResolved").and_then(|v| v.as_bool()) {
            self.observe_services_resolved(v, true);
        }
    }

    fn observe_connected(&self, connected: bool) {
        let stale = {
            let mut s = lock(&self.0.state);
            if s.connected == connected {
                return;
            }
            s.connected = connected;
            if !connected {
                s.services_resolved = false;
            }
            s.services.clear();
            mem::take(&mut s.characteristics)
        };
        for c in stale.values() {
            c.detach();
        }
        if connected {
            debug!("{} connected", self.0.address);
            if !self.services_resolved() {
                self.schedule_resolve();
            }
        } else {
            debug!("{} disconnected", self.0.address);
            self.cancel_resolve();
        }
        self.0.ctx.events.send(AdapterEvent::ConnectionChanged {
            device: self.clone(),
            connected,
        });
    }

    fn observe_services_resolved(&self, resolved: bool, enumerate: bool) {
        let rose = {
            let mut s = lock(&self.0.state);
            let rose = resolved && !s.services_resolved && s.connected;
            s.services_resolved = resolved && s.connected;
            rose
        };
        if rose && enumerate {
            debug!("{} resolved its services", self.0.address);
            self.cancel_resolve();
            if let Err(e) = self.enumerate(None) {
                warn!("couldn't enumerate services of {}: {}", self.0.address, e);
            }
        }
    }

    fn schedule_resolve(&self) {
        let weak = Arc::downgrade(&self.0);
        let generation = lock(&self.0.state).generation;
        let job = DeferredJob::schedule(format!("resolve-{}", self.0.address),
            self.0.ctx.config.services_grace, move || resolve_later(weak, generation));
        let old = mem::replace(&mut *lock(&self.0.resolve_job), job);
        drop(old);
    }

    fn cancel_resolve(&self) {
        let job = lock(&self.0.resolve_job).take();
        if let Some(job) = job {
            job.cancel();
        }
    }

    /// Replaces the services and characteristics with the objects currently nested under the
    /// device path.
    fn enumerate(&self, since: Option<u64>) -> Result<usize, Error> {
        let stale = {
            let mut s = lock(&self.0.state);
            if since.map(|g| g != s.generation).unwrap_or(false) {
                debug!("{} was enumerated meanwhile, keeping its characteristics", self.0.address);
                return Ok(s.characteristics.len());
            }
            s.services.clear();
            mem::take(&mut s.characteristics)
        };
        for c in stale.values() {
            c.detach();
        }
        drop(stale);

        let objects = self.0.ctx.session.managed_objects()
            .map_err(|e| Error::from_bus(ErrorKind::RemoteCallFailed,
                format!("couldn't list objects of {}", self.0.address), &e))?;
        let nested: Vec<(&ObjectPath, &Interfaces)> = objects.iter()
            .filter(|(p, _)| p.is_descendant_of(&self.0.path))
            .collect();

        let mut services = BTreeMap::new();
        for (path, props) in nested.iter().filter_map(|&(p, i)| Some((p, i.get(GATT_SERVICE_INTERFACE)?))) {
            match Service::from_properties(path, props) {
                Some(s) => {
                    services.insert(path.clone(), s);
                }
                None => warn!("skipping malformed service object {}", path),
            }
        }
        let mut characteristics = BTreeMap::new();
        for (path, props) in nested.iter().filter_map(|&(p, i)| Some((p, i.get(GATT_CHARACTERISTIC_INTERFACE)?))) {
            match Characteristic::from_properties(&self.0.ctx, &self.0.path, path, props, &services) {
                Some(c) => {
                    trace!("{}: characteristic {} ({})", self.0.address, c.id(), c.properties());
                    characteristics.insert(path.clone(), c);
                }
                None => warn!("skipping malformed characteristic object {}", path),
            }
        }

        let (service_count, count) = (services.len(), characteristics.len());
        {
            let mut s = lock(&self.0.state);
            if !s.connected {
                return Err(Error::new(ErrorKind::NotConnected,
                    format!("{} disconnected during service enumeration", self.0.address)));
            }
            s.services = services;
            s.characteristics = characteristics;
            s.generation += 1;
        }
        info!("{}: {} services, {} characteristics", self.0.address, service_count, count);
        self.0.ctx.events.send(AdapterEvent::ServicesResolved {
            device: self.clone(),
            characteristics: count,
        });
        Ok(count)
    }

    /// Stops all bus traffic for a device whose object was removed.
    pub(in crate) fn mark_gone(&self) {
        if self.release() {
            debug!("{} disconnected by removal", self.0.address);
            self.0.ctx.events.send(AdapterEvent::ConnectionChanged {
                device: self.clone(),
                connected: false,
            });
        }
    }

    /// Disconnects best-effort and stops tracking the object. Used when the adapter closes
    /// while handles to the device may still be around.
    pub(in crate) fn teardown(&self) -> BestEffort {
        if !self.release() {
            return BestEffort::NotNeeded;
        }
        debug!("disconnecting {} on teardown", self.0.address);
        let ctx = &self.0.ctx;
        let r = ctx.session.call(&self.0.path, DEVICE_INTERFACE, "Disconnect", Vec::new(),
                ctx.config.timeouts.disconnect)
            .map(|_| ())
            .map_err(|e| Error::from_bus(ErrorKind::DisconnectCallFailed,
                format!("couldn't disconnect {} on teardown", self.0.address), &e));
        if let Err(e) = &r {
            warn!("{}", e);
        }
        BestEffort::from_call(r)
    }

    /// Marks the mirror gone and detaches its characteristics. Returns whether it was
    /// connected and not gone before.
    fn release(&self) -> bool {
        let (was_connected, stale) = {
            let mut s = lock(&self.0.state);
            let was_connected = s.connected && !s.gone;
            s.gone = true;
            s.connected = false;
            s.services_resolved = false;
            s.services.clear();
            (was_connected, mem::take(&mut s.characteristics))
        };
        self.cancel_resolve();
        for c in stale.values() {
            c.detach();
        }
        was_connected
    }

    /// Forgets a characteristic whose object was removed.
    pub(in crate) fn remove_characteristic(&self, path: &ObjectPath) {
        let removed = lock(&self.0.state).characteristics.remove(path);
        if let Some(c) = removed {
            debug!("{}: characteristic {} removed", self.0.address, path);
            c.detach();
        }
    }

    fn set_transition(&self, t: Option<Transition>) {
        lock(&self.0.state).transition = t;
    }
}

fn resolve_later(weak: Weak<Inner>, generation: u64) {
    let device = match weak.upgrade() {
        Some(inner) => Device(inner),
        None => return,
    };
    if !device.is_connected() {
        return;
    }
    if let Err(e) = device.refresh(Some(generation)) {
        warn!("deferred service resolution of {} failed: {}", device.0.address, e);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let job = self.resolve_job.get_mut().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(job) = job {
            job.cancel();
        }
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        for c in state.characteristics.values() {
            c.detach();
        }
        if state.connected && !state.gone {
            debug!("disconnecting {} on drop", self.address);
            if let Err(e) = self.ctx.session.call(&self.path, DEVICE_INTERFACE, "Disconnect",
                Vec::new(), self.ctx.config.timeouts.disconnect)
            {
                warn!("couldn't disconnect {} on drop: {}", self.address, e);
            }
        }
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.0.path == other.0.path
    }
}

impl Eq for Device {}

impl std::hash::Hash for Device {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.path.hash(state)
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Device")
            .field("path", &self.0.path)
            .field("address", &self.0.address)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bus::memory::*;
    use crate::central::testing;
    use crate::retry::RetryPolicy;
    use crate::sync::Receiver;
    use std::thread;
    use std::time::Duration;

    const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

    fn hrm() -> Uuid {
        Uuid::from_u16(0x180d)
    }

    fn battery() -> Uuid {
        Uuid::from_u16(0x180f)
    }

    /// Device exposing a heart rate service, a battery service and one object without a UUID.
    fn peripheral(bus: &MemoryBus) -> ObjectPath {
        let adapter = ObjectPath::from("/org/bluez/hci0");
        let dev = device_path(&adapter, ADDRESS);
        bus.add_object(&adapter, adapter_interfaces("00:11:22:33:44:55", true));
        bus.add_object(&dev, device_interfaces(&adapter, ADDRESS, Some("Polar H10"), &["180d"]));

        let hr = dev.child("service000c");
        bus.add_object(&hr, service_interfaces(&dev, "180d"));
        bus.add_object(&hr.child("char000d"), characteristic_interfaces(&hr, "2a37", &["notify"]));
        bus.add_object(&hr.child("char0010"), characteristic_interfaces(&hr, "2a38", &["read"]));

        let bat = dev.child("service0020");
        bus.add_object(&bat, service_interfaces(&dev, "180f"));
        bus.add_object(&bat.child("char0021"), characteristic_interfaces(&bat, "2a19", &["read", "notify"]));

        let mut broken = characteristic_interfaces(&bat, "2a19", &["read"]);
        broken.get_mut(GATT_CHARACTERISTIC_INTERFACE).unwrap().remove("UUID");
        bus.add_object(&bat.child("char0030"), broken);
        dev
    }

    fn mirror(bus: &Arc<MemoryBus>, ctx: &Arc<Context>) -> Device {
        let dev = peripheral(bus);
        let props = bus.managed_objects(BLUEZ_SERVICE).unwrap()[&dev][DEVICE_INTERFACE].clone();
        Device::from_properties(ctx, &dev, &props).unwrap()
    }

    fn connection_events(events: &Receiver<AdapterEvent>) -> Vec<bool> {
        events.try_iter()
            .filter_map(|e| match e {
                AdapterEvent::ConnectionChanged { connected, .. } => Some(connected),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn mirrors_descriptive_properties() {
        let bus = MemoryBus::bluez().unwrap();
        let (ctx, _events) = testing::context(&bus);
        let d = mirror(&bus, &ctx);
        assert_eq!(d.address(), ADDRESS);
        assert_eq!(d.name(), "Polar H10");
        assert!(d.service_ids().contains(&hrm()));
        assert_eq!(d.state(), ConnectionState::Disconnected);

        let mut changed = PropertyMap::new();
        changed.insert("Alias".into(), "chest strap".into());
        changed.insert("RSSI".into(), Value::I16(-60));
        d.apply_changes(&changed);
        assert_eq!(d.alias().as_deref(), Some("chest strap"));
        assert_eq!(d.rssi(), Some(-60));
        assert_eq!(d.name(), "Polar H10");
    }

    #[test]
    fn name_falls_back() {
        let bus = MemoryBus::bluez().unwrap();
        let (ctx, _events) = testing::context(&bus);
        let adapter = ObjectPath::from("/org/bluez/hci0");
        let path = device_path(&adapter, ADDRESS);
        let mut props = device_interfaces(&adapter, "aa:bb:cc:dd:ee:ff", None, &[])
            .remove(DEVICE_INTERFACE).unwrap();
        let d = Device::from_properties(&ctx, &path, &props).unwrap();
        assert_eq!(d.address(), ADDRESS);
        assert_eq!(d.name(), "aa-bb-cc-dd-ee-ff");

        props.remove("Alias");
        let d = Device::from_properties(&ctx, &path, &props).unwrap();
        assert_eq!(d.name(), UNKNOWN_NAME);

        props.insert("Address".into(), "".into());
        assert!(Device::from_properties(&ctx, &path, &props).is_none());
    }

    #[test]
    fn connect_is_idempotent() {
        let bus = MemoryBus::bluez().unwrap();
        let (ctx, events) = testing::context(&bus);
        let d = mirror(&bus, &ctx);

        d.connect().unwrap();
        assert!(d.characteristics().is_empty());
        assert_eq!(d.state(), ConnectionState::ConnectedUnresolved);
        d.connect().unwrap();
        assert_eq!(bus.call_count("Connect"), 1);
        assert_eq!(connection_events(&events), vec![true]);
    }

    #[test]
    fn connect_call_failure() {
        let bus = MemoryBus::bluez().unwrap();
        let (ctx, _events) = testing::context(&bus);
        let d = mirror(&bus, &ctx);
        bus.on_method(DEVICE_INTERFACE, "Connect",
            |_, _| Err(BusError::new("org.bluez.Error.Failed", "le-connection-abort-by-local")));

        let err = d.connect().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectCallFailed);
        assert!(err.description().contains("le-connection-abort-by-local"));
        assert_eq!(d.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn connect_timeout_is_bounded() {
        let bus = MemoryBus::bluez().unwrap();
        let (ctx, _events) = testing::context(&bus);
        let d = mirror(&bus, &ctx);
        bus.on_method(DEVICE_INTERFACE, "Connect", |_, _| Ok(Vec::new()));
        bus.clear_calls();

        let err = d.connect().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectTimeout);
        let polls = bus.calls().iter().filter(|c| c.property.as_deref() == Some("Connected")).count();
        assert_eq!(polls as u32, ctx.config.connect_poll.attempts);
        assert!(!d.is_connected());
    }

    #[test]
    fn refresh_needs_connection() {
        let bus = MemoryBus::bluez().unwrap();
        let (ctx, _events) = testing::context(&bus);
        let d = mirror(&bus, &ctx);
        bus.clear_calls();
        assert_eq!(d.refresh_services().unwrap_err().kind(), ErrorKind::NotConnected);
        assert_eq!(bus.call_count("GetManagedObjects"), 0);
    }

    #[test]
    fn refresh_enumerates_nested_objects() {
        let bus = MemoryBus::bluez().unwrap();
        let (ctx, events) = testing::context(&bus);
        let d = mirror(&bus, &ctx);
        d.connect().unwrap();
        bus.store_property(d.path(), DEVICE_INTERFACE, "ServicesResolved", true).unwrap();

        assert_eq!(d.refresh_services().unwrap(), 3);
        assert_eq!(d.state(), ConnectionState::ConnectedResolved);
        assert_eq!(d.services().len(), 2);
        let c = d.characteristic(battery(), Uuid::from_u16(0x2a19)).unwrap();
        assert!(c.path().as_str().ends_with("char0021"));
        assert_eq!(d.characteristic_by_path(c.path()).map(|c| c.id()), Some(Uuid::from_u16(0x2a19)));
        assert!(d.characteristic_by_path(&d.path().child("service000c")).is_none());
        assert_eq!(d.characteristic(hrm(), Uuid::from_u16(0x2a19)).unwrap_err().kind(),
            ErrorKind::CharacteristicNotFound);
        assert!(events.try_iter().any(|e| matches!(e, AdapterEvent::ServicesResolved { characteristics: 3, .. })));
    }

    #[test]
    fn refresh_without_characteristics() {
        let bus = MemoryBus::bluez().unwrap();
        let (ctx, _events) = testing::context(&bus);
        let adapter = ObjectPath::from("/org/bluez/hci0");
        let path = device_path(&adapter, ADDRESS);
        bus.add_object(&path, device_interfaces(&adapter, ADDRESS, None, &[]));
        let props = bus.managed_objects(BLUEZ_SERVICE).unwrap()[&path][DEVICE_INTERFACE].clone();
        let d = Device::from_properties(&ctx, &path, &props).unwrap();
        d.connect().unwrap();

        assert_eq!(d.refresh_services().unwrap_err().kind(), ErrorKind::NoCharacteristicsFound);
    }

    #[test]
    fn disconnect_edge_clears_characteristics() {
        let bus = MemoryBus::bluez().unwrap();
        let (ctx, events) = testing::context(&bus);
        let d = mirror(&bus, &ctx);
        d.connect().unwrap();
        d.refresh_services().unwrap();
        let c = d.characteristic(hrm(), Uuid::from_u16(0x2a37)).unwrap();
        c.start_notifications(|_, _| {}).unwrap();
        assert_eq!(bus.subscription_count(), 1);

        d.disconnect().unwrap();
        assert!(d.characteristics().is_empty());
        assert!(!c.is_notifying());
        assert_eq!(bus.subscription_count(), 0);
        assert_eq!(d.state(), ConnectionState::Disconnected);
        assert_eq!(connection_events(&events), vec![true, false]);

        d.disconnect().unwrap();
        assert_eq!(bus.call_count("Disconnect"), 1);
    }

    #[test]
    fn disconnect_failures() {
        let bus = MemoryBus::bluez().unwrap();
        let (ctx, _events) = testing::context(&bus);
        let d = mirror(&bus, &ctx);
        d.connect().unwrap();

        bus.on_method(DEVICE_INTERFACE, "Disconnect", |_, _| Ok(Vec::new()));
        assert_eq!(d.disconnect().unwrap_err().kind(), ErrorKind::DisconnectTimeout);
        bus.on_method(DEVICE_INTERFACE, "Disconnect", |_, _| Err(BusError::failed("busy")));
        assert_eq!(d.disconnect().unwrap_err().kind(), ErrorKind::DisconnectCallFailed);
        assert!(d.is_connected());
    }

    #[test]
    fn grace_delay_resolves_services() {
        let bus = MemoryBus::bluez().unwrap();
        let (ctx, _events) = testing::context(&bus);
        let d = mirror(&bus, &ctx);
        d.connect().unwrap();
        assert!(d.characteristics().is_empty());

        thread::sleep(ctx.config.services_grace * 4);
        assert_eq!(d.characteristics().len(), 3);
    }

    #[test]
    fn late_grace_job_keeps_fresh_characteristics() {
        let bus = MemoryBus::bluez().unwrap();
        let mut config = testing::config();
        config.services_grace = Duration::from_millis(20);
        config.services_poll = RetryPolicy::new(20, Duration::from_millis(20));
        let (ctx, events) = testing::context_with(&bus, config);
        let d = mirror(&bus, &ctx);
        d.connect().unwrap();
        // The grace job is now polling ServicesResolved.
        thread::sleep(Duration::from_millis(60));
        bus.clear_calls();

        let mut changed = PropertyMap::new();
        changed.insert("ServicesResolved".into(), true.into());
        d.apply_changes(&changed);
        bus.store_property(d.path(), DEVICE_INTERFACE, "ServicesResolved", true).unwrap();
        let c = d.characteristic(hrm(), Uuid::from_u16(0x2a37)).unwrap();
        c.start_notifications(|_, _| {}).unwrap();

        thread::sleep(Duration::from_millis(200));
        assert!(c.is_notifying());
        assert_eq!(bus.subscription_count(), 1);
        assert_eq!(bus.call_count("GetManagedObjects"), 1);
        let resolved = events.try_iter()
            .filter(|e| matches!(e, AdapterEvent::ServicesResolved { .. }))
            .count();
        assert_eq!(resolved, 1);
    }

    #[test]
    fn disconnect_cancels_grace_job() {
        let bus = MemoryBus::bluez().unwrap();
        let (ctx, _events) = testing::context(&bus);
        let d = mirror(&bus, &ctx);
        d.connect().unwrap();
        d.disconnect().unwrap();
        bus.clear_calls();

        thread::sleep(ctx.config.services_grace * 4);
        assert_eq!(bus.call_count("GetManagedObjects"), 0);
        assert!(d.characteristics().is_empty());
    }

    #[test]
    fn services_resolved_change_enumerates() {
        let bus = MemoryBus::bluez().unwrap();
        let (ctx, _events) = testing::context(&bus);
        let d = mirror(&bus, &ctx);
        d.connect().unwrap();

        let mut changed = PropertyMap::new();
        changed.insert("ServicesResolved".into(), true.into());
        d.apply_changes(&changed);
        assert_eq!(d.characteristics().len(), 3);
        assert!(d.services_resolved());
    }

    #[test]
    fn pair_updates_flag() {
        let bus = MemoryBus::bluez().unwrap();
        let (ctx, _events) = testing::context(&bus);
        let d = mirror(&bus, &ctx);
        d.pair().unwrap();
        assert!(d.is_paired());

        bus.on_method(DEVICE_INTERFACE, "Pair",
            |_, _| Err(BusError::new("org.bluez.Error.AuthenticationFailed", "Authentication Failed")));
        assert_eq!(d.pair().unwrap_err().kind(), ErrorKind::PairCallFailed);
    }

    #[test]
    fn drop_disconnects_unless_gone() {
        let bus = MemoryBus::bluez().unwrap();
        let (ctx, _) = testing::context(&bus);
        let d = mirror(&bus, &ctx);
        d.connect().unwrap();
        drop(d);
        assert_eq!(bus.call_count("Disconnect"), 1);

        let bus = MemoryBus::bluez().unwrap();
        let (ctx, _) = testing::context(&bus);
        let d = mirror(&bus, &ctx);
        d.connect().unwrap();
        d.mark_gone();
        drop(d);
        assert_eq!(bus.call_count("Disconnect"), 0);
    }

    #[test]
    fn teardown_disconnects_once() {
        let bus = MemoryBus::bluez().unwrap();
        let (ctx, _events) = testing::context(&bus);
        let d = mirror(&bus, &ctx);
        assert!(matches!(d.teardown(), BestEffort::NotNeeded));

        let d = mirror(&bus, &ctx);
        d.connect().unwrap();
        assert!(matches!(d.teardown(), BestEffort::Completed));
        assert!(!d.is_connected());
        assert!(matches!(d.teardown(), BestEffort::NotNeeded));
        drop(d);
        assert_eq!(bus.call_count("Disconnect"), 1);
    }
}
