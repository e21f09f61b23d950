//! In-process object bus.
//!
//! `MemoryBus` keeps the object tree in memory, answers method calls through registered
//! handlers and delivers signals on its own dispatch thread, in emission order. Every call is
//! recorded so callers can check which requests were made.
//!
//! [`MemoryBus::bluez`](struct.MemoryBus.html#method.bluez) pre-registers handlers that
//! behave like the BlueZ daemon for the methods the mirror uses.

use log::*;
use static_assertions::assert_impl_all;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::num::NonZeroU64;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use super::*;
use crate::util::lock;

pub type MethodHandler = Arc<dyn Fn(&MemoryBus, &MethodCall) -> BusResult<Vec<Value>> + Send + Sync>;
pub type SetHandler = Arc<dyn Fn(&MemoryBus, &ObjectPath, Value) -> BusResult<()> + Send + Sync>;

/// One request received by the bus.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CallRecord {
    pub path: ObjectPath,
    pub interface: String,
    /// Method name, or `Get`/`Set` for property access.
    pub member: String,
    /// Property name for `Get`/`Set`.
    pub property: Option<String>,
}

enum Job {
    Deliver(Signal),
    Barrier(mpsc::Sender<()>),
}

#[derive(Default)]
struct Subscriptions {
    last_token: u64,
    entries: BTreeMap<SubscriptionToken, (SignalRule, Arc<SignalHandler>)>,
}

pub struct MemoryBus {
    service: String,
    objects: Mutex<ManagedObjects>,
    methods: Mutex<HashMap<(String, String), MethodHandler>>,
    setters: Mutex<HashMap<(String, String), SetHandler>>,
    calls: Mutex<Vec<CallRecord>>,
    subscriptions: Arc<Mutex<Subscriptions>>,
    queue: Mutex<mpsc::Sender<Job>>,
    dispatcher: thread::ThreadId,
}

assert_impl_all!(MemoryBus: Send, Sync);

impl MemoryBus {
    /// Empty bus owned by `service`, with no method handlers.
    pub fn new(service: &str) -> io::Result<Arc<Self>> {
        let (queue, jobs) = mpsc::channel();
        let subscriptions = Arc::new(Mutex::new(Subscriptions::default()));
        let dispatcher = {
            let subscriptions = subscriptions.clone();
            thread::Builder::new()
                .name("bus-dispatch".into())
                .spawn(move || dispatch(jobs, subscriptions))?
        };
        Ok(Arc::new(Self {
            service: service.to_owned(),
            objects: Mutex::new(ManagedObjects::new()),
            methods: Mutex::new(HashMap::new()),
            setters: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            subscriptions,
            queue: Mutex::new(queue),
            dispatcher: dispatcher.thread().id(),
        }))
    }

    /// Bus owned by `org.bluez` that answers adapter, device and characteristic methods the
    /// way the daemon does.
    pub fn bluez() -> io::Result<Arc<Self>> {
        let bus = Self::new(BLUEZ_SERVICE)?;
        emulate_bluez(&bus);
        Ok(bus)
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Installs or replaces the handler for `interface.method`.
    pub fn on_method<F>(&self, interface: &str, method: &str, handler: F)
        where F: Fn(&MemoryBus, &MethodCall) -> BusResult<Vec<Value>> + Send + Sync + 'static
    {
        lock(&self.methods).insert((interface.to_owned(), method.to_owned()), Arc::new(handler));
    }

    /// Intercepts client writes of `interface.property`. Without a handler the value is stored
    /// and a change signal emitted.
    pub fn on_set<F>(&self, interface: &str, property: &str, handler: F)
        where F: Fn(&MemoryBus, &ObjectPath, Value) -> BusResult<()> + Send + Sync + 'static
    {
        lock(&self.setters).insert((interface.to_owned(), property.to_owned()), Arc::new(handler));
    }

    /// Adds `interfaces` to the object at `path`, creating it if needed, and emits
    /// `InterfacesAdded`.
    pub fn add_object(&self, path: &ObjectPath, interfaces: Interfaces) {
        {
            let mut objects = lock(&self.objects);
            let entry = objects.entry(path.clone()).or_default();
            for (name, props) in &interfaces {
                entry.insert(name.clone(), props.clone());
            }
        }
        debug!("object added: {}", path);
        self.emit(OBJECT_MANAGER_INTERFACE, INTERFACES_ADDED, &ObjectPath::root(),
            SignalPayload::InterfacesAdded {
                path: path.clone(),
                interfaces,
            });
    }

    /// Removes the object at `path` and everything below it, emitting `InterfacesRemoved`
    /// for each, deepest first. Returns `false` if nothing was there.
    pub fn remove_object(&self, path: &ObjectPath) -> bool {
        let removed: Vec<(ObjectPath, Interfaces)> = {
            let mut objects = lock(&self.objects);
            let doomed: Vec<ObjectPath> = objects.keys()
                .filter(|p| *p == path || p.is_descendant_of(path))
                .cloned()
                .collect();
            doomed.into_iter()
                .rev()
                .filter_map(|p| objects.remove(&p).map(|ifaces| (p, ifaces)))
                .collect()
        };
        let found = !removed.is_empty();
        for (p, interfaces) in removed {
            debug!("object removed: {}", p);
            self.emit(OBJECT_MANAGER_INTERFACE, INTERFACES_REMOVED, &ObjectPath::root(),
                SignalPayload::InterfacesRemoved {
                    path: p,
                    interfaces: interfaces.keys().cloned().collect(),
                });
        }
        found
    }

    /// Changes a property as the remote side would, emitting `PropertiesChanged`.
    pub fn update_property(&self, path: &ObjectPath, interface: &str, name: &str, value: impl Into<Value>)
        -> BusResult<()>
    {
        let value = value.into();
        self.store_property(path, interface, name, value.clone())?;
        let mut changed = PropertyMap::new();
        changed.insert(name.to_owned(), value);
        self.emit(PROPERTIES_INTERFACE, PROPERTIES_CHANGED, path, SignalPayload::PropertiesChanged {
            interface: interface.to_owned(),
            changed,
            invalidated: Vec::new(),
        });
        Ok(())
    }

    /// Changes a property without emitting a signal.
    pub fn store_property(&self, path: &ObjectPath, interface: &str, name: &str, value: impl Into<Value>)
        -> BusResult<()>
    {
        let mut objects = lock(&self.objects);
        let props = objects.get_mut(path)
            .ok_or_else(|| BusError::unknown_object(path))?
            .get_mut(interface)
            .ok_or_else(|| unknown_interface(path, interface))?;
        props.insert(name.to_owned(), value.into());
        Ok(())
    }

    pub fn property(&self, path: &ObjectPath, interface: &str, name: &str) -> Option<Value> {
        lock(&self.objects).get(path)?.get(interface)?.get(name).cloned()
    }

    pub fn contains(&self, path: &ObjectPath) -> bool {
        lock(&self.objects).contains_key(path)
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        lock(&self.calls).clone()
    }

    /// Number of recorded requests named `member`.
    pub fn call_count(&self, member: &str) -> usize {
        lock(&self.calls).iter().filter(|c| c.member == member).count()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    pub fn subscription_count(&self) -> usize {
        lock(&self.subscriptions).entries.len()
    }

    /// Blocks until every signal emitted so far has been delivered.
    ///
    /// Returns immediately when called from a signal handler.
    pub fn flush(&self) {
        if thread::current().id() == self.dispatcher {
            return;
        }
        let (done, wait) = mpsc::channel();
        if lock(&self.queue).send(Job::Barrier(done)).is_ok() {
            let _ = wait.recv();
        }
    }

    pub fn emit(&self, interface: &str, member: &str, path: &ObjectPath, payload: SignalPayload) {
        let signal = Signal {
            sender: self.service.clone(),
            path: path.clone(),
            interface: interface.to_owned(),
            member: member.to_owned(),
            payload,
        };
        trace!("emitting {}.{} from {}", interface, member, path);
        if lock(&self.queue).send(Job::Deliver(signal)).is_err() {
            warn!("dispatch thread is gone, dropping signal");
        }
    }

    fn record(&self, path: &ObjectPath, interface: &str, member: &str, property: Option<&str>) {
        lock(&self.calls).push(CallRecord {
            path: path.clone(),
            interface: interface.to_owned(),
            member: member.to_owned(),
            property: property.map(|p| p.to_owned()),
        });
    }

    fn check_service(&self, service: &str) -> BusResult<()> {
        if service == self.service {
            Ok(())
        } else {
            Err(BusError::new("org.freedesktop.DBus.Error.ServiceUnknown",
                format!("the name {} is not owned", service)))
        }
    }

    fn check_interface(&self, path: &ObjectPath, interface: &str) -> BusResult<()> {
        let objects = lock(&self.objects);
        let ifaces = objects.get(path).ok_or_else(|| BusError::unknown_object(path))?;
        if ifaces.contains_key(interface) {
            Ok(())
        } else {
            Err(unknown_interface(path, interface))
        }
    }
}

impl ObjectBus for MemoryBus {
    fn call(&self, call: &MethodCall) -> BusResult<Vec<Value>> {
        self.check_service(&call.service)?;
        self.record(&call.path, &call.interface, &call.method, None);
        self.check_interface(&call.path, &call.interface)?;
        let handler = lock(&self.methods)
            .get(&(call.interface.clone(), call.method.clone()))
            .cloned()
            .ok_or_else(|| BusError::new("org.freedesktop.DBus.Error.UnknownMethod",
                format!("{}.{} is not implemented", call.interface, call.method)))?;
        handler(self, call)
    }

    fn get_property(&self, service: &str, path: &ObjectPath, interface: &str, name: &str)
        -> BusResult<Value>
    {
        self.check_service(service)?;
        self.record(path, interface, "Get", Some(name));
        self.check_interface(path, interface)?;
        self.property(path, interface, name)
            .ok_or_else(|| BusError::new("org.freedesktop.DBus.Error.InvalidArgs",
                format!("no such property '{}'", name)))
    }

    fn set_property(&self, service: &str, path: &ObjectPath, interface: &str, name: &str,
        value: Value) -> BusResult<()>
    {
        self.check_service(service)?;
        self.record(path, interface, "Set", Some(name));
        self.check_interface(path, interface)?;
        let setter = lock(&self.setters).get(&(interface.to_owned(), name.to_owned())).cloned();
        match setter {
            Some(setter) => setter(self, path, value),
            None => self.update_property(path, interface, name, value),
        }
    }

    fn managed_objects(&self, service: &str) -> BusResult<ManagedObjects> {
        self.check_service(service)?;
        self.record(&ObjectPath::root(), OBJECT_MANAGER_INTERFACE, "GetManagedObjects", None);
        Ok(lock(&self.objects).clone())
    }

    fn subscribe(&self, rule: SignalRule, handler: SignalHandler) -> BusResult<SubscriptionToken> {
        let mut subs = lock(&self.subscriptions);
        subs.last_token += 1;
        let token = NonZeroU64::new(subs.last_token)
            .map(SubscriptionToken::new)
            .ok_or_else(|| BusError::failed("subscription tokens exhausted"))?;
        trace!("subscription {} for {:?}", token.get(), rule);
        subs.entries.insert(token, (rule, Arc::new(handler)));
        Ok(token)
    }

    fn unsubscribe(&self, token: SubscriptionToken) {
        if lock(&self.subscriptions).entries.remove(&token).is_some() {
            trace!("subscription {} removed", token.get());
        }
    }
}

fn dispatch(jobs: mpsc::Receiver<Job>, subscriptions: Arc<Mutex<Subscriptions>>) {
    for job in jobs {
        match job {
            Job::Deliver(signal) => {
                // Handlers run unlocked so they may (un)subscribe.
                let handlers: Vec<Arc<SignalHandler>> = lock(&subscriptions).entries.values()
                    .filter(|(rule, _)| rule.matches(&signal))
                    .map(|(_, handler)| handler.clone())
                    .collect();
                for handler in handlers {
                    handler(&signal);
                }
            }
            Job::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
    trace!("dispatch thread finished");
}

fn unknown_interface(path: &ObjectPath, interface: &str) -> BusError {
    BusError::new("org.freedesktop.DBus.Error.UnknownInterface",
        format!("{} doesn't implement {}", path, interface))
}

fn emulate_bluez(bus: &MemoryBus) {
    fn discovering(on: bool)
        -> impl Fn(&MemoryBus, &MethodCall) -> BusResult<Vec<Value>> + Send + Sync + 'static
    {
        move |bus, call| {
            let now = bus.property(&call.path, ADAPTER_INTERFACE, "Discovering")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if !on && !now {
                return Err(BusError::failed("No discovery started"));
            }
            bus.update_property(&call.path, ADAPTER_INTERFACE, "Discovering", on)?;
            Ok(Vec::new())
        }
    }
    bus.on_method(ADAPTER_INTERFACE, "StartDiscovery", discovering(true));
    bus.on_method(ADAPTER_INTERFACE, "StopDiscovery", discovering(false));

    bus.on_method(DEVICE_INTERFACE, "Connect", |bus, call| {
        bus.update_property(&call.path, DEVICE_INTERFACE, "Connected", true)?;
        Ok(Vec::new())
    });
    bus.on_method(DEVICE_INTERFACE, "Disconnect", |bus, call| {
        bus.update_property(&call.path, DEVICE_INTERFACE, "ServicesResolved", false)?;
        bus.update_property(&call.path, DEVICE_INTERFACE, "Connected", false)?;
        Ok(Vec::new())
    });
    bus.on_method(DEVICE_INTERFACE, "Pair", |bus, call| {
        bus.update_property(&call.path, DEVICE_INTERFACE, "Paired", true)?;
        Ok(Vec::new())
    });

    bus.on_method(GATT_CHARACTERISTIC_INTERFACE, "ReadValue", |bus, call| {
        let value = bus.property(&call.path, GATT_CHARACTERISTIC_INTERFACE, "Value")
            .unwrap_or_else(|| Value::Bytes(Vec::new()));
        Ok(vec![value])
    });
    bus.on_method(GATT_CHARACTERISTIC_INTERFACE, "WriteValue", |bus, call| {
        let value = call.args.first()
            .and_then(|v| v.as_bytes())
            .ok_or_else(|| BusError::new("org.bluez.Error.InvalidArguments", "value must be a byte array"))?;
        bus.store_property(&call.path, GATT_CHARACTERISTIC_INTERFACE, "Value", value)?;
        Ok(Vec::new())
    });
    bus.on_method(GATT_CHARACTERISTIC_INTERFACE, "StartNotify", |bus, call| {
        bus.update_property(&call.path, GATT_CHARACTERISTIC_INTERFACE, "Notifying", true)?;
        Ok(Vec::new())
    });
    bus.on_method(GATT_CHARACTERISTIC_INTERFACE, "StopNotify", |bus, call| {
        bus.update_property(&call.path, GATT_CHARACTERISTIC_INTERFACE, "Notifying", false)?;
        Ok(Vec::new())
    });
}

/// Object path BlueZ assigns to the device with `address` under `adapter`.
pub fn device_path(adapter: &ObjectPath, address: &str) -> ObjectPath {
    adapter.child(&format!("dev_{}", address.to_ascii_uppercase().replace(':', "_")))
}

fn single(interface: &str, props: PropertyMap) -> Interfaces {
    let mut r = Interfaces::new();
    r.insert(interface.to_owned(), props);
    r
}

fn props(items: Vec<(&'static str, Value)>) -> PropertyMap {
    items.into_iter().map(|(k, v)| (k.to_owned(), v)).collect()
}

pub fn adapter_interfaces(address: &str, powered: bool) -> Interfaces {
    single(ADAPTER_INTERFACE, props(vec![
        ("Address", address.into()),
        ("Powered", powered.into()),
        ("Discovering", false.into()),
    ]))
}

pub fn device_interfaces(adapter: &ObjectPath, address: &str, name: Option<&str>, service_ids: &[&str])
    -> Interfaces
{
    let mut p = props(vec![
        ("Adapter", Value::Path(adapter.clone())),
        ("Address", address.into()),
        ("Alias", address.replace(':', "-").into()),
        ("Connected", false.into()),
        ("ServicesResolved", false.into()),
        ("Paired", false.into()),
        ("UUIDs", service_ids.into()),
    ]);
    if let Some(name) = name {
        p.insert("Name".into(), name.into());
    }
    single(DEVICE_INTERFACE, p)
}

pub fn service_interfaces(device: &ObjectPath, uuid: &str) -> Interfaces {
    single(GATT_SERVICE_INTERFACE, props(vec![
        ("UUID", uuid.into()),
        ("Device", Value::Path(device.clone())),
        ("Primary", true.into()),
    ]))
}

pub fn characteristic_interfaces(service: &ObjectPath, uuid: &str, flags: &[&str]) -> Interfaces {
    single(GATT_CHARACTERISTIC_INTERFACE, props(vec![
        ("UUID", uuid.into()),
        ("Service", Value::Path(service.clone())),
        ("Flags", flags.into()),
        ("Notifying", false.into()),
        ("Value", Value::Bytes(Vec::new())),
    ]))
}
