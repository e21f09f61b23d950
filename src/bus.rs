//! Abstract object bus the mirror is built on.
//!
//! The bus exposes a tree of remote objects, each identified by an [`ObjectPath`] and
//! implementing a set of interfaces with typed properties. Clients issue blocking method
//! calls and property reads/writes, and receive change signals on a dispatch thread owned by
//! the bus implementation. Wire encoding and connection management belong to the
//! implementation and are not modelled here.
//!
//! [`MemoryBus`](memory/struct.MemoryBus.html) is an in-process implementation.

pub mod memory;

use static_assertions::assert_impl_all;
use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroU64;
use std::sync::Arc;
use std::time::Duration;

pub const BLUEZ_SERVICE: &str = "org.bluez";
pub const ADAPTER_INTERFACE: &str = "org.bluez.Adapter1";
pub const DEVICE_INTERFACE: &str = "org.bluez.Device1";
pub const GATT_SERVICE_INTERFACE: &str = "org.bluez.GattService1";
pub const GATT_CHARACTERISTIC_INTERFACE: &str = "org.bluez.GattCharacteristic1";
pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";
pub const OBJECT_MANAGER_INTERFACE: &str = "org.freedesktop.DBus.ObjectManager";

pub const INTERFACES_ADDED: &str = "InterfacesAdded";
pub const INTERFACES_REMOVED: &str = "InterfacesRemoved";
pub const PROPERTIES_CHANGED: &str = "PropertiesChanged";

string_wrapper!(
    /// Identity of an object on the bus, e.g. `/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF`.
    ObjectPath
);

impl ObjectPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn root() -> Self {
        Self::new("/")
    }

    /// Whether this object sits strictly below `ancestor` in the tree.
    pub fn is_descendant_of(&self, ancestor: &ObjectPath) -> bool {
        let ancestor = ancestor.as_str().trim_end_matches('/');
        self.0.len() > ancestor.len() + 1
            && self.0.starts_with(ancestor)
            && self.0.as_bytes()[ancestor.len()] == b'/'
    }

    pub fn child(&self, name: &str) -> Self {
        Self(format!("{}/{}", self.0.trim_end_matches('/'), name))
    }
}

impl From<&str> for ObjectPath {
    fn from(v: &str) -> Self {
        Self::new(v)
    }
}

impl From<String> for ObjectPath {
    fn from(v: String) -> Self {
        Self::new(v)
    }
}

/// Typed property or argument value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Bool(bool),
    I16(i16),
    U16(u16),
    U32(u32),
    Str(String),
    Path(ObjectPath),
    StrArray(Vec<String>),
    Bytes(Vec<u8>),
    Dict(PropertyMap),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i16(&self) -> Option<i16> {
        match self {
            Value::I16(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            Value::Path(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn as_path(&self) -> Option<&ObjectPath> {
        match self {
            Value::Path(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str_array(&self) -> Option<&[String]> {
        match self {
            Value::StrArray(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<ObjectPath> for Value {
    fn from(v: ObjectPath) -> Self {
        Value::Path(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl From<Vec<String>> for Value {
    fn from(v: Vec<String>) -> Self {
        Value::StrArray(v)
    }
}

impl From<&[&str]> for Value {
    fn from(v: &[&str]) -> Self {
        Value::StrArray(v.iter().map(|s| (*s).to_owned()).collect())
    }
}

pub type PropertyMap = BTreeMap<String, Value>;

/// Interfaces implemented by one object, with their properties.
pub type Interfaces = BTreeMap<String, PropertyMap>;

/// Snapshot of the whole object tree, in path order.
pub type ManagedObjects = BTreeMap<ObjectPath, Interfaces>;

/// Error returned by the remote side or the bus itself.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BusError {
    name: String,
    message: String,
}

impl BusError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new("org.bluez.Error.Failed", message)
    }

    pub fn unknown_object(path: &ObjectPath) -> Self {
        Self::new("org.freedesktop.DBus.Error.UnknownObject", format!("no object at {}", path))
    }

    pub fn invalid_reply(message: impl Into<String>) -> Self {
        Self::new("org.freedesktop.DBus.Error.InvalidSignature", message)
    }

    /// Error name, e.g. `org.bluez.Error.NotPermitted`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for BusError {}

pub type BusResult<T> = Result<T, BusError>;

#[derive(Clone, Debug, PartialEq)]
pub struct MethodCall {
    pub service: String,
    pub path: ObjectPath,
    pub interface: String,
    pub method: String,
    pub args: Vec<Value>,
    /// `None` leaves the timeout to the bus default.
    pub timeout: Option<Duration>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SignalPayload {
    InterfacesAdded {
        path: ObjectPath,
        interfaces: Interfaces,
    },
    InterfacesRemoved {
        path: ObjectPath,
        interfaces: Vec<String>,
    },
    PropertiesChanged {
        interface: String,
        changed: PropertyMap,
        invalidated: Vec<String>,
    },
}

impl SignalPayload {
    /// The first string argument, used for `arg0` matching.
    fn arg0(&self) -> &str {
        match self {
            SignalPayload::InterfacesAdded { path, .. }
            | SignalPayload::InterfacesRemoved { path, .. } => path.as_str(),
            SignalPayload::PropertiesChanged { interface, .. } => interface,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Signal {
    pub sender: String,
    /// Object that emitted the signal.
    pub path: ObjectPath,
    pub interface: String,
    pub member: String,
    pub payload: SignalPayload,
}

/// Which signals a subscription receives. Unset fields match anything.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SignalRule {
    pub sender: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub path: Option<ObjectPath>,
    pub arg0: Option<String>,
}

impl SignalRule {
    pub fn matches(&self, signal: &Signal) -> bool {
        fn eq(rule: &Option<String>, v: &str) -> bool {
            rule.as_ref().map(|r| r == v).unwrap_or(true)
        }
        eq(&self.sender, &signal.sender)
            && eq(&self.interface, &signal.interface)
            && eq(&self.member, &signal.member)
            && self.path.as_ref().map(|p| *p == signal.path).unwrap_or(true)
            && eq(&self.arg0, signal.payload.arg0())
    }
}

/// Handle of an active signal subscription. Never zero.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SubscriptionToken(NonZeroU64);

impl SubscriptionToken {
    pub fn new(v: NonZeroU64) -> Self {
        Self(v)
    }

    pub fn get(&self) -> u64 {
        self.0.get()
    }
}

pub type SignalHandler = Box<dyn Fn(&Signal) + Send + Sync>;

/// Blocking RPC plus signal delivery.
///
/// Handlers passed to [`subscribe`](#tymethod.subscribe) run on a single dispatch thread, in
/// bus delivery order. They may issue calls on the bus but must not wait for other signals.
pub trait ObjectBus: Send + Sync {
    fn call(&self, call: &MethodCall) -> BusResult<Vec<Value>>;

    fn get_property(&self, service: &str, path: &ObjectPath, interface: &str, name: &str)
        -> BusResult<Value>;

    fn set_property(&self, service: &str, path: &ObjectPath, interface: &str, name: &str,
        value: Value) -> BusResult<()>;

    /// Path and interfaces of every live object owned by `service`.
    fn managed_objects(&self, service: &str) -> BusResult<ManagedObjects>;

    fn subscribe(&self, rule: SignalRule, handler: SignalHandler) -> BusResult<SubscriptionToken>;

    /// Unknown tokens are ignored.
    fn unsubscribe(&self, token: SubscriptionToken);
}

/// Bus handle bound to one remote service.
#[derive(Clone)]
pub(in crate) struct Session {
    bus: Arc<dyn ObjectBus>,
    service: Arc<str>,
}

assert_impl_all!(Session: Send, Sync);

impl Session {
    pub fn new(bus: Arc<dyn ObjectBus>, service: &str) -> Self {
        Self {
            bus,
            service: service.into(),
        }
    }

    pub fn call(&self, path: &ObjectPath, interface: &str, method: &str, args: Vec<Value>,
        timeout: Option<Duration>) -> BusResult<Vec<Value>>
    {
        log::trace!("call {} {}.{}", path, interface, method);
        self.bus.call(&MethodCall {
            service: self.service.to_string(),
            path: path.clone(),
            interface: interface.to_owned(),
            method: method.to_owned(),
            args,
            timeout,
        })
    }

    pub fn get(&self, path: &ObjectPath, interface: &str, name: &str) -> BusResult<Value> {
        self.bus.get_property(&self.service, path, interface, name)
    }

    pub fn get_bool(&self, path: &ObjectPath, interface: &str, name: &str) -> BusResult<bool> {
        let v = self.get(path, interface, name)?;
        v.as_bool()
            .ok_or_else(|| BusError::invalid_reply(format!("{} of {} is not a boolean: {:?}", name, path, v)))
    }

    pub fn set(&self, path: &ObjectPath, interface: &str, name: &str, value: Value) -> BusResult<()> {
        log::trace!("set {} {}.{} = {:?}", path, interface, name, value);
        self.bus.set_property(&self.service, path, interface, name, value)
    }

    pub fn managed_objects(&self) -> BusResult<ManagedObjects> {
        self.bus.managed_objects(&self.service)
    }

    /// Subscribes to `member` of `interface` emitted by this service.
    pub fn subscribe(&self, interface: &str, member: &str, path: Option<ObjectPath>,
        arg0: Option<&str>, handler: SignalHandler) -> BusResult<SubscriptionToken>
    {
        self.bus.subscribe(SignalRule {
            sender: Some(self.service.to_string()),
            interface: Some(interface.to_owned()),
            member: Some(member.to_owned()),
            path,
            arg0: arg0.map(|s| s.to_owned()),
        }, handler)
    }

    pub fn unsubscribe(&self, token: SubscriptionToken) {
        self.bus.unsubscribe(token)
    }
}
