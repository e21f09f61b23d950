use enumflags2::BitFlags;
use log::*;
use static_assertions::assert_impl_all;
use std::collections::BTreeMap;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::Context;
use super::notification::NotificationSubscription;
use super::service::Service;
use crate::bus::*;
use crate::error::{BestEffort, Error, ErrorKind};
use crate::util::lock;
use crate::uuid::Uuid;

#[derive(BitFlags, Copy, Clone, Debug, Eq, Hash, PartialEq)]
#[repr(u32)]
enum Property {
    Broadcast                       = 0x01,
    Read                            = 0x02,
    WriteWithoutResponse            = 0x04,
    Write                           = 0x08,
    Notify                          = 0x10,
    Indicate                        = 0x20,
    AuthenticatedSignedWrites       = 0x40,
    ExtendedProperties              = 0x80,
    ReliableWrite                   = 0x100,
    WritableAuxiliaries             = 0x200,
    EncryptRead                     = 0x400,
    EncryptWrite                    = 0x800,
    EncryptAuthenticatedRead        = 0x1000,
    EncryptAuthenticatedWrite       = 0x2000,
    SecureRead                      = 0x4000,
    SecureWrite                     = 0x8000,
    Authorize                       = 0x10000,
}

const FLAG_NAMES: [(&str, Property); 17] = [
    ("broadcast", Property::Broadcast),
    ("read", Property::Read),
    ("write-without-response", Property::WriteWithoutResponse),
    ("write", Property::Write),
    ("notify", Property::Notify),
    ("indicate", Property::Indicate),
    ("authenticated-signed-writes", Property::AuthenticatedSignedWrites),
    ("extended-properties", Property::ExtendedProperties),
    ("reliable-write", Property::ReliableWrite),
    ("writable-auxiliaries", Property::WritableAuxiliaries),
    ("encrypt-read", Property::EncryptRead),
    ("encrypt-write", Property::EncryptWrite),
    ("encrypt-authenticated-read", Property::EncryptAuthenticatedRead),
    ("encrypt-authenticated-write", Property::EncryptAuthenticatedWrite),
    ("secure-read", Property::SecureRead),
    ("secure-write", Property::SecureWrite),
    ("authorize", Property::Authorize),
];

impl Property {
    fn name(self) -> &'static str {
        FLAG_NAMES.iter()
            .find(|&&(_, p)| p == self)
            .map(|&(n, _)| n)
            .unwrap_or("?")
    }
}

/// Capability flags of a characteristic, as reported in its `Flags` property.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct Properties(BitFlags<Property>);

impl Properties {
    /// Parses BlueZ flag strings. Unknown strings are ignored.
    pub fn from_flags<S: AsRef<str>>(flags: &[S]) -> Self {
        let mut bits = 0;
        for flag in flags {
            match FLAG_NAMES.iter().find(|&&(n, _)| n == flag.as_ref()) {
                Some(&(_, p)) => bits |= p as u32,
                None => trace!("unknown characteristic flag '{}'", flag.as_ref()),
            }
        }
        Self(BitFlags::from_bits_truncate(bits))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether any kind of value write is permitted.
    pub fn can_write(&self) -> bool {
        self.is_write() || self.is_write_without_response()
    }

    /// Whether value updates can be pushed by the device.
    pub fn can_notify(&self) -> bool {
        self.is_notify() || self.is_indicate()
    }
}

macro_rules! properties {
    ($($(#[$attr:meta])* $f:ident => $e:ident,)*) => {
        impl Properties {
            $(
                $(#[$attr])*
                pub fn $f(&self) -> bool {
                    self.0.contains(Property::$e)
                }
            )*
        }
    };
}

properties!(
    #[doc="Characteristic can broadcast its value using a characteristic configuration descriptor."]
    is_broadcast => Broadcast,

    #[doc="The value can be read."]
    is_read => Read,

    #[doc="The value can be written without a response to indicate that the write succeeded."]
    is_write_without_response => WriteWithoutResponse,

    #[doc="The value can be written with a response to indicate that the write succeeded."]
    is_write => Write,

    #[doc="The device can notify value changes without the central acknowledging receipt."]
    is_notify => Notify,

    #[doc="The device can indicate value changes, with the central acknowledging receipt."]
    is_indicate => Indicate,

    is_authenticated_signed_writes => AuthenticatedSignedWrites,

    #[doc="The characteristic defines additional properties in the extended properties descriptor."]
    is_extended_properties => ExtendedProperties,

    is_reliable_write => ReliableWrite,
    is_writable_auxiliaries => WritableAuxiliaries,
    is_encrypt_read => EncryptRead,
    is_encrypt_write => EncryptWrite,
    is_encrypt_authenticated_read => EncryptAuthenticatedRead,
    is_encrypt_authenticated_write => EncryptAuthenticatedWrite,
    is_secure_read => SecureRead,
    is_secure_write => SecureWrite,

    #[doc="Access needs authorization by the device."]
    is_authorize => Authorize,
);

assert_impl_all!(Properties: Send, Sync);

impl fmt::Debug for Properties {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Properties")
            .field(&crate::util::BitFlagsDebug(self.0))
            .finish()
    }
}

impl fmt::Display for Properties {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("None");
        }
        crate::util::write_joined(f, self.0.iter(), ", ", |f, p| f.write_str(p.name()))
    }
}

/// Mirror of one remote GATT characteristic.
///
/// Cloning yields another handle to the same mirror. Value notifications stay enabled until
/// [`stop_notifications`](#method.stop_notifications) is called, the device disconnects or
/// its services are re-enumerated.
#[derive(Clone)]
pub struct Characteristic(Arc<Inner>);

assert_impl_all!(Characteristic: Send, Sync);

struct Inner {
    ctx: Arc<Context>,
    path: ObjectPath,
    device_path: ObjectPath,
    service_path: ObjectPath,
    service_id: Option<Uuid>,
    id: Uuid,
    properties: Properties,
    notification: Mutex<NotificationSubscription>,
    /// Set once the owning device stopped tracking this characteristic.
    detached: AtomicBool,
}

impl Characteristic {
    /// `None` if the object has no parseable `UUID`.
    pub(in crate) fn from_properties(ctx: &Arc<Context>, device_path: &ObjectPath, path: &ObjectPath,
        props: &PropertyMap, services: &BTreeMap<ObjectPath, Service>) -> Option<Self>
    {
        let id = props.get("UUID")?.as_str()?.parse().ok()?;
        let properties = props.get("Flags")
            .and_then(|v| v.as_str_array())
            .map(Properties::from_flags)
            .unwrap_or_else(|| Properties::from_flags::<&str>(&[]));
        let service_path = props.get("Service")
            .and_then(|v| v.as_path())
            .cloned()
            .unwrap_or_else(|| parent(path));
        let service_id = services.get(&service_path).map(|s| s.id());
        Some(Self(Arc::new(Inner {
            ctx: ctx.clone(),
            path: path.clone(),
            device_path: device_path.clone(),
            service_path,
            service_id,
            id,
            properties,
            notification: Mutex::new(NotificationSubscription::new(ctx.session.clone(), path.clone())),
            detached: AtomicBool::new(false),
        })))
    }

    pub fn path(&self) -> &ObjectPath {
        &self.0.path
    }

    pub fn device_path(&self) -> &ObjectPath {
        &self.0.device_path
    }

    pub fn service_path(&self) -> &ObjectPath {
        &self.0.service_path
    }

    /// UUID of the owning service, `None` if the service object wasn't seen during enumeration.
    pub fn service_id(&self) -> Option<Uuid> {
        self.0.service_id
    }

    pub fn id(&self) -> Uuid {
        self.0.id
    }

    pub fn properties(&self) -> Properties {
        self.0.properties
    }

    /// Whether this characteristic answers to `(service_id, id)`.
    pub(in crate) fn matches(&self, service_id: Uuid, id: Uuid) -> bool {
        self.0.id == id && self.0.service_id.map(|s| s == service_id).unwrap_or(true)
    }

    pub fn is_notifying(&self) -> bool {
        lock(&self.0.notification).is_active()
    }

    /// Reads the current value from the device.
    pub fn read(&self) -> Result<Vec<u8>, Error> {
        if !self.0.properties.is_read() {
            return Err(self.unsupported("reading"));
        }
        let reply = self.0.ctx.session.call(&self.0.path, GATT_CHARACTERISTIC_INTERFACE, "ReadValue",
                vec![Value::Dict(PropertyMap::new())], self.0.ctx.config.timeouts.io)
            .map_err(|e| Error::from_bus(ErrorKind::RemoteCallFailed,
                format!("couldn't read {}", self.0.path), &e))?;
        match reply.first().and_then(|v| v.as_bytes()) {
            Some(bytes) => {
                trace!("read {} bytes from {}", bytes.len(), self.0.path);
                Ok(bytes.to_vec())
            }
            None => Err(Error::new(ErrorKind::RemoteCallFailed,
                format!("malformed ReadValue reply from {}: {:?}", self.0.path, reply))),
        }
    }

    pub fn write(&self, value: &[u8]) -> Result<(), Error> {
        if !self.0.properties.can_write() {
            return Err(self.unsupported("writing"));
        }
        self.0.ctx.session.call(&self.0.path, GATT_CHARACTERISTIC_INTERFACE, "WriteValue",
                vec![Value::Bytes(value.to_vec()), Value::Dict(PropertyMap::new())],
                self.0.ctx.config.timeouts.io)
            .map_err(|e| Error::from_bus(ErrorKind::RemoteCallFailed,
                format!("couldn't write {}", self.0.path), &e))?;
        trace!("wrote {} bytes to {}", value.len(), self.0.path);
        Ok(())
    }

    /// Enables value notifications, delivering each new value to `callback` on the bus
    /// dispatch thread.
    ///
    /// Active notifications are stopped first. On failure nothing is left subscribed.
    pub fn start_notifications<F>(&self, callback: F) -> Result<(), Error>
        where F: Fn(&ObjectPath, &[u8]) + Send + Sync + 'static
    {
        if !self.0.properties.can_notify() {
            return Err(self.unsupported("notifications on"));
        }
        if self.is_detached() {
            return Err(self.stale());
        }
        if self.is_notifying() {
            if let BestEffort::Failed(e) = self.stop_notifications() {
                debug!("restarting notifications of {} after failed stop: {}", self.0.path, e);
            }
        }

        let mut sub = NotificationSubscription::new(self.0.ctx.session.clone(), self.0.path.clone());
        sub.enable(Box::new(callback))
            .map_err(|e| Error::from_bus(ErrorKind::NotificationEnableFailed,
                format!("couldn't subscribe to values of {}", self.0.path), &e))?;
        if let Err(e) = self.0.ctx.session.call(&self.0.path, GATT_CHARACTERISTIC_INTERFACE,
            "StartNotify", Vec::new(), self.0.ctx.config.timeouts.io)
        {
            // `sub` drops here and takes the bus subscription with it.
            return Err(Error::from_bus(ErrorKind::NotificationEnableFailed,
                format!("couldn't start notifications of {}", self.0.path), &e));
        }

        // `detach` raises the flag before taking the lock, so checking under the lock is enough.
        let old = {
            let mut current = lock(&self.0.notification);
            if self.is_detached() {
                None
            } else {
                Some(mem::replace(&mut *current, sub))
            }
        };
        let old = match old {
            Some(v) => v,
            None => return Err(self.stale()),
        };
        drop(old);
        debug!("notifications enabled for {} ({})", self.0.id, self.0.path);
        Ok(())
    }

    /// Disables value notifications.
    ///
    /// The local subscription is torn down whatever the outcome of the bus call.
    pub fn stop_notifications(&self) -> BestEffort {
        if !self.is_notifying() {
            return BestEffort::NotNeeded;
        }
        let r = self.0.ctx.session.call(&self.0.path, GATT_CHARACTERISTIC_INTERFACE, "StopNotify",
                Vec::new(), self.0.ctx.config.timeouts.io)
            .map(|_| ())
            .map_err(|e| Error::from_bus(ErrorKind::RemoteCallFailed,
                format!("couldn't stop notifications of {}", self.0.path), &e));
        if let Err(e) = &r {
            warn!("{}", e);
        }
        lock(&self.0.notification).disable();
        BestEffort::from_call(r)
    }

    /// Drops the local value subscription without telling the device. The characteristic
    /// refuses new subscriptions afterwards.
    pub(in crate) fn detach(&self) {
        self.0.detached.store(true, Ordering::SeqCst);
        lock(&self.0.notification).disable();
    }

    fn is_detached(&self) -> bool {
        self.0.detached.load(Ordering::SeqCst)
    }

    fn stale(&self) -> Error {
        Error::new(ErrorKind::NotificationEnableFailed,
            format!("{} is no longer tracked by its device", self.0.path))
    }

    fn unsupported(&self, what: &str) -> Error {
        Error::new(ErrorKind::UnsupportedOperation,
            format!("{} {} is not supported (flags: {})", what, self.0.id, self.0.properties))
    }
}

impl fmt::Debug for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Characteristic")
            .field("path", &self.0.path)
            .field("id", &self.0.id)
            .field("service_id", &self.0.service_id)
            .field("properties", &self.0.properties)
            .finish()
    }
}

fn parent(path: &ObjectPath) -> ObjectPath {
    match path.as_str().rfind('/') {
        Some(0) | None => ObjectPath::root(),
        Some(i) => ObjectPath::new(&path.as_str()[..i]),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bus::memory::*;
    use crate::central::testing;
    use hex_literal::hex;

    struct Fixture {
        bus: Arc<MemoryBus>,
        ctx: Arc<Context>,
        dev: ObjectPath,
        svc: ObjectPath,
        services: BTreeMap<ObjectPath, Service>,
    }

    impl Fixture {
        fn new() -> Self {
            let bus = MemoryBus::bluez().unwrap();
            let adapter = ObjectPath::from("/org/bluez/hci0");
            let dev = device_path(&adapter, "AA:BB:CC:DD:EE:FF");
            let svc = dev.child("service000c");
            bus.add_object(&adapter, adapter_interfaces("00:11:22:33:44:55", true));
            bus.add_object(&dev, device_interfaces(&adapter, "AA:BB:CC:DD:EE:FF", None, &["180d"]));
            let svc_interfaces = service_interfaces(&dev, "180d");
            bus.add_object(&svc, svc_interfaces.clone());
            let mut services = BTreeMap::new();
            let service = Service::from_properties(&svc, &svc_interfaces[GATT_SERVICE_INTERFACE]).unwrap();
            services.insert(svc.clone(), service);
            let (ctx, _events) = testing::context(&bus);
            Self { bus, ctx, dev, svc, services }
        }

        fn characteristic(&self, name: &str, uuid: &str, flags: &[&str]) -> Characteristic {
            let path = self.svc.child(name);
            let interfaces = characteristic_interfaces(&self.svc, uuid, flags);
            self.bus.add_object(&path, interfaces.clone());
            Characteristic::from_properties(&self.ctx, &self.dev, &path,
                &interfaces[GATT_CHARACTERISTIC_INTERFACE], &self.services).unwrap()
        }
    }

    #[test]
    fn flags_parse_and_display() {
        let p = Properties::from_flags(&["read", "notify", "frobnicate", "write-without-response"]);
        assert!(p.is_read());
        assert!(p.is_notify());
        assert!(p.is_write_without_response());
        assert!(!p.is_write());
        assert!(p.can_write());
        assert_eq!(p.to_string(), "read, write-without-response, notify");
        assert_eq!(Properties::from_flags::<&str>(&[]).to_string(), "None");
    }

    #[test]
    fn resolves_owning_service() {
        let f = Fixture::new();
        let c = f.characteristic("char000d", "2a37", &["notify"]);
        assert_eq!(c.service_path(), &f.svc);
        assert_eq!(c.service_id(), Some(Uuid::from_u16(0x180d)));
        assert!(c.matches(Uuid::from_u16(0x180d), Uuid::from_u16(0x2a37)));
        assert!(!c.matches(Uuid::from_u16(0x180f), Uuid::from_u16(0x2a37)));
        assert_eq!(parent(c.path()), f.svc);
    }

    #[test]
    fn write_on_read_only_makes_no_call() {
        let f = Fixture::new();
        let c = f.characteristic("char000d", "2a38", &["read"]);
        f.bus.clear_calls();
        let err = c.write(&[1]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
        assert_eq!(f.bus.call_count("WriteValue"), 0);
        assert!(f.bus.calls().is_empty());
    }

    #[test]
    fn write_then_read_round_trip() {
        let f = Fixture::new();
        let c = f.characteristic("char0010", "2a39", &["read", "write"]);
        c.write(&hex!("0a0b0c")).unwrap();
        assert_eq!(c.read().unwrap(), hex!("0a0b0c").to_vec());
        assert_eq!(f.bus.call_count("WriteValue"), 1);
        assert_eq!(f.bus.call_count("ReadValue"), 1);
    }

    #[test]
    fn read_failure_is_remote_call_failed() {
        let f = Fixture::new();
        let c = f.characteristic("char0010", "2a39", &["read"]);
        f.bus.on_method(GATT_CHARACTERISTIC_INTERFACE, "ReadValue",
            |_, _| Err(BusError::new("org.bluez.Error.NotPermitted", "Read not permitted")));
        let err = c.read().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RemoteCallFailed);
        assert!(err.description().contains("Read not permitted"));
    }

    #[test]
    fn notifications_deliver_values() {
        let f = Fixture::new();
        let c = f.characteristic("char000d", "2a37", &["notify"]);
        let values = Arc::new(Mutex::new(Vec::new()));
        let v = values.clone();
        c.start_notifications(move |_, bytes| v.lock().unwrap().push(bytes.to_vec())).unwrap();
        assert!(c.is_notifying());
        assert_eq!(f.bus.property(c.path(), GATT_CHARACTERISTIC_INTERFACE, "Notifying"), Some(Value::Bool(true)));

        f.bus.update_property(c.path(), GATT_CHARACTERISTIC_INTERFACE, "Value", hex!("0648").to_vec()).unwrap();
        f.bus.flush();
        assert_eq!(*values.lock().unwrap(), vec![hex!("0648").to_vec()]);

        assert!(matches!(c.stop_notifications(), BestEffort::Completed));
        assert!(!c.is_notifying());
        assert_eq!(f.bus.subscription_count(), 0);
        assert!(matches!(c.stop_notifications(), BestEffort::NotNeeded));
    }

    #[test]
    fn failed_start_leaves_nothing_subscribed() {
        let f = Fixture::new();
        let c = f.characteristic("char000d", "2a37", &["notify"]);
        f.bus.on_method(GATT_CHARACTERISTIC_INTERFACE, "StartNotify",
            |_, _| Err(BusError::new("org.bluez.Error.NotPermitted", "Notify not permitted")));
        let before = f.bus.subscription_count();
        let err = c.start_notifications(|_, _| {}).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotificationEnableFailed);
        assert!(!c.is_notifying());
        assert_eq!(f.bus.subscription_count(), before);
    }

    #[test]
    fn restart_replaces_subscription() {
        let f = Fixture::new();
        let c = f.characteristic("char000d", "2a37", &["indicate"]);
        c.start_notifications(|_, _| {}).unwrap();
        c.start_notifications(|_, _| {}).unwrap();
        assert_eq!(f.bus.subscription_count(), 1);
        assert_eq!(f.bus.call_count("StopNotify"), 1);
        assert_eq!(f.bus.call_count("StartNotify"), 2);
    }

    #[test]
    fn failed_stop_still_tears_down() {
        let f = Fixture::new();
        let c = f.characteristic("char000d", "2a37", &["notify"]);
        c.start_notifications(|_, _| {}).unwrap();
        f.bus.on_method(GATT_CHARACTERISTIC_INTERFACE, "StopNotify",
            |_, _| Err(BusError::failed("gone")));
        let r = c.stop_notifications();
        assert!(r.is_failed());
        assert!(!c.is_notifying());
        assert_eq!(f.bus.subscription_count(), 0);
    }

    #[test]
    fn detach_during_start_wins() {
        let f = Fixture::new();
        let c = f.characteristic("char000d", "2a37", &["notify"]);
        let racing = c.clone();
        f.bus.on_method(GATT_CHARACTERISTIC_INTERFACE, "StartNotify", move |bus, call| {
            racing.detach();
            bus.update_property(&call.path, GATT_CHARACTERISTIC_INTERFACE, "Notifying", true)?;
            Ok(Vec::new())
        });
        let err = c.start_notifications(|_, _| {}).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotificationEnableFailed);
        assert!(!c.is_notifying());
        assert_eq!(f.bus.subscription_count(), 0);

        f.bus.clear_calls();
        assert_eq!(c.start_notifications(|_, _| {}).unwrap_err().kind(), ErrorKind::NotificationEnableFailed);
        assert_eq!(f.bus.call_count("StartNotify"), 0);
    }

    #[test]
    fn notify_needs_capability() {
        let f = Fixture::new();
        let c = f.characteristic("char0010", "2a39", &["read"]);
        let err = c.start_notifications(|_, _| {}).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
        assert_eq!(f.bus.subscription_count(), 0);
    }
}
