use log::*;

use crate::bus::*;

/// Receives the characteristic path and the new value.
pub type ValueCallback = Box<dyn Fn(&ObjectPath, &[u8]) + Send + Sync>;

/// Bridge from `PropertiesChanged` signals of one characteristic to a value callback.
///
/// Inert until enabled. Holds a bus subscription token exactly while active; the callback is
/// owned by the bus subscription and released with it.
pub(in crate) struct NotificationSubscription {
    session: Session,
    path: ObjectPath,
    token: Option<SubscriptionToken>,
}

impl NotificationSubscription {
    pub fn new(session: Session, path: ObjectPath) -> Self {
        Self {
            session,
            path,
            token: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.token.is_some()
    }

    pub fn enable(&mut self, callback: ValueCallback) -> BusResult<()> {
        if self.token.is_some() {
            return Err(BusError::new("org.bluez.Error.InProgress",
                format!("{} already has a value subscription", self.path)));
        }
        let path = self.path.clone();
        let token = self.session.subscribe(
            PROPERTIES_INTERFACE,
            PROPERTIES_CHANGED,
            Some(self.path.clone()),
            Some(GATT_CHARACTERISTIC_INTERFACE),
            Box::new(move |signal: &Signal| deliver(&path, &callback, signal)))?;
        debug!("value subscription {} for {}", token.get(), self.path);
        self.token = Some(token);
        Ok(())
    }

    pub fn disable(&mut self) {
        if let Some(token) = self.token.take() {
            debug!("dropping value subscription {} for {}", token.get(), self.path);
            self.session.unsubscribe(token);
        }
    }
}

impl Drop for NotificationSubscription {
    fn drop(&mut self) {
        self.disable();
    }
}

fn deliver(path: &ObjectPath, callback: &ValueCallback, signal: &Signal) {
    let changed = match &signal.payload {
        SignalPayload::PropertiesChanged { interface, changed, .. }
            if interface == GATT_CHARACTERISTIC_INTERFACE => changed,
        _ => return,
    };
    if let Some(value) = changed.get("Value") {
        match value.as_bytes() {
            Some(bytes) => callback(path, bytes),
            None => warn!("ignoring non-byte value notification from {}: {:?}", path, value),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bus::memory::*;
    use std::sync::{Arc, Mutex};

    fn setup() -> (Arc<MemoryBus>, Session, ObjectPath) {
        let bus = MemoryBus::bluez().unwrap();
        let adapter = ObjectPath::from("/org/bluez/hci0");
        let dev = device_path(&adapter, "AA:BB:CC:DD:EE:FF");
        let svc = dev.child("service000c");
        let chr = svc.child("char000d");
        bus.add_object(&adapter, adapter_interfaces("00:11:22:33:44:55", true));
        bus.add_object(&dev, device_interfaces(&adapter, "AA:BB:CC:DD:EE:FF", None, &[]));
        bus.add_object(&svc, service_interfaces(&dev, "180d"));
        bus.add_object(&chr, characteristic_interfaces(&svc, "2a37", &["notify"]));
        let session = Session::new(bus.clone(), BLUEZ_SERVICE);
        (bus, session, chr)
    }

    fn recorder() -> (ValueCallback, Arc<Mutex<Vec<Vec<u8>>>>) {
        let values = Arc::new(Mutex::new(Vec::new()));
        let v = values.clone();
        (Box::new(move |_: &ObjectPath, bytes: &[u8]| v.lock().unwrap().push(bytes.to_vec())), values)
    }

    #[test]
    fn only_value_changes_reach_callback() {
        let (bus, session, chr) = setup();
        let mut sub = NotificationSubscription::new(session, chr.clone());
        assert!(!sub.is_active());
        let (callback, values) = recorder();
        sub.enable(callback).unwrap();
        assert!(sub.is_active());

        bus.update_property(&chr, GATT_CHARACTERISTIC_INTERFACE, "Notifying", true).unwrap();
        bus.update_property(&chr, GATT_CHARACTERISTIC_INTERFACE, "Value", vec![0x06u8, 0x48]).unwrap();
        bus.update_property(&chr, GATT_CHARACTERISTIC_INTERFACE, "Value", vec![0x06u8, 0x49]).unwrap();
        bus.flush();

        assert_eq!(*values.lock().unwrap(), vec![vec![0x06, 0x48], vec![0x06, 0x49]]);
    }

    #[test]
    fn enable_twice_fails() {
        let (_bus, session, chr) = setup();
        let mut sub = NotificationSubscription::new(session, chr);
        sub.enable(recorder().0).unwrap();
        assert!(sub.enable(recorder().0).is_err());
        assert!(sub.is_active());
    }

    #[test]
    fn disable_and_drop_release_the_bus_subscription() {
        let (bus, session, chr) = setup();
        let mut sub = NotificationSubscription::new(session.clone(), chr.clone());
        let (callback, values) = recorder();
        sub.enable(callback).unwrap();
        assert_eq!(bus.subscription_count(), 1);

        sub.disable();
        sub.disable();
        assert!(!sub.is_active());
        assert_eq!(bus.subscription_count(), 0);
        bus.update_property(&chr, GATT_CHARACTERISTIC_INTERFACE, "Value", vec![1u8]).unwrap();
        bus.flush();
        assert!(values.lock().unwrap().is_empty());

        let mut sub = NotificationSubscription::new(session, chr);
        sub.enable(recorder().0).unwrap();
        drop(sub);
        assert_eq!(bus.subscription_count(), 0);
    }
}
