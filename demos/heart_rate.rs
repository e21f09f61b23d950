//! Discovers a heart rate monitor, reads its body sensor location and prints heart rate
//! measurements until the monitor goes away.
//!
//! The monitor is simulated on an in-process bus that behaves like the BlueZ daemon, so the
//! program runs without Bluetooth hardware.
use anyhow::*;
use log::*;
use macaddr::MacAddr6;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bluez_mirror::bus::memory::*;
use bluez_mirror::bus::*;
use bluez_mirror::central::*;
use bluez_mirror::uuid::Uuid;
use bluez_mirror::BestEffort;

const HEART_RATE_SERVICE: &str = "180d";
const MEASUREMENT: &str = "2a37";
const BODY_SENSOR_LOCATION: &str = "2a38";

/// Fake monitor: adapter, device and the heart rate service objects.
struct Monitor {
    bus: Arc<MemoryBus>,
    adapter: ObjectPath,
    device: ObjectPath,
    measurement: ObjectPath,
    address: String,
}

impl Monitor {
    fn new(bus: Arc<MemoryBus>, address: MacAddr6) -> Self {
        let adapter = ObjectPath::from("/org/bluez/hci0");
        let address = address.to_string().to_uppercase();
        let device = device_path(&adapter, &address);
        let measurement = device.child("service000c").child("char000d");
        bus.add_object(&adapter, adapter_interfaces("00:1A:7D:DA:71:13", false));

        // The daemon resolves services shortly after the link is up.
        bus.on_method(DEVICE_INTERFACE, "Connect", |bus, call| {
            bus.update_property(&call.path, DEVICE_INTERFACE, "Connected", true)?;
            thread::sleep(Duration::from_millis(200));
            bus.update_property(&call.path, DEVICE_INTERFACE, "ServicesResolved", true)?;
            std::result::Result::Ok(Vec::new())
        });

        Self {
            bus,
            adapter,
            device,
            measurement,
            address,
        }
    }

    fn appear(&self) {
        let service = self.device.child("service000c");
        let location = service.child("char0010");
        self.bus.add_object(&self.device, device_interfaces(&self.adapter, &self.address,
            Some("Polar H10"), &[HEART_RATE_SERVICE]));
        self.bus.add_object(&service, service_interfaces(&self.device, HEART_RATE_SERVICE));
        self.bus.add_object(&self.measurement,
            characteristic_interfaces(&service, MEASUREMENT, &["notify"]));
        let mut location_char = characteristic_interfaces(&service, BODY_SENSOR_LOCATION, &["read"]);
        if let Some(props) = location_char.get_mut(GATT_CHARACTERISTIC_INTERFACE) {
            props.insert("Value".into(), Value::Bytes(vec![1]));
        }
        self.bus.add_object(&location, location_char);
    }

    fn beat(self: Arc<Self>, count: u32, interval: Duration) {
        thread::spawn(move || {
            for i in 0..count {
                thread::sleep(interval);
                // 16-bit format flag set on every other measurement.
                let bpm = 62 + (i % 7) as u16;
                let value = if i % 2 == 0 {
                    vec![0x00, bpm as u8]
                } else {
                    let [lo, hi] = bpm.to_le_bytes();
                    vec![0x01, lo, hi]
                };
                if let Err(e) = self.bus.update_property(&self.measurement,
                    GATT_CHARACTERISTIC_INTERFACE, "Value", value)
                {
                    error!("couldn't push measurement: {}", e);
                    return;
                }
            }
            info!("monitor out of range");
            let _ = self.bus.update_property(&self.device, DEVICE_INTERFACE, "ServicesResolved", false);
            let _ = self.bus.update_property(&self.device, DEVICE_INTERFACE, "Connected", false);
            self.bus.remove_object(&self.device);
        });
    }
}

fn heart_rate(value: &[u8]) -> Option<u16> {
    let flags = *value.first()?;
    if flags & 1 == 0 {
        value.get(1).map(|&v| v as u16)
    } else {
        Some(u16::from_le_bytes([*value.get(1)?, *value.get(2)?]))
    }
}

fn body_location(value: &[u8]) -> &'static str {
    match value.first() {
        Some(0) => "other",
        Some(1) => "chest",
        Some(2) => "wrist",
        Some(3) => "finger",
        Some(4) => "hand",
        Some(5) => "ear lobe",
        Some(6) => "foot",
        _ => "unknown",
    }
}

pub fn main() -> Result<()> {
    env_logger::from_env(env_logger::Env::default()
        .default_filter_or("info")).init();

    use clap::Arg;
    let clapp = clap::Command::new("Heart Rate Monitor Reader")
        .about("Prints measurements of a simulated BLE heart rate monitor")
        .arg(Arg::new("address")
            .short('a')
            .long("address")
            .help("Address of the simulated monitor")
            .takes_value(true)
            .default_value("C8:0F:10:A4:5B:21"))
        .arg(Arg::new("count")
            .short('n')
            .long("count")
            .help("Number of measurements the monitor sends before going out of range")
            .takes_value(true)
            .default_value("5"))
        .arg(Arg::new("interval")
            .long("interval")
            .help("Milliseconds between measurements")
            .takes_value(true)
            .default_value("500"));
    let matches = clapp.get_matches();

    let address = matches.value_of("address").unwrap_or_default();
    let address = address.parse::<MacAddr6>()
        .map_err(|_| anyhow!("invalid 'address' argument: {}", address))?;
    let count = matches.value_of("count").unwrap_or_default().parse::<u32>()
        .context("invalid 'count' argument")?;
    let interval = matches.value_of("interval").unwrap_or_default().parse::<u64>()
        .map(Duration::from_millis)
        .context("invalid 'interval' argument")?;

    let service_id: Uuid = HEART_RATE_SERVICE.parse()?;
    let measurement_id: Uuid = MEASUREMENT.parse()?;
    let location_id: Uuid = BODY_SENSOR_LOCATION.parse()?;

    let bus = MemoryBus::bluez()?;
    let monitor = Arc::new(Monitor::new(bus.clone(), address));

    let (adapter, events) = Adapter::initialize(bus)?;
    adapter.start_discovery(DiscoveryFilter::new().service(service_id))?;
    println!("Discovering heart rate monitors...");
    monitor.appear();

    let mut subscribed = false;
    for event in events.iter() {
        debug!("new event: {:#?}", event);
        match event {
            AdapterEvent::DeviceDiscovered { device } => {
                info!("connecting to {} ({})", device.name(), device.address());
                if let BestEffort::Failed(e) = adapter.stop_discovery() {
                    warn!("couldn't stop discovery: {}", e);
                }
                device.connect()?;
            }
            AdapterEvent::ServicesResolved { device, characteristics } => {
                info!("{} has {} characteristics", device.address(), characteristics);
                if subscribed {
                    continue;
                }
                let location = device.read(service_id, location_id)?;
                debug!("body sensor location: {}", hex::encode(&location));
                println!("{} worn on the {}", device.name(), body_location(&location));

                device.subscribe(service_id, measurement_id, |path, value| {
                    debug!("{}: {}", path, hex::encode(value));
                    match heart_rate(value) {
                        Some(bpm) => println!("heart rate: {} bpm", bpm),
                        None => warn!("malformed measurement: {}", hex::encode(value)),
                    }
                })?;
                subscribed = true;
                monitor.clone().beat(count, interval);
            }
            AdapterEvent::ConnectionChanged { device, connected } => {
                info!("{} {}", device.address(), if connected { "connected" } else { "disconnected" });
            }
            AdapterEvent::DeviceRemoved { device } => {
                println!("{} is gone", device.name());
                break;
            }
            AdapterEvent::PoweredChanged { powered } => {
                info!("adapter powered: {}", powered);
            }
            _ => {}
        }
    }

    Ok(())
}
