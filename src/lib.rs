//! Bluetooth Low Energy central-role client built on the [BlueZ](http://www.bluez.org/) object
//! tree.
//!
//! The host Bluetooth daemon exposes adapters, remote devices, GATT services and
//! characteristics as objects on an [object bus](bus/index.html). This crate keeps a live
//! local mirror of the objects under one adapter: devices appear and disappear as the daemon
//! reports them, their properties track change signals, and characteristics are re-enumerated
//! whenever the daemon says a device's services are resolved.
//!
//! All operations are blocking. Change signals are processed on the bus dispatch thread and
//! reported to the application as [`AdapterEvent`](central/enum.AdapterEvent.html)s via the
//! receiver returned when the adapter is initialized.
//!
//! # Example
//!
//! The following example discovers a heart rate monitor, connects to it and subscribes to
//! heart rate measurements.
//!
//! ```no_run
//! use bluez_mirror::bus::memory::MemoryBus;
//! use bluez_mirror::central::*;
//!
//! let bus = MemoryBus::bluez().unwrap();
//! let (adapter, events) = Adapter::initialize(bus).unwrap();
//!
//! let heart_rate = "180d".parse().unwrap();
//! let measurement = "2a37".parse().unwrap();
//! adapter.start_discovery(DiscoveryFilter::new().service(heart_rate)).unwrap();
//!
//! while let Ok(event) = events.recv() {
//!     match event {
//!         AdapterEvent::DeviceDiscovered { device } => {
//!             device.connect().unwrap();
//!             device.refresh_services().unwrap();
//!             device.subscribe(heart_rate, measurement, |_, value| {
//!                 println!("heart rate: {} bpm", value[1]);
//!             }).unwrap();
//!         }
//!         AdapterEvent::DeviceRemoved { device } => {
//!             println!("{} is gone", device.address());
//!         }
//!         _ => {}
//!     }
//! }
//! ```
//!
//! You can find a complete program in the `demos` directory.
#![deny(non_snake_case)]
#![deny(unused_must_use)]
#![warn(dead_code)]
#![warn(unused_imports)]

#[macro_use]
mod macros;

pub mod bus;
pub mod central;
pub mod error;
pub mod retry;
mod sync;
pub mod uuid;
mod util;

pub use error::{BestEffort, Error, ErrorKind};
pub use retry::RetryPolicy;
pub use sync::Receiver;
