//! Bluetooth Low Energy central-role session manager.
//!
//! A [`Session`] scans for peripherals, keeps a registry of what it has
//! seen, and drives one connection state machine per device through
//! connect, service discovery and disconnect. Radio stacks plug in through
//! the [`Radio`] trait; notifications leave through an [`EventBus`].

pub mod advertisement;
pub mod bluetooth;
pub mod config;
pub mod dbus;
pub mod error;
pub mod event;
pub mod session;
pub mod types;

pub use bluetooth::radio::{Radio, RadioCommand, RadioEvent, event_channel};
pub use config::Config;
pub use error::{Error, SessionError, SessionResult};
pub use event::{EventBus, EventQueue, SessionEvent};
pub use session::{
   connection::{ConnectionHandle, ConnectionInfo},
   manager::Session,
   registry::{DeviceEntry, DeviceFilter},
};
pub use types::{Availability, ConnectionState, DeviceId, ScanOptions, ScanState, Service};
