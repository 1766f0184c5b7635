//! Boundary with the platform radio stack.
//!
//! The session never talks to a Bluetooth stack directly. It issues
//! fire-and-forget commands through a [`Radio`] implementation and learns
//! about their outcome later from [`RadioEvent`]s pushed into the channel
//! returned by [`event_channel`].

use smol_str::SmolStr;
use strum::{Display, IntoStaticStr};
use tokio::sync::mpsc;

use crate::{
   advertisement::AdvertisementData,
   error::SessionError,
   types::{Availability, DeviceId, ScanOptions, Service},
};

/// Buffer size of the radio event channel
pub const EVENT_BUFFER_SIZE: usize = 1000;

pub type RadioEventSender = mpsc::Sender<RadioEvent>;
pub type RadioEventReceiver = mpsc::Receiver<RadioEvent>;

/// Creates the channel a radio backend pushes its events into.
pub fn event_channel() -> (RadioEventSender, RadioEventReceiver) {
   mpsc::channel(EVENT_BUFFER_SIZE)
}

/// Commands the session issues to the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioCommand {
   StartScan(ScanOptions),
   StopScan,
   Connect(DeviceId),
   Disconnect(DeviceId),
   DiscoverServices(DeviceId),
}

impl RadioCommand {
   pub const fn operation(&self) -> Operation {
      match self {
         Self::StartScan(_) => Operation::StartScan,
         Self::StopScan => Operation::StopScan,
         Self::Connect(_) => Operation::Connect,
         Self::Disconnect(_) => Operation::Disconnect,
         Self::DiscoverServices(_) => Operation::DiscoverServices,
      }
   }

   pub const fn device(&self) -> Option<&DeviceId> {
      match self {
         Self::StartScan(_) | Self::StopScan => None,
         Self::Connect(id) | Self::Disconnect(id) | Self::DiscoverServices(id) => Some(id),
      }
   }
}

/// Radio operation kinds, used to tag failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
pub enum Operation {
   StartScan,
   StopScan,
   Connect,
   Disconnect,
   DiscoverServices,
}

/// Link state as reported by the radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum LinkState {
   Connected,
   Disconnected,
}

/// Why the radio failed an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
   /// Radio is off or the process lacks permission.
   Unavailable,
   /// The peer answered with a GATT/ATT error.
   Gatt(SmolStr),
   /// Anything else the stack reported.
   Internal(SmolStr),
}

impl FailureReason {
   pub fn internal(reason: impl Into<SmolStr>) -> Self {
      Self::Internal(reason.into())
   }

   pub fn describe(&self) -> SmolStr {
      match self {
         Self::Unavailable => SmolStr::new_static("radio unavailable"),
         Self::Gatt(reason) | Self::Internal(reason) => reason.clone(),
      }
   }
}

impl From<FailureReason> for SessionError {
   fn from(reason: FailureReason) -> Self {
      match reason {
         FailureReason::Unavailable => Self::RadioUnavailable,
         FailureReason::Gatt(reason) | FailureReason::Internal(reason) => {
            Self::RadioInternalError(reason)
         },
      }
   }
}

/// Events pushed by the radio, in the order they happened.
#[derive(Debug, Clone, PartialEq)]
pub enum RadioEvent {
   AdvertisementSeen {
      id: DeviceId,
      rssi: Option<i16>,
      data: AdvertisementData,
      /// Undecoded AD structures, when the stack exposes them.
      raw: Option<Vec<u8>>,
   },
   ConnectionStateChanged {
      id: DeviceId,
      state: LinkState,
   },
   ServicesDiscovered {
      id: DeviceId,
      services: Vec<Service>,
   },
   /// The peer signalled that its GATT database changed.
   ServicesInvalidated { id: DeviceId },
   OperationFailed {
      id: Option<DeviceId>,
      operation: Operation,
      reason: FailureReason,
   },
   /// Scanning ended, either confirming a stop or on the radio's own accord.
   ScanStopped,
   AvailabilityChanged(Availability),
}

impl RadioEvent {
   /// Identity the event is about, `None` for scan- and radio-level events.
   pub fn device(&self) -> Option<&DeviceId> {
      match self {
         Self::ConnectionStateChanged { id, .. }
         | Self::ServicesDiscovered { id, .. }
         | Self::ServicesInvalidated { id } => Some(id),
         Self::OperationFailed { id, .. } => id.as_ref(),
         Self::AdvertisementSeen { .. } | Self::ScanStopped | Self::AvailabilityChanged(_) => None,
      }
   }
}

/// A platform radio stack.
///
/// Every command returns as soon as it has been handed to the stack; the
/// outcome arrives later as a [`RadioEvent`]. An `Err` means the command
/// could not even be issued.
pub trait Radio: Send + 'static {
   /// Current availability of the radio.
   fn availability(&self) -> Availability;

   fn start_scan(&mut self, options: &ScanOptions) -> Result<(), FailureReason>;

   fn stop_scan(&mut self) -> Result<(), FailureReason>;

   fn connect(&mut self, id: &DeviceId) -> Result<(), FailureReason>;

   fn disconnect(&mut self, id: &DeviceId) -> Result<(), FailureReason>;

   fn discover_services(&mut self, id: &DeviceId) -> Result<(), FailureReason>;

   /// Issues a command through the matching method.
   fn execute(&mut self, command: &RadioCommand) -> Result<(), FailureReason> {
      match command {
         RadioCommand::StartScan(options) => self.start_scan(options),
         RadioCommand::StopScan => self.stop_scan(),
         RadioCommand::Connect(id) => self.connect(id),
         RadioCommand::Disconnect(id) => self.disconnect(id),
         RadioCommand::DiscoverServices(id) => self.discover_services(id),
      }
   }
}
