//! Core value types shared by the session components.
//!
//! Identities, service descriptors, scan options and the externally visible
//! state enums all live here so the radio boundary and the session core can
//! agree on them without depending on each other.

use core::fmt;
use std::{collections::BTreeSet, sync::Arc};

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use smol_str::SmolStr;
use strum::{Display, IntoStaticStr};
use uuid::Uuid;

/// Opaque, stable identifier of a peripheral.
///
/// On BlueZ this is the textual MAC address, on other stacks it may be a
/// platform-assigned UUID. It is never interpreted by the session core.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(SmolStr);

impl DeviceId {
   pub fn new(id: impl Into<SmolStr>) -> Self {
      Self(id.into())
   }

   pub fn as_str(&self) -> &str {
      self.0.as_str()
   }
}

impl fmt::Display for DeviceId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(&self.0)
   }
}

impl From<&str> for DeviceId {
   fn from(id: &str) -> Self {
      Self::new(id)
   }
}

impl From<String> for DeviceId {
   fn from(id: String) -> Self {
      Self::new(id)
   }
}

/// A GATT service and the characteristics it exposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
   pub uuid: Uuid,
   pub characteristics: SmallVec<[Uuid; 4]>,
}

impl Service {
   pub fn new(uuid: Uuid, characteristics: impl IntoIterator<Item = Uuid>) -> Self {
      Self {
         uuid,
         characteristics: characteristics.into_iter().collect(),
      }
   }
}

/// Immutable result of a completed service discovery.
///
/// Cheap to clone; every waiter of a discovery receives the same allocation.
pub type ServiceList = Arc<[Service]>;

/// Options accepted by `start_scan`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanOptions {
   /// Re-emit advertisements for devices that are already known.
   pub allow_duplicates: bool,
   /// Restrict results to devices advertising at least one of these services.
   pub service_filter: BTreeSet<Uuid>,
}

impl ScanOptions {
   pub fn with_services(mut self, services: impl IntoIterator<Item = Uuid>) -> Self {
      self.service_filter.extend(services);
      self
   }

   pub const fn allow_duplicates(mut self, allow: bool) -> Self {
      self.allow_duplicates = allow;
      self
   }
}

/// Lifecycle of a single device connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr, Serialize)]
pub enum ConnectionState {
   Disconnected,
   Connecting,
   Connected,
   DiscoveringServices,
   Ready,
   Disconnecting,
}

impl ConnectionState {
   /// Whether the state holds (or is acquiring) a radio link.
   pub const fn is_active(self) -> bool {
      !matches!(self, Self::Disconnected)
   }
}

/// Scan controller state.
///
/// `Stopping` is the window between a stop request and the radio confirming
/// it; advertisements that arrive in it are still recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr, Serialize)]
pub enum ScanState {
   Idle,
   Scanning,
   Stopping,
}

/// Whether the radio can currently accept commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr, Serialize)]
pub enum Availability {
   Ready,
   PoweredOff,
   Unauthorized,
   Unsupported,
}

impl Availability {
   pub const fn is_ready(self) -> bool {
      matches!(self, Self::Ready)
   }
}
