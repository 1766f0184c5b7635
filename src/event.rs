//! Notifications surfaced by the session.
//!
//! Components report discoveries and state changes as [`SessionEvent`]s
//! through an [`EventBus`]. [`EventQueue`] is the stock bus: a lock-free
//! queue that a single consumer drains asynchronously.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use serde_json::json;
use tokio::{sync::Notify, time};

use crate::{
   advertisement::AdvertisementRecord,
   error::SessionError,
   types::{Availability, ConnectionState, DeviceId, ScanState, ServiceList},
};

/// Events that can be emitted by the session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
   ScanStateChanged(ScanState),
   DeviceDiscovered(AdvertisementRecord),
   /// Advertisement from an already known device; only with `allow_duplicates`.
   AdvertisementUpdated(AdvertisementRecord),
   DevicesExpired(Vec<DeviceId>),
   ConnectionStateChanged {
      id: DeviceId,
      state: ConnectionState,
   },
   ServicesDiscovered {
      id: DeviceId,
      services: ServiceList,
   },
   LinkLost(DeviceId),
   OperationFailed {
      id: DeviceId,
      error: SessionError,
   },
   AvailabilityChanged(Availability),
}

impl SessionEvent {
   /// Short signal-style name of the event.
   pub const fn name(&self) -> &'static str {
      match self {
         Self::ScanStateChanged(_) => "scan_state_updated",
         Self::DeviceDiscovered(_) => "device_discovered",
         Self::AdvertisementUpdated(_) => "advertisement_updated",
         Self::DevicesExpired(_) => "devices_expired",
         Self::ConnectionStateChanged { .. } => "connection_state_changed",
         Self::ServicesDiscovered { .. } => "services_discovered",
         Self::LinkLost(_) => "link_lost",
         Self::OperationFailed { .. } => "operation_failed",
         Self::AvailabilityChanged(_) => "availability_changed",
      }
   }

   pub fn to_json(&self) -> serde_json::Value {
      match self {
         Self::ScanStateChanged(state) => json!({ "state": state }),
         Self::DeviceDiscovered(record) | Self::AdvertisementUpdated(record) => record.to_json(),
         Self::DevicesExpired(ids) => json!({ "ids": ids }),
         Self::ConnectionStateChanged { id, state } => json!({ "id": id, "state": state }),
         Self::ServicesDiscovered { id, services } => json!({ "id": id, "services": &**services }),
         Self::LinkLost(id) => json!({ "id": id }),
         Self::OperationFailed { id, error } => json!({ "id": id, "error": error.to_string() }),
         Self::AvailabilityChanged(availability) => json!({ "availability": availability }),
      }
   }
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, event: SessionEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;

/// Queue-backed event bus with a single asynchronous consumer.
#[derive(Default)]
pub struct EventQueue {
   queue: SegQueue<SessionEvent>,
   notifier: Notify,
}

impl EventQueue {
   pub fn new() -> Arc<Self> {
      Arc::new(Self::default())
   }

   pub fn try_recv(&self) -> Option<SessionEvent> {
      self.queue.pop()
   }

   /// Drains everything queued so far.
   pub fn drain(&self) -> Vec<SessionEvent> {
      std::iter::from_fn(|| self.queue.pop()).collect()
   }

   /// Waits for the next event. Returns `None` once every other handle to
   /// the queue (i.e. the session's) has been dropped and the queue is empty.
   pub async fn recv(self: &Arc<Self>) -> Option<SessionEvent> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }
}

impl EventBus for EventQueue {
   fn emit(&self, event: SessionEvent) {
      self.queue.push(event);
      self.notifier.notify_waiters();
   }
}
