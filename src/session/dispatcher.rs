//! Routing of radio events into the session components.
//!
//! Runs inside the session actor, so events are handled strictly one at a
//! time and in arrival order. Events nobody can handle, typically late
//! events for a connection that has since been released, are logged and
//! dropped, as are advertisements whose raw payload does not decode.

use std::collections::HashMap;

use log::{debug, info, warn};

use crate::{
   advertisement::{AdvertisementData, AdvertisementRecord},
   bluetooth::radio::{Operation, RadioEvent},
   event::SessionEvent,
   session::{
      Effects, connection::ConnectionMachine, registry::DeviceRegistry, scan::ScanController,
   },
   types::DeviceId,
};

/// Components an event can be delivered to.
pub struct Targets<'a> {
   pub scan: &'a mut ScanController,
   pub registry: &'a mut DeviceRegistry,
   pub connections: &'a mut HashMap<DeviceId, ConnectionMachine>,
}

#[derive(Debug, Default)]
pub struct EventDispatcher {
   dropped: u64,
}

impl EventDispatcher {
   pub fn new() -> Self {
      Self::default()
   }

   /// Number of events dropped as unroutable or malformed.
   pub const fn dropped(&self) -> u64 {
      self.dropped
   }

   pub fn dispatch(&mut self, event: RadioEvent, targets: Targets<'_>, fx: &mut Effects) {
      let Targets {
         scan,
         registry,
         connections,
      } = targets;

      match event {
         RadioEvent::AdvertisementSeen {
            id,
            rssi,
            mut data,
            raw,
         } => {
            if let Some(payload) = &raw {
               match AdvertisementData::parse(payload) {
                  Ok(decoded) => data.merge(decoded),
                  Err(e) => {
                     warn!("Dropping malformed advertisement from {id}: {e}");
                     self.dropped += 1;
                     return;
                  },
               }
            }
            let record = AdvertisementRecord::new(id, rssi, data).with_raw(raw);
            scan.on_advertisement(registry, record, fx);
         },
         RadioEvent::ScanStopped => scan.on_scan_stopped(fx),
         RadioEvent::AvailabilityChanged(availability) => {
            info!("Radio is now {availability}");
            if !availability.is_ready() {
               scan.on_radio_lost(fx);
            }
            fx.emit(SessionEvent::AvailabilityChanged(availability));
         },
         RadioEvent::OperationFailed {
            id: None,
            operation,
            reason,
         } => match operation {
            Operation::StartScan => scan.on_start_failed(&reason, fx),
            Operation::StopScan => scan.on_stop_failed(&reason, fx),
            other => {
               warn!("Dropping {other} failure without a device: {}", reason.describe());
               self.dropped += 1;
            },
         },
         RadioEvent::OperationFailed {
            id: Some(id),
            operation,
            reason,
         } => {
            if let Some(machine) = self.machine(connections, &id, "operation failure") {
               machine.on_operation_failed(operation, reason, fx);
            }
         },
         RadioEvent::ConnectionStateChanged { id, state } => {
            if let Some(machine) = self.machine(connections, &id, "connection state change") {
               machine.on_link_state(state, fx);
            }
         },
         RadioEvent::ServicesDiscovered { id, services } => {
            if let Some(machine) = self.machine(connections, &id, "service discovery result") {
               machine.on_services_discovered(services, fx);
            }
         },
         RadioEvent::ServicesInvalidated { id } => {
            if let Some(machine) = self.machine(connections, &id, "service invalidation") {
               machine.on_services_invalidated(fx);
            }
         },
      }
   }

   fn machine<'a>(
      &mut self,
      connections: &'a mut HashMap<DeviceId, ConnectionMachine>,
      id: &DeviceId,
      what: &str,
   ) -> Option<&'a mut ConnectionMachine> {
      let machine = connections.get_mut(id);
      if machine.is_none() {
         debug!("Dropping {what} for untracked device {id}");
         self.dropped += 1;
      }
      machine
   }
}
