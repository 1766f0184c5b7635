//! Scan controller.
//!
//! Owns the scan lifecycle and feeds advertisements into the registry.
//! Stopping is not instantaneous on real radios: after a stop request the
//! controller sits in `Stopping` until the radio confirms with `ScanStopped`,
//! and keeps recording whatever arrives in between.

use log::{debug, info, warn};

use crate::{
   advertisement::AdvertisementRecord,
   bluetooth::radio::{FailureReason, RadioCommand},
   error::{SessionError, SessionResult},
   event::SessionEvent,
   session::{Effects, registry::DeviceRegistry},
   types::{Availability, ScanOptions, ScanState},
};

#[derive(Debug)]
pub struct ScanController {
   state: ScanState,
   options: ScanOptions,
   /// Stop requests the radio has not confirmed yet.
   pending_stops: u32,
}

impl Default for ScanController {
   fn default() -> Self {
      Self {
         state: ScanState::Idle,
         options: ScanOptions::default(),
         pending_stops: 0,
      }
   }
}

impl ScanController {
   pub fn new() -> Self {
      Self::default()
   }

   pub const fn state(&self) -> ScanState {
      self.state
   }

   fn set_state(&mut self, state: ScanState, fx: &mut Effects) {
      if self.state != state {
         debug!("Scan state {} -> {state}", self.state);
         self.state = state;
         fx.emit(SessionEvent::ScanStateChanged(state));
      }
   }

   /// Starts scanning. Results arrive later as advertisement events.
   ///
   /// Starting while a stop is still unconfirmed is allowed: the radio sees
   /// the stop and the new start in order.
   pub fn start_scan(
      &mut self,
      options: ScanOptions,
      availability: Availability,
      fx: &mut Effects,
   ) -> SessionResult<()> {
      if self.state == ScanState::Scanning {
         return Err(SessionError::AlreadyScanning);
      }
      if !availability.is_ready() {
         warn!("Cannot start scan, radio is {availability}");
         return Err(SessionError::RadioUnavailable);
      }

      info!(
         "Starting scan (duplicates: {}, service filter: {:?})",
         options.allow_duplicates, options.service_filter
      );
      fx.command(RadioCommand::StartScan(options.clone()));
      self.options = options;
      self.set_state(ScanState::Scanning, fx);
      Ok(())
   }

   /// Requests the scan to stop. A no-op unless currently scanning.
   pub fn stop_scan(&mut self, fx: &mut Effects) {
      if self.state != ScanState::Scanning {
         return;
      }
      info!("Stopping scan");
      fx.command(RadioCommand::StopScan);
      self.pending_stops += 1;
      self.set_state(ScanState::Stopping, fx);
   }

   /// Whether advertisements should currently be recorded.
   pub const fn is_accepting(&self) -> bool {
      matches!(self.state, ScanState::Scanning | ScanState::Stopping)
   }

   /// Records an advertisement, emitting the matching notification.
   pub fn on_advertisement(
      &self,
      registry: &mut DeviceRegistry,
      record: AdvertisementRecord,
      fx: &mut Effects,
   ) {
      if !self.is_accepting() {
         debug!("Ignoring advertisement from {} while idle", record.id);
         return;
      }
      let filter = &self.options.service_filter;
      if !filter.is_empty() && !record.data.advertises_any(filter.iter()) {
         return;
      }

      let id = record.id.clone();
      let is_new = registry.record_advertisement(record);
      let Some(entry) = registry.get(&id) else {
         return;
      };
      if is_new {
         debug!("Discovered {id} ({:?})", entry.name());
         fx.emit(SessionEvent::DeviceDiscovered(entry.record()));
      } else if self.options.allow_duplicates {
         fx.emit(SessionEvent::AdvertisementUpdated(entry.record()));
      }
   }

   /// The radio reported that scanning ended.
   pub fn on_scan_stopped(&mut self, fx: &mut Effects) {
      if self.pending_stops > 0 {
         self.pending_stops -= 1;
         if self.state == ScanState::Stopping && self.pending_stops == 0 {
            info!("Scan stopped");
            self.set_state(ScanState::Idle, fx);
         }
         // Otherwise this confirms a stop that a later start superseded.
      } else if self.state != ScanState::Idle {
         warn!("Radio ended the scan on its own");
         self.set_state(ScanState::Idle, fx);
      }
   }

   pub fn on_start_failed(&mut self, reason: &FailureReason, fx: &mut Effects) {
      warn!("Scan failed to start: {}", reason.describe());
      if self.state == ScanState::Scanning {
         self.set_state(ScanState::Idle, fx);
      }
   }

   pub fn on_stop_failed(&mut self, reason: &FailureReason, fx: &mut Effects) {
      warn!("Scan failed to stop: {}", reason.describe());
      self.pending_stops = self.pending_stops.saturating_sub(1);
      if self.state == ScanState::Stopping && self.pending_stops == 0 {
         self.set_state(ScanState::Scanning, fx);
      }
   }

   /// The radio went away; whatever was outstanding will never be confirmed.
   pub fn on_radio_lost(&mut self, fx: &mut Effects) {
      self.pending_stops = 0;
      self.set_state(ScanState::Idle, fx);
   }
}
