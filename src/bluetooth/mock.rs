//! Scripted radio used by the unit tests.
//!
//! Records every command it receives; tests play the radio's part by pushing
//! `RadioEvent`s into the session's event channel.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
   bluetooth::radio::{FailureReason, Radio, RadioCommand},
   types::{Availability, DeviceId, ScanOptions},
};

#[derive(Debug)]
struct MockState {
   availability: Availability,
   commands: Vec<RadioCommand>,
   reject_next: Option<FailureReason>,
}

/// Cloneable handle; clones share the recorded command log.
#[derive(Debug, Clone)]
pub struct MockRadio(Arc<Mutex<MockState>>);

impl Default for MockRadio {
   fn default() -> Self {
      Self(Arc::new(Mutex::new(MockState {
         availability: Availability::Ready,
         commands: Vec::new(),
         reject_next: None,
      })))
   }
}

impl MockRadio {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn set_availability(&self, availability: Availability) {
      self.0.lock().availability = availability;
   }

   /// Makes the next issued command fail synchronously.
   pub fn reject_next(&self, reason: FailureReason) {
      self.0.lock().reject_next = Some(reason);
   }

   pub fn commands(&self) -> Vec<RadioCommand> {
      self.0.lock().commands.clone()
   }

   pub fn count(&self, pred: impl Fn(&RadioCommand) -> bool) -> usize {
      self.0.lock().commands.iter().filter(|c| pred(c)).count()
   }

   fn record(&mut self, command: RadioCommand) -> Result<(), FailureReason> {
      let mut state = self.0.lock();
      state.commands.push(command);
      state.reject_next.take().map_or(Ok(()), Err)
   }
}

impl Radio for MockRadio {
   fn availability(&self) -> Availability {
      self.0.lock().availability
   }

   fn start_scan(&mut self, options: &ScanOptions) -> Result<(), FailureReason> {
      self.record(RadioCommand::StartScan(options.clone()))
   }

   fn stop_scan(&mut self) -> Result<(), FailureReason> {
      self.record(RadioCommand::StopScan)
   }

   fn connect(&mut self, id: &DeviceId) -> Result<(), FailureReason> {
      self.record(RadioCommand::Connect(id.clone()))
   }

   fn disconnect(&mut self, id: &DeviceId) -> Result<(), FailureReason> {
      self.record(RadioCommand::Disconnect(id.clone()))
   }

   fn discover_services(&mut self, id: &DeviceId) -> Result<(), FailureReason> {
      self.record(RadioCommand::DiscoverServices(id.clone()))
   }
}
