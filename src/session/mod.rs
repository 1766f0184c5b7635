//! Central-role session core.
//!
//! The components in here never touch the radio or a clock themselves. They
//! react to calls and radio events by filling an [`Effects`] buffer, which
//! the session actor then carries out in order: radio commands are issued,
//! timers armed, notifications emitted.

use std::time::Duration;

use smallvec::SmallVec;

use crate::{bluetooth::radio::RadioCommand, event::SessionEvent, types::DeviceId};

pub mod connection;
pub mod dispatcher;
pub mod manager;
pub mod registry;
pub mod scan;

/// Kinds of deadline a connection state machine can arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
   Connect,
   Discovery,
   Disconnect,
}

/// A deadline armed by a connection state machine.
///
/// `epoch` identifies the state the timer was armed in; a timer that fires
/// after the machine moved on is stale and ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerRequest {
   pub id: DeviceId,
   pub kind: TimerKind,
   pub epoch: u64,
   pub after: Duration,
}

/// Side effects produced while handling one input.
#[derive(Debug, Default)]
pub struct Effects {
   pub commands: SmallVec<[RadioCommand; 2]>,
   pub timers: SmallVec<[TimerRequest; 1]>,
   pub events: Vec<SessionEvent>,
}

impl Effects {
   pub fn command(&mut self, command: RadioCommand) {
      self.commands.push(command);
   }

   pub fn timer(&mut self, id: DeviceId, kind: TimerKind, epoch: u64, after: Duration) {
      self.timers.push(TimerRequest {
         id,
         kind,
         epoch,
         after,
      });
   }

   pub fn emit(&mut self, event: SessionEvent) {
      self.events.push(event);
   }

   pub fn is_empty(&self) -> bool {
      self.commands.is_empty() && self.timers.is_empty() && self.events.is_empty()
   }
}
