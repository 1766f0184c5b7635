//! Per-device connection state machine.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> DiscoveringServices -> Ready
//!                     |             |                 |               |
//!                     +-------------+--> Disconnecting <--------------+
//!                                              |
//!                                              v
//!                                        Disconnected
//! ```
//!
//! Link loss, radio failures and timeouts resolve to `Disconnected` from any
//! active state (a discovery failure only falls back to `Connected`). Every
//! transition bumps the machine's epoch, which invalidates timers armed in
//! the state being left.

use std::time::Duration;

use log::{debug, info, warn};
use serde_json::json;
use smallvec::SmallVec;
use tokio::{sync::oneshot, time::Instant};

use crate::{
   bluetooth::radio::{FailureReason, LinkState, Operation, RadioCommand},
   error::{SessionError, SessionResult},
   event::SessionEvent,
   session::{Effects, TimerKind},
   types::{ConnectionState, DeviceId, Service, ServiceList},
};

/// Reply slot of a caller waiting on an operation.
pub type Waiter<T> = oneshot::Sender<SessionResult<T>>;

/// What a successful `connect` hands back.
///
/// `instance` identifies one connect-to-disconnect lifetime of the link, so
/// coalesced callers can tell they share the same connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionHandle {
   pub id: DeviceId,
   pub instance: u64,
   /// Present once discovery completed.
   pub services: Option<ServiceList>,
}

impl ConnectionHandle {
   pub fn to_json(&self) -> serde_json::Value {
      json!({
          "id": self.id,
          "instance": self.instance,
          "services": self.services.as_deref(),
      })
   }
}

/// Snapshot of a tracked connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
   pub id: DeviceId,
   pub state: ConnectionState,
   pub services: Option<ServiceList>,
   pub last_error: Option<SessionError>,
}

impl ConnectionInfo {
   pub fn to_json(&self) -> serde_json::Value {
      json!({
          "id": self.id,
          "state": self.state,
          "services": self.services.as_deref(),
          "last_error": self.last_error.as_ref().map(ToString::to_string),
      })
   }
}

/// Behaviour knobs shared by every machine of a session.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionConfig {
   pub auto_discover: bool,
   pub discovery_timeout: Duration,
   pub disconnect_timeout: Duration,
}

pub struct ConnectionMachine {
   id: DeviceId,
   state: ConnectionState,
   config: ConnectionConfig,
   services: Option<ServiceList>,
   last_error: Option<SessionError>,
   instance: u64,
   epoch: u64,
   /// Disconnect requested while connecting; applied once connect resolves.
   pending_disconnect: bool,
   /// Someone was waiting when the machine last reached `Disconnected`.
   terminal_consumed: bool,
   /// A timed-out connect was aborted and the radio has not confirmed yet.
   abort_pending: bool,
   disconnected_at: Option<Instant>,
   connect_waiters: SmallVec<[Waiter<ConnectionHandle>; 1]>,
   discover_waiters: SmallVec<[Waiter<ServiceList>; 1]>,
   disconnect_waiters: SmallVec<[Waiter<()>; 1]>,
}

impl ConnectionMachine {
   pub fn new(id: DeviceId, config: ConnectionConfig) -> Self {
      Self {
         id,
         state: ConnectionState::Disconnected,
         config,
         services: None,
         last_error: None,
         instance: 0,
         epoch: 0,
         pending_disconnect: false,
         terminal_consumed: false,
         abort_pending: false,
         disconnected_at: Some(Instant::now()),
         connect_waiters: SmallVec::new(),
         discover_waiters: SmallVec::new(),
         disconnect_waiters: SmallVec::new(),
      }
   }

   pub const fn id(&self) -> &DeviceId {
      &self.id
   }

   pub const fn state(&self) -> ConnectionState {
      self.state
   }

   pub const fn services(&self) -> Option<&ServiceList> {
      self.services.as_ref()
   }

   pub const fn last_error(&self) -> Option<&SessionError> {
      self.last_error.as_ref()
   }

   /// Whether the terminal `Disconnected` outcome reached a waiting caller.
   pub const fn terminal_consumed(&self) -> bool {
      self.terminal_consumed
   }

   /// Whether the machine can be dropped: settled, seen by a caller, and no
   /// radio confirmation still in flight.
   pub fn is_finished(&self) -> bool {
      self.state == ConnectionState::Disconnected && self.terminal_consumed && !self.abort_pending
   }

   /// How long the machine has been sitting in `Disconnected`.
   pub fn idle_for(&self, now: Instant) -> Option<Duration> {
      self
         .disconnected_at
         .map(|since| now.saturating_duration_since(since))
   }

   pub fn info(&self) -> ConnectionInfo {
      ConnectionInfo {
         id: self.id.clone(),
         state: self.state,
         services: self.services.clone(),
         last_error: self.last_error.clone(),
      }
   }

   fn handle(&self) -> ConnectionHandle {
      ConnectionHandle {
         id: self.id.clone(),
         instance: self.instance,
         services: self.services.clone(),
      }
   }

   fn invalid(&self, operation: &'static str) -> SessionError {
      SessionError::InvalidState {
         operation,
         state: self.state,
      }
   }

   fn set_state(&mut self, state: ConnectionState, fx: &mut Effects) {
      if self.state == state {
         return;
      }
      debug!("{}: {} -> {state}", self.id, self.state);
      self.state = state;
      self.epoch += 1;
      if state != ConnectionState::Ready {
         self.services = None;
      }
      self.disconnected_at = (state == ConnectionState::Disconnected).then(Instant::now);
      fx.emit(SessionEvent::ConnectionStateChanged {
         id: self.id.clone(),
         state,
      });
   }

   fn arm(&self, kind: TimerKind, after: Duration, fx: &mut Effects) {
      fx.timer(self.id.clone(), kind, self.epoch, after);
   }

   fn report(&mut self, error: SessionError, fx: &mut Effects) {
      fx.emit(SessionEvent::OperationFailed {
         id: self.id.clone(),
         error: error.clone(),
      });
      self.last_error = Some(error);
   }

   fn resolve_connect(&mut self, result: &SessionResult<ConnectionHandle>) {
      for waiter in self.connect_waiters.drain(..) {
         let _ = waiter.send(result.clone());
      }
   }

   fn resolve_discover(&mut self, result: &SessionResult<ServiceList>) {
      for waiter in self.discover_waiters.drain(..) {
         let _ = waiter.send(result.clone());
      }
   }

   fn fail_in_flight(&mut self, error: &SessionError) {
      self.resolve_connect(&Err(error.clone()));
      self.resolve_discover(&Err(error.clone()));
   }

   fn has_waiters(&self) -> bool {
      !(self.connect_waiters.is_empty()
         && self.discover_waiters.is_empty()
         && self.disconnect_waiters.is_empty())
   }

   /// Settles in `Disconnected`, answering whoever asked for the disconnect.
   ///
   /// `consumed` tells whether some caller was waiting on the outcome when
   /// the terminal event arrived.
   fn enter_disconnected(
      &mut self,
      disconnect_result: SessionResult<()>,
      consumed: bool,
      fx: &mut Effects,
   ) {
      self.terminal_consumed = consumed;
      self.fail_in_flight(&SessionError::Cancelled);
      for waiter in self.disconnect_waiters.drain(..) {
         let _ = waiter.send(disconnect_result.clone());
      }
      self.pending_disconnect = false;
      self.set_state(ConnectionState::Disconnected, fx);
   }

   // === Caller operations ===

   /// Starts a connection attempt. Only valid from `Disconnected`.
   pub fn connect(&mut self, timeout: Duration, waiter: Waiter<ConnectionHandle>, fx: &mut Effects) {
      if self.state != ConnectionState::Disconnected {
         let _ = waiter.send(Err(self.invalid("connect")));
         return;
      }
      info!("{}: connecting (timeout {timeout:?})", self.id);
      self.instance += 1;
      self.last_error = None;
      self.terminal_consumed = false;
      self.connect_waiters.push(waiter);
      fx.command(RadioCommand::Connect(self.id.clone()));
      self.set_state(ConnectionState::Connecting, fx);
      self.arm(TimerKind::Connect, timeout, fx);
   }

   /// Attaches another caller to the connection already under way.
   pub fn join_connect(&mut self, waiter: Waiter<ConnectionHandle>, fx: &mut Effects) {
      match self.state {
         ConnectionState::Connecting | ConnectionState::DiscoveringServices => {
            debug!("{}: coalescing connect request", self.id);
            self.connect_waiters.push(waiter);
         },
         // An earlier automatic discovery failed; connect still means `Ready`.
         ConnectionState::Connected if self.config.auto_discover => {
            self.connect_waiters.push(waiter);
            self.start_discovery(fx);
         },
         ConnectionState::Connected | ConnectionState::Ready => {
            let _ = waiter.send(Ok(self.handle()));
         },
         ConnectionState::Disconnected | ConnectionState::Disconnecting => {
            let _ = waiter.send(Err(self.invalid("connect")));
         },
      }
   }

   /// Discovers the peer's services, or returns the cached list when `Ready`.
   pub fn discover_services(&mut self, waiter: Waiter<ServiceList>, fx: &mut Effects) {
      match self.state {
         ConnectionState::Ready => {
            let cached = self
               .services
               .clone()
               .ok_or_else(|| self.invalid("discover services"));
            let _ = waiter.send(cached);
         },
         ConnectionState::Connected => {
            self.discover_waiters.push(waiter);
            self.start_discovery(fx);
         },
         ConnectionState::DiscoveringServices => self.discover_waiters.push(waiter),
         _ => {
            let _ = waiter.send(Err(self.invalid("discover services")));
         },
      }
   }

   fn start_discovery(&mut self, fx: &mut Effects) {
      fx.command(RadioCommand::DiscoverServices(self.id.clone()));
      self.set_state(ConnectionState::DiscoveringServices, fx);
      self.arm(TimerKind::Discovery, self.config.discovery_timeout, fx);
   }

   /// Tears the link down. While `Connecting` the request is queued until
   /// the connect attempt resolves.
   pub fn disconnect(&mut self, waiter: Option<Waiter<()>>, fx: &mut Effects) {
      match self.state {
         ConnectionState::Disconnected => {
            if let Some(waiter) = waiter {
               let _ = waiter.send(Err(self.invalid("disconnect")));
            }
            return;
         },
         ConnectionState::Connecting => {
            debug!("{}: disconnect queued until connect resolves", self.id);
            self.pending_disconnect = true;
         },
         ConnectionState::Connected
         | ConnectionState::DiscoveringServices
         | ConnectionState::Ready => {
            self.fail_in_flight(&SessionError::Cancelled);
            self.begin_disconnect(fx);
         },
         ConnectionState::Disconnecting => {},
      }
      self.disconnect_waiters.extend(waiter);
   }

   fn begin_disconnect(&mut self, fx: &mut Effects) {
      info!("{}: disconnecting", self.id);
      fx.command(RadioCommand::Disconnect(self.id.clone()));
      self.set_state(ConnectionState::Disconnecting, fx);
      self.arm(TimerKind::Disconnect, self.config.disconnect_timeout, fx);
   }

   // === Radio events ===

   pub fn on_link_state(&mut self, link: LinkState, fx: &mut Effects) {
      if link == LinkState::Disconnected && self.abort_pending {
         debug!("{}: timed-out connect abort confirmed", self.id);
         self.abort_pending = false;
         return;
      }
      let consumed = self.has_waiters();
      match (link, self.state) {
         (LinkState::Connected, ConnectionState::Connecting) => {
            info!("{}: connected", self.id);
            self.set_state(ConnectionState::Connected, fx);
            if self.pending_disconnect {
               self.pending_disconnect = false;
               self.resolve_connect(&Err(SessionError::Cancelled));
               self.begin_disconnect(fx);
            } else if self.config.auto_discover {
               self.start_discovery(fx);
            } else {
               let handle = self.handle();
               self.resolve_connect(&Ok(handle));
            }
         },
         (LinkState::Connected, state) => {
            debug!("{}: discarding late connected event in {state}", self.id);
         },
         (LinkState::Disconnected, ConnectionState::Disconnected) => {},
         (LinkState::Disconnected, ConnectionState::Disconnecting) => {
            info!("{}: disconnected", self.id);
            self.enter_disconnected(Ok(()), consumed, fx);
         },
         (LinkState::Disconnected, state) => {
            warn!("{}: link lost while {state}", self.id);
            self.fail_in_flight(&SessionError::LinkLost);
            self.report(SessionError::LinkLost, fx);
            fx.emit(SessionEvent::LinkLost(self.id.clone()));
            self.enter_disconnected(Ok(()), consumed, fx);
         },
      }
   }

   pub fn on_services_discovered(&mut self, services: Vec<Service>, fx: &mut Effects) {
      if self.state != ConnectionState::DiscoveringServices {
         debug!(
            "{}: discarding late service discovery result in {}",
            self.id, self.state
         );
         return;
      }
      let services: ServiceList = services.into();
      info!("{}: discovered {} services", self.id, services.len());
      self.set_state(ConnectionState::Ready, fx);
      self.services = Some(services.clone());
      fx.emit(SessionEvent::ServicesDiscovered {
         id: self.id.clone(),
         services: services.clone(),
      });
      self.resolve_discover(&Ok(services));
      let handle = self.handle();
      self.resolve_connect(&Ok(handle));
   }

   /// The peer's GATT database changed; cached services are stale.
   pub fn on_services_invalidated(&mut self, fx: &mut Effects) {
      if self.state != ConnectionState::Ready {
         return;
      }
      info!("{}: services changed, dropping cache", self.id);
      self.services = None;
      self.set_state(ConnectionState::Connected, fx);
      if self.config.auto_discover {
         self.start_discovery(fx);
      }
   }

   pub fn on_operation_failed(
      &mut self,
      operation: Operation,
      reason: FailureReason,
      fx: &mut Effects,
   ) {
      if operation == Operation::Disconnect && self.abort_pending {
         debug!("{}: abort of timed-out connect failed: {}", self.id, reason.describe());
         self.abort_pending = false;
         return;
      }
      let consumed = self.has_waiters();
      match (operation, self.state) {
         (Operation::Connect, ConnectionState::Connecting) => {
            let error = SessionError::from(reason);
            warn!("{}: connect failed: {error}", self.id);
            self.resolve_connect(&Err(error.clone()));
            self.report(error, fx);
            // A queued disconnect has nothing left to do.
            self.enter_disconnected(Ok(()), consumed, fx);
         },
         (Operation::DiscoverServices, ConnectionState::DiscoveringServices) => {
            self.fail_discovery(reason.describe(), fx);
         },
         (Operation::Disconnect, ConnectionState::Disconnecting) => {
            let error = SessionError::from(reason);
            warn!("{}: disconnect failed: {error}", self.id);
            self.report(error.clone(), fx);
            self.enter_disconnected(Err(error), consumed, fx);
         },
         (operation, state) => {
            debug!("{}: discarding {operation} failure in {state}", self.id);
         },
      }
   }

   fn fail_discovery(&mut self, reason: smol_str::SmolStr, fx: &mut Effects) {
      let error = SessionError::DiscoveryFailed(reason);
      warn!("{}: {error}", self.id);
      self.set_state(ConnectionState::Connected, fx);
      self.fail_in_flight(&error);
      self.report(error, fx);
   }

   /// A deadline armed earlier expired.
   pub fn on_timer(&mut self, kind: TimerKind, epoch: u64, fx: &mut Effects) {
      if epoch != self.epoch {
         return;
      }
      let consumed = self.has_waiters();
      match (kind, self.state) {
         (TimerKind::Connect, ConnectionState::Connecting) => {
            warn!("{}: connect timed out", self.id);
            fx.command(RadioCommand::Disconnect(self.id.clone()));
            self.abort_pending = true;
            self.resolve_connect(&Err(SessionError::ConnectTimeout));
            self.report(SessionError::ConnectTimeout, fx);
            self.enter_disconnected(Ok(()), consumed, fx);
         },
         (TimerKind::Discovery, ConnectionState::DiscoveringServices) => {
            self.fail_discovery("timed out".into(), fx);
         },
         (TimerKind::Disconnect, ConnectionState::Disconnecting) => {
            warn!("{}: radio never confirmed disconnect, forcing", self.id);
            self.enter_disconnected(Ok(()), consumed, fx);
         },
         _ => {},
      }
   }

   /// Answers every waiter with `error` and drops to `Disconnected`, used
   /// when the session itself goes away.
   pub fn abort(&mut self, error: SessionError, fx: &mut Effects) {
      self.fail_in_flight(&error);
      for waiter in self.disconnect_waiters.drain(..) {
         let _ = waiter.send(Err(error.clone()));
      }
      self.pending_disconnect = false;
      self.set_state(ConnectionState::Disconnected, fx);
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::advertisement::uuid_from_short;

   const CONFIG: ConnectionConfig = ConnectionConfig {
      auto_discover: true,
      discovery_timeout: Duration::from_secs(15),
      disconnect_timeout: Duration::from_secs(5),
   };
   const TIMEOUT: Duration = Duration::from_secs(5);

   fn machine() -> ConnectionMachine {
      ConnectionMachine::new(DeviceId::from("AA:BB"), CONFIG)
   }

   fn services() -> Vec<Service> {
      vec![Service::new(uuid_from_short(0x180F), [uuid_from_short(0x2A19)])]
   }

   fn id() -> DeviceId {
      DeviceId::from("AA:BB")
   }

   /// Drives a fresh machine to `Ready`.
   fn ready(fx: &mut Effects) -> ConnectionMachine {
      let mut m = machine();
      let (tx, _rx) = oneshot::channel();
      m.connect(TIMEOUT, tx, fx);
      m.on_link_state(LinkState::Connected, fx);
      m.on_services_discovered(services(), fx);
      assert_eq!(m.state(), ConnectionState::Ready);
      m
   }

   #[test]
   fn test_connect_discovers_then_ready() {
      let mut m = machine();
      let mut fx = Effects::default();
      let (tx, mut rx) = oneshot::channel();

      m.connect(TIMEOUT, tx, &mut fx);
      assert_eq!(m.state(), ConnectionState::Connecting);
      assert_eq!(fx.commands.as_slice(), &[RadioCommand::Connect(id())]);
      assert_eq!(fx.timers[0].kind, TimerKind::Connect);
      assert_eq!(fx.timers[0].after, TIMEOUT);

      m.on_link_state(LinkState::Connected, &mut fx);
      assert_eq!(m.state(), ConnectionState::DiscoveringServices);
      assert_eq!(fx.commands[1], RadioCommand::DiscoverServices(id()));
      assert!(rx.try_recv().is_err());

      m.on_services_discovered(services(), &mut fx);
      let handle = rx.try_recv().unwrap().unwrap();
      assert_eq!(handle.id, id());
      assert_eq!(handle.services.as_deref(), Some(services().as_slice()));
      assert_eq!(m.state(), ConnectionState::Ready);
   }

   #[test]
   fn test_connect_without_auto_discovery() {
      let mut m = ConnectionMachine::new(
         id(),
         ConnectionConfig {
            auto_discover: false,
            ..CONFIG
         },
      );
      let mut fx = Effects::default();
      let (tx, mut rx) = oneshot::channel();

      m.connect(TIMEOUT, tx, &mut fx);
      m.on_link_state(LinkState::Connected, &mut fx);
      assert_eq!(m.state(), ConnectionState::Connected);
      let handle = rx.try_recv().unwrap().unwrap();
      assert!(handle.services.is_none());
      assert_eq!(fx.commands.len(), 1);
   }

   #[test]
   fn test_connect_only_from_disconnected() {
      let mut fx = Effects::default();
      let mut m = ready(&mut fx);
      let (tx, mut rx) = oneshot::channel();
      m.connect(TIMEOUT, tx, &mut fx);
      assert_eq!(
         rx.try_recv().unwrap(),
         Err(SessionError::InvalidState {
            operation: "connect",
            state: ConnectionState::Ready,
         })
      );
   }

   #[test]
   fn test_connect_timeout() {
      let mut m = machine();
      let mut fx = Effects::default();
      let (tx, mut rx) = oneshot::channel();
      m.connect(TIMEOUT, tx, &mut fx);
      let timer = fx.timers[0].clone();

      m.on_timer(timer.kind, timer.epoch, &mut fx);
      assert_eq!(rx.try_recv().unwrap(), Err(SessionError::ConnectTimeout));
      assert_eq!(m.state(), ConnectionState::Disconnected);
      assert_eq!(fx.commands.last(), Some(&RadioCommand::Disconnect(id())));
      assert_eq!(m.last_error(), Some(&SessionError::ConnectTimeout));

      // The late real event is discarded.
      m.on_link_state(LinkState::Connected, &mut fx);
      assert_eq!(m.state(), ConnectionState::Disconnected);
      assert!(!m.is_finished());

      m.on_link_state(LinkState::Disconnected, &mut fx);
      assert!(m.is_finished());
   }

   #[test]
   fn test_abort_confirmation_does_not_hit_retry() {
      let mut m = machine();
      let mut fx = Effects::default();
      let (tx, _rx) = oneshot::channel();
      m.connect(TIMEOUT, tx, &mut fx);
      let timer = fx.timers[0].clone();
      m.on_timer(timer.kind, timer.epoch, &mut fx);

      let (tx, mut rx) = oneshot::channel();
      m.connect(TIMEOUT, tx, &mut fx);
      m.on_link_state(LinkState::Disconnected, &mut fx);
      assert_eq!(m.state(), ConnectionState::Connecting);
      assert!(rx.try_recv().is_err());

      // A second drop is a real one.
      m.on_link_state(LinkState::Disconnected, &mut fx);
      assert_eq!(rx.try_recv().unwrap(), Err(SessionError::LinkLost));
   }

   #[test]
   fn test_failed_abort_is_absorbed() {
      let mut m = machine();
      let mut fx = Effects::default();
      let (tx, _rx) = oneshot::channel();
      m.connect(TIMEOUT, tx, &mut fx);
      let timer = fx.timers[0].clone();
      m.on_timer(timer.kind, timer.epoch, &mut fx);

      m.on_operation_failed(Operation::Disconnect, FailureReason::internal("busy"), &mut fx);
      assert_eq!(m.state(), ConnectionState::Disconnected);
      assert!(m.is_finished());
   }

   #[test]
   fn test_stale_timer_is_ignored() {
      let mut m = machine();
      let mut fx = Effects::default();
      let (tx, _rx) = oneshot::channel();
      m.connect(TIMEOUT, tx, &mut fx);
      let timer = fx.timers[0].clone();
      m.on_link_state(LinkState::Connected, &mut fx);

      m.on_timer(timer.kind, timer.epoch, &mut fx);
      assert_eq!(m.state(), ConnectionState::DiscoveringServices);
   }

   #[test]
   fn test_discover_in_ready_is_cached() {
      let mut fx = Effects::default();
      let mut m = ready(&mut fx);
      let issued = fx.commands.len();

      let (tx1, mut rx1) = oneshot::channel();
      let (tx2, mut rx2) = oneshot::channel();
      m.discover_services(tx1, &mut fx);
      m.discover_services(tx2, &mut fx);

      let first = rx1.try_recv().unwrap().unwrap();
      let second = rx2.try_recv().unwrap().unwrap();
      assert_eq!(first, second);
      assert_eq!(fx.commands.len(), issued);
   }

   #[test]
   fn test_discover_reentry_issues_one_command() {
      let mut m = ConnectionMachine::new(
         id(),
         ConnectionConfig {
            auto_discover: false,
            ..CONFIG
         },
      );
      let mut fx = Effects::default();
      let (tx, _rx) = oneshot::channel();
      m.connect(TIMEOUT, tx, &mut fx);
      m.on_link_state(LinkState::Connected, &mut fx);

      let (tx1, mut rx1) = oneshot::channel();
      let (tx2, mut rx2) = oneshot::channel();
      m.discover_services(tx1, &mut fx);
      m.discover_services(tx2, &mut fx);
      let discovers = fx
         .commands
         .iter()
         .filter(|c| matches!(c, RadioCommand::DiscoverServices(_)))
         .count();
      assert_eq!(discovers, 1);

      m.on_services_discovered(services(), &mut fx);
      assert!(rx1.try_recv().unwrap().is_ok());
      assert!(rx2.try_recv().unwrap().is_ok());
   }

   #[test]
   fn test_discover_invalid_when_disconnected() {
      let mut m = machine();
      let mut fx = Effects::default();
      let (tx, mut rx) = oneshot::channel();
      m.discover_services(tx, &mut fx);
      assert!(matches!(
         rx.try_recv().unwrap(),
         Err(SessionError::InvalidState { .. })
      ));
   }

   #[test]
   fn test_discovery_failure_keeps_link() {
      let mut m = machine();
      let mut fx = Effects::default();
      let (tx, mut rx) = oneshot::channel();
      m.connect(TIMEOUT, tx, &mut fx);
      m.on_link_state(LinkState::Connected, &mut fx);

      m.on_operation_failed(
         Operation::DiscoverServices,
         FailureReason::Gatt("attribute not found".into()),
         &mut fx,
      );
      assert_eq!(m.state(), ConnectionState::Connected);
      assert_eq!(
         rx.try_recv().unwrap(),
         Err(SessionError::DiscoveryFailed("attribute not found".into()))
      );

      // Retry succeeds.
      let (tx, mut rx) = oneshot::channel();
      m.discover_services(tx, &mut fx);
      m.on_services_discovered(services(), &mut fx);
      assert!(rx.try_recv().unwrap().is_ok());
      assert_eq!(m.state(), ConnectionState::Ready);
   }

   #[test]
   fn test_join_after_failed_auto_discovery_retries_discovery() {
      let mut m = machine();
      let mut fx = Effects::default();
      let (tx, mut first) = oneshot::channel();
      m.connect(TIMEOUT, tx, &mut fx);
      m.on_link_state(LinkState::Connected, &mut fx);
      m.on_operation_failed(
         Operation::DiscoverServices,
         FailureReason::Gatt("x".into()),
         &mut fx,
      );
      assert!(matches!(
         first.try_recv().unwrap(),
         Err(SessionError::DiscoveryFailed(_))
      ));

      let (tx, mut second) = oneshot::channel();
      m.join_connect(tx, &mut fx);
      assert_eq!(m.state(), ConnectionState::DiscoveringServices);
      assert!(second.try_recv().is_err());

      m.on_services_discovered(services(), &mut fx);
      let handle = second.try_recv().unwrap().unwrap();
      assert!(handle.services.is_some());
   }

   #[test]
   fn test_discovery_timeout() {
      let mut m = machine();
      let mut fx = Effects::default();
      let (tx, _rx) = oneshot::channel();
      m.connect(TIMEOUT, tx, &mut fx);
      m.on_link_state(LinkState::Connected, &mut fx);
      let timer = fx.timers.last().unwrap().clone();
      assert_eq!(timer.kind, TimerKind::Discovery);

      m.on_timer(timer.kind, timer.epoch, &mut fx);
      assert_eq!(m.state(), ConnectionState::Connected);

      m.on_services_discovered(services(), &mut fx);
      assert_eq!(m.state(), ConnectionState::Connected);
   }

   #[test]
   fn test_link_lost_mid_discovery() {
      let mut m = machine();
      let mut fx = Effects::default();
      let (connect_tx, mut connect_rx) = oneshot::channel();
      m.connect(TIMEOUT, connect_tx, &mut fx);
      m.on_link_state(LinkState::Connected, &mut fx);
      let (tx, mut rx) = oneshot::channel();
      m.discover_services(tx, &mut fx);

      m.on_link_state(LinkState::Disconnected, &mut fx);
      assert_eq!(rx.try_recv().unwrap(), Err(SessionError::LinkLost));
      assert_eq!(connect_rx.try_recv().unwrap(), Err(SessionError::LinkLost));
      assert_eq!(m.state(), ConnectionState::Disconnected);
      assert!(fx
         .events
         .iter()
         .any(|e| matches!(e, SessionEvent::LinkLost(lost) if *lost == id())));
      assert!(m.terminal_consumed());
   }

   #[test]
   fn test_link_lost_when_ready() {
      let mut fx = Effects::default();
      let mut m = ready(&mut fx);
      m.on_link_state(LinkState::Disconnected, &mut fx);
      assert_eq!(m.state(), ConnectionState::Disconnected);
      assert!(m.services().is_none());
      assert_eq!(m.last_error(), Some(&SessionError::LinkLost));
      // Nobody was waiting, so nobody has seen the loss yet.
      assert!(!m.terminal_consumed());
   }

   #[test]
   fn test_disconnect_from_ready() {
      let mut fx = Effects::default();
      let mut m = ready(&mut fx);
      let (tx, mut rx) = oneshot::channel();

      m.disconnect(Some(tx), &mut fx);
      assert_eq!(m.state(), ConnectionState::Disconnecting);
      assert_eq!(fx.commands.last(), Some(&RadioCommand::Disconnect(id())));
      assert!(rx.try_recv().is_err());

      m.on_link_state(LinkState::Disconnected, &mut fx);
      assert_eq!(rx.try_recv().unwrap(), Ok(()));
      assert_eq!(m.state(), ConnectionState::Disconnected);
      assert!(m.terminal_consumed());
   }

   #[test]
   fn test_disconnect_when_disconnected_is_invalid() {
      let mut m = machine();
      let mut fx = Effects::default();
      let (tx, mut rx) = oneshot::channel();
      m.disconnect(Some(tx), &mut fx);
      assert!(matches!(
         rx.try_recv().unwrap(),
         Err(SessionError::InvalidState { .. })
      ));
   }

   #[test]
   fn test_disconnect_while_connecting_is_queued() {
      let mut m = machine();
      let mut fx = Effects::default();
      let (connect_tx, mut connect_rx) = oneshot::channel();
      let (tx, mut rx) = oneshot::channel();
      m.connect(TIMEOUT, connect_tx, &mut fx);

      m.disconnect(Some(tx), &mut fx);
      assert_eq!(m.state(), ConnectionState::Connecting);
      assert_eq!(fx.commands.len(), 1);

      // Connect succeeds: the queued disconnect is applied immediately.
      m.on_link_state(LinkState::Connected, &mut fx);
      assert_eq!(connect_rx.try_recv().unwrap(), Err(SessionError::Cancelled));
      assert_eq!(m.state(), ConnectionState::Disconnecting);
      assert_eq!(fx.commands.last(), Some(&RadioCommand::Disconnect(id())));

      m.on_link_state(LinkState::Disconnected, &mut fx);
      assert_eq!(rx.try_recv().unwrap(), Ok(()));
   }

   #[test]
   fn test_queued_disconnect_after_failed_connect_is_noop() {
      let mut m = machine();
      let mut fx = Effects::default();
      let (connect_tx, mut connect_rx) = oneshot::channel();
      let (tx, mut rx) = oneshot::channel();
      m.connect(TIMEOUT, connect_tx, &mut fx);
      m.disconnect(Some(tx), &mut fx);

      m.on_operation_failed(
         Operation::Connect,
         FailureReason::internal("page timeout"),
         &mut fx,
      );
      assert_eq!(
         connect_rx.try_recv().unwrap(),
         Err(SessionError::RadioInternalError("page timeout".into()))
      );
      assert_eq!(rx.try_recv().unwrap(), Ok(()));
      assert_eq!(m.state(), ConnectionState::Disconnected);
      assert_eq!(fx.commands.len(), 1);
   }

   #[test]
   fn test_disconnect_cancels_inflight_discovery() {
      let mut m = machine();
      let mut fx = Effects::default();
      let (connect_tx, mut connect_rx) = oneshot::channel();
      m.connect(TIMEOUT, connect_tx, &mut fx);
      m.on_link_state(LinkState::Connected, &mut fx);

      m.disconnect(None, &mut fx);
      assert_eq!(connect_rx.try_recv().unwrap(), Err(SessionError::Cancelled));
      assert_eq!(m.state(), ConnectionState::Disconnecting);
   }

   #[test]
   fn test_disconnect_timeout_forces_disconnected() {
      let mut fx = Effects::default();
      let mut m = ready(&mut fx);
      let (tx, mut rx) = oneshot::channel();
      m.disconnect(Some(tx), &mut fx);
      let timer = fx.timers.last().unwrap().clone();
      assert_eq!(timer.kind, TimerKind::Disconnect);

      m.on_timer(timer.kind, timer.epoch, &mut fx);
      assert_eq!(rx.try_recv().unwrap(), Ok(()));
      assert_eq!(m.state(), ConnectionState::Disconnected);
   }

   #[test]
   fn test_radio_failure_on_disconnect() {
      let mut fx = Effects::default();
      let mut m = ready(&mut fx);
      let (tx, mut rx) = oneshot::channel();
      m.disconnect(Some(tx), &mut fx);

      m.on_operation_failed(Operation::Disconnect, FailureReason::internal("boom"), &mut fx);
      assert_eq!(
         rx.try_recv().unwrap(),
         Err(SessionError::RadioInternalError("boom".into()))
      );
      assert_eq!(m.state(), ConnectionState::Disconnected);
   }

   #[test]
   fn test_join_connect_coalesces() {
      let mut m = machine();
      let mut fx = Effects::default();
      let (tx1, mut rx1) = oneshot::channel();
      let (tx2, mut rx2) = oneshot::channel();
      m.connect(TIMEOUT, tx1, &mut fx);
      m.join_connect(tx2, &mut fx);

      m.on_link_state(LinkState::Connected, &mut fx);
      m.on_services_discovered(services(), &mut fx);
      let first = rx1.try_recv().unwrap().unwrap();
      let second = rx2.try_recv().unwrap().unwrap();
      assert_eq!(first, second);
      assert_eq!(fx.commands.len(), 2);
   }

   #[test]
   fn test_services_invalidated_rediscover() {
      let mut fx = Effects::default();
      let mut m = ready(&mut fx);
      m.on_services_invalidated(&mut fx);
      assert_eq!(m.state(), ConnectionState::DiscoveringServices);
      assert!(m.services().is_none());
      assert_eq!(fx.commands.last(), Some(&RadioCommand::DiscoverServices(id())));
   }

   #[test]
   fn test_services_only_in_ready() {
      let mut fx = Effects::default();
      let mut m = ready(&mut fx);
      assert!(m.services().is_some());
      let (tx, _rx) = oneshot::channel();
      m.disconnect(Some(tx), &mut fx);
      m.on_link_state(LinkState::Disconnected, &mut fx);
      assert!(m.services().is_none());
   }
}
