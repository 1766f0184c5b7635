//! Session manager.
//!
//! [`Session`] is the single entry point callers use. It forwards every
//! request to a session actor that owns the radio, the scan controller, the
//! device registry and one connection state machine per device identity.
//! The actor handles requests, radio events and timer expirations one at a
//! time, so none of the components needs locking.

use std::{
   collections::{HashMap, VecDeque},
   time::Duration,
};

use futures::future::join_all;
use log::{debug, error, info, warn};
use tokio::{
   select,
   sync::{mpsc, oneshot},
   time::{self, Instant, MissedTickBehavior},
};

use crate::{
   bluetooth::radio::{FailureReason, Radio, RadioCommand, RadioEvent, RadioEventReceiver},
   config::Config,
   error::{
      ConnectError, DisconnectError, DiscoveryError, ScanError, SessionError, SessionResult,
   },
   event::{EventSender, SessionEvent},
   session::{
      Effects, TimerRequest,
      connection::{ConnectionConfig, ConnectionHandle, ConnectionInfo, ConnectionMachine, Waiter},
      dispatcher::{EventDispatcher, Targets},
      registry::{DeviceEntry, DeviceFilter, DeviceRegistry},
      scan::ScanController,
   },
   types::{ConnectionState, DeviceId, ScanOptions, ScanState, ServiceList},
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 1000;

// === Commands ===

#[derive(Debug)]
enum SessionCommand {
   // Caller requests
   StartScan(ScanOptions, oneshot::Sender<SessionResult<()>>),
   StopScan(oneshot::Sender<()>),
   Connect(DeviceId, Duration, Waiter<ConnectionHandle>),
   Disconnect(DeviceId, Waiter<()>),
   DiscoverServices(DeviceId, Waiter<ServiceList>),
   DisconnectAll(oneshot::Sender<()>),
   Release(DeviceId, oneshot::Sender<SessionResult<()>>),

   // Queries
   ListDevices(DeviceFilter, oneshot::Sender<Vec<DeviceEntry>>),
   GetConnection(DeviceId, oneshot::Sender<Option<ConnectionInfo>>),
   ListConnections(oneshot::Sender<Vec<ConnectionInfo>>),
   GetScanState(oneshot::Sender<ScanState>),

   // Loopback
   TimerFired(TimerRequest),
}

// === Session handle ===

/// Caller-facing handle of a BLE central session.
///
/// Cheap to clone; all clones talk to the same session actor. The actor
/// shuts down once every handle has been dropped.
#[derive(Debug, Clone)]
pub struct Session {
   inbox: mpsc::Sender<SessionCommand>,
   connect_timeout: Duration,
}

impl Session {
   /// Spawns the session actor on the current tokio runtime.
   ///
   /// `radio_events` must be the receiving half of the channel `radio`
   /// pushes its events into.
   pub fn spawn<R: Radio>(
      config: &Config,
      radio: R,
      radio_events: RadioEventReceiver,
      event_tx: EventSender,
   ) -> Self {
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      tokio::spawn(SessionActor::new(config, radio, radio_events, command_rx, event_tx).run());
      Self {
         inbox: command_tx,
         connect_timeout: config.connect_timeout(),
      }
   }

   /// Connect timeout configured for this session.
   pub const fn default_connect_timeout(&self) -> Duration {
      self.connect_timeout
   }

   async fn request<T>(
      &self,
      make: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
   ) -> SessionResult<T> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(make(tx))
         .await
         .map_err(|_| SessionError::SessionShutdown)?;
      rx.await.map_err(|_| SessionError::SessionShutdown)
   }

   /// Starts scanning. Discovered devices are reported through the event bus.
   ///
   /// Fails with `AlreadyScanning` or `RadioUnavailable`.
   pub async fn start_scan(&self, options: ScanOptions) -> Result<(), ScanError> {
      self
         .request(|tx| SessionCommand::StartScan(options, tx))
         .await?
   }

   /// Stops scanning; a no-op when not scanning.
   pub async fn stop_scan(&self) {
      let _ = self.request(SessionCommand::StopScan).await;
   }

   /// Connects to `id`, resolving once the connection is `Ready` (or
   /// `Connected` when automatic service discovery is off).
   ///
   /// Concurrent calls for the same device share one radio-level attempt
   /// and all receive the same outcome.
   pub async fn connect(
      &self,
      id: &DeviceId,
      timeout: Duration,
   ) -> Result<ConnectionHandle, ConnectError> {
      self
         .request(|tx| SessionCommand::Connect(id.clone(), timeout, tx))
         .await?
   }

   /// Disconnects `id`, resolving once the radio confirms.
   pub async fn disconnect(&self, id: &DeviceId) -> Result<(), DisconnectError> {
      self
         .request(|tx| SessionCommand::Disconnect(id.clone(), tx))
         .await?
   }

   /// Discovers the services of a connected device. Returns the cached list
   /// without touching the radio when the connection is already `Ready`.
   pub async fn discover_services(&self, id: &DeviceId) -> Result<ServiceList, DiscoveryError> {
      self
         .request(|tx| SessionCommand::DiscoverServices(id.clone(), tx))
         .await?
   }

   /// Drives every tracked connection to `Disconnected`.
   pub async fn disconnect_all(&self) {
      let _ = self.request(SessionCommand::DisconnectAll).await;
   }

   /// Forgets a `Disconnected` connection.
   pub async fn release(&self, id: &DeviceId) -> SessionResult<()> {
      self
         .request(|tx| SessionCommand::Release(id.clone(), tx))
         .await?
   }

   pub async fn list_devices(&self, filter: DeviceFilter) -> Vec<DeviceEntry> {
      self
         .request(|tx| SessionCommand::ListDevices(filter, tx))
         .await
         .unwrap_or_default()
   }

   pub async fn connection(&self, id: &DeviceId) -> Option<ConnectionInfo> {
      self
         .request(|tx| SessionCommand::GetConnection(id.clone(), tx))
         .await
         .ok()
         .flatten()
   }

   /// State of the connection to `id`; untracked devices are `Disconnected`.
   pub async fn connection_state(&self, id: &DeviceId) -> ConnectionState {
      self
         .connection(id)
         .await
         .map_or(ConnectionState::Disconnected, |info| info.state)
   }

   pub async fn connections(&self) -> Vec<ConnectionInfo> {
      self
         .request(SessionCommand::ListConnections)
         .await
         .unwrap_or_default()
   }

   pub async fn scan_state(&self) -> ScanState {
      self
         .request(SessionCommand::GetScanState)
         .await
         .unwrap_or(ScanState::Idle)
   }
}

// === Session actor ===

struct SessionActor<R: Radio> {
   radio: R,
   event_tx: EventSender,
   command_rx: mpsc::Receiver<SessionCommand>,
   radio_rx: RadioEventReceiver,
   loopback_rx: mpsc::Receiver<SessionCommand>,
   loopback_tx: mpsc::Sender<SessionCommand>,

   connection_config: ConnectionConfig,
   max_connections: usize,
   advertisement_max_age: Duration,
   terminal_grace: Duration,
   housekeeping_interval: Duration,

   // State
   scan: ScanController,
   registry: DeviceRegistry,
   connections: HashMap<DeviceId, ConnectionMachine>,
   dispatcher: EventDispatcher,
   /// Failures of commands the radio refused outright, handled like events.
   pending: VecDeque<RadioEvent>,
}

impl<R: Radio> SessionActor<R> {
   fn new(
      config: &Config,
      radio: R,
      radio_rx: RadioEventReceiver,
      command_rx: mpsc::Receiver<SessionCommand>,
      event_tx: EventSender,
   ) -> Self {
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      Self {
         radio,
         event_tx,
         command_rx,
         radio_rx,
         loopback_rx,
         loopback_tx,
         connection_config: config.connection_config(),
         max_connections: config.max_connections,
         advertisement_max_age: config.advertisement_max_age(),
         terminal_grace: config.terminal_grace(),
         housekeeping_interval: config.housekeeping_interval(),
         scan: ScanController::new(),
         registry: DeviceRegistry::with_aliases(config.aliases()),
         connections: HashMap::new(),
         dispatcher: EventDispatcher::new(),
         pending: VecDeque::new(),
      }
   }

   async fn run(mut self) {
      info!("BLE session starting up");

      let mut housekeeping = time::interval(self.housekeeping_interval);
      housekeeping.set_missed_tick_behavior(MissedTickBehavior::Skip);

      // Radio outcomes are applied before new caller requests are taken.
      loop {
         select! {
             biased;
             Some(event) = self.radio_rx.recv() => {
                 self.handle_radio_event(event);
             }
             Some(cmd) = self.loopback_rx.recv() => {
                 self.handle_command(cmd);
             }
             cmd = self.command_rx.recv() => {
                 let Some(cmd) = cmd else {
                     info!("BLE session shutting down");
                     break;
                 };
                 self.handle_command(cmd);
             }
             _ = housekeeping.tick() => {
                 self.housekeeping();
             }
         }
      }

      self.cleanup();
   }

   fn handle_radio_event(&mut self, event: RadioEvent) {
      self.dispatch(event);
      self.drain_pending();
      self.reap();
   }

   fn dispatch(&mut self, event: RadioEvent) {
      let mut fx = Effects::default();
      self.dispatcher.dispatch(
         event,
         Targets {
            scan: &mut self.scan,
            registry: &mut self.registry,
            connections: &mut self.connections,
         },
         &mut fx,
      );
      self.apply(fx);
   }

   fn drain_pending(&mut self) {
      while let Some(event) = self.pending.pop_front() {
         self.dispatch(event);
      }
   }

   fn handle_command(&mut self, cmd: SessionCommand) {
      let mut fx = Effects::default();
      match cmd {
         SessionCommand::StartScan(options, reply) => {
            let result = self
               .scan
               .start_scan(options, self.radio.availability(), &mut fx);
            let rejected = self.apply(fx);
            self.drain_pending();
            let _ = reply.send(match rejected {
               Some(reason) if result.is_ok() => Err(reason.into()),
               _ => result,
            });
            return;
         },
         SessionCommand::StopScan(reply) => {
            self.scan.stop_scan(&mut fx);
            let _ = reply.send(());
         },
         SessionCommand::Connect(id, timeout, reply) => {
            self.connect(id, timeout, reply, &mut fx);
         },
         SessionCommand::Disconnect(id, reply) => match self.connections.get_mut(&id) {
            Some(machine) => machine.disconnect(Some(reply), &mut fx),
            None => {
               let _ = reply.send(Err(SessionError::NotConnected(id)));
            },
         },
         SessionCommand::DiscoverServices(id, reply) => match self.connections.get_mut(&id) {
            Some(machine) => machine.discover_services(reply, &mut fx),
            None => {
               let _ = reply.send(Err(SessionError::NotConnected(id)));
            },
         },
         SessionCommand::DisconnectAll(reply) => {
            self.disconnect_all(reply, &mut fx);
         },
         SessionCommand::Release(id, reply) => {
            let result = match self.connections.get(&id).map(ConnectionMachine::state) {
               Some(state) if state.is_active() => Err(SessionError::InvalidState {
                  operation: "release",
                  state,
               }),
               _ => {
                  self.connections.remove(&id);
                  Ok(())
               },
            };
            let _ = reply.send(result);
         },
         SessionCommand::ListDevices(filter, reply) => {
            let devices = self.registry.list_devices(&filter).cloned().collect();
            let _ = reply.send(devices);
         },
         SessionCommand::GetConnection(id, reply) => {
            let _ = reply.send(self.connections.get(&id).map(ConnectionMachine::info));
         },
         SessionCommand::ListConnections(reply) => {
            let infos = self.connections.values().map(ConnectionMachine::info).collect();
            let _ = reply.send(infos);
         },
         SessionCommand::GetScanState(reply) => {
            let _ = reply.send(self.scan.state());
         },
         SessionCommand::TimerFired(timer) => {
            if let Some(machine) = self.connections.get_mut(&timer.id) {
               machine.on_timer(timer.kind, timer.epoch, &mut fx);
            }
         },
      }
      self.apply(fx);
      self.drain_pending();
      self.reap();
   }

   fn active_connections(&self) -> usize {
      self
         .connections
         .values()
         .filter(|machine| machine.state().is_active())
         .count()
   }

   fn connect(
      &mut self,
      id: DeviceId,
      timeout: Duration,
      reply: Waiter<ConnectionHandle>,
      fx: &mut Effects,
   ) {
      let in_progress = self
         .connections
         .get(&id)
         .is_some_and(|machine| machine.state().is_active());

      if in_progress {
         if let Some(machine) = self.connections.get_mut(&id) {
            machine.join_connect(reply, fx);
         }
      } else if !self.radio.availability().is_ready() {
         let _ = reply.send(Err(SessionError::RadioUnavailable));
      } else if self.active_connections() >= self.max_connections {
         warn!("Refusing connection to {id}: {} links active", self.max_connections);
         let _ = reply.send(Err(SessionError::TooManyConnections(self.max_connections)));
      } else {
         let config = self.connection_config;
         self
            .connections
            .entry(id.clone())
            .or_insert_with(|| ConnectionMachine::new(id, config))
            .connect(timeout, reply, fx);
      }
   }

   fn disconnect_all(&mut self, reply: oneshot::Sender<()>, fx: &mut Effects) {
      let mut outcomes = Vec::new();
      for machine in self.connections.values_mut() {
         if machine.state().is_active() {
            let (tx, rx) = oneshot::channel();
            machine.disconnect(Some(tx), fx);
            outcomes.push(rx);
         }
      }
      info!("Disconnecting {} connections", outcomes.len());
      tokio::spawn(async move {
         join_all(outcomes).await;
         let _ = reply.send(());
      });
   }

   /// Carries out the effects of one step. Returns the reason of the first
   /// command the radio refused to issue, if any.
   fn apply(&mut self, fx: Effects) -> Option<FailureReason> {
      let Effects {
         commands,
         timers,
         events,
      } = fx;

      let mut rejected = None;
      for command in commands {
         debug!("Issuing {command:?}");
         if let Err(reason) = self.radio.execute(&command) {
            error!(
               "Radio refused {} command: {}",
               command.operation(),
               reason.describe()
            );
            self.pending.push_back(RadioEvent::OperationFailed {
               id: command.device().cloned(),
               operation: command.operation(),
               reason: reason.clone(),
            });
            if rejected.is_none() {
               rejected = Some(reason);
            }
         }
      }

      for timer in timers {
         self.arm_timer(timer);
      }

      for event in events {
         self.event_tx.emit(event);
      }
      rejected
   }

   fn arm_timer(&self, timer: TimerRequest) {
      let loopback = self.loopback_tx.clone();
      tokio::spawn(async move {
         time::sleep(timer.after).await;
         if let Err(e) = loopback.send(SessionCommand::TimerFired(timer)).await {
            debug!("Timer fired after shutdown: {e}");
         }
      });
   }

   /// Drops connections whose terminal outcome was delivered to a caller.
   fn reap(&mut self) {
      self.connections.retain(|id, machine| {
         let done = machine.is_finished();
         if done {
            debug!("Releasing connection state for {id}");
         }
         !done
      });
   }

   fn housekeeping(&mut self) {
      let expired = self.registry.purge_stale(self.advertisement_max_age);
      if !expired.is_empty() {
         debug!("Expired {} stale devices", expired.len());
         self.event_tx.emit(SessionEvent::DevicesExpired(expired));
      }

      let now = Instant::now();
      let grace = self.terminal_grace;
      self.connections.retain(|id, machine| {
         let stale = !machine.state().is_active()
            && machine.idle_for(now).is_some_and(|idle| idle >= grace);
         if stale {
            debug!("Releasing unclaimed connection state for {id}");
         }
         !stale
      });
   }

   fn cleanup(&mut self) {
      info!(
         "Cleaning up BLE session ({} unroutable radio events dropped)",
         self.dispatcher.dropped()
      );
      let mut fx = Effects::default();
      self.scan.stop_scan(&mut fx);
      for machine in self.connections.values_mut() {
         if machine.state().is_active() {
            fx.command(RadioCommand::Disconnect(machine.id().clone()));
         }
         machine.abort(SessionError::SessionShutdown, &mut fx);
      }
      self.apply(fx);
      self.connections.clear();
   }
}
