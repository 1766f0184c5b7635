//! BLE central D-Bus service
//!
//! Runs a central-role session on the default BlueZ adapter and exposes
//! scanning, connections and service discovery over D-Bus.

use std::sync::Arc;

use log::{info, warn};
use tokio::signal;
use zbus::{Connection, connection, object_server::InterfaceRef};

use blecentral::{
   Config, EventQueue, Session, SessionEvent,
   bluetooth::bluez::BluezRadio,
   dbus::{SessionService, SessionServiceSignals},
   error::Result,
   event_channel,
};

const BUS_NAME: &str = "org.blecentral";
const OBJECT_PATH: &str = "/org/blecentral/session";

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting BLE central D-Bus service...");

   // Load configuration
   let config = Config::load()?;
   info!(
      "Loaded configuration with {} device aliases",
      config.aliases.len()
   );

   // Radio and session
   let (radio_tx, radio_rx) = event_channel();
   let radio = BluezRadio::new(radio_tx).await?;
   let event_bus = EventQueue::new();
   let session = Session::spawn(&config, radio, radio_rx, event_bus.clone());

   // Build D-Bus connection
   let connection = connection::Builder::session()?
      .name(BUS_NAME)?
      .serve_at(OBJECT_PATH, SessionService::new(session.clone()))?
      .build()
      .await?;

   info!("BLE central D-Bus service started at {BUS_NAME}");

   // Start event processor
   spawn_dispatcher(event_bus, connection).await?;

   // Wait for shutdown signal
   signal::ctrl_c().await?;
   info!("Shutting down, closing connections...");
   session.disconnect_all().await;

   Ok(())
}

async fn dispatch(iface: &InterfaceRef<SessionService>, event: SessionEvent) -> Result<()> {
   match event {
      SessionEvent::ScanStateChanged(state) => {
         iface.scan_state_updated(state.into()).await?;
         iface
            .get()
            .await
            .scan_state_changed(iface.signal_emitter())
            .await?;
      },
      SessionEvent::DeviceDiscovered(record) => {
         iface
            .device_discovered(&record.to_json().to_string())
            .await?;
      },
      SessionEvent::AdvertisementUpdated(record) => {
         iface
            .advertisement_updated(&record.to_json().to_string())
            .await?;
      },
      SessionEvent::DevicesExpired(ids) => {
         iface
            .devices_expired(&serde_json::to_string(&ids)?)
            .await?;
      },
      SessionEvent::ConnectionStateChanged { id, state } => {
         iface
            .connection_state_changed(id.as_str(), state.into())
            .await?;
      },
      SessionEvent::ServicesDiscovered { id, services } => {
         iface
            .services_discovered(id.as_str(), &serde_json::to_string(&*services)?)
            .await?;
      },
      SessionEvent::LinkLost(id) => {
         iface.link_lost(id.as_str()).await?;
      },
      SessionEvent::OperationFailed { id, error } => {
         iface
            .operation_failed(id.as_str(), &error.to_string())
            .await?;
      },
      SessionEvent::AvailabilityChanged(availability) => {
         iface.availability_changed(availability.into()).await?;
      },
   }
   Ok(())
}

async fn spawn_dispatcher(events: Arc<EventQueue>, connection: Connection) -> Result<()> {
   let iface = connection
      .object_server()
      .interface::<_, SessionService>(OBJECT_PATH)
      .await?;
   tokio::spawn(async move {
      while let Some(event) = events.recv().await {
         let name = event.name();
         if let Err(e) = dispatch(&iface, event).await {
            warn!("Error dispatching {name} event: {e}");
         }
      }
   });

   Ok(())
}
