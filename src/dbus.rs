use std::{fmt::Display, time::Duration};

use log::info;
use zbus::{interface, object_server::SignalEmitter};

use crate::{
   session::{manager::Session, registry::DeviceFilter},
   types::{DeviceId, ScanOptions},
};

pub struct SessionService {
   session: Session,
}

impl SessionService {
   pub const fn new(session: Session) -> Self {
      Self { session }
   }
}

fn failed(e: impl Display) -> zbus::fdo::Error {
   zbus::fdo::Error::Failed(e.to_string())
}

/// Parses an optional JSON argument; an empty string means defaults.
fn parse_json<T: serde::de::DeserializeOwned + Default>(arg: &str) -> zbus::fdo::Result<T> {
   if arg.trim().is_empty() {
      return Ok(T::default());
   }
   serde_json::from_str(arg).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))
}

#[interface(name = "org.blecentral.Session")]
impl SessionService {
   async fn start_scan(&self, options: String) -> zbus::fdo::Result<bool> {
      let options: ScanOptions = parse_json(&options)?;
      self.session.start_scan(options).await.map_err(failed)?;
      Ok(true)
   }

   async fn stop_scan(&self) -> bool {
      self.session.stop_scan().await;
      true
   }

   /// Connects and returns the connection handle as JSON. A zero timeout
   /// uses the configured default.
   async fn connect(&self, id: String, timeout_ms: u32) -> zbus::fdo::Result<String> {
      let timeout = if timeout_ms == 0 {
         self.session.default_connect_timeout()
      } else {
         Duration::from_millis(u64::from(timeout_ms))
      };
      let handle = self
         .session
         .connect(&DeviceId::from(id), timeout)
         .await
         .map_err(failed)?;
      Ok(handle.to_json().to_string())
   }

   async fn disconnect(&self, id: String) -> zbus::fdo::Result<bool> {
      self
         .session
         .disconnect(&DeviceId::from(id))
         .await
         .map_err(failed)?;
      Ok(true)
   }

   async fn discover_services(&self, id: String) -> zbus::fdo::Result<String> {
      let services = self
         .session
         .discover_services(&DeviceId::from(id))
         .await
         .map_err(failed)?;
      serde_json::to_string(&*services).map_err(failed)
   }

   async fn release(&self, id: String) -> zbus::fdo::Result<bool> {
      self
         .session
         .release(&DeviceId::from(id))
         .await
         .map_err(failed)?;
      Ok(true)
   }

   async fn disconnect_all(&self) -> bool {
      self.session.disconnect_all().await;
      info!("All connections closed over D-Bus request");
      true
   }

   async fn get_devices(&self, filter: String) -> zbus::fdo::Result<String> {
      let filter: DeviceFilter = parse_json(&filter)?;
      let devices: Vec<serde_json::Value> = self
         .session
         .list_devices(filter)
         .await
         .iter()
         .map(|d| d.to_json())
         .collect();
      serde_json::to_string(&devices).map_err(failed)
   }

   async fn get_connection(&self, id: String) -> zbus::fdo::Result<String> {
      let info = self
         .session
         .connection(&DeviceId::from(id))
         .await
         .ok_or_else(|| zbus::fdo::Error::Failed("Connection not found".into()))?;
      Ok(info.to_json().to_string())
   }

   async fn get_connections(&self) -> zbus::fdo::Result<String> {
      let infos: Vec<serde_json::Value> = self
         .session
         .connections()
         .await
         .iter()
         .map(|c| c.to_json())
         .collect();
      serde_json::to_string(&infos).map_err(failed)
   }

   // Signals
   #[zbus(signal)]
   pub async fn scan_state_updated(emitter: &SignalEmitter<'_>, state: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_discovered(emitter: &SignalEmitter<'_>, device: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn advertisement_updated(
      emitter: &SignalEmitter<'_>,
      device: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn devices_expired(emitter: &SignalEmitter<'_>, ids: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn connection_state_changed(
      emitter: &SignalEmitter<'_>,
      id: &str,
      state: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn services_discovered(
      emitter: &SignalEmitter<'_>,
      id: &str,
      services: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn link_lost(emitter: &SignalEmitter<'_>, id: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn operation_failed(
      emitter: &SignalEmitter<'_>,
      id: &str,
      error: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn availability_changed(
      emitter: &SignalEmitter<'_>,
      availability: &str,
   ) -> zbus::Result<()>;

   // Properties for polling-free updates
   #[zbus(property)]
   async fn scan_state(&self) -> String {
      self.session.scan_state().await.to_string()
   }

   #[zbus(property)]
   async fn connected_count(&self) -> u32 {
      let active = self
         .session
         .connections()
         .await
         .iter()
         .filter(|c| c.state.is_active())
         .count();
      u32::try_from(active).unwrap_or(u32::MAX)
   }
}
