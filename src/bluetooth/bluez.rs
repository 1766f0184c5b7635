//! BlueZ radio backend.
//!
//! Maps radio commands onto `bluer` calls. Every command spawns a task that
//! performs the D-Bus round trips and reports the outcome as a
//! [`RadioEvent`], so the session actor never blocks on the stack.

use std::{
   collections::HashMap,
   pin::pin,
   str::FromStr,
   sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
   },
   time::Duration,
};

use bluer::{
   Adapter, AdapterEvent, AdapterProperty, Address, Device, DeviceEvent, DeviceProperty,
   DiscoveryFilter, DiscoveryTransport, ErrorKind, Session,
};
use futures::StreamExt;
use log::{debug, info, warn};
use smol_str::SmolStr;
use tokio::{task::JoinHandle, time};

use crate::{
   advertisement::AdvertisementData,
   bluetooth::radio::{
      FailureReason, LinkState, Operation, Radio, RadioEvent, RadioEventSender,
   },
   error::{Error, Result},
   types::{Availability, DeviceId, ScanOptions, Service},
};

/// Poll interval while waiting for BlueZ to resolve services
const SERVICES_RESOLVED_POLL: Duration = Duration::from_millis(100);

pub struct BluezRadio {
   adapter: Adapter,
   events: RadioEventSender,
   powered: Arc<AtomicBool>,
   scan: Option<JoinHandle<()>>,
   links: HashMap<DeviceId, JoinHandle<()>>,
   monitor: JoinHandle<()>,
}

impl BluezRadio {
   /// Opens the default adapter. Events are pushed into `events`.
   pub async fn new(events: RadioEventSender) -> Result<Self> {
      let session = Session::new().await?;
      let adapter = session
         .default_adapter()
         .await
         .map_err(|_| Error::AdapterNotFound)?;

      let powered = adapter.is_powered().await.unwrap_or(false);
      info!(
         "Using adapter {} ({})",
         adapter.name(),
         if powered { "powered" } else { "powered off" }
      );

      let powered = Arc::new(AtomicBool::new(powered));
      let monitor = Self::start_adapter_monitor(adapter.clone(), powered.clone(), events.clone());
      Ok(Self {
         adapter,
         events,
         powered,
         scan: None,
         links: HashMap::new(),
         monitor,
      })
   }

   fn start_adapter_monitor(
      adapter: Adapter,
      powered: Arc<AtomicBool>,
      events: RadioEventSender,
   ) -> JoinHandle<()> {
      tokio::spawn(async move {
         let Ok(stream) = adapter.events().await else {
            warn!("Failed to get adapter events for {}", adapter.name());
            return;
         };
         let mut stream = pin!(stream);

         while let Some(event) = stream.next().await {
            if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(on)) = event {
               powered.store(on, Ordering::Release);
               let availability = if on {
                  Availability::Ready
               } else {
                  Availability::PoweredOff
               };
               send(&events, RadioEvent::AvailabilityChanged(availability)).await;
            }
         }

         // The adapter went away
         powered.store(false, Ordering::Release);
         send(&events, RadioEvent::AvailabilityChanged(Availability::Unsupported)).await;
      })
   }

   fn device(&self, id: &DeviceId) -> std::result::Result<Device, FailureReason> {
      let addr = Address::from_str(id.as_str())
         .map_err(|e| FailureReason::internal(format!("invalid address {id}: {e}")))?;
      self.adapter.device(addr).map_err(failure)
   }

   /// Forgets link watchers whose link already dropped.
   fn prune_links(&mut self) {
      self.links.retain(|_, task| !task.is_finished());
   }

   fn ensure_powered(&self) -> std::result::Result<(), FailureReason> {
      if self.powered.load(Ordering::Acquire) {
         Ok(())
      } else {
         Err(FailureReason::Unavailable)
      }
   }
}

impl Drop for BluezRadio {
   fn drop(&mut self) {
      self.monitor.abort();
      if let Some(scan) = self.scan.take() {
         scan.abort();
      }
      for (_, link) in self.links.drain() {
         link.abort();
      }
   }
}

impl Radio for BluezRadio {
   fn availability(&self) -> Availability {
      if self.powered.load(Ordering::Acquire) {
         Availability::Ready
      } else {
         Availability::PoweredOff
      }
   }

   fn start_scan(&mut self, options: &ScanOptions) -> std::result::Result<(), FailureReason> {
      self.ensure_powered()?;
      if let Some(previous) = self.scan.take() {
         previous.abort();
      }
      self.scan = Some(tokio::spawn(run_scan(
         self.adapter.clone(),
         options.clone(),
         self.events.clone(),
      )));
      Ok(())
   }

   fn stop_scan(&mut self) -> std::result::Result<(), FailureReason> {
      // Dropping the discovery stream ends discovery on the adapter.
      if let Some(scan) = self.scan.take() {
         scan.abort();
      }
      let events = self.events.clone();
      tokio::spawn(async move { send(&events, RadioEvent::ScanStopped).await });
      Ok(())
   }

   fn connect(&mut self, id: &DeviceId) -> std::result::Result<(), FailureReason> {
      self.ensure_powered()?;
      self.prune_links();
      let device = self.device(id)?;
      let task = tokio::spawn(run_link(device, id.clone(), self.events.clone()));
      if let Some(previous) = self.links.insert(id.clone(), task) {
         previous.abort();
      }
      Ok(())
   }

   fn disconnect(&mut self, id: &DeviceId) -> std::result::Result<(), FailureReason> {
      self.prune_links();
      let device = self.device(id)?;
      if let Some(link) = self.links.remove(id) {
         link.abort();
      }
      let id = id.clone();
      let events = self.events.clone();
      tokio::spawn(async move {
         let event = match device.disconnect().await {
            Ok(()) => RadioEvent::ConnectionStateChanged {
               id,
               state: LinkState::Disconnected,
            },
            Err(e) => RadioEvent::OperationFailed {
               id: Some(id),
               operation: Operation::Disconnect,
               reason: failure(e),
            },
         };
         send(&events, event).await;
      });
      Ok(())
   }

   fn discover_services(&mut self, id: &DeviceId) -> std::result::Result<(), FailureReason> {
      self.prune_links();
      let device = self.device(id)?;
      let id = id.clone();
      let events = self.events.clone();
      tokio::spawn(async move {
         let event = match resolve_services(&device).await {
            Ok(services) => RadioEvent::ServicesDiscovered { id, services },
            Err(reason) => RadioEvent::OperationFailed {
               id: Some(id),
               operation: Operation::DiscoverServices,
               reason,
            },
         };
         send(&events, event).await;
      });
      Ok(())
   }
}

async fn send(events: &RadioEventSender, event: RadioEvent) {
   if let Err(e) = events.send(event).await {
      debug!("Radio event dropped after shutdown: {e}");
   }
}

fn failure(e: bluer::Error) -> FailureReason {
   match e.kind {
      ErrorKind::NotReady | ErrorKind::NotAuthorized | ErrorKind::NotAvailable => {
         FailureReason::Unavailable
      },
      ErrorKind::NotPermitted | ErrorKind::InvalidOffset | ErrorKind::InvalidLength => {
         FailureReason::Gatt(SmolStr::from(e.message))
      },
      _ => FailureReason::internal(e.to_string()),
   }
}

async fn run_scan(adapter: Adapter, options: ScanOptions, events: RadioEventSender) {
   let mut filter = DiscoveryFilter::default();
   filter.transport = DiscoveryTransport::Le;
   filter.duplicate_data = options.allow_duplicates;
   filter.uuids = options.service_filter.iter().copied().collect();

   if let Err(e) = adapter.set_discovery_filter(filter).await {
      warn!("Failed to set discovery filter: {e}");
      send(
         &events,
         RadioEvent::OperationFailed {
            id: None,
            operation: Operation::StartScan,
            reason: failure(e),
         },
      )
      .await;
      return;
   }

   // With duplicates, property changes of known devices are reported too.
   let stream = if options.allow_duplicates {
      adapter.discover_devices_with_changes().await.map(StreamExt::boxed)
   } else {
      adapter.discover_devices().await.map(StreamExt::boxed)
   };
   let mut stream = match stream {
      Ok(stream) => stream,
      Err(e) => {
         warn!("Failed to start discovery: {e}");
         send(
            &events,
            RadioEvent::OperationFailed {
               id: None,
               operation: Operation::StartScan,
               reason: failure(e),
            },
         )
         .await;
         return;
      },
   };

   while let Some(event) = stream.next().await {
      let AdapterEvent::DeviceAdded(addr) = event else {
         continue;
      };
      match advertisement(&adapter, addr).await {
         Ok(event) => send(&events, event).await,
         Err(e) => debug!("Skipping {addr}: {e}"),
      }
   }

   info!("Discovery ended on {}", adapter.name());
   send(&events, RadioEvent::ScanStopped).await;
}

/// Builds an advertisement from the properties BlueZ collected for `addr`.
async fn advertisement(adapter: &Adapter, addr: Address) -> bluer::Result<RadioEvent> {
   let device = adapter.device(addr)?;
   let data = AdvertisementData {
      local_name: device.name().await?.map(SmolStr::from),
      flags: None,
      services: device.uuids().await?.unwrap_or_default().into_iter().collect(),
      service_data: device
         .service_data()
         .await?
         .unwrap_or_default()
         .into_iter()
         .collect(),
      manufacturer_data: device
         .manufacturer_data()
         .await?
         .unwrap_or_default()
         .into_iter()
         .collect(),
      tx_power: device.tx_power().await?,
   };
   // Types BlueZ does not decode itself; not every stack version has them.
   let raw = match device.advertising_data().await {
      Ok(types) => types.and_then(ad_structures),
      Err(e) => {
         debug!("{addr}: no raw advertising data: {e}");
         None
      },
   };
   Ok(RadioEvent::AdvertisementSeen {
      id: DeviceId::new(addr.to_string()),
      rssi: device.rssi().await?,
      data,
      raw,
   })
}

/// Re-encodes per-type advertising data as length-prefixed AD structures.
fn ad_structures(types: HashMap<u8, Vec<u8>>) -> Option<Vec<u8>> {
   let mut raw = Vec::new();
   for (ad_type, body) in types {
      let Ok(len) = u8::try_from(body.len() + 1) else {
         continue;
      };
      raw.push(len);
      raw.push(ad_type);
      raw.extend(body);
   }
   (!raw.is_empty()).then_some(raw)
}

/// Connects and then watches the link until it drops.
async fn run_link(device: Device, id: DeviceId, events: RadioEventSender) {
   if let Err(e) = device.connect().await
      && !matches!(e.kind, ErrorKind::AlreadyConnected)
   {
      send(
         &events,
         RadioEvent::OperationFailed {
            id: Some(id),
            operation: Operation::Connect,
            reason: failure(e),
         },
      )
      .await;
      return;
   }

   // Subscribe before reporting so a quick drop is not missed.
   let watch = device.events().await;
   send(
      &events,
      RadioEvent::ConnectionStateChanged {
         id: id.clone(),
         state: LinkState::Connected,
      },
   )
   .await;

   let Ok(stream) = watch else {
      warn!("{id}: cannot watch link state");
      return;
   };
   let mut stream = pin!(stream);
   while let Some(DeviceEvent::PropertyChanged(property)) = stream.next().await {
      match property {
         DeviceProperty::Connected(false) => {
            send(
               &events,
               RadioEvent::ConnectionStateChanged {
                  id,
                  state: LinkState::Disconnected,
               },
            )
            .await;
            return;
         },
         // Also cleared on the way down; only a live link means the peer
         // changed its services.
         DeviceProperty::ServicesResolved(false) => {
            if device.is_connected().await.unwrap_or(false) {
               debug!("{id}: services invalidated");
               send(&events, RadioEvent::ServicesInvalidated { id: id.clone() }).await;
            }
         },
         _ => {},
      }
   }
}

async fn resolve_services(device: &Device) -> std::result::Result<Vec<Service>, FailureReason> {
   while !device.is_services_resolved().await.map_err(failure)? {
      if !device.is_connected().await.map_err(failure)? {
         return Err(FailureReason::internal("link dropped during discovery"));
      }
      time::sleep(SERVICES_RESOLVED_POLL).await;
   }
   collect_services(device).await.map_err(failure)
}

async fn collect_services(device: &Device) -> bluer::Result<Vec<Service>> {
   let mut services = Vec::new();
   for service in device.services().await? {
      let mut characteristics = Vec::new();
      for characteristic in service.characteristics().await? {
         characteristics.push(characteristic.uuid().await?);
      }
      services.push(Service::new(service.uuid().await?, characteristics));
   }
   Ok(services)
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_ad_structures_decode() {
      let types = HashMap::from([(0x01, vec![0x06]), (0x09, b"Sensor".to_vec())]);
      let raw = ad_structures(types).unwrap();
      let data = AdvertisementData::parse(&raw).unwrap();
      assert_eq!(data.flags, Some(0x06));
      assert_eq!(data.local_name.as_deref(), Some("Sensor"));

      assert_eq!(ad_structures(HashMap::new()), None);
   }

   #[test]
   fn test_oversized_ad_structure_is_skipped() {
      let types = HashMap::from([(0xFF, vec![0; 300])]);
      assert_eq!(ad_structures(types), None);
   }
}
