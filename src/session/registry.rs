//! Device registry.
//!
//! Bookkeeping of every device seen while scanning, keyed by identity. Each
//! new advertisement for a known device is merged into its entry.

use std::{
   collections::{HashMap, hash_map::Entry},
   time::{Duration, Instant},
};

use serde::Deserialize;
use serde_json::json;
use smol_str::SmolStr;
use uuid::Uuid;

use crate::{
   advertisement::{AdvertisementData, AdvertisementRecord},
   types::DeviceId,
};

/// Optional criteria for [`DeviceRegistry::list_devices`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DeviceFilter {
   /// Case-insensitive substring of the advertised name (or configured alias).
   pub name_contains: Option<String>,
   pub min_rssi: Option<i16>,
   pub service: Option<Uuid>,
}

impl DeviceFilter {
   pub fn matches(&self, entry: &DeviceEntry) -> bool {
      if let Some(min) = self.min_rssi
         && entry.rssi.is_none_or(|rssi| rssi < min)
      {
         return false;
      }
      if let Some(service) = &self.service
         && !entry.data.advertises_any(std::iter::once(service))
      {
         return false;
      }
      if let Some(needle) = &self.name_contains {
         let needle = needle.to_lowercase();
         return entry
            .name()
            .is_some_and(|name| name.to_lowercase().contains(&needle));
      }
      true
   }
}

/// Everything known about one device.
#[derive(Debug, Clone)]
pub struct DeviceEntry {
   pub id: DeviceId,
   pub rssi: Option<i16>,
   pub data: AdvertisementData,
   /// Most recent raw payload.
   pub raw: Option<Vec<u8>>,
   pub alias: Option<SmolStr>,
   pub first_seen: Instant,
   pub last_seen: Instant,
   pub seen_count: u32,
}

impl DeviceEntry {
   fn new(record: AdvertisementRecord, alias: Option<SmolStr>) -> Self {
      Self {
         id: record.id,
         rssi: record.rssi,
         data: record.data,
         raw: record.raw,
         alias,
         first_seen: record.observed_at,
         last_seen: record.observed_at,
         seen_count: 1,
      }
   }

   /// Advertised name, falling back to the configured alias.
   pub fn name(&self) -> Option<&str> {
      self.data.local_name.as_deref().or(self.alias.as_deref())
   }

   /// Snapshot of the merged state as an advertisement record.
   pub fn record(&self) -> AdvertisementRecord {
      AdvertisementRecord {
         id: self.id.clone(),
         rssi: self.rssi,
         data: self.data.clone(),
         raw: self.raw.clone(),
         observed_at: self.last_seen,
      }
   }

   pub fn to_json(&self) -> serde_json::Value {
      let mut info = self.record().to_json();
      info["name"] = json!(self.name());
      info["seen_count"] = json!(self.seen_count);
      info
   }
}

/// Registry of devices discovered by scanning.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
   devices: HashMap<DeviceId, DeviceEntry>,
   aliases: HashMap<DeviceId, SmolStr>,
}

impl DeviceRegistry {
   pub fn new() -> Self {
      Self::default()
   }

   /// Names used for devices whose advertisements carry no local name.
   pub fn with_aliases(aliases: impl IntoIterator<Item = (DeviceId, SmolStr)>) -> Self {
      Self {
         devices: HashMap::new(),
         aliases: aliases.into_iter().collect(),
      }
   }

   /// Inserts or merges an advertisement. Returns `true` for a newly seen device.
   pub fn record_advertisement(&mut self, record: AdvertisementRecord) -> bool {
      match self.devices.entry(record.id.clone()) {
         Entry::Occupied(mut occupied) => {
            let entry = occupied.get_mut();
            entry.rssi = record.rssi.or(entry.rssi);
            entry.data.merge(record.data);
            if record.raw.is_some() {
               entry.raw = record.raw;
            }
            entry.last_seen = entry.last_seen.max(record.observed_at);
            entry.seen_count = entry.seen_count.saturating_add(1);
            false
         },
         Entry::Vacant(vacant) => {
            let alias = self.aliases.get(&record.id).cloned();
            vacant.insert(DeviceEntry::new(record, alias));
            true
         },
      }
   }

   pub fn get(&self, id: &DeviceId) -> Option<&DeviceEntry> {
      self.devices.get(id)
   }

   pub fn len(&self) -> usize {
      self.devices.len()
   }

   pub fn is_empty(&self) -> bool {
      self.devices.is_empty()
   }

   /// Lazily iterates the devices matching `filter`.
   ///
   /// The iterator is `Clone`, so a consumer can restart it from the
   /// beginning without re-querying the registry.
   pub fn list_devices<'a>(
      &'a self,
      filter: &'a DeviceFilter,
   ) -> impl Iterator<Item = &'a DeviceEntry> + Clone + 'a {
      self.devices.values().filter(move |entry| filter.matches(entry))
   }

   /// Drops devices not observed within `max_age`, returning their identities.
   pub fn purge_stale(&mut self, max_age: Duration) -> Vec<DeviceId> {
      self.purge_stale_at(max_age, Instant::now())
   }

   fn purge_stale_at(&mut self, max_age: Duration, now: Instant) -> Vec<DeviceId> {
      let mut purged = Vec::new();
      self.devices.retain(|id, entry| {
         let fresh = now.saturating_duration_since(entry.last_seen) <= max_age;
         if !fresh {
            purged.push(id.clone());
         }
         fresh
      });
      purged
   }
}
