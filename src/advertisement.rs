//! Advertisement payloads.
//!
//! Radios either hand us decoded advertisement fields (BlueZ) or the raw
//! legacy advertising payload. Both end up as an [`AdvertisementData`]; the
//! raw form is decoded here from its `[len][type][data]` AD structures.

use std::{collections::BTreeMap, time::Instant};

use log::debug;
use serde_json::json;
use smallvec::SmallVec;
use smol_str::SmolStr;
use thiserror::Error;
use uuid::Uuid;

use crate::types::DeviceId;

/// Bluetooth base UUID, `0000xxxx-0000-1000-8000-00805f9b34fb`.
const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

const AD_FLAGS: u8 = 0x01;
const AD_UUID16_INCOMPLETE: u8 = 0x02;
const AD_UUID16_COMPLETE: u8 = 0x03;
const AD_UUID32_INCOMPLETE: u8 = 0x04;
const AD_UUID32_COMPLETE: u8 = 0x05;
const AD_UUID128_INCOMPLETE: u8 = 0x06;
const AD_UUID128_COMPLETE: u8 = 0x07;
const AD_NAME_SHORT: u8 = 0x08;
const AD_NAME_COMPLETE: u8 = 0x09;
const AD_TX_POWER: u8 = 0x0A;
const AD_SERVICE_DATA16: u8 = 0x16;
const AD_SERVICE_DATA32: u8 = 0x20;
const AD_SERVICE_DATA128: u8 = 0x21;
const AD_MANUFACTURER: u8 = 0xFF;

/// Error type for advertisement payload decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
   /// An AD structure claims more bytes than remain in the payload
   #[error("AD structure at offset {offset} truncated: expected {expected} bytes, got {actual}")]
   Truncated {
      offset: usize,
      expected: usize,
      actual: usize,
   },

   /// An AD structure body has a length that is invalid for its type
   #[error("Invalid length {len} for AD type 0x{ad_type:02x}")]
   InvalidLength { ad_type: u8, len: usize },
}

/// Expands a 16- or 32-bit SIG-assigned UUID onto the base UUID.
pub const fn uuid_from_short(short: u32) -> Uuid {
   Uuid::from_u128(BASE_UUID | ((short as u128) << 96))
}

/// Decoded advertisement fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvertisementData {
   pub local_name: Option<SmolStr>,
   pub flags: Option<u8>,
   pub services: SmallVec<[Uuid; 4]>,
   pub service_data: BTreeMap<Uuid, Vec<u8>>,
   pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
   pub tx_power: Option<i16>,
}

impl AdvertisementData {
   /// Decodes a raw legacy advertising (or scan response) payload.
   ///
   /// A zero length byte ends the payload; trailing bytes are padding.
   /// Unknown AD types are skipped.
   pub fn parse(raw: &[u8]) -> Result<Self, PayloadError> {
      let mut data = Self::default();
      let mut rest = raw;

      while let [len, tail @ ..] = rest {
         let len = *len as usize;
         if len == 0 {
            break;
         }
         if tail.len() < len {
            return Err(PayloadError::Truncated {
               offset: raw.len() - rest.len(),
               expected: len,
               actual: tail.len(),
            });
         }
         let (structure, next) = tail.split_at(len);
         data.apply(structure[0], &structure[1..])?;
         rest = next;
      }

      Ok(data)
   }

   fn apply(&mut self, ad_type: u8, body: &[u8]) -> Result<(), PayloadError> {
      let invalid = || PayloadError::InvalidLength {
         ad_type,
         len: body.len(),
      };

      match ad_type {
         AD_FLAGS => self.flags = body.first().copied(),
         AD_UUID16_INCOMPLETE | AD_UUID16_COMPLETE => {
            if body.len() % 2 != 0 {
               return Err(invalid());
            }
            for chunk in body.chunks_exact(2) {
               self.add_service(uuid_from_short(u16::from_le_bytes([chunk[0], chunk[1]]) as u32));
            }
         },
         AD_UUID32_INCOMPLETE | AD_UUID32_COMPLETE => {
            if body.len() % 4 != 0 {
               return Err(invalid());
            }
            for chunk in body.chunks_exact(4) {
               self.add_service(uuid_from_short(u32::from_le_bytes([
                  chunk[0], chunk[1], chunk[2], chunk[3],
               ])));
            }
         },
         AD_UUID128_INCOMPLETE | AD_UUID128_COMPLETE => {
            if body.len() % 16 != 0 {
               return Err(invalid());
            }
            for chunk in body.chunks_exact(16) {
               self.add_service(uuid_from_le(chunk));
            }
         },
         AD_NAME_SHORT | AD_NAME_COMPLETE => {
            // A complete name always wins over a shortened one.
            if ad_type == AD_NAME_COMPLETE || self.local_name.is_none() {
               self.local_name = Some(String::from_utf8_lossy(body).into());
            }
         },
         AD_TX_POWER => {
            let &[power] = body else {
               return Err(invalid());
            };
            self.tx_power = Some(i16::from(power as i8));
         },
         AD_SERVICE_DATA16 => {
            let [lo, hi, payload @ ..] = body else {
               return Err(invalid());
            };
            let uuid = uuid_from_short(u16::from_le_bytes([*lo, *hi]) as u32);
            self.service_data.insert(uuid, payload.to_vec());
         },
         AD_SERVICE_DATA32 => {
            if body.len() < 4 {
               return Err(invalid());
            }
            let (id, payload) = body.split_at(4);
            let uuid = uuid_from_short(u32::from_le_bytes([id[0], id[1], id[2], id[3]]));
            self.service_data.insert(uuid, payload.to_vec());
         },
         AD_SERVICE_DATA128 => {
            if body.len() < 16 {
               return Err(invalid());
            }
            let (id, payload) = body.split_at(16);
            self.service_data.insert(uuid_from_le(id), payload.to_vec());
         },
         AD_MANUFACTURER => {
            let [lo, hi, payload @ ..] = body else {
               return Err(invalid());
            };
            self
               .manufacturer_data
               .insert(u16::from_le_bytes([*lo, *hi]), payload.to_vec());
         },
         other => debug!("Skipping AD type 0x{other:02x} ({} bytes)", body.len()),
      }
      Ok(())
   }

   fn add_service(&mut self, uuid: Uuid) {
      if !self.services.contains(&uuid) {
         self.services.push(uuid);
      }
   }

   /// Folds a newer advertisement for the same device into this one.
   ///
   /// Fields the newer advertisement carries replace ours; fields it lacks
   /// (a scan response usually has no flags, an ADV_IND often no name) are
   /// kept.
   pub fn merge(&mut self, newer: Self) {
      if newer.local_name.is_some() {
         self.local_name = newer.local_name;
      }
      if newer.flags.is_some() {
         self.flags = newer.flags;
      }
      if newer.tx_power.is_some() {
         self.tx_power = newer.tx_power;
      }
      for uuid in newer.services {
         self.add_service(uuid);
      }
      self.service_data.extend(newer.service_data);
      self.manufacturer_data.extend(newer.manufacturer_data);
   }

   /// Whether any advertised (or service-data) UUID is in `services`.
   pub fn advertises_any<'a>(&self, mut services: impl Iterator<Item = &'a Uuid>) -> bool {
      services.any(|uuid| self.services.contains(uuid) || self.service_data.contains_key(uuid))
   }

   pub fn to_json(&self) -> serde_json::Value {
      let manufacturer: serde_json::Map<_, _> = self
         .manufacturer_data
         .iter()
         .map(|(company, data)| (format!("{company:#06x}"), json!(hex::encode(data))))
         .collect();
      let service_data: serde_json::Map<_, _> = self
         .service_data
         .iter()
         .map(|(uuid, data)| (uuid.to_string(), json!(hex::encode(data))))
         .collect();

      json!({
          "name": self.local_name.as_deref(),
          "services": self.services.iter().map(Uuid::to_string).collect::<Vec<_>>(),
          "service_data": service_data,
          "manufacturer_data": manufacturer,
          "tx_power": self.tx_power,
      })
   }
}

fn uuid_from_le(bytes: &[u8]) -> Uuid {
   let mut buf = [0u8; 16];
   buf.copy_from_slice(&bytes[..16]);
   Uuid::from_u128(u128::from_le_bytes(buf))
}

/// A single observation of a device while scanning.
#[derive(Debug, Clone, PartialEq)]
pub struct AdvertisementRecord {
   pub id: DeviceId,
   pub rssi: Option<i16>,
   pub data: AdvertisementData,
   /// Payload `data` was decoded from, if any.
   pub raw: Option<Vec<u8>>,
   pub observed_at: Instant,
}

impl AdvertisementRecord {
   pub fn new(id: DeviceId, rssi: Option<i16>, data: AdvertisementData) -> Self {
      Self {
         id,
         rssi,
         data,
         raw: None,
         observed_at: Instant::now(),
      }
   }

   #[must_use]
   pub fn with_raw(mut self, raw: Option<Vec<u8>>) -> Self {
      self.raw = raw;
      self
   }

   pub fn to_json(&self) -> serde_json::Value {
      let mut info = self.data.to_json();
      info["id"] = json!(self.id.as_str());
      info["rssi"] = json!(self.rssi);
      if let Some(raw) = &self.raw {
         info["raw"] = json!(hex::encode(raw));
      }
      info["age_ms"] = json!(self.observed_at.elapsed().as_millis() as u64);
      info
   }
}
