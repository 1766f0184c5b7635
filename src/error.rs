//! Error types for the BLE session manager.
//!
//! `SessionError` is the caller-facing taxonomy returned by every session
//! operation. `Error` wraps it together with the failures of the outer
//! layers (BlueZ, D-Bus, configuration, I/O) used by the daemon.

use smol_str::SmolStr;
use thiserror::Error;

use crate::types::{ConnectionState, DeviceId};

/// Outcome of a failed session operation.
///
/// Cloneable so a single outcome can be handed to every coalesced waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
   /// Radio is off, missing or not authorized. Retry once the user enables it.
   #[error("Radio unavailable")]
   RadioUnavailable,

   #[error("Already scanning")]
   AlreadyScanning,

   #[error("Cannot {operation} while {state}")]
   InvalidState {
      operation: &'static str,
      state: ConnectionState,
   },

   #[error("Connection attempt timed out")]
   ConnectTimeout,

   #[error("Service discovery failed: {0}")]
   DiscoveryFailed(SmolStr),

   /// The link dropped without being asked to.
   #[error("Link lost")]
   LinkLost,

   /// The operation was superseded by a disconnect issued by the caller.
   #[error("Operation cancelled by disconnect")]
   Cancelled,

   #[error("Radio internal error: {0}")]
   RadioInternalError(SmolStr),

   #[error("Connection limit reached ({0})")]
   TooManyConnections(usize),

   #[error("Device not connected: {0}")]
   NotConnected(DeviceId),

   #[error("Session has been shut down")]
   SessionShutdown,
}

impl SessionError {
   /// Transient link conditions that a caller may simply retry.
   pub const fn is_retryable(&self) -> bool {
      matches!(
         self,
         Self::ConnectTimeout | Self::DiscoveryFailed(_) | Self::LinkLost | Self::Cancelled
      )
   }
}

/// Returned by `start_scan`.
pub type ScanError = SessionError;
/// Returned by `connect`.
pub type ConnectError = SessionError;
/// Returned by `disconnect`.
pub type DisconnectError = SessionError;
/// Returned by `discover_services`.
pub type DiscoveryError = SessionError;

/// Convenience alias for session operation results.
pub type SessionResult<T> = std::result::Result<T, SessionError>;

/// Daemon-level error type.
#[derive(Error, Debug)]
pub enum Error {
   #[error(transparent)]
   Session(#[from] SessionError),

   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("JSON error: {0}")]
   Json(#[from] serde_json::Error),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Adapter not found")]
   AdapterNotFound,
}

/// Convenience type alias for Results with the daemon `Error`.
pub type Result<T> = std::result::Result<T, Error>;
