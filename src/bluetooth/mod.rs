//! Radio layer.
//!
//! Defines the command/event boundary between the session and a platform
//! Bluetooth stack, and the BlueZ implementation of it.

pub mod bluez;
#[cfg(test)]
pub mod mock;
pub mod radio;
