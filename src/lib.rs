//! Firmware for an ESP32 sensor node: the over-the-air update pipeline and
//! the status contract it publishes to the character display.
//!
//! Everything outside [`platform`] is target-independent and runs on the
//! host against [`sim`].

pub mod config;
pub mod display;
pub mod logging;
pub mod ota;
pub mod version;

#[cfg(target_os = "espidf")]
pub mod platform;

#[cfg(not(target_os = "espidf"))]
pub mod sim;
