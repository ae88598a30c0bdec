//! The data model shared by every part of a `growbox` node.
//!
//! This crate provides:
//!
//! - The device profile: identity, network credentials, and the ordered list
//!   of sensors and actuators a node drives. A profile is validated once when
//!   it is built and is read-only afterwards.
//! - Telemetry events: the structured status a node publishes every time one
//!   of its duty cycles changes phase, together with their compact wire
//!   encoding.
//!
//! A profile is produced by the node runtime from its bootstrap file, while
//! telemetry events are produced by its duty-cycle tasks and consumed by the
//! broker on the other side of the network.
//!
//! This crate can be compiled for both `std` and `no_std` environments.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![no_std]

extern crate alloc;

/// Device profile, sensor specifications, and their invariants.
pub mod profile;
/// Telemetry events and their wire encoding.
pub mod telemetry;

#[cfg(test)]
pub(crate) fn serialize<T: serde::Serialize>(value: T) -> serde_json::Value {
    serde_json::to_value(value).unwrap()
}
