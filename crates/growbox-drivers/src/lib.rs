//! `growbox-drivers` is a library crate that provides architecture-agnostic
//! drivers for the air temperature and humidity probes a growbox node can be
//! wired to.
//!
//! All drivers are implemented using only the [`embedded-hal`] and
//! [`embedded-hal-async`] traits, ensuring compatibility with any platform
//! that supports these abstractions.
//!
//! [`embedded-hal`]: https://crates.io/crates/embedded-hal
//! [`embedded-hal-async`]: https://crates.io/crates/embedded-hal-async

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![no_std]

/// The `DHT11` / `DHT22` single-wire driver.
#[cfg(feature = "dht")]
pub mod dht;

/// The `Si7021` two-wire driver.
#[cfg(feature = "si7021")]
pub mod si7021;
