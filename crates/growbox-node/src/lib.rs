//! The runtime of a `growbox` node.
//!
//! A node boots from an encrypted bootstrap file, joins a wireless network,
//! connects to a message broker, and then runs one duty-cycle actor per
//! configured sensor or actuator. Each actor drives its hardware, publishes
//! a status event, and rests for its configured period, forever.
//!
//! The crate is organized around a few seams:
//!
//! - [`credentials`] turns the bootstrap file into a validated
//!   [`DeviceProfile`](growbox::profile::DeviceProfile)
//! - [`link`] owns the wireless association and the single broker session,
//!   serializing every publish and recovering the link when it drops
//! - [`hardware`] describes what actors need from a board, while [`sim`]
//!   provides a board that only logs
//! - [`actor`] and [`scheduler`] run the duty cycles concurrently on a single
//!   thread
//!
//! Host implementations of the network collaborators are provided by
//! [`net`] and [`mqtt`].
//!
//! The binary always runs on the simulated board. A board driving physical
//! pins is not part of this crate: the [`hardware`] adapters exist so that
//! such a board can hand the `growbox-drivers` probes to the actors.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

/// Duty-cycle actors and their per-kind capabilities.
pub mod actor;
/// Boot sequence.
pub mod boot;
/// Bootstrap file decryption and validation.
pub mod credentials;
/// Error management.
pub mod error;
/// Hardware capabilities and driver adapters.
pub mod hardware;
/// The broker link and its supervisor.
pub mod link;
/// `MQTT` broker transport.
pub mod mqtt;
/// Host radio.
pub mod net;
/// Concurrent execution of the actors.
pub mod scheduler;
/// Simulated board.
pub mod sim;
