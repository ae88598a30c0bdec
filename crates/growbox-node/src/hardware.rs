//! Hardware capabilities consumed by duty-cycle actors.
//!
//! An actor never talks to a bus or a pin directly: it receives a handle
//! implementing one of the capability traits below from a [`Board`], which
//! owns the electrical details of the device.

use std::fmt;

use growbox::profile::{AirProbe, Rgb};

use growbox_drivers::dht::{Dht, DhtError};
use growbox_drivers::si7021::{Si7021, Si7021Error};

use crate::error::HardwareError;

/// A digital output driving an actuator.
pub trait Switch {
    /// Drives the output to the given level.
    ///
    /// # Errors
    ///
    /// Fails if the output cannot be written.
    fn set_level(&mut self, high: bool) -> Result<(), HardwareError>;
}

/// An addressable LED strip.
pub trait LedStrip {
    /// Sets every LED of the strip to the given color.
    ///
    /// # Errors
    ///
    /// Fails if the strip cannot be written.
    fn fill(&mut self, color: Rgb) -> Result<(), HardwareError>;
}

/// An air temperature and humidity probe.
#[allow(async_fn_in_trait)]
pub trait Hygrometer {
    /// Performs a measurement.
    ///
    /// # Errors
    ///
    /// Fails if the probe does not answer or answers with corrupted data.
    async fn measure(&mut self) -> Result<Climate, HardwareError>;
}

/// A bus of water temperature probes.
#[allow(async_fn_in_trait)]
pub trait ThermometerBus {
    /// Discovers the probes attached to the bus.
    ///
    /// # Errors
    ///
    /// Fails if the bus cannot be scanned.
    async fn scan(&mut self) -> Result<Vec<ProbeAddress>, HardwareError>;

    /// Starts a temperature conversion on every probe of the bus.
    ///
    /// # Errors
    ///
    /// Fails if the command cannot be written on the bus.
    async fn convert(&mut self) -> Result<(), HardwareError>;

    /// Reads the last converted temperature of a probe, in degrees Celsius.
    ///
    /// # Errors
    ///
    /// Fails if the probe does not answer.
    async fn read_temperature(&mut self, probe: ProbeAddress) -> Result<f32, HardwareError>;
}

/// A device hosting the hardware handles of a node.
///
/// Each factory is called once per configured sensor, at scheduler
/// construction. A refused handle aborts the construction.
pub trait Board {
    /// Output driving a pump.
    type Output: Switch + 'static;
    /// Addressable LED strip.
    type Strip: LedStrip + 'static;
    /// Air probe.
    type AirSensor: Hygrometer + 'static;
    /// Water probes bus.
    type WaterBus: ThermometerBus + 'static;

    /// Claims a digital output.
    ///
    /// # Errors
    ///
    /// Fails if the pin cannot be configured as an output.
    fn output(&mut self, pin: u8) -> Result<Self::Output, HardwareError>;

    /// Claims an LED strip.
    ///
    /// # Errors
    ///
    /// Fails if the strip cannot be set up on the pin.
    fn led_strip(&mut self, pin: u8, leds: u16) -> Result<Self::Strip, HardwareError>;

    /// Claims an air probe.
    ///
    /// # Errors
    ///
    /// Fails if the probe pins cannot be set up.
    fn air_sensor(&mut self, probe: AirProbe) -> Result<Self::AirSensor, HardwareError>;

    /// Claims a water probes bus.
    ///
    /// # Errors
    ///
    /// Fails if the bus cannot be set up on the pin.
    fn water_bus(&mut self, pin: u8) -> Result<Self::WaterBus, HardwareError>;
}

/// A temperature and humidity measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Climate {
    /// Temperature in degrees Celsius.
    pub temperature: f32,
    /// Relative humidity as a percentage.
    pub humidity: f32,
}

impl Climate {
    /// Creates a [`Climate`].
    #[must_use]
    pub const fn new(temperature: f32, humidity: f32) -> Self {
        Self {
            temperature,
            humidity,
        }
    }
}

impl From<growbox_drivers::dht::Measurement> for Climate {
    fn from(m: growbox_drivers::dht::Measurement) -> Self {
        Self::new(m.temperature, m.humidity)
    }
}

impl From<growbox_drivers::si7021::Measurement> for Climate {
    fn from(m: growbox_drivers::si7021::Measurement) -> Self {
        Self::new(m.temperature, m.humidity)
    }
}

/// The 64-bit ROM address of a one-wire probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProbeAddress(pub [u8; 8]);

impl fmt::Display for ProbeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl<P, D> Hygrometer for Dht<P, D>
where
    P: embedded_hal::digital::InputPin + embedded_hal::digital::OutputPin,
    D: embedded_hal::delay::DelayNs,
{
    async fn measure(&mut self) -> Result<Climate, HardwareError> {
        // The single-wire protocol is timing-critical, so the read blocks.
        self.read().map(Climate::from).map_err(|e| match e {
            DhtError::Pin(e) => HardwareError::read(format!("dht pin: {e:?}")),
            DhtError::ChecksumMismatch => HardwareError::read("dht: checksum mismatch"),
            DhtError::Timeout => HardwareError::not_found("dht: no answer from the probe"),
        })
    }
}

impl<I2C, D> Hygrometer for Si7021<I2C, D>
where
    I2C: embedded_hal_async::i2c::I2c,
    D: embedded_hal_async::delay::DelayNs,
{
    async fn measure(&mut self) -> Result<Climate, HardwareError> {
        Si7021::measure(self)
            .await
            .map(Climate::from)
            .map_err(|e| match e {
                Si7021Error::I2c(e) => HardwareError::read(format!("si7021 bus: {e:?}")),
                Si7021Error::ChecksumMismatch => HardwareError::read("si7021: checksum mismatch"),
            })
    }
}
