//! # Si7021 Driver
//!
//! This module provides an asynchronous, architecture-agnostic driver for the
//! `Si7021` relative humidity and temperature probe, read over the I²C
//! protocol.
//!
//! A measurement triggers a humidity conversion, which also converts the
//! temperature. The temperature is then fetched from the same conversion,
//! so both values always belong to the same sample.
//!
//! For detailed information and specifications, see the
//! [datasheet](https://www.silabs.com/documents/public/data-sheets/Si7021-A20.pdf).

use core::result::Result::{self, Err, Ok};

use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::I2c;

/// Fixed I²C address of the probe.
pub const ADDRESS: u8 = 0x40;

// Instruction set opcodes.
const MEASURE_HUMIDITY_NO_HOLD: u8 = 0xF5;
const READ_TEMPERATURE_FROM_HUMIDITY: u8 = 0xE0;
const RESET: u8 = 0xFE;

// A 12-bit humidity conversion followed by a 14-bit temperature conversion
// takes at most 12 + 10.8 ms.
const CONVERSION_TIME_MS: u32 = 25;
// Power-up time after a soft reset.
const RESET_TIME_MS: u32 = 15;

/// A single humidity and temperature measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    /// Relative humidity as a percentage (% RH), clamped to `0..=100`.
    pub humidity: f32,
    /// Temperature in degrees Celsius (°C).
    pub temperature: f32,
}

/// Errors that may occur while interacting with the `Si7021` probe.
#[derive(Debug, Copy, Clone)]
pub enum Si7021Error<E> {
    /// I²C bus error.
    I2c(E),
    /// The humidity frame failed its CRC-8 check.
    ChecksumMismatch,
}

impl<E> From<E> for Si7021Error<E> {
    fn from(e: E) -> Self {
        Si7021Error::I2c(e)
    }
}

/// `Si7021` driver.
pub struct Si7021<I2C, D>
where
    D: DelayNs,
{
    i2c: I2C,
    delay: D,
}

impl<I2C, E, D> Si7021<I2C, D>
where
    I2C: I2c<u8, Error = E>,
    D: DelayNs,
{
    /// Creates a new [`Si7021`] driver with the given I²C bus and delay
    /// provider.
    #[must_use]
    pub fn new(i2c: I2C, delay: D) -> Self {
        Self { i2c, delay }
    }

    /// Resets the probe to its power-up state.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying I²C bus operation fails.
    pub async fn reset(&mut self) -> Result<(), Si7021Error<E>> {
        self.i2c.write(ADDRESS, &[RESET]).await?;
        self.delay.delay_ms(RESET_TIME_MS).await;
        Ok(())
    }

    /// Performs a humidity and temperature measurement.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - An I²C bus operation fails
    /// - The humidity frame fails its checksum
    pub async fn measure(&mut self) -> Result<Measurement, Si7021Error<E>> {
        self.i2c.write(ADDRESS, &[MEASURE_HUMIDITY_NO_HOLD]).await?;
        self.delay.delay_ms(CONVERSION_TIME_MS).await;

        let mut frame = [0; 3];
        self.i2c.read(ADDRESS, &mut frame).await?;
        let [msb, lsb, crc] = frame;
        if crc8(&[msb, lsb]) != crc {
            return Err(Si7021Error::ChecksumMismatch);
        }
        let humidity = Self::raw_to_humidity(u16::from_be_bytes([msb, lsb]));

        let mut raw = [0; 2];
        self.i2c
            .write_read(ADDRESS, &[READ_TEMPERATURE_FROM_HUMIDITY], &mut raw)
            .await?;
        let temperature = Self::raw_to_temperature(u16::from_be_bytes(raw));

        Ok(Measurement {
            humidity,
            temperature,
        })
    }

    #[inline]
    fn raw_to_humidity(raw: u16) -> f32 {
        // The probe may report slightly outside of the physical range.
        (125.0 * f32::from(raw) / 65536.0 - 6.0).clamp(0.0, 100.0)
    }

    #[inline]
    fn raw_to_temperature(raw: u16) -> f32 {
        175.72 * f32::from(raw) / 65536.0 - 46.85
    }
}

// CRC-8 with polynomial x^8 + x^5 + x^4 + 1 (0x31), initialized to zero.
fn crc8(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 == 0 {
                crc << 1
            } else {
                (crc << 1) ^ 0x31
            };
        }
    }
    crc
}
