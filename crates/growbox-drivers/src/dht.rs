//! # DHT Driver
//!
//! This module provides an architecture-agnostic driver for the `DHT11` and
//! `DHT22` temperature and humidity probes.
//! Both models share the same single-wire protocol and differ only in the
//! length of the start signal and in how the data bytes are encoded.
//!
//! The driver is synchronous to meet the strict timing requirements of the
//! protocol, hence all timing-critical operations use precise blocking delays.
//!
//! Each reading provides:
//! - **Humidity**: Relative humidity as a percentage (% RH)
//! - **Temperature**: Temperature in degrees Celsius (°C)
//!
//! For the protocol description, refer to the
//! [DHT11 datasheet](https://www.mouser.com/datasheet/2/758/DHT11-Technical-Data-Sheet-Translated-Version-1143054.pdf).

use core::result::Result::{self, Err, Ok};

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin, PinState};

// Protocol-specific timing constants.
const START_SIGNAL_HIGH_US: u32 = 40; // Line released for ~20–40 µs before the probe answers.
const BIT_SAMPLE_DELAY_US: u32 = 35; // A high pulse longer than this is a `1`.
const POLL_DELAY_US: u32 = 1; // Delay between pin state polls when waiting for edges.
const MAX_ATTEMPTS: usize = 100; // Maximum polling iterations before timeout.

/// The probe model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Model {
    /// `DHT11`: integral readings, 1 °C and 1 % RH resolution.
    Dht11,
    /// `DHT22`: tenth-of-a-unit readings.
    Dht22,
}

impl Model {
    #[inline]
    const fn start_signal_low_ms(self) -> u32 {
        // The line must be held low long enough for the probe to wake up.
        match self {
            Self::Dht11 => 18,
            Self::Dht22 => 2,
        }
    }

    fn decode(self, hh: u8, hl: u8, th: u8, tl: u8) -> Measurement {
        match self {
            Self::Dht11 => {
                // Integral part in the high byte, tenths in the low byte.
                // The sign of the temperature is carried by the MSB of its
                // decimal byte.
                let humidity = f32::from(hh) + f32::from(hl) / 10.0;
                let mut temperature = f32::from(th) + f32::from(tl & 0x7F) / 10.0;
                if tl & 0x80 != 0 {
                    temperature = -temperature;
                }
                Measurement {
                    humidity,
                    temperature,
                }
            }
            Self::Dht22 => {
                // 16-bit values scaled by ten, sign in bit 15 of the
                // temperature.
                let humidity = f32::from((u16::from(hh) << 8) | u16::from(hl)) / 10.0;
                let raw = (u16::from(th & 0x7F) << 8) | u16::from(tl);
                let mut temperature = f32::from(raw) / 10.0;
                if th & 0x80 != 0 {
                    temperature = -temperature;
                }
                Measurement {
                    humidity,
                    temperature,
                }
            }
        }
    }
}

/// A single humidity and temperature measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    /// Relative humidity as a percentage (% RH).
    pub humidity: f32,
    /// Temperature in degrees Celsius (°C).
    pub temperature: f32,
}

/// Errors that may occur when talking to a `DHT` probe.
#[derive(Debug)]
pub enum DhtError<E> {
    /// GPIO pin errors.
    Pin(E),
    /// Data checksum mismatch.
    ChecksumMismatch,
    /// The probe did not answer within the expected timing window.
    Timeout,
}

impl<E> From<E> for DhtError<E> {
    fn from(e: E) -> Self {
        DhtError::Pin(e)
    }
}

/// The `DHT` driver.
pub struct Dht<P, D>
where
    P: InputPin + OutputPin,
    D: DelayNs,
{
    pin: P,
    delay: D,
    model: Model,
}

impl<P, D> Dht<P, D>
where
    P: InputPin + OutputPin,
    D: DelayNs,
{
    /// Creates a [`Dht`] driver for the given model, pin, and delay provider.
    #[must_use]
    pub fn new(model: Model, pin: P, delay: D) -> Self {
        Self { pin, delay, model }
    }

    /// Reads a single humidity and temperature measurement.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Driving or reading the pin fails
    /// - The probe does not respond within the expected timing window
    /// - The received data fails checksum validation
    pub fn read(&mut self) -> Result<Measurement, DhtError<P::Error>> {
        self.send_start_signal()?;
        self.wait_for_response()?;

        let [hh, hl, th, tl, checksum] = self.read_frame()?;
        Self::validate_checksum([hh, hl, th, tl], checksum)?;

        Ok(self.model.decode(hh, hl, th, tl))
    }

    fn send_start_signal(&mut self) -> Result<(), DhtError<P::Error>> {
        self.pin.set_low()?;
        self.delay.delay_ms(self.model.start_signal_low_ms());

        // Release the line so the probe can take control of it.
        self.pin.set_high()?;
        self.delay.delay_us(START_SIGNAL_HIGH_US);

        Ok(())
    }

    fn wait_for_response(&mut self) -> Result<(), DhtError<P::Error>> {
        // The probe acknowledges with a low then a high pulse.
        self.wait_until_state(PinState::Low)?;
        self.wait_until_state(PinState::High)?;

        Ok(())
    }

    fn read_frame(&mut self) -> Result<[u8; 5], DhtError<P::Error>> {
        let mut frame = [0; 5];
        for byte in &mut frame {
            *byte = self.read_byte()?;
        }
        Ok(frame)
    }

    #[inline]
    fn validate_checksum(data: [u8; 4], checksum: u8) -> Result<(), DhtError<P::Error>> {
        // The checksum is the low 8 bits of the sum of the data bytes.
        let sum = data.iter().fold(0u8, |acc, byte| acc.wrapping_add(*byte));

        if sum == checksum {
            Ok(())
        } else {
            Err(DhtError::ChecksumMismatch)
        }
    }

    fn wait_until_state(&mut self, state: PinState) -> Result<(), DhtError<P::Error>> {
        for _ in 0..MAX_ATTEMPTS {
            let reached = match state {
                PinState::High => self.pin.is_high()?,
                PinState::Low => self.pin.is_low()?,
            };
            if reached {
                return Ok(());
            }
            self.delay.delay_us(POLL_DELAY_US);
        }

        Err(DhtError::Timeout)
    }

    fn read_byte(&mut self) -> Result<u8, DhtError<P::Error>> {
        let mut byte = 0;

        // Every bit starts with a low pulse; the length of the following
        // high pulse encodes its value. Bits are sent MSB first.
        for i in 0..8 {
            self.wait_until_state(PinState::Low)?;
            self.wait_until_state(PinState::High)?;

            self.delay.delay_us(BIT_SAMPLE_DELAY_US);

            if self.pin.is_high()? {
                byte |= 1 << (7 - i);
            }
        }

        Ok(byte)
    }
}
