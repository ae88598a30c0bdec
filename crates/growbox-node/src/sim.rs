//! A simulated board.
//!
//! Its handles record every action in a shared journal and return configured
//! readings. The node binary runs on it when no physical board is bound.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use growbox::profile::{AirProbe, Rgb};

use tracing::debug;

use crate::error::HardwareError;
use crate::hardware::{Board, Climate, Hygrometer, LedStrip, ProbeAddress, Switch, ThermometerBus};

const DEFAULT_CLIMATE: Climate = Climate::new(21.5, 46.0);
const DEFAULT_WATER_TEMPERATURE: f32 = 19.0;

/// An action performed on a [`SimulatedBoard`] handle.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// An output was driven.
    Level {
        /// Output pin.
        pin: u8,
        /// Driven level.
        high: bool,
    },
    /// An LED strip was filled.
    Fill {
        /// Strip data pin.
        pin: u8,
        /// Fill color.
        color: Rgb,
    },
    /// An air probe was measured.
    Measure(AirProbe),
    /// A conversion was started on a water bus.
    Convert {
        /// Bus pin.
        pin: u8,
    },
}

#[derive(Debug)]
struct State {
    journal: RefCell<Vec<Action>>,
    climate: Cell<Option<Climate>>,
    water_temperature: Cell<Option<f32>>,
    water_probes: Cell<u8>,
    failing_writes: Cell<bool>,
    refused_pins: RefCell<Vec<u8>>,
}

/// A simulated board.
///
/// Clones share the same state: a clone kept aside can change the readings
/// or inspect the journal while the handles are in use.
#[derive(Debug, Clone)]
pub struct SimulatedBoard {
    state: Rc<State>,
}

impl Default for SimulatedBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBoard {
    /// Creates a [`SimulatedBoard`] reading 21.5 °C and 46 % in the air,
    /// and 19 °C from a single water probe.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Rc::new(State {
                journal: RefCell::new(Vec::new()),
                climate: Cell::new(Some(DEFAULT_CLIMATE)),
                water_temperature: Cell::new(Some(DEFAULT_WATER_TEMPERATURE)),
                water_probes: Cell::new(1),
                failing_writes: Cell::new(false),
                refused_pins: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Sets the air reading. `None` makes every air measurement fail.
    pub fn set_climate(&self, climate: Option<Climate>) {
        self.state.climate.set(climate);
    }

    /// Sets the water reading. `None` makes every water read fail.
    pub fn set_water_temperature(&self, temperature: Option<f32>) {
        self.state.water_temperature.set(temperature);
    }

    /// Sets the number of probes found on water buses.
    pub fn set_water_probes(&self, count: u8) {
        self.state.water_probes.set(count);
    }

    /// Makes every output and strip write fail.
    pub fn set_failing_writes(&self, failing: bool) {
        self.state.failing_writes.set(failing);
    }

    /// Refuses to hand out any handle on the given pin.
    pub fn refuse_pin(&self, pin: u8) {
        self.state.refused_pins.borrow_mut().push(pin);
    }

    /// Returns the actions performed so far.
    #[must_use]
    pub fn journal(&self) -> Vec<Action> {
        self.state.journal.borrow().clone()
    }

    fn claim(&self, pins: &[u8]) -> Result<(), HardwareError> {
        let refused = self.state.refused_pins.borrow();
        match pins.iter().find(|pin| refused.contains(pin)) {
            Some(pin) => Err(HardwareError::setup(format!("pin {pin} is not available"))),
            None => Ok(()),
        }
    }
}

impl State {
    fn record(&self, action: Action) {
        debug!("Simulated {action:?}");
        self.journal.borrow_mut().push(action);
    }

    fn write(&self, action: Action) -> Result<(), HardwareError> {
        if self.failing_writes.get() {
            return Err(HardwareError::write(format!("{action:?} failed")));
        }
        self.record(action);
        Ok(())
    }
}

/// A simulated digital output.
#[derive(Debug)]
pub struct SimulatedOutput {
    pin: u8,
    state: Rc<State>,
}

impl Switch for SimulatedOutput {
    fn set_level(&mut self, high: bool) -> Result<(), HardwareError> {
        self.state.write(Action::Level {
            pin: self.pin,
            high,
        })
    }
}

/// A simulated LED strip.
#[derive(Debug)]
pub struct SimulatedStrip {
    pin: u8,
    state: Rc<State>,
}

impl LedStrip for SimulatedStrip {
    fn fill(&mut self, color: Rgb) -> Result<(), HardwareError> {
        self.state.write(Action::Fill {
            pin: self.pin,
            color,
        })
    }
}

/// A simulated air probe.
#[derive(Debug)]
pub struct SimulatedAirSensor {
    probe: AirProbe,
    state: Rc<State>,
}

impl Hygrometer for SimulatedAirSensor {
    async fn measure(&mut self) -> Result<Climate, HardwareError> {
        self.state.record(Action::Measure(self.probe));
        self.state
            .climate
            .get()
            .ok_or_else(|| HardwareError::read("air probe did not answer"))
    }
}

/// A simulated water probes bus.
#[derive(Debug)]
pub struct SimulatedWaterBus {
    pin: u8,
    state: Rc<State>,
}

impl ThermometerBus for SimulatedWaterBus {
    async fn scan(&mut self) -> Result<Vec<ProbeAddress>, HardwareError> {
        Ok((0..self.state.water_probes.get())
            .map(|i| ProbeAddress([0x28, self.pin, 0, 0, 0, 0, 0, i]))
            .collect())
    }

    async fn convert(&mut self) -> Result<(), HardwareError> {
        self.state.record(Action::Convert { pin: self.pin });
        Ok(())
    }

    async fn read_temperature(&mut self, probe: ProbeAddress) -> Result<f32, HardwareError> {
        self.state
            .water_temperature
            .get()
            .ok_or_else(|| HardwareError::read(format!("probe {probe} did not answer")))
    }
}

impl Board for SimulatedBoard {
    type Output = SimulatedOutput;
    type Strip = SimulatedStrip;
    type AirSensor = SimulatedAirSensor;
    type WaterBus = SimulatedWaterBus;

    fn output(&mut self, pin: u8) -> Result<Self::Output, HardwareError> {
        self.claim(&[pin])?;
        Ok(SimulatedOutput {
            pin,
            state: Rc::clone(&self.state),
        })
    }

    fn led_strip(&mut self, pin: u8, leds: u16) -> Result<Self::Strip, HardwareError> {
        self.claim(&[pin])?;
        debug!("Simulated strip of {leds} LEDs on pin {pin}");
        Ok(SimulatedStrip {
            pin,
            state: Rc::clone(&self.state),
        })
    }

    fn air_sensor(&mut self, probe: AirProbe) -> Result<Self::AirSensor, HardwareError> {
        match probe {
            AirProbe::Digital { pin } => self.claim(&[pin])?,
            AirProbe::Bus { scl, sda } => self.claim(&[scl, sda])?,
        }
        Ok(SimulatedAirSensor {
            probe,
            state: Rc::clone(&self.state),
        })
    }

    fn water_bus(&mut self, pin: u8) -> Result<Self::WaterBus, HardwareError> {
        self.claim(&[pin])?;
        Ok(SimulatedWaterBus {
            pin,
            state: Rc::clone(&self.state),
        })
    }
}
