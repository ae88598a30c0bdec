//! Duty-cycle actors.
//!
//! An actor alternates forever between an `ON` and an `OFF` phase. Each
//! phase performs the hardware action of its kind, publishes one
//! [`TelemetryEvent`], then rests until its configured period is over. The
//! period bounds the whole phase: a publish still pending when it ends is
//! abandoned, so a lost link never keeps a pump running.
//!
//! Hardware failures never stop an actor: they are logged and the phase
//! publishes its best-effort status. Actuators report their nominal status,
//! sensors report their last good reading, or an unavailable status before
//! the first one.

use std::rc::Rc;
use std::time::Duration;

use growbox::profile::{KindParams, Rgb, SensorSpec};
use growbox::telemetry::{EventName, Status, TelemetryEvent};

use tokio::time::{Instant, sleep, sleep_until, timeout_at};

use tokio_util::sync::CancellationToken;

use tracing::{debug, error, info, warn};

use crate::error::HardwareError;
use crate::hardware::{Board, Climate, Hygrometer, LedStrip, ProbeAddress, Switch, ThermometerBus};
use crate::link::Publish;

/// Settling time of a water temperature conversion.
pub const CONVERSION_SETTLING: Duration = Duration::from_millis(750);

/// A phase of a duty cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// First phase of a cycle.
    On,
    /// Second phase of a cycle.
    Off,
}

impl Phase {
    /// Returns the phase following this one.
    #[must_use]
    pub const fn next(self) -> Self {
        match self {
            Self::On => Self::Off,
            Self::Off => Self::On,
        }
    }
}

/// A pump driven by an output. The output is active low.
pub struct Pump<S> {
    output: S,
}

impl<S: Switch> Pump<S> {
    fn apply(&mut self, phase: Phase) -> (EventName, Status) {
        let (high, code) = match phase {
            Phase::On => (false, 0),
            Phase::Off => (true, 1),
        };

        match self.output.set_level(high) {
            Ok(()) => debug!("Pump {}", if high { "stopped" } else { "running" }),
            Err(e) => error!("Unable to drive the pump: {e}"),
        }

        (EventName::Pump, Status::Phase(code))
    }
}

/// An LED strip lit with a fixed color.
pub struct Light<L> {
    strip: L,
    color: Rgb,
}

impl<L: LedStrip> Light<L> {
    fn apply(&mut self, phase: Phase) -> (EventName, Status) {
        let color = match phase {
            Phase::On => self.color,
            Phase::Off => Rgb::OFF,
        };

        match self.strip.fill(color) {
            Ok(()) => debug!("Light set to {color:?}"),
            Err(e) => error!("Unable to drive the light: {e}"),
        }

        (EventName::Light, Status::Phase(0))
    }
}

/// An air probe.
///
/// The `ON` phase measures and reports the temperature, the `OFF` phase
/// reports the humidity of the same measurement.
pub struct AirTemp<H> {
    probe: H,
    last: Option<Climate>,
}

impl<H: Hygrometer> AirTemp<H> {
    async fn apply(&mut self, phase: Phase) -> (EventName, Status) {
        match phase {
            Phase::On => {
                match self.probe.measure().await {
                    Ok(climate)
                        if !climate.temperature.is_finite() || !climate.humidity.is_finite() =>
                    {
                        error!("Discarded a non-finite air measurement");
                    }
                    Ok(climate) => {
                        debug!(
                            "Measured {} °C and {} %",
                            climate.temperature, climate.humidity
                        );
                        self.last = Some(climate);
                    }
                    Err(e) => error!("Unable to measure the air: {e}"),
                }
                (EventName::Temp, reading(self.last.map(|c| c.temperature)))
            }
            Phase::Off => (EventName::Hum, reading(self.last.map(|c| c.humidity))),
        }
    }
}

/// A water probe on a one-wire bus.
///
/// Both phases convert and read. The first probe found on the bus is kept
/// for the lifetime of the actor.
pub struct WaterTemp<T> {
    bus: T,
    probe: Option<ProbeAddress>,
    last: Option<f32>,
    settling: Duration,
}

impl<T: ThermometerBus> WaterTemp<T> {
    async fn apply(&mut self, _phase: Phase) -> (EventName, Status) {
        match self.read().await {
            Ok(temperature) if !temperature.is_finite() => {
                error!("Discarded a non-finite water measurement");
            }
            Ok(temperature) => {
                debug!("Measured {temperature} °C in the water");
                self.last = Some(temperature);
            }
            Err(e) => error!("Unable to measure the water: {e}"),
        }
        (EventName::TempWater, reading(self.last))
    }

    async fn read(&mut self) -> Result<f32, HardwareError> {
        let probe = match self.probe {
            Some(probe) => probe,
            None => {
                let probe = self
                    .bus
                    .scan()
                    .await?
                    .first()
                    .copied()
                    .ok_or_else(|| HardwareError::not_found("no probe on the bus"))?;
                info!("Found water probe {probe}");
                *self.probe.insert(probe)
            }
        };

        self.bus.convert().await?;
        sleep(self.settling).await;
        self.bus.read_temperature(probe).await
    }
}

#[inline]
fn reading(value: Option<f32>) -> Status {
    value.map_or(Status::Unavailable, Status::Reading)
}

/// The hardware capability of an actor, selected from its sensor kind.
pub enum Capability<B: Board> {
    /// Pump.
    Pump(Pump<B::Output>),
    /// Light.
    Light(Light<B::Strip>),
    /// Air probe.
    AirTemp(AirTemp<B::AirSensor>),
    /// Water probe.
    WaterTemp(WaterTemp<B::WaterBus>),
}

impl<B: Board> Capability<B> {
    /// Claims the hardware handle described by the kind parameters.
    ///
    /// # Errors
    ///
    /// Fails if the board refuses the handle.
    pub fn new(params: &KindParams, board: &mut B) -> Result<Self, HardwareError> {
        Ok(match *params {
            KindParams::Pump { pin } => Self::Pump(Pump {
                output: board.output(pin)?,
            }),
            KindParams::Light { pin, color, leds } => Self::Light(Light {
                strip: board.led_strip(pin, leds)?,
                color,
            }),
            KindParams::AirTemp(probe) => Self::AirTemp(AirTemp {
                probe: board.air_sensor(probe)?,
                last: None,
            }),
            KindParams::WaterTemp { pin } => Self::WaterTemp(WaterTemp {
                bus: board.water_bus(pin)?,
                probe: None,
                last: None,
                settling: CONVERSION_SETTLING,
            }),
        })
    }

    /// Performs the action of a phase and returns the status to report.
    pub async fn apply(&mut self, phase: Phase) -> (EventName, Status) {
        match self {
            Self::Pump(pump) => pump.apply(phase),
            Self::Light(light) => light.apply(phase),
            Self::AirTemp(air) => air.apply(phase).await,
            Self::WaterTemp(water) => water.apply(phase).await,
        }
    }
}

/// A two-phase state machine bound to one sensor.
pub struct DutyCycleActor<B: Board, P> {
    thing_id: u32,
    spec: SensorSpec,
    capability: Capability<B>,
    publisher: Option<Rc<P>>,
}

impl<B: Board, P: Publish> DutyCycleActor<B, P> {
    /// Creates a [`DutyCycleActor`].
    ///
    /// Without a publisher, phases still drive the hardware but nothing is
    /// published.
    ///
    /// # Errors
    ///
    /// Fails if the board refuses the hardware handle of the sensor.
    pub fn new(
        thing_id: u32,
        spec: SensorSpec,
        board: &mut B,
        publisher: Option<Rc<P>>,
    ) -> Result<Self, HardwareError> {
        let capability = Capability::new(spec.params(), board)?;
        Ok(Self {
            thing_id,
            spec,
            capability,
            publisher,
        })
    }

    /// Runs a single phase: performs its action, then publishes its event.
    ///
    /// A publish still pending at the deadline is abandoned, so a slow link
    /// never stretches the phase.
    pub async fn step(&mut self, phase: Phase, deadline: Instant) -> TelemetryEvent {
        let (name, status) = self.capability.apply(phase).await;
        let event = TelemetryEvent::new(
            self.thing_id,
            self.spec.id(),
            status,
            self.spec.topic(),
            name,
        );

        let sensor = self.spec.id();
        debug!(sensor, "{event}");

        let Some(publisher) = &self.publisher else {
            return event;
        };

        match event.to_payload() {
            Ok(payload) => {
                match timeout_at(deadline, publisher.publish(event.topic(), &payload)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(sensor, "{e}: {event}"),
                    Err(_) => warn!(sensor, "Publish abandoned at the end of the phase: {event}"),
                }
            }
            Err(e) => error!(sensor, "Unable to encode {event}: {e}"),
        }

        event
    }

    /// Runs phases until the token is cancelled.
    pub async fn run(mut self, cancellation_token: CancellationToken) {
        let sensor = self.spec.id();
        info!(
            sensor,
            "Starting {} actor on `{}`",
            self.spec.kind(),
            self.spec.topic()
        );

        let mut phase = Phase::On;
        loop {
            let period = match phase {
                Phase::On => self.spec.period_on(),
                Phase::Off => self.spec.period_off(),
            };
            let deadline = Instant::now() + period;

            tokio::select! {
                biased;
                () = cancellation_token.cancelled() => {
                    info!(sensor, "Actor stopped");
                    return;
                }
                () = async {
                    let _ = self.step(phase, deadline).await;
                    sleep_until(deadline).await;
                } => {}
            }

            phase = phase.next();
        }
    }
}
