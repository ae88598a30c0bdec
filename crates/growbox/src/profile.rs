use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use core::fmt;
use core::str::FromStr;
use core::time::Duration;

/// A credential string.
///
/// Its [`fmt::Debug`] output is redacted so credentials never end up in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    /// Creates a [`Secret`].
    #[must_use]
    pub const fn new(value: String) -> Self {
        Self(value)
    }

    /// Exposes the plaintext credential.
    #[must_use]
    #[inline]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        f.write_str("Secret(***)")
    }
}

/// Wireless network credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WirelessCredentials {
    /// Network name.
    pub ssid: String,
    /// Network password.
    pub password: Secret,
}

impl WirelessCredentials {
    /// Creates [`WirelessCredentials`].
    #[must_use]
    pub const fn new(ssid: String, password: Secret) -> Self {
        Self { ssid, password }
    }
}

/// Message broker credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerCredentials {
    /// Broker hostname or address.
    pub address: String,
    /// Session login.
    pub login: String,
    /// Session password.
    pub password: Secret,
}

impl BrokerCredentials {
    /// Creates [`BrokerCredentials`].
    #[must_use]
    pub const fn new(address: String, login: String, password: Secret) -> Self {
        Self {
            address,
            login,
            password,
        }
    }
}

/// A color for an addressable LED strip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb {
    /// Red channel.
    pub red: u8,
    /// Green channel.
    pub green: u8,
    /// Blue channel.
    pub blue: u8,
}

impl Rgb {
    /// All channels off.
    pub const OFF: Self = Self::new(0, 0, 0);

    /// Creates a [`Rgb`] color.
    #[must_use]
    pub const fn new(red: u8, green: u8, blue: u8) -> Self {
        Self { red, green, blue }
    }
}

/// Error returned when a color triple cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseRgbError;

impl fmt::Display for ParseRgbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        f.write_str("expected a color triple such as `(255, 128, 0)`")
    }
}

impl core::error::Error for ParseRgbError {}

impl FromStr for Rgb {
    type Err = ParseRgbError;

    // Accepts `(r, g, b)`, `r,g,b`, and any spacing in between.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().trim_start_matches('(').trim_end_matches(')');
        let mut channels = s.split(',').map(|c| c.trim().parse::<u8>());

        let mut next = || channels.next().ok_or(ParseRgbError)?.map_err(|_| ParseRgbError);
        let rgb = Self::new(next()?, next()?, next()?);

        if channels.next().is_some() {
            return Err(ParseRgbError);
        }

        Ok(rgb)
    }
}

/// How an air temperature and humidity probe is wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AirProbe {
    /// A single-wire digital probe on one pin.
    Digital {
        /// Data pin.
        pin: u8,
    },
    /// A probe attached to a two-wire bus.
    Bus {
        /// Clock pin.
        scl: u8,
        /// Data pin.
        sda: u8,
    },
}

/// The kind of a sensor or actuator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorKind {
    /// A water pump driven by an output pin.
    Pump,
    /// An addressable LED strip.
    Light,
    /// An air temperature and humidity probe.
    AirTemp,
    /// A water temperature probe on a one-wire bus.
    WaterTemp,
}

impl SensorKind {
    /// Returns the canonical name of the kind.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Pump => "pump",
            Self::Light => "light",
            Self::AirTemp => "temp",
            Self::WaterTemp => "temp_water",
        }
    }

    /// Whether the kind measures values rather than driving an output.
    #[must_use]
    pub const fn is_sensor(self) -> bool {
        matches!(self, Self::AirTemp | Self::WaterTemp)
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        f.write_str(self.name())
    }
}

/// Error returned when a sensor kind name is not recognized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseKindError;

impl fmt::Display for ParseKindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        f.write_str("expected one of `pump`, `light`, `temp`, `temp_water`")
    }
}

impl core::error::Error for ParseKindError {}

impl FromStr for SensorKind {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "pump" => Ok(Self::Pump),
            "light" => Ok(Self::Light),
            "temp" | "air_temp" => Ok(Self::AirTemp),
            "temp_water" | "water_temp" => Ok(Self::WaterTemp),
            _ => Err(ParseKindError),
        }
    }
}

/// Kind-specific hardware parameters of a sensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KindParams {
    /// Pump output pin.
    Pump {
        /// Output pin.
        pin: u8,
    },
    /// LED strip data pin, color, and length.
    Light {
        /// Data pin.
        pin: u8,
        /// Color shown during the on phase.
        color: Rgb,
        /// Number of addressed LEDs.
        leds: u16,
    },
    /// Air probe wiring.
    AirTemp(AirProbe),
    /// One-wire bus pin of the water probe.
    WaterTemp {
        /// Bus pin.
        pin: u8,
    },
}

impl KindParams {
    /// Returns the [`SensorKind`] these parameters belong to.
    #[must_use]
    pub const fn kind(&self) -> SensorKind {
        match self {
            Self::Pump { .. } => SensorKind::Pump,
            Self::Light { .. } => SensorKind::Light,
            Self::AirTemp(_) => SensorKind::AirTemp,
            Self::WaterTemp { .. } => SensorKind::WaterTemp,
        }
    }

    /// Returns every pin claimed by these parameters.
    #[must_use]
    pub fn pins(&self) -> Vec<u8> {
        match *self {
            Self::Pump { pin }
            | Self::Light { pin, .. }
            | Self::WaterTemp { pin }
            | Self::AirTemp(AirProbe::Digital { pin }) => alloc::vec![pin],
            Self::AirTemp(AirProbe::Bus { scl, sda }) => alloc::vec![scl, sda],
        }
    }
}

/// The specification of a single sensor or actuator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorSpec {
    id: u32,
    topic: String,
    period_on: Duration,
    period_off: Duration,
    params: KindParams,
}

impl SensorSpec {
    /// Creates a [`SensorSpec`].
    ///
    /// Periods are expressed in seconds. The specification is validated when
    /// it becomes part of a [`DeviceProfile`].
    #[must_use]
    pub fn new(
        id: u32,
        topic: impl Into<String>,
        period_on_secs: u64,
        period_off_secs: u64,
        params: KindParams,
    ) -> Self {
        Self {
            id,
            topic: topic.into(),
            period_on: Duration::from_secs(period_on_secs),
            period_off: Duration::from_secs(period_off_secs),
            params,
        }
    }

    /// Sensor identifier, unique within a profile.
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// Topic the sensor publishes on.
    #[must_use]
    #[inline]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Duration of the on phase.
    #[must_use]
    pub const fn period_on(&self) -> Duration {
        self.period_on
    }

    /// Duration of the off phase.
    #[must_use]
    pub const fn period_off(&self) -> Duration {
        self.period_off
    }

    /// Kind-specific parameters.
    #[must_use]
    pub const fn params(&self) -> &KindParams {
        &self.params
    }

    /// Sensor kind.
    #[must_use]
    pub const fn kind(&self) -> SensorKind {
        self.params.kind()
    }

    fn validate(&self) -> Result<(), ProfileError> {
        if self.topic.trim().is_empty() {
            return Err(ProfileError::EmptyTopic { sensor: self.id });
        }

        if self.period_on.is_zero() || self.period_off.is_zero() {
            return Err(ProfileError::ZeroPeriod { sensor: self.id });
        }

        if let KindParams::Light { leds: 0, .. } = self.params {
            return Err(ProfileError::NoLeds { sensor: self.id });
        }

        Ok(())
    }
}

/// Violations of the [`DeviceProfile`] invariants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileError {
    /// The hostname is empty.
    EmptyHostname,
    /// Monitoring is enabled but no broker credentials were given.
    MissingBroker,
    /// The broker address is empty.
    EmptyBrokerAddress,
    /// A sensor has an empty topic.
    EmptyTopic {
        /// Sensor identifier.
        sensor: u32,
    },
    /// A sensor has a zero on or off period.
    ZeroPeriod {
        /// Sensor identifier.
        sensor: u32,
    },
    /// A light addresses no LEDs.
    NoLeds {
        /// Sensor identifier.
        sensor: u32,
    },
    /// Two sensors share the same identifier.
    DuplicateSensor {
        /// Sensor identifier.
        sensor: u32,
    },
    /// Two sensors claim the same pin.
    PinConflict {
        /// The contended pin.
        pin: u8,
        /// The sensor that claimed the pin first.
        first: u32,
        /// The sensor that claimed the pin again.
        second: u32,
    },
}

impl fmt::Display for ProfileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Self::EmptyHostname => f.write_str("the hostname is empty"),
            Self::MissingBroker => {
                f.write_str("monitoring is enabled but no broker credentials were given")
            }
            Self::EmptyBrokerAddress => f.write_str("the broker address is empty"),
            Self::EmptyTopic { sensor } => write!(f, "sensor {sensor} has an empty topic"),
            Self::ZeroPeriod { sensor } => {
                write!(f, "sensor {sensor} must have positive on and off periods")
            }
            Self::NoLeds { sensor } => write!(f, "light {sensor} addresses no LEDs"),
            Self::DuplicateSensor { sensor } => {
                write!(f, "sensor identifier {sensor} is used more than once")
            }
            Self::PinConflict { pin, first, second } => write!(
                f,
                "pin {pin} is claimed by both sensor {first} and sensor {second}"
            ),
        }
    }
}

impl core::error::Error for ProfileError {}

/// The complete identity, network, and sensor configuration of a node.
///
/// A [`DeviceProfile`] can only be obtained through [`DeviceProfile::new`],
/// hence every instance satisfies its invariants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProfile {
    id: u32,
    hostname: String,
    monitoring: bool,
    wireless: WirelessCredentials,
    broker: Option<BrokerCredentials>,
    sensors: Vec<SensorSpec>,
}

impl DeviceProfile {
    /// Creates a [`DeviceProfile`].
    ///
    /// # Errors
    ///
    /// Returns a [`ProfileError`] if:
    /// - The hostname is empty
    /// - Monitoring is enabled without broker credentials
    /// - A sensor has an empty topic or a zero period
    /// - Two sensors share an identifier or a pin
    pub fn new(
        id: u32,
        hostname: String,
        monitoring: bool,
        wireless: WirelessCredentials,
        broker: Option<BrokerCredentials>,
        sensors: Vec<SensorSpec>,
    ) -> Result<Self, ProfileError> {
        if hostname.trim().is_empty() {
            return Err(ProfileError::EmptyHostname);
        }

        match &broker {
            None if monitoring => return Err(ProfileError::MissingBroker),
            Some(broker) if monitoring && broker.address.trim().is_empty() => {
                return Err(ProfileError::EmptyBrokerAddress);
            }
            _ => {}
        }

        let mut ids = BTreeMap::new();
        let mut pins = BTreeMap::new();
        for sensor in &sensors {
            sensor.validate()?;

            if ids.insert(sensor.id, ()).is_some() {
                return Err(ProfileError::DuplicateSensor { sensor: sensor.id });
            }

            for pin in sensor.params.pins() {
                if let Some(first) = pins.insert(pin, sensor.id) {
                    return Err(ProfileError::PinConflict {
                        pin,
                        first,
                        second: sensor.id,
                    });
                }
            }
        }

        Ok(Self {
            id,
            hostname,
            monitoring,
            wireless,
            broker,
            sensors,
        })
    }

    /// Device identifier.
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// Device hostname.
    #[must_use]
    #[inline]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Whether telemetry is published.
    #[must_use]
    pub const fn monitoring(&self) -> bool {
        self.monitoring
    }

    /// Wireless credentials.
    #[must_use]
    pub const fn wireless(&self) -> &WirelessCredentials {
        &self.wireless
    }

    /// Broker credentials, always present when monitoring is enabled.
    #[must_use]
    pub const fn broker(&self) -> Option<&BrokerCredentials> {
        self.broker.as_ref()
    }

    /// Sensors in configuration order.
    #[must_use]
    #[inline]
    pub fn sensors(&self) -> &[SensorSpec] {
        &self.sensors
    }
}
