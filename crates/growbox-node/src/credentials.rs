use std::fmt;
use std::path::Path;

use growbox::profile::{
    AirProbe, BrokerCredentials, DeviceProfile, KindParams, Rgb, Secret, SensorKind, SensorSpec,
    WirelessCredentials,
};

use aes::Aes128;
use aes::cipher::block_padding::{NoPadding, ZeroPadding};
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use serde::Deserialize;
use serde_json::Value;

use tracing::{debug, info};

use crate::error::ConfigError;

type Decryptor = cbc::Decryptor<Aes128>;
type Encryptor = cbc::Encryptor<Aes128>;

// Cipher block size in bytes.
const BLOCK_SIZE: usize = 16;

// On-phase duration of sensor kinds when the bootstrap file omits it.
const DEFAULT_SENSOR_PERIOD_ON_SECS: u64 = 1;

/// The symmetric key and initialization vector protecting credentials.
///
/// Nodes ship with [`CipherKey::FACTORY`], a key compiled into the firmware.
/// Anyone holding a firmware image can therefore decrypt a bootstrap file:
/// deployments that need confidentiality should provision their own key
/// through [`CredentialStore::with_key`].
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CipherKey {
    key: [u8; BLOCK_SIZE],
    iv: [u8; BLOCK_SIZE],
}

impl CipherKey {
    /// The factory key and initialization vector.
    pub const FACTORY: Self = Self::new(*b"GrowplantEncrypt", *b"encryptionIntVec");

    /// Creates a [`CipherKey`].
    #[must_use]
    pub const fn new(key: [u8; BLOCK_SIZE], iv: [u8; BLOCK_SIZE]) -> Self {
        Self { key, iv }
    }
}

impl fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CipherKey(***)")
    }
}

/// Decrypts and validates the bootstrap file into a [`DeviceProfile`].
#[derive(Debug, Clone, Copy)]
pub struct CredentialStore {
    key: CipherKey,
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore {
    /// Creates a [`CredentialStore`] using [`CipherKey::FACTORY`].
    #[must_use]
    pub const fn new() -> Self {
        Self::with_key(CipherKey::FACTORY)
    }

    /// Creates a [`CredentialStore`] using the given key.
    #[must_use]
    pub const fn with_key(key: CipherKey) -> Self {
        Self { key }
    }

    /// Loads a [`DeviceProfile`] from a bootstrap file.
    ///
    /// The operation is atomic: either a complete profile is returned or
    /// nothing is produced at all.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or parsed, if a required field is
    /// absent, if a credential fails to decrypt, or if the resulting profile
    /// violates an invariant.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<DeviceProfile, ConfigError> {
        let path = path.as_ref();
        info!("Reading bootstrap file {}", path.display());

        let content = std::fs::read_to_string(path)?;
        self.parse(&content)
    }

    /// Parses the content of a bootstrap file into a [`DeviceProfile`].
    ///
    /// # Errors
    ///
    /// Same failures as [`CredentialStore::load`], minus file access.
    pub fn parse(&self, content: &str) -> Result<DeviceProfile, ConfigError> {
        let file: BootstrapFile = serde_json::from_str(content)
            .map_err(|e| ConfigError::MalformedEncoding(format!("bootstrap file: {e}")))?;

        let id = file.thing_id.ok_or_else(|| missing("thing_id"))?;
        let hostname = file.thing_hostname.ok_or_else(|| missing("thing_hostname"))?;
        let monitoring = file
            .thing_monitoring
            .as_ref()
            .map(flag)
            .transpose()?
            .ok_or_else(|| missing("thing_monitoring"))?;

        let wifi = file.wifi.ok_or_else(|| missing("wifi"))?;
        let wireless = WirelessCredentials::new(
            wifi.ssid.ok_or_else(|| missing("wifi.ssid"))?,
            self.decrypt_secret(wifi.password.as_deref(), "wifi.password")?,
        );

        let broker = match file.mqtt {
            Some(mqtt) => Some(BrokerCredentials::new(
                mqtt.url.ok_or_else(|| missing("mqtt.url"))?,
                mqtt.login.ok_or_else(|| missing("mqtt.login"))?,
                self.decrypt_secret(mqtt.password.as_deref(), "mqtt.password")?,
            )),
            None if monitoring => return Err(missing("mqtt")),
            None => None,
        };

        let sensors = file
            .thing_sensors
            .ok_or_else(|| missing("thing_sensors"))?
            .iter()
            .enumerate()
            .map(|(index, sensor)| sensor_spec(index, sensor))
            .collect::<Result<Vec<_>, _>>()?;

        let profile = DeviceProfile::new(id, hostname, monitoring, wireless, broker, sensors)?;

        debug!(
            "Profile of thing {} (`{}`) with {} sensors, monitoring {}",
            profile.id(),
            profile.hostname(),
            profile.sensors().len(),
            if profile.monitoring() { "on" } else { "off" }
        );

        Ok(profile)
    }

    /// Decrypts a base64-encoded credential.
    ///
    /// The plaintext is cut at its first control character, which removes
    /// the padding and any trailing binary noise.
    ///
    /// # Errors
    ///
    /// Fails if the input is not base64, if it is not a whole number of
    /// cipher blocks, or if the plaintext is not valid `UTF-8` text.
    pub fn decrypt(&self, ciphertext: &str) -> Result<String, ConfigError> {
        let bytes = STANDARD
            .decode(ciphertext.trim())
            .map_err(|e| ConfigError::MalformedEncoding(format!("credential is not base64: {e}")))?;

        if bytes.len() % BLOCK_SIZE != 0 {
            return Err(ConfigError::DecryptionFailure(format!(
                "{} bytes is not a whole number of {BLOCK_SIZE}-byte blocks",
                bytes.len()
            )));
        }

        let plaintext = Decryptor::new(&self.key.key.into(), &self.key.iv.into())
            .decrypt_padded_vec_mut::<NoPadding>(&bytes)
            .map_err(|e| ConfigError::DecryptionFailure(e.to_string()))?;

        let mut text = String::from_utf8(plaintext)
            .map_err(|_| ConfigError::DecryptionFailure("plaintext is not valid text".into()))?;

        if let Some(end) = text.find(char::is_control) {
            text.truncate(end);
        }

        Ok(text)
    }

    /// Encrypts a credential into the base64 form expected by
    /// [`CredentialStore::decrypt`].
    #[must_use]
    pub fn encrypt(&self, plaintext: &str) -> String {
        self.encrypt_bytes(plaintext.as_bytes())
    }

    fn encrypt_bytes(&self, plaintext: &[u8]) -> String {
        let ciphertext = Encryptor::new(&self.key.key.into(), &self.key.iv.into())
            .encrypt_padded_vec_mut::<ZeroPadding>(plaintext);
        STANDARD.encode(ciphertext)
    }

    fn decrypt_secret(
        &self,
        ciphertext: Option<&str>,
        field: &'static str,
    ) -> Result<Secret, ConfigError> {
        let ciphertext = ciphertext.ok_or_else(|| missing(field))?;
        self.decrypt(ciphertext)
            .map(Secret::new)
            .map_err(|e| match e {
                ConfigError::DecryptionFailure(reason) => {
                    ConfigError::DecryptionFailure(format!("`{field}`: {reason}"))
                }
                ConfigError::MalformedEncoding(reason) => {
                    ConfigError::MalformedEncoding(format!("`{field}`: {reason}"))
                }
                e => e,
            })
    }
}

#[derive(Deserialize)]
struct BootstrapFile {
    thing_id: Option<u32>,
    thing_hostname: Option<String>,
    thing_monitoring: Option<Value>,
    wifi: Option<RawWifi>,
    mqtt: Option<RawMqtt>,
    thing_sensors: Option<Vec<RawSensor>>,
}

#[derive(Deserialize)]
struct RawWifi {
    ssid: Option<String>,
    password: Option<String>,
}

#[derive(Deserialize)]
struct RawMqtt {
    url: Option<String>,
    login: Option<String>,
    password: Option<String>,
}

#[derive(Deserialize)]
struct RawSensor {
    id: Option<u32>,
    topic: Option<String>,
    kind: Option<String>,
    #[serde(default)]
    configs: Vec<RawConfig>,
}

#[derive(Deserialize)]
struct RawConfig {
    name: String,
    value: Value,
}

#[inline]
fn missing(field: impl Into<String>) -> ConfigError {
    ConfigError::MissingField(field.into())
}

fn flag(value: &Value) -> Result<bool, ConfigError> {
    match value {
        Value::Bool(flag) => Ok(*flag),
        Value::Number(n) => Ok(n.as_f64().is_some_and(|n| n != 0.0)),
        Value::String(s) => match s.trim() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            other => Err(ConfigError::MalformedEncoding(format!(
                "`thing_monitoring` is not a boolean: `{other}`"
            ))),
        },
        other => Err(ConfigError::MalformedEncoding(format!(
            "`thing_monitoring` is not a boolean: {other}"
        ))),
    }
}

// The `name`/`value` configuration entries of a sensor.
struct Configs<'a> {
    sensor: String,
    entries: &'a [RawConfig],
}

impl Configs<'_> {
    // When a name is repeated, the last entry wins.
    fn get(&self, name: &str) -> Option<&Value> {
        self.entries
            .iter()
            .rev()
            .find(|entry| entry.name == name)
            .map(|entry| &entry.value)
    }

    fn text(&self, name: &str) -> Option<&str> {
        match self.get(name)? {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    // Integers may be encoded as numbers, integral floats included, or as
    // strings.
    fn integer<T: TryFrom<u64>>(&self, name: &str) -> Result<Option<T>, ConfigError> {
        let Some(value) = self.get(name) else {
            return Ok(None);
        };

        let raw = match value {
            Value::Number(n) => n.as_u64().or_else(|| {
                n.as_f64()
                    .filter(|f| f.fract() == 0.0 && (0.0..=u64::MAX as f64).contains(f))
                    .map(|f| f as u64)
            }),
            Value::String(s) => s.trim().parse::<u64>().ok(),
            _ => None,
        };

        raw.and_then(|raw| T::try_from(raw).ok())
            .map(Some)
            .ok_or_else(|| {
                ConfigError::MalformedEncoding(format!(
                    "{}.{name}: `{value}` is not a valid value",
                    self.sensor
                ))
            })
    }

    fn required<T: TryFrom<u64>>(&self, name: &str) -> Result<T, ConfigError> {
        self.integer(name)?
            .ok_or_else(|| missing(format!("{}.{name}", self.sensor)))
    }

    fn pin(&self, name: &str) -> Result<u8, ConfigError> {
        self.required(name)
    }
}

fn sensor_spec(index: usize, sensor: &RawSensor) -> Result<SensorSpec, ConfigError> {
    let label = format!("thing_sensors[{index}]");

    let id = sensor.id.ok_or_else(|| missing(format!("{label}.id")))?;
    let topic = sensor
        .topic
        .clone()
        .ok_or_else(|| missing(format!("{label}.topic")))?;

    let configs = Configs {
        sensor: label,
        entries: &sensor.configs,
    };

    let kind_name = sensor
        .kind
        .as_deref()
        .or_else(|| configs.text("kind"))
        .ok_or_else(|| missing(format!("{}.kind", configs.sensor)))?;
    let kind: SensorKind = kind_name.parse().map_err(|e| {
        ConfigError::MalformedEncoding(format!("{}.kind: `{kind_name}`: {e}", configs.sensor))
    })?;

    let params = match kind {
        SensorKind::Pump => KindParams::Pump {
            pin: configs.pin("pin")?,
        },
        SensorKind::Light => {
            let color = configs
                .text("color")
                .ok_or_else(|| missing(format!("{}.color", configs.sensor)))?;
            let color: Rgb = color.parse().map_err(|e| {
                ConfigError::MalformedEncoding(format!("{}.color: {e}", configs.sensor))
            })?;
            KindParams::Light {
                pin: configs.pin("pin")?,
                color,
                leds: configs.required("number_led")?,
            }
        }
        SensorKind::AirTemp => match configs.integer::<u8>("pin")? {
            Some(pin) => KindParams::AirTemp(AirProbe::Digital { pin }),
            None => KindParams::AirTemp(AirProbe::Bus {
                scl: configs.pin("scl")?,
                sda: configs.pin("sda")?,
            }),
        },
        SensorKind::WaterTemp => KindParams::WaterTemp {
            pin: configs.pin("pin")?,
        },
    };

    let period_off = configs.required("period_off")?;
    let period_on = if kind.is_sensor() {
        configs
            .integer("period_on")?
            .unwrap_or(DEFAULT_SENSOR_PERIOD_ON_SECS)
    } else {
        configs.required("period_on")?
    };

    Ok(SensorSpec::new(id, topic, period_on, period_off, params))
}
