use alloc::string::String;
use alloc::vec::Vec;

use core::fmt;

use serde::{Serialize, Serializer};

/// The name attached to a telemetry event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventName {
    /// Pump phase change.
    Pump,
    /// Light phase change.
    Light,
    /// Air temperature reading.
    Temp,
    /// Air humidity reading.
    Hum,
    /// Water temperature reading.
    TempWater,
}

impl EventName {
    /// Returns the event name as it appears on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pump => "pump",
            Self::Light => "light",
            Self::Temp => "temp",
            Self::Hum => "hum",
            Self::TempWater => "temp_water",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        f.write_str(self.as_str())
    }
}

/// The status carried by a telemetry event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Status {
    /// Actuator phase code.
    ///
    /// For pumps, `0` means running and `1` means stopped. Lights always
    /// report `0`.
    Phase(u8),
    /// A measured value.
    Reading(f32),
    /// No valid measurement is available yet.
    ///
    /// Encoded as `null` on the wire.
    Unavailable,
}

impl Serialize for Status {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match *self {
            Self::Phase(code) => serializer.serialize_u8(code),
            Self::Reading(value) => serializer.serialize_f32(value),
            Self::Unavailable => serializer.serialize_none(),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Self::Phase(code) => write!(f, "{code}"),
            Self::Reading(value) => write!(f, "{value}"),
            Self::Unavailable => f.write_str("unavailable"),
        }
    }
}

/// A status event published by a duty-cycle task.
///
/// Events are immutable once built: they are encoded with
/// [`TelemetryEvent::to_payload`] and discarded after transmission.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEvent {
    thing_id: u32,
    sensor_id: u32,
    status: Status,
    topic: String,
    name: EventName,
}

impl TelemetryEvent {
    /// Creates a [`TelemetryEvent`].
    #[must_use]
    pub fn new(
        thing_id: u32,
        sensor_id: u32,
        status: Status,
        topic: impl Into<String>,
        name: EventName,
    ) -> Self {
        Self {
            thing_id,
            sensor_id,
            status,
            topic: topic.into(),
            name,
        }
    }

    /// Device identifier.
    #[must_use]
    pub const fn thing_id(&self) -> u32 {
        self.thing_id
    }

    /// Sensor identifier.
    #[must_use]
    pub const fn sensor_id(&self) -> u32 {
        self.sensor_id
    }

    /// Event status.
    #[must_use]
    pub const fn status(&self) -> Status {
        self.status
    }

    /// Publication topic.
    #[must_use]
    #[inline]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Event name.
    #[must_use]
    pub const fn name(&self) -> EventName {
        self.name
    }

    /// Encodes the event as a compact `JSON` payload.
    ///
    /// A reading that is not a finite number is encoded as `null`, like
    /// [`Status::Unavailable`].
    ///
    /// # Errors
    ///
    /// Fails if the serializer fails.
    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl fmt::Display for TelemetryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(
            f,
            "{} [thing {}, sensor {}] on `{}`: {}",
            self.name, self.thing_id, self.sensor_id, self.topic, self.status
        )
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::serialize;

    use super::{EventName, Status, TelemetryEvent};

    #[test]
    fn wire_format() {
        let event = TelemetryEvent::new(9, 10, Status::Phase(0), "sensors/pump", EventName::Pump);

        assert_eq!(
            serialize(&event),
            json!({
                "thingId": 9,
                "sensorId": 10,
                "status": 0,
                "topic": "sensors/pump",
                "name": "pump",
            })
        );
    }

    #[test]
    fn reading_and_unavailable_status() {
        let event = TelemetryEvent::new(1, 2, Status::Reading(21.5), "air", EventName::Temp);
        assert_eq!(serialize(&event)["status"], json!(21.5));

        let event = TelemetryEvent::new(1, 2, Status::Unavailable, "air", EventName::Hum);
        assert_eq!(serialize(&event)["status"], json!(null));
    }

    #[test]
    fn payload_is_compact() {
        let event = TelemetryEvent::new(1, 3, Status::Phase(1), "t", EventName::TempWater);
        let payload = event.to_payload().unwrap();

        assert_eq!(
            core::str::from_utf8(&payload).unwrap(),
            r#"{"thingId":1,"sensorId":3,"status":1,"topic":"t","name":"temp_water"}"#
        );
    }

    #[test]
    fn names_on_the_wire() {
        assert_eq!(EventName::TempWater.as_str(), "temp_water");
        assert_eq!(serialize(EventName::TempWater), json!("temp_water"));
        assert_eq!(serialize(EventName::Hum), json!("hum"));
    }

    #[test]
    fn non_finite_reading_is_null() {
        let event = TelemetryEvent::new(1, 2, Status::Reading(f32::NAN), "air", EventName::Temp);
        assert_eq!(serialize(&event)["status"], json!(null));
    }
}
