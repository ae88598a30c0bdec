use std::borrow::Cow;

use growbox::profile::ProfileError;

use thiserror::Error;

/// Failures while turning the bootstrap file into a device profile.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required field is absent.
    #[error("missing field `{0}`")]
    MissingField(String),
    /// The file or one of its fields is not encoded as expected.
    #[error("malformed encoding: {0}")]
    MalformedEncoding(String),
    /// A credential does not decrypt into valid text.
    #[error("credential decryption failed: {0}")]
    DecryptionFailure(String),
    /// The decoded profile violates an invariant.
    #[error("invalid profile: {0}")]
    InvalidProfile(#[from] ProfileError),
    /// The bootstrap file cannot be read.
    #[error("unable to read the bootstrap file: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures reported by the wireless layer.
#[derive(Debug, Error)]
pub enum RadioError {
    /// The access point refused the association.
    #[error("association rejected: {0}")]
    Rejected(String),
    /// The association did not complete in time.
    #[error("association timed out")]
    Timeout,
    /// No usable wireless interface.
    #[error("radio unavailable: {0}")]
    Unavailable(String),
}

/// Failures reported by the broker transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The broker hostname could not be resolved.
    #[error("unable to resolve `{host}`: {reason}")]
    Resolution {
        /// Broker hostname.
        host: String,
        /// Failure description.
        reason: String,
    },
    /// The session handshake failed.
    #[error("broker handshake failed: {0}")]
    Handshake(String),
    /// A payload could not be written.
    #[error("send failed: {0}")]
    Send(String),
    /// No session is open.
    #[error("no broker session is open")]
    NotConnected,
    /// The profile carries no broker credentials.
    #[error("no broker is configured")]
    NoBroker,
}

/// Failures of the broker link.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Wireless association did not succeed within the retry budget.
    #[error("wireless association failed after {attempts} attempts")]
    AssociationFailed {
        /// Number of attempts made.
        attempts: u32,
    },
    /// The broker could not be resolved or the session handshake failed.
    #[error("broker connection failed: {0}")]
    BrokerConnectFailed(#[from] TransportError),
}

/// The outcome of a failed publish.
///
/// Delivery is best-effort: a dropped event is never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PublishError {
    /// The event was dropped after one reconnect-and-retry.
    #[error("event dropped")]
    Dropped,
}

/// Kinds of hardware failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareErrorKind {
    /// Driving an output failed.
    Write,
    /// Reading a measurement failed.
    Read,
    /// An expected device is not present.
    NotFound,
    /// A hardware handle could not be set up.
    Setup,
}

impl std::fmt::Display for HardwareErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Write => "write",
            Self::Read => "read",
            Self::NotFound => "not found",
            Self::Setup => "setup",
        })
    }
}

/// A hardware failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("hardware {kind} error: {message}")]
pub struct HardwareError {
    /// Failure kind.
    pub kind: HardwareErrorKind,
    /// Failure description.
    pub message: Cow<'static, str>,
}

impl HardwareError {
    /// Creates a [`HardwareError`].
    #[must_use]
    pub fn new(kind: HardwareErrorKind, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Creates a [`HardwareErrorKind::Write`] error.
    #[must_use]
    #[inline]
    pub fn write(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(HardwareErrorKind::Write, message)
    }

    /// Creates a [`HardwareErrorKind::Read`] error.
    #[must_use]
    #[inline]
    pub fn read(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(HardwareErrorKind::Read, message)
    }

    /// Creates a [`HardwareErrorKind::NotFound`] error.
    #[must_use]
    #[inline]
    pub fn not_found(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(HardwareErrorKind::NotFound, message)
    }

    /// Creates a [`HardwareErrorKind::Setup`] error.
    #[must_use]
    #[inline]
    pub fn setup(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(HardwareErrorKind::Setup, message)
    }
}

/// Failures of the boot sequence.
#[derive(Debug, Error)]
pub enum BootError {
    /// The bootstrap file could not be turned into a profile.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The node could not join the network.
    #[error(transparent)]
    Link(#[from] LinkError),
    /// A hardware handle could not be set up.
    #[error(transparent)]
    Hardware(#[from] HardwareError),
}
