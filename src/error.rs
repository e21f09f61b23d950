use std::fmt;

use crate::bus::BusError;

#[derive(Clone, Debug)]
pub struct Error {
    kind: ErrorKind,
    description: String,
}

impl Error {
    pub(in crate) fn new(kind: ErrorKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
        }
    }

    /// Translates a failed bus call into the taxonomy, keeping the remote error text.
    pub(in crate) fn from_bus(kind: ErrorKind, context: impl fmt::Display, err: &BusError) -> Self {
        Self::new(kind, format!("{}: {}", context, err))
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.description)
    }
}

impl std::error::Error for Error {}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// No object on the bus implements the adapter interface.
    NoAdapterFound,

    /// The adapter didn't report itself powered after the power-on wait.
    AdapterPowerOnFailed,

    /// The adapter rejected the request to begin discovery.
    DiscoveryStartFailed,

    /// The connect call succeeded but the device never reported itself connected.
    ConnectTimeout,

    /// The connect call returned an error.
    ConnectCallFailed,

    /// The disconnect call returned an error.
    DisconnectCallFailed,

    /// The disconnect call succeeded but the device kept reporting itself connected.
    DisconnectTimeout,

    /// The pair call returned an error.
    PairCallFailed,

    /// The operation needs a connected device.
    NotConnected,

    /// No device with the given address is known.
    DeviceNotFound,

    /// The device has no characteristic matching the requested UUIDs.
    CharacteristicNotFound,

    /// Service enumeration finished without finding any characteristic.
    NoCharacteristicsFound,

    /// The characteristic's capability flags don't allow the operation.
    UnsupportedOperation,

    /// A bus call returned an error or a malformed reply.
    RemoteCallFailed,

    /// Notifications couldn't be enabled; no subscription is left behind.
    NotificationEnableFailed,
}

/// Outcome of a teardown-style operation whose failure never blocks the caller.
///
/// The local state change has always been applied when one of these is returned.
#[derive(Debug)]
#[must_use = "best-effort outcomes may be ignored explicitly with `let _ =`"]
pub enum BestEffort {
    /// Nothing to do, no bus call was made.
    NotNeeded,

    /// The bus call was made and succeeded.
    Completed,

    /// The bus call was made and failed.
    Failed(Error),
}

impl BestEffort {
    pub(in crate) fn from_call(r: Result<(), Error>) -> Self {
        match r {
            Ok(()) => BestEffort::Completed,
            Err(e) => BestEffort::Failed(e),
        }
    }

    /// Whether a bus call was issued.
    pub fn attempted(&self) -> bool {
        !matches!(self, BestEffort::NotNeeded)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, BestEffort::Failed(_))
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            BestEffort::Failed(e) => Some(e),
            _ => None,
        }
    }
}
