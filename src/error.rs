use std::io;
use std::str::Utf8Error;
use thiserror::Error;
use btleplug;
use serde_json;
use tokio_tungstenite::tungstenite;

use crate::device::types::{Channel, SettingField};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine path to config file")]
    NoConfigPath,

    #[error("Failed to acquire file lock on config file: {source}")]
    CanNotLock { source: io::Error },

    #[error("Failed to encode/decode config as utf-8: {source}")]
    Utf8Error { #[from] source: Utf8Error },

    #[error("Failed to read/write config file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse/build config file: {source}")]
    JsonError { #[from] source: serde_json::Error },
}

#[derive(Error, Debug)]
pub enum AppRunError {
    #[error("Failed to start application (config): {source}")]
    ConfigError { #[from] source: ConfigError },

    #[error("Device link failed: {source}")]
    DeviceError { #[from] source: DeviceError },

    #[error("Failed to start async runtime: {source}")]
    Runtime { source: io::Error },

    #[error("Could not connect to the device ({kind:?})")]
    ConnectFailed { kind: ErrorKind },
}

/// Coarse classification of a [`DeviceError`], used for state reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Timeout,
    TransportRejected,
    NotConnected,
    InvalidValue,
    DecodeError,
}

/// A malformed inbound frame. Always recovered locally by dropping the frame.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Malformed JSON frame: {source}")]
    Json { #[from] source: serde_json::Error },

    #[error("Frame is not valid utf-8: {source}")]
    Utf8 { #[from] source: Utf8Error },

    #[error("Record on {channel:?} is too short: expected at least {expected} bytes, got {actual}")]
    Undersized { channel: Channel, expected: usize, actual: usize },

    #[error("Unknown mode value {0}")]
    UnknownMode(i64),

    #[error("Channel {0:?} does not carry a decodable value")]
    UnexpectedChannel(Channel),
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("The device was not found before the scan deadline")]
    NotFound,

    #[error("{operation} did not complete before its deadline")]
    Timeout { operation: &'static str },

    #[error("Error communicating with device (btleplug): {source}")]
    Btle { #[from] source: btleplug::Error },

    #[error("Error communicating with device (websocket): {source}")]
    WebSocket { #[from] source: tungstenite::Error },

    #[error("Error communicating with device (io): {source}")]
    Io { #[from] source: io::Error },

    #[error("A required bluetooth characteristic is not available: {0:?}")]
    MissingCharacteristic(Channel),

    #[error("The connection to the device was lost")]
    ConnectionLost,

    #[error("{0} is not supported by this transport")]
    Unsupported(&'static str),

    #[error("Not connected to a device")]
    NotConnected,

    #[error("Value {value} for {field:?} is outside of [{min}, {max}]")]
    InvalidValue { field: SettingField, value: i64, min: i64, max: i64 },

    #[error("Push failed at {failed:?} after writing {written:?}: {source}")]
    PartialPush { written: Vec<SettingField>, failed: SettingField, source: Box<DeviceError> },

    #[error("Failed to decode frame: {source}")]
    Decode { #[from] source: DecodeError },

    #[error("Failed to encode frame: {source}")]
    Encode { #[from] source: serde_json::Error },
}

impl DeviceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeviceError::NotFound => ErrorKind::NotFound,
            DeviceError::Timeout { .. } => ErrorKind::Timeout,
            DeviceError::Btle { .. }
            | DeviceError::WebSocket { .. }
            | DeviceError::Io { .. }
            | DeviceError::MissingCharacteristic(_)
            | DeviceError::ConnectionLost
            | DeviceError::Unsupported(_) => ErrorKind::TransportRejected,
            DeviceError::NotConnected => ErrorKind::NotConnected,
            DeviceError::InvalidValue { .. } | DeviceError::Encode { .. } => ErrorKind::InvalidValue,
            DeviceError::PartialPush { source, .. } => source.kind(),
            DeviceError::Decode { .. } => ErrorKind::DecodeError,
        }
    }
}
