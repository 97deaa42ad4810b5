use enum_iterator::{all, Sequence};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::constants::{
    BRIGHTNESS_CHARACTERISTIC, CALIBRATION_RESET_CHARACTERISTIC, CALIBRATION_START_CHARACTERISTIC,
    CALIBRATION_STATUS_CHARACTERISTIC, DEFAULT_THROTTLE_MAX, DEFAULT_THROTTLE_MIN, END_COLOR_CHARACTERISTIC,
    HARDWARE_VERSION_CHARACTERISTIC, LED_COUNT_CHARACTERISTIC, MODE_CHARACTERISTIC, SAVE_CHARACTERISTIC,
    SPEED_CHARACTERISTIC, START_COLOR_CHARACTERISTIC, STATUS_CHARACTERISTIC, THRESHOLD_CHARACTERISTIC,
};
use crate::error::{DeviceError, ErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Scanning,
    Connecting,
    Ready,
    Reconnecting,
    Failed(ErrorKind),
}

impl ConnectionState {
    /// An attempt is in flight or established; `connect()` must not start another one.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Scanning | ConnectionState::Connecting | ConnectionState::Ready | ConnectionState::Reconnecting
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "Idle"),
            ConnectionState::Scanning => write!(f, "Scanning"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Ready => write!(f, "Ready"),
            ConnectionState::Reconnecting => write!(f, "Reconnecting"),
            ConnectionState::Failed(kind) => write!(f, "Failed ({:?})", kind),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Packet,
    Socket,
}

/// A discovered controller. Only meaningful to the transport that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    pub id: String,
    pub name: String,
    pub address: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareType {
    /// Addressable pixel strip with a configurable LED count.
    Legacy,
    /// Fixed ring driven by four MOSFET channels.
    New,
}

/// An addressable endpoint on the packet transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Sequence)]
pub enum Channel {
    Mode,
    StartColor,
    EndColor,
    SpeedMs,
    Brightness,
    LedCount,
    Threshold,
    Save,
    Status,
    CalibrationStart,
    CalibrationStatus,
    CalibrationReset,
    HardwareVersion,
}

impl Channel {
    pub fn uuid(&self) -> Uuid {
        match self {
            Channel::Mode => MODE_CHARACTERISTIC,
            Channel::StartColor => START_COLOR_CHARACTERISTIC,
            Channel::EndColor => END_COLOR_CHARACTERISTIC,
            Channel::SpeedMs => SPEED_CHARACTERISTIC,
            Channel::Brightness => BRIGHTNESS_CHARACTERISTIC,
            Channel::LedCount => LED_COUNT_CHARACTERISTIC,
            Channel::Threshold => THRESHOLD_CHARACTERISTIC,
            Channel::Save => SAVE_CHARACTERISTIC,
            Channel::Status => STATUS_CHARACTERISTIC,
            Channel::CalibrationStart => CALIBRATION_START_CHARACTERISTIC,
            Channel::CalibrationStatus => CALIBRATION_STATUS_CHARACTERISTIC,
            Channel::CalibrationReset => CALIBRATION_RESET_CHARACTERISTIC,
            Channel::HardwareVersion => HARDWARE_VERSION_CHARACTERISTIC,
        }
    }

    pub fn from_uuid(uuid: &Uuid) -> Option<Channel> {
        all::<Channel>().find(|channel| channel.uuid() == *uuid)
    }

    /// Channels the device pushes notifications on.
    pub fn notifying() -> [Channel; 2] {
        [Channel::Status, Channel::CalibrationStatus]
    }
}

/// The native unit of a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A value written to / notified from one characteristic.
    Packet { channel: Channel, payload: Vec<u8> },
    /// One WebSocket text message.
    Text(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Sequence, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Mode {
    Linear,
    Ease,
    Pulse,
}

impl Mode {
    pub fn all() -> Vec<Mode> {
        all::<Mode>().collect::<Vec<_>>()
    }
}

impl TryFrom<u8> for Mode {
    type Error = DeviceError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Mode::Linear),
            1 => Ok(Mode::Ease),
            2 => Ok(Mode::Pulse),
            _ => Err(DeviceError::InvalidValue {
                field: SettingField::Mode,
                value: value.into(),
                min: 0,
                max: 2,
            }),
        }
    }
}

impl From<Mode> for u8 {
    fn from(mode: Mode) -> u8 {
        match mode {
            Mode::Linear => 0,
            Mode::Ease => 1,
            Mode::Pulse => 2,
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let result = match self {
            Mode::Linear => "Linear",
            Mode::Ease => "Ease",
            Mode::Pulse => "Pulse",
        };

        write!(f, "{}", result)
    }
}

/// An 8-bit RGB color. On the wire it is always `[r, g, b]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "[u8; 3]", into = "[u8; 3]")]
pub struct Rgb8 {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb8 {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Rgb8 { r, g, b }
    }
}

impl From<[u8; 3]> for Rgb8 {
    fn from([r, g, b]: [u8; 3]) -> Self {
        Rgb8 { r, g, b }
    }
}

impl From<Rgb8> for [u8; 3] {
    fn from(color: Rgb8) -> Self {
        [color.r, color.g, color.b]
    }
}

impl From<(u8, u8, u8)> for Rgb8 {
    fn from((r, g, b): (u8, u8, u8)) -> Self {
        Rgb8 { r, g, b }
    }
}

impl From<Rgb8> for (u8, u8, u8) {
    fn from(color: Rgb8) -> Self {
        (color.r, color.g, color.b)
    }
}

/// One field of [`Settings`]. Declaration order is the order of a full push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Sequence)]
pub enum SettingField {
    Mode,
    StartColor,
    EndColor,
    SpeedMs,
    Brightness,
    LedCount,
    AfterburnerThreshold,
}

impl SettingField {
    pub fn all() -> Vec<SettingField> {
        all::<SettingField>().collect::<Vec<_>>()
    }

    pub fn channel(&self) -> Channel {
        match self {
            SettingField::Mode => Channel::Mode,
            SettingField::StartColor => Channel::StartColor,
            SettingField::EndColor => Channel::EndColor,
            SettingField::SpeedMs => Channel::SpeedMs,
            SettingField::Brightness => Channel::Brightness,
            SettingField::LedCount => Channel::LedCount,
            SettingField::AfterburnerThreshold => Channel::Threshold,
        }
    }

    /// Inclusive bounds of numeric fields.
    pub fn range(&self) -> Option<(i64, i64)> {
        match self {
            SettingField::Mode => Some((0, 2)),
            SettingField::StartColor | SettingField::EndColor => None,
            SettingField::SpeedMs => Some((SPEED_MS_RANGE.0.into(), SPEED_MS_RANGE.1.into())),
            SettingField::Brightness => Some((BRIGHTNESS_RANGE.0.into(), BRIGHTNESS_RANGE.1.into())),
            SettingField::LedCount => Some((LED_COUNT_RANGE.0.into(), LED_COUNT_RANGE.1.into())),
            SettingField::AfterburnerThreshold => Some((THRESHOLD_RANGE.0.into(), THRESHOLD_RANGE.1.into())),
        }
    }

    pub fn check(&self, value: i64) -> Result<(), DeviceError> {
        match self.range() {
            Some((min, max)) if value < min || value > max => Err(DeviceError::InvalidValue {
                field: *self,
                value,
                min,
                max,
            }),
            _ => Ok(()),
        }
    }

    pub fn clamp(&self, value: i64) -> i64 {
        match self.range() {
            Some((min, max)) => value.clamp(min, max),
            None => value,
        }
    }
}

pub const SPEED_MS_RANGE: (u16, u16) = (100, 5000);
pub const BRIGHTNESS_RANGE: (u8, u8) = (10, 255);
pub const LED_COUNT_RANGE: (u16, u16) = (1, 300);
pub const THRESHOLD_RANGE: (u8, u8) = (0, 100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub mode: Mode,
    pub start_color: Rgb8,
    pub end_color: Rgb8,
    pub speed_ms: u16,
    pub brightness: u8,
    #[serde(rename = "numLeds")]
    pub led_count: u16,
    #[serde(rename = "abThreshold")]
    pub afterburner_threshold_pct: u8,
}

impl Settings {
    /// Overwrites every field present in `patch`. The patch must be validated.
    pub fn apply(&mut self, patch: &SettingsPatch) {
        if let Some(mode) = patch.mode {
            self.mode = mode;
        }
        if let Some(color) = patch.start_color {
            self.start_color = color;
        }
        if let Some(color) = patch.end_color {
            self.end_color = color;
        }
        if let Some(speed_ms) = patch.speed_ms {
            self.speed_ms = speed_ms;
        }
        if let Some(brightness) = patch.brightness {
            self.brightness = brightness;
        }
        if let Some(led_count) = patch.led_count {
            self.led_count = led_count;
        }
        if let Some(threshold) = patch.afterburner_threshold_pct {
            self.afterburner_threshold_pct = threshold;
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            mode: Mode::Ease,
            start_color: Rgb8::new(255, 100, 0),
            end_color: Rgb8::new(154, 0, 255),
            speed_ms: 1200,
            brightness: 200,
            led_count: 45,
            afterburner_threshold_pct: 80,
        }
    }
}

/// A subset of [`Settings`]. Serializes to the socket partial-update object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_color: Option<Rgb8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_color: Option<Rgb8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_ms: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brightness: Option<u8>,
    #[serde(rename = "numLeds", skip_serializing_if = "Option::is_none")]
    pub led_count: Option<u16>,
    #[serde(rename = "abThreshold", skip_serializing_if = "Option::is_none")]
    pub afterburner_threshold_pct: Option<u8>,
}

impl SettingsPatch {
    /// A patch that carries every field of `settings`.
    pub fn full(settings: &Settings) -> Self {
        SettingsPatch {
            mode: Some(settings.mode),
            start_color: Some(settings.start_color),
            end_color: Some(settings.end_color),
            speed_ms: Some(settings.speed_ms),
            brightness: Some(settings.brightness),
            led_count: Some(settings.led_count),
            afterburner_threshold_pct: Some(settings.afterburner_threshold_pct),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields().is_empty()
    }

    /// Fields present in this patch, in push order.
    pub fn fields(&self) -> Vec<SettingField> {
        SettingField::all()
            .into_iter()
            .filter(|field| self.contains(*field))
            .collect()
    }

    pub fn contains(&self, field: SettingField) -> bool {
        match field {
            SettingField::Mode => self.mode.is_some(),
            SettingField::StartColor => self.start_color.is_some(),
            SettingField::EndColor => self.end_color.is_some(),
            SettingField::SpeedMs => self.speed_ms.is_some(),
            SettingField::Brightness => self.brightness.is_some(),
            SettingField::LedCount => self.led_count.is_some(),
            SettingField::AfterburnerThreshold => self.afterburner_threshold_pct.is_some(),
        }
    }

    /// Keeps only `field`.
    pub fn only(&self, field: SettingField) -> SettingsPatch {
        let mut patch = SettingsPatch::default();
        match field {
            SettingField::Mode => patch.mode = self.mode,
            SettingField::StartColor => patch.start_color = self.start_color,
            SettingField::EndColor => patch.end_color = self.end_color,
            SettingField::SpeedMs => patch.speed_ms = self.speed_ms,
            SettingField::Brightness => patch.brightness = self.brightness,
            SettingField::LedCount => patch.led_count = self.led_count,
            SettingField::AfterburnerThreshold => patch.afterburner_threshold_pct = self.afterburner_threshold_pct,
        }
        patch
    }

    /// Takes every field present in `other`.
    pub fn extend(&mut self, other: &SettingsPatch) {
        self.mode = other.mode.or(self.mode);
        self.start_color = other.start_color.or(self.start_color);
        self.end_color = other.end_color.or(self.end_color);
        self.speed_ms = other.speed_ms.or(self.speed_ms);
        self.brightness = other.brightness.or(self.brightness);
        self.led_count = other.led_count.or(self.led_count);
        self.afterburner_threshold_pct = other.afterburner_threshold_pct.or(self.afterburner_threshold_pct);
    }

    pub fn without(mut self, field: SettingField) -> SettingsPatch {
        match field {
            SettingField::Mode => self.mode = None,
            SettingField::StartColor => self.start_color = None,
            SettingField::EndColor => self.end_color = None,
            SettingField::SpeedMs => self.speed_ms = None,
            SettingField::Brightness => self.brightness = None,
            SettingField::LedCount => self.led_count = None,
            SettingField::AfterburnerThreshold => self.afterburner_threshold_pct = None,
        }
        self
    }

    /// Rejects the first numeric field that lies outside of its range.
    pub fn validate(&self) -> Result<(), DeviceError> {
        if let Some(speed_ms) = self.speed_ms {
            SettingField::SpeedMs.check(speed_ms.into())?;
        }
        if let Some(brightness) = self.brightness {
            SettingField::Brightness.check(brightness.into())?;
        }
        if let Some(led_count) = self.led_count {
            SettingField::LedCount.check(led_count.into())?;
        }
        if let Some(threshold) = self.afterburner_threshold_pct {
            SettingField::AfterburnerThreshold.check(threshold.into())?;
        }
        Ok(())
    }
}

/// Throttle pulse diagnostics, reported by firmware that supports calibration telemetry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CalibrationTelemetry {
    pub signal_valid: bool,
    pub pulse_count: u32,
    pub invalid_pulse_count: u32,
    pub calibrating: bool,
    pub calibration_complete: bool,
    pub min_pulse: u16,
    pub max_pulse: u16,
    pub pulse_range: u16,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceStatus {
    /// Normalized throttle position in [0, 1]
    pub throttle: f32,
    pub mode: Mode,
    pub telemetry: Option<CalibrationTelemetry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationState {
    pub is_calibrated: bool,
    pub min: u16,
    pub max: u16,
    pub min_visits: u8,
    pub max_visits: u8,
}

impl Default for CalibrationState {
    fn default() -> Self {
        CalibrationState {
            is_calibrated: false,
            min: DEFAULT_THROTTLE_MIN,
            max: DEFAULT_THROTTLE_MAX,
            min_visits: 0,
            max_visits: 0,
        }
    }
}

/// Device actions that are not settings writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    SavePreset,
    StartCalibration,
    ResetCalibration,
    Ping,
}

/// An application message handed to the session for transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outbound {
    Settings(SettingsPatch),
    Command(Command),
}
