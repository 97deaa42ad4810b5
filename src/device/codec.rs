//! Translation between typed messages and transport units.
//!
//! The packet transport addresses one characteristic per setting: single bytes for
//! mode/brightness/threshold, little-endian `u16` for speed and LED count, `[r, g, b]`
//! for colors. Status arrives as UTF-8 JSON, calibration as a 5 or 7 byte record.
//!
//! The socket transport exchanges one JSON object per text frame. Inbound objects
//! carry a `type` of `"status"` or `"settings"`; anything else is ignored.

use log::{debug, warn};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::device::constants::{COMMAND_TRIGGER, NEW_HARDWARE_LED_COUNT, PING, PONG};
use crate::device::types::{
    CalibrationState, CalibrationTelemetry, Channel, Command, DeviceStatus, Frame, HardwareType, Mode, Rgb8,
    SettingField, SettingsPatch, TransportKind,
};
use crate::error::{DecodeError, DeviceError};

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Status(DeviceStatus),
    Calibration(CalibrationState),
    /// Fields reported by the device. Values are already clamped to their range.
    Settings(SettingsPatch),
    Pong,
}

const CALIBRATION_RECORD_LEN: usize = 5;
const CALIBRATION_PROGRESS_LEN: usize = 7;

/// Clamps every numeric field of `patch` to its documented range.
pub fn clamp_patch(patch: &SettingsPatch) -> SettingsPatch {
    SettingsPatch {
        speed_ms: patch.speed_ms.map(|v| SettingField::SpeedMs.clamp(v.into()) as u16),
        brightness: patch.brightness.map(|v| SettingField::Brightness.clamp(v.into()) as u8),
        led_count: patch.led_count.map(|v| SettingField::LedCount.clamp(v.into()) as u16),
        afterburner_threshold_pct: patch
            .afterburner_threshold_pct
            .map(|v| SettingField::AfterburnerThreshold.clamp(v.into()) as u8),
        ..*patch
    }
}

/// Encodes the fields of `patch`.
///
/// The packet transport needs one write per field, returned in push order. The socket
/// transport gets a single partial-update object with only the present keys.
pub fn encode_patch(kind: TransportKind, patch: &SettingsPatch) -> Result<Vec<Frame>, DeviceError> {
    let patch = clamp_patch(patch);

    match kind {
        TransportKind::Packet => Ok(patch
            .fields()
            .into_iter()
            .filter_map(|field| encode_field(&patch, field))
            .collect()),
        TransportKind::Socket => {
            if patch.is_empty() {
                return Ok(Vec::new());
            }
            Ok(vec![Frame::Text(serde_json::to_string(&patch)?)])
        },
    }
}

/// The packet write for a single field, if it is present in `patch`.
pub fn encode_field(patch: &SettingsPatch, field: SettingField) -> Option<Frame> {
    let payload: Vec<u8> = match field {
        SettingField::Mode => vec![u8::from(patch.mode?)],
        SettingField::StartColor => <[u8; 3]>::from(patch.start_color?).to_vec(),
        SettingField::EndColor => <[u8; 3]>::from(patch.end_color?).to_vec(),
        SettingField::SpeedMs => patch.speed_ms?.to_le_bytes().to_vec(),
        SettingField::Brightness => vec![patch.brightness?],
        SettingField::LedCount => patch.led_count?.to_le_bytes().to_vec(),
        SettingField::AfterburnerThreshold => vec![patch.afterburner_threshold_pct?],
    };

    Some(Frame::Packet { channel: field.channel(), payload })
}

/// Encodes a device action. `None` means the transport needs no frame for it.
pub fn encode_command(kind: TransportKind, command: Command) -> Result<Option<Frame>, DeviceError> {
    let trigger = |channel| Some(Frame::Packet { channel, payload: COMMAND_TRIGGER.to_vec() });

    match (kind, command) {
        (TransportKind::Packet, Command::SavePreset) => Ok(trigger(Channel::Save)),
        (TransportKind::Packet, Command::StartCalibration) => Ok(trigger(Channel::CalibrationStart)),
        (TransportKind::Packet, Command::ResetCalibration) => Ok(trigger(Channel::CalibrationReset)),
        (TransportKind::Packet, Command::Ping) => Ok(None),
        // the socket firmware persists every settings message on its own
        (TransportKind::Socket, Command::SavePreset) => Ok(None),
        (TransportKind::Socket, Command::StartCalibration) |
        (TransportKind::Socket, Command::ResetCalibration) => Err(DeviceError::Unsupported("Throttle calibration")),
        (TransportKind::Socket, Command::Ping) => Ok(Some(Frame::Text(PING.to_string()))),
    }
}

/// Decodes one inbound frame. `Ok(None)` is a well-formed frame that carries nothing of interest.
pub fn decode_frame(frame: &Frame) -> Result<Option<Inbound>, DecodeError> {
    match frame {
        Frame::Packet { channel, payload } => decode_packet(*channel, payload).map(Some),
        Frame::Text(text) => decode_text(text),
    }
}

/// Like [`decode_frame`], but logs and drops anything malformed.
pub fn decode_or_drop(frame: &Frame) -> Option<Inbound> {
    match decode_frame(frame) {
        Ok(inbound) => inbound,
        Err(err) => {
            warn!("Dropping malformed frame {:?}: {}", frame, err);
            None
        },
    }
}

fn decode_packet(channel: Channel, payload: &[u8]) -> Result<Inbound, DecodeError> {
    match channel {
        Channel::Status => {
            let text = std::str::from_utf8(payload)?;
            Ok(Inbound::Status(decode_status(parse_status_packet(text.trim_end_matches('\0'))?)?))
        },
        Channel::CalibrationStatus => Ok(Inbound::Calibration(decode_calibration(payload)?)),
        Channel::Mode
        | Channel::StartColor
        | Channel::EndColor
        | Channel::SpeedMs
        | Channel::Brightness
        | Channel::LedCount
        | Channel::Threshold => Ok(Inbound::Settings(decode_field(channel, payload)?)),
        _ => Err(DecodeError::UnexpectedChannel(channel)),
    }
}

/// Parses a status notification. A record cut short by the MTU still carries both keys and
/// only misses its closing brace, so that one case is completed and parsed again.
fn parse_status_packet(text: &str) -> Result<Value, DecodeError> {
    match serde_json::from_str(text) {
        Ok(value) => Ok(value),
        Err(err) => {
            let truncated = text.contains("\"thr\"") && text.contains("\"mode\"") && !text.ends_with('}');
            if !truncated {
                return Err(err.into());
            }
            debug!("Completing truncated status record {:?}", text);
            serde_json::from_str(&format!("{}}}", text)).map_err(|_| err.into())
        },
    }
}

fn decode_text(text: &str) -> Result<Option<Inbound>, DecodeError> {
    if text == PONG {
        return Ok(Some(Inbound::Pong));
    }

    let value: Value = serde_json::from_str(text)?;
    let kind = value.get("type").and_then(Value::as_str).map(str::to_owned);

    match kind.as_deref() {
        Some("status") => Ok(Some(Inbound::Status(decode_status(value)?))),
        Some("settings") => match value {
            Value::Object(object) => Ok(Some(Inbound::Settings(decode_settings_object(&object)))),
            _ => Ok(None),
        },
        other => {
            debug!("Ignoring socket message of type {:?}", other);
            Ok(None)
        },
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStatus {
    thr: f64,
    mode: i64,
    signal_valid: Option<bool>,
    #[serde(default)]
    pulse_count: u32,
    #[serde(default)]
    invalid_pulse_count: u32,
    #[serde(default)]
    calibrating: bool,
    #[serde(default)]
    calibration_complete: bool,
    #[serde(default)]
    min_pulse: u16,
    #[serde(default)]
    max_pulse: u16,
    #[serde(default)]
    pulse_range: u16,
}

fn decode_status(value: Value) -> Result<DeviceStatus, DecodeError> {
    let raw: RawStatus = serde_json::from_value(value)?;

    let mode = u8::try_from(raw.mode)
        .ok()
        .and_then(|mode| Mode::try_from(mode).ok())
        .ok_or(DecodeError::UnknownMode(raw.mode))?;

    let throttle = if raw.thr.is_finite() { raw.thr.clamp(0.0, 1.0) as f32 } else { 0.0 };

    let telemetry = raw.signal_valid.map(|signal_valid| CalibrationTelemetry {
        signal_valid,
        pulse_count: raw.pulse_count,
        invalid_pulse_count: raw.invalid_pulse_count,
        calibrating: raw.calibrating,
        calibration_complete: raw.calibration_complete,
        min_pulse: raw.min_pulse,
        max_pulse: raw.max_pulse,
        pulse_range: raw.pulse_range,
    });

    Ok(DeviceStatus { throttle, mode, telemetry })
}

/// `[isCalibrated, minLow, minHigh, maxLow, maxHigh]`, optionally followed by `[minVisits, maxVisits]`.
pub fn decode_calibration(payload: &[u8]) -> Result<CalibrationState, DecodeError> {
    if payload.len() < CALIBRATION_RECORD_LEN {
        return Err(DecodeError::Undersized {
            channel: Channel::CalibrationStatus,
            expected: CALIBRATION_RECORD_LEN,
            actual: payload.len(),
        });
    }

    let (min_visits, max_visits) = if payload.len() >= CALIBRATION_PROGRESS_LEN {
        (payload[5], payload[6])
    } else {
        (0, 0)
    };

    Ok(CalibrationState {
        is_calibrated: payload[0] == 1,
        min: u16::from_le_bytes([payload[1], payload[2]]),
        max: u16::from_le_bytes([payload[3], payload[4]]),
        min_visits,
        max_visits,
    })
}

/// Decodes the value read from a settings characteristic into a single-field patch.
pub fn decode_field(channel: Channel, payload: &[u8]) -> Result<SettingsPatch, DecodeError> {
    let need = |expected: usize| {
        if payload.len() < expected {
            Err(DecodeError::Undersized { channel, expected, actual: payload.len() })
        } else {
            Ok(())
        }
    };
    let mut patch = SettingsPatch::default();

    match channel {
        Channel::Mode => {
            need(1)?;
            patch.mode = Some(Mode::try_from(payload[0]).map_err(|_| DecodeError::UnknownMode(payload[0].into()))?);
        },
        Channel::StartColor => {
            need(3)?;
            patch.start_color = Some(Rgb8::new(payload[0], payload[1], payload[2]));
        },
        Channel::EndColor => {
            need(3)?;
            patch.end_color = Some(Rgb8::new(payload[0], payload[1], payload[2]));
        },
        Channel::SpeedMs => {
            need(2)?;
            let value = u16::from_le_bytes([payload[0], payload[1]]);
            patch.speed_ms = Some(SettingField::SpeedMs.clamp(value.into()) as u16);
        },
        Channel::Brightness => {
            need(1)?;
            patch.brightness = Some(SettingField::Brightness.clamp(payload[0].into()) as u8);
        },
        Channel::LedCount => {
            need(2)?;
            let value = u16::from_le_bytes([payload[0], payload[1]]);
            patch.led_count = Some(SettingField::LedCount.clamp(value.into()) as u16);
        },
        Channel::Threshold => {
            need(1)?;
            patch.afterburner_threshold_pct = Some(SettingField::AfterburnerThreshold.clamp(payload[0].into()) as u8);
        },
        _ => return Err(DecodeError::UnexpectedChannel(channel)),
    }

    Ok(patch)
}

/// Decodes a device-pushed settings object.
///
/// Numbers outside of their range are clamped. A missing or malformed field is left out of
/// the patch so that the cached value is retained.
pub fn decode_settings_object(object: &Map<String, Value>) -> SettingsPatch {
    let number = |key: &str| -> Option<i64> {
        let value = object.get(key)?;
        value.as_i64().or_else(|| value.as_f64().filter(|v| v.is_finite()).map(|v| v.round() as i64))
    };
    let color = |key: &str| -> Option<Rgb8> {
        let components = object.get(key)?.as_array()?;
        if components.len() != 3 {
            warn!("Ignoring {} with {} components", key, components.len());
            return None;
        }
        let mut rgb = [0u8; 3];
        for (slot, component) in rgb.iter_mut().zip(components) {
            *slot = component.as_i64()?.clamp(0, 255) as u8;
        }
        Some(Rgb8::from(rgb))
    };

    let mode = number("mode").and_then(|mode| {
        let decoded = u8::try_from(mode).ok().and_then(|mode| Mode::try_from(mode).ok());
        if decoded.is_none() {
            warn!("Ignoring unknown mode {} from device", mode);
        }
        decoded
    });

    SettingsPatch {
        mode,
        start_color: color("startColor"),
        end_color: color("endColor"),
        speed_ms: number("speedMs").map(|v| SettingField::SpeedMs.clamp(v) as u16),
        brightness: number("brightness").map(|v| SettingField::Brightness.clamp(v) as u8),
        led_count: number("numLeds").map(|v| SettingField::LedCount.clamp(v) as u16),
        afterburner_threshold_pct: number("abThreshold").map(|v| SettingField::AfterburnerThreshold.clamp(v) as u8),
    }
}

/// Interprets the optional hardware-version characteristic.
pub fn decode_hardware_version(payload: &[u8]) -> Option<HardwareType> {
    match payload.first() {
        Some(2) => Some(HardwareType::New),
        Some(_) => Some(HardwareType::Legacy),
        None => None,
    }
}

/// Infers the hardware revision from the raw LED count characteristic.
pub fn hardware_from_led_count(payload: &[u8]) -> Option<HardwareType> {
    if payload.len() < 2 {
        return None;
    }
    match u16::from_le_bytes([payload[0], payload[1]]) {
        0 | NEW_HARDWARE_LED_COUNT => Some(HardwareType::New),
        1..=300 => Some(HardwareType::Legacy),
        _ => None,
    }
}
