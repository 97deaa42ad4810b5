//! Host side of the afterburner controller link.
//!
//! [`DeviceLink`] ties the session, the settings cache and the telemetry registries together
//! for one process. Everything is cheap to clone and safe to share between tasks.

use std::sync::Arc;
use log::warn;
use tokio::sync::watch;

use crate::config::types::Config;
use crate::device::session::{Session, SessionConfig};
use crate::device::settings::{SettingsCache, SettingsSync};
use crate::device::telemetry::{Telemetry, Unsubscribe};
use crate::device::transport::packet::PacketTransport;
use crate::device::transport::socket::SocketTransport;
use crate::device::transport::Transport;
use crate::device::types::{
    CalibrationState, Channel, Command, ConnectionState, DeviceStatus, HardwareType, Settings, SettingsPatch,
    TransportKind,
};
use crate::error::DeviceError;

pub mod codec;
pub mod constants;
pub mod session;
pub mod settings;
pub mod telemetry;
pub mod transport;
pub mod types;

#[derive(Clone)]
pub struct DeviceLink {
    session: Session,
    settings: SettingsSync,
}

impl DeviceLink {
    pub fn new(transport: Arc<dyn Transport>, config: SessionConfig) -> Self {
        let session = Session::new(transport, config, Telemetry::new(), SettingsCache::default());
        let settings = SettingsSync::new(session.clone());
        DeviceLink { session, settings }
    }

    /// Builds the transport selected in `config`.
    pub fn from_config(config: &Config) -> Self {
        let transport: Arc<dyn Transport> = match config.transport {
            TransportKind::Packet => Arc::new(PacketTransport::new(config.device_name.clone())),
            TransportKind::Socket => Arc::new(SocketTransport::new(config.socket_url.clone())),
        };
        DeviceLink::new(transport, SessionConfig::from(config))
    }

    pub async fn connect(&self) -> ConnectionState {
        self.session.connect().await
    }

    pub async fn disconnect(&self) {
        self.session.disconnect().await
    }

    pub fn current_state(&self) -> ConnectionState {
        self.session.current_state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.session.watch_state()
    }

    pub fn kind(&self) -> TransportKind {
        self.session.kind()
    }

    pub fn hardware(&self) -> Option<HardwareType> {
        self.session.hardware()
    }

    pub fn apply_local(&self, patch: &SettingsPatch) -> Result<Settings, DeviceError> {
        self.settings.apply_local(patch)
    }

    pub async fn send_partial(&self, patch: &SettingsPatch) -> Result<(), DeviceError> {
        self.settings.send_partial(patch).await
    }

    pub async fn push_all(&self) -> Result<(), DeviceError> {
        self.settings.push_all().await
    }

    pub fn read_cached(&self) -> Settings {
        self.settings.read_cached()
    }

    pub fn on_device_settings(&self, settings: Settings) {
        self.settings.on_device_settings(settings)
    }

    pub fn subscribe_status<F>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(DeviceStatus) + Send + 'static,
    {
        self.session.telemetry().subscribe_status(callback)
    }

    pub fn subscribe_calibration<F>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(CalibrationState) + Send + 'static,
    {
        self.session.telemetry().subscribe_calibration(callback)
    }

    pub fn subscribe_settings<F>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(Settings) + Send + 'static,
    {
        self.settings.subscribe_settings(callback)
    }

    pub fn telemetry(&self) -> &Telemetry {
        self.session.telemetry()
    }

    pub async fn start_calibration(&self) -> Result<(), DeviceError> {
        self.session.send_command(Command::StartCalibration).await
    }

    pub async fn reset_calibration(&self) -> Result<(), DeviceError> {
        self.session.send_command(Command::ResetCalibration).await
    }

    /// Current calibration state. Falls back to the last reported value, then to the defaults.
    pub async fn read_calibration(&self) -> Result<CalibrationState, DeviceError> {
        let telemetry = self.session.telemetry();

        if self.session.kind() == TransportKind::Packet {
            let payload = self.session.read(Channel::CalibrationStatus).await?;
            match codec::decode_calibration(&payload) {
                Ok(calibration) => {
                    telemetry.publish_calibration(calibration);
                    return Ok(calibration);
                },
                Err(err) => warn!("Ignoring calibration record: {}", err),
            }
        }

        Ok(telemetry.latest_calibration().unwrap_or_default())
    }
}
