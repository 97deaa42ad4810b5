use std::sync::{Arc, Mutex};
use log::{debug, info, warn};

use crate::device::codec::{self, clamp_patch};
use crate::device::session::Session;
use crate::device::telemetry::{Registry, Subscription, Unsubscribe};
use crate::device::types::{
    Command, HardwareType, Outbound, SettingField, Settings, SettingsPatch, TransportKind,
};
use crate::error::DeviceError;

/// Host copy of the device settings.
///
/// Local edits only change the cache. Changes reported by the device are merged and
/// published to settings subscribers.
#[derive(Clone)]
pub struct SettingsCache {
    settings: Arc<Mutex<Settings>>,
    updates: Registry<Settings>,
}

impl SettingsCache {
    pub fn new(initial: Settings) -> Self {
        SettingsCache {
            settings: Arc::new(Mutex::new(initial)),
            updates: Registry::new("settings"),
        }
    }

    pub fn read(&self) -> Settings {
        *self.settings.lock().expect("Failed to lock settings")
    }

    /// Applies a local edit. The cache is left untouched if any value is out of range.
    pub fn apply_local(&self, patch: &SettingsPatch) -> Result<Settings, DeviceError> {
        patch.validate()?;
        let mut settings = self.settings.lock().expect("Failed to lock settings");
        settings.apply(patch);
        Ok(*settings)
    }

    /// Merges fields reported by the device, clamped to their range.
    pub fn apply_device(&self, patch: &SettingsPatch) {
        if patch.is_empty() {
            return;
        }

        let updated = {
            let mut settings = self.settings.lock().expect("Failed to lock settings");
            settings.apply(&clamp_patch(patch));
            *settings
        };
        debug!("Device reported settings {:?}", patch.fields());
        self.updates.publish(updated);
    }

    /// Overwrites the whole cache with settings reported by the device.
    pub fn replace(&self, settings: Settings) {
        self.apply_device(&SettingsPatch::full(&settings));
    }

    pub fn subscribe<F>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(Settings) + Send + 'static,
    {
        self.updates.subscribe_with(callback)
    }

    pub fn updates(&self) -> Subscription<Settings> {
        self.updates.subscribe()
    }
}

impl Default for SettingsCache {
    fn default() -> Self {
        SettingsCache::new(Settings::default())
    }
}

/// Keeps the cache and the device in step.
#[derive(Clone)]
pub struct SettingsSync {
    session: Session,
    cache: SettingsCache,
}

impl SettingsSync {
    pub fn new(session: Session) -> Self {
        let cache = session.settings_cache().clone();
        SettingsSync { session, cache }
    }

    pub fn apply_local(&self, patch: &SettingsPatch) -> Result<Settings, DeviceError> {
        self.cache.apply_local(patch)
    }

    pub fn read_cached(&self) -> Settings {
        self.cache.read()
    }

    pub fn on_device_settings(&self, settings: Settings) {
        self.cache.replace(settings);
    }

    pub fn subscribe_settings<F>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(Settings) + Send + 'static,
    {
        self.cache.subscribe(callback)
    }

    /// Applies `patch` locally, then transmits only the fields it carries.
    pub async fn send_partial(&self, patch: &SettingsPatch) -> Result<(), DeviceError> {
        self.cache.apply_local(patch)?;
        if patch.is_empty() {
            return Ok(());
        }
        self.session.send(Outbound::Settings(*patch)).await
    }

    /// Writes the whole cache to the device and asks it to persist the values.
    ///
    /// On the packet transport the fields are written one by one in a fixed order; if one
    /// fails after others went through, the error lists what the device already has.
    pub async fn push_all(&self) -> Result<(), DeviceError> {
        let mut patch = SettingsPatch::full(&self.cache.read());
        if self.session.hardware() == Some(HardwareType::New) {
            debug!("Fixed LED ring, skipping the LED count");
            patch = patch.without(SettingField::LedCount);
        }

        info!("Pushing settings to the device");
        match self.session.kind() {
            TransportKind::Packet => self.push_fields(&patch).await?,
            TransportKind::Socket => self.session.send(Outbound::Settings(patch)).await?,
        }

        if let Some(frame) = codec::encode_command(self.session.kind(), Command::SavePreset)? {
            self.session.send_frame(frame).await?;
        }
        Ok(())
    }

    async fn push_fields(&self, patch: &SettingsPatch) -> Result<(), DeviceError> {
        let patch = clamp_patch(patch);
        let mut written = Vec::new();

        for field in patch.fields() {
            let frame = match codec::encode_field(&patch, field) {
                Some(frame) => frame,
                None => continue,
            };

            if let Err(err) = self.session.send_frame(frame).await {
                warn!("Writing {:?} failed after {:?}: {}", field, written, err);
                if written.is_empty() {
                    return Err(err);
                }
                return Err(DeviceError::PartialPush { written, failed: field, source: Box::new(err) });
            }
            written.push(field);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::types::{Mode, Rgb8};
    use crate::error::ErrorKind;

    #[test]
    fn local_edits_are_validated_before_they_land() {
        let cache = SettingsCache::default();

        let err = cache
            .apply_local(&SettingsPatch { brightness: Some(5), speed_ms: Some(300), ..Default::default() })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidValue);
        assert_eq!(cache.read(), Settings::default());

        let settings = cache.apply_local(&SettingsPatch { speed_ms: Some(300), ..Default::default() }).unwrap();
        assert_eq!(settings.speed_ms, 300);
        assert_eq!(cache.read().speed_ms, 300);
    }

    #[test]
    fn device_updates_are_clamped_and_merged() {
        let cache = SettingsCache::default();
        cache.apply_device(&SettingsPatch {
            speed_ms: Some(9000),
            start_color: Some(Rgb8::new(1, 2, 3)),
            ..Default::default()
        });

        let settings = cache.read();
        assert_eq!(settings.speed_ms, 5000);
        assert_eq!(settings.start_color, Rgb8::new(1, 2, 3));
        assert_eq!(settings.mode, Mode::Ease);
    }

    #[tokio::test]
    async fn only_device_changes_are_published() {
        use futures::StreamExt;

        let cache = SettingsCache::default();
        let mut updates = cache.updates();

        cache.apply_local(&SettingsPatch { brightness: Some(20), ..Default::default() }).unwrap();
        cache.apply_device(&SettingsPatch::default());
        cache.replace(Settings { mode: Mode::Pulse, ..Settings::default() });

        let update = updates.next().await.unwrap();
        assert_eq!(update.mode, Mode::Pulse);
        assert_eq!(update.brightness, 200);
        updates.unsubscribe();
        assert_eq!(updates.next().await, None);
    }
}
