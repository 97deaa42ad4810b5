use std::env::current_exe;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::str;
use std::sync::{Arc, Mutex};
use directories_next::ProjectDirs;
use fd_lock::{RwLock, RwLockWriteGuard};
use log::{info, warn};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::config::types::Config;
use crate::error::ConfigError;

const CONFIG_FILE_NAME: &str = "afterburner-link.json";

// afterburner-link.json next to the executable, for installs on removable media
fn get_portable_config_path() -> Option<PathBuf> {
    match current_exe() {
        Ok(path) => Some(path.with_file_name(CONFIG_FILE_NAME)),
        Err(err) => {
            warn!("Failed to get current exe path: {:?}", err);
            None
        },
    }
}

// the os dependent config directory, such as ~/.config/afterburner-link on linux
fn get_local_config_path() -> Option<PathBuf> {
    ProjectDirs::from("nl", "afterburner", "afterburner-link").map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}

fn get_config_path() -> Result<PathBuf, ConfigError> {
    if let Some(path) = get_portable_config_path() {
        match std::fs::metadata(&path) {
            Ok(attr) if attr.is_file() => return Ok(path),
            Ok(_) => {},
            Err(err) => {
                info!("No portable config at {} ({}); using the local path", path.to_string_lossy(), err);
            },
        }
    }

    get_local_config_path().ok_or(ConfigError::NoConfigPath)
}

/// Exclusive lock on the config file. Holding the guard marks this process as the owner
/// of the device link.
pub struct ConfigIOLocker {
    rw_lock: RwLock<std::fs::File>,
}

impl ConfigIOLocker {
    pub fn lock(&mut self) -> Result<RwLockWriteGuard<'_, std::fs::File>, ConfigError> {
        self.rw_lock.try_write().map_err(|source| ConfigError::CanNotLock { source })
    }
}

struct ConfigIOInner {
    path: PathBuf,
    file: std::fs::File,
}

#[derive(Clone)]
pub struct ConfigIO {
    inner: Arc<Mutex<ConfigIOInner>>,
}

impl ConfigIO {
    pub fn new_sync() -> Result<Self, ConfigError> {
        Self::open(get_config_path()?)
    }

    pub fn open(path: PathBuf) -> Result<Self, ConfigError> {
        info!("Using config file {}", path.to_string_lossy());

        if let Some(directory) = path.parent() {
            std::fs::create_dir_all(directory)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .truncate(false)
            .create(true)
            .open(&path)?;

        Ok(ConfigIO { inner: Arc::new(Mutex::new(ConfigIOInner { path, file })) })
    }

    pub fn path(&self) -> PathBuf {
        self.inner.lock().expect("Failed to lock ConfigIO inner").path.clone()
    }

    pub fn locker(&self) -> Result<ConfigIOLocker, ConfigError> {
        let inner = self.inner.lock().expect("Failed to lock ConfigIO inner");
        Ok(ConfigIOLocker { rw_lock: RwLock::new(inner.file.try_clone()?) })
    }

    // the returned handle shares the descriptor that carries the lock
    fn get_file(&self) -> Result<File, ConfigError> {
        let inner = self.inner.lock().expect("Failed to lock ConfigIO inner");
        let file = inner.file.try_clone()?;
        Ok(File::from_std(file))
    }

    pub async fn read(&self) -> Result<Config, ConfigError> {
        let mut file = self.get_file()?;
        file.rewind().await?;

        let mut content = vec![];
        file.read_to_end(&mut content).await?;

        if content.iter().all(u8::is_ascii_whitespace) {
            return Ok(Config::default());
        }

        let content = str::from_utf8(&content)?;
        Ok(serde_json::from_str(content)?)
    }

    pub async fn save(&self, config: &Config) -> Result<(), ConfigError> {
        let mut file = self.get_file()?;
        info!("Saving config");

        let content = serde_json::to_string_pretty(config)?;
        file.rewind().await?;
        file.set_len(0).await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
