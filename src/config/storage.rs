//! Configuration Storage
//!
//! Device lists and settings live in one JSON file per scope.
//! Config location: ~/.devicelink on macOS/Linux, %APPDATA%\DeviceLink on Windows

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::settings::Settings;
use crate::ssh::{DeviceTarget, EndpointLabel};

/// Current on-disk format version
pub const CONFIG_VERSION: u32 = 1;

/// Configuration storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config version {found} is newer than supported {supported}")]
    VersionTooNew { found: u32, supported: u32 },

    #[error("Device {0} not found in any configuration scope")]
    DeviceNotFound(String),
}

/// Where a configuration value lives, narrowest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConfigScope {
    WorkspaceFolder,
    Workspace,
    Global,
}

impl ConfigScope {
    /// All scopes ordered from narrowest to widest
    pub const ALL: [ConfigScope; 3] = [
        ConfigScope::WorkspaceFolder,
        ConfigScope::Workspace,
        ConfigScope::Global,
    ];

    fn file_name(self) -> &'static str {
        match self {
            ConfigScope::WorkspaceFolder => "workspace-folder.json",
            ConfigScope::Workspace => "workspace.json",
            ConfigScope::Global => "global.json",
        }
    }
}

impl fmt::Display for ConfigScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigScope::WorkspaceFolder => write!(f, "workspace-folder"),
            ConfigScope::Workspace => write!(f, "workspace"),
            ConfigScope::Global => write!(f, "global"),
        }
    }
}

/// Contents of one scope file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default = "default_version")]
    pub version: u32,

    /// `None` means this scope holds no device list at all
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub devices: Option<Vec<DeviceTarget>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Settings>,
}

fn default_version() -> u32 {
    CONFIG_VERSION
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            version: default_version(),
            devices: None,
            settings: None,
        }
    }
}

/// Scoped configuration provider
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Read one scope. A missing file reads as an empty [`ConfigFile`].
    async fn load(&self, scope: ConfigScope) -> Result<ConfigFile, StorageError>;

    /// Replace one scope.
    async fn save(&self, scope: ConfigScope, file: &ConfigFile) -> Result<(), StorageError>;

    /// Effective settings: the narrowest scope that sets them wins.
    async fn load_settings(&self) -> Result<Settings, StorageError> {
        for scope in ConfigScope::ALL {
            if let Some(settings) = self.load(scope).await?.settings {
                return Ok(settings);
            }
        }
        Ok(Settings::default())
    }

    /// Look a device up by id, narrowest scope first.
    async fn find_device(&self, device_id: &str) -> Result<DeviceTarget, StorageError> {
        for scope in ConfigScope::ALL {
            if let Some(device) = self
                .load(scope)
                .await?
                .devices
                .unwrap_or_default()
                .into_iter()
                .find(|d| d.id == device_id)
            {
                return Ok(device);
            }
        }
        Err(StorageError::DeviceNotFound(device_id.to_string()))
    }
}

/// Write a pinned fingerprint for one hop of a device back to the store.
///
/// The write goes to the narrowest scope whose device list already contains
/// the device; failing that, the narrowest scope holding any device list;
/// failing that, the workspace scope. Returns the scope written.
pub async fn write_fingerprint(
    store: &dyn ConfigStore,
    device: &DeviceTarget,
    label: EndpointLabel,
    value: &str,
) -> Result<ConfigScope, StorageError> {
    let mut files = Vec::with_capacity(ConfigScope::ALL.len());
    for scope in ConfigScope::ALL {
        files.push((scope, store.load(scope).await?));
    }

    let holding_device = files.iter().position(|(_, f)| {
        f.devices
            .as_ref()
            .is_some_and(|list| list.iter().any(|d| d.id == device.id))
    });
    let index = holding_device
        .or_else(|| files.iter().position(|(_, f)| f.devices.is_some()))
        .or_else(|| files.iter().position(|(s, _)| *s == ConfigScope::Workspace))
        .unwrap_or(0);

    let (scope, mut file) = files.swap_remove(index);
    let devices = file.devices.get_or_insert_with(Vec::new);
    match devices.iter_mut().find(|d| d.id == device.id) {
        Some(stored) => stored.set_fingerprint(label, value.to_string()),
        None => {
            let mut copy = device.clone();
            copy.set_fingerprint(label, value.to_string());
            devices.push(copy);
        }
    }
    store.save(scope, &file).await?;

    tracing::info!(
        "Stored {} fingerprint for device {} in {} scope",
        label,
        device.id,
        scope
    );
    Ok(scope)
}

/// Get the DeviceLink configuration directory
/// Returns %APPDATA%\DeviceLink on Windows, ~/.devicelink on macOS/Linux
pub fn config_dir() -> Result<PathBuf, StorageError> {
    #[cfg(windows)]
    {
        if let Some(app_data) = dirs::config_dir() {
            return Ok(app_data.join("DeviceLink"));
        }
        dirs::home_dir()
            .map(|home| home.join(".devicelink"))
            .ok_or(StorageError::NoConfigDir)
    }

    #[cfg(not(windows))]
    {
        dirs::home_dir()
            .map(|home| home.join(".devicelink"))
            .ok_or(StorageError::NoConfigDir)
    }
}

/// JSON file backed configuration store
pub struct JsonConfigStore {
    dir: PathBuf,
}

impl JsonConfigStore {
    /// Create a store in the default config directory
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self { dir: config_dir()? })
    }

    /// Create a store rooted at a custom directory (for testing)
    pub fn with_dir(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn path(&self, scope: ConfigScope) -> PathBuf {
        self.dir.join(scope.file_name())
    }

    /// Create a backup of a scope file
    async fn backup(&self, scope: ConfigScope) -> Result<PathBuf, StorageError> {
        let path = self.path(scope);
        let backup_path = path.with_extension(format!(
            "json.backup.{}",
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        ));
        if fs::metadata(&path).await.is_ok() {
            fs::copy(&path, &backup_path).await?;
        }
        Ok(backup_path)
    }
}

#[async_trait]
impl ConfigStore for JsonConfigStore {
    /// Corrupted files are backed up and read as empty
    async fn load(&self, scope: ConfigScope) -> Result<ConfigFile, StorageError> {
        let path = self.path(scope);
        match fs::read_to_string(&path).await {
            Ok(contents) => match serde_json::from_str::<ConfigFile>(&contents) {
                Ok(config) => {
                    if config.version > CONFIG_VERSION {
                        return Err(StorageError::VersionTooNew {
                            found: config.version,
                            supported: CONFIG_VERSION,
                        });
                    }
                    Ok(config)
                }
                Err(e) => {
                    tracing::warn!("Config file {:?} corrupted: {}", path, e);
                    match self.backup(scope).await {
                        Ok(backup_path) => tracing::warn!(
                            "Corrupted config backed up to {:?}, using defaults",
                            backup_path
                        ),
                        Err(backup_err) => {
                            tracing::error!("Failed to backup corrupted config: {}", backup_err)
                        }
                    }
                    Ok(ConfigFile::default())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn save(&self, scope: ConfigScope, file: &ConfigFile) -> Result<(), StorageError> {
        fs::create_dir_all(&self.dir).await?;

        // Write to temp file first, then rename (atomic write)
        let path = self.path(scope);
        let temp_path = path.with_extension("json.tmp");
        let mut file_to_write = file.clone();
        file_to_write.version = CONFIG_VERSION;
        let json = serde_json::to_string_pretty(&file_to_write)?;

        let mut out = fs::File::create(&temp_path).await?;
        out.write_all(json.as_bytes()).await?;
        out.sync_all().await?;

        fs::rename(&temp_path, &path).await?;
        Ok(())
    }
}

/// In-memory configuration store
#[derive(Default)]
pub struct MemoryConfigStore {
    files: Mutex<HashMap<ConfigScope, ConfigFile>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a scope with a device list
    pub fn with_devices(self, scope: ConfigScope, devices: Vec<DeviceTarget>) -> Self {
        self.files.lock().entry(scope).or_default().devices = Some(devices);
        self
    }

    pub fn with_settings(self, scope: ConfigScope, settings: Settings) -> Self {
        self.files.lock().entry(scope).or_default().settings = Some(settings);
        self
    }

    pub fn devices(&self, scope: ConfigScope) -> Option<Vec<DeviceTarget>> {
        self.files.lock().get(&scope).and_then(|f| f.devices.clone())
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn load(&self, scope: ConfigScope) -> Result<ConfigFile, StorageError> {
        Ok(self.files.lock().get(&scope).cloned().unwrap_or_default())
    }

    async fn save(&self, scope: ConfigScope, file: &ConfigFile) -> Result<(), StorageError> {
        self.files.lock().insert(scope, file.clone());
        Ok(())
    }
}
