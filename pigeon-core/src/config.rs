use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub datasets: DatasetsConfig,
    #[serde(default)]
    pub lenses: LensesConfig,
    #[serde(default)]
    pub attachments: AttachmentsConfig,
    #[serde(default)]
    pub events: EventsConfig,
}

impl CoreConfig {
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join("config.toml");
        let mut cfg = if path.exists() {
            let text = fs::read_to_string(&path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            toml::from_str::<CoreConfig>(&text)
                .with_context(|| format!("parsing config file {}", path.display()))?
        } else {
            tracing::info!(
                "no config file found at {}, using CoreConfig::default()",
                path.display()
            );
            CoreConfig::default()
        };
        cfg.resolve_paths(root);
        Ok(cfg)
    }

    fn resolve_paths(&mut self, root: &Path) {
        self.storage.data_path = absolutize(root, &self.storage.data_path);
        self.storage.attachments_path = absolutize(root, &self.storage.attachments_path);
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            system: SystemConfig::default(),
            storage: StorageConfig::default(),
            datasets: DatasetsConfig::default(),
            lenses: LensesConfig::default(),
            attachments: AttachmentsConfig::default(),
            events: EventsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfig {
    #[serde(default = "SystemConfig::default_name")]
    pub name: String,
    #[serde(default = "SystemConfig::default_version")]
    pub version: String,
}

impl SystemConfig {
    fn default_name() -> String {
        "pigeon-optics".to_string()
    }
    fn default_version() -> String {
        "0.1.0".to_string()
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            name: Self::default_name(),
            version: Self::default_version(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root of the dataset tree: `<data_path>/<source>/<user>/<name>/`
    /// holds each dataset's `meta.cbor` and `objects/` directory.
    #[serde(default = "StorageConfig::default_data_path")]
    pub data_path: PathBuf,
    #[serde(default = "StorageConfig::default_attachments_path")]
    pub attachments_path: PathBuf,
    /// Verify the SHA-256 of every blob/object on read; off by default since
    /// it defeats the point of content addressing for routine reads.
    #[serde(default)]
    pub paranoid: bool,
}

impl StorageConfig {
    fn default_data_path() -> PathBuf {
        PathBuf::from(".")
    }
    fn default_attachments_path() -> PathBuf {
        PathBuf::from("attachments")
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_path: Self::default_data_path(),
            attachments_path: Self::default_attachments_path(),
            paranoid: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatasetsConfig {
    /// Run the per-dataset validator (if configured) on every `writeEntries`.
    #[serde(default = "DatasetsConfig::default_validate_on_write")]
    pub validate_on_write: bool,
}

impl DatasetsConfig {
    fn default_validate_on_write() -> bool {
        true
    }
}

impl Default for DatasetsConfig {
    fn default() -> Self {
        Self {
            validate_on_write: Self::default_validate_on_write(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LensesConfig {
    #[serde(default = "LensesConfig::default_max_dirty_reruns")]
    pub max_dirty_reruns: u32,
}

impl LensesConfig {
    fn default_max_dirty_reruns() -> u32 {
        8
    }
}

impl Default for LensesConfig {
    fn default() -> Self {
        Self {
            max_dirty_reruns: Self::default_max_dirty_reruns(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttachmentsConfig {
    #[serde(default = "AttachmentsConfig::default_hold_watchdog_secs")]
    pub hold_watchdog_secs: u64,
    #[serde(default = "AttachmentsConfig::default_max_object_bytes")]
    pub max_object_bytes: u64,
}

impl AttachmentsConfig {
    fn default_hold_watchdog_secs() -> u64 {
        10
    }
    fn default_max_object_bytes() -> u64 {
        64 * 1024 * 1024
    }
}

impl Default for AttachmentsConfig {
    fn default() -> Self {
        Self {
            hold_watchdog_secs: Self::default_hold_watchdog_secs(),
            max_object_bytes: Self::default_max_object_bytes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "EventsConfig::default_queue_capacity")]
    pub queue_capacity: usize,
}

impl EventsConfig {
    fn default_queue_capacity() -> usize {
        1024
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            queue_capacity: Self::default_queue_capacity(),
        }
    }
}

fn absolutize(root: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else if value == Path::new(".") {
        root.to_path_buf()
    } else {
        root.join(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_relative_paths_before_resolve() {
        let cfg = CoreConfig::default();
        assert!(cfg.storage.attachments_path.is_relative());
    }

    #[test]
    fn load_falls_back_to_defaults_without_a_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = CoreConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.system.name, "pigeon-optics");
        assert_eq!(cfg.storage.data_path, dir.path());
        assert!(cfg.storage.attachments_path.starts_with(dir.path()));
    }
}
