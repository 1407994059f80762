//! Global configuration and the image catalog (C2).

use std::collections::BTreeMap;
use std::fs;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::environment::Environment;
use crate::error::DockvmError;

/// A catalog entry: a downloadable base cloud image plus its guest-OS tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OSImage {
    #[serde(skip)]
    pub key: String,
    pub url: String,
    pub variant: String,
}

/// Global, per-user configuration (`<base>/config.yaml`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub default_os: String,
    pub images: BTreeMap<String, OSImageEntry>,
}

/// On-disk shape of an [`OSImage`] (the map key carries `key`, so the
/// serialized entry only needs `url` and `variant`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OSImageEntry {
    pub url: String,
    pub variant: String,
}

/// Raw on-disk document, used only to detect and normalize the legacy
/// `os_images` alias before it becomes a typed [`GlobalConfig`].
#[derive(Debug, Deserialize)]
struct RawGlobalConfig {
    default_os: String,
    #[serde(default)]
    images: BTreeMap<String, OSImageEntry>,
    #[serde(default, rename = "os_images")]
    os_images: BTreeMap<String, OSImageEntry>,
}

impl GlobalConfig {
    /// Default catalog written on first run: a current Ubuntu LTS and a
    /// current Fedora Cloud base.
    pub fn default_catalog() -> Self {
        let mut images = BTreeMap::new();
        images.insert(
            "ubuntu22.04".to_string(),
            OSImageEntry {
                url: "https://cloud-images.ubuntu.com/jammy/current/jammy-server-cloudimg-amd64.img"
                    .to_string(),
                variant: "ubuntu22.04".to_string(),
            },
        );
        images.insert(
            "fedora39".to_string(),
            OSImageEntry {
                url: "https://download.fedoraproject.org/pub/fedora/linux/releases/39/Cloud/x86_64/images/Fedora-Cloud-Base-39-1.5.x86_64.qcow2"
                    .to_string(),
                variant: "fedora39".to_string(),
            },
        );
        Self {
            default_os: "ubuntu22.04".to_string(),
            images,
        }
    }

    /// Loads the global config, writing the default catalog if absent.
    ///
    /// Accepts either `images:` or the legacy `os_images:` root key and
    /// unifies them before validation; `os_images` entries are merged in
    /// (losing to `images` on key collision) so a file that somehow has
    /// both still loads deterministically.
    pub fn load(env: &Environment) -> Result<Self> {
        let path = env.global_config_path();
        if !path.exists() {
            let config = Self::default_catalog();
            config.save(env)?;
            return Ok(config);
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let raw: RawGlobalConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;

        let mut images = raw.os_images;
        images.extend(raw.images);

        let config = Self {
            default_os: raw.default_os,
            images,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates `default_os ∈ keys(images)`.
    pub fn validate(&self) -> Result<(), DockvmError> {
        if !self.images.contains_key(&self.default_os) {
            return Err(DockvmError::config_invalid(
                "default_os is not present in images",
                self.default_os.clone(),
            ));
        }
        Ok(())
    }

    /// Writes the config back, always under the normalized `images:` key
    /// (never `os_images:`, even if that's how it was read).
    pub fn save(&self, env: &Environment) -> Result<()> {
        let content = serde_yaml::to_string(self).context("failed to serialize global config")?;
        fs::write(env.global_config_path(), content)
            .with_context(|| format!("failed to write {}", env.global_config_path().display()))?;
        Ok(())
    }

    /// Looks up an image by key, failing with `UnknownOS` otherwise.
    pub fn lookup(&self, key: &str) -> Result<OSImage, DockvmError> {
        self.images
            .get(key)
            .map(|entry| OSImage {
                key: key.to_string(),
                url: entry.url.clone(),
                variant: entry.variant.clone(),
            })
            .ok_or_else(|| DockvmError::unknown_os(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn first_run_writes_default_catalog() -> Result<()> {
        let tmp = TempDir::new("dockvm-global")?;
        let env = Environment::open_at(tmp.path().join("base"))?;
        let config = GlobalConfig::load(&env)?;
        assert!(config.images.contains_key("ubuntu22.04"));
        assert!(config.images.contains_key("fedora39"));
        assert_eq!(config.default_os, "ubuntu22.04");
        assert!(env.global_config_path().exists());
        Ok(())
    }

    #[test]
    fn legacy_os_images_alias_reads_and_normalizes_on_write() -> Result<()> {
        let tmp = TempDir::new("dockvm-global")?;
        let env = Environment::open_at(tmp.path().join("base"))?;
        fs::write(
            env.global_config_path(),
            "default_os: ubuntu22.04\nos_images:\n  ubuntu22.04:\n    url: http://example.test/u.img\n    variant: ubuntu22.04\n",
        )?;

        let config = GlobalConfig::load(&env)?;
        assert!(config.images.contains_key("ubuntu22.04"));

        config.save(&env)?;
        let written = fs::read_to_string(env.global_config_path())?;
        assert!(written.contains("images:"));
        assert!(!written.contains("os_images"));
        Ok(())
    }

    #[test]
    fn unknown_os_key_fails() -> Result<()> {
        let tmp = TempDir::new("dockvm-global")?;
        let env = Environment::open_at(tmp.path().join("base"))?;
        let config = GlobalConfig::load(&env)?;
        let err = config.lookup("alpine99").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::UnknownOs);
        Ok(())
    }

    #[test]
    fn default_os_not_in_images_is_invalid() {
        let config = GlobalConfig {
            default_os: "missing".to_string(),
            images: BTreeMap::new(),
        };
        assert!(config.validate().is_err());
    }
}
