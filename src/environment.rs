//! The single value that threads host paths through every component.
//!
//! No ambient singletons: every component that touches the filesystem
//! takes an `&Environment` explicitly. Tests construct one under a temp
//! directory via `DOCKVM_HOME`.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

const HOME_ENV_VAR: &str = "DOCKVM_HOME";

/// Host-side paths owned by the invoking user.
#[derive(Debug, Clone)]
pub struct Environment {
    base: PathBuf,
}

impl Environment {
    /// Opens the environment, creating the base directory tree if absent.
    ///
    /// Honors `DOCKVM_HOME` (the base-directory override for tests); falls
    /// back to `~/.dockvm`.
    pub fn open() -> Result<Self> {
        let base = match std::env::var_os(HOME_ENV_VAR) {
            Some(dir) => PathBuf::from(dir),
            None => dirs_home().context("could not determine home directory")?.join(".dockvm"),
        };
        Self::open_at(base)
    }

    /// Opens the environment rooted at an explicit directory.
    pub fn open_at(base: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base)
            .with_context(|| format!("failed to create base directory {}", base.display()))?;
        fs::create_dir_all(base.join("images"))
            .with_context(|| format!("failed to create image cache directory in {}", base.display()))?;
        Ok(Self { base })
    }

    /// Root of the per-user base directory (`~/.dockvm` by default).
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// `GlobalConfig` file path.
    pub fn global_config_path(&self) -> PathBuf {
        self.base.join("config.yaml")
    }

    /// Image cache directory (`<base>/images/`).
    pub fn image_cache_dir(&self) -> PathBuf {
        self.base.join("images")
    }

    /// Per-VM working directory (`<base>/<name>/`).
    pub fn vm_dir(&self, name: &str) -> PathBuf {
        self.base.join(name)
    }

    /// Append-only invocation log path.
    pub fn log_path(&self) -> PathBuf {
        self.base.join("cli.log")
    }

    /// Appends one line to the invocation log: `<rfc3339> <argv...> -> <exit code>`.
    pub fn log_invocation(&self, argv: &[String], exit_code: i32) {
        let line = format!(
            "{} {} -> {}\n",
            now_rfc3339(),
            argv.join(" "),
            exit_code
        );
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(self.log_path()) {
            let _ = file.write_all(line.as_bytes());
        }
    }
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// Minimal RFC3339 timestamp without pulling in a datetime crate: the
/// invocation log only needs to be human-sortable, not parsed back.
fn now_rfc3339() -> String {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("t+{secs}s")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn open_at_creates_images_dir() -> Result<()> {
        let tmp = TempDir::new("dockvm-env")?;
        let env = Environment::open_at(tmp.path().join("base"))?;
        assert!(env.image_cache_dir().is_dir());
        Ok(())
    }

    #[test]
    fn vm_dir_is_scoped_under_base() -> Result<()> {
        let tmp = TempDir::new("dockvm-env")?;
        let env = Environment::open_at(tmp.path().join("base"))?;
        assert_eq!(env.vm_dir("demo"), env.base().join("demo"));
        Ok(())
    }
}
