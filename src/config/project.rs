//! Project config discovery (C1): a `.dockvm.env` file found by walking
//! upward from the working directory.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::parse_kv_lines;

/// Conventional, hidden project-config filename.
pub const PROJECT_FILE_NAME: &str = ".dockvm.env";

/// A project's `key=value` declarations. Unknown keys are preserved but
/// ignored by the core — only `VMSpec::resolve` interprets recognized
/// keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectConfig {
    pub values: HashMap<String, String>,
    pub source: Option<PathBuf>,
}

impl ProjectConfig {
    /// Discovers and parses the project file, walking from `start` toward
    /// the filesystem root. Returns an empty config if none is found.
    pub fn discover_from(start: &Path) -> Result<Self> {
        match discover_project_file(start) {
            Some(path) => {
                let content = fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                Ok(Self {
                    values: parse_kv_lines(&content),
                    source: Some(path),
                })
            }
            None => Ok(Self::default()),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

/// Walks from `start` toward the filesystem root looking for
/// [`PROJECT_FILE_NAME`]. Returns the first match, or `None` if the root
/// is reached without finding one.
pub fn discover_project_file(start: &Path) -> Option<PathBuf> {
    for dir in start.ancestors() {
        let candidate = dir.join(PROJECT_FILE_NAME);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn discovers_file_in_current_dir() -> Result<()> {
        let tmp = TempDir::new("dockvm-project")?;
        fs::write(tmp.path().join(PROJECT_FILE_NAME), "name=demo\n")?;
        let found = discover_project_file(tmp.path());
        assert_eq!(found, Some(tmp.path().join(PROJECT_FILE_NAME)));
        Ok(())
    }

    #[test]
    fn discovers_file_walking_upward() -> Result<()> {
        let tmp = TempDir::new("dockvm-project")?;
        fs::write(tmp.path().join(PROJECT_FILE_NAME), "name=demo\n")?;
        let nested = tmp.path().join("a/b/c");
        fs::create_dir_all(&nested)?;
        let found = discover_project_file(&nested);
        assert_eq!(found, Some(tmp.path().join(PROJECT_FILE_NAME)));
        Ok(())
    }

    #[test]
    fn returns_none_when_absent() -> Result<()> {
        let tmp = TempDir::new("dockvm-project")?;
        let found = discover_project_file(tmp.path());
        assert_eq!(found, None);
        Ok(())
    }

    #[test]
    fn parses_recognized_and_preserves_unknown_keys() -> Result<()> {
        let tmp = TempDir::new("dockvm-project")?;
        fs::write(
            tmp.path().join(PROJECT_FILE_NAME),
            "name=demo\ndomain=demo.local\nimage=nginx:latest\nport=80\nsome_future_key=x\n",
        )?;
        let config = ProjectConfig::discover_from(tmp.path())?;
        assert_eq!(config.get("name"), Some("demo"));
        assert_eq!(config.get("some_future_key"), Some("x"));
        Ok(())
    }
}
