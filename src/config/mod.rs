//! Layered configuration: global defaults, per-project file, CLI overrides.

pub mod global;
pub mod project;
pub mod spec;

pub use global::{GlobalConfig, OSImage};
pub use project::{discover_project_file, ProjectConfig};
pub use spec::{NetSpec, VMSpec};

use std::collections::HashMap;

/// Parses `key=value` lines shared by project files and CLI overrides.
///
/// `#` comments and blank lines are ignored. Duplicate keys: last wins.
pub fn parse_kv_lines(content: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            map.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_lines() {
        let map = parse_kv_lines("name=demo\ndomain=demo.local\n# comment\n\nport=80");
        assert_eq!(map.get("name"), Some(&"demo".to_string()));
        assert_eq!(map.get("domain"), Some(&"demo.local".to_string()));
        assert_eq!(map.get("port"), Some(&"80".to_string()));
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn duplicate_keys_last_wins() {
        let map = parse_kv_lines("mem=512\nmem=1024");
        assert_eq!(map.get("mem"), Some(&"1024".to_string()));
    }

    #[test]
    fn ignores_comments_and_blank_lines() {
        let map = parse_kv_lines("# this is a comment\n\n   \nname=demo");
        assert_eq!(map.len(), 1);
    }
}
