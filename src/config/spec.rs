//! The frozen `VMSpec`: the single merge point for config precedence.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::config::GlobalConfig;
use crate::error::DockvmError;

/// Guest network attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetSpec {
    /// The default libvirt NAT network.
    Default,
    /// A host bridge interface.
    Bridge(String),
}

impl fmt::Display for NetSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => f.write_str("default"),
            Self::Bridge(ifname) => write!(f, "bridge={ifname}"),
        }
    }
}

impl FromStr for NetSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "default" {
            Ok(Self::Default)
        } else if let Some(ifname) = s.strip_prefix("bridge=") {
            if ifname.is_empty() {
                Err("bridge= requires an interface name".to_string())
            } else {
                Ok(Self::Bridge(ifname.to_string()))
            }
        } else {
            Err(format!("unrecognized net spec: {s}"))
        }
    }
}

/// The merged, validated VM specification. Constructed only through
/// [`VMSpec::resolve`] — nothing downstream builds one directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VMSpec {
    pub name: String,
    pub domain: String,
    pub image: String,
    pub port: u16,
    pub os: String,
    pub mem: u32,
    pub cpus: u32,
    pub disk: u32,
    pub net: NetSpec,
}

/// Engine-level defaults applied below the project-file tier.
struct EngineDefaults;

impl EngineDefaults {
    const MEM_MIB: u32 = 512;
    const CPUS: u32 = 1;
    const DISK_GIB: u32 = 10;
    const NET: &'static str = "default";
}

impl VMSpec {
    /// Merges global defaults, project file, and CLI overrides
    /// (lowest to highest precedence) into a frozen, validated spec.
    ///
    /// CLI overrides always win: `resolve` folds
    /// `defaults.merge(project).merge(cli)` before parsing typed fields,
    /// so precedence is enforced in exactly one place.
    pub fn resolve(
        global: &GlobalConfig,
        project_values: &HashMap<String, String>,
        cli_overrides: &HashMap<String, String>,
    ) -> Result<Self, DockvmError> {
        let mut merged: HashMap<String, String> = HashMap::new();
        merged.insert("os".to_string(), global.default_os.clone());
        merged.insert("mem".to_string(), EngineDefaults::MEM_MIB.to_string());
        merged.insert("cpus".to_string(), EngineDefaults::CPUS.to_string());
        merged.insert("disk".to_string(), EngineDefaults::DISK_GIB.to_string());
        merged.insert("net".to_string(), EngineDefaults::NET.to_string());

        for (k, v) in project_values {
            merged.insert(k.clone(), v.clone());
        }
        for (k, v) in cli_overrides {
            merged.insert(k.clone(), v.clone());
        }

        let get = |key: &str| merged.get(key).cloned();
        let require = |key: &str| {
            get(key).ok_or_else(|| DockvmError::config_invalid(format!("missing required key '{key}'"), key))
        };

        let name = require("name")?;
        validate_dns_label(&name)?;

        let domain = require("domain")?;
        let image = require("image")?;

        let port: u16 = require("port")?
            .parse()
            .map_err(|_| DockvmError::config_invalid("port must be a number", "port"))?;
        if port == 0 {
            return Err(DockvmError::config_invalid("port must be in [1,65535]", "port=0"));
        }

        let os = get("os").unwrap_or_else(|| global.default_os.clone());
        global.lookup(&os)?;

        let mem: u32 = get("mem")
            .unwrap()
            .parse()
            .map_err(|_| DockvmError::config_invalid("mem must be a number of MiB", "mem"))?;
        if mem < 256 {
            return Err(DockvmError::config_invalid("mem must be >= 256", format!("mem={mem}")));
        }

        let cpus: u32 = get("cpus")
            .unwrap()
            .parse()
            .map_err(|_| DockvmError::config_invalid("cpus must be a number", "cpus"))?;
        if cpus < 1 {
            return Err(DockvmError::config_invalid("cpus must be >= 1", format!("cpus={cpus}")));
        }

        let disk: u32 = get("disk")
            .unwrap()
            .parse()
            .map_err(|_| DockvmError::config_invalid("disk must be a number of GiB", "disk"))?;
        if disk < 1 {
            return Err(DockvmError::config_invalid("disk must be >= 1", format!("disk={disk}")));
        }

        let net: NetSpec = get("net")
            .unwrap()
            .parse()
            .map_err(|e| DockvmError::config_invalid(format!("invalid net spec: {e}"), "net"))?;

        Ok(Self {
            name,
            domain,
            image,
            port,
            os,
            mem,
            cpus,
            disk,
            net,
        })
    }
}

/// Validates a DNS-1123 label: lowercase alphanumeric and `-`, not
/// starting or ending with `-`, length 1-63.
fn validate_dns_label(name: &str) -> Result<(), DockvmError> {
    let ok = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-');
    if ok {
        Ok(())
    } else {
        Err(DockvmError::config_invalid(
            "name must be a DNS-1123 label",
            name,
        ))
    }
}
