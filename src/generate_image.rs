//! `generate-image`: renders an installer artifact bundling the core
//! tool, a first-boot systemd unit, and a starter project file.
//!
//! The installer format is deliberately distribution-agnostic: this
//! produces a self-contained `tar.gz` whose first-boot unit installs
//! the bundled binary and a default `.dockvm.env`.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;
use tar::Builder;

use crate::error::DockvmError;

const FIRST_BOOT_UNIT: &str = r#"[Unit]
Description=dockvm first-boot installer
After=network-online.target
Wants=network-online.target
ConditionPathExists=!/etc/dockvm/.installed

[Service]
Type=oneshot
ExecStart=/opt/dockvm/install.sh
ExecStartPost=/usr/bin/touch /etc/dockvm/.installed

[Install]
WantedBy=multi-user.target
"#;

const INSTALL_SCRIPT: &str = r#"#!/bin/sh
set -e
install -m 0755 /opt/dockvm/dockvm /usr/local/bin/dockvm
mkdir -p /etc/dockvm
if [ ! -f /root/.dockvm.env ]; then
    cp /opt/dockvm/dockvm.env.example /root/.dockvm.env
fi
"#;

const PROJECT_FILE_EXAMPLE: &str = r#"# starter project file, discovered as .dockvm.env by `dockvm up`
name=app
domain=app.local
image=nginx:latest
port=80
"#;

/// Writes a `tar.gz` installer to `output`.
pub fn generate(output: &Path) -> Result<(), DockvmError> {
    let file = File::create(output)
        .map_err(|e| DockvmError::disk_create(output.to_string_lossy().into_owned(), e.to_string()))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut tar = Builder::new(encoder);

    append_bytes(&mut tar, "dockvm.service", FIRST_BOOT_UNIT.as_bytes(), 0o644)?;
    append_bytes(&mut tar, "install.sh", INSTALL_SCRIPT.as_bytes(), 0o755)?;
    append_bytes(&mut tar, "dockvm.env.example", PROJECT_FILE_EXAMPLE.as_bytes(), 0o644)?;

    if let Ok(exe_path) = std::env::current_exe() {
        if let Ok(bytes) = fs::read(&exe_path) {
            append_bytes(&mut tar, "dockvm", &bytes, 0o755)?;
        }
    }

    let encoder = tar
        .into_inner()
        .map_err(|e| DockvmError::disk_create(output.to_string_lossy().into_owned(), e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| DockvmError::disk_create(output.to_string_lossy().into_owned(), e.to_string()))?;
    Ok(())
}

fn append_bytes<W: Write>(
    tar: &mut Builder<W>,
    name: &str,
    contents: &[u8],
    mode: u32,
) -> Result<(), DockvmError> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name).map_err(|e| DockvmError::disk_create(name.to_string(), e.to_string()))?;
    header.set_size(contents.len() as u64);
    header.set_mode(mode);
    header.set_cksum();
    tar.append(&header, contents)
        .map_err(|e| DockvmError::disk_create(name.to_string(), e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn generate_writes_a_readable_gzip_tarball() -> anyhow::Result<()> {
        let tmp = TempDir::new("dockvm-installer")?;
        let output = tmp.path().join("installer.tar.gz");
        generate(&output)?;
        assert!(output.is_file());

        let file = File::open(&output)?;
        let decoder = flate2::read::GzDecoder::new(file);
        let mut archive = tar::Archive::new(decoder);
        let names: Vec<String> = archive
            .entries()?
            .filter_map(|e| e.ok())
            .filter_map(|e| e.path().ok().map(|p| p.to_string_lossy().into_owned()))
            .collect();
        assert!(names.contains(&"install.sh".to_string()));
        assert!(names.contains(&"dockvm.service".to_string()));
        Ok(())
    }
}
