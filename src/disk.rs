//! Disk Builder (C5): a copy-on-write overlay disk backed by the cached
//! base image, via `qemu-img`.

use std::path::{Path, PathBuf};

use crate::error::DockvmError;
use crate::hypervisor::subprocess::Runner;

/// Creates `<work_dir>/disk.qcow2` as an overlay over `backing_image`,
/// then resizes it to `disk_gib` GiB.
pub fn build_overlay(
    runner: &dyn Runner,
    work_dir: &Path,
    backing_image: &Path,
    disk_gib: u32,
) -> Result<PathBuf, DockvmError> {
    let disk_path = work_dir.join("disk.qcow2");
    let disk_str = disk_path.to_string_lossy().into_owned();
    let backing_str = backing_image.to_string_lossy().into_owned();

    let out = runner
        .run(
            "qemu-img",
            &[
                "create",
                "-f",
                "qcow2",
                "-F",
                "qcow2",
                "-b",
                &backing_str,
                &disk_str,
            ],
        )
        .map_err(|e| DockvmError::disk_create(disk_str.clone(), e.to_string()))?;
    if !out.ok() {
        return Err(DockvmError::disk_create(disk_str, out.stderr));
    }

    let size_arg = format!("{disk_gib}G");
    let out = runner
        .run("qemu-img", &["resize", &disk_path.to_string_lossy(), &size_arg])
        .map_err(|e| DockvmError::disk_create(disk_path.to_string_lossy().into_owned(), e.to_string()))?;
    if !out.ok() {
        return Err(DockvmError::disk_create(
            disk_path.to_string_lossy().into_owned(),
            out.stderr,
        ));
    }

    Ok(disk_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::subprocess::fakes::RecordingRunner;
    use crate::hypervisor::subprocess::CommandOutput;
    use tempdir::TempDir;

    #[test]
    fn build_overlay_issues_create_then_resize() -> anyhow::Result<()> {
        let tmp = TempDir::new("dockvm-disk")?;
        let runner = RecordingRunner::new(vec![
            CommandOutput { status: 0, stdout: String::new(), stderr: String::new() },
            CommandOutput { status: 0, stdout: String::new(), stderr: String::new() },
        ]);
        let disk = build_overlay(&runner, tmp.path(), &PathBuf::from("/base.img"), 20)?;
        assert_eq!(disk, tmp.path().join("disk.qcow2"));

        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "qemu-img");
        assert!(calls[0].1.contains(&"create".to_string()));
        assert_eq!(calls[1].1[1], disk.to_string_lossy().into_owned());
        assert!(calls[1].1.contains(&"20G".to_string()));
        Ok(())
    }

    #[test]
    fn failed_create_surfaces_disk_create_error() {
        let tmp = TempDir::new("dockvm-disk").unwrap();
        let runner = RecordingRunner::new(vec![CommandOutput {
            status: 1,
            stdout: String::new(),
            stderr: "backing file not found".to_string(),
        }]);
        let result = build_overlay(&runner, tmp.path(), &PathBuf::from("/missing.img"), 10);
        assert_eq!(result.unwrap_err().kind(), crate::error::ErrorKind::DiskCreate);
    }
}
