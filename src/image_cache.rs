//! Image cache (C3): fetches and caches base cloud images by content key,
//! with advisory locking so concurrent invocations don't race on the same
//! download.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use downloader::{Download, Downloader};
use fs2::FileExt;
use log::{debug, info};

use crate::config::OSImage;
use crate::environment::Environment;
use crate::error::DockvmError;

/// Ensures the cached image file for `image` exists, downloading it if
/// necessary, and returns its path.
///
/// Concurrent callers racing on the same key block on an advisory lock
/// rather than downloading twice; a download is written to a `.part`
/// sibling and atomically renamed into place only once it fully
/// completes, so a crash mid-download never leaves a corrupt cache entry
/// behind.
pub fn ensure(env: &Environment, image: &OSImage) -> Result<PathBuf> {
    let dest = env.image_cache_dir().join(cache_file_name(image));
    if dest.is_file() {
        debug!("image cache hit: {}", dest.display());
        return Ok(dest);
    }

    // Locking is keyed by the catalog key, not the basename: two keys
    // that happen to share a basename (unlikely, but not forbidden)
    // must not serialize on each other's downloads.
    let lock_path = env.image_cache_dir().join(format!("{}.lock", image.key));
    let lock_file = File::create(&lock_path)
        .with_context(|| format!("failed to create lock file {}", lock_path.display()))?;
    lock_file
        .lock_exclusive()
        .with_context(|| format!("failed to acquire lock on {}", lock_path.display()))?;

    // Another invocation may have finished the download while we waited.
    if dest.is_file() {
        return Ok(dest);
    }

    info!("fetching base image '{}' from {}", image.key, image.url);
    let result = download(env, image, &dest);
    let _ = lock_file.unlock();
    result
}

/// The cache file's basename is the URL's basename, preserved verbatim,
/// so two catalog entries that point at the same upstream file share
/// one cached copy.
fn cache_file_name(image: &OSImage) -> String {
    image
        .url
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(&image.key)
        .to_string()
}

fn download(env: &Environment, image: &OSImage, dest: &Path) -> Result<PathBuf> {
    let part_name = format!("{}.part", cache_file_name(image));
    let part_path = env.image_cache_dir().join(&part_name);

    let mut downloader = Downloader::builder()
        .download_folder(&env.image_cache_dir())
        .build()
        .map_err(|e| DockvmError::image_fetch(image.url.clone(), e.to_string()))?;

    let download = Download::new(&image.url).file_name(Path::new(&part_name));
    let summary = downloader
        .download(&[download])
        .map_err(|e| DockvmError::image_fetch(image.url.clone(), e.to_string()))?
        .into_iter()
        .next()
        .ok_or_else(|| DockvmError::image_fetch(image.url.clone(), "downloader returned no summary".to_string()))?
        .map_err(|e| DockvmError::image_fetch(image.url.clone(), e.to_string()))?;

    let status_code = summary
        .status
        .first()
        .map(|(_, code)| *code)
        .unwrap_or(0);
    if !(200..300).contains(&status_code) {
        let _ = fs::remove_file(&part_path);
        return Err(DockvmError::image_fetch(
            image.url.clone(),
            format!("unexpected HTTP status {status_code}"),
        )
        .into());
    }

    fs::rename(&part_path, dest)
        .with_context(|| format!("failed to move {} into place", part_path.display()))?;
    Ok(dest.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn cache_hit_skips_download() -> Result<()> {
        let tmp = TempDir::new("dockvm-imgcache")?;
        let env = Environment::open_at(tmp.path().join("base"))?;
        let image = OSImage {
            key: "ubuntu22.04".to_string(),
            url: "http://example.invalid/should-not-be-fetched.img".to_string(),
            variant: "ubuntu22.04".to_string(),
        };
        let cached = env.image_cache_dir().join(cache_file_name(&image));
        fs::write(&cached, b"already here")?;

        let path = ensure(&env, &image)?;
        assert_eq!(path, cached);
        Ok(())
    }

    #[test]
    fn cache_file_name_preserves_url_basename() {
        let image = OSImage {
            key: "fedora39".to_string(),
            url: "https://example.invalid/path/Fedora-Cloud-Base-39.qcow2".to_string(),
            variant: "fedora39".to_string(),
        };
        assert_eq!(cache_file_name(&image), "Fedora-Cloud-Base-39.qcow2");
    }
}
