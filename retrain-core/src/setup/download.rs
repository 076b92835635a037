use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::{
    fs::{self, File},
    path::{Path, PathBuf},
};
use tracing::info;

/// Fetches `source` into `dest`. `source` is an `http(s)://` URL, a
/// `file://` URL or a plain path. An existing `dest` is kept unless `force`.
pub fn fetch(source: &str, dest: &Path, force: bool) -> Result<PathBuf> {
    if dest.exists() && !force {
        info!("{} already exists, skipping download", dest.display());
        return Ok(dest.to_path_buf());
    }
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let mut part = dest.as_os_str().to_owned();
    part.push(".part");
    let part = PathBuf::from(part);

    if source.starts_with("http://") || source.starts_with("https://") {
        download(source, &part)?;
    } else {
        let from = Path::new(source.strip_prefix("file://").unwrap_or(source));
        info!("Copying {} to {}", from.display(), dest.display());
        fs::copy(from, &part).with_context(|| format!("Failed to copy {}", from.display()))?;
    }
    fs::rename(&part, dest).with_context(|| format!("Failed to move {}", part.display()))?;
    Ok(dest.to_path_buf())
}

fn download(url: &str, to: &Path) -> Result<()> {
    info!("Downloading {url}");
    let mut response = reqwest::blocking::get(url)
        .with_context(|| format!("Failed to request {url}"))?
        .error_for_status()
        .with_context(|| format!("Failed to download {url}"))?;

    let pb = match response.content_length() {
        Some(len) => ProgressBar::new(len),
        None => ProgressBar::new_spinner(),
    };
    pb.set_style(ProgressStyle::with_template(
        "{spinner} [{elapsed_precise}] [{wide_bar}] {bytes}/{total_bytes} ({eta})",
    )?);

    let file = File::create(to).with_context(|| format!("Failed to create {}", to.display()))?;
    let mut writer = pb.wrap_write(file);
    response
        .copy_to(&mut writer)
        .with_context(|| format!("Failed to download {url}"))?;
    pb.finish_and_clear();
    Ok(())
}
