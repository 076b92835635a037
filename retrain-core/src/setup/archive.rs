use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use std::{
    fs::File,
    io::Read,
    path::{Path, PathBuf},
};
use tracing::info;

/// Unpacks a `.tar.gz`, `.tgz` or `.tar` archive into `dest`.
pub fn extract(archive: &Path, dest: &Path) -> Result<()> {
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let file =
        File::open(archive).with_context(|| format!("Failed to open {}", archive.display()))?;
    let reader: Box<dyn Read> = if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        Box::new(GzDecoder::new(file))
    } else if name.ends_with(".tar") {
        Box::new(file)
    } else {
        bail!(
            "unsupported archive format {}, expected .tar.gz, .tgz or .tar",
            archive.display()
        );
    };
    info!("Extracting {} to {}", archive.display(), dest.display());
    std::fs::create_dir_all(dest).with_context(|| format!("Failed to create {}", dest.display()))?;
    tar::Archive::new(reader)
        .unpack(dest)
        .with_context(|| format!("Failed to extract {}", archive.display()))
}

/// Descends through directories that only wrap a single directory (like
/// `flower_photos/`) down to the one holding the class folders.
pub fn find_class_root(dir: &Path) -> Result<PathBuf> {
    let mut current = dir.to_path_buf();
    loop {
        let mut dirs = vec![];
        let mut has_files = false;
        let entries = std::fs::read_dir(&current)
            .with_context(|| format!("Failed to read {}", current.display()))?;
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            match path.is_dir() {
                true => dirs.push(path),
                false => has_files = true,
            }
        }
        match (dirs.len(), has_files) {
            (1, false) => current = dirs.remove(0),
            (0, _) => bail!("{} contains no class directories", current.display()),
            _ => return Ok(current),
        }
    }
}
