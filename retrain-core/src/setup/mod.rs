mod archive;
mod download;
mod split;

pub use archive::{extract, find_class_root};
pub use download::fetch;
pub use split::{divide, Ratio};

use crate::{layout::DatasetLayout, model::ResNetType};
use anyhow::{Context, Result};
use burn::config::Config;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    path::{Path, PathBuf},
};
use tracing::{info, warn};

pub const DATASET_URL: &str = "https://download.tensorflow.org/example_images/flower_photos.tgz";

/// How dataset files are placed into the split tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum Method {
    #[default]
    Cp,
    SoftLink,
    HardLink,
}

#[derive(Config, Debug)]
pub struct SetupConfig {
    #[config(default = "PathBuf::from(\"data\")")]
    pub data_dir: PathBuf,
    #[config(default = "ResNetType::Layer18")]
    pub architecture: ResNetType,
    /// Overrides the torchvision URL of `architecture`.
    pub weights_url: Option<String>,
    #[config(default = "String::from(DATASET_URL)")]
    pub dataset_url: String,
    #[config(default = "Ratio::default()")]
    pub ratio: Ratio,
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = "Method::Cp")]
    pub method: Method,
    #[config(default = false)]
    pub skip_weights: bool,
    /// Redo every stage even if its output exists.
    #[config(default = false)]
    pub force: bool,
}

/// Lays out `<data_dir>/{models,downloads,raw,images}`.
#[derive(Debug)]
pub struct Setup {
    config: SetupConfig,
}

impl Setup {
    pub fn new(config: SetupConfig) -> Self {
        Self { config }
    }

    pub fn weights_path(&self) -> PathBuf {
        self.config
            .data_dir
            .join("models")
            .join(self.config.architecture.weights_file_name())
    }

    pub fn image_dir(&self) -> PathBuf {
        self.config.data_dir.join("images")
    }

    fn raw_dir(&self) -> PathBuf {
        self.config.data_dir.join("raw")
    }

    fn archive_path(&self) -> PathBuf {
        let name = self
            .config
            .dataset_url
            .rsplit('/')
            .next()
            .filter(|n| !n.is_empty())
            .unwrap_or("dataset.tgz");
        self.config.data_dir.join("downloads").join(name)
    }

    pub fn run(&self) -> Result<()> {
        let force = self.config.force;
        if !self.config.skip_weights {
            let url = self
                .config
                .weights_url
                .as_deref()
                .unwrap_or(self.config.architecture.weights_url());
            fetch(url, &self.weights_path(), force)?;
        }

        let archive = fetch(&self.config.dataset_url, &self.archive_path(), force)?;

        let raw = self.raw_dir();
        stage(&raw, force, |tmp| extract(&archive, tmp))?;

        let images = self.image_dir();
        stage(&images, force, |tmp| {
            let class_root = find_class_root(&raw)?;
            info!(
                "Splitting {} into {} ({})",
                class_root.display(),
                images.display(),
                self.config.ratio
            );
            divide(
                &class_root,
                tmp,
                self.config.ratio,
                self.config.seed,
                self.config.method,
            )
        })?;

        let layout = DatasetLayout::open(&images)?;
        info!(
            "Dataset ready at {} with classes {:?}",
            images.display(),
            layout.classes().labels()
        );
        Ok(())
    }
}

/// Builds `dest` through `build`, which writes into a scratch sibling that
/// only replaces `dest` once complete. A marker records completion, so a
/// `dest` left behind without one is rebuilt.
fn stage(dest: &Path, force: bool, build: impl FnOnce(&Path) -> Result<()>) -> Result<()> {
    let marker = sibling(dest, ".", ".complete");
    if !force && marker.is_file() && dest.is_dir() {
        info!("{} is ready, keeping it", dest.display());
        return Ok(());
    }
    if !force && dest.exists() {
        warn!("{} is incomplete, rebuilding it", dest.display());
    }
    remove_file(&marker)?;
    remove_dir(dest)?;
    let tmp = sibling(dest, "", ".tmp");
    remove_dir(&tmp)?;
    build(&tmp)?;
    std::fs::rename(&tmp, dest)
        .with_context(|| format!("Failed to move {} into place", tmp.display()))?;
    File::create(&marker).with_context(|| format!("Failed to create {}", marker.display()))?;
    Ok(())
}

fn sibling(path: &Path, prefix: &str, suffix: &str) -> PathBuf {
    let name = path.file_name().unwrap_or_default().to_string_lossy();
    path.with_file_name(format!("{prefix}{name}{suffix}"))
}

fn remove_file(path: &Path) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove {}", path.display()))?;
    }
    Ok(())
}

fn remove_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        std::fs::remove_dir_all(dir)
            .with_context(|| format!("Failed to remove {}", dir.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{write::GzEncoder, Compression};

    fn flower_archive(path: &Path) {
        let file = File::create(path).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::fast()));
        for class in ["daisy", "roses"] {
            for i in 0..10 {
                let data = b"jpg";
                let mut header = tar::Header::new_gnu();
                header.set_size(data.len() as u64);
                header.set_mode(0o644);
                header.set_cksum();
                builder
                    .append_data(
                        &mut header,
                        format!("flower_photos/{class}/{i}.jpg"),
                        &data[..],
                    )
                    .unwrap();
            }
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn setup_lays_out_the_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("flower_photos.tgz");
        flower_archive(&archive);
        let weights = dir.path().join("weights.pth");
        std::fs::write(&weights, b"state dict").unwrap();

        let data = dir.path().join("data");
        let setup = Setup::new(
            SetupConfig::new()
                .with_data_dir(data.clone())
                .with_weights_url(Some(weights.display().to_string()))
                .with_dataset_url(format!("file://{}", archive.display())),
        );
        setup.run().unwrap();

        assert!(data.join("models/resnet18.pth").is_file());
        assert!(data.join("downloads/flower_photos.tgz").is_file());
        assert!(data.join("raw/flower_photos/daisy/0.jpg").is_file());
        let layout = DatasetLayout::open(setup.image_dir()).unwrap();
        assert_eq!(layout.classes().labels(), ["daisy", "roses"]);
        assert_eq!(layout.images(crate::Split::Train).len(), 16);

        assert!(data.join(".raw.complete").is_file());
        assert!(data.join(".images.complete").is_file());
        assert!(!data.join("raw.tmp").exists());
        assert!(!data.join("images.tmp").exists());

        // A second run reuses every stage.
        std::fs::remove_file(&archive).unwrap();
        setup.run().unwrap();
    }

    #[test]
    fn interrupted_stages_are_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("flower_photos.tgz");
        flower_archive(&archive);
        let data = dir.path().join("data");

        // leftovers of a run killed while extracting and splitting
        for i in 0..10 {
            let path = data.join(format!("raw/flower_photos/daisy/{i}.jpg"));
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, b"jpg").unwrap();
        }
        std::fs::create_dir_all(data.join("raw/flower_photos/roses")).unwrap();
        std::fs::write(data.join("raw/flower_photos/roses/0.jpg"), b"jpg").unwrap();
        std::fs::create_dir_all(data.join("images.tmp/train/daisy")).unwrap();

        let setup = Setup::new(
            SetupConfig::new()
                .with_data_dir(data.clone())
                .with_skip_weights(true)
                .with_dataset_url(archive.display().to_string()),
        );
        setup.run().unwrap();

        let layout = DatasetLayout::open(setup.image_dir()).unwrap();
        let train = layout.images(crate::Split::Train);
        assert_eq!(train.len(), 16);
        let roses = layout.classes().index_of("roses").unwrap();
        assert_eq!(train.iter().filter(|(_, label)| *label == roses).count(), 8);
        assert!(!data.join("images.tmp").exists());
    }
}
