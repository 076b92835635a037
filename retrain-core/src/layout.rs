use anyhow::{Context, Result};
use clap::ValueEnum;
use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    fs::File,
    path::{Path, PathBuf},
};
use thiserror::Error;

/// The three partitions every dataset tree is made of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Val,
    Test,
}

impl Split {
    pub const ALL: [Split; 3] = [Split::Train, Split::Val, Split::Test];

    pub fn dir_name(self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val => "val",
            Split::Test => "test",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("dataset directory {0} does not exist")]
    MissingRoot(PathBuf),
    #[error("expected a `{split}` directory at {path}")]
    MissingSplit { split: Split, path: PathBuf },
    #[error("the `{0}` split contains no images")]
    EmptySplit(Split),
    #[error("the `{split}` split has classes {found:?}, expected {expected:?}")]
    ClassMismatch {
        split: Split,
        expected: Vec<String>,
        found: Vec<String>,
    },
    #[error("class `{class}` of the `{split}` split contains no images")]
    EmptyClass { split: Split, class: String },
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Index <-> label mapping. Indices follow the alphabetical order of the
/// class directories, so the same tree always yields the same mapping.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClassMap {
    labels: Vec<String>,
}

impl ClassMap {
    pub fn new(labels: impl IntoIterator<Item = String>) -> Self {
        let labels = labels
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        Self { labels }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn label(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.labels.binary_search_by(|l| l.as_str().cmp(label)).ok()
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Writes the label file: a JSON object from index to label name.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let by_index = self
            .labels
            .iter()
            .enumerate()
            .collect::<BTreeMap<_, _>>();
        let file =
            File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
        serde_json::to_writer_pretty(file, &by_index)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let by_index: BTreeMap<usize, String> = serde_json::from_reader(file)
            .with_context(|| format!("{} is not a valid label file", path.display()))?;
        anyhow::ensure!(
            by_index.keys().copied().eq(0..by_index.len()),
            "{} must map every index from 0 to {}",
            path.display(),
            by_index.len().saturating_sub(1)
        );
        Ok(Self {
            labels: by_index.into_values().collect(),
        })
    }
}

/// A dataset tree `<root>/{train,val,test}/<label>/<images>` that has been
/// checked to be usable for training.
#[derive(Debug, Clone)]
pub struct DatasetLayout {
    root: PathBuf,
    classes: ClassMap,
}

impl DatasetLayout {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, LayoutError> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(LayoutError::MissingRoot(root));
        }
        let mut expected: Option<Vec<String>> = None;
        for split in Split::ALL {
            let dir = root.join(split.dir_name());
            if !dir.is_dir() {
                return Err(LayoutError::MissingSplit { split, path: dir });
            }
            let found = class_dirs(&dir)?;
            let mut total = 0;
            for class in found.iter() {
                let count = images_in(&dir.join(class)).len();
                if count == 0 && split == Split::Train {
                    return Err(LayoutError::EmptyClass {
                        split,
                        class: class.clone(),
                    });
                }
                total += count;
            }
            if total == 0 {
                return Err(LayoutError::EmptySplit(split));
            }
            match expected {
                None => expected = Some(found),
                Some(ref expected) if *expected != found => {
                    return Err(LayoutError::ClassMismatch {
                        split,
                        expected: expected.clone(),
                        found,
                    })
                }
                Some(_) => {}
            }
        }
        Ok(Self {
            root,
            classes: ClassMap::new(expected.unwrap_or_default()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn classes(&self) -> &ClassMap {
        &self.classes
    }

    pub fn split_dir(&self, split: Split) -> PathBuf {
        self.root.join(split.dir_name())
    }

    /// Every image of a split with its class index, sorted by path.
    pub fn images(&self, split: Split) -> Vec<(PathBuf, usize)> {
        let dir = self.split_dir(split);
        self.classes
            .labels()
            .iter()
            .enumerate()
            .flat_map(|(index, label)| {
                images_in(&dir.join(label))
                    .into_iter()
                    .map(move |path| (path, index))
            })
            .collect()
    }
}

fn class_dirs(dir: &Path) -> Result<Vec<String>, LayoutError> {
    let entries = std::fs::read_dir(dir).map_err(|source| LayoutError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut classes = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| !name.starts_with('.'))
        .collect::<Vec<_>>();
    classes.sort();
    Ok(classes)
}

pub(crate) fn is_image(path: &Path) -> bool {
    matches!(MimeGuess::from_path(path).first(), Some(mime) if mime.type_() == "image")
}

/// Image files below `root`, sorted.
pub(crate) fn images_in(root: impl AsRef<Path>) -> Vec<PathBuf> {
    let mut res = walkdir::WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_map(|res| res.ok())
        .filter(|e| e.file_type().is_file() && is_image(e.path()))
        .map(|e| e.into_path())
        .collect::<Vec<_>>();
    res.sort();
    res
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn touch_tree(root: &Path, tree: &[(Split, &str, usize)]) {
        for (split, class, count) in tree {
            let dir = root.join(split.dir_name()).join(class);
            std::fs::create_dir_all(&dir).unwrap();
            for i in 0..*count {
                std::fs::write(dir.join(format!("{i}.jpg")), b"").unwrap();
            }
        }
    }

    fn full_tree(root: &Path) {
        touch_tree(
            root,
            &[
                (Split::Train, "tulips", 3),
                (Split::Train, "daisy", 2),
                (Split::Val, "tulips", 1),
                (Split::Val, "daisy", 1),
                (Split::Test, "tulips", 1),
                (Split::Test, "daisy", 0),
            ],
        );
    }

    #[test]
    fn open_valid_tree() {
        let dir = tempfile::tempdir().unwrap();
        full_tree(dir.path());
        let layout = DatasetLayout::open(dir.path()).unwrap();
        assert_eq!(layout.classes().labels(), ["daisy", "tulips"]);
        let train = layout.images(Split::Train);
        assert_eq!(train.len(), 5);
        assert_eq!(train.iter().filter(|(_, c)| *c == 0).count(), 2);
        assert_eq!(layout.images(Split::Test).len(), 1);
    }

    #[test]
    fn missing_split_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        touch_tree(
            dir.path(),
            &[(Split::Train, "a", 1), (Split::Val, "a", 1)],
        );
        let err = DatasetLayout::open(dir.path()).unwrap_err();
        assert!(matches!(err, LayoutError::MissingSplit { split: Split::Test, .. }));
    }

    #[test]
    fn class_mismatch_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        touch_tree(
            dir.path(),
            &[
                (Split::Train, "a", 1),
                (Split::Train, "b", 1),
                (Split::Val, "a", 1),
                (Split::Test, "a", 1),
                (Split::Test, "b", 1),
            ],
        );
        match DatasetLayout::open(dir.path()).unwrap_err() {
            LayoutError::ClassMismatch { split, found, .. } => {
                assert_eq!(split, Split::Val);
                assert_eq!(found, ["a"]);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn empty_training_class_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        full_tree(dir.path());
        std::fs::create_dir_all(dir.path().join("train/roses")).unwrap();
        let err = DatasetLayout::open(dir.path()).unwrap_err();
        assert!(matches!(err, LayoutError::EmptyClass { ref class, .. } if class == "roses"));
    }

    #[test]
    fn non_images_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        full_tree(dir.path());
        std::fs::write(dir.path().join("train/daisy/LICENSE.txt"), b"").unwrap();
        let layout = DatasetLayout::open(dir.path()).unwrap();
        assert_eq!(layout.images(Split::Train).len(), 5);
    }

    #[test]
    fn label_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/labels.json");
        let classes = ClassMap::new(["roses".to_string(), "daisy".to_string()]);
        classes.save(&path).unwrap();
        let raw: serde_json::Value =
            serde_json::from_reader(File::open(&path).unwrap()).unwrap();
        assert_eq!(raw["0"], "daisy");
        let loaded = ClassMap::load(&path).unwrap();
        assert_eq!(loaded, classes);
        assert_eq!(loaded.index_of("roses"), Some(1));
        assert_eq!(loaded.label(2), None);
    }
}
