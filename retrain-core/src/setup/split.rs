use super::Method;
use crate::layout::{images_in, Split};
use anyhow::{bail, Context, Result};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::{debug, info};

/// Relative sizes of the train, val and test splits, written `8:1:1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ratio {
    pub train: u32,
    pub val: u32,
    pub test: u32,
}

impl Default for Ratio {
    fn default() -> Self {
        Self {
            train: 8,
            val: 1,
            test: 1,
        }
    }
}

impl Ratio {
    fn total(&self) -> usize {
        (self.train + self.val + self.test) as usize
    }

    /// `(train, val, test)` counts for `n` images.
    pub fn counts(&self, n: usize) -> (usize, usize, usize) {
        let total = self.total().max(1);
        let val = n * self.val as usize / total;
        let test = n * self.test as usize / total;
        (n - val - test, val, test)
    }
}

impl FromStr for Ratio {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = s
            .split(':')
            .map(|p| p.trim().parse::<u32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("invalid ratio `{s}`: {e}"))?;
        match parts[..] {
            [train, val, test] if train > 0 && val > 0 && test > 0 => {
                Ok(Self { train, val, test })
            }
            [_, _, _] => Err(format!("every part of `{s}` must be positive")),
            _ => Err(format!("expected TRAIN:VAL:TEST, got `{s}`")),
        }
    }
}

impl fmt::Display for Ratio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.train, self.val, self.test)
    }
}

/// Materializes `class_root/<label>/...` as `dest/{train,val,test}/<label>/...`.
/// A source that already has `train/val/test` directories is materialized as is.
pub fn divide(
    class_root: &Path,
    dest: &Path,
    ratio: Ratio,
    seed: u64,
    method: Method,
) -> Result<()> {
    if Split::ALL
        .iter()
        .all(|s| class_root.join(s.dir_name()).is_dir())
    {
        info!("{} is already split, keeping its partition", class_root.display());
        for split in Split::ALL {
            let from = class_root.join(split.dir_name());
            for image in images_in(&from) {
                let rel = image.strip_prefix(&from)?;
                place(&image, &dest.join(split.dir_name()).join(rel), method)?;
            }
        }
        return Ok(());
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut classes = fs::read_dir(class_root)
        .with_context(|| format!("Failed to read {}", class_root.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .filter(|p| !p.file_name().is_some_and(|n| n.to_string_lossy().starts_with('.')))
        .collect::<Vec<_>>();
    classes.sort();
    if classes.is_empty() {
        bail!("{} contains no class directories", class_root.display());
    }

    for class in classes {
        let Some(label) = class.file_name() else {
            continue;
        };
        let mut images = images_in(&class);
        images.shuffle(&mut rng);
        let (train, val, _) = ratio.counts(images.len());
        let parts: [(Split, &[PathBuf]); 3] = [
            (Split::Train, &images[..train]),
            (Split::Val, &images[train..train + val]),
            (Split::Test, &images[train + val..]),
        ];
        for (split, part) in parts {
            let dir = dest.join(split.dir_name()).join(label);
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
            for image in part {
                let rel = image.strip_prefix(&class)?;
                place(image, &dir.join(rel), method)?;
            }
        }
        info!(
            "{}: {} train, {} val, {} test",
            label.to_string_lossy(),
            train,
            val,
            images.len() - train - val
        );
    }
    Ok(())
}

fn place(from: &Path, to: &Path, method: Method) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    if to.exists() {
        debug!("{} exists, skipping", to.display());
        return Ok(());
    }
    let from = from
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", from.display()))?;
    let res = match method {
        Method::Cp => fs::copy(&from, to).map(|_| {}),
        Method::SoftLink => {
            #[cfg(target_family = "unix")]
            let res = std::os::unix::fs::symlink(&from, to);
            #[cfg(target_family = "windows")]
            let res = std::os::windows::fs::symlink_file(&from, to);
            res
        }
        Method::HardLink => fs::hard_link(&from, to),
    };
    res.with_context(|| format!("Failed to place {} at {}", from.display(), to.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{tests::touch_tree, DatasetLayout};

    fn raw(root: &Path, classes: &[(&str, usize)]) {
        for (class, count) in classes {
            let dir = root.join(class);
            fs::create_dir_all(&dir).unwrap();
            for i in 0..*count {
                fs::write(dir.join(format!("{i:03}.jpg")), i.to_string()).unwrap();
            }
        }
    }

    fn count(dir: &Path) -> usize {
        images_in(dir).len()
    }

    #[test]
    fn ratio_parsing() {
        assert_eq!("8:1:1".parse::<Ratio>().unwrap(), Ratio::default());
        assert_eq!(
            "70:15:15".parse::<Ratio>().unwrap(),
            Ratio {
                train: 70,
                val: 15,
                test: 15
            }
        );
        assert!("8:1".parse::<Ratio>().is_err());
        assert!("8:0:1".parse::<Ratio>().is_err());
        assert!("a:b:c".parse::<Ratio>().is_err());
        assert_eq!(Ratio::default().to_string(), "8:1:1");
    }

    #[test]
    fn counts_floor_val_and_test() {
        assert_eq!(Ratio::default().counts(633), (507, 63, 63));
        assert_eq!(Ratio::default().counts(10), (8, 1, 1));
        assert_eq!(Ratio::default().counts(5), (5, 0, 0));
    }

    #[test]
    fn divides_every_class() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("raw");
        raw(&src, &[("daisy", 20), ("roses", 30)]);
        fs::write(src.join("LICENSE.txt"), b"").unwrap();
        let dest = dir.path().join("images");
        divide(&src, &dest, Ratio::default(), 7, Method::Cp).unwrap();

        assert_eq!(count(&dest.join("train/daisy")), 16);
        assert_eq!(count(&dest.join("val/daisy")), 2);
        assert_eq!(count(&dest.join("test/daisy")), 2);
        assert_eq!(count(&dest.join("train/roses")), 24);
        assert_eq!(count(&dest.join("val/roses")), 3);
        assert_eq!(count(&dest.join("test/roses")), 3);

        let layout = DatasetLayout::open(&dest).unwrap();
        assert_eq!(layout.classes().labels(), ["daisy", "roses"]);
    }

    #[test]
    fn same_seed_same_partition() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("raw");
        raw(&src, &[("a", 30)]);
        let first = dir.path().join("first");
        let second = dir.path().join("second");
        divide(&src, &first, Ratio::default(), 3, Method::Cp).unwrap();
        divide(&src, &second, Ratio::default(), 3, Method::HardLink).unwrap();
        let names = |root: &Path| {
            images_in(root.join("val/a"))
                .into_iter()
                .map(|p| p.file_name().unwrap().to_owned())
                .collect::<Vec<_>>()
        };
        assert_eq!(names(&first), names(&second));
    }

    #[cfg(target_family = "unix")]
    #[test]
    fn soft_links_point_at_the_source() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("raw");
        raw(&src, &[("a", 10)]);
        let dest = dir.path().join("images");
        divide(&src, &dest, Ratio::default(), 1, Method::SoftLink).unwrap();
        let linked = images_in(dest.join("train/a"));
        assert_eq!(linked.len(), 8);
        assert!(linked.iter().all(|p| p.is_symlink()));
    }

    #[test]
    fn pre_split_source_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("raw");
        touch_tree(
            &src,
            &[
                (Split::Train, "a", 3),
                (Split::Val, "a", 2),
                (Split::Test, "a", 1),
            ],
        );
        let dest = dir.path().join("images");
        divide(&src, &dest, Ratio::default(), 1, Method::Cp).unwrap();
        assert_eq!(count(&dest.join("train/a")), 3);
        assert_eq!(count(&dest.join("val/a")), 2);
        assert_eq!(count(&dest.join("test/a")), 1);
    }
}
