use crate::layout::{images_in, DatasetLayout, Split};
use anyhow::{Context, Result};
use burn::{
    data::dataloader::{batcher::Batcher, Dataset},
    prelude::*,
    tensor::TensorData,
};
use image::{imageops::FilterType, DynamicImage, Rgb, RgbImage};
use imageproc::geometric_transformations::{warp, Interpolation, Projection};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};
use tracing::warn;

/// Per-channel statistics of ImageNet, which the pretrained weights expect.
const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Random geometric perturbations applied to training images.
/// Shift and zoom are fractions of the image size, shear is the
/// horizontal shear factor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Augmentation {
    pub width_shift: f32,
    pub height_shift: f32,
    pub shear: f32,
    pub zoom: f32,
    pub horizontal_flip: bool,
}

impl Default for Augmentation {
    fn default() -> Self {
        Self {
            width_shift: 0.1,
            height_shift: 0.1,
            shear: 0.2,
            zoom: 0.2,
            horizontal_flip: true,
        }
    }
}

impl Augmentation {
    pub fn none() -> Self {
        Self {
            width_shift: 0.,
            height_shift: 0.,
            shear: 0.,
            zoom: 0.,
            horizontal_flip: false,
        }
    }

    pub fn apply(&self, img: RgbImage, rng: &mut impl Rng) -> RgbImage {
        let img = if self.horizontal_flip && rng.gen_bool(0.5) {
            image::imageops::flip_horizontal(&img)
        } else {
            img
        };
        if !self.is_geometric() {
            return img;
        }
        let (w, h) = (img.width() as f32, img.height() as f32);
        let (cx, cy) = (w / 2., h / 2.);
        let dx = symmetric(rng, self.width_shift) * w;
        let dy = symmetric(rng, self.height_shift) * h;
        let zoom = 1. + symmetric(rng, self.zoom);
        let shear = symmetric(rng, self.shear);
        let Some(shear) =
            Projection::from_matrix([1., shear, 0., 0., 1., 0., 0., 0., 1.])
        else {
            return img;
        };
        let projection = Projection::translate(dx, dy)
            * Projection::translate(cx, cy)
            * Projection::scale(zoom, zoom)
            * shear
            * Projection::translate(-cx, -cy);
        warp(&img, &projection, Interpolation::Bilinear, Rgb([0, 0, 0]))
    }

    fn is_geometric(&self) -> bool {
        self.width_shift > 0. || self.height_shift > 0. || self.shear > 0. || self.zoom > 0.
    }
}

fn symmetric(rng: &mut impl Rng, range: f32) -> f32 {
    if range > 0. {
        rng.gen_range(-range..range)
    } else {
        0.
    }
}

#[derive(Debug, Clone)]
pub struct ImageData {
    pixels: Vec<f32>,
    size: usize,
    label: usize,
    path: PathBuf,
}

impl ImageData {
    pub fn label(&self) -> usize {
        self.label
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Images of one split paired with their class index.
pub struct ImageDataSet {
    items: Vec<(PathBuf, usize)>,
    image_size: usize,
    augmentation: Option<Augmentation>,
    seed: u64,
    /// How often each item has been drawn, so every epoch augments differently
    /// while the whole run stays reproducible from `seed`.
    draws: Vec<AtomicU64>,
}

impl ImageDataSet {
    pub fn new(items: Vec<(PathBuf, usize)>, image_size: usize) -> Self {
        let draws = items.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            items,
            image_size,
            augmentation: None,
            seed: 0,
            draws,
        }
    }

    pub fn split(layout: &DatasetLayout, split: Split, image_size: usize) -> Self {
        Self::new(layout.images(split), image_size)
    }

    /// Every image below `path` (or `path` itself), labeled 0.
    pub fn unlabeled(path: impl AsRef<Path>, image_size: usize) -> Result<Self> {
        let path = path.as_ref();
        let items = if path.is_file() {
            vec![(path.to_path_buf(), 0)]
        } else {
            anyhow::ensure!(path.is_dir(), "{} does not exist", path.display());
            images_in(path).into_iter().map(|p| (p, 0)).collect()
        };
        anyhow::ensure!(!items.is_empty(), "no images found in {}", path.display());
        Ok(Self::new(items, image_size))
    }

    pub fn with_augmentation(mut self, augmentation: Augmentation, seed: u64) -> Self {
        self.augmentation = Some(augmentation);
        self.seed = seed;
        self
    }

    fn item_rng(&self, index: usize) -> StdRng {
        let draw = self.draws[index].fetch_add(1, Ordering::Relaxed);
        let mixed = self.seed
            ^ (index as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15)
            ^ draw.wrapping_mul(0xc2b2_ae3d_27d4_eb4f).rotate_left(31);
        StdRng::seed_from_u64(mixed)
    }
}

impl Dataset<ImageData> for ImageDataSet {
    fn get(&self, index: usize) -> Option<ImageData> {
        let (path, label) = self.items.get(index)?;
        let size = self.image_size as u32;
        let img = open_image_resize(path, size).unwrap_or_else(|err| {
            warn!("{err:#}, substituting a blank image");
            RgbImage::new(size, size)
        });
        let img = match self.augmentation {
            Some(ref augmentation) => augmentation.apply(img, &mut self.item_rng(index)),
            None => img,
        };
        Some(ImageData {
            pixels: normalize(&img),
            size: self.image_size,
            label: *label,
            path: path.clone(),
        })
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

#[derive(Clone)]
pub struct ImageBatcher<B: Backend> {
    device: B::Device,
}

#[derive(Debug, Clone)]
pub struct ImageBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
    pub paths: Vec<PathBuf>,
}

impl<B: Backend> ImageBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }
}

impl<B: Backend> Batcher<ImageData, ImageBatch<B>> for ImageBatcher<B> {
    fn batch(&self, items: Vec<ImageData>) -> ImageBatch<B> {
        let images = items
            .iter()
            .map(|item| {
                let data = TensorData::new(item.pixels.clone(), [1, 3, item.size, item.size]);
                Tensor::<B, 4>::from_data(data.convert::<B::FloatElem>(), &self.device)
            })
            .collect::<Vec<_>>();
        let labels = items
            .iter()
            .map(|item| item.label as i64)
            .collect::<Vec<_>>();
        let count = labels.len();

        let images = Tensor::cat(images, 0);
        let targets = Tensor::<B, 1, Int>::from_data(
            TensorData::new(labels, [count]).convert::<B::IntElem>(),
            &self.device,
        );
        let paths = items.into_iter().map(|item| item.path).collect();

        ImageBatch {
            images,
            targets,
            paths,
        }
    }
}

/// Scales the image to fit a `size`x`size` square, keeping its aspect ratio
/// and centering it on a black background.
pub(crate) fn open_image_resize(path: impl AsRef<Path>, size: u32) -> Result<RgbImage> {
    let path = path.as_ref();
    let img = image::open(path).with_context(|| format!("Failed to load {}", path.display()))?;
    letterbox(&img, size).with_context(|| format!("{} has no pixels", path.display()))
}

fn letterbox(img: &DynamicImage, size: u32) -> Option<RgbImage> {
    let factor = img.height().max(img.width()) as f64 / size as f64;
    if factor == 0. {
        return None;
    }
    let nheight = ((img.height() as f64 / factor).round() as u32).clamp(1, size);
    let nwidth = ((img.width() as f64 / factor).round() as u32).clamp(1, size);
    let resized = img
        .resize_exact(nwidth, nheight, FilterType::Triangle)
        .to_rgb8();
    let mut background = RgbImage::new(size, size);
    image::imageops::overlay(
        &mut background,
        &resized,
        ((size - nwidth) / 2) as i64,
        ((size - nheight) / 2) as i64,
    );
    Some(background)
}

/// HWC bytes to normalized CHW floats.
fn normalize(img: &RgbImage) -> Vec<f32> {
    let plane = (img.width() * img.height()) as usize;
    let mut out = vec![0.; 3 * plane];
    for (i, pixel) in img.pixels().enumerate() {
        for c in 0..3 {
            out[c * plane + i] = (pixel[c] as f32 / 255. - MEAN[c]) / STD[c];
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use rand::{rngs::StdRng, SeedableRng};

    type TestBackend = NdArray<f32>;

    fn save_image(path: &Path, w: u32, h: u32, color: [u8; 3]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        RgbImage::from_pixel(w, h, Rgb(color)).save(path).unwrap();
    }

    #[test]
    fn letterbox_keeps_aspect_ratio() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wide.png");
        save_image(&path, 40, 20, [255, 255, 255]);
        let img = open_image_resize(&path, 20).unwrap();
        assert_eq!(img.dimensions(), (20, 20));
        // the 20x10 picture sits in rows 5..15
        assert_eq!(img.get_pixel(10, 0), &Rgb([0, 0, 0]));
        assert!(img.get_pixel(10, 10)[0] > 250);
        assert_eq!(img.get_pixel(10, 19), &Rgb([0, 0, 0]));
    }

    #[test]
    fn normalize_is_channel_major() {
        let img = RgbImage::from_fn(2, 1, |x, _| if x == 0 { Rgb([255, 0, 0]) } else { Rgb([0, 0, 0]) });
        let pixels = normalize(&img);
        assert_eq!(pixels.len(), 6);
        assert!((pixels[0] - (1. - MEAN[0]) / STD[0]).abs() < 1e-6);
        assert!((pixels[1] + MEAN[0] / STD[0]).abs() < 1e-6);
        assert!((pixels[2] + MEAN[1] / STD[1]).abs() < 1e-6);
    }

    #[test]
    fn disabled_augmentation_is_identity() {
        let img = RgbImage::from_fn(8, 8, |x, y| Rgb([(x * 30) as u8, (y * 30) as u8, 7]));
        let mut rng = StdRng::seed_from_u64(7);
        let out = Augmentation::none().apply(img.clone(), &mut rng);
        assert_eq!(out, img);
    }

    #[test]
    fn augmentation_keeps_dimensions() {
        let img = RgbImage::from_fn(16, 16, |x, y| Rgb([(x * 15) as u8, (y * 15) as u8, 0]));
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..8 {
            let out = Augmentation::default().apply(img.clone(), &mut rng);
            assert_eq!(out.dimensions(), (16, 16));
        }
    }

    #[test]
    fn augmentation_follows_the_seed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grad.png");
        std::fs::create_dir_all(dir.path()).unwrap();
        RgbImage::from_fn(16, 16, |x, y| Rgb([(x * 15) as u8, (y * 15) as u8, 90]))
            .save(&path)
            .unwrap();
        let items = vec![(path, 0)];
        let augmented = |seed| {
            ImageDataSet::new(items.clone(), 16).with_augmentation(Augmentation::default(), seed)
        };

        let (a, b) = (augmented(3), augmented(3));
        let first = a.get(0).unwrap().pixels;
        assert_eq!(first, b.get(0).unwrap().pixels);
        // the next epoch draws new perturbations, again in lockstep
        let second = a.get(0).unwrap().pixels;
        assert_ne!(first, second);
        assert_eq!(second, b.get(0).unwrap().pixels);
        assert_ne!(first, augmented(4).get(0).unwrap().pixels);
    }

    #[test]
    fn dataset_substitutes_unreadable_images() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("a/good.png");
        save_image(&good, 4, 4, [10, 20, 30]);
        let bad = dir.path().join("b/bad.png");
        std::fs::create_dir_all(bad.parent().unwrap()).unwrap();
        std::fs::write(&bad, b"not a png").unwrap();

        let dataset = ImageDataSet::new(vec![(good, 0), (bad.clone(), 1)], 8);
        assert_eq!(dataset.len(), 2);
        let item = dataset.get(1).unwrap();
        assert_eq!(item.label(), 1);
        assert_eq!(item.path(), bad);
        assert_eq!(item.pixels.len(), 3 * 8 * 8);
        assert!(dataset.get(2).is_none());
    }

    #[test]
    fn batcher_stacks_images_and_targets() {
        let dir = tempfile::tempdir().unwrap();
        let items = (0..3)
            .map(|i| {
                let path = dir.path().join(format!("{i}.png"));
                save_image(&path, 6, 3, [i * 40, 0, 0]);
                (path, i as usize)
            })
            .collect::<Vec<_>>();
        let dataset = ImageDataSet::new(items, 8);
        let batcher = ImageBatcher::<TestBackend>::new(Default::default());
        let batch = batcher.batch((0..3).filter_map(|i| dataset.get(i)).collect());
        assert_eq!(batch.images.dims(), [3, 3, 8, 8]);
        assert_eq!(batch.targets.dims(), [3]);
        assert_eq!(
            batch.targets.into_data().convert::<i64>().to_vec::<i64>().unwrap(),
            vec![0, 1, 2]
        );
        assert_eq!(batch.paths.len(), 3);
    }

    #[test]
    fn unlabeled_accepts_file_or_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x/one.png");
        save_image(&path, 2, 2, [0, 0, 0]);
        save_image(&dir.path().join("two.jpg"), 2, 2, [0, 0, 0]);
        assert_eq!(ImageDataSet::unlabeled(&path, 4).unwrap().len(), 1);
        assert_eq!(ImageDataSet::unlabeled(dir.path(), 4).unwrap().len(), 2);
        assert!(ImageDataSet::unlabeled(dir.path().join("missing"), 4).is_err());
    }
}
