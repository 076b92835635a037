use crate::{
    data::{ImageBatch, ImageBatcher, ImageData, ImageDataSet},
    layout::images_in,
    model::{ExportedModel, ResNet},
};
use anyhow::{Context, Result};
use burn::{
    data::{
        dataloader::{DataLoader, DataLoaderBuilder},
        dataset::{
            transform::{PartialDataset, ShuffledDataset},
            Dataset,
        },
    },
    nn::loss::CrossEntropyLossConfig,
    prelude::*,
};
use serde::{Deserialize, Serialize};
use std::{path::Path, sync::Arc};
use tracing::{debug, info};

/// Mean loss and accuracy over a set of images.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub loss: f32,
    pub accuracy: f32,
    pub count: usize,
}

/// Number of rows of `output` whose highest logit is the target class.
pub(crate) fn accuracy<B: Backend>(output: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    output
        .argmax(1)
        .squeeze::<1>(1)
        .equal(targets)
        .int()
        .sum()
        .into_scalar()
        .elem::<i64>() as usize
}

pub fn evaluate<B: Backend>(
    model: &ResNet<B>,
    loader: &Arc<dyn DataLoader<ImageBatch<B>>>,
) -> Evaluation {
    let mut total_loss = 0.;
    let mut correct = 0;
    let mut count = 0;

    for batch in loader.iter() {
        let n = batch.targets.dims()[0];
        let output = model.forward(batch.images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), batch.targets.clone());
        total_loss += loss.into_scalar().elem::<f32>() * n as f32;
        correct += accuracy(output, batch.targets);
        count += n;
    }

    if count == 0 {
        return Evaluation::default();
    }
    Evaluation {
        loss: total_loss / count as f32,
        accuracy: correct as f32 / count as f32,
        count,
    }
}

pub(crate) type Subset = PartialDataset<ShuffledDataset<ImageDataSet, ImageData>, ImageData>;

/// Shuffles `dataset` with `seed` and keeps at most `limit` items.
pub(crate) fn subset(dataset: ImageDataSet, limit: Option<usize>, seed: u64) -> Subset {
    let len = dataset.len();
    let end = limit.map_or(len, |limit| limit.min(len));
    PartialDataset::new(ShuffledDataset::with_seed(dataset, seed), 0, end)
}

pub(crate) fn eval_loader<B: Backend>(
    dataset: Subset,
    batch_size: usize,
    num_workers: usize,
    device: &B::Device,
) -> Arc<dyn DataLoader<ImageBatch<B>>> {
    DataLoaderBuilder::new(ImageBatcher::<B>::new(device.clone()))
        .batch_size(batch_size)
        .num_workers(num_workers)
        .build(dataset)
}

/// Evaluates an exported model against a directory of `<label>/<images>`,
/// typically one split of the dataset tree.
pub fn evaluate_exported<B: Backend>(
    model_dir: &Path,
    split_dir: &Path,
    batch_size: usize,
    limit: Option<usize>,
    device: &B::Device,
) -> Result<Evaluation> {
    let exported = ExportedModel::open(model_dir)?;
    let model = exported.load::<B>(device)?;

    let mut items = vec![];
    let entries = std::fs::read_dir(split_dir)
        .with_context(|| format!("Failed to read {}", split_dir.display()))?;
    for entry in entries.filter_map(|e| e.ok()).filter(|e| e.path().is_dir()) {
        let name = entry.file_name().to_string_lossy().into_owned();
        let index = exported.classes.index_of(&name).with_context(|| {
            format!("class `{name}` is unknown to the model in {}", model_dir.display())
        })?;
        items.extend(images_in(entry.path()).into_iter().map(|p| (p, index)));
    }
    items.sort();
    anyhow::ensure!(!items.is_empty(), "no images found in {}", split_dir.display());
    debug!("Evaluating on {} images", items.len());

    let dataset = subset(
        ImageDataSet::new(items, exported.config.image_size),
        limit,
        0,
    );
    let loader = eval_loader::<B>(dataset, batch_size, 1, device);
    let evaluation = evaluate(&model, &loader);
    info!(
        "Accuracy {:.1}% (N={}), loss {:.4}",
        evaluation.accuracy * 100.,
        evaluation.count,
        evaluation.loss
    );
    Ok(evaluation)
}
