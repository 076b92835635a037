use crate::{
    data::{ImageBatcher, ImageDataSet},
    model::ExportedModel,
};
use anyhow::Result;
use burn::{data::dataloader::DataLoaderBuilder, prelude::*, tensor::activation::softmax};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::{io::Write, path::PathBuf};
use tracing::info;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum Output {
    /// Human readable, one block per image
    #[default]
    Tty,
    /// A JSON array of predictions
    Json,
}

#[derive(Config, Debug)]
pub struct PredictConfig {
    /// Directory of an exported model
    pub model_dir: PathBuf,
    /// An image, or a directory searched recursively for images
    pub input: PathBuf,
    #[config(default = "Output::Tty")]
    pub output: Output,
    #[config(default = 3)]
    pub top_k: usize,
    #[config(default = 32)]
    pub batch_size: usize,
    #[config(default = 1)]
    pub num_workers: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub path: PathBuf,
    /// Most likely labels first
    pub labels: Vec<(String, f32)>,
}

pub fn predict<B: Backend>(
    config: &PredictConfig,
    device: &B::Device,
    out: &mut impl Write,
) -> Result<Vec<Prediction>> {
    let exported = ExportedModel::open(&config.model_dir)?;
    let model = exported.load::<B>(device)?;
    let classes = &exported.classes;
    let dataset = ImageDataSet::unlabeled(&config.input, exported.config.image_size)?;
    info!(
        "Classifying {} images into {} classes",
        burn::data::dataset::Dataset::len(&dataset),
        classes.len()
    );
    let loader = DataLoaderBuilder::new(ImageBatcher::<B>::new(device.clone()))
        .batch_size(config.batch_size.max(1))
        .num_workers(config.num_workers)
        .build(dataset);

    let top_k = config.top_k.clamp(1, classes.len().max(1));
    let mut predictions = vec![];
    for batch in loader.iter() {
        let probs = softmax(model.forward(batch.images), 1);
        let [_, n] = probs.dims();
        let probs = probs.into_data().iter::<f32>().collect::<Vec<_>>();
        for (row, path) in probs.chunks(n).zip(batch.paths) {
            let mut ranked = row.iter().copied().enumerate().collect::<Vec<_>>();
            ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
            let labels = ranked
                .into_iter()
                .take(top_k)
                .map(|(i, p)| (classes.label(i).unwrap_or("?").to_string(), p))
                .collect();
            predictions.push(Prediction { path, labels });
        }
    }

    match config.output {
        Output::Tty => {
            for prediction in predictions.iter() {
                writeln!(out, "{}", prediction.path.display())?;
                for (label, p) in prediction.labels.iter() {
                    writeln!(out, "  {label:<20} {:>6.2}%", p * 100.)?;
                }
            }
        }
        Output::Json => {
            serde_json::to_writer_pretty(&mut *out, &predictions)?;
            writeln!(out)?;
        }
    }
    Ok(predictions)
}
