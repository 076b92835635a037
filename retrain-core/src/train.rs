use crate::{
    data::{Augmentation, ImageBatch, ImageBatcher, ImageDataSet},
    evaluate::{accuracy, eval_loader, evaluate, subset, Evaluation},
    layout::{DatasetLayout, Split},
    model::{ExportedModel, ModelConfig, ResNet},
    runs::{EventWriter, MetricEvent, RunDir, RunSummary},
};
use anyhow::{Context, Result};
use burn::{
    data::dataloader::{DataLoader, DataLoaderBuilder},
    module::AutodiffModule,
    nn::loss::CrossEntropyLossConfig,
    optim::{AdamConfig, GradientsParams, Optimizer, SgdConfig},
    prelude::*,
    record::CompactRecorder,
    tensor::backend::AutodiffBackend,
};
use chrono::{Local, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, info};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    #[default]
    Sgd,
    Adam,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LrDecay {
    #[default]
    Constant,
    /// Linear from the given rate down to a tenth of it at the last epoch.
    Linear,
}

impl LrDecay {
    /// Learning rate for `epoch` (1-based) out of `num_epochs`.
    pub fn rate(self, base: f64, epoch: usize, num_epochs: usize) -> f64 {
        match self {
            LrDecay::Constant => base,
            LrDecay::Linear if num_epochs <= 1 => base,
            LrDecay::Linear => {
                let progress = (epoch.saturating_sub(1)) as f64 / (num_epochs - 1) as f64;
                base * (1. - 0.9 * progress.min(1.))
            }
        }
    }
}

#[derive(Config, Debug)]
pub struct TrainingConfig {
    pub model: ModelConfig,
    #[config(default = "PathBuf::from(\"data/images\")")]
    pub image_dir: PathBuf,
    /// Pretrained torchvision weights. Without them the network starts from
    /// random initialization.
    pub weights: Option<PathBuf>,
    #[config(default = "PathBuf::from(\"data/output_labels.json\")")]
    pub output_labels: PathBuf,
    #[config(default = "PathBuf::from(\"data/logs\")")]
    pub summaries_dir: PathBuf,
    #[config(default = "String::from(\"retrain\")")]
    pub experiment: String,
    #[config(default = "PathBuf::from(\"data/models/retrained\")")]
    pub model_dir: PathBuf,
    /// Defaults to a `checkpoints` directory next to `model_dir`.
    pub checkpoint_dir: Option<PathBuf>,
    /// Checkpoint to resume the weights from.
    pub resume: Option<PathBuf>,
    #[config(default = "OptimizerKind::Sgd")]
    pub optimizer: OptimizerKind,
    #[config(default = 0.01)]
    pub learning_rate: f64,
    #[config(default = "LrDecay::Constant")]
    pub lr_decay: LrDecay,
    #[config(default = 100)]
    pub train_batch_size: usize,
    #[config(default = 100)]
    pub validation_batch_size: usize,
    /// Images of the validation split used per epoch, all when unset.
    pub validation_limit: Option<usize>,
    /// Images of the test split used for the accuracy reports, all when unset.
    pub test_limit: Option<usize>,
    #[config(default = 10)]
    pub num_epochs: usize,
    /// Overrides `num_epochs` with `steps / steps_per_epoch`.
    pub training_steps: Option<usize>,
    /// Epochs without validation improvement before stopping, 0 disables it.
    pub early_stopping: Option<usize>,
    #[config(default = true)]
    pub augment: bool,
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = 4)]
    pub num_workers: usize,
}

impl TrainingConfig {
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.checkpoint_dir.clone().unwrap_or_else(|| {
            self.model_dir
                .parent()
                .unwrap_or(Path::new("."))
                .join("checkpoints")
        })
    }
}

/// Epoch count after taking `training_steps` into account.
pub(crate) fn derive_epochs(
    num_epochs: usize,
    training_steps: Option<usize>,
    train_images: usize,
    batch_size: usize,
) -> usize {
    match training_steps {
        Some(steps) => {
            let steps_per_epoch = (train_images / batch_size.max(1)).max(1);
            (steps / steps_per_epoch).max(1)
        }
        None => num_epochs,
    }
}

#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub run_dir: PathBuf,
    pub model_dir: PathBuf,
    pub epochs: usize,
    pub early_stopped: bool,
    pub best_val_accuracy: f32,
    pub initial_test: Evaluation,
    pub final_test: Evaluation,
}

pub fn train<B: AutodiffBackend>(
    config: &TrainingConfig,
    device: B::Device,
) -> Result<TrainingReport> {
    anyhow::ensure!(
        config.train_batch_size > 0 && config.validation_batch_size > 0,
        "batch sizes must be positive"
    );
    let started = Utc::now();

    info!("Checking the dataset in {}", config.image_dir.display());
    let layout = DatasetLayout::open(&config.image_dir)?;
    let classes = layout.classes();
    info!(
        "Saving {} class labels to {}",
        classes.len(),
        config.output_labels.display()
    );
    classes.save(&config.output_labels)?;

    let run = RunDir::create(&config.summaries_dir, &config.experiment, Local::now())?;
    config
        .save(run.config_path())
        .context("Failed to save training config")?;
    let mut events = run.event_writer()?;
    let checkpoint_dir = config.checkpoint_dir();
    std::fs::create_dir_all(&checkpoint_dir)
        .with_context(|| format!("Failed to create {}", checkpoint_dir.display()))?;

    B::seed(config.seed);

    info!("Setting up data loaders for train, val and test data");
    let size = config.model.image_size;
    let augmentation = match config.augment {
        true => Augmentation::default(),
        false => Augmentation::none(),
    };
    let train_set = ImageDataSet::split(&layout, Split::Train, size)
        .with_augmentation(augmentation, config.seed);
    let train_images = burn::data::dataset::Dataset::len(&train_set);
    let loader_train = DataLoaderBuilder::new(ImageBatcher::<B>::new(device.clone()))
        .batch_size(config.train_batch_size)
        .shuffle(config.seed)
        .num_workers(config.num_workers)
        .build(train_set);
    let loader_val = eval_loader::<B::InnerBackend>(
        subset(
            ImageDataSet::split(&layout, Split::Val, size),
            config.validation_limit,
            config.seed,
        ),
        config.validation_batch_size,
        config.num_workers,
        &device,
    );
    let loader_test = eval_loader::<B::InnerBackend>(
        subset(
            ImageDataSet::split(&layout, Split::Test, size),
            config.test_limit,
            config.seed,
        ),
        config.validation_batch_size,
        config.num_workers,
        &device,
    );

    let num_epochs = derive_epochs(
        config.num_epochs,
        config.training_steps,
        train_images,
        config.train_batch_size,
    );

    let model: ResNet<B> = match config.weights {
        Some(ref weights) => config.model.init_pretrained(weights, classes.len(), &device)?,
        None => {
            info!("Creating a randomly initialized model");
            config.model.init(classes.len(), &device)
        }
    };
    let model = match config.resume {
        Some(ref checkpoint) => resume(model, checkpoint, config.model.fully_trainable, &device)?,
        None => model,
    };
    info!(
        "Model has {} parameters, {} training images, {} epochs",
        model.num_params(),
        train_images,
        num_epochs
    );

    info!("Initial accuracy (before retraining):");
    let initial_test = evaluate(&model.valid(), &loader_test);
    report("test", &initial_test);
    events.write(&MetricEvent::new(0, Split::Test, initial_test.loss, initial_test.accuracy))?;

    let fit = Fit {
        config,
        num_epochs,
        loader_train,
        loader_val,
        checkpoint_dir,
        device: device.clone(),
    };
    let (model, outcome) = match config.optimizer {
        OptimizerKind::Sgd => {
            let optim = SgdConfig::new().init::<B, ResNet<B>>();
            fit.run(model, optim, &mut events)?
        }
        OptimizerKind::Adam => {
            let optim = AdamConfig::new().init::<B, ResNet<B>>();
            fit.run(model, optim, &mut events)?
        }
    };

    info!("Exporting the model to {}", config.model_dir.display());
    let exported = ExportedModel::save(&config.model_dir, model.valid(), &config.model, classes)?;

    info!("Final accuracy:");
    let final_model = exported.load::<B::InnerBackend>(&device)?;
    let final_test = evaluate(&final_model, &loader_test);
    report("test", &final_test);
    events.write(&MetricEvent::new(
        outcome.epochs,
        Split::Test,
        final_test.loss,
        final_test.accuracy,
    ))?;

    RunSummary {
        experiment: config.experiment.clone(),
        architecture: format!("resnet{}", config.model.architecture as usize),
        started,
        finished: Utc::now(),
        epochs: outcome.epochs,
        early_stopped: outcome.early_stopped,
        train_images,
        best_val_accuracy: outcome.best_val_accuracy,
        initial_test_accuracy: initial_test.accuracy,
        final_test_accuracy: final_test.accuracy,
        model_dir: config.model_dir.clone(),
    }
    .save(run.summary_path())?;

    Ok(TrainingReport {
        run_dir: run.path().to_path_buf(),
        model_dir: config.model_dir.clone(),
        epochs: outcome.epochs,
        early_stopped: outcome.early_stopped,
        best_val_accuracy: outcome.best_val_accuracy,
        initial_test,
        final_test,
    })
}

/// Loads checkpointed weights. Loading replaces every parameter, so the
/// backbone is frozen again unless it is meant to train.
fn resume<B: AutodiffBackend>(
    model: ResNet<B>,
    checkpoint: &Path,
    fully_trainable: bool,
    device: &B::Device,
) -> Result<ResNet<B>> {
    info!("Resuming weights from {}", checkpoint.display());
    let model = model
        .load_file(checkpoint, &CompactRecorder::new(), device)
        .with_context(|| format!("Failed to load checkpoint {}", checkpoint.display()))?;
    Ok(match fully_trainable {
        true => model,
        false => model.freeze_features(),
    })
}

fn report(name: &str, evaluation: &Evaluation) {
    info!(
        "{name} accuracy {:.1}% (N={}), loss {:.4}",
        evaluation.accuracy * 100.,
        evaluation.count,
        evaluation.loss
    );
}

struct Fit<'a, B: AutodiffBackend> {
    config: &'a TrainingConfig,
    num_epochs: usize,
    loader_train: Arc<dyn DataLoader<ImageBatch<B>>>,
    loader_val: Arc<dyn DataLoader<ImageBatch<B::InnerBackend>>>,
    checkpoint_dir: PathBuf,
    device: B::Device,
}

/// Best validation accuracy so far and the epochs since it last improved.
#[derive(Debug, Default)]
struct Plateau {
    best: Option<f32>,
    stale: usize,
}

impl Plateau {
    /// Returns whether `patience` epochs passed without improvement. A
    /// patience of 0 never stops.
    fn update(&mut self, accuracy: f32, patience: Option<usize>) -> bool {
        match self.best {
            Some(best) if accuracy <= best => self.stale += 1,
            _ => {
                self.best = Some(accuracy);
                self.stale = 0;
            }
        }
        patience.is_some_and(|p| p > 0 && self.stale >= p)
    }

    fn best(&self) -> f32 {
        self.best.unwrap_or(0.)
    }
}

struct Outcome {
    epochs: usize,
    early_stopped: bool,
    best_val_accuracy: f32,
}

impl<B: AutodiffBackend> Fit<'_, B> {
    fn run<O: Optimizer<ResNet<B>, B>>(
        &self,
        mut model: ResNet<B>,
        mut optim: O,
        events: &mut EventWriter,
    ) -> Result<(ResNet<B>, Outcome)> {
        let loss_fn = CrossEntropyLossConfig::new().init(&self.device);
        let mut plateau = Plateau::default();
        let mut epochs = 0;
        let mut early_stopped = false;

        for epoch in 1..=self.num_epochs {
            let lr = self
                .config
                .lr_decay
                .rate(self.config.learning_rate, epoch, self.num_epochs);
            let mut total_loss = 0.;
            let mut correct = 0;
            let mut count = 0;

            for (iteration, batch) in self.loader_train.iter().enumerate() {
                let n = batch.targets.dims()[0];
                let output = model.forward(batch.images);
                let loss = loss_fn.forward(output.clone(), batch.targets.clone());
                let loss_value = loss.clone().into_scalar().elem::<f32>();
                let hits = accuracy(output, batch.targets);

                let grads = GradientsParams::from_grads(loss.backward(), &model);
                model = optim.step(lr, model, grads);

                debug!(
                    "[Epoch {epoch} - Iteration {iteration}] loss {loss_value:.4}, accuracy {:.1}%",
                    hits as f32 / n as f32 * 100.
                );
                total_loss += loss_value * n as f32;
                correct += hits;
                count += n;
            }

            let train_loss = total_loss / count.max(1) as f32;
            let train_acc = correct as f32 / count.max(1) as f32;
            events.write(
                &MetricEvent::new(epoch, Split::Train, train_loss, train_acc).with_learning_rate(lr),
            )?;

            let val = evaluate(&model.valid(), &self.loader_val);
            events.write(&MetricEvent::new(epoch, Split::Val, val.loss, val.accuracy))?;
            info!(
                "Epoch {epoch}/{}: train loss {train_loss:.4}, accuracy {:.1}% | val loss {:.4}, accuracy {:.1}% | lr {lr:.2e}",
                self.num_epochs,
                train_acc * 100.,
                val.loss,
                val.accuracy * 100.
            );

            let checkpoint = self.checkpoint_dir.join(format!("epoch-{epoch}"));
            model
                .clone()
                .save_file(&checkpoint, &CompactRecorder::new())
                .with_context(|| format!("Failed to save checkpoint for epoch {epoch}"))?;
            epochs = epoch;

            if plateau.update(val.accuracy, self.config.early_stopping) {
                info!(
                    "Early stopping at epoch {epoch} (best val accuracy {:.1}%)",
                    plateau.best() * 100.
                );
                early_stopped = true;
                break;
            }
        }

        Ok((
            model,
            Outcome {
                epochs,
                early_stopped,
                best_val_accuracy: plateau.best(),
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epochs_follow_training_steps() {
        assert_eq!(derive_epochs(10, None, 2055, 100), 10);
        // 20 steps per epoch
        assert_eq!(derive_epochs(10, Some(200), 2055, 100), 10);
        assert_eq!(derive_epochs(10, Some(500), 2055, 100), 25);
        assert_eq!(derive_epochs(10, Some(5), 2055, 100), 1);
        // Fewer images than a batch still makes one step per epoch
        assert_eq!(derive_epochs(10, Some(3), 40, 100), 3);
    }

    #[test]
    fn linear_decay_ends_at_a_tenth() {
        let decay = LrDecay::Linear;
        assert_eq!(decay.rate(0.01, 1, 10), 0.01);
        assert!((decay.rate(0.01, 10, 10) - 0.001).abs() < 1e-12);
        assert!(decay.rate(0.01, 5, 10) < 0.01);
        assert_eq!(decay.rate(0.01, 1, 1), 0.01);
        assert_eq!(LrDecay::Constant.rate(0.01, 7, 10), 0.01);
    }

    #[test]
    fn plateau_stops_after_patience_runs_out() {
        let mut plateau = Plateau::default();
        assert!(!plateau.update(0.0, Some(2)));
        assert!(!plateau.update(0.5, Some(2)));
        assert!(!plateau.update(0.5, Some(2)));
        assert!(plateau.update(0.4, Some(2)));
        assert_eq!(plateau.best(), 0.5);

        let mut plateau = Plateau::default();
        assert!(!plateau.update(0.3, None));
        assert!(!plateau.update(0.2, None));
    }

    #[test]
    fn zero_patience_never_stops() {
        let mut plateau = Plateau::default();
        for _ in 0..5 {
            assert!(!plateau.update(0.1, Some(0)));
        }
        assert_eq!(plateau.stale, 4);
    }

    #[test]
    fn resume_restores_weights_and_refreezes_the_backbone() {
        use crate::ResNetType;
        use burn::{backend::NdArray, tensor::Distribution};

        type B = burn::backend::Autodiff<NdArray<f32>>;
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let checkpoint = dir.path().join("epoch-1");
        ResNet::<B>::new(ResNetType::Layer18, 3, &device)
            .save_file(&checkpoint, &CompactRecorder::new())
            .unwrap();
        let checkpoint = checkpoint.with_extension("mpk");
        let saved = ResNet::<NdArray<f32>>::new(ResNetType::Layer18, 3, &device)
            .load_file(&checkpoint, &CompactRecorder::new(), &device)
            .unwrap();

        let images = Tensor::<B, 4>::random([2, 3, 32, 32], Distribution::Default, &device);
        let fresh = ResNet::<B>::new(ResNetType::Layer18, 3, &device);
        let resumed = resume(fresh, &checkpoint, false, &device).unwrap();
        resumed
            .valid()
            .forward(images.clone().inner())
            .into_data()
            .assert_approx_eq(&saved.forward(images.clone().inner()).into_data(), 5);

        let loss = resumed.forward(images.clone()).sum();
        let grads = GradientsParams::from_grads(loss.backward(), &resumed);
        // head weight and bias only
        assert_eq!(grads.len(), 2);

        let fresh = ResNet::<B>::new(ResNetType::Layer18, 3, &device);
        let trainable = resume(fresh, &checkpoint, true, &device).unwrap();
        let loss = trainable.forward(images).sum();
        let grads = GradientsParams::from_grads(loss.backward(), &trainable);
        assert!(grads.len() > 2);
    }

    #[test]
    fn checkpoints_default_next_to_the_model() {
        let config = TrainingConfig::new(ModelConfig::new(crate::ResNetType::Layer18))
            .with_model_dir("out/models/retrained".into());
        assert_eq!(config.checkpoint_dir(), PathBuf::from("out/models/checkpoints"));
        let config = config.with_checkpoint_dir(Some("ckpt".into()));
        assert_eq!(config.checkpoint_dir(), PathBuf::from("ckpt"));
    }

    #[test]
    fn invalid_layout_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        crate::layout::tests::touch_tree(
            &dir.path().join("images"),
            &[(Split::Train, "a", 1), (Split::Val, "a", 1)],
        );
        let config = TrainingConfig::new(ModelConfig::new(crate::ResNetType::Layer18))
            .with_image_dir(dir.path().join("images"))
            .with_output_labels(dir.path().join("labels.json"))
            .with_summaries_dir(dir.path().join("logs"))
            .with_model_dir(dir.path().join("models/retrained"));
        type B = burn::backend::Autodiff<burn::backend::NdArray<f32>>;
        let err = train::<B>(&config, Default::default()).unwrap_err();
        assert!(err.downcast_ref::<crate::LayoutError>().is_some());
        assert!(!dir.path().join("labels.json").exists());
        assert!(!dir.path().join("logs").exists());
        assert!(!dir.path().join("models").exists());
    }
}
