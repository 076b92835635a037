use crate::{
    discover, evaluate_exported, init_logging, predict, render_table, train, Dashboard, LrDecay,
    Method, ModelConfig, OptimizerKind, Output, PredictConfig, Ratio, ResNetType, Setup,
    SetupConfig, Split, TrainingConfig,
};
use anyhow::Result;
use burn::{backend::Autodiff, prelude::Backend};
use clap::{ArgAction, CommandFactory as _, Parser, Subcommand};
use clap_complete::{generate, Shell};
use std::{io::IsTerminal, path::PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// More logging, repeat for more
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    /// Less logging, repeat for less
    #[arg(short, long, global = true, action = ArgAction::Count)]
    quiet: u8,
    /// Root of the workshop data tree
    #[arg(long, global = true, env = "RETRAIN_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,
    #[clap(subcommand)]
    subcmd: SubCmd,
}

#[derive(Debug, Subcommand)]
enum SubCmd {
    /// Fetch the pretrained weights and the dataset, and split the dataset.
    Setup {
        /// Architecture whose ImageNet weights are fetched
        #[arg(short, long, default_value = ResNetType::default())]
        model: ResNetType,
        /// Weights URL or path, instead of the torchvision weights of the model
        #[arg(long)]
        weights_url: Option<String>,
        /// Dataset archive URL or path (.tar.gz, .tgz or .tar)
        #[arg(long, default_value = crate::setup::DATASET_URL)]
        dataset_url: String,
        /// Relative sizes of the train, val and test splits
        #[arg(short, long, default_value = "8:1:1")]
        ratio: Ratio,
        /// How images are placed into the split tree
        #[arg(long, value_enum, default_value_t = Method::default())]
        method: Method,
        /// Random seed of the split
        #[arg(short, long, default_value = "42")]
        seed: u64,
        /// Do not fetch the pretrained weights
        #[arg(long)]
        skip_weights: bool,
        /// Redo every stage even if its output exists
        #[arg(short, long)]
        force: bool,
    },
    /// Retrain a pretrained ResNet on the images of the data tree.
    Train {
        /// Dataset tree with train, val and test splits [default: <data-dir>/images]
        #[arg(short, long)]
        image_dir: Option<PathBuf>,
        /// Where to save the label file [default: <data-dir>/output_labels.json]
        #[arg(long)]
        output_labels: Option<PathBuf>,
        /// Where to save the run logs [default: <data-dir>/logs]
        #[arg(long)]
        summaries_dir: Option<PathBuf>,
        /// Name grouping the run logs
        #[arg(long, default_value = "retrain")]
        experiment: String,
        /// Where to export the trained model [default: <data-dir>/models/retrained]
        #[arg(long)]
        model_dir: Option<PathBuf>,
        /// Where to save epoch checkpoints [default: next to the model dir]
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,
        /// Model type
        #[arg(short, long, default_value = ResNetType::default())]
        model: ResNetType,
        /// Pretrained weights [default: <data-dir>/models/resnet<N>.pth]
        #[arg(long, conflicts_with = "no_pretrained")]
        weights: Option<PathBuf>,
        /// Start from random weights
        #[arg(long)]
        no_pretrained: bool,
        #[arg(long, value_enum, default_value_t = OptimizerKind::default())]
        optimizer: OptimizerKind,
        #[arg(short, long, default_value = "0.01")]
        learning_rate: f64,
        /// Learning rate schedule
        #[arg(long, value_enum, default_value_t = LrDecay::default())]
        lr_decay: LrDecay,
        #[arg(short = 'b', long, default_value = "100")]
        train_batch_size: usize,
        #[arg(long, default_value = "100")]
        validation_batch_size: usize,
        /// Validation images used per epoch, -1 for the whole split
        #[arg(long, default_value = "-1", allow_negative_numbers = true)]
        validation_limit: i64,
        /// Test images used for the accuracy reports, -1 for the whole split
        #[arg(long, default_value = "-1", allow_negative_numbers = true)]
        test_limit: i64,
        #[arg(short, long, default_value = "10")]
        epochs: usize,
        /// Number of training steps, overrides the epochs
        #[arg(long)]
        training_steps: Option<usize>,
        /// Side of the square network input
        #[arg(long, default_value = "224", value_parser = image_size)]
        image_size: usize,
        /// Train the feature extractor as well as the new head
        #[arg(long)]
        fully_trainable: bool,
        /// Disable the random flips, shifts, shears and zooms of training images
        #[arg(long)]
        no_augmentation: bool,
        /// Epochs without validation improvement before stopping, 0 disables it
        #[arg(long)]
        early_stopping: Option<usize>,
        /// Resume the weights from a checkpoint
        #[arg(long)]
        resume: Option<PathBuf>,
        #[arg(short, long, default_value = "42")]
        seed: u64,
        /// Number of workers for data loading
        #[arg(short = 'w', long, default_value = "4")]
        num_workers: usize,
    },
    /// Measure the accuracy of an exported model on one split.
    Evaluate {
        /// Exported model [default: <data-dir>/models/retrained]
        #[arg(long)]
        model_dir: Option<PathBuf>,
        /// Dataset tree [default: <data-dir>/images]
        #[arg(short, long)]
        image_dir: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = Split::Test)]
        split: Split,
        #[arg(short = 'b', long, default_value = "100")]
        batch_size: usize,
        /// Images used, -1 for the whole split
        #[arg(long, default_value = "-1", allow_negative_numbers = true)]
        limit: i64,
    },
    /// Classify images with an exported model.
    Predict {
        /// Exported model [default: <data-dir>/models/retrained]
        #[arg(long)]
        model_dir: Option<PathBuf>,
        /// Method to output the predictions
        #[arg(short, long, value_enum, default_value_t = Output::Tty)]
        output: Output,
        /// Number of labels shown per image
        #[arg(short = 'k', long, default_value = "3")]
        top_k: usize,
        #[arg(short = 'b', long, default_value = "32")]
        batch_size: usize,
        /// Number of workers for data loading
        #[arg(short = 'w', long, default_value = "1")]
        num_workers: usize,
        /// An image or a directory of images
        input: PathBuf,
    },
    /// Compare the metrics of logged training runs.
    Dashboard {
        /// Directory searched for runs [default: <data-dir>/logs]
        #[arg(long)]
        log_dir: Option<PathBuf>,
        /// Print a table instead of the interactive charts
        #[arg(long)]
        plain: bool,
    },
    /// generate auto completion script
    GenCompletion {
        /// shell name
        shell: Shell,
    },
}

fn image_size(s: &str) -> Result<usize, String> {
    match s.parse::<usize>() {
        Ok(size @ (224 | 160 | 128)) => Ok(size),
        _ => Err("expected one of 224, 160 or 128".to_string()),
    }
}

/// `-1` (any negative value) means no limit.
fn limit(value: i64) -> Option<usize> {
    usize::try_from(value).ok()
}

#[cfg(feature = "tch")]
type MyBackend = burn::backend::LibTorch<f32, i64>;
#[cfg(all(feature = "candle", not(feature = "tch")))]
type MyBackend = burn::backend::Candle<f32, i64>;
#[cfg(all(feature = "ndarray", not(any(feature = "tch", feature = "candle"))))]
type MyBackend = burn::backend::NdArray<f32, i64>;

type MyAutodiffBackend = Autodiff<MyBackend>;

fn device() -> <MyBackend as Backend>::Device {
    #[cfg(all(feature = "tch", target_os = "macos"))]
    let device = burn::backend::libtorch::LibTorchDevice::Mps;
    #[cfg(all(feature = "tch", not(target_os = "macos")))]
    let device = burn::backend::libtorch::LibTorchDevice::Cuda(0);

    #[cfg(all(feature = "candle", not(feature = "tch"), target_os = "macos"))]
    let device = burn::backend::candle::CandleDevice::metal(0);
    #[cfg(all(feature = "candle", not(feature = "tch"), not(target_os = "macos")))]
    let device = burn::backend::candle::CandleDevice::cuda(0);

    #[cfg(all(feature = "ndarray", not(any(feature = "tch", feature = "candle"))))]
    let device = burn::backend::ndarray::NdArrayDevice::Cpu;

    device
}

pub fn run() -> Result<()> {
    let args = Cli::parse();
    init_logging(args.verbose as i8 - args.quiet as i8)?;
    let data_dir = args.data_dir;
    match args.subcmd {
        SubCmd::Setup {
            model,
            weights_url,
            dataset_url,
            ratio,
            method,
            seed,
            skip_weights,
            force,
        } => Setup::new(
            SetupConfig::new()
                .with_data_dir(data_dir)
                .with_architecture(model)
                .with_weights_url(weights_url)
                .with_dataset_url(dataset_url)
                .with_ratio(ratio)
                .with_method(method)
                .with_seed(seed)
                .with_skip_weights(skip_weights)
                .with_force(force),
        )
        .run(),
        SubCmd::Train {
            image_dir,
            output_labels,
            summaries_dir,
            experiment,
            model_dir,
            checkpoint_dir,
            model,
            weights,
            no_pretrained,
            optimizer,
            learning_rate,
            lr_decay,
            train_batch_size,
            validation_batch_size,
            validation_limit,
            test_limit,
            epochs,
            training_steps,
            image_size,
            fully_trainable,
            no_augmentation,
            early_stopping,
            resume,
            seed,
            num_workers,
        } => {
            let weights = match no_pretrained {
                true => None,
                false => Some(weights.unwrap_or_else(|| {
                    data_dir.join("models").join(model.weights_file_name())
                })),
            };
            let config = TrainingConfig::new(
                ModelConfig::new(model)
                    .with_image_size(image_size)
                    .with_fully_trainable(fully_trainable),
            )
            .with_image_dir(image_dir.unwrap_or_else(|| data_dir.join("images")))
            .with_weights(weights)
            .with_output_labels(
                output_labels.unwrap_or_else(|| data_dir.join("output_labels.json")),
            )
            .with_summaries_dir(summaries_dir.unwrap_or_else(|| data_dir.join("logs")))
            .with_experiment(experiment)
            .with_model_dir(model_dir.unwrap_or_else(|| data_dir.join("models/retrained")))
            .with_checkpoint_dir(checkpoint_dir)
            .with_resume(resume)
            .with_optimizer(optimizer)
            .with_learning_rate(learning_rate)
            .with_lr_decay(lr_decay)
            .with_train_batch_size(train_batch_size)
            .with_validation_batch_size(validation_batch_size)
            .with_validation_limit(limit(validation_limit))
            .with_test_limit(limit(test_limit))
            .with_num_epochs(epochs)
            .with_training_steps(training_steps)
            .with_early_stopping(early_stopping)
            .with_augment(!no_augmentation)
            .with_seed(seed)
            .with_num_workers(num_workers);
            let report = train::<MyAutodiffBackend>(&config, device())?;
            info!("Run logged to {}", report.run_dir.display());
            println!(
                "Test accuracy: {:.1}% before retraining, {:.1}% after {} epochs",
                report.initial_test.accuracy * 100.,
                report.final_test.accuracy * 100.,
                report.epochs
            );
            Ok(())
        }
        SubCmd::Evaluate {
            model_dir,
            image_dir,
            split,
            batch_size,
            limit: n,
        } => {
            let model_dir = model_dir.unwrap_or_else(|| data_dir.join("models/retrained"));
            let split_dir = image_dir
                .unwrap_or_else(|| data_dir.join("images"))
                .join(split.dir_name());
            let evaluation = evaluate_exported::<MyBackend>(
                &model_dir,
                &split_dir,
                batch_size,
                limit(n),
                &device(),
            )?;
            println!(
                "{split} accuracy: {:.1}% (N={}), loss {:.4}",
                evaluation.accuracy * 100.,
                evaluation.count,
                evaluation.loss
            );
            Ok(())
        }
        SubCmd::Predict {
            model_dir,
            output,
            top_k,
            batch_size,
            num_workers,
            input,
        } => {
            let config = PredictConfig::new(
                model_dir.unwrap_or_else(|| data_dir.join("models/retrained")),
                input,
            )
            .with_output(output)
            .with_top_k(top_k)
            .with_batch_size(batch_size)
            .with_num_workers(num_workers);
            predict::<MyBackend>(&config, &device(), &mut std::io::stdout().lock())?;
            Ok(())
        }
        SubCmd::Dashboard { log_dir, plain } => {
            let runs = discover(log_dir.unwrap_or_else(|| data_dir.join("logs")))?;
            if plain || runs.is_empty() || !std::io::stdout().is_terminal() {
                render_table(&runs, &mut std::io::stdout().lock())
            } else {
                Dashboard::new(runs).run()
            }
        }
        SubCmd::GenCompletion { shell } => {
            generate(shell, &mut Cli::command(), "retrain", &mut std::io::stdout());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn train_flags_parse() {
        let cli = Cli::try_parse_from([
            "retrain",
            "-v",
            "train",
            "--model",
            "layer50",
            "--validation-limit",
            "-1",
            "--test-limit",
            "20",
            "--image-size",
            "160",
            "--no-pretrained",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 1);
        match cli.subcmd {
            SubCmd::Train {
                model,
                validation_limit,
                test_limit,
                image_size,
                no_pretrained,
                ..
            } => {
                assert_eq!(model, ResNetType::Layer50);
                assert_eq!(limit(validation_limit), None);
                assert_eq!(limit(test_limit), Some(20));
                assert_eq!(image_size, 160);
                assert!(no_pretrained);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unsupported_image_size_is_rejected() {
        assert!(Cli::try_parse_from(["retrain", "train", "--image-size", "100"]).is_err());
    }
}
