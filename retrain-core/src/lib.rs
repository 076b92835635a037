#[cfg(any(feature = "ndarray", feature = "tch", feature = "candle"))]
mod cli;
mod dashboard;
mod data;
mod evaluate;
mod layout;
mod logging;
mod model;
mod predict;
mod runs;
mod setup;
mod train;

#[cfg(any(feature = "ndarray", feature = "tch", feature = "candle"))]
pub use cli::run;
pub use dashboard::{render_table, Dashboard};
pub use data::{Augmentation, ImageBatch, ImageBatcher, ImageData, ImageDataSet};
pub use evaluate::{evaluate, evaluate_exported, Evaluation};
pub use layout::{ClassMap, DatasetLayout, LayoutError, Split};
pub use logging::init_logging;
pub use model::{ExportedModel, ModelConfig, ResNet, ResNetType};
pub use predict::{predict, Output, PredictConfig, Prediction};
pub use runs::{discover, EventWriter, Metric, MetricEvent, Run, RunDir, RunSummary};
pub use setup::{divide, extract, fetch, find_class_root, Method, Ratio, Setup, SetupConfig};
pub use train::{train, LrDecay, OptimizerKind, TrainingConfig, TrainingReport};
