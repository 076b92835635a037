use crate::layout::Split;
use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::{
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

const EVENTS: &str = "events.jsonl";
const SUMMARY: &str = "run.json";
const CONFIG: &str = "training_config.json";

/// The log directory of one training run:
/// `<root>/<experiment>/<YYYYmmdd-HHMMSS>[-<n>]`.
#[derive(Debug, Clone)]
pub struct RunDir {
    path: PathBuf,
}

impl RunDir {
    /// Claims a fresh directory. When the timestamped path is taken a numeric
    /// suffix is appended, so two runs never share a directory.
    pub fn create(root: &Path, experiment: &str, timestamp: DateTime<Local>) -> Result<Self> {
        let parent = root.join(experiment);
        std::fs::create_dir_all(&parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
        let stamp = timestamp.format("%Y%m%d-%H%M%S").to_string();
        for n in 0.. {
            let path = match n {
                0 => parent.join(&stamp),
                n => parent.join(format!("{stamp}-{n}")),
            };
            match std::fs::create_dir(&path) {
                Ok(()) => {
                    debug!("Logging run to {}", path.display());
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to create {}", path.display()))
                }
            }
        }
        unreachable!()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config_path(&self) -> PathBuf {
        self.path.join(CONFIG)
    }

    pub fn summary_path(&self) -> PathBuf {
        self.path.join(SUMMARY)
    }

    pub fn event_writer(&self) -> Result<EventWriter> {
        EventWriter::open(self.path.join(EVENTS))
    }
}

/// One logged measurement. Test events carry the accuracy before retraining
/// (epoch 0) and after it (last epoch).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricEvent {
    pub epoch: usize,
    pub split: Split,
    pub loss: f32,
    pub accuracy: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learning_rate: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl MetricEvent {
    pub fn new(epoch: usize, split: Split, loss: f32, accuracy: f32) -> Self {
        Self {
            epoch,
            split,
            loss,
            accuracy,
            learning_rate: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_learning_rate(mut self, lr: f64) -> Self {
        self.learning_rate = Some(lr);
        self
    }
}

/// Appends events as JSON lines, flushing after each one so a crashed run
/// keeps its history.
pub struct EventWriter {
    writer: BufWriter<File>,
}

impl EventWriter {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    pub fn write(&mut self, event: &MetricEvent) -> Result<()> {
        serde_json::to_writer(&mut self.writer, event)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// `run.json`, written once training finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub experiment: String,
    pub architecture: String,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub epochs: usize,
    pub early_stopped: bool,
    pub train_images: usize,
    pub best_val_accuracy: f32,
    pub initial_test_accuracy: f32,
    pub final_test_accuracy: f32,
    pub model_dir: PathBuf,
}

impl RunSummary {
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file =
            File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        serde_json::from_reader(file).with_context(|| format!("{} is malformed", path.display()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Loss,
    Accuracy,
}

impl Metric {
    pub fn name(self) -> &'static str {
        match self {
            Metric::Loss => "loss",
            Metric::Accuracy => "accuracy",
        }
    }

    fn of(self, event: &MetricEvent) -> f64 {
        match self {
            Metric::Loss => event.loss as f64,
            Metric::Accuracy => event.accuracy as f64,
        }
    }
}

/// A logged run as read back from disk.
#[derive(Debug, Clone)]
pub struct Run {
    /// Path relative to the log directory, e.g. `retrain/20240101-120000`.
    pub name: String,
    pub path: PathBuf,
    pub events: Vec<MetricEvent>,
    pub summary: Option<RunSummary>,
}

impl Run {
    pub fn open(log_dir: &Path, path: &Path) -> Result<Self> {
        let events_path = path.join(EVENTS);
        let file = File::open(&events_path)
            .with_context(|| format!("Failed to open {}", events_path.display()))?;
        let mut events = vec![];
        for (i, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(event) => events.push(event),
                Err(e) => warn!("Skipping line {} of {}: {e}", i + 1, events_path.display()),
            }
        }
        let summary_path = path.join(SUMMARY);
        let summary = match summary_path.exists() {
            true => Some(RunSummary::load(summary_path)?),
            false => None,
        };
        let name = path
            .strip_prefix(log_dir)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned();
        Ok(Self {
            name,
            path: path.to_path_buf(),
            events,
            summary,
        })
    }

    /// `(epoch, value)` points of one split, in epoch order.
    pub fn series(&self, split: Split, metric: Metric) -> Vec<(f64, f64)> {
        let mut points = self
            .events
            .iter()
            .filter(|e| e.split == split)
            .map(|e| (e.epoch as f64, metric.of(e)))
            .collect::<Vec<_>>();
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        points
    }

    pub fn epochs(&self) -> usize {
        self.events
            .iter()
            .filter(|e| e.split == Split::Train)
            .map(|e| e.epoch)
            .max()
            .unwrap_or(0)
    }

    pub fn best(&self, split: Split, metric: Metric) -> Option<f64> {
        let values = self.series(split, metric).into_iter().map(|(_, v)| v);
        match metric {
            Metric::Loss => values.reduce(f64::min),
            Metric::Accuracy => values.reduce(f64::max),
        }
    }

    pub fn last(&self, split: Split, metric: Metric) -> Option<f64> {
        self.series(split, metric).last().map(|(_, v)| *v)
    }

    pub fn first(&self, split: Split, metric: Metric) -> Option<f64> {
        self.series(split, metric).first().map(|(_, v)| *v)
    }
}

/// Every run below `log_dir`, sorted by path. A run is any directory
/// holding an `events.jsonl`.
pub fn discover(log_dir: impl AsRef<Path>) -> Result<Vec<Run>> {
    let log_dir = log_dir.as_ref();
    anyhow::ensure!(
        log_dir.is_dir(),
        "log directory {} does not exist",
        log_dir.display()
    );
    let mut dirs = walkdir::WalkDir::new(log_dir)
        .into_iter()
        .filter_map(|res| res.ok())
        .filter(|e| e.file_type().is_file() && e.file_name() == EVENTS)
        .filter_map(|e| e.path().parent().map(Path::to_path_buf))
        .collect::<Vec<_>>();
    dirs.sort();
    dirs.iter().map(|dir| Run::open(log_dir, dir)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn stamp() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap()
    }

    #[test]
    fn run_dirs_never_collide() {
        let root = tempfile::tempdir().unwrap();
        let a = RunDir::create(root.path(), "retrain", stamp()).unwrap();
        let b = RunDir::create(root.path(), "retrain", stamp()).unwrap();
        let c = RunDir::create(root.path(), "retrain", stamp()).unwrap();
        assert!(a.path().ends_with("retrain/20240301-123005"));
        assert!(b.path().ends_with("retrain/20240301-123005-1"));
        assert!(c.path().ends_with("retrain/20240301-123005-2"));
    }

    #[test]
    fn events_are_discovered_in_order() {
        let root = tempfile::tempdir().unwrap();
        let second = RunDir::create(root.path(), "b", stamp()).unwrap();
        let first = RunDir::create(root.path(), "a", stamp()).unwrap();

        let mut writer = first.event_writer().unwrap();
        writer.write(&MetricEvent::new(0, Split::Test, 2.0, 0.2)).unwrap();
        for epoch in 1..=3 {
            writer
                .write(
                    &MetricEvent::new(epoch, Split::Train, 1.0 / epoch as f32, 0.5)
                        .with_learning_rate(0.01),
                )
                .unwrap();
            writer
                .write(&MetricEvent::new(epoch, Split::Val, 1.0, 0.3 + epoch as f32 / 10.))
                .unwrap();
        }
        drop(writer);
        second
            .event_writer()
            .unwrap()
            .write(&MetricEvent::new(1, Split::Train, 0.7, 0.6))
            .unwrap();
        std::fs::create_dir_all(root.path().join("not-a-run")).unwrap();

        let runs = discover(root.path()).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].name, "a/20240301-123005");
        let run = &runs[0];
        assert_eq!(run.epochs(), 3);
        assert_eq!(run.series(Split::Train, Metric::Loss).len(), 3);
        assert_eq!(run.first(Split::Test, Metric::Accuracy), Some(0.2f32 as f64));
        let best = run.best(Split::Val, Metric::Accuracy).unwrap();
        assert!((best - 0.6).abs() < 1e-6);
        assert!(run.summary.is_none());
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let root = tempfile::tempdir().unwrap();
        let dir = RunDir::create(root.path(), "x", stamp()).unwrap();
        dir.event_writer()
            .unwrap()
            .write(&MetricEvent::new(1, Split::Train, 0.5, 0.5))
            .unwrap();
        let mut raw = OpenOptions::new()
            .append(true)
            .open(dir.path().join(EVENTS))
            .unwrap();
        writeln!(raw, "{{not json").unwrap();
        let runs = discover(root.path()).unwrap();
        assert_eq!(runs[0].events.len(), 1);
    }

    #[test]
    fn summary_round_trip() {
        let root = tempfile::tempdir().unwrap();
        let dir = RunDir::create(root.path(), "x", stamp()).unwrap();
        dir.event_writer().unwrap();
        let summary = RunSummary {
            experiment: "x".into(),
            architecture: "resnet18".into(),
            started: Utc::now(),
            finished: Utc::now(),
            epochs: 2,
            early_stopped: false,
            train_images: 10,
            best_val_accuracy: 0.5,
            initial_test_accuracy: 0.25,
            final_test_accuracy: 0.75,
            model_dir: "models/retrained".into(),
        };
        summary.save(dir.summary_path()).unwrap();
        let runs = discover(root.path()).unwrap();
        assert_eq!(runs[0].summary.as_ref(), Some(&summary));
    }

    #[test]
    fn missing_log_dir_is_an_error() {
        assert!(discover("/nonexistent/logs").is_err());
    }
}
