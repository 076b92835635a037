use crate::layout::ClassMap;
use anyhow::{Context, Result};
use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    prelude::*,
    record::{CompactRecorder, FullPrecisionSettings, Recorder},
};
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};
use clap::builder::OsStr;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Number of classes of the ImageNet head shipped with the pretrained weights.
const IMAGENET_CLASSES: usize = 1000;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum ResNetType {
    #[default]
    Layer18 = 18,
    Layer34 = 34,
    Layer50 = 50,
    Layer101 = 101,
    Layer152 = 152,
}

impl ResNetType {
    fn blocks(self) -> [usize; 4] {
        match self {
            ResNetType::Layer18 => [2, 2, 2, 2],
            ResNetType::Layer34 | ResNetType::Layer50 => [3, 4, 6, 3],
            ResNetType::Layer101 => [3, 4, 23, 3],
            ResNetType::Layer152 => [3, 8, 36, 3],
        }
    }

    fn bottleneck(self) -> bool {
        matches!(
            self,
            ResNetType::Layer50 | ResNetType::Layer101 | ResNetType::Layer152
        )
    }

    fn expansion(self) -> usize {
        if self.bottleneck() {
            4
        } else {
            1
        }
    }

    /// Width of the pooled features fed to the head.
    pub fn num_features(self) -> usize {
        512 * self.expansion()
    }

    /// Torchvision ImageNet weights for this architecture.
    pub fn weights_url(self) -> &'static str {
        match self {
            ResNetType::Layer18 => "https://download.pytorch.org/models/resnet18-f37072fd.pth",
            ResNetType::Layer34 => "https://download.pytorch.org/models/resnet34-b627a593.pth",
            ResNetType::Layer50 => "https://download.pytorch.org/models/resnet50-0676ba61.pth",
            ResNetType::Layer101 => "https://download.pytorch.org/models/resnet101-63fe2227.pth",
            ResNetType::Layer152 => "https://download.pytorch.org/models/resnet152-394f9c45.pth",
        }
    }

    pub fn weights_file_name(self) -> String {
        format!("resnet{}.pth", self as usize)
    }
}

impl From<ResNetType> for OsStr {
    fn from(value: ResNetType) -> Self {
        format!("layer{:?}", value as usize).into()
    }
}

#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
}

impl<B: Backend> Downsample<B> {
    fn new(in_channels: usize, out_channels: usize, stride: usize, device: &B::Device) -> Self {
        Self {
            conv: Conv2dConfig::new([in_channels, out_channels], [1, 1])
                .with_stride([stride, stride])
                .with_bias(false)
                .init(device),
            bn: BatchNormConfig::new(out_channels).init(device),
        }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.bn.forward(self.conv.forward(input))
    }
}

/// A residual block. Basic blocks (ResNet-18/34) are two 3x3 convolutions;
/// bottleneck blocks (ResNet-50 and up) are 1x1, 3x3, 1x1 and carry `conv3`.
#[derive(Module, Debug)]
pub struct ResidualBlock<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
    conv3: Option<Conv2d<B>>,
    bn3: Option<BatchNorm<B, 2>>,
    relu: Relu,
    downsample: Option<Downsample<B>>,
}

fn conv(channels: [usize; 2], kernel: usize, stride: usize) -> Conv2dConfig {
    let padding = kernel / 2;
    Conv2dConfig::new(channels, [kernel, kernel])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(padding, padding))
        .with_bias(false)
}

impl<B: Backend> ResidualBlock<B> {
    fn basic(in_channels: usize, out_channels: usize, stride: usize, device: &B::Device) -> Self {
        Self {
            conv1: conv([in_channels, out_channels], 3, stride).init(device),
            bn1: BatchNormConfig::new(out_channels).init(device),
            conv2: conv([out_channels, out_channels], 3, 1).init(device),
            bn2: BatchNormConfig::new(out_channels).init(device),
            conv3: None,
            bn3: None,
            relu: Relu::new(),
            downsample: (stride != 1 || in_channels != out_channels)
                .then(|| Downsample::new(in_channels, out_channels, stride, device)),
        }
    }

    fn bottleneck(
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        device: &B::Device,
    ) -> Self {
        let width = out_channels / 4;
        Self {
            conv1: conv([in_channels, width], 1, 1).init(device),
            bn1: BatchNormConfig::new(width).init(device),
            conv2: conv([width, width], 3, stride).init(device),
            bn2: BatchNormConfig::new(width).init(device),
            conv3: Some(conv([width, out_channels], 1, 1).init(device)),
            bn3: Some(BatchNormConfig::new(out_channels).init(device)),
            relu: Relu::new(),
            downsample: (stride != 1 || in_channels != out_channels)
                .then(|| Downsample::new(in_channels, out_channels, stride, device)),
        }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match self.downsample {
            Some(ref downsample) => downsample.forward(input.clone()),
            None => input.clone(),
        };

        let x = self.relu.forward(self.bn1.forward(self.conv1.forward(input)));
        let x = self.bn2.forward(self.conv2.forward(x));
        let x = match (&self.conv3, &self.bn3) {
            (Some(conv3), Some(bn3)) => bn3.forward(conv3.forward(self.relu.forward(x))),
            _ => x,
        };

        self.relu.forward(x + identity)
    }
}

#[derive(Module, Debug)]
pub struct LayerBlock<B: Backend> {
    blocks: Vec<ResidualBlock<B>>,
}

impl<B: Backend> LayerBlock<B> {
    fn new(
        arch: ResNetType,
        num_blocks: usize,
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        device: &B::Device,
    ) -> Self {
        let blocks = (0..num_blocks)
            .map(|b| {
                let (in_channels, stride) = if b == 0 {
                    (in_channels, stride)
                } else {
                    (out_channels, 1)
                };
                if arch.bottleneck() {
                    ResidualBlock::bottleneck(in_channels, out_channels, stride, device)
                } else {
                    ResidualBlock::basic(in_channels, out_channels, stride, device)
                }
            })
            .collect();
        Self { blocks }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.blocks
            .iter()
            .fold(input, |x, block| block.forward(x))
    }
}

/// Field names follow torchvision so its checkpoints map onto this module.
#[derive(Module, Debug)]
pub struct ResNet<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    relu: Relu,
    maxpool: MaxPool2d,
    layer1: LayerBlock<B>,
    layer2: LayerBlock<B>,
    layer3: LayerBlock<B>,
    layer4: LayerBlock<B>,
    avgpool: AdaptiveAvgPool2d,
    fc: Linear<B>,
}

impl<B: Backend> ResNet<B> {
    pub fn new(arch: ResNetType, num_classes: usize, device: &B::Device) -> Self {
        let blocks = arch.blocks();
        let e = arch.expansion();
        Self {
            conv1: Conv2dConfig::new([3, 64], [7, 7])
                .with_stride([2, 2])
                .with_padding(PaddingConfig2d::Explicit(3, 3))
                .with_bias(false)
                .init(device),
            bn1: BatchNormConfig::new(64).init(device),
            relu: Relu::new(),
            maxpool: MaxPool2dConfig::new([3, 3])
                .with_strides([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(),
            layer1: LayerBlock::new(arch, blocks[0], 64, 64 * e, 1, device),
            layer2: LayerBlock::new(arch, blocks[1], 64 * e, 128 * e, 2, device),
            layer3: LayerBlock::new(arch, blocks[2], 128 * e, 256 * e, 2, device),
            layer4: LayerBlock::new(arch, blocks[3], 256 * e, 512 * e, 2, device),
            avgpool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc: LinearConfig::new(arch.num_features(), num_classes).init(device),
        }
    }

    /// # Shapes
    ///   - Images [batch_size, 3, height, width]
    ///   - Output [batch_size, num_features]
    pub fn features(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.conv1.forward(images);
        let x = self.relu.forward(self.bn1.forward(x));
        let x = self.maxpool.forward(x);

        let x = self.layer1.forward(x);
        let x = self.layer2.forward(x);
        let x = self.layer3.forward(x);
        let x = self.layer4.forward(x);

        self.avgpool.forward(x).flatten(1, 3)
    }

    /// # Shapes
    ///   - Images [batch_size, 3, height, width]
    ///   - Output [batch_size, num_classes] (logits)
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.fc.forward(self.features(images))
    }

    pub fn num_classes(&self) -> usize {
        self.fc.weight.dims()[1]
    }

    /// Replaces the classification head with a freshly initialized one.
    pub fn with_classes(mut self, num_classes: usize, device: &B::Device) -> Self {
        let [num_features, _] = self.fc.weight.dims();
        self.fc = LinearConfig::new(num_features, num_classes).init(device);
        self
    }

    /// Stops gradients for every parameter but the head's.
    pub fn freeze_features(mut self) -> Self {
        let fc = self.fc.clone();
        self = self.no_grad();
        self.fc = fc;
        self
    }
}

/// Torchvision key patterns and their names in [`ResNet`]. Block indices move
/// under `blocks`, and the `downsample` sequential gets named fields.
const TORCHVISION_REMAPS: [(&str, &str); 3] = [
    (
        r"^(layer[1-4])\.([0-9]+)\.downsample\.0\.(.+)$",
        "$1.blocks.$2.downsample.conv.$3",
    ),
    (
        r"^(layer[1-4])\.([0-9]+)\.downsample\.1\.(.+)$",
        "$1.blocks.$2.downsample.bn.$3",
    ),
    (
        r"^(layer[1-4])\.([0-9]+)\.((conv|bn)[1-3])\.(.+)$",
        "$1.blocks.$2.$3.$5",
    ),
];

/// Loads a torchvision ResNet checkpoint (`*.pth`).
pub(crate) fn load_torchvision<B: Backend>(
    arch: ResNetType,
    weights: &Path,
    device: &B::Device,
) -> Result<ResNet<B>> {
    anyhow::ensure!(
        weights.is_file(),
        "Missing weights file {}. Expected pretrained torchvision ResNet-{} weights, run `retrain setup` first.",
        weights.display(),
        arch as usize
    );
    let load_args = TORCHVISION_REMAPS
        .iter()
        .fold(LoadArgs::new(weights.to_path_buf()), |args, (pattern, replacement)| {
            args.with_key_remap(pattern, replacement)
        });
    let record: ResNetRecord<B> = PyTorchFileRecorder::<FullPrecisionSettings>::default()
        .load(load_args, device)
        .with_context(|| format!("Failed to map {} onto ResNet-{}", weights.display(), arch as usize))?;
    Ok(ResNet::new(arch, IMAGENET_CLASSES, device).load_record(record))
}

#[derive(Config, Debug)]
pub struct ModelConfig {
    pub architecture: ResNetType,
    #[config(default = 224)]
    pub image_size: usize,
    /// Train the pretrained feature extractor too, not only the new head.
    #[config(default = false)]
    pub fully_trainable: bool,
}

impl ModelConfig {
    pub fn init<B: Backend>(&self, num_classes: usize, device: &B::Device) -> ResNet<B> {
        ResNet::new(self.architecture, num_classes, device)
    }

    /// Pretrained feature extractor plus a new `num_classes`-way head.
    pub fn init_pretrained<B: Backend>(
        &self,
        weights: &Path,
        num_classes: usize,
        device: &B::Device,
    ) -> Result<ResNet<B>> {
        info!(
            "Creating a ResNet-{} model with ImageNet weights from {}",
            self.architecture as usize,
            weights.display()
        );
        let model = load_torchvision(self.architecture, weights, device)?;
        let model = if self.fully_trainable {
            model
        } else {
            model.freeze_features()
        };
        info!("Adding a {num_classes} label classifier");
        Ok(model.with_classes(num_classes, device))
    }
}

/// A trained model as exported to a directory: weights, model config and
/// label file side by side.
#[derive(Debug, Clone)]
pub struct ExportedModel {
    pub dir: PathBuf,
    pub config: ModelConfig,
    pub classes: ClassMap,
}

impl ExportedModel {
    const WEIGHTS: &'static str = "model";
    const CONFIG: &'static str = "model_config.json";
    const LABELS: &'static str = "labels.json";

    pub fn save<B: Backend>(
        dir: impl AsRef<Path>,
        model: ResNet<B>,
        config: &ModelConfig,
        classes: &ClassMap,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        model
            .save_file(dir.join(Self::WEIGHTS), &CompactRecorder::new())
            .context("Failed to save the trained model")?;
        config
            .save(dir.join(Self::CONFIG))
            .context("Failed to save the model config")?;
        classes.save(dir.join(Self::LABELS))?;
        Ok(Self {
            dir,
            config: config.clone(),
            classes: classes.clone(),
        })
    }

    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let config = ModelConfig::load(dir.join(Self::CONFIG))
            .with_context(|| format!("{} holds no model config", dir.display()))?;
        let classes = ClassMap::load(dir.join(Self::LABELS))?;
        Ok(Self {
            dir,
            config,
            classes,
        })
    }

    pub fn load<B: Backend>(&self, device: &B::Device) -> Result<ResNet<B>> {
        self.config
            .init::<B>(self.classes.len(), device)
            .load_file(self.dir.join(Self::WEIGHTS), &CompactRecorder::new(), device)
            .with_context(|| format!("Failed to load the model in {}", self.dir.display()))
    }
}
