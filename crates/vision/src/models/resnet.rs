//! Residual networks (resnet18/34/50).

use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{
    AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig,
};
use burn::nn::{BatchNorm, BatchNormConfig, PaddingConfig2d, Relu};
use burn::prelude::*;

/// 1x1 projection on the skip path when shape changes.
#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
}

impl<B: Backend> Downsample<B> {
    fn new(device: &B::Device, in_channels: usize, out_channels: usize, stride: usize) -> Self {
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

/// A residual block.
///
/// With `conv3` absent this is the two-conv basic block (resnet18/34);
/// with it present, the 1x1 / 3x3 / 1x1 bottleneck (resnet50).
#[derive(Module, Debug)]
pub struct ResidualBlock<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
    conv3: Option<Conv2d<B>>,
    bn3: Option<BatchNorm<B, 2>>,
    downsample: Option<Downsample<B>>,
    relu: Relu,
}

impl<B: Backend> ResidualBlock<B> {
    fn basic(device: &B::Device, in_channels: usize, out_channels: usize, stride: usize) -> Self {
        let downsample = (stride != 1 || in_channels != out_channels)
            .then(|| Downsample::new(device, in_channels, out_channels, stride));

        Self {
            conv1: Conv2dConfig::new([in_channels, out_channels], [3, 3])
                .with_stride([stride, stride])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(false)
                .init(device),
            bn1: BatchNormConfig::new(out_channels).init(device),
            conv2: Conv2dConfig::new([out_channels, out_channels], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(false)
                .init(device),
            bn2: BatchNormConfig::new(out_channels).init(device),
            conv3: None,
            bn3: None,
            downsample,
            relu: Relu::new(),
        }
    }

    fn bottleneck(
        device: &B::Device,
        in_channels: usize,
        mid_channels: usize,
        out_channels: usize,
        stride: usize,
    ) -> Self {
        let downsample = (stride != 1 || in_channels != out_channels)
            .then(|| Downsample::new(device, in_channels, out_channels, stride));

        Self {
            conv1: Conv2dConfig::new([in_channels, mid_channels], [1, 1])
                .with_bias(false)
                .init(device),
            bn1: BatchNormConfig::new(mid_channels).init(device),
            conv2: Conv2dConfig::new([mid_channels, mid_channels], [3, 3])
                .with_stride([stride, stride])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(false)
                .init(device),
            bn2: BatchNormConfig::new(mid_channels).init(device),
            conv3: Some(
                Conv2dConfig::new([mid_channels, out_channels], [1, 1])
                    .with_bias(false)
                    .init(device),
            ),
            bn3: Some(BatchNormConfig::new(out_channels).init(device)),
            downsample,
            relu: Relu::new(),
        }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let skip = match &self.downsample {
            Some(downsample) => downsample.forward(input.clone()),
            None => input.clone(),
        };

        let mut out = self.relu.forward(self.bn1.forward(self.conv1.forward(input)));
        out = self.bn2.forward(self.conv2.forward(out));

        if let (Some(conv3), Some(bn3)) = (&self.conv3, &self.bn3) {
            out = bn3.forward(conv3.forward(self.relu.forward(out)));
        }

        self.relu.forward(out + skip)
    }
}

/// ResNet feature extractor: stem, four stages, global average pool.
#[derive(Module, Debug)]
pub struct ResNet<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    relu: Relu,
    maxpool: MaxPool2d,
    blocks: Vec<ResidualBlock<B>>,
    pool: AdaptiveAvgPool2d,
    out_features: usize,
}

impl<B: Backend> ResNet<B> {
    fn new(device: &B::Device, blocks: Vec<ResidualBlock<B>>, out_features: usize) -> Self {
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
            blocks,
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            out_features,
        }
    }

    /// resnet18: basic blocks `[2, 2, 2, 2]`.
    pub fn resnet18(device: &B::Device) -> Self {
        Self::new(device, basic_stages(device, &[2, 2, 2, 2]), 512)
    }

    /// resnet34: basic blocks `[3, 4, 6, 3]`.
    pub fn resnet34(device: &B::Device) -> Self {
        Self::new(device, basic_stages(device, &[3, 4, 6, 3]), 512)
    }

    /// resnet50: bottleneck blocks `[3, 4, 6, 3]`, expansion 4.
    pub fn resnet50(device: &B::Device) -> Self {
        let mut blocks = Vec::new();
        let mut in_channels = 64;
        for (stage, &count) in [3usize, 4, 6, 3].iter().enumerate() {
            let mid = 64 << stage;
            let out = mid * 4;
            for index in 0..count {
                let stride = if stage > 0 && index == 0 { 2 } else { 1 };
                blocks.push(ResidualBlock::bottleneck(device, in_channels, mid, out, stride));
                in_channels = out;
            }
        }
        Self::new(device, blocks, 2048)
    }

    #[must_use]
    pub fn out_features(&self) -> usize {
        self.out_features
    }

    /// Returns pooled features of shape `[batch, out_features]`.
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = self.relu.forward(self.bn1.forward(self.conv1.forward(input)));
        x = self.maxpool.forward(x);
        for block in &self.blocks {
            x = block.forward(x);
        }
        let pooled = self.pool.forward(x);
        let [batch, channels, _, _] = pooled.dims();
        pooled.reshape([batch, channels])
    }
}

fn basic_stages<B: Backend>(device: &B::Device, counts: &[usize; 4]) -> Vec<ResidualBlock<B>> {
    let mut blocks = Vec::new();
    let mut in_channels = 64;
    for (stage, &count) in counts.iter().enumerate() {
        let out = 64 << stage;
        for index in 0..count {
            let stride = if stage > 0 && index == 0 { 2 } else { 1 };
            blocks.push(ResidualBlock::basic(device, in_channels, out, stride));
            in_channels = out;
        }
    }
    blocks
}
