//! EfficientNet-B0 feature extractor (MBConv with squeeze-excitation).

use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation::sigmoid;

/// Expansion / channels / repeats / stride / kernel per stage.
const STAGES: [(usize, usize, usize, usize, usize); 7] = [
    (1, 16, 1, 1, 3),
    (6, 24, 2, 2, 3),
    (6, 40, 2, 2, 5),
    (6, 80, 3, 2, 3),
    (6, 112, 3, 1, 5),
    (6, 192, 4, 2, 5),
    (6, 320, 1, 1, 3),
];

const HEAD_CHANNELS: usize = 1280;
const SE_REDUCTION: usize = 4;

fn silu<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    x.clone() * sigmoid(x)
}

/// Channel attention: pooled 1x1 bottleneck gating the block output.
#[derive(Module, Debug)]
pub struct SqueezeExcite<B: Backend> {
    pool: AdaptiveAvgPool2d,
    reduce: Conv2d<B>,
    expand: Conv2d<B>,
}

impl<B: Backend> SqueezeExcite<B> {
    fn new(device: &B::Device, channels: usize, reduced: usize) -> Self {
        Self {
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            reduce: Conv2dConfig::new([channels, reduced], [1, 1]).init(device),
            expand: Conv2dConfig::new([reduced, channels], [1, 1]).init(device),
        }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let scale = self.pool.forward(input.clone());
        let scale = silu(self.reduce.forward(scale));
        let scale = sigmoid(self.expand.forward(scale));
        input * scale
    }
}

/// MBConv: 1x1 expand, depthwise kxk, squeeze-excitation, 1x1 project.
#[derive(Module, Debug)]
pub struct MbConv<B: Backend> {
    expand_conv: Option<Conv2d<B>>,
    expand_bn: Option<BatchNorm<B, 2>>,
    depthwise_conv: Conv2d<B>,
    depthwise_bn: BatchNorm<B, 2>,
    se: SqueezeExcite<B>,
    project_conv: Conv2d<B>,
    project_bn: BatchNorm<B, 2>,
    use_skip: bool,
}

impl<B: Backend> MbConv<B> {
    fn new(
        device: &B::Device,
        in_channels: usize,
        out_channels: usize,
        expand_ratio: usize,
        stride: usize,
        kernel: usize,
    ) -> Self {
        let hidden = in_channels * expand_ratio;
        let padding = kernel / 2;
        let (expand_conv, expand_bn) = if expand_ratio == 1 {
            (None, None)
        } else {
            (
                Some(
                    Conv2dConfig::new([in_channels, hidden], [1, 1])
                        .with_bias(false)
                        .init(device),
                ),
                Some(BatchNormConfig::new(hidden).init(device)),
            )
        };

        Self {
            expand_conv,
            expand_bn,
            depthwise_conv: Conv2dConfig::new([hidden, hidden], [kernel, kernel])
                .with_stride([stride, stride])
                .with_padding(PaddingConfig2d::Explicit(padding, padding))
                .with_groups(hidden)
                .with_bias(false)
                .init(device),
            depthwise_bn: BatchNormConfig::new(hidden).init(device),
            se: SqueezeExcite::new(device, hidden, (in_channels / SE_REDUCTION).max(1)),
            project_conv: Conv2dConfig::new([hidden, out_channels], [1, 1])
                .with_bias(false)
                .init(device),
            project_bn: BatchNormConfig::new(out_channels).init(device),
            use_skip: stride == 1 && in_channels == out_channels,
        }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = input.clone();
        if let (Some(conv), Some(bn)) = (&self.expand_conv, &self.expand_bn) {
            x = silu(bn.forward(conv.forward(x)));
        }
        x = silu(self.depthwise_bn.forward(self.depthwise_conv.forward(x)));
        x = self.se.forward(x);
        x = self.project_bn.forward(self.project_conv.forward(x));

        if self.use_skip {
            x + input
        } else {
            x
        }
    }
}

/// EfficientNet-B0: stem, seven MBConv stages, 1x1 head, pool.
#[derive(Module, Debug)]
pub struct EfficientNetB0<B: Backend> {
    stem_conv: Conv2d<B>,
    stem_bn: BatchNorm<B, 2>,
    blocks: Vec<MbConv<B>>,
    head_conv: Conv2d<B>,
    head_bn: BatchNorm<B, 2>,
    pool: AdaptiveAvgPool2d,
}

impl<B: Backend> EfficientNetB0<B> {
    pub fn new(device: &B::Device) -> Self {
        let mut blocks = Vec::new();
        let mut in_channels = 32;
        for (expand, channels, repeats, stride, kernel) in STAGES {
            for index in 0..repeats {
                let stride = if index == 0 { stride } else { 1 };
                blocks.push(MbConv::new(
                    device,
                    in_channels,
                    channels,
                    expand,
                    stride,
                    kernel,
                ));
                in_channels = channels;
            }
        }

        Self {
            stem_conv: Conv2dConfig::new([3, 32], [3, 3])
                .with_stride([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(false)
                .init(device),
            stem_bn: BatchNormConfig::new(32).init(device),
            blocks,
            head_conv: Conv2dConfig::new([in_channels, HEAD_CHANNELS], [1, 1])
                .with_bias(false)
                .init(device),
            head_bn: BatchNormConfig::new(HEAD_CHANNELS).init(device),
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
        }
    }

    #[must_use]
    pub fn out_features(&self) -> usize {
        HEAD_CHANNELS
    }

    /// Returns pooled features of shape `[batch, 1280]`.
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = silu(self.stem_bn.forward(self.stem_conv.forward(input)));
        for block in &self.blocks {
            x = block.forward(x);
        }
        x = silu(self.head_bn.forward(self.head_conv.forward(x)));
        let pooled = self.pool.forward(x);
        let [batch, channels, _, _] = pooled.dims();
        pooled.reshape([batch, channels])
    }
}
