//! MobileNetV2 feature extractor (inverted residuals).

use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, PaddingConfig2d, Relu};
use burn::prelude::*;

/// Expansion / channels / repeats / stride per stage.
const STAGES: [(usize, usize, usize, usize); 7] = [
    (1, 16, 1, 1),
    (6, 24, 2, 2),
    (6, 32, 3, 2),
    (6, 64, 4, 2),
    (6, 96, 3, 1),
    (6, 160, 3, 2),
    (6, 320, 1, 1),
];

const HEAD_CHANNELS: usize = 1280;

/// Inverted residual block: optional 1x1 expand, depthwise 3x3, 1x1 project.
#[derive(Module, Debug)]
pub struct InvertedResidual<B: Backend> {
    expand_conv: Option<Conv2d<B>>,
    expand_bn: Option<BatchNorm<B, 2>>,
    depthwise_conv: Conv2d<B>,
    depthwise_bn: BatchNorm<B, 2>,
    project_conv: Conv2d<B>,
    project_bn: BatchNorm<B, 2>,
    relu: Relu,
    use_skip: bool,
}

impl<B: Backend> InvertedResidual<B> {
    fn new(
        device: &B::Device,
        in_channels: usize,
        out_channels: usize,
        expand_ratio: usize,
        stride: usize,
    ) -> Self {
        let hidden = in_channels * expand_ratio;
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
            depthwise_conv: Conv2dConfig::new([hidden, hidden], [3, 3])
                .with_stride([stride, stride])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_groups(hidden)
                .with_bias(false)
                .init(device),
            depthwise_bn: BatchNormConfig::new(hidden).init(device),
            project_conv: Conv2dConfig::new([hidden, out_channels], [1, 1])
                .with_bias(false)
                .init(device),
            project_bn: BatchNormConfig::new(out_channels).init(device),
            relu: Relu::new(),
            use_skip: stride == 1 && in_channels == out_channels,
        }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = input.clone();
        if let (Some(conv), Some(bn)) = (&self.expand_conv, &self.expand_bn) {
            x = self.relu.forward(bn.forward(conv.forward(x)));
        }
        x = self
            .relu
            .forward(self.depthwise_bn.forward(self.depthwise_conv.forward(x)));
        x = self.project_bn.forward(self.project_conv.forward(x));

        if self.use_skip {
            x + input
        } else {
            x
        }
    }
}

/// MobileNetV2: stem, seven inverted-residual stages, 1x1 head, pool.
#[derive(Module, Debug)]
pub struct MobileNetV2<B: Backend> {
    stem_conv: Conv2d<B>,
    stem_bn: BatchNorm<B, 2>,
    blocks: Vec<InvertedResidual<B>>,
    head_conv: Conv2d<B>,
    head_bn: BatchNorm<B, 2>,
    relu: Relu,
    pool: AdaptiveAvgPool2d,
}

impl<B: Backend> MobileNetV2<B> {
    pub fn new(device: &B::Device) -> Self {
        let mut blocks = Vec::new();
        let mut in_channels = 32;
        for (expand, channels, repeats, stride) in STAGES {
            for index in 0..repeats {
                let stride = if index == 0 { stride } else { 1 };
                blocks.push(InvertedResidual::new(
                    device,
                    in_channels,
                    channels,
                    expand,
                    stride,
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
            relu: Relu::new(),
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
        }
    }

    #[must_use]
    pub fn out_features(&self) -> usize {
        HEAD_CHANNELS
    }

    /// Returns pooled features of shape `[batch, 1280]`.
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = self
            .relu
            .forward(self.stem_bn.forward(self.stem_conv.forward(input)));
        for block in &self.blocks {
            x = block.forward(x);
        }
        x = self
            .relu
            .forward(self.head_bn.forward(self.head_conv.forward(x)));
        let pooled = self.pool.forward(x);
        let [batch, channels, _, _] = pooled.dims();
        pooled.reshape([batch, channels])
    }
}
