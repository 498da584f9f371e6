//! Declarative description of the encoder-decoder.
//!
//! The network is described as data: encoder stages made of [`ConvSpec`]s,
//! followed by a list of [`DecoderStep`]s. [`crate::model::SegNet`] is built
//! from this description, checkpoint metadata stores it, and weight transfer
//! validates kernel shapes against it.

use serde::{Deserialize, Serialize};
use seg_core::{Error, Result, ARCHITECTURE_VERSION};

/// Layer name prefixes that stay trainable in freeze mode.
pub const FREEZE_TRAINABLE_SCOPES: [&str; 6] = ["up_conv", "fc", "bottleneck", "logits", "upsample", "conv5"];

/// Whether `layer` is updated when only the decoder side is trained.
pub fn is_trainable_when_frozen(layer: &str) -> bool {
    FREEZE_TRAINABLE_SCOPES.iter().any(|scope| layer.starts_with(scope))
}

/// One convolution, optionally followed by batch norm and ReLU.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvSpec {
    pub name: String,
    pub filters: usize,
    pub kernel: usize,
    pub stride: usize,
    pub dilation: usize,
    pub seed: u64,
    pub batch_norm: bool,
    pub relu: bool,
    /// Included in the L2 penalty
    pub regularized: bool,
}

impl ConvSpec {
    /// 3x3, stride 1, batch norm and ReLU, regularized.
    pub fn new(name: impl Into<String>, filters: usize, seed: u64) -> Self {
        Self {
            name: name.into(),
            filters,
            kernel: 3,
            stride: 1,
            dilation: 1,
            seed,
            batch_norm: true,
            relu: true,
            regularized: true,
        }
    }

    pub fn with_kernel(mut self, kernel: usize) -> Self {
        self.kernel = kernel;
        self
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    pub fn with_dilation(mut self, dilation: usize) -> Self {
        self.dilation = dilation;
        self
    }

    pub fn without_batch_norm(mut self) -> Self {
        self.batch_norm = false;
        self
    }

    pub fn without_relu(mut self) -> Self {
        self.relu = false;
        self
    }

    pub fn unregularized(mut self) -> Self {
        self.regularized = false;
        self
    }

    /// Symmetric padding that keeps `ceil(n / stride)` outputs.
    pub fn padding(&self) -> usize {
        (self.kernel - 1) / 2 * self.dilation
    }
}

/// Transposed convolution. The output is cropped to `input * stride`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransposeSpec {
    pub name: String,
    pub filters: usize,
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
    pub seed: u64,
    pub relu: bool,
    pub regularized: bool,
}

/// Max pooling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSpec {
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
}

impl PoolSpec {
    /// 3x3 window, stride 2, padded by one.
    pub fn overlapping() -> Self {
        Self {
            kernel: 3,
            stride: 2,
            padding: 1,
        }
    }

    /// 2x2 window, stride 2, unpadded.
    pub fn halving() -> Self {
        Self {
            kernel: 2,
            stride: 2,
            padding: 0,
        }
    }

    /// Extra `(before, after)` padding that lets an unpadded pool produce
    /// `ceil(size / stride)` outputs. Explicitly padded pools get none.
    pub fn same_padding(&self, size: usize) -> (usize, usize) {
        if self.padding != 0 || self.stride == 0 || size == 0 {
            return (0, 0);
        }
        let out = size.div_ceil(self.stride);
        let needed = ((out - 1) * self.stride + self.kernel).saturating_sub(size);
        (needed / 2, needed - needed / 2)
    }
}

/// A run of convolutions, an optional residual shortcut from the first
/// to the last conv, and optional pooling followed by dropout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,
    pub convs: Vec<ConvSpec>,
    pub residual: bool,
    pub pool: Option<PoolSpec>,
}

impl StageSpec {
    /// Builds a stage of `filters`-wide convs from `(name, stride, seed)`
    /// triples, all sharing `dilation`.
    pub fn build(
        name: &str,
        filters: usize,
        layers: &[(&str, usize, u64)],
        dilation: usize,
        residual: bool,
        pool: Option<PoolSpec>,
    ) -> Self {
        let convs = layers
            .iter()
            .map(|&(layer, stride, seed)| {
                ConvSpec::new(layer, filters, seed)
                    .with_stride(stride)
                    .with_dilation(dilation)
            })
            .collect();
        Self {
            name: name.to_string(),
            convs,
            residual,
            pool,
        }
    }
}

/// One step of the decoder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecoderStep {
    /// Nearest-neighbour resize to `input_size / divisor`
    Resize { divisor: usize },
    Conv(ConvSpec),
    Transpose(TransposeSpec),
}

/// Full network description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchitectureSpec {
    pub version: String,
    pub in_channels: usize,
    pub stages: Vec<StageSpec>,
    pub decoder: Vec<DecoderStep>,
}

impl ArchitectureSpec {
    /// Looks up a known architecture by version string.
    pub fn for_version(version: &str) -> Result<Self> {
        match version {
            ARCHITECTURE_VERSION => Ok(Self::v3_9_3_01()),
            other => Err(Error::Model(format!("unknown architecture version: {}", other))),
        }
    }

    /// Strided/dilated residual encoder with a resize-then-convolve decoder.
    pub fn v3_9_3_01() -> Self {
        let stages = vec![
            StageSpec::build("stem", 32, &[("conv0.1", 2, 100), ("conv0.2", 2, 100)], 1, false, None),
            StageSpec::build(
                "stage1",
                48,
                &[("conv1.0", 2, 100), ("conv1.1", 1, 101), ("conv1.2", 1, 1101)],
                1,
                false,
                Some(PoolSpec::overlapping()),
            ),
            StageSpec::build(
                "stage2",
                64,
                &[("conv2.1", 1, 104), ("conv2.2", 1, 1104), ("conv2.3", 1, 1104)],
                1,
                true,
                Some(PoolSpec::halving()),
            ),
            StageSpec::build(
                "stage3",
                128,
                &[("conv3.1", 1, 107), ("conv3.2", 1, 1107), ("conv3.3", 1, 1107)],
                1,
                true,
                Some(PoolSpec::halving()),
            ),
            StageSpec::build(
                "stage4",
                256,
                &[("conv4", 1, 110), ("conv4.1", 1, 1710), ("conv4.2", 1, 1710)],
                1,
                true,
                None,
            ),
            StageSpec::build(
                "stage5",
                512,
                &[("conv5", 1, 113), ("conv5.1", 1, 11930), ("conv5.2", 1, 11931)],
                2,
                true,
                None,
            ),
            StageSpec {
                name: "bottleneck".to_string(),
                convs: vec![ConvSpec::new("fc_1", 768, 11932).with_kernel(1)],
                residual: false,
                pool: None,
            },
        ];

        let decoder = vec![
            DecoderStep::Resize { divisor: 8 },
            DecoderStep::Conv(ConvSpec::new("up_conv2", 512, 121435)),
            DecoderStep::Conv(ConvSpec::new("up_conv4", 256, 11756).without_relu()),
            DecoderStep::Resize { divisor: 4 },
            DecoderStep::Conv(ConvSpec::new("up_conv6", 128, 11757)),
            DecoderStep::Conv(ConvSpec::new("up_conv7", 128, 11758)),
            DecoderStep::Transpose(TransposeSpec {
                name: "upsample_4".to_string(),
                filters: 64,
                kernel: 4,
                stride: 2,
                padding: 1,
                seed: 117931,
                relu: true,
                regularized: false,
            }),
            DecoderStep::Transpose(TransposeSpec {
                name: "upsample_5".to_string(),
                filters: 32,
                kernel: 4,
                stride: 1,
                padding: 1,
                seed: 117932,
                relu: true,
                regularized: false,
            }),
            DecoderStep::Conv(ConvSpec::new("up_conv9", 32, 11759)),
            DecoderStep::Conv(
                ConvSpec::new("logits", 1, 117933)
                    .without_batch_norm()
                    .without_relu()
                    .unregularized(),
            ),
            DecoderStep::Resize { divisor: 1 },
        ];

        Self {
            version: ARCHITECTURE_VERSION.to_string(),
            in_channels: 1,
            stages,
            decoder,
        }
    }

    /// Input sizes the network accepts.
    pub fn check_input_size(&self, size: usize) -> Result<()> {
        if size < 64 || size % 8 != 0 {
            return Err(Error::Model(format!(
                "input size must be a multiple of 8 and at least 64, got {}",
                size
            )));
        }
        Ok(())
    }

    /// Layer identifiers in forward order.
    pub fn layer_names(&self) -> Vec<String> {
        self.kernel_shapes().into_iter().map(|(name, _)| name).collect()
    }

    pub fn contains_layer(&self, name: &str) -> bool {
        self.kernel_shapes().iter().any(|(layer, _)| layer == name)
    }

    /// Kernel shape of every layer, in burn's weight layout:
    /// `[out, in, k, k]` for convolutions and `[in, out, k, k]` for
    /// transposed convolutions.
    pub fn kernel_shapes(&self) -> Vec<(String, [usize; 4])> {
        let mut shapes = Vec::new();
        let mut channels = self.in_channels;
        for conv in self.stages.iter().flat_map(|s| s.convs.iter()) {
            shapes.push((conv.name.clone(), [conv.filters, channels, conv.kernel, conv.kernel]));
            channels = conv.filters;
        }
        for step in &self.decoder {
            match step {
                DecoderStep::Resize { .. } => {}
                DecoderStep::Conv(conv) => {
                    shapes.push((conv.name.clone(), [conv.filters, channels, conv.kernel, conv.kernel]));
                    channels = conv.filters;
                }
                DecoderStep::Transpose(t) => {
                    shapes.push((t.name.clone(), [channels, t.filters, t.kernel, t.kernel]));
                    channels = t.filters;
                }
            }
        }
        shapes
    }

    pub fn kernel_shape(&self, name: &str) -> Option<[usize; 4]> {
        self.kernel_shapes()
            .into_iter()
            .find(|(layer, _)| layer == name)
            .map(|(_, shape)| shape)
    }

    /// Layers whose kernels carry the L2 penalty.
    pub fn regularized_layers(&self) -> Vec<String> {
        let encoder = self
            .stages
            .iter()
            .flat_map(|s| s.convs.iter())
            .filter(|c| c.regularized)
            .map(|c| c.name.clone());
        let decoder = self.decoder.iter().filter_map(|step| match step {
            DecoderStep::Conv(c) if c.regularized => Some(c.name.clone()),
            DecoderStep::Transpose(t) if t.regularized => Some(t.name.clone()),
            _ => None,
        });
        encoder.chain(decoder).collect()
    }

    /// Name of the first convolution, whose kernels get visualized.
    pub fn first_layer(&self) -> Option<&str> {
        self.stages
            .iter()
            .flat_map(|s| s.convs.iter())
            .next()
            .map(|c| c.name.as_str())
    }

    /// Same topology with every layer `divisor` times narrower. Keeps the
    /// single-channel logits layer.
    #[cfg(test)]
    pub(crate) fn narrowed(mut self, divisor: usize) -> Self {
        let shrink = |filters: usize| (filters / divisor).max(1);
        for stage in &mut self.stages {
            for conv in &mut stage.convs {
                conv.filters = shrink(conv.filters);
            }
        }
        for step in &mut self.decoder {
            match step {
                DecoderStep::Conv(conv) if conv.name != "logits" => conv.filters = shrink(conv.filters),
                DecoderStep::Transpose(t) => t.filters = shrink(t.filters),
                _ => {}
            }
        }
        self
    }
}
