//! Encoder-decoder segmentation network.
//!
//! [`SegNet`] is instantiated from an [`ArchitectureSpec`]: every encoder
//! stage becomes an [`EncoderStage`], every decoder convolution a
//! [`DecoderLayer`], and resize steps are replayed from the architecture during the
//! forward pass. The network returns per-pixel logits at input resolution;
//! [`SegNet::probabilities`] applies the sigmoid.

use burn::{
    config::Config,
    module::{Ignored, Module, Param},
    nn::{
        conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, PaddingConfig2d,
    },
    tensor::{
        activation::{relu, sigmoid},
        backend::Backend,
        module::interpolate,
        ops::{InterpolateMode, InterpolateOptions},
        Tensor,
    },
};
use seg_core::ExperimentConfig;

use crate::architecture::{ArchitectureSpec, ConvSpec, DecoderStep, PoolSpec, StageSpec, TransposeSpec};
use crate::init::seeded_kernel;

/// Configuration for the segmentation network
#[derive(Config, Debug)]
pub struct SegNetConfig {
    /// Layer layout
    pub architecture: ArchitectureSpec,

    /// Square input size in pixels
    #[config(default = "480")]
    pub size: usize,

    /// Batch norm epsilon
    #[config(default = "1e-8")]
    pub bn_epsilon: f64,

    /// Batch norm momentum in burn's convention (weight of the new batch)
    #[config(default = "0.01")]
    pub bn_momentum: f64,

    /// Dropout rate after each pooling layer
    #[config(default = "0.1")]
    pub pool_dropout: f64,

    /// L2 penalty scale for regularized kernels
    #[config(default = "1e-5")]
    pub l2_scale: f64,
}

impl SegNetConfig {
    pub fn from_experiment(config: &ExperimentConfig, architecture: ArchitectureSpec) -> Self {
        Self::new(architecture)
            .with_size(config.model.size)
            .with_bn_epsilon(config.model.bn_epsilon)
            .with_bn_momentum(1.0 - config.model.bn_decay)
            .with_pool_dropout(config.model.pool_dropout)
            .with_l2_scale(config.model.l2_scale)
    }

    /// Builds the network with seeded kernels and zero biases.
    pub fn init<B: Backend>(&self, device: &B::Device) -> seg_core::Result<SegNet<B>> {
        self.architecture.check_input_size(self.size)?;

        let mut channels = self.architecture.in_channels;
        let mut stages = Vec::with_capacity(self.architecture.stages.len());
        for spec in &self.architecture.stages {
            let stage = EncoderStage::new(spec, channels, self, device)?;
            channels = spec.convs.last().map(|c| c.filters).unwrap_or(channels);
            stages.push(stage);
        }

        let mut decoder = Vec::new();
        for step in &self.architecture.decoder {
            match step {
                DecoderStep::Resize { divisor } => {
                    if *divisor == 0 || self.size % divisor != 0 {
                        return Err(seg_core::Error::Model(format!("resize divisor {} does not divide {}", divisor, self.size)));
                    }
                }
                DecoderStep::Conv(conv) => {
                    decoder.push(DecoderLayer::Conv(ConvBnBlock::new(conv, channels, self, device)?));
                    channels = conv.filters;
                }
                DecoderStep::Transpose(spec) => {
                    decoder.push(DecoderLayer::Transpose(TransposeBlock::new(spec, channels, device)?));
                    channels = spec.filters;
                }
            }
        }

        Ok(SegNet {
            stages,
            decoder,
            arch: Ignored(self.architecture.clone()),
            l2_scale: Ignored(self.l2_scale),
        })
    }
}

/// Convolution with optional batch norm and ReLU
#[derive(Module, Debug)]
pub struct ConvBnBlock<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: Option<BatchNorm<B, 2>>,
    spec: Ignored<ConvSpec>,
}

impl<B: Backend> ConvBnBlock<B> {
    pub fn new(spec: &ConvSpec, in_channels: usize, config: &SegNetConfig, device: &B::Device) -> seg_core::Result<Self> {
        let padding = spec.padding();
        let mut conv = Conv2dConfig::new([in_channels, spec.filters], [spec.kernel, spec.kernel])
            .with_stride([spec.stride, spec.stride])
            .with_dilation([spec.dilation, spec.dilation])
            .with_padding(PaddingConfig2d::Explicit(padding, padding))
            .init(device);
        conv.weight = Param::from_tensor(seeded_kernel(
            [spec.filters, in_channels, spec.kernel, spec.kernel],
            spec.seed,
            device,
        )?);
        conv.bias = Some(Param::from_tensor(Tensor::zeros([spec.filters], device)));

        let bn = spec.batch_norm.then(|| {
            BatchNormConfig::new(spec.filters)
                .with_epsilon(config.bn_epsilon)
                .with_momentum(config.bn_momentum)
                .init(device)
        });

        Ok(Self {
            conv,
            bn,
            spec: Ignored(spec.clone()),
        })
    }

    pub fn name(&self) -> &str {
        &self.spec.0.name
    }

    pub fn spec(&self) -> &ConvSpec {
        &self.spec.0
    }

    /// Convolution and batch norm, without the activation.
    pub fn pre_activation(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        match &self.bn {
            Some(bn) => bn.forward(x),
            None => x,
        }
    }

    pub fn activate(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        if self.spec.0.relu {
            relu(x)
        } else {
            x
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.pre_activation(x);
        self.activate(x)
    }
}

/// Transposed convolution cropped to `input * stride`
#[derive(Module, Debug)]
pub struct TransposeBlock<B: Backend> {
    pub conv: ConvTranspose2d<B>,
    spec: Ignored<TransposeSpec>,
}

impl<B: Backend> TransposeBlock<B> {
    pub fn new(spec: &TransposeSpec, in_channels: usize, device: &B::Device) -> seg_core::Result<Self> {
        let mut conv = ConvTranspose2dConfig::new([in_channels, spec.filters], [spec.kernel, spec.kernel])
            .with_stride([spec.stride, spec.stride])
            .with_padding([spec.padding, spec.padding])
            .init(device);
        conv.weight = Param::from_tensor(seeded_kernel(
            [in_channels, spec.filters, spec.kernel, spec.kernel],
            spec.seed,
            device,
        )?);
        conv.bias = Some(Param::from_tensor(Tensor::zeros([spec.filters], device)));
        Ok(Self {
            conv,
            spec: Ignored(spec.clone()),
        })
    }

    pub fn name(&self) -> &str {
        &self.spec.0.name
    }

    pub fn spec(&self) -> &TransposeSpec {
        &self.spec.0
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, _, h, w] = x.dims();
        let (th, tw) = (h * self.spec.0.stride, w * self.spec.0.stride);
        let mut y = self.conv.forward(x);
        let [n, c, oh, ow] = y.dims();
        if oh > th || ow > tw {
            y = y.slice([0..n, 0..c, 0..th.min(oh), 0..tw.min(ow)]);
        }
        if self.spec.0.relu {
            relu(y)
        } else {
            y
        }
    }
}

/// Encoder stage: convs, optional residual shortcut, optional pool + dropout
#[derive(Module, Debug)]
pub struct EncoderStage<B: Backend> {
    pub convs: Vec<ConvBnBlock<B>>,
    pub pool: Option<MaxPool2d>,
    pub dropout: Option<Dropout>,
    pool_spec: Ignored<Option<PoolSpec>>,
    residual: Ignored<bool>,
}

impl<B: Backend> EncoderStage<B> {
    pub fn new(spec: &StageSpec, in_channels: usize, config: &SegNetConfig, device: &B::Device) -> seg_core::Result<Self> {
        if spec.convs.is_empty() {
            return Err(seg_core::Error::Model(format!("stage {} has no convolutions", spec.name)));
        }
        if spec.residual {
            let first = &spec.convs[0];
            let last = &spec.convs[spec.convs.len() - 1];
            if first.stride != 1 || last.stride != 1 || first.filters != last.filters {
                return Err(seg_core::Error::Model(format!(
                    "stage {} cannot add a residual between layers of different shape",
                    spec.name
                )));
            }
        }

        let mut channels = in_channels;
        let mut convs = Vec::with_capacity(spec.convs.len());
        for conv in &spec.convs {
            convs.push(ConvBnBlock::new(conv, channels, config, device)?);
            channels = conv.filters;
        }

        let pool = spec.pool.map(|p: PoolSpec| {
            MaxPool2dConfig::new([p.kernel, p.kernel])
                .with_strides([p.stride, p.stride])
                .with_padding(PaddingConfig2d::Explicit(p.padding, p.padding))
                .init()
        });
        let dropout = spec.pool.map(|_| DropoutConfig::new(config.pool_dropout).init());

        Ok(Self {
            convs,
            pool,
            dropout,
            pool_spec: Ignored(spec.pool),
            residual: Ignored(spec.residual),
        })
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let last = self.convs.len().saturating_sub(1);
        let residual = self.residual.0 && last > 0;
        let mut shortcut = None;
        let mut x = x;
        for (i, block) in self.convs.iter().enumerate() {
            let mut pre = block.pre_activation(x);
            if residual && i == 0 {
                shortcut = Some(pre.clone());
            } else if residual && i == last {
                if let Some(s) = shortcut.take() {
                    pre = pre + s;
                }
            }
            x = block.activate(pre);
        }

        if let Some(pool) = &self.pool {
            if let Some(spec) = self.pool_spec.0 {
                x = pad_for_pool(x, spec);
            }
            x = pool.forward(x);
        }
        if let Some(dropout) = &self.dropout {
            x = dropout.forward(x);
        }
        x
    }
}

/// Pads odd extents with the lowest float so the max pool rounds its
/// output size up instead of dropping the last row or column.
fn pad_for_pool<B: Backend>(x: Tensor<B, 4>, spec: PoolSpec) -> Tensor<B, 4> {
    let [_, _, height, width] = x.dims();
    let (top, bottom) = spec.same_padding(height);
    let (left, right) = spec.same_padding(width);
    if top + bottom + left + right == 0 {
        return x;
    }
    x.pad((left, right, top, bottom), f32::MIN)
}

/// Decoder layer with parameters
#[derive(Module, Debug)]
pub enum DecoderLayer<B: Backend> {
    Conv(ConvBnBlock<B>),
    Transpose(TransposeBlock<B>),
}

impl<B: Backend> DecoderLayer<B> {
    pub fn name(&self) -> &str {
        match self {
            DecoderLayer::Conv(block) => block.name(),
            DecoderLayer::Transpose(block) => block.name(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            DecoderLayer::Conv(block) => block.forward(x),
            DecoderLayer::Transpose(block) => block.forward(x),
        }
    }
}

/// Borrowed view of a named layer.
pub enum LayerRef<'a, B: Backend> {
    Conv(&'a ConvBnBlock<B>),
    Transpose(&'a TransposeBlock<B>),
}

impl<B: Backend> LayerRef<'_, B> {
    pub fn kernel_shape(&self) -> [usize; 4] {
        match self {
            LayerRef::Conv(block) => block.conv.weight.val().dims(),
            LayerRef::Transpose(block) => block.conv.weight.val().dims(),
        }
    }

    pub fn kernel(&self) -> Tensor<B, 4> {
        match self {
            LayerRef::Conv(block) => block.conv.weight.val(),
            LayerRef::Transpose(block) => block.conv.weight.val(),
        }
    }
}

/// Mutable view of a named layer.
pub enum LayerMut<'a, B: Backend> {
    Conv(&'a mut ConvBnBlock<B>),
    Transpose(&'a mut TransposeBlock<B>),
}

/// Fully convolutional encoder-decoder
#[derive(Module, Debug)]
pub struct SegNet<B: Backend> {
    pub stages: Vec<EncoderStage<B>>,
    pub decoder: Vec<DecoderLayer<B>>,
    arch: Ignored<ArchitectureSpec>,
    l2_scale: Ignored<f64>,
}

impl<B: Backend> SegNet<B> {
    /// Per-pixel logits of shape `[n, 1, S, S]` for input `[n, 1, S, S]`.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, _, height, width] = images.dims();

        let mut x = images;
        for stage in &self.stages {
            x = stage.forward(x);
        }

        let mut layers = self.decoder.iter();
        for step in &self.arch.0.decoder {
            x = match step {
                DecoderStep::Resize { divisor } => {
                    let size = [height / divisor, width / divisor];
                    interpolate(x, size, InterpolateOptions::new(InterpolateMode::Nearest))
                }
                DecoderStep::Conv(_) | DecoderStep::Transpose(_) => match layers.next() {
                    Some(layer) => layer.forward(x),
                    None => x,
                },
            };
        }
        x
    }

    /// Sigmoid probabilities in `[0, 1]`.
    pub fn probabilities(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        sigmoid(self.forward(images))
    }

    pub fn architecture(&self) -> &ArchitectureSpec {
        &self.arch.0
    }

    pub fn l2_scale(&self) -> f64 {
        self.l2_scale.0
    }

    /// Every named layer, in forward order.
    pub fn layers(&self) -> Vec<(&str, LayerRef<'_, B>)> {
        let encoder = self
            .stages
            .iter()
            .flat_map(|s| s.convs.iter())
            .map(|block| (block.name(), LayerRef::Conv(block)));
        let decoder = self.decoder.iter().map(|layer| match layer {
            DecoderLayer::Conv(block) => (block.name(), LayerRef::Conv(block)),
            DecoderLayer::Transpose(block) => (block.name(), LayerRef::Transpose(block)),
        });
        encoder.chain(decoder).collect()
    }

    pub fn layer_names(&self) -> Vec<String> {
        self.layers().into_iter().map(|(name, _)| name.to_string()).collect()
    }

    pub fn layer(&self, name: &str) -> Option<LayerRef<'_, B>> {
        self.layers()
            .into_iter()
            .find(|(layer, _)| *layer == name)
            .map(|(_, layer)| layer)
    }

    pub fn layer_mut(&mut self, name: &str) -> Option<LayerMut<'_, B>> {
        for stage in self.stages.iter_mut() {
            for block in stage.convs.iter_mut() {
                if block.name() == name {
                    return Some(LayerMut::Conv(block));
                }
            }
        }
        for layer in self.decoder.iter_mut() {
            match layer {
                DecoderLayer::Conv(block) if block.name() == name => return Some(LayerMut::Conv(block)),
                DecoderLayer::Transpose(block) if block.name() == name => {
                    return Some(LayerMut::Transpose(block))
                }
                _ => {}
            }
        }
        None
    }

    pub fn kernel_shape(&self, name: &str) -> Option<[usize; 4]> {
        self.layer(name).map(|layer| layer.kernel_shape())
    }

    /// Kernels of the first convolution, `[filters, 1, k, k]`.
    pub fn first_layer_kernels(&self) -> Option<Tensor<B, 4>> {
        self.layers().first().map(|(_, layer)| layer.kernel())
    }

    /// `scale * sum(w^2) / 2` over every regularized kernel.
    pub fn l2_penalty(&self) -> Tensor<B, 1> {
        let device = self.devices().into_iter().next().unwrap_or_default();
        let mut total = Tensor::<B, 1>::zeros([1], &device);
        for (_, layer) in self.layers() {
            let regularized = match &layer {
                LayerRef::Conv(block) => block.spec().regularized,
                LayerRef::Transpose(block) => block.spec().regularized,
            };
            if regularized {
                total = total + layer.kernel().powf_scalar(2.0).sum();
            }
        }
        total.mul_scalar(self.l2_scale.0 / 2.0)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::small_config;
    use super::*;
    use burn::backend::Autodiff;
    use burn::tensor::{Distribution, TensorData};
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn input(n: usize, size: usize) -> Tensor<TestBackend, 4> {
        Tensor::random([n, 1, size, size], Distribution::Normal(0.0, 1.0), &Default::default())
    }

    #[test]
    fn test_output_shape_and_range() {
        let device = Default::default();
        let model = small_config().init::<TestBackend>(&device).unwrap();
        let probs = model.probabilities(input(2, 64));
        assert_eq!(probs.dims(), [2, 1, 64, 64]);
        let values: Vec<f32> = probs.into_data().iter::<f32>().collect();
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_full_width_output_shape() {
        let device = Default::default();
        let model = SegNetConfig::new(ArchitectureSpec::v3_9_3_01())
            .with_size(64)
            .init::<TestBackend>(&device)
            .unwrap();
        assert_eq!(model.forward(input(1, 64)).dims(), [1, 1, 64, 64]);
    }

    #[test]
    fn test_halving_pool_rounds_odd_input_up() {
        let device = Default::default();
        let spec = StageSpec::build("stage", 2, &[("conv", 1, 7)], 1, false, Some(PoolSpec::halving()));
        let stage = EncoderStage::<TestBackend>::new(&spec, 1, &small_config(), &device).unwrap();
        assert_eq!(stage.forward(input(1, 15)).dims(), [1, 2, 8, 8]);
        assert_eq!(stage.forward(input(1, 16)).dims(), [1, 2, 8, 8]);
    }

    #[test]
    fn test_rejects_bad_size() {
        let device = Default::default();
        let result = small_config().with_size(60).init::<TestBackend>(&device);
        assert!(matches!(result, Err(seg_core::Error::Model(_))));
    }

    #[test]
    fn test_seeded_init_is_deterministic() {
        let device = Default::default();
        let a = small_config().init::<TestBackend>(&device).unwrap();
        let b = small_config().init::<TestBackend>(&device).unwrap();
        let ka = a.first_layer_kernels().unwrap().into_data();
        let kb = b.first_layer_kernels().unwrap().into_data();
        assert_eq!(ka, kb);

        // conv2.2 and conv2.3 share a seed
        let k22 = a.layer("conv2.2").unwrap().kernel().into_data();
        let k23 = a.layer("conv2.3").unwrap().kernel().into_data();
        assert_eq!(k22, k23);
    }

    #[test]
    fn test_layer_lookup() {
        let device = Default::default();
        let model = small_config().init::<TestBackend>(&device).unwrap();
        assert_eq!(model.layer_names(), model.architecture().layer_names());
        assert_eq!(model.kernel_shape("conv0.1"), Some([2, 1, 3, 3]));
        assert_eq!(model.kernel_shape("upsample_4"), Some([8, 4, 4, 4]));
        assert!(model.layer("missing").is_none());
        for (name, shape) in model.architecture().kernel_shapes() {
            assert_eq!(model.kernel_shape(&name), Some(shape), "{}", name);
        }
    }

    #[test]
    fn test_l2_penalty_skips_unregularized_layers() {
        let device = Default::default();
        let model = small_config().with_l2_scale(2.0).init::<TestBackend>(&device).unwrap();
        let mut expected = 0.0f64;
        for name in model.architecture().regularized_layers() {
            let kernel = model.layer(&name).unwrap().kernel();
            expected += kernel.into_data().iter::<f32>().map(|v| (v as f64) * (v as f64)).sum::<f64>();
        }
        let penalty: f64 = model.l2_penalty().into_scalar() as f64;
        assert!((penalty - expected).abs() < 1e-3 * expected.max(1.0));
    }

    #[test]
    fn test_biases_start_at_zero() {
        let device = Default::default();
        let model = small_config().init::<TestBackend>(&device).unwrap();
        let bias = model.stages[0].convs[0].conv.bias.as_ref().unwrap().val();
        assert_eq!(bias.into_data(), TensorData::from([0.0f32, 0.0]));
    }

    #[test]
    fn test_autodiff_forward() {
        let device = Default::default();
        let model = small_config().init::<Autodiff<TestBackend>>(&device).unwrap();
        let x = Tensor::<Autodiff<TestBackend>, 4>::zeros([1, 1, 64, 64], &device);
        let loss = model.forward(x).sum();
        let grads = loss.backward();
        assert!(model.stages[0].convs[0].conv.weight.grad(&grads).is_some());
    }
}
