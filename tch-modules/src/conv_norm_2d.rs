use crate::{common::*, group_norm::GroupNormInit};

/// Normalization layer selector, named as in detectron2 configs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr)]
pub enum NormKind {
    #[serde(rename = "")]
    #[strum(serialize = "none")]
    None,
    #[serde(rename = "BN")]
    BatchNorm,
    #[serde(rename = "FrozenBN")]
    FrozenBatchNorm,
    #[serde(rename = "GN")]
    GroupNorm,
}

impl Default for NormKind {
    fn default() -> Self {
        Self::None
    }
}

impl NormKind {
    pub fn is_none(&self) -> bool {
        *self == Self::None
    }

    pub fn build<'p>(self, path: impl Borrow<nn::Path<'p>>, channels: i64) -> Result<Option<Norm>> {
        let path = path.borrow();
        let norm = match self {
            Self::None => None,
            Self::BatchNorm => Some(Norm::BatchNorm(nn::batch_norm2d(
                path,
                channels,
                Default::default(),
            ))),
            Self::FrozenBatchNorm => Some(Norm::Frozen(FrozenBatchNorm::new(path, channels))),
            Self::GroupNorm => Some(Norm::GroupNorm(
                GroupNormInit::default().build(path, channels)?,
            )),
        };
        Ok(norm)
    }
}

#[derive(Debug)]
pub enum Norm {
    BatchNorm(nn::BatchNorm),
    Frozen(FrozenBatchNorm),
    GroupNorm(crate::group_norm::GroupNorm),
}

impl nn::ModuleT for Norm {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        match self {
            Self::BatchNorm(norm) => norm.forward_t(xs, train),
            Self::Frozen(norm) => norm.forward_t(xs, train),
            Self::GroupNorm(norm) => norm.forward_t(xs, train),
        }
    }
}

/// Batch norm with fixed statistics and affine parameters.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct FrozenBatchNorm {
    weight: Tensor,
    bias: Tensor,
    #[derivative(Debug = "ignore")]
    running_mean: Tensor,
    #[derivative(Debug = "ignore")]
    running_var: Tensor,
}

impl FrozenBatchNorm {
    const EPS: f64 = 1e-5;

    pub fn new<'p>(path: impl Borrow<nn::Path<'p>>, channels: i64) -> Self {
        let path = path.borrow();
        Self {
            weight: path.ones_no_train("weight", &[channels]),
            bias: path.zeros_no_train("bias", &[channels]),
            running_mean: path.zeros_no_train("running_mean", &[channels]),
            running_var: path.ones_no_train("running_var", &[channels]),
        }
    }
}

impl nn::ModuleT for FrozenBatchNorm {
    fn forward_t(&self, xs: &Tensor, _train: bool) -> Tensor {
        let scale = &self.weight * (&self.running_var + Self::EPS).rsqrt();
        let bias = &self.bias - &self.running_mean * &scale;
        xs * scale.view([1, -1, 1, 1]) + bias.view([1, -1, 1, 1])
    }
}

/// A 2D convolution followed by an optional norm and an optional ReLU.
#[derive(Debug, Clone)]
pub struct ConvNorm2DInit {
    pub in_c: i64,
    pub out_c: i64,
    pub k: i64,
    pub s: i64,
    pub p: i64,
    pub d: i64,
    pub g: i64,
    pub bias: bool,
    pub norm: NormKind,
    pub relu: bool,
    pub ws_init: nn::Init,
}

impl ConvNorm2DInit {
    pub fn new(in_c: i64, out_c: i64, k: i64) -> Self {
        Self {
            in_c,
            out_c,
            k,
            s: 1,
            p: k / 2,
            d: 1,
            g: 1,
            bias: true,
            norm: NormKind::None,
            relu: true,
            ws_init: nn::Init::KaimingUniform,
        }
    }

    pub fn build<'p, P>(self, path: P) -> Result<ConvNorm2D>
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();

        let Self {
            in_c,
            out_c,
            k,
            s,
            p,
            d,
            g,
            bias,
            norm,
            relu,
            ws_init,
        } = self;

        ensure!(
            in_c > 0 && out_c > 0 && k > 0 && s > 0,
            "channels, kernel size and stride must be positive"
        );
        ensure!(
            in_c % g == 0 && out_c % g == 0,
            "channels must be divisible by groups {}",
            g
        );

        let conv = nn::conv2d(
            path / "conv",
            in_c,
            out_c,
            k,
            nn::ConvConfig {
                stride: s,
                padding: p,
                dilation: d,
                groups: g,
                // a norm layer supplies its own shift
                bias: bias && norm.is_none(),
                ws_init,
                ..Default::default()
            },
        );
        let norm = norm.build(path / "norm", out_c)?;

        Ok(ConvNorm2D { conv, norm, relu })
    }
}

#[derive(Debug)]
pub struct ConvNorm2D {
    conv: nn::Conv2D,
    norm: Option<Norm>,
    relu: bool,
}

impl nn::ModuleT for ConvNorm2D {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let Self {
            ref conv,
            ref norm,
            relu,
        } = *self;

        let xs = xs.apply(conv);
        let xs = match norm {
            Some(norm) => norm.forward_t(&xs, train),
            None => xs,
        };

        if relu {
            xs.relu()
        } else {
            xs
        }
    }
}
