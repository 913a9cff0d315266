//! Latent Gaussians: the heads projecting a hidden state to `(mean, ln_var)`
//! and the diagonal distribution they parameterise.
use tch::{nn, Tensor};

use crate::{
    error::Result,
    utils::{check_channels, he_normal, INIT_SCALE},
};

pub struct DiagonalGaussian {
    pub mean: Tensor,
    pub ln_var: Tensor,
}

impl DiagonalGaussian {
    pub fn new(mean: Tensor, ln_var: Tensor) -> Self {
        DiagonalGaussian { mean, ln_var }
    }

    /// Reparameterised draw, `mean + exp(ln_var / 2) * eps`. Fresh noise on
    /// every call.
    pub fn sample(&self) -> Tensor {
        let eps = Tensor::randn_like(&self.mean);
        &self.mean + (&self.ln_var * 0.5).exp() * eps
    }

    /// `mean` when `zero_variance` is set, a fresh sample otherwise.
    pub fn sample_or_mean(&self, zero_variance: bool) -> Tensor {
        if zero_variance {
            self.mean.shallow_clone()
        } else {
            self.sample()
        }
    }

    pub fn into_parts(self) -> (Tensor, Tensor) {
        (self.mean, self.ln_var)
    }
}

/// Projects a hidden state to the parameters of the latent at one step. The
/// prior reads the generator state, the posterior the inference state.
#[derive(Debug)]
pub struct GaussianHead {
    mean_z: nn::Conv2D,
    ln_var_z: nn::Conv2D,
    channels_z: i64,
}

pub type PriorHead = GaussianHead;
pub type PosteriorHead = GaussianHead;

impl GaussianHead {
    pub fn new(vs: nn::Path, channels_z: i64) -> Self {
        let conv_cfg = nn::ConvConfig {
            stride: 1,
            padding: 2,
            ws_init: he_normal(channels_z, 5, INIT_SCALE),
            ..Default::default()
        };
        let mean_z = nn::conv2d(&vs / "mean_z", channels_z, channels_z, 5, conv_cfg);
        let ln_var_z = nn::conv2d(&vs / "ln_var_z", channels_z, channels_z, 5, conv_cfg);
        Self { mean_z, ln_var_z, channels_z }
    }

    pub fn compute_mean_z(&self, h: &Tensor) -> Result<Tensor> {
        check_channels(h, self.channels_z, "gaussian head mean")?;
        Ok(h.apply(&self.mean_z))
    }

    pub fn compute_ln_var_z(&self, h: &Tensor) -> Result<Tensor> {
        check_channels(h, self.channels_z, "gaussian head ln_var")?;
        Ok(h.apply(&self.ln_var_z))
    }

    pub fn distribution(&self, h: &Tensor) -> Result<DiagonalGaussian> {
        Ok(DiagonalGaussian::new(self.compute_mean_z(h)?, self.compute_ln_var_z(h)?))
    }

    pub fn sample_z(&self, h: &Tensor) -> Result<Tensor> {
        Ok(self.distribution(h)?.sample())
    }
}
