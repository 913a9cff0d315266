//! Training objective: per-step KL between posterior and prior plus the pixel
//! negative log-likelihood under an annealed observation variance.
use std::f64::consts::PI;

use tch::{Kind, Tensor};

use crate::{
    config::NllVariance,
    error::{ConvDrawError, Result},
    model::Unroll,
    utils::check_same_shape,
};

/// Elementwise `KL(N(mean_q, exp(ln_var_q)) || N(mean_p, exp(ln_var_p)))`.
pub fn gaussian_kl_divergence(mean_q: &Tensor, ln_var_q: &Tensor, mean_p: &Tensor, ln_var_p: &Tensor) -> Tensor {
    let diff = mean_q - mean_p;
    let ratio = (ln_var_q.exp() + &diff * &diff) / ln_var_p.exp();
    (ln_var_p - ln_var_q + ratio - 1.) * 0.5
}

/// Elementwise Gaussian NLL of `x` under `N(mean, var)`; `ln_var` must be
/// `log(var)`.
pub fn gaussian_negative_log_likelihood(x: &Tensor, mean: &Tensor, var: &Tensor, ln_var: &Tensor) -> Tensor {
    let diff = x - mean;
    (ln_var + &diff * &diff / var + (2. * PI).ln()) * 0.5
}

/// Mean squared pixel error, reported alongside the loss.
pub fn mean_squared_error(x: &Tensor, mean_x: &Tensor) -> Tensor {
    (x - mean_x).square().mean(Kind::Float)
}

/// Observation sigma linearly annealed from `sigma_i` to `sigma_f` over
/// `horizon` optimizer updates, then held. Never drops below `floor`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VarianceSchedule {
    pub sigma_i: f64,
    pub sigma_f: f64,
    pub horizon: f64,
    pub floor: f64,
}

impl VarianceSchedule {
    pub fn new(sigma_i: f64, sigma_f: f64, horizon: f64, floor: f64) -> Self {
        Self { sigma_i, sigma_f, horizon, floor }
    }

    pub fn sigma(&self, update: u64) -> f64 {
        let remaining = (1.0 - update as f64 / self.horizon).max(0.);
        let sigma = self.sigma_f + (self.sigma_i - self.sigma_f) * remaining;
        sigma.max(self.floor)
    }

    pub fn variance(&self, update: u64) -> f64 {
        self.sigma(update).powi(2)
    }

    pub fn ln_variance(&self, update: u64) -> f64 {
        self.variance(update).ln()
    }
}

/// Batch-normalised loss terms; `total` is what gets differentiated.
#[derive(Debug)]
pub struct Loss {
    pub nll: Tensor,
    pub kld: Tensor,
    pub total: Tensor,
}

impl Loss {
    /// Sum of per-step KL over every element and step, divided by batch size.
    pub fn kl_divergence(unroll: &Unroll, batch_size: i64) -> Result<Tensor> {
        let mut steps = unroll.latent_params.iter();
        let first = steps.next().ok_or_else(|| {
            ConvDrawError::InvalidConfig("kl divergence needs posterior latents".to_string())
        })?;
        let mut kld = first.kl_divergence().sum(Kind::Float);
        for params in steps {
            kld = kld + params.kl_divergence().sum(Kind::Float);
        }
        Ok(kld / batch_size as f64)
    }

    pub fn assemble(
        x: &Tensor,
        unroll: &Unroll,
        schedule: &VarianceSchedule,
        update: u64,
        nll_variance: NllVariance,
    ) -> Result<Self> {
        let mean_x = &unroll.pixel.mean_x;
        check_same_shape(x, mean_x, "pixel likelihood")?;
        let batch_size = x.size()[0];

        let negative_log_likelihood = match nll_variance {
            NllVariance::Scheduled => {
                let var = x.full_like(schedule.variance(update));
                let ln_var = x.full_like(schedule.ln_variance(update));
                gaussian_negative_log_likelihood(x, mean_x, &var, &ln_var)
            }
            NllVariance::Predicted => {
                let ln_var = &unroll.pixel.ln_var_x;
                gaussian_negative_log_likelihood(x, mean_x, &ln_var.exp(), ln_var)
            }
        };
        let nll = negative_log_likelihood.sum(Kind::Float) / batch_size as f64;
        let kld = Self::kl_divergence(unroll, batch_size)?;
        let total = &nll + &kld;
        Ok(Self { nll, kld, total })
    }

    pub fn nll_per_pixel(&self, num_pixels: i64) -> Result<f64> {
        Ok(f64::try_from(&self.nll)? / num_pixels as f64)
    }
}
