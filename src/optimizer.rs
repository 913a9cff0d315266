use tch::nn::{self, OptimizerConfig};

use crate::{config::HyperParameters, error::Result};

/// Adam over every trainable variable of a `VarStore`, with the learning rate
/// annealed linearly from `lr_i` to `lr_f` over `lr_n` updates.
pub struct AdamOptimizer {
    opt: nn::Optimizer,
    lr_i: f64,
    lr_f: f64,
    lr_n: f64,
    learning_rate: f64,
}

impl AdamOptimizer {
    pub fn new(vs: &nn::VarStore, lr_i: f64, lr_f: f64, lr_n: f64) -> Result<Self> {
        let opt = nn::Adam::default().build(vs, lr_i)?;
        Ok(Self { opt, lr_i, lr_f, lr_n, learning_rate: lr_i })
    }

    pub fn from_hyperparams(vs: &nn::VarStore, hp: &HyperParameters) -> Result<Self> {
        Self::new(vs, hp.lr_i, hp.lr_f, hp.lr_n)
    }

    pub fn learning_rate_at(&self, step_index: u64) -> f64 {
        let lr = self.lr_f + (self.lr_i - self.lr_f) * (1.0 - step_index as f64 / self.lr_n);
        lr.max(self.lr_f)
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn zero_grad(&mut self) {
        self.opt.zero_grad();
    }

    /// Applies one Adam step with the learning rate for `step_index`.
    pub fn update(&mut self, step_index: u64) {
        self.learning_rate = self.learning_rate_at(step_index);
        self.opt.set_lr(self.learning_rate);
        self.opt.step();
    }
}
