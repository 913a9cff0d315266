//! Optimisation loop: one update is a posterior unroll, the loss, a backward
//! pass and an Adam step, in that order. Holding the model mutably for the
//! whole step keeps forward passes from interleaving with weight updates.
use std::path::Path;

use tch::{Device, Tensor};
use tracing::{info, warn};

use crate::{
    dataset::ImageDataset,
    error::Result,
    loss::{mean_squared_error, Loss, VarianceSchedule},
    model::ConvDrawModel,
    optimizer::AdamOptimizer,
    utils::has_nan,
};

#[derive(Debug, Clone, Copy)]
pub struct LossReport {
    pub nll_per_pixel: f64,
    pub mse: f64,
    pub kld: f64,
    pub learning_rate: f64,
    pub sigma: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EpochSummary {
    pub batches: usize,
    pub skipped: usize,
    pub mean_nll_per_pixel: f64,
    pub mean_kld: f64,
}

pub struct Trainer {
    model: ConvDrawModel,
    optimizer: AdamOptimizer,
    schedule: VarianceSchedule,
    num_updates: u64,
}

impl Trainer {
    pub fn new(model: ConvDrawModel) -> Result<Self> {
        let optimizer = AdamOptimizer::from_hyperparams(model.var_store(), model.hyperparams())?;
        let schedule = model.hyperparams().variance_schedule();
        Ok(Self { model, optimizer, schedule, num_updates: 0 })
    }

    pub fn model(&self) -> &ConvDrawModel {
        &self.model
    }

    pub fn into_model(self) -> ConvDrawModel {
        self.model
    }

    pub fn schedule(&self) -> &VarianceSchedule {
        &self.schedule
    }

    pub fn num_updates(&self) -> u64 {
        self.num_updates
    }

    pub fn sigma(&self) -> f64 {
        self.schedule.sigma(self.num_updates)
    }

    /// One optimizer update on the batch `x`. Returns `None` when the loss is
    /// NaN; no update is applied in that case.
    pub fn step(&mut self, x: &Tensor) -> Result<Option<LossReport>> {
        let nll_variance = self.model.hyperparams().nll_variance;
        let num_pixels = self.model.hyperparams().num_pixels();

        let unroll = self.model.sample_z_and_x_params_from_posterior(x)?;
        let loss = Loss::assemble(x, &unroll, &self.schedule, self.num_updates, nll_variance)?;
        if has_nan(&loss.total)? {
            warn!(update = self.num_updates, "loss is NaN, skipping update");
            return Ok(None);
        }

        self.model.zero_grad();
        loss.total.backward();
        self.optimizer.update(self.num_updates);
        self.num_updates += 1;

        let mse = tch::no_grad(|| mean_squared_error(x, &unroll.pixel.mean_x));
        Ok(Some(LossReport {
            nll_per_pixel: loss.nll_per_pixel(num_pixels)?,
            mse: f64::try_from(&mse)?,
            kld: f64::try_from(&loss.kld)?,
            learning_rate: self.optimizer.learning_rate(),
            sigma: self.sigma(),
        }))
    }

    /// One pass over `dataset`. When `snapshot_directory` is given the weights
    /// are saved every `snapshot_every` batches and once more at the end.
    pub fn train_epoch(
        &mut self,
        dataset: &ImageDataset,
        batch_size: i64,
        device: Device,
        snapshot_directory: Option<&Path>,
        snapshot_every: usize,
    ) -> Result<EpochSummary> {
        let mut summary = EpochSummary::default();
        let batches = dataset.batches(batch_size, device);
        let num_batches = batches.num_batches();
        for (batch_index, x) in batches.enumerate() {
            match self.step(&x)? {
                Some(report) => {
                    summary.batches += 1;
                    summary.mean_nll_per_pixel += report.nll_per_pixel;
                    summary.mean_kld += report.kld;
                    tracing::debug!(
                        batch = batch_index + 1,
                        num_batches,
                        nll_per_pixel = report.nll_per_pixel,
                        mse = report.mse,
                        kld = report.kld,
                        lr = report.learning_rate,
                        sigma_t = report.sigma,
                        "batch done"
                    );
                }
                None => summary.skipped += 1,
            }
            if let Some(dir) = snapshot_directory {
                if snapshot_every > 0 && batch_index > 0 && batch_index % snapshot_every == 0 {
                    self.model.save(dir)?;
                }
            }
        }
        if let Some(dir) = snapshot_directory {
            self.model.save(dir)?;
        }
        if summary.batches > 0 {
            summary.mean_nll_per_pixel /= summary.batches as f64;
            summary.mean_kld /= summary.batches as f64;
        }
        info!(
            batches = summary.batches,
            skipped = summary.skipped,
            nll_per_pixel = summary.mean_nll_per_pixel,
            kld = summary.mean_kld,
            lr = self.optimizer.learning_rate(),
            sigma_t = self.sigma(),
            "epoch done"
        );
        Ok(summary)
    }
}
