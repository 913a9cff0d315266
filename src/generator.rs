//! Generator side: the recurrent core that paints the canvas, its prior
//! heads and the canvas up/down samplers.
use tch::{nn, Tensor};

use crate::{
    config::HyperParameters,
    distribution::PriorHead,
    error::Result,
    lstm::{ConvLstmCell, ConvLstmConfig, LstmState},
    sampler::{ConvDownsampler, SubPixelUpsampler, SCALE},
    sharing::{Role, StepModules},
    utils::concat_channels,
};

/// ConvLSTM fed with `concat(h_gen, z, downsampled canvas)`.
#[derive(Debug)]
pub struct GeneratorCore {
    cell: ConvLstmCell,
}

impl GeneratorCore {
    pub fn new(vs: nn::Path, chz_channels: i64, canvas_channels: i64, config: ConvLstmConfig) -> Self {
        let in_channels = 2 * chz_channels + canvas_channels;
        Self { cell: ConvLstmCell::new(vs, in_channels, chz_channels, config) }
    }

    pub fn forward_onestep(
        &self,
        prev: &LstmState,
        z: &Tensor,
        downsampled_r: &Tensor,
        norm_step: usize,
        train: bool,
    ) -> Result<LstmState> {
        let lstm_in = concat_channels(&[&prev.h, z, downsampled_r], "generator core input")?;
        self.cell.forward(&lstm_in, prev, norm_step, train)
    }
}

#[derive(Debug)]
pub struct GeneratorNetwork {
    pub cores: StepModules<GeneratorCore>,
    pub priors: StepModules<PriorHead>,
    pub downsampler: ConvDownsampler,
    pub upsamplers: StepModules<SubPixelUpsampler>,
    pub final_upsampler: SubPixelUpsampler,
    norm_per_step: bool,
}

impl GeneratorNetwork {
    pub fn new(vs: nn::Path, hp: &HyperParameters) -> Result<Self> {
        let policy = hp.sharing_policy();
        let steps = hp.generation_steps;
        let chz = hp.chz_channels;
        let canvas_channels = hp.generator_downsampler_channels;

        // a shared core still normalises each step separately
        let norm_steps = match (hp.batch_normalization_enabled, hp.generator_share_core) {
            (false, _) => 0,
            (true, true) => steps,
            (true, false) => 1,
        };
        let lstm_cfg = ConvLstmConfig { norm_steps, ..Default::default() };

        let vs_cores = &vs / "core";
        let cores = StepModules::build(Role::GeneratorCore, &policy, steps, |index| {
            GeneratorCore::new(&vs_cores / index, chz, canvas_channels, lstm_cfg)
        })?;
        let vs_priors = &vs / "prior";
        let priors = StepModules::build(Role::GeneratorPrior, &policy, steps, |index| {
            PriorHead::new(&vs_priors / index, chz)
        })?;
        let downsampler = ConvDownsampler::new(&vs / "downsampler", 3, canvas_channels);
        let vs_upsamplers = &vs / "upsampler";
        let upsamplers = StepModules::build(Role::GeneratorUpsampler, &policy, steps, |index| {
            SubPixelUpsampler::new(&vs_upsamplers / index, chz, 3, SCALE)
        })?;
        let final_upsampler = SubPixelUpsampler::new(&vs / "final_upsampler", chz, 6, SCALE);
        Ok(Self {
            cores,
            priors,
            downsampler,
            upsamplers,
            final_upsampler,
            norm_per_step: hp.batch_normalization_enabled && hp.generator_share_core,
        })
    }

    pub fn norm_step(&self, step: usize) -> usize {
        if self.norm_per_step {
            step
        } else {
            0
        }
    }

    /// Canvas increment for a regular step.
    pub fn canvas_increment(&self, step: usize, h: &Tensor) -> Result<Tensor> {
        self.upsamplers.resolve(step)?.upsample(h)
    }

    /// Terminal transition: splits the final upsampler output into the pixel
    /// mean, offset by the canvas accumulated so far, and the pixel ln_var.
    pub fn finalize(&self, h: &Tensor, r: &Tensor) -> Result<(Tensor, Tensor)> {
        let x_param = self.final_upsampler.upsample(h)?;
        let mean_x = x_param.narrow(1, 0, 3) + r;
        let ln_var_x = x_param.narrow(1, 3, 3);
        Ok((mean_x, ln_var_x))
    }
}
