//! Inference side: the recurrent core that reads the target image and the
//! canvas residual, and the posterior heads on top of it.
use tch::{nn, Tensor};

use crate::{
    config::HyperParameters,
    distribution::PosteriorHead,
    error::Result,
    lstm::{ConvLstmCell, ConvLstmConfig, LstmState},
    sampler::ConvDownsampler,
    sharing::{Role, StepModules},
    utils::concat_channels,
};

/// ConvLSTM fed with `concat(h_gen, h_enc, downsampled x, downsampled x - r)`.
#[derive(Debug)]
pub struct InferenceCore {
    cell: ConvLstmCell,
}

impl InferenceCore {
    pub fn new(vs: nn::Path, chz_channels: i64, feature_channels: i64, config: ConvLstmConfig) -> Self {
        let in_channels = 2 * chz_channels + 2 * feature_channels;
        Self { cell: ConvLstmCell::new(vs, in_channels, chz_channels, config) }
    }

    pub fn forward_onestep(
        &self,
        prev_h_gen: &Tensor,
        prev: &LstmState,
        downsampled_x: &Tensor,
        downsampled_diff_xr: &Tensor,
        norm_step: usize,
        train: bool,
    ) -> Result<LstmState> {
        let lstm_in = concat_channels(
            &[prev_h_gen, &prev.h, downsampled_x, downsampled_diff_xr],
            "inference core input",
        )?;
        self.cell.forward(&lstm_in, prev, norm_step, train)
    }
}

#[derive(Debug)]
pub struct InferenceNetwork {
    pub cores: StepModules<InferenceCore>,
    pub posteriors: StepModules<PosteriorHead>,
    pub downsampler_x: ConvDownsampler,
    pub downsampler_diff_xr: ConvDownsampler,
    norm_per_step: bool,
}

impl InferenceNetwork {
    pub fn new(vs: nn::Path, hp: &HyperParameters) -> Result<Self> {
        let policy = hp.sharing_policy();
        let steps = hp.generation_steps;
        let chz = hp.chz_channels;
        let feature_channels = hp.inference_downsampler_channels;

        let norm_steps = match (hp.batch_normalization_enabled, hp.inference_share_core) {
            (false, _) => 0,
            (true, true) => steps,
            (true, false) => 1,
        };
        let lstm_cfg = ConvLstmConfig { norm_steps, ..Default::default() };

        let vs_cores = &vs / "core";
        let cores = StepModules::build(Role::InferenceCore, &policy, steps, |index| {
            InferenceCore::new(&vs_cores / index, chz, feature_channels, lstm_cfg)
        })?;
        let vs_posteriors = &vs / "posterior";
        let posteriors = StepModules::build(Role::InferencePosterior, &policy, steps, |index| {
            PosteriorHead::new(&vs_posteriors / index, chz)
        })?;
        let downsampler_x = ConvDownsampler::new(&vs / "downsampler_x", 3, feature_channels);
        let downsampler_diff_xr = ConvDownsampler::new(&vs / "downsampler_diff_xr", 3, feature_channels);
        Ok(Self {
            cores,
            posteriors,
            downsampler_x,
            downsampler_diff_xr,
            norm_per_step: hp.batch_normalization_enabled && hp.inference_share_core,
        })
    }

    pub fn norm_step(&self, step: usize) -> usize {
        if self.norm_per_step {
            step
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    fn small() -> HyperParameters {
        HyperParameters {
            image_size: [16, 16],
            chrz_size: [4, 4],
            chz_channels: 4,
            generation_steps: 3,
            generator_downsampler_channels: 5,
            inference_downsampler_channels: 6,
            ..Default::default()
        }
    }

    #[test]
    fn test_core_step() {
        let vs = nn::VarStore::new(Device::Cpu);
        let net = InferenceNetwork::new(vs.root(), &small()).unwrap();
        let x = Tensor::randn([2, 3, 16, 16], (Kind::Float, Device::Cpu));
        let downsampled_x = net.downsampler_x.downsample(&x).unwrap();
        let downsampled_diff = net.downsampler_diff_xr.downsample(&x).unwrap();
        assert_eq!(downsampled_x.size(), vec![2, 6, 4, 4]);
        let h_gen = Tensor::zeros([2, 4, 4, 4], (Kind::Float, Device::Cpu));
        let state = LstmState::zeros(2, 4, [4, 4], Device::Cpu);
        let next = net
            .cores
            .resolve(2)
            .unwrap()
            .forward_onestep(&h_gen, &state, &downsampled_x, &downsampled_diff, 0, false)
            .unwrap();
        assert_eq!(next.h.size(), vec![2, 4, 4, 4]);
        let dist = net.posteriors.resolve(2).unwrap().distribution(&next.h).unwrap();
        assert_eq!(dist.mean.size(), vec![2, 4, 4, 4]);
    }

    #[test]
    fn test_shared_core_gets_per_step_norms() {
        let hp = HyperParameters { inference_share_core: true, batch_normalization_enabled: true, ..small() };
        let vs = nn::VarStore::new(Device::Cpu);
        let net = InferenceNetwork::new(vs.root(), &hp).unwrap();
        assert_eq!(net.cores.len(), 1);
        assert_eq!(net.norm_step(2), 2);
        let norms = vs
            .variables()
            .keys()
            .filter(|name| name.starts_with("core.0.norms.") && name.ends_with(".weight"))
            .count();
        assert_eq!(norms, 3);
    }
}
