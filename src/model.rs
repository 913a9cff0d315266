//! # Convolutional DRAW
//!
//! Two coupled ConvLSTM recurrences refine an image canvas over a fixed number
//! of steps. At every step the generator consumes a latent `z_t` and the
//! downsampled canvas, and its hidden state is upsampled into a canvas
//! increment. During training `z_t` comes from the posterior of an inference
//! recurrence that sees the target image and the residual `x - r_t`; during
//! generation it comes from the prior, which only sees generator history.
//!
//! The last step is a terminal transition: its upsampler emits six channels,
//! the pixel mean (added to the canvas so far) and the pixel log-variance.
use std::{collections::HashMap, fs, path::Path};

use tch::{nn, Device, Kind, Tensor};
use tracing::{debug, info, warn};

use crate::{
    config::HyperParameters,
    distribution::DiagonalGaussian,
    error::{ConvDrawError, Result},
    generator::GeneratorNetwork,
    inference::InferenceNetwork,
    loss::gaussian_kl_divergence,
    lstm::LstmState,
    utils::check_channels,
};

pub const MODEL_FILENAME: &str = "model.safetensors";

/// Posterior and prior parameters of the latent at one step.
#[derive(Debug)]
pub struct StepLatentParams {
    pub mean_q: Tensor,
    pub ln_var_q: Tensor,
    pub mean_p: Tensor,
    pub ln_var_p: Tensor,
}

impl StepLatentParams {
    pub fn new(posterior: DiagonalGaussian, prior: DiagonalGaussian) -> Self {
        let (mean_q, ln_var_q) = posterior.into_parts();
        let (mean_p, ln_var_p) = prior.into_parts();
        Self { mean_q, ln_var_q, mean_p, ln_var_p }
    }

    pub fn kl_divergence(&self) -> Tensor {
        gaussian_kl_divergence(&self.mean_q, &self.ln_var_q, &self.mean_p, &self.ln_var_p)
    }
}

/// Pixel distribution produced by the terminal step, `[batch, 3, h, w]` each.
#[derive(Debug)]
pub struct PixelParams {
    pub mean_x: Tensor,
    pub ln_var_x: Tensor,
}

/// Result of one unroll.
///
/// `latent_params` has one entry per executed step when a posterior drove the
/// latents and is empty for prior-only generation. `canvases` holds the canvas
/// after every non-terminal step.
#[derive(Debug)]
pub struct Unroll {
    pub latent_params: Vec<StepLatentParams>,
    pub pixel: PixelParams,
    pub canvases: Vec<Tensor>,
}

/// What the inference side needs at every step, computed once per unroll.
struct Evidence<'a> {
    x: &'a Tensor,
    downsampled_x: Tensor,
    zero_variance: bool,
}

struct UnrollState {
    gen: LstmState,
    enc: LstmState,
    r: Tensor,
    latent_params: Vec<StepLatentParams>,
    canvases: Vec<Tensor>,
}

pub struct ConvDrawModel {
    vs: nn::VarStore,
    pub generator: GeneratorNetwork,
    pub inference: InferenceNetwork,
    hyperparams: HyperParameters,
}

impl ConvDrawModel {
    pub fn new(hyperparams: HyperParameters, device: Device) -> Result<Self> {
        hyperparams.validate()?;
        let vs = nn::VarStore::new(device);
        let generator = GeneratorNetwork::new(&vs.root() / "generator", &hyperparams)?;
        let inference = InferenceNetwork::new(&vs.root() / "inference", &hyperparams)?;
        let model = Self { vs, generator, inference, hyperparams };
        info!(
            parameters = model.num_parameters(),
            generation_steps = model.hyperparams.generation_steps,
            sharing = ?model.hyperparams.sharing_policy(),
            "built conv draw model"
        );
        Ok(model)
    }

    /// Builds the model and restores `model.safetensors` from
    /// `snapshot_directory` when present. A snapshot that cannot be read is
    /// logged and the fresh initialisation is kept.
    pub fn new_with_snapshot<T: AsRef<Path>>(
        hyperparams: HyperParameters,
        device: Device,
        snapshot_directory: T,
    ) -> Result<Self> {
        let mut model = Self::new(hyperparams, device)?;
        let dir = snapshot_directory.as_ref();
        let path = dir.join(MODEL_FILENAME);
        if !path.is_file() {
            info!(path = %path.display(), "no snapshot found, starting from fresh weights");
            return Ok(model);
        }
        match model.load(dir) {
            Ok(()) => info!(path = %path.display(), "loaded snapshot"),
            Err(err) => warn!(path = %path.display(), %err, "could not load snapshot, keeping fresh weights"),
        }
        Ok(model)
    }

    pub fn hyperparams(&self) -> &HyperParameters {
        &self.hyperparams
    }

    pub fn device(&self) -> Device {
        self.vs.device()
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    pub fn var_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.vs
    }

    pub fn variables(&self) -> HashMap<String, Tensor> {
        self.vs.variables()
    }

    pub fn num_parameters(&self) -> usize {
        self.vs.trainable_variables().iter().map(|t| t.numel()).sum()
    }

    pub fn zero_grad(&self) {
        for mut var in self.vs.trainable_variables() {
            var.zero_grad();
        }
    }

    /// Writes every weight to `model.safetensors`, going through a temporary
    /// file in the same directory so the previous snapshot survives a crash.
    pub fn save<T: AsRef<Path>>(&self, snapshot_directory: T) -> Result<()> {
        let dir = snapshot_directory.as_ref();
        fs::create_dir_all(dir)?;
        let tmp = dir.join(format!("model.{}.tmp.safetensors", std::process::id()));
        self.vs.save(&tmp)?;
        fs::rename(&tmp, dir.join(MODEL_FILENAME))?;
        debug!(dir = %dir.display(), "saved snapshot");
        Ok(())
    }

    /// Restores weights from `model.safetensors`. Every variable is checked
    /// for presence and shape before anything is copied, so a failed load
    /// leaves the current weights untouched.
    pub fn load<T: AsRef<Path>>(&mut self, snapshot_directory: T) -> Result<()> {
        let path = snapshot_directory.as_ref().join(MODEL_FILENAME);
        let named: HashMap<String, Tensor> = Tensor::read_safetensors(&path)?.into_iter().collect();
        let variables = self.vs.variables();
        for (name, var) in variables.iter() {
            match named.get(name) {
                Some(value) if value.size() == var.size() => {}
                Some(value) => {
                    return Err(ConvDrawError::Snapshot(format!(
                        "{name}: expected shape {:?}, found {:?}",
                        var.size(),
                        value.size()
                    )))
                }
                None => return Err(ConvDrawError::Snapshot(format!("{name} is missing"))),
            }
        }
        tch::no_grad(|| {
            for (name, mut var) in variables {
                if let Some(value) = named.get(&name) {
                    var.copy_(value);
                }
            }
        });
        Ok(())
    }

    /// Training pass: latents come from the posterior, every step records its
    /// posterior and prior parameters for the KL term. Canvases keep their
    /// gradient history.
    #[tracing::instrument(name = "posterior-unroll", skip_all)]
    pub fn sample_z_and_x_params_from_posterior(&self, x: &Tensor) -> Result<Unroll> {
        let evidence = self.evidence(x, false)?;
        self.unroll(Some(&evidence), x.size()[0], self.hyperparams.generation_steps, true, false)
    }

    /// Unconditional generation. No inference module runs and no image is
    /// read, so `latent_params` stays empty.
    #[tracing::instrument(name = "prior-unroll", skip_all)]
    pub fn sample_image_at_each_step_from_prior(&self, batch_size: i64) -> Result<Unroll> {
        if batch_size <= 0 {
            return Err(ConvDrawError::InvalidConfig(format!("batch size {batch_size} must be positive")));
        }
        self.unroll(None, batch_size, self.hyperparams.generation_steps, false, true)
    }

    /// Posterior-driven canvas trace for inspection. `step_limit` stops early
    /// and makes its last step the terminal one; `zero_variance` replaces
    /// posterior samples with posterior means.
    #[tracing::instrument(name = "posterior-trace", skip_all)]
    pub fn sample_image_at_each_step_from_posterior(
        &self,
        x: &Tensor,
        zero_variance: bool,
        step_limit: Option<usize>,
    ) -> Result<Unroll> {
        let steps = self.hyperparams.generation_steps;
        let step_limit = step_limit.unwrap_or(steps);
        if step_limit == 0 || step_limit > steps {
            return Err(ConvDrawError::StepOutOfRange { step: step_limit, steps });
        }
        let evidence = self.evidence(x, zero_variance)?;
        self.unroll(Some(&evidence), x.size()[0], step_limit, false, true)
    }

    fn evidence<'a>(&self, x: &'a Tensor, zero_variance: bool) -> Result<Evidence<'a>> {
        check_channels(x, 3, "input image")?;
        let [h, w] = self.hyperparams.image_size;
        let size = x.size();
        if size[2] != h || size[3] != w {
            return Err(ConvDrawError::ShapeMismatch {
                context: "input image".to_string(),
                expected: vec![size[0], 3, h, w],
                actual: size,
            });
        }
        let downsampled_x = self.inference.downsampler_x.downsample(x)?;
        Ok(Evidence { x, downsampled_x, zero_variance })
    }

    fn initial_state(&self, batch_size: i64) -> UnrollState {
        let hp = &self.hyperparams;
        let device = self.device();
        UnrollState {
            gen: LstmState::zeros(batch_size, hp.chz_channels, hp.chrz_size, device),
            enc: LstmState::zeros(batch_size, hp.chz_channels, hp.chrz_size, device),
            r: Tensor::zeros([batch_size, 3, hp.image_size[0], hp.image_size[1]], (Kind::Float, device)),
            latent_params: Vec::with_capacity(hp.generation_steps),
            canvases: Vec::with_capacity(hp.generation_steps),
        }
    }

    fn unroll(
        &self,
        evidence: Option<&Evidence<'_>>,
        batch_size: i64,
        step_limit: usize,
        train: bool,
        detach_canvases: bool,
    ) -> Result<Unroll> {
        let mut state = self.initial_state(batch_size);
        let last = step_limit - 1;
        for t in 0..last {
            let next_gen = self.advance(t, evidence, &mut state, train)?;
            let r = &state.r + self.generator.canvas_increment(t, &next_gen.h)?;
            state.canvases.push(if detach_canvases { r.detach() } else { r.shallow_clone() });
            state.r = r;
            state.gen = next_gen;
        }
        let next_gen = self.advance(last, evidence, &mut state, train)?;
        let (mean_x, ln_var_x) = self.generator.finalize(&next_gen.h, &state.r)?;
        Ok(Unroll {
            latent_params: state.latent_params,
            pixel: PixelParams { mean_x, ln_var_x },
            canvases: state.canvases,
        })
    }

    /// Draws `z_t` and returns the generator state after step `t`. The
    /// inference state and the latent record are updated in place; the
    /// generator state and canvas are left for the caller to replace.
    fn advance(
        &self,
        t: usize,
        evidence: Option<&Evidence<'_>>,
        state: &mut UnrollState,
        train: bool,
    ) -> Result<LstmState> {
        let z = match evidence {
            Some(evidence) => {
                let diff_xr = evidence.x - &state.r;
                let diff_xr = if self.hyperparams.no_backprop_diff_xr { diff_xr.detach() } else { diff_xr };
                let downsampled_diff_xr = self.inference.downsampler_diff_xr.downsample(&diff_xr)?;
                let next_enc = self.inference.cores.resolve(t)?.forward_onestep(
                    &state.gen.h,
                    &state.enc,
                    &evidence.downsampled_x,
                    &downsampled_diff_xr,
                    self.inference.norm_step(t),
                    train,
                )?;
                let posterior = self.inference.posteriors.resolve(t)?.distribution(&next_enc.h)?;
                // the prior only ever sees the generator state before this step
                let prior = self.generator.priors.resolve(t)?.distribution(&state.gen.h)?;
                let z = posterior.sample_or_mean(evidence.zero_variance);
                state.latent_params.push(StepLatentParams::new(posterior, prior));
                state.enc = next_enc;
                z
            }
            None => self.generator.priors.resolve(t)?.sample_z(&state.gen.h)?,
        };
        let downsampled_r = self.generator.downsampler.downsample(&state.r)?;
        let next_gen = self.generator.cores.resolve(t)?.forward_onestep(
            &state.gen,
            &z,
            &downsampled_r,
            self.generator.norm_step(t),
            train,
        )?;
        debug!(step = t, posterior = evidence.is_some(), "advanced recurrence");
        Ok(next_gen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> HyperParameters {
        HyperParameters {
            image_size: [16, 16],
            chrz_size: [4, 4],
            chz_channels: 4,
            generation_steps: 4,
            generator_downsampler_channels: 3,
            inference_downsampler_channels: 3,
            ..Default::default()
        }
    }

    #[test]
    fn test_posterior_unroll_shapes() {
        let model = ConvDrawModel::new(small(), Device::Cpu).unwrap();
        let x = Tensor::randn([2, 3, 16, 16], (Kind::Float, Device::Cpu));
        let unroll = model.sample_z_and_x_params_from_posterior(&x).unwrap();
        assert_eq!(unroll.latent_params.len(), 4);
        assert_eq!(unroll.canvases.len(), 3);
        assert_eq!(unroll.pixel.mean_x.size(), vec![2, 3, 16, 16]);
        assert_eq!(unroll.pixel.ln_var_x.size(), vec![2, 3, 16, 16]);
        for params in unroll.latent_params.iter() {
            assert_eq!(params.mean_q.size(), vec![2, 4, 4, 4]);
            assert_eq!(params.ln_var_p.size(), vec![2, 4, 4, 4]);
        }
    }

    #[test]
    fn test_prior_unroll_has_no_latent_params() {
        let model = ConvDrawModel::new(small(), Device::Cpu).unwrap();
        let unroll = model.sample_image_at_each_step_from_prior(3).unwrap();
        assert!(unroll.latent_params.is_empty());
        assert_eq!(unroll.canvases.len(), 3);
        assert_eq!(unroll.pixel.mean_x.size(), vec![3, 3, 16, 16]);
        assert!(unroll.canvases.iter().all(|c| !c.requires_grad()));
        assert!(model.sample_image_at_each_step_from_prior(0).is_err());
    }

    #[test]
    fn test_step_limit_terminates_early() {
        let model = ConvDrawModel::new(small(), Device::Cpu).unwrap();
        let x = Tensor::randn([1, 3, 16, 16], (Kind::Float, Device::Cpu));
        let unroll = model.sample_image_at_each_step_from_posterior(&x, false, Some(2)).unwrap();
        assert_eq!(unroll.canvases.len(), 1);
        assert_eq!(unroll.latent_params.len(), 2);
        assert_eq!(unroll.pixel.mean_x.size(), vec![1, 3, 16, 16]);

        let unroll = model.sample_image_at_each_step_from_posterior(&x, false, Some(1)).unwrap();
        assert!(unroll.canvases.is_empty());

        assert!(matches!(
            model.sample_image_at_each_step_from_posterior(&x, false, Some(5)),
            Err(ConvDrawError::StepOutOfRange { step: 5, steps: 4 })
        ));
        assert!(model.sample_image_at_each_step_from_posterior(&x, false, Some(0)).is_err());
    }

    #[test]
    fn test_rejects_wrong_image_shape() {
        let model = ConvDrawModel::new(small(), Device::Cpu).unwrap();
        let x = Tensor::randn([1, 3, 32, 32], (Kind::Float, Device::Cpu));
        assert!(matches!(
            model.sample_z_and_x_params_from_posterior(&x),
            Err(ConvDrawError::ShapeMismatch { .. })
        ));
        let x = Tensor::randn([1, 1, 16, 16], (Kind::Float, Device::Cpu));
        assert!(model.sample_z_and_x_params_from_posterior(&x).is_err());
    }

    // mean_q at step 1 reaches the first upsampler only through x - r_1
    fn upsampler_grad_through_residual(no_backprop_diff_xr: bool) -> f64 {
        let hp = HyperParameters { no_backprop_diff_xr, ..small() };
        let model = ConvDrawModel::new(hp, Device::Cpu).unwrap();
        let x = Tensor::randn([2, 3, 16, 16], (Kind::Float, Device::Cpu));
        let unroll = model.sample_z_and_x_params_from_posterior(&x).unwrap();
        unroll.latent_params[1].mean_q.sum(Kind::Float).backward();
        let grad = model.variables()["generator.upsampler.0.conv.weight"].grad();
        if !grad.defined() {
            return 0.;
        }
        f64::try_from(&grad.abs().sum(Kind::Float)).unwrap()
    }

    #[test]
    fn test_no_backprop_diff_xr_stops_residual_gradient() {
        assert!(upsampler_grad_through_residual(false) > 0.);
        assert_eq!(upsampler_grad_through_residual(true), 0.);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let dir = std::env::temp_dir().join(format!("conv-draw-model-{}", std::process::id()));
        let source = ConvDrawModel::new(small(), Device::Cpu).unwrap();
        source.save(&dir).unwrap();
        assert!(dir.join(MODEL_FILENAME).is_file());

        let mut target = ConvDrawModel::new(small(), Device::Cpu).unwrap();
        target.load(&dir).unwrap();
        let expected = source.variables();
        for (name, var) in target.variables() {
            assert!(var.equal(&expected[&name]), "{name} differs after load");
        }
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_incompatible_snapshot_keeps_fresh_weights() {
        let dir = std::env::temp_dir().join(format!("conv-draw-mismatch-{}", std::process::id()));
        let other = ConvDrawModel::new(HyperParameters { chz_channels: 6, ..small() }, Device::Cpu).unwrap();
        other.save(&dir).unwrap();

        let mut model = ConvDrawModel::new(small(), Device::Cpu).unwrap();
        let before: HashMap<String, Tensor> =
            model.variables().into_iter().map(|(k, v)| (k, v.copy())).collect();
        assert!(matches!(model.load(&dir), Err(ConvDrawError::Snapshot(_))));
        for (name, var) in model.variables() {
            assert!(var.equal(&before[&name]));
        }

        let model = ConvDrawModel::new_with_snapshot(small(), Device::Cpu, &dir).unwrap();
        assert_eq!(model.num_parameters(), ConvDrawModel::new(small(), Device::Cpu).unwrap().num_parameters());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_snapshot_is_not_fatal() {
        let dir = std::env::temp_dir().join("conv-draw-does-not-exist");
        assert!(ConvDrawModel::new_with_snapshot(small(), Device::Cpu, &dir).is_ok());
    }
}
