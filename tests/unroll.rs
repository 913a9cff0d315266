use std::sync::{Mutex, MutexGuard};

use conv_draw::{
    loss::{Loss, VarianceSchedule},
    ConvDrawModel, HyperParameters, NllVariance, StepLatentParams,
};
use tch::{Device, Kind, Tensor};

// libtorch's default generator is process-wide, so tests that seed it or
// compare sampled outputs must not interleave.
static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

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

fn image(batch_size: i64, size: i64) -> Tensor {
    Tensor::rand([batch_size, 3, size, size], (Kind::Float, Device::Cpu)) * 2. - 1.
}

#[test]
fn latent_sequence_length_matches_generation_steps() {
    let _guard = serial();
    for steps in [1, 2, 5] {
        for shared in [false, true] {
            let hp = HyperParameters {
                generation_steps: steps,
                generator_share_core: shared,
                generator_share_prior: shared,
                generator_share_upsampler: shared,
                inference_share_core: shared,
                inference_share_posterior: shared,
                ..small()
            };
            let model = ConvDrawModel::new(hp, Device::Cpu).unwrap();
            let x = image(2, 16);
            let posterior = model.sample_z_and_x_params_from_posterior(&x).unwrap();
            assert_eq!(posterior.latent_params.len(), steps);
            assert_eq!(posterior.canvases.len(), steps - 1);
            let prior = model.sample_image_at_each_step_from_prior(2).unwrap();
            assert!(prior.latent_params.is_empty());
            assert_eq!(prior.canvases.len(), steps - 1);
        }
    }
}

#[test]
fn kl_between_identical_step_params_is_zero() {
    let mean = Tensor::randn([3, 4, 4, 4], (Kind::Float, Device::Cpu));
    let ln_var = Tensor::randn([3, 4, 4, 4], (Kind::Float, Device::Cpu));
    let params = StepLatentParams {
        mean_q: mean.copy(),
        ln_var_q: ln_var.copy(),
        mean_p: mean,
        ln_var_p: ln_var,
    };
    let kld = params.kl_divergence();
    assert!(kld.equal(&kld.zeros_like()));
}

#[test]
fn zero_variance_trace_is_deterministic() {
    let _guard = serial();
    let model = ConvDrawModel::new(small(), Device::Cpu).unwrap();
    let x = image(2, 16);
    let a = model.sample_image_at_each_step_from_posterior(&x, true, None).unwrap();
    let b = model.sample_image_at_each_step_from_posterior(&x, true, None).unwrap();
    assert!(a.pixel.mean_x.equal(&b.pixel.mean_x));
    assert!(a.pixel.ln_var_x.equal(&b.pixel.ln_var_x));
    for (ca, cb) in a.canvases.iter().zip(b.canvases.iter()) {
        assert!(ca.equal(cb));
    }
}

#[test]
fn full_step_limit_matches_unlimited_trace() {
    let _guard = serial();
    let model = ConvDrawModel::new(small(), Device::Cpu).unwrap();
    let x = image(2, 16);

    tch::manual_seed(17);
    let unlimited = model.sample_image_at_each_step_from_posterior(&x, false, None).unwrap();
    tch::manual_seed(17);
    let limited = model.sample_image_at_each_step_from_posterior(&x, false, Some(4)).unwrap();
    assert!(unlimited.pixel.mean_x.equal(&limited.pixel.mean_x));
    assert!(unlimited.pixel.ln_var_x.equal(&limited.pixel.ln_var_x));
    assert_eq!(unlimited.canvases.len(), limited.canvases.len());

    // the training pass draws the same noise in the same order
    tch::manual_seed(17);
    let training = model.sample_z_and_x_params_from_posterior(&x).unwrap();
    assert!(training.pixel.mean_x.allclose(&unlimited.pixel.mean_x, 1e-6, 1e-6, false));
}

#[test]
fn prior_generation_is_reproducible_under_seed() {
    let _guard = serial();
    let model = ConvDrawModel::new(small(), Device::Cpu).unwrap();
    tch::manual_seed(3);
    let a = model.sample_image_at_each_step_from_prior(2).unwrap();
    tch::manual_seed(3);
    let b = model.sample_image_at_each_step_from_prior(2).unwrap();
    assert!(a.pixel.mean_x.equal(&b.pixel.mean_x));
    let c = model.sample_image_at_each_step_from_prior(2).unwrap();
    assert!(!a.pixel.mean_x.equal(&c.pixel.mean_x));
}

#[test]
fn prior_sees_only_generator_history() {
    let _guard = serial();
    let model = ConvDrawModel::new(small(), Device::Cpu).unwrap();
    let x = image(2, 16);
    let unroll = model.sample_z_and_x_params_from_posterior(&x).unwrap();
    // at step 0 the generator state is still zero
    let h0 = Tensor::zeros([2, 4, 4, 4], (Kind::Float, Device::Cpu));
    let prior = model.generator.priors.resolve(0).unwrap().distribution(&h0).unwrap();
    assert!(unroll.latent_params[0].mean_p.allclose(&prior.mean, 1e-6, 1e-6, false));
    assert!(unroll.latent_params[0].ln_var_p.allclose(&prior.ln_var, 1e-6, 1e-6, false));
    // the posterior reads the inference state after its update, not the zero state
    let posterior = model.inference.posteriors.resolve(0).unwrap().distribution(&h0).unwrap();
    assert!(!unroll.latent_params[0].mean_q.equal(&posterior.mean));
}

fn shared_name(name: &str) -> String {
    for prefix in ["generator.core.", "inference.core."] {
        if let Some(rest) = name.strip_prefix(prefix) {
            if let Some((_, tail)) = rest.split_once('.') {
                return format!("{prefix}0.{tail}");
            }
        }
    }
    name.to_string()
}

#[test]
fn tied_per_step_cores_match_shared_cores() {
    let _guard = serial();
    let shared_hp = HyperParameters { generator_share_core: true, inference_share_core: true, ..small() };
    let shared = ConvDrawModel::new(shared_hp, Device::Cpu).unwrap();
    let per_step = ConvDrawModel::new(small(), Device::Cpu).unwrap();
    assert!(per_step.num_parameters() > shared.num_parameters());

    let source = shared.variables();
    tch::no_grad(|| {
        for (name, mut var) in per_step.variables() {
            let value = &source[&shared_name(&name)];
            var.copy_(value);
        }
    });

    let x = image(3, 16);
    let a = shared.sample_image_at_each_step_from_posterior(&x, true, None).unwrap();
    let b = per_step.sample_image_at_each_step_from_posterior(&x, true, None).unwrap();
    assert!(a.pixel.mean_x.allclose(&b.pixel.mean_x, 1e-6, 1e-6, false));
    assert!(a.pixel.ln_var_x.allclose(&b.pixel.ln_var_x, 1e-6, 1e-6, false));

    tch::manual_seed(11);
    let a = shared.sample_image_at_each_step_from_prior(3).unwrap();
    tch::manual_seed(11);
    let b = per_step.sample_image_at_each_step_from_prior(3).unwrap();
    assert!(a.pixel.mean_x.allclose(&b.pixel.mean_x, 1e-6, 1e-6, false));
}

#[test]
fn end_to_end_posterior_pass() {
    let _guard = serial();
    let hp = HyperParameters {
        image_size: [64, 64],
        chrz_size: [16, 16],
        chz_channels: 64,
        generation_steps: 8,
        ..Default::default()
    };
    let model = ConvDrawModel::new(hp, Device::Cpu).unwrap();
    let x = image(4, 64);
    let unroll = model.sample_z_and_x_params_from_posterior(&x).unwrap();
    assert_eq!(unroll.pixel.mean_x.size(), vec![4, 3, 64, 64]);
    assert_eq!(unroll.pixel.ln_var_x.size(), vec![4, 3, 64, 64]);
    assert_eq!(unroll.canvases.len(), 7);
    assert_eq!(unroll.latent_params.len(), 8);

    let schedule = model.hyperparams().variance_schedule();
    let loss = Loss::assemble(&x, &unroll, &schedule, 0, NllVariance::Scheduled).unwrap();
    let kld = f64::try_from(&loss.kld).unwrap();
    assert!(kld >= 0.);
    let total = f64::try_from(&loss.total).unwrap();
    let nll = f64::try_from(&loss.nll).unwrap();
    assert!((total - (nll + kld)).abs() <= 1e-3 * total.abs().max(1.));
}

#[test]
fn loss_needs_posterior_latents() {
    let _guard = serial();
    let model = ConvDrawModel::new(small(), Device::Cpu).unwrap();
    let unroll = model.sample_image_at_each_step_from_prior(2).unwrap();
    let x = image(2, 16);
    let schedule = VarianceSchedule::new(2.0, 0.7, 10., 1e-3);
    assert!(Loss::assemble(&x, &unroll, &schedule, 0, NllVariance::Scheduled).is_err());

    let unroll = model.sample_z_and_x_params_from_posterior(&x).unwrap();
    let predicted = Loss::assemble(&x, &unroll, &schedule, 0, NllVariance::Predicted).unwrap();
    assert!(f64::try_from(&predicted.nll).unwrap().is_finite());
    let wrong = image(3, 16);
    assert!(Loss::assemble(&wrong, &unroll, &schedule, 0, NllVariance::Scheduled).is_err());
}

#[test]
fn loss_backpropagates_into_both_networks() {
    let _guard = serial();
    let model = ConvDrawModel::new(small(), Device::Cpu).unwrap();
    let x = image(2, 16);
    let unroll = model.sample_z_and_x_params_from_posterior(&x).unwrap();
    let schedule = model.hyperparams().variance_schedule();
    let loss = Loss::assemble(&x, &unroll, &schedule, 0, NllVariance::Scheduled).unwrap();
    model.zero_grad();
    loss.total.backward();
    let variables = model.variables();
    for name in ["generator.core.0.lstm_i.weight", "inference.posterior.3.mean_z.weight"] {
        let grad = variables[name].grad();
        assert!(grad.defined(), "{name} has no gradient");
        assert!(f64::try_from(&grad.abs().sum(Kind::Float)).unwrap() > 0.);
    }
}
