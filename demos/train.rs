use std::{fs, path::PathBuf};

use anyhow::Context;
use clap::Parser;
use conv_draw::{
    dataset::ImageDataset, trainer::Trainer, utils, ConvDrawModel, HyperParameters,
    NllVariance,
};
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory of `.npy` files holding `[n, h, w, 3]` uint8 images.
    #[arg(long)]
    dataset_path: PathBuf,

    /// Where weights and hyperparameters are written, and resumed from.
    #[arg(long, default_value = "snapshots")]
    snapshot_directory: PathBuf,

    /// Optional TOML file with hyperparameters. Ignored when the snapshot
    /// directory already holds some.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value_t = 36)]
    batch_size: i64,

    #[arg(long, default_value_t = 1000)]
    epochs: usize,

    #[arg(long, default_value_t = 500)]
    snapshot_every: usize,

    #[arg(long, default_value_t = 12)]
    generation_steps: usize,

    #[arg(long, default_value_t = 64)]
    chz_channels: i64,

    #[arg(long, default_value_t = 12)]
    generator_downsampler_channels: i64,

    #[arg(long, default_value_t = 12)]
    inference_downsampler_channels: i64,

    #[arg(long)]
    generator_share_core: bool,

    #[arg(long)]
    generator_share_prior: bool,

    #[arg(long)]
    generator_share_upsampler: bool,

    #[arg(long)]
    inference_share_core: bool,

    #[arg(long)]
    inference_share_posterior: bool,

    #[arg(long)]
    batch_normalization: bool,

    /// Stop gradients from flowing through the residual `x - r`.
    #[arg(long)]
    no_backprop_diff_xr: bool,

    /// Use the predicted pixel variance instead of the annealed one.
    #[arg(long)]
    predicted_variance: bool,

    #[arg(long, default_value_t = 5e-4)]
    initial_lr: f64,

    #[arg(long, default_value_t = 5e-5)]
    final_lr: f64,

    #[arg(long, default_value_t = 1.6e6)]
    lr_n: f64,

    #[arg(long, default_value_t = 2.0)]
    initial_pixel_sigma: f64,

    #[arg(long, default_value_t = 0.7)]
    final_pixel_sigma: f64,

    #[arg(long, default_value_t = 2e5)]
    pixel_n: f64,

    #[arg(long, default_value_t = 0)]
    seed: i64,

    /// Write a chrome trace to the working directory.
    #[arg(long)]
    tracing: bool,
}

impl Args {
    fn hyperparams(&self, image_size: [i64; 2]) -> anyhow::Result<HyperParameters> {
        if let Some(path) = &self.config {
            return HyperParameters::from_file(path)
                .with_context(|| format!("error reading {:?}", path.to_string_lossy()));
        }
        let base = HyperParameters::default();
        Ok(HyperParameters {
            image_size,
            chrz_size: [image_size[0] / 4, image_size[1] / 4],
            chz_channels: self.chz_channels,
            generation_steps: self.generation_steps,
            generator_share_core: self.generator_share_core,
            generator_share_prior: self.generator_share_prior,
            generator_share_upsampler: self.generator_share_upsampler,
            generator_downsampler_channels: self.generator_downsampler_channels,
            inference_share_core: self.inference_share_core,
            inference_share_posterior: self.inference_share_posterior,
            inference_downsampler_channels: self.inference_downsampler_channels,
            batch_normalization_enabled: self.batch_normalization,
            no_backprop_diff_xr: self.no_backprop_diff_xr,
            nll_variance: if self.predicted_variance {
                NllVariance::Predicted
            } else {
                NllVariance::Scheduled
            },
            pixel_sigma_i: self.initial_pixel_sigma,
            pixel_sigma_f: self.final_pixel_sigma,
            pixel_n: self.pixel_n,
            lr_i: self.initial_lr,
            lr_f: self.final_lr,
            lr_n: self.lr_n,
            ..base
        })
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _guard = utils::init_tracing(args.tracing);
    tch::manual_seed(args.seed);
    let device = utils::get_device();
    info!(?device, "training");

    let dataset = ImageDataset::from_npy_dir(&args.dataset_path)?;
    let (train, dev) = dataset.split(0.9);
    let size = train.images().size();
    info!(train = train.len(), dev = dev.len(), "split dataset");

    fs::create_dir_all(&args.snapshot_directory)?;
    let stored = HyperParameters::from_snapshot_if_present(&args.snapshot_directory).with_context(|| {
        format!("error reading hyperparameters from {:?}", args.snapshot_directory.to_string_lossy())
    })?;
    let hyperparams = match stored {
        Some(hp) => {
            info!("resuming with stored hyperparameters");
            hp
        }
        None => args.hyperparams([size[2], size[3]])?,
    };
    hyperparams.validate()?;
    hyperparams.save(&args.snapshot_directory)?;

    let model = ConvDrawModel::new_with_snapshot(hyperparams, device, &args.snapshot_directory)?;
    let mut trainer = Trainer::new(model)?;
    for epoch in 1..=args.epochs {
        let summary = trainer.train_epoch(
            &train,
            args.batch_size,
            device,
            Some(args.snapshot_directory.as_path()),
            args.snapshot_every,
        )?;
        info!(
            epoch,
            nll_per_pixel = summary.mean_nll_per_pixel,
            kld = summary.mean_kld,
            updates = trainer.num_updates(),
            "epoch"
        );
    }
    Ok(())
}
