use std::path::PathBuf;

use clap::Parser;
use conv_draw::{utils, ConvDrawModel, HyperParameters};
use tch::{IndexOp, Tensor};
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(long, default_value = "snapshots")]
    snapshot_directory: PathBuf,

    /// Base name of the written images; sample and step indices are inserted
    /// before the extension.
    #[arg(long, default_value = "./generated.png")]
    output: String,

    #[arg(long, default_value_t = 4)]
    num_samples: i64,

    /// Also write the canvas after every intermediate step.
    #[arg(long)]
    intermediary_images: bool,

    #[arg(long, default_value_t = 9527)]
    seed: i64,

    #[arg(long)]
    tracing: bool,
}

fn save_batch(images: &Tensor, output: &str, num_samples: i64, step_idx: Option<usize>) -> anyhow::Result<()> {
    let images = utils::to_uint8_image(images);
    for idx in 0..num_samples {
        let filename = utils::output_filename(output, idx + 1, num_samples, step_idx);
        tch::vision::image::save(&images.i(idx), &filename)?;
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _guard = utils::init_tracing(args.tracing);
    tch::manual_seed(args.seed);
    let device = utils::get_device();

    let hyperparams = HyperParameters::from_snapshot(&args.snapshot_directory)?;
    let model = ConvDrawModel::new_with_snapshot(hyperparams, device, &args.snapshot_directory)?;

    let unroll = tch::no_grad(|| model.sample_image_at_each_step_from_prior(args.num_samples))?;
    if args.intermediary_images {
        for (step, canvas) in unroll.canvases.iter().enumerate() {
            save_batch(canvas, &args.output, args.num_samples, Some(step + 1))?;
        }
    }
    save_batch(&unroll.pixel.mean_x, &args.output, args.num_samples, None)?;
    info!(output = %args.output, samples = args.num_samples, "images written");
    Ok(())
}
