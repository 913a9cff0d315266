use tch::{nn, Device, Kind, Tensor};
use tracing_chrome::{ChromeLayerBuilder, FlushGuard};
use tracing_subscriber::prelude::*;

use crate::error::{ConvDrawError, Result};

/// Mps when available, then cuda, then cpu.
pub fn get_device() -> Device {
    if tch::utils::has_mps() {
        Device::Mps
    } else {
        Device::cuda_if_available()
    }
}

/// Gain applied on top of He initialisation for every convolution weight.
pub const INIT_SCALE: f64 = 0.1;

/// `N(0, (scale * sqrt(2 / fan_in))^2)` for a conv with `in_channels` inputs
/// and a square `kernel_size` kernel.
pub fn he_normal(in_channels: i64, kernel_size: i64, scale: f64) -> nn::Init {
    let fan_in = (in_channels * kernel_size * kernel_size) as f64;
    nn::Init::Randn { mean: 0., stdev: scale * (2. / fan_in).sqrt() }
}

/// Installs the fmt subscriber, plus a chrome trace layer when `chrome` is set.
/// The returned guard flushes the trace file when dropped.
pub fn init_tracing(chrome: bool) -> Option<FlushGuard> {
    let (chrome_layer, guard) = if chrome {
        let (layer, guard) = ChromeLayerBuilder::new().build();
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(chrome_layer)
        .init();
    guard
}

/// `generated.png` -> `generated.3.png` for sample 3, and `generated.3-5.png`
/// for the canvas after step 5.
pub fn output_filename(
    basename: &str,
    sample_idx: i64,
    num_samples: i64,
    step_idx: Option<usize>,
) -> String {
    let filename = if num_samples > 1 {
        match basename.rsplit_once('.') {
            None => format!("{basename}.{sample_idx}.png"),
            Some((filename_no_extension, extension)) => {
                format!("{filename_no_extension}.{sample_idx}.{extension}")
            }
        }
    } else {
        basename.to_string()
    };
    match step_idx {
        None => filename,
        Some(step_idx) => match filename.rsplit_once('.') {
            None => format!("{filename}-{step_idx}.png"),
            Some((filename_no_extension, extension)) => {
                format!("{filename_no_extension}-{step_idx}.{extension}")
            }
        },
    }
}

/// Maps an image in `[-1, 1]` to `u8` pixels.
pub fn to_uint8_image(xs: &Tensor) -> Tensor {
    ((xs + 1.) * 0.5 * 255.).clamp(0., 255.).to_device(Device::Cpu).to_kind(Kind::Uint8)
}

pub fn count_nan(xs: &Tensor) -> Result<i64> {
    let num = i64::try_from(&xs.isnan().sum(Kind::Int64))?;
    Ok(num)
}

pub fn has_nan(xs: &Tensor) -> Result<bool> {
    Ok(count_nan(xs)? > 0)
}

/// Rejects anything that is not `[batch, channels, h, w]` with the expected
/// channel count.
pub fn check_channels(xs: &Tensor, expected: i64, context: &str) -> Result<()> {
    let size = xs.size();
    if size.len() != 4 || size[1] != expected {
        return Err(ConvDrawError::ShapeMismatch {
            context: context.to_string(),
            expected: vec![-1, expected, -1, -1],
            actual: size,
        });
    }
    Ok(())
}

pub fn check_same_shape(lhs: &Tensor, rhs: &Tensor, context: &str) -> Result<()> {
    let (l, r) = (lhs.size(), rhs.size());
    if l != r {
        return Err(ConvDrawError::ShapeMismatch {
            context: context.to_string(),
            expected: l,
            actual: r,
        });
    }
    Ok(())
}

/// Channel-axis concatenation that refuses to broadcast: every input must be
/// 4-D and agree on batch and spatial dims.
pub fn concat_channels(xs: &[&Tensor], context: &str) -> Result<Tensor> {
    let reference = match xs.first() {
        Some(first) => first.size(),
        None => return Err(ConvDrawError::InvalidConfig(format!("{context}: nothing to concatenate"))),
    };
    for t in xs.iter() {
        let size = t.size();
        if size.len() != 4
            || reference.len() != 4
            || size[0] != reference[0]
            || size[2] != reference[2]
            || size[3] != reference[3]
        {
            return Err(ConvDrawError::ShapeMismatch {
                context: context.to_string(),
                expected: vec![reference[0], -1, reference[2], reference[3]],
                actual: size,
            });
        }
    }
    Ok(Tensor::cat(xs, 1))
}
