//! Moves between image resolution and the recurrent feature map, a fixed
//! factor of 4 in each direction.
use tch::{nn, Tensor};

use crate::{
    error::Result,
    utils::{check_channels, he_normal, INIT_SCALE},
};

pub const SCALE: i64 = 4;

/// Two stride-2 convolutions around a 3x3 one: `[b, c, h, w]` to
/// `[b, channels, h / 4, w / 4]`.
#[derive(Debug)]
pub struct ConvDownsampler {
    conv_1: nn::Conv2D,
    conv_2: nn::Conv2D,
    conv_3: nn::Conv2D,
    in_channels: i64,
}

impl ConvDownsampler {
    pub fn new(vs: nn::Path, in_channels: i64, channels: i64) -> Self {
        let strided = |fan_in| nn::ConvConfig {
            stride: 2,
            padding: 0,
            ws_init: he_normal(fan_in, 2, INIT_SCALE),
            ..Default::default()
        };
        let same = nn::ConvConfig {
            stride: 1,
            padding: 1,
            ws_init: he_normal(channels, 3, INIT_SCALE),
            ..Default::default()
        };
        let conv_1 = nn::conv2d(&vs / "conv_1", in_channels, channels, 2, strided(in_channels));
        let conv_2 = nn::conv2d(&vs / "conv_2", channels, channels, 3, same);
        let conv_3 = nn::conv2d(&vs / "conv_3", channels, channels, 2, strided(channels));
        Self { conv_1, conv_2, conv_3, in_channels }
    }

    pub fn downsample(&self, xs: &Tensor) -> Result<Tensor> {
        check_channels(xs, self.in_channels, "downsampler input")?;
        Ok(xs
            .apply(&self.conv_1)
            .relu()
            .apply(&self.conv_2)
            .relu()
            .apply(&self.conv_3))
    }
}

/// Convolution to `out_channels * scale^2` followed by a pixel shuffle, so
/// upsampling is a channel-to-space rearrangement rather than a transposed
/// convolution.
#[derive(Debug)]
pub struct SubPixelUpsampler {
    conv: nn::Conv2D,
    in_channels: i64,
    scale: i64,
}

impl SubPixelUpsampler {
    pub fn new(vs: nn::Path, in_channels: i64, out_channels: i64, scale: i64) -> Self {
        let conv_cfg = nn::ConvConfig {
            stride: 1,
            padding: 1,
            ws_init: he_normal(in_channels, 3, INIT_SCALE),
            ..Default::default()
        };
        let conv = nn::conv2d(&vs / "conv", in_channels, out_channels * scale * scale, 3, conv_cfg);
        Self { conv, in_channels, scale }
    }

    pub fn upsample(&self, h: &Tensor) -> Result<Tensor> {
        check_channels(h, self.in_channels, "upsampler input")?;
        Ok(h.apply(&self.conv).pixel_shuffle(self.scale))
    }
}
