use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    error::{ConvDrawError, Result},
    loss::VarianceSchedule,
    sharing::SharingPolicy,
};

pub const HYPERPARAMS_FILENAME: &str = "hyperparams.toml";

/// Which variance the pixel likelihood is evaluated under.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NllVariance {
    /// The annealed observation variance owned by the trainer.
    Scheduled,
    /// The network's own `ln_var_x` output.
    Predicted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HyperParameters {
    pub image_size: [i64; 2],
    // needs to be 1/4 of image_size
    pub chrz_size: [i64; 2],
    pub chz_channels: i64,
    pub generation_steps: usize,
    pub generator_share_core: bool,
    pub generator_share_prior: bool,
    pub generator_share_upsampler: bool,
    pub generator_downsampler_channels: i64,
    pub inference_share_core: bool,
    pub inference_share_posterior: bool,
    pub inference_downsampler_channels: i64,
    pub batch_normalization_enabled: bool,
    pub no_backprop_diff_xr: bool,
    pub nll_variance: NllVariance,
    pub pixel_sigma_i: f64,
    pub pixel_sigma_f: f64,
    pub pixel_n: f64,
    pub pixel_sigma_floor: f64,
    pub lr_i: f64,
    pub lr_f: f64,
    pub lr_n: f64,
}

impl Default for HyperParameters {
    fn default() -> Self {
        Self {
            image_size: [64, 64],
            chrz_size: [16, 16],
            chz_channels: 64,
            generation_steps: 12,
            generator_share_core: false,
            generator_share_prior: false,
            generator_share_upsampler: false,
            generator_downsampler_channels: 12,
            inference_share_core: false,
            inference_share_posterior: false,
            inference_downsampler_channels: 12,
            batch_normalization_enabled: false,
            no_backprop_diff_xr: false,
            nll_variance: NllVariance::Scheduled,
            pixel_sigma_i: 2.0,
            pixel_sigma_f: 0.7,
            pixel_n: 2e5,
            pixel_sigma_floor: 1e-3,
            lr_i: 5e-4,
            lr_f: 5e-5,
            lr_n: 1.6e6,
        }
    }
}

impl HyperParameters {
    pub fn from_file<T: AsRef<Path>>(path: T) -> Result<Self> {
        let file = fs::read_to_string(path)?;
        let cfg: HyperParameters = toml::from_str(&file)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_snapshot<T: AsRef<Path>>(snapshot_directory: T) -> Result<Self> {
        Self::from_file(snapshot_directory.as_ref().join(HYPERPARAMS_FILENAME))
    }

    /// `None` only when the snapshot directory has no `hyperparams.toml`; a
    /// file that cannot be read, parsed or validated is an error.
    pub fn from_snapshot_if_present<T: AsRef<Path>>(snapshot_directory: T) -> Result<Option<Self>> {
        let dir = snapshot_directory.as_ref();
        if !dir.join(HYPERPARAMS_FILENAME).is_file() {
            return Ok(None);
        }
        Self::from_snapshot(dir).map(Some)
    }

    /// Writes `hyperparams.toml` into `snapshot_directory` through a temporary
    /// file so an interrupted write never clobbers the previous copy.
    pub fn save<T: AsRef<Path>>(&self, snapshot_directory: T) -> Result<()> {
        let dir = snapshot_directory.as_ref();
        fs::create_dir_all(dir)?;
        let tmp = dir.join(format!("{HYPERPARAMS_FILENAME}.{}.tmp", std::process::id()));
        fs::write(&tmp, toml::to_string_pretty(self)?)?;
        fs::rename(&tmp, dir.join(HYPERPARAMS_FILENAME))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(ConvDrawError::InvalidConfig(msg));
        if self.generation_steps == 0 {
            return invalid("generation_steps must be at least 1".to_string());
        }
        if self.chz_channels <= 0
            || self.generator_downsampler_channels <= 0
            || self.inference_downsampler_channels <= 0
        {
            return invalid("channel widths must be positive".to_string());
        }
        for axis in 0..2 {
            let (image, chrz) = (self.image_size[axis], self.chrz_size[axis]);
            if image <= 0 || image % 4 != 0 || chrz * 4 != image {
                return invalid(format!(
                    "chrz_size {:?} must be image_size {:?} / 4",
                    self.chrz_size, self.image_size
                ));
            }
        }
        if self.pixel_sigma_i <= 0. || self.pixel_sigma_f <= 0. || self.pixel_sigma_floor <= 0. {
            return invalid("pixel sigmas and their floor must be positive".to_string());
        }
        if self.pixel_sigma_floor > self.pixel_sigma_i.min(self.pixel_sigma_f) {
            return invalid(format!(
                "pixel_sigma_floor {} is above the annealed sigma range [{}, {}]",
                self.pixel_sigma_floor, self.pixel_sigma_f, self.pixel_sigma_i
            ));
        }
        if self.pixel_n <= 0. || self.lr_n <= 0. {
            return invalid("annealing horizons must be positive".to_string());
        }
        if self.lr_i <= 0. || self.lr_f <= 0. {
            return invalid("learning rates must be positive".to_string());
        }
        Ok(())
    }

    pub fn sharing_policy(&self) -> SharingPolicy {
        SharingPolicy {
            generator_core: self.generator_share_core,
            generator_prior: self.generator_share_prior,
            generator_upsampler: self.generator_share_upsampler,
            inference_core: self.inference_share_core,
            inference_posterior: self.inference_share_posterior,
        }
    }

    pub fn variance_schedule(&self) -> VarianceSchedule {
        VarianceSchedule::new(self.pixel_sigma_i, self.pixel_sigma_f, self.pixel_n, self.pixel_sigma_floor)
    }

    pub fn num_pixels(&self) -> i64 {
        3 * self.image_size[0] * self.image_size[1]
    }
}
