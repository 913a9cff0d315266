pub mod config;
pub mod dataset;
pub mod distribution;
pub mod error;
pub mod generator;
pub mod inference;
pub mod loss;
pub mod lstm;
pub mod model;
pub mod optimizer;
pub mod sampler;
pub mod sharing;
pub mod trainer;
pub mod utils;

pub use config::{HyperParameters, NllVariance};
pub use error::{ConvDrawError, Result};
pub use model::{ConvDrawModel, PixelParams, StepLatentParams, Unroll};
