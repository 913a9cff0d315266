use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConvDrawError {
    #[error("shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: String,
        expected: Vec<i64>,
        actual: Vec<i64>,
    },

    #[error("sharing policy violated for {role}: expected {expected} modules, built {actual}")]
    SharingPolicy {
        role: String,
        expected: usize,
        actual: usize,
    },

    #[error("step {step} is out of range for {steps} generation steps")]
    StepOutOfRange { step: usize, steps: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error(transparent)]
    Torch(#[from] tch::TchError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    TomlDe(#[from] toml::de::Error),

    #[error(transparent)]
    TomlSer(#[from] toml::ser::Error),
}

pub type Result<T> = std::result::Result<T, ConvDrawError>;
