// Error taxonomy shared by the training and serving paths.
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed input row, field, header or delimiter. Fatal for a training run.
    #[error("data format error at line {line}: {reason}")]
    DataFormat { line: u64, reason: String },

    /// A named feature could not be resolved from the input.
    #[error("missing feature: {0}")]
    MissingFeature(String),

    /// Unparseable date or hour outside [0, 23].
    #[error("invalid temporal input: {0}")]
    InvalidTemporalInput(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("partition `{0}` is empty")]
    EmptyPartition(&'static str),

    #[error("model error: {0}")]
    Model(String),

    #[error("linfa: {0}")]
    Linfa(#[from] linfa::error::Error),

    #[error("artifact error: {0}")]
    Artifact(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn data_format(line: u64, reason: impl Into<String>) -> Self {
        PipelineError::DataFormat {
            line,
            reason: reason.into(),
        }
    }
}
