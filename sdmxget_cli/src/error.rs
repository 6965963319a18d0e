use std::io::ErrorKind;

use polars::error::PolarsError;
use sdmxget::error::{PipelineError, SdmxError};

#[derive(thiserror::Error, Debug)]
pub enum SdmxCliError {
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
    #[error("serde JSON error: {0}")]
    SerdeJSONError(#[from] serde_json::Error),
    #[error("polars error: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("sdmxget error: {0}")]
    SdmxError(#[from] SdmxError),
    #[error(transparent)]
    PipelineError(#[from] PipelineError),
    #[error("std IO error: {0}")]
    IOError(#[from] std::io::Error),
}

impl SdmxCliError {
    /// Whether the error came from writing to a stdout whose reader has gone away, e.g. `| head`.
    pub fn is_broken_pipe(&self) -> bool {
        match self {
            SdmxCliError::IOError(err) => err.kind() == ErrorKind::BrokenPipe,
            SdmxCliError::Anyhow(err) => err.chain().any(|cause| {
                cause
                    .downcast_ref::<std::io::Error>()
                    .is_some_and(|err| err.kind() == ErrorKind::BrokenPipe)
            }),
            _ => false,
        }
    }
}

pub type SdmxCliResult<T> = Result<T, SdmxCliError>;
