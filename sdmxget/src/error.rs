//! Error and warning types.

use std::fmt::Display;

use strum_macros::Display as StrumDisplay;

use crate::{metadata::ContentKey, observation::Dimension};

#[derive(thiserror::Error, Debug)]
pub enum SdmxError {
    #[error("No data in dataset `{dataset}` for this query")]
    NotFound { dataset: String },
    #[error("Transport failure querying `{dataset}`: {message}")]
    Transport { dataset: String, message: String },
    #[error("HTTP status {status} querying `{dataset}`")]
    Http { dataset: String, status: u16 },
    #[error("{count} duplicate observation(s); enable deduplication to drop them")]
    DuplicateRows { count: usize },
    #[error("Cannot pivot on `{column}`: {count} row(s) share identifying fields")]
    AmbiguousPivot { column: String, count: usize },
    #[error("Ambiguous fallback sequence prefix: {0}")]
    AmbiguousPrefix(String),
    #[error("Reference data unavailable: {0}")]
    MissingMetadata(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Column `{0}` missing from response")]
    MissingColumn(String),
    #[error("Wrapped polars error: {0}")]
    PolarsError(#[from] polars::error::PolarsError),
    #[error("Wrapped serde JSON error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),
    #[error("std IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Wrapped anyhow error: {0}")]
    AnyhowError(#[from] anyhow::Error),
}

impl SdmxError {
    /// Whether another attempt against the same dataset could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type SdmxResult<T> = Result<T, SdmxError>;

/// Pipeline stage in which a fatal error was raised
#[derive(Debug, Clone, Copy, PartialEq, Eq, StrumDisplay)]
#[strum(serialize_all = "kebab-case")]
pub enum Stage {
    Metadata,
    Resolve,
    Fetch,
    Normalize,
    Filter,
    PostProcess,
    Format,
}

/// Fatal pipeline failure, carrying the stage and every dataset candidate tried so far.
#[derive(thiserror::Error, Debug)]
#[error("{stage} stage failed (datasets attempted: [{}]): {source}", .attempted.join(", "))]
pub struct PipelineError {
    pub stage: Stage,
    pub attempted: Vec<String>,
    #[source]
    pub source: SdmxError,
}

impl PipelineError {
    pub fn new(stage: Stage, attempted: &[String], source: SdmxError) -> Self {
        Self {
            stage,
            attempted: attempted.to_vec(),
            source,
        }
    }
}

/// Non-fatal conditions collected during a run and returned with the result.
#[derive(Debug, Clone, PartialEq)]
pub enum Warning {
    UnsupportedFilter {
        dimension: Dimension,
        dataset: String,
    },
    UnknownFilterValue {
        dimension: Dimension,
        dataset: String,
        value: String,
    },
    SingleIndicatorWide,
    StaleMetadata {
        key: ContentKey,
        age_days: i64,
    },
    RawModeIgnored {
        option: String,
    },
}

impl Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Warning::UnsupportedFilter { dimension, dataset } => write!(
                f,
                "Dataset `{dataset}` has no `{dimension}` dimension; filter ignored"
            ),
            Warning::UnknownFilterValue {
                dimension,
                dataset,
                value,
            } => write!(
                f,
                "`{value}` is not a known `{dimension}` value in dataset `{dataset}`"
            ),
            Warning::SingleIndicatorWide => write!(
                f,
                "Wide-by-indicator output requested for a single indicator"
            ),
            Warning::StaleMetadata { key, age_days } => write!(
                f,
                "Reference data `{key}` is {age_days} days old; run a refresh"
            ),
            Warning::RawModeIgnored { option } => {
                write!(f, "`{option}` is not applied in raw mode")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    use super::*;

    #[test]
    fn test_anyhow() {
        let anyhow_error = anyhow!("An anyhow error");
        let sdmx_error: SdmxError = anyhow_error.into();
        assert!(!sdmx_error.is_retryable());
    }

    #[test]
    fn only_transport_errors_are_retryable() {
        let transport = SdmxError::Transport {
            dataset: "CME".into(),
            message: "connection reset".into(),
        };
        assert!(transport.is_retryable());
        assert!(!SdmxError::NotFound {
            dataset: "CME".into()
        }
        .is_retryable());
        assert!(!SdmxError::Http {
            dataset: "CME".into(),
            status: 400
        }
        .is_retryable());
    }

    #[test]
    fn pipeline_error_should_name_stage_and_candidates() {
        let err = PipelineError::new(
            Stage::PostProcess,
            &["CME".to_string(), "GLOBAL_DATAFLOW".to_string()],
            SdmxError::DuplicateRows { count: 2 },
        );
        let msg = err.to_string();
        assert!(msg.starts_with("post-process stage failed"), "{msg}");
        assert!(msg.contains("CME, GLOBAL_DATAFLOW"), "{msg}");
    }
}
