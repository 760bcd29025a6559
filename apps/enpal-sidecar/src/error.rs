use std::time::Duration;
use thiserror::Error;

/// Anything that kept a Flux query from producing records.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("influx request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("influx returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("influx reported a query error: {0}")]
    Flux(String),
    #[error("failed to decode flux csv: {0}")]
    Decode(#[from] csv::Error),
    #[error("query timed out after {0:?}")]
    Timeout(Duration),
}

/// Why a single poll tick ended in the error state.
#[derive(Debug, Error)]
pub enum TickError {
    #[error("transport failure: {0}")]
    Transport(#[from] QueryError),
    #[error("query returned no record")]
    NoData,
    #[error("value {raw:?} is not a number")]
    Parse { raw: String },
    #[error("input sensor {0} has no healthy observation")]
    InputUnavailable(&'static str),
}

impl TickError {
    /// Transport failures cover both a failed query and an empty one.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::NoData)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("battery estimator needs a {missing} sensor")]
pub struct PreconditionUnmet {
    pub missing: &'static str,
}
