use async_trait::async_trait;
use shared::{
    domain::ConnectionId,
    protocol::{FunnelReportRequest, Report},
};
use thiserror::Error;

pub mod conversion;
pub mod debounce;
mod dispatch;
mod http_fetcher;
pub mod queue;
pub mod step_filter;

pub use conversion::{calculate_conversions, conversion_rate, RateFormat};
pub use debounce::Debouncer;
pub use dispatch::{DispatchError, DispatchReport};
pub use http_fetcher::HttpReportFetcher;
pub use queue::{
    DateRangeSelection, EnqueueOutcome, FunnelJobQueue, JobEvent, JobOutcome, JobRecord, JobState,
    QueueSettings, QueueSnapshot,
};
pub use step_filter::remove_disabled_steps;

#[derive(Debug, Error)]
pub enum ReportFetchError {
    #[error("report request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("report endpoint returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("failed to decode report payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("report fetcher is unavailable: {0}")]
    Unavailable(String),
}

/// Source of funnel reports, normally the analytics backend.
#[async_trait]
pub trait ReportFetcher: Send + Sync {
    async fn fetch(
        &self,
        connection_id: ConnectionId,
        request: &FunnelReportRequest,
    ) -> Result<Report, ReportFetchError>;
}

pub struct MissingReportFetcher;

#[async_trait]
impl ReportFetcher for MissingReportFetcher {
    async fn fetch(
        &self,
        connection_id: ConnectionId,
        _request: &FunnelReportRequest,
    ) -> Result<Report, ReportFetchError> {
        Err(ReportFetchError::Unavailable(format!(
            "no report backend configured for connection {connection_id}"
        )))
    }
}

#[cfg(test)]
#[path = "tests/conversion_tests.rs"]
mod conversion_tests;

#[cfg(test)]
#[path = "tests/step_filter_tests.rs"]
mod step_filter_tests;

#[cfg(test)]
#[path = "tests/debounce_tests.rs"]
mod debounce_tests;

#[cfg(test)]
#[path = "tests/queue_tests.rs"]
mod queue_tests;

#[cfg(test)]
#[path = "tests/http_fetcher_tests.rs"]
mod http_fetcher_tests;
