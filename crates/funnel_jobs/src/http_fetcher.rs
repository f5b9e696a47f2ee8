use async_trait::async_trait;
use reqwest::Client;
use shared::{
    domain::ConnectionId,
    error::ApiError,
    protocol::{DataEnvelope, FunnelReportRequest, Report},
};
use tracing::debug;
use url::Url;

use crate::{ReportFetchError, ReportFetcher};

/// Fetches funnel reports from the dashboard API:
/// `POST {api_url}/connections/{connection_id}/reports/funnel`.
pub struct HttpReportFetcher {
    http: Client,
    api_url: Url,
}

impl HttpReportFetcher {
    pub fn new(api_url: Url) -> Self {
        Self::with_client(Client::new(), api_url)
    }

    pub fn with_client(http: Client, api_url: Url) -> Self {
        Self { http, api_url }
    }

    fn report_url(&self, connection_id: ConnectionId) -> Result<Url, ReportFetchError> {
        let connection = connection_id.to_string();
        let mut url = self.api_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                ReportFetchError::Unavailable(format!(
                    "api url '{}' cannot be used as a base",
                    self.api_url
                ))
            })?
            .pop_if_empty()
            .extend(["connections", connection.as_str(), "reports", "funnel"]);
        Ok(url)
    }
}

#[async_trait]
impl ReportFetcher for HttpReportFetcher {
    async fn fetch(
        &self,
        connection_id: ConnectionId,
        request: &FunnelReportRequest,
    ) -> Result<Report, ReportFetchError> {
        let url = self.report_url(connection_id)?;
        debug!(%url, %connection_id, steps = request.steps.len(), "requesting funnel report");

        let res = self.http.post(url).json(request).send().await?;
        let status = res.status();
        let body = res.bytes().await?;

        if !status.is_success() {
            let message = match serde_json::from_slice::<ApiError>(&body) {
                Ok(api_error) => api_error.message,
                Err(_) => String::from_utf8_lossy(&body).trim().to_string(),
            };
            return Err(ReportFetchError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let envelope: DataEnvelope<Report> = serde_json::from_slice(&body)?;
        Ok(envelope.data)
    }
}
