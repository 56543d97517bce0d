use reqwest::{header::AUTHORIZATION, Method, RequestBuilder};
use std::time::Duration;
use taskdeck_core::{
    parse_metric_list, parse_system_metrics, parse_task_bytes, parse_task_list, CreateTaskRequest,
    MetricSample, ParseReport, SystemMetrics, TaskId, TaskRecord, TaskStatus, UpdateSource,
    WireError,
};
use taskdeck_engine::AuthContext;
use thiserror::Error;
use tracing::debug;
use url::Url;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("no bearer token available")]
    Unauthenticated,
    #[error("base url {0} cannot carry a path")]
    BaseUrl(String),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed response: {0}")]
    Decode(#[from] WireError),
}

/// Typed REST calls. Every call needs a token; without one nothing is sent.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: Url,
    auth: AuthContext,
}

impl ApiClient {
    pub fn new(base: Url, auth: AuthContext) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self::with_client(http, base, auth))
    }

    pub fn with_client(http: reqwest::Client, base: Url, auth: AuthContext) -> Self {
        Self { http, base, auth }
    }

    pub fn auth(&self) -> &AuthContext {
        &self.auth
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    pub async fn fetch_tasks(&self) -> Result<ParseReport<TaskRecord>, ApiError> {
        let body = self.get(&["api", "tasks"]).await?;
        Ok(parse_task_list(&body, UpdateSource::Poll)?)
    }

    pub async fn fetch_process_metrics(&self) -> Result<ParseReport<MetricSample>, ApiError> {
        let body = self.get(&["api", "process-metrics"]).await?;
        Ok(parse_metric_list(&body)?)
    }

    pub async fn fetch_system_metrics(&self) -> Result<Option<SystemMetrics>, ApiError> {
        let body = self.get(&["api", "metrics"]).await?;
        Ok(parse_system_metrics(&body)?)
    }

    pub async fn create_task(&self, request: &CreateTaskRequest) -> Result<TaskRecord, ApiError> {
        let url = self.endpoint(&["api", "tasks"])?;
        let body = self
            .execute(self.http.request(Method::POST, url).json(request))
            .await?;
        Ok(parse_task_bytes(&body, UpdateSource::LocalCommand)?)
    }

    pub async fn update_status(&self, id: &TaskId, status: TaskStatus) -> Result<TaskRecord, ApiError> {
        let mut url = self.endpoint(&["api", "tasks", id.as_str(), "status"])?;
        url.query_pairs_mut().append_pair("status", status.as_str());
        let body = self.execute(self.http.request(Method::PUT, url)).await?;
        Ok(parse_task_bytes(&body, UpdateSource::LocalCommand)?)
    }

    pub async fn delete_task(&self, id: &TaskId) -> Result<(), ApiError> {
        let url = self.endpoint(&["api", "tasks", id.as_str()])?;
        self.execute(self.http.request(Method::DELETE, url)).await?;
        Ok(())
    }

    async fn get(&self, segments: &[&str]) -> Result<Vec<u8>, ApiError> {
        let url = self.endpoint(segments)?;
        self.execute(self.http.request(Method::GET, url)).await
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::BaseUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn execute(&self, request: RequestBuilder) -> Result<Vec<u8>, ApiError> {
        let bearer = self.auth.bearer_header().ok_or(ApiError::Unauthenticated)?;
        let response = request.header(AUTHORIZATION, bearer).send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        debug!(event = "api_response", status = status.as_u16(), bytes = body.len());
        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).trim().to_string(),
            });
        }
        Ok(body.to_vec())
    }
}
