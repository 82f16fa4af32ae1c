//! Offset-paginated fetcher for open-data collection endpoints
//!
//! [`PageFetcher::fetch`] returns a [`Pages`] cursor that requests one page per
//! pull. Nothing is requested until the consumer asks for the next batch, so a
//! consumer that stops early stops the requests too.
//!
//! The sequence ends on the first of:
//! 1. a failed page (non-success status, transport error, undecodable body),
//! 2. an empty page,
//! 3. the first batch when test mode is on.

use reqwest::Client;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, info, instrument};

use crate::error::FetchError;
use crate::records::{Dataset, Record, RowBatch};
use crate::retry::RetryPolicy;

pub const DEFAULT_BATCH_SIZE: u64 = 1000;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 300;

/// Header carrying a Socrata-style application token
pub const APP_TOKEN_HEADER: &str = "X-App-Token";

const LIMIT_PARAM: &str = "$limit";
const OFFSET_PARAM: &str = "$offset";

/// How the source API is authenticated
#[derive(Clone, PartialEq, Eq)]
pub enum ApiAuth {
    /// `X-App-Token: <token>`
    AppToken(String),
    /// `Authorization: Bearer <token>`
    Bearer(String),
}

impl fmt::Debug for ApiAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiAuth::AppToken(_) => f.write_str("AppToken(***)"),
            ApiAuth::Bearer(_) => f.write_str("Bearer(***)"),
        }
    }
}

/// One pagination run against one endpoint
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub endpoint: String,
    pub auth: Option<ApiAuth>,
    /// Sent ahead of `$limit`/`$offset`; those two are always ours
    pub query_params: Vec<(String, String)>,
    pub batch_size: u64,
    pub test_mode: bool,
}

impl FetchRequest {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            auth: None,
            query_params: Vec::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            test_mode: false,
        }
    }

    pub fn auth(mut self, auth: ApiAuth) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_params.push((key.into(), value.into()));
        self
    }

    pub fn batch_size(mut self, batch_size: u64) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn test_mode(mut self, test_mode: bool) -> Self {
        self.test_mode = test_mode;
        self
    }

    fn page_query(&self, offset: u64) -> Vec<(String, String)> {
        let mut query: Vec<(String, String)> = self
            .query_params
            .iter()
            .filter(|(key, _)| key != LIMIT_PARAM && key != OFFSET_PARAM)
            .cloned()
            .collect();
        query.push((LIMIT_PARAM.to_string(), self.batch_size.to_string()));
        query.push((OFFSET_PARAM.to_string(), offset.to_string()));
        query
    }
}

/// Why a page sequence ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Termination {
    /// An empty page: the collection is exhausted
    Exhausted,
    /// Test mode stopped after the first batch
    TestMode,
    /// A page failed; everything before it was delivered
    Failed { error: FetchError },
}

impl Termination {
    pub fn is_failure(&self) -> bool {
        matches!(self, Termination::Failed { .. })
    }
}

/// HTTP client for paginated collection endpoints
#[derive(Debug, Clone)]
pub struct PageFetcher {
    client: Client,
    retry: RetryPolicy,
}

impl PageFetcher {
    pub fn new(timeout: Duration, retry: RetryPolicy) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("sluice/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self::with_client(client, retry))
    }

    pub fn with_client(client: Client, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }

    /// Start a lazy page sequence; no request is made until the first pull
    pub fn fetch(&self, request: FetchRequest) -> Pages {
        Pages {
            client: self.client.clone(),
            retry: self.retry,
            request,
            cursor: 0,
            batches: 0,
            termination: None,
        }
    }
}

/// A pull-driven sequence of row batches
#[derive(Debug)]
pub struct Pages {
    client: Client,
    retry: RetryPolicy,
    request: FetchRequest,
    cursor: u64,
    batches: usize,
    termination: Option<Termination>,
}

impl Pages {
    /// Offset of the next page to request
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Batches delivered so far
    pub fn batches(&self) -> usize {
        self.batches
    }

    /// Set once the sequence has ended
    pub fn termination(&self) -> Option<&Termination> {
        self.termination.as_ref()
    }

    /// Request the next page
    ///
    /// Returns `None` once the sequence has ended. A failed page is returned
    /// once as `Err` and ends the sequence; it never carries rows.
    pub async fn next_batch(&mut self) -> Option<Result<RowBatch, FetchError>> {
        if self.termination.is_some() {
            return None;
        }

        let offset = self.cursor;
        let records = match self.fetch_page(offset).await {
            Ok(records) => records,
            Err(err) => {
                error!(
                    endpoint = %self.request.endpoint,
                    offset,
                    batches = self.batches,
                    error = %err,
                    "Page retrieval failed, ending fetch"
                );
                self.termination = Some(Termination::Failed { error: err.clone() });
                return Some(Err(err));
            },
        };

        if records.is_empty() {
            info!(offset, batches = self.batches, "Empty page, collection exhausted");
            self.termination = Some(Termination::Exhausted);
            return None;
        }

        self.cursor += self.request.batch_size;
        self.batches += 1;
        info!(offset, rows = records.len(), batch = self.batches, "Retrieved page");

        if self.request.test_mode {
            info!("Test mode: stopping after the first batch");
            self.termination = Some(Termination::TestMode);
        }

        Some(Ok(RowBatch::from_records(records)))
    }

    /// Adapt into a `futures` stream of batches
    pub fn into_stream(self) -> impl futures::Stream<Item = Result<RowBatch, FetchError>> {
        futures::stream::unfold(self, |mut pages| async move {
            pages.next_batch().await.map(|item| (item, pages))
        })
    }

    /// Drain the sequence into one dataset
    pub async fn collect(mut self) -> FetchSummary {
        let mut dataset = Dataset::new();
        while let Some(item) = self.next_batch().await {
            if let Ok(batch) = item {
                dataset.push(batch);
            }
        }

        FetchSummary {
            dataset,
            cursor: self.cursor,
            termination: self.termination.unwrap_or(Termination::Exhausted),
        }
    }

    #[instrument(skip(self), fields(endpoint = %self.request.endpoint))]
    async fn fetch_page(&self, offset: u64) -> Result<Vec<Record>, FetchError> {
        self.retry
            .run("fetch_page", || self.request_page(offset))
            .await
    }

    async fn request_page(&self, offset: u64) -> Result<Vec<Record>, FetchError> {
        let mut builder = self
            .client
            .get(&self.request.endpoint)
            .query(&self.request.page_query(offset));

        builder = match &self.request.auth {
            Some(ApiAuth::AppToken(token)) => builder.header(APP_TOKEN_HEADER, token),
            Some(ApiAuth::Bearer(token)) => builder.bearer_auth(token),
            None => builder,
        };

        debug!(offset, limit = self.request.batch_size, "Requesting page");

        let response = builder.send().await.map_err(|e| FetchError::Transport {
            offset,
            message: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                offset,
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await.map_err(|e| FetchError::Transport {
            offset,
            message: e.to_string(),
        })?;

        serde_json::from_slice::<Vec<Record>>(&body).map_err(|e| FetchError::Decode {
            offset,
            message: e.to_string(),
        })
    }
}

/// Outcome of draining a page sequence
#[derive(Debug, Clone)]
pub struct FetchSummary {
    pub dataset: Dataset,
    /// Cursor when fetching stopped
    pub cursor: u64,
    pub termination: Termination,
}

impl FetchSummary {
    /// False when a page failed, i.e. the dataset may be silently short
    pub fn is_complete(&self) -> bool {
        !self.termination.is_failure()
    }

    pub fn failure(&self) -> Option<&FetchError> {
        match &self.termination {
            Termination::Failed { error } => Some(error),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_query_puts_pagination_last_and_wins() {
        let request = FetchRequest::new("https://data.example.org/resource/abcd.json")
            .param("$where", "status='open'")
            .param("$limit", "5")
            .batch_size(250);

        assert_eq!(
            request.page_query(500),
            vec![
                ("$where".to_string(), "status='open'".to_string()),
                ("$limit".to_string(), "250".to_string()),
                ("$offset".to_string(), "500".to_string()),
            ]
        );
    }

    #[test]
    fn test_auth_debug_is_redacted() {
        let debug = format!("{:?}", ApiAuth::AppToken("s3cr3t".to_string()));
        assert!(!debug.contains("s3cr3t"));
    }

    #[test]
    fn test_summary_completeness() {
        let summary = FetchSummary {
            dataset: Dataset::new(),
            cursor: 2000,
            termination: Termination::Failed {
                error: FetchError::Status {
                    offset: 2000,
                    status: 500,
                },
            },
        };
        assert!(!summary.is_complete());
        assert_eq!(summary.failure().map(FetchError::offset), Some(2000));
    }
}
