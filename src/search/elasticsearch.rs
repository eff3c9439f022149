//! Elasticsearch index over its REST API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode, Url};
use tracing::{debug, info};

use super::{Result, SearchError, SearchIndex};
use crate::config::{SearchConfig, WriteMode};
use crate::order::ProcessedRecord;

/// Error type Elasticsearch reports when a concurrent create won the race.
const ALREADY_EXISTS: &str = "resource_already_exists_exception";

/// Processed-record index backed by Elasticsearch.
pub struct ElasticsearchIndex {
    client: Client,
    base_url: Url,
    index: String,
    username: Option<String>,
    password: Option<String>,
    timeout: Duration,
    write_mode: WriteMode,
}

impl ElasticsearchIndex {
    pub fn new(config: &SearchConfig) -> Result<Self> {
        let base_url = Url::parse(&config.url)
            .map_err(|e| SearchError::Client(format!("invalid url {}: {}", config.url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(SearchError::Client(format!(
                "invalid url {}: not a base url",
                config.url
            )));
        }

        let client = Client::builder()
            .build()
            .map_err(|e| SearchError::Client(format!("Failed to build client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            index: config.index.clone(),
            username: config.username.clone().filter(|u| !u.is_empty()),
            password: config.password.clone(),
            timeout: config.timeout(),
            write_mode: config.write_mode,
        })
    }

    pub fn index_name(&self) -> &str {
        &self.index
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// Method and URL used to write `record` under the configured mode.
    fn write_target(&self, record: &ProcessedRecord) -> (Method, Url) {
        match self.write_mode {
            WriteMode::Insert => (Method::POST, self.url(&[self.index.as_str(), "_doc"])),
            WriteMode::Upsert => (
                Method::PUT,
                self.url(&[self.index.as_str(), "_doc", record.order_id.as_str()]),
            ),
        }
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let request = self.client.request(method, url);
        match &self.username {
            Some(user) => request.basic_auth(user, self.password.as_ref()),
            None => request,
        }
    }
}

#[async_trait]
impl SearchIndex for ElasticsearchIndex {
    async fn ensure_index(&self) -> Result<()> {
        let exists = self
            .request(Method::HEAD, self.url(&[self.index.as_str()]))
            .send()
            .await?;

        match exists.status() {
            StatusCode::OK => {
                debug!(index = %self.index, "Index exists");
                return Ok(());
            }
            StatusCode::NOT_FOUND => {}
            status => {
                return Err(SearchError::UnexpectedStatus {
                    operation: "indices.exists",
                    status: status.as_u16(),
                })
            }
        }

        let created = self
            .request(Method::PUT, self.url(&[self.index.as_str()]))
            .send()
            .await?;
        let status = created.status();
        if status.is_success() {
            info!(index = %self.index, "Created index");
            return Ok(());
        }

        let body = created.text().await.unwrap_or_default();
        if status == StatusCode::BAD_REQUEST && body.contains(ALREADY_EXISTS) {
            debug!(index = %self.index, "Index created concurrently");
            return Ok(());
        }

        Err(SearchError::UnexpectedStatus {
            operation: "indices.create",
            status: status.as_u16(),
        })
    }

    #[tracing::instrument(name = "search.write", skip_all, fields(index = %self.index, order_id = %record.order_id))]
    async fn write(&self, record: &ProcessedRecord) -> Result<()> {
        let (method, url) = self.write_target(record);

        let response = self
            .request(method, url)
            .timeout(self.timeout)
            .json(record)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SearchError::Timeout
                } else {
                    SearchError::Request(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SearchError::UnexpectedStatus {
                operation: "index",
                status: status.as_u16(),
            });
        }

        debug!(status = status.as_u16(), "Indexed processed record");
        Ok(())
    }
}
