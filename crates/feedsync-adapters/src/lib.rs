//! Upstream source contracts, fixture-first and HTTP implementations, and
//! the record → feed field mapper.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use feedsync_core::JobRecord;
use feedsync_storage::{FetchError, HttpClientConfig, HttpFetcher};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;

pub mod mapper;

pub use mapper::{FieldMapper, MappingError, MappingRules, RecruiterTable};

pub const CRATE_NAME: &str = "feedsync-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("grouping {grouping_id}: {message}")]
    Grouping { grouping_id: String, message: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// The ATS as seen by the engine: job lists per grouping (tearsheet) and
/// the ability to drop a job from a grouping.
#[async_trait]
pub trait UpstreamSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch_group(&self, grouping_id: &str) -> Result<Vec<JobRecord>, AdapterError>;

    async fn remove_from_group(&self, job_id: &str, grouping_id: &str) -> Result<(), AdapterError>;
}

/// Turn a JSON payload (bare array or `{ "data": [...] }`) into records,
/// skipping entries without a usable id.
pub fn records_from_payload(grouping_id: &str, payload: JsonValue) -> Result<Vec<JobRecord>, AdapterError> {
    let items = match payload {
        JsonValue::Array(items) => items,
        JsonValue::Object(mut map) => match map.remove("data") {
            Some(JsonValue::Array(items)) => items,
            _ => {
                return Err(AdapterError::Grouping {
                    grouping_id: grouping_id.to_string(),
                    message: "payload object has no data array".to_string(),
                })
            }
        },
        _ => {
            return Err(AdapterError::Grouping {
                grouping_id: grouping_id.to_string(),
                message: "payload is neither an array nor an object".to_string(),
            })
        }
    };

    let mut records = Vec::with_capacity(items.len());
    for item in items {
        match JobRecord::from_value(item) {
            Ok(record) => records.push(record),
            Err(err) => tracing::warn!(grouping_id, error = %err, "skipping upstream entry"),
        }
    }
    Ok(records)
}

/// Reads `<root>/<grouping_id>.json`. Removals are held in memory and hide
/// the job from later fetches, mirroring what the ATS does.
#[derive(Debug)]
pub struct FixtureUpstream {
    root: PathBuf,
    removed: Mutex<Vec<(String, String)>>,
}

impl FixtureUpstream {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            removed: Mutex::new(Vec::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `(job_id, grouping_id)` pairs removed so far.
    pub async fn removed(&self) -> Vec<(String, String)> {
        self.removed.lock().await.clone()
    }
}

#[async_trait]
impl UpstreamSource for FixtureUpstream {
    fn name(&self) -> &'static str {
        "fixture"
    }

    async fn fetch_group(&self, grouping_id: &str) -> Result<Vec<JobRecord>, AdapterError> {
        let path = self.root.join(format!("{grouping_id}.json"));
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|err| AdapterError::Grouping {
                grouping_id: grouping_id.to_string(),
                message: format!("reading {}: {err}", path.display()),
            })?;
        let payload: JsonValue = serde_json::from_str(&text).map_err(|err| AdapterError::Grouping {
            grouping_id: grouping_id.to_string(),
            message: format!("parsing {}: {err}", path.display()),
        })?;

        let removed = self.removed.lock().await;
        let mut records = records_from_payload(grouping_id, payload)?;
        records.retain(|r| !removed.iter().any(|(id, g)| *id == r.id && g == grouping_id));
        Ok(records)
    }

    async fn remove_from_group(&self, job_id: &str, grouping_id: &str) -> Result<(), AdapterError> {
        let mut removed = self.removed.lock().await;
        if !removed.iter().any(|(id, g)| id == job_id && g == grouping_id) {
            removed.push((job_id.to_string(), grouping_id.to_string()));
        }
        Ok(())
    }
}

/// REST-backed upstream:
/// `GET {base}/groups/{grouping}/jobs`, `DELETE {base}/groups/{grouping}/jobs/{id}`.
#[derive(Debug)]
pub struct HttpUpstream {
    base_url: String,
    http: HttpFetcher,
}

impl HttpUpstream {
    pub fn new(base_url: impl Into<String>, config: HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: HttpFetcher::new(config)?,
        })
    }

    fn jobs_url(&self, grouping_id: &str) -> String {
        format!("{}/groups/{grouping_id}/jobs", self.base_url)
    }
}

#[async_trait]
impl UpstreamSource for HttpUpstream {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn fetch_group(&self, grouping_id: &str) -> Result<Vec<JobRecord>, AdapterError> {
        let payload: JsonValue = self.http.get_json(grouping_id, &self.jobs_url(grouping_id)).await?;
        records_from_payload(grouping_id, payload)
    }

    async fn remove_from_group(&self, job_id: &str, grouping_id: &str) -> Result<(), AdapterError> {
        let url = format!("{}/{job_id}", self.jobs_url(grouping_id));
        self.http.delete(grouping_id, &url).await?;
        Ok(())
    }
}
