//! Source contracts and the feature-service / fixture sources that feed snapshots.

use std::path::PathBuf;

use anyhow::Context;
use apev_core::{RawRecord, GEOMETRY_FIELD};
use apev_storage::{FetchError, HttpFetcher};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "apev-adapters";

/// Default layer: Alpharetta PD public-safety events, rolling 28-day window.
pub const DEFAULT_LAYER_URL: &str =
    "https://alphagis.alpharetta.ga.us/arcgis/rest/services/OpenData/OpenData_PS_Full/FeatureServer/1";

/// Hard stop for runaway pagination when a server ignores `resultOffset`.
const MAX_PAGES: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

/// Everything one fetch produced: the flattened records and the verbatim payload for the audit archive.
#[derive(Debug, Clone)]
pub struct FetchedBatch {
    pub source_id: String,
    pub fetched_at: DateTime<Utc>,
    pub records: Vec<RawRecord>,
    pub raw_payload: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait RecordSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch(&self, http: &HttpFetcher, ctx: &FetchContext) -> Result<FetchedBatch, AdapterError>;
}

/// Flatten a GeoJSON FeatureCollection into property maps, attaching the
/// geometry as sorted-key JSON text under [`GEOMETRY_FIELD`].
pub fn flatten_feature_collection(collection: &JsonValue) -> Result<Vec<RawRecord>, AdapterError> {
    let features = collection
        .get("features")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| AdapterError::Message("payload has no `features` array".to_string()))?;

    Ok(features
        .iter()
        .map(|feature| {
            let mut props = feature
                .get("properties")
                .and_then(JsonValue::as_object)
                .cloned()
                .unwrap_or_default();
            let geometry = match feature.get("geometry") {
                Some(geometry) if !geometry.is_null() => geometry.clone(),
                _ => json!({}),
            };
            props.insert(
                GEOMETRY_FIELD.to_string(),
                JsonValue::String(geometry.to_string()),
            );
            props
        })
        .collect())
}

/// ArcGIS REST feature layer queried page by page as GeoJSON.
#[derive(Debug, Clone)]
pub struct FeatureServiceSource {
    pub source_id: String,
    pub layer_url: String,
    pub where_clause: String,
    pub page_size: usize,
}

impl FeatureServiceSource {
    pub fn new(layer_url: impl Into<String>) -> Self {
        Self {
            source_id: "alpharetta-police".to_string(),
            layer_url: layer_url.into(),
            where_clause: "1=1".to_string(),
            page_size: 2000,
        }
    }

    pub fn page_url(&self, offset: usize) -> Result<reqwest::Url, AdapterError> {
        let base = format!("{}/query", self.layer_url.trim_end_matches('/'));
        reqwest::Url::parse_with_params(
            &base,
            &[
                ("where", self.where_clause.clone()),
                ("outFields", "*".to_string()),
                ("outSR", "4326".to_string()),
                ("resultOffset", offset.to_string()),
                ("resultRecordCount", self.page_size.to_string()),
                ("f", "geojson".to_string()),
            ],
        )
        .map_err(|e| AdapterError::Message(format!("invalid layer url {}: {e}", self.layer_url)))
    }
}

#[async_trait]
impl RecordSource for FeatureServiceSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch(&self, http: &HttpFetcher, ctx: &FetchContext) -> Result<FetchedBatch, AdapterError> {
        let page_size = self.page_size.max(1);
        let mut features: Vec<JsonValue> = Vec::new();
        let mut offset = 0usize;

        for page in 0..MAX_PAGES {
            let url = self.page_url(offset)?;
            let response = http.fetch_bytes(ctx.run_id, &self.source_id, &url).await?;
            let body: JsonValue = serde_json::from_slice(&response.body)
                .with_context(|| format!("parsing page {page} from {}", response.final_url))?;
            if let Some(error) = body.get("error") {
                return Err(AdapterError::Message(format!(
                    "feature service error on page {page}: {error}"
                )));
            }
            let batch = body
                .get("features")
                .and_then(JsonValue::as_array)
                .cloned()
                .unwrap_or_default();
            let batch_len = batch.len();
            features.extend(batch);
            info!(page, batch_len, total = features.len(), "fetched feature page");

            if batch_len < page_size {
                let collection = json!({"type": "FeatureCollection", "features": features});
                let records = flatten_feature_collection(&collection)?;
                let raw_payload = serde_json::to_vec(&collection).context("serializing payload")?;
                return Ok(FetchedBatch {
                    source_id: self.source_id.clone(),
                    fetched_at: ctx.fetched_at,
                    records,
                    raw_payload,
                });
            }
            offset += page_size;
        }

        Err(AdapterError::Message(format!(
            "pagination did not terminate after {MAX_PAGES} pages"
        )))
    }
}

/// Reads a FeatureCollection from disk; used for offline runs and tests.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    pub source_id: String,
    pub path: PathBuf,
}

impl FixtureSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            source_id: "alpharetta-police".to_string(),
            path: path.into(),
        }
    }
}

#[async_trait]
impl RecordSource for FixtureSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch(&self, _http: &HttpFetcher, ctx: &FetchContext) -> Result<FetchedBatch, AdapterError> {
        let raw_payload = std::fs::read(&self.path)
            .with_context(|| format!("reading fixture {}", self.path.display()))?;
        let collection: JsonValue = serde_json::from_slice(&raw_payload)
            .with_context(|| format!("parsing fixture {}", self.path.display()))?;
        Ok(FetchedBatch {
            source_id: self.source_id.clone(),
            fetched_at: ctx.fetched_at,
            records: flatten_feature_collection(&collection)?,
            raw_payload,
        })
    }
}
