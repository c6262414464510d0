//! Replica destinations for published artifacts.

use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, IF_NONE_MATCH};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;

use crate::{
    build_client, classify_reqwest_error, classify_status, replace_file_atomically,
    write_new_file, BackoffPolicy, HttpClientConfig, RetryDisposition,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PutMode {
    /// Write-once: an existing object is never replaced.
    CreateOnce,
    /// Replace the named object as a whole.
    Overwrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PutOutcome {
    Uploaded,
    AlreadyPresent,
    Unchanged,
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("{key} already exists at {destination} with different content")]
    Conflict { destination: String, key: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

#[async_trait]
pub trait Destination: Send + Sync {
    fn name(&self) -> &str;

    async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: &str,
        mode: PutMode,
    ) -> Result<PutOutcome, PublishError>;
}

pub fn join_key(prefix: &str, key: &str) -> String {
    let prefix = prefix.trim_matches('/');
    let key = key.trim_start_matches('/');
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}/{key}")
    }
}

/// Split `s3://bucket/some/prefix` into the bucket and its key prefix.
pub fn parse_s3_target(target: &str) -> Option<(String, String)> {
    let rest = target.strip_prefix("s3://")?;
    let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
    if bucket.is_empty() {
        return None;
    }
    Some((bucket.to_string(), prefix.trim_matches('/').to_string()))
}

/// A directory standing in for a bucket (a mounted bucket, a sync folder, or tests).
#[derive(Debug, Clone)]
pub struct LocalDirDestination {
    name: String,
    root: PathBuf,
    prefix: String,
}

impl LocalDirDestination {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            prefix: prefix.into(),
        }
    }

    pub fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(join_key(&self.prefix, key))
    }
}

#[async_trait]
impl Destination for LocalDirDestination {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        _content_type: &str,
        mode: PutMode,
    ) -> Result<PutOutcome, PublishError> {
        let path = self.object_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            let existing = fs::read(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            match (mode, existing == bytes) {
                (PutMode::CreateOnce, true) => return Ok(PutOutcome::AlreadyPresent),
                (PutMode::Overwrite, true) => return Ok(PutOutcome::Unchanged),
                (PutMode::CreateOnce, false) => {
                    return Err(PublishError::Conflict {
                        destination: self.name.clone(),
                        key: key.to_string(),
                    })
                }
                (PutMode::Overwrite, false) => {}
            }
        }

        match mode {
            PutMode::CreateOnce => write_new_file(&path, bytes).await?,
            PutMode::Overwrite => replace_file_atomically(&path, bytes).await?,
        }
        Ok(PutOutcome::Uploaded)
    }
}

/// Object store reachable through plain HTTP `PUT` (presigned bucket endpoints, gateways).
#[derive(Debug, Clone)]
pub struct HttpPutDestination {
    name: String,
    base_url: String,
    prefix: String,
    bearer_token: Option<String>,
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpPutDestination {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        prefix: impl Into<String>,
        bearer_token: Option<String>,
        config: &HttpClientConfig,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            name: name.into(),
            base_url: base_url.into(),
            prefix: prefix.into(),
            bearer_token,
            client: build_client(config)?,
            backoff: config.backoff,
        })
    }

    pub fn object_url(&self, key: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            join_key(&self.prefix, key)
        )
    }
}

#[async_trait]
impl Destination for HttpPutDestination {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: &str,
        mode: PutMode,
    ) -> Result<PutOutcome, PublishError> {
        let url = self.object_url(key);
        let mut attempt = 0;
        loop {
            let mut request = self
                .client
                .put(&url)
                .header(CONTENT_TYPE, content_type)
                .body(bytes.to_vec());
            if let Some(token) = &self.bearer_token {
                request = request.bearer_auth(token);
            }
            if mode == PutMode::CreateOnce {
                request = request.header(IF_NONE_MATCH, "*");
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(PutOutcome::Uploaded);
                    }
                    if status == StatusCode::PRECONDITION_FAILED && mode == PutMode::CreateOnce {
                        return Ok(PutOutcome::AlreadyPresent);
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tracing::warn!(destination = %self.name, key, %status, attempt, "retrying put");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(PublishError::HttpStatus {
                        status: status.as_u16(),
                        url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tracing::warn!(destination = %self.name, key, error = %err, attempt, "retrying put");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(PublishError::Request(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn s3_targets_split_into_bucket_and_prefix() {
        assert_eq!(
            parse_s3_target("s3://open-data/alpharetta/police/"),
            Some(("open-data".to_string(), "alpharetta/police".to_string()))
        );
        assert_eq!(
            parse_s3_target("s3://open-data"),
            Some(("open-data".to_string(), String::new()))
        );
        assert_eq!(parse_s3_target("s3:///prefix"), None);
        assert_eq!(parse_s3_target("/srv/replica-a"), None);
    }

    #[test]
    fn keys_join_with_a_single_slash() {
        assert_eq!(join_key("", "master/a.csv"), "master/a.csv");
        assert_eq!(join_key("alphapd/", "/master/a.csv"), "alphapd/master/a.csv");
        assert_eq!(join_key("/alphapd", "snapshots/b.csv"), "alphapd/snapshots/b.csv");
    }

    #[test]
    fn http_object_urls_include_prefix() {
        let dest = HttpPutDestination::new(
            "b",
            "https://storage.example.test/bucket/",
            "alphapd",
            None,
            &HttpClientConfig::default(),
        )
        .unwrap();
        assert_eq!(
            dest.object_url("master/AlphaPoliceEvent_master.csv"),
            "https://storage.example.test/bucket/alphapd/master/AlphaPoliceEvent_master.csv"
        );
    }

    #[tokio::test]
    async fn create_once_is_idempotent_for_identical_bytes() {
        let dir = tempdir().expect("tempdir");
        let dest = LocalDirDestination::new("a", dir.path(), "alphapd");

        let first = dest
            .put("snapshots/s.csv", b"id\n1\n", "text/csv", PutMode::CreateOnce)
            .await
            .unwrap();
        let second = dest
            .put("snapshots/s.csv", b"id\n1\n", "text/csv", PutMode::CreateOnce)
            .await
            .unwrap();
        assert_eq!(first, PutOutcome::Uploaded);
        assert_eq!(second, PutOutcome::AlreadyPresent);
        assert!(dir.path().join("alphapd/snapshots/s.csv").exists());

        let err = dest
            .put("snapshots/s.csv", b"id\n2\n", "text/csv", PutMode::CreateOnce)
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Conflict { .. }));
    }

    #[tokio::test]
    async fn overwrite_replaces_and_skips_identical_content() {
        let dir = tempdir().expect("tempdir");
        let dest = LocalDirDestination::new("a", dir.path(), "");

        dest.put("master/m.csv", b"v1", "text/csv", PutMode::Overwrite)
            .await
            .unwrap();
        let replaced = dest
            .put("master/m.csv", b"v2", "text/csv", PutMode::Overwrite)
            .await
            .unwrap();
        let repeated = dest
            .put("master/m.csv", b"v2", "text/csv", PutMode::Overwrite)
            .await
            .unwrap();

        assert_eq!(replaced, PutOutcome::Uploaded);
        assert_eq!(repeated, PutOutcome::Unchanged);
        assert_eq!(std::fs::read(dest.object_path("master/m.csv")).unwrap(), b"v2");
    }
}
