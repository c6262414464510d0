//! S3-compatible bucket destination, built with the `s3` feature.

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::destination::{join_key, Destination, PublishError, PutMode, PutOutcome};

/// Credentials and region come from the standard AWS environment. `endpoint`
/// points at an S3-compatible service (path-style addressing).
pub struct S3Destination {
    name: String,
    bucket: String,
    prefix: String,
    endpoint: Option<String>,
    client: OnceCell<Client>,
}

impl S3Destination {
    pub fn new(
        name: impl Into<String>,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        endpoint: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            bucket: bucket.into(),
            prefix: prefix.into(),
            endpoint,
            client: OnceCell::new(),
        }
    }

    pub fn object_key(&self, key: &str) -> String {
        join_key(&self.prefix, key)
    }

    async fn client(&self) -> &Client {
        self.client
            .get_or_init(|| async {
                let base_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
                    .load()
                    .await;
                let mut builder = aws_sdk_s3::config::Builder::from(&base_config);
                if let Some(endpoint) = &self.endpoint {
                    builder = builder.endpoint_url(endpoint).force_path_style(true);
                }
                Client::from_conf(builder.build())
            })
            .await
    }
}

#[async_trait]
impl Destination for S3Destination {
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
        let object_key = self.object_key(key);
        let url = format!("s3://{}/{}", self.bucket, object_key);
        let mut request = self
            .client()
            .await
            .put_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .content_type(content_type)
            .body(ByteStream::from(bytes.to_vec()));
        if mode == PutMode::CreateOnce {
            request = request.if_none_match("*");
        }

        match request.send().await {
            Ok(_) => Ok(PutOutcome::Uploaded),
            Err(err) => match err.raw_response().map(|resp| resp.status().as_u16()) {
                Some(412) if mode == PutMode::CreateOnce => {
                    debug!(%url, "object already present");
                    Ok(PutOutcome::AlreadyPresent)
                }
                Some(status) => Err(PublishError::HttpStatus { status, url }),
                None => Err(PublishError::Io(anyhow::anyhow!("s3 put {url}: {err}"))),
            },
        }
    }
}
