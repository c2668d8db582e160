//! S3-compatible archive storage via `aws-sdk-s3`.
//!
//! Works against AWS S3 and S3-compatible services (MinIO, Akave O3, …) by
//! using a static endpoint, static credentials, and path-style addressing.

use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::{BehaviorVersion, Region};
use aws_sdk_s3::primitives::ByteStream;
use serde::Deserialize;

use crossindex_core::{ObjectStore, ObjectStoreError};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct S3Settings {
    /// Host (and optional port), with or without a scheme.
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Scheme used when `endpoint` has none.
    #[serde(default = "default_use_ssl")]
    pub use_ssl: bool,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_use_ssl() -> bool {
    true
}

impl S3Settings {
    /// `endpoint` with a scheme, honoring `use_ssl` when none is given.
    pub fn endpoint_url(&self) -> String {
        if self.endpoint.contains("://") {
            self.endpoint.clone()
        } else if self.use_ssl {
            format!("https://{}", self.endpoint)
        } else {
            format!("http://{}", self.endpoint)
        }
    }
}

#[derive(Clone, Debug)]
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3ObjectStore {
    pub fn new(settings: &S3Settings) -> Self {
        let credentials =
            Credentials::from_keys(settings.access_key.clone(), settings.secret_key.clone(), None);
        let config = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()))
            .endpoint_url(settings.endpoint_url())
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();
        tracing::info!(endpoint = %settings.endpoint_url(), bucket = %settings.bucket, "s3 archive configured");
        Self {
            client: aws_sdk_s3::Client::from_conf(config),
            bucket: settings.bucket.clone(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), ObjectStoreError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/json")
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| {
                let msg = aws_sdk_s3::error::DisplayErrorContext(&e).to_string();
                match e {
                    aws_sdk_s3::error::SdkError::ServiceError(_) => ObjectStoreError::Rejected {
                        key: key.to_string(),
                        reason: msg,
                    },
                    _ => ObjectStoreError::Unavailable(msg),
                }
            })?;
        Ok(())
    }
}
