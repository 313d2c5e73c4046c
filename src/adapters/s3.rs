//! S3-Compatible Object Store Adapter
//!
//! Production `ObjectStore` implementation for S3-compatible endpoints
//! (SeaweedFS, MinIO, AWS). SeaweedFS-style deployments use path-style
//! addressing and static credentials; both are the defaults here.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_s3::{config::Builder as S3ConfigBuilder, primitives::ByteStream, Client as S3Client};
use bytes::Bytes;
use tracing::{debug, info, instrument};

use crate::domain::ports::ObjectStore;
use crate::error::{Error, Result};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the S3 adapter
#[derive(Debug, Clone)]
pub struct S3Config {
    /// Endpoint URL; `None` uses the AWS default resolution
    pub endpoint: Option<String>,

    /// Region name (S3-compatible stores generally ignore it)
    pub region: String,

    /// Static access key id
    pub access_key_id: String,

    /// Static secret access key
    pub secret_access_key: String,

    /// Path-style addressing, required by SeaweedFS/MinIO
    pub force_path_style: bool,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint: Some("http://seaweedfs:8333".to_string()),
            region: "us-east-1".to_string(),
            access_key_id: "admin".to_string(),
            secret_access_key: "admin".to_string(),
            force_path_style: true,
        }
    }
}

// =============================================================================
// Adapter
// =============================================================================

/// S3-compatible object store adapter.
#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    client: S3Client,
}

impl S3ObjectStore {
    /// Build the S3 client from configuration.
    pub async fn new(config: S3Config) -> Self {
        let credentials = Credentials::new(
            config.access_key_id.clone(),
            config.secret_access_key.clone(),
            None,
            None,
            "static",
        );

        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .load()
            .await;

        let mut builder = S3ConfigBuilder::from(&shared).force_path_style(config.force_path_style);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        let client = S3Client::from_conf(builder.build());
        info!(
            endpoint = config.endpoint.as_deref().unwrap_or("aws-default"),
            "Initialized object store client"
        );

        Self { client }
    }

    fn backend_error(context: &str, err: impl std::fmt::Display) -> Error {
        Error::BackendUnavailable {
            backend: "object-store".to_string(),
            reason: format!("{}: {}", context, err),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(true),
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(Self::backend_error("head_bucket", service_err))
                }
            }
        }
    }

    async fn create_bucket(&self, bucket: &str) -> Result<()> {
        match self.client.create_bucket().bucket(bucket).send().await {
            Ok(_) => {
                info!(bucket, "Created bucket");
                Ok(())
            }
            Err(err) => {
                let service_err = err.into_service_error();
                // Already-existing buckets make creation idempotent
                if service_err.is_bucket_already_owned_by_you()
                    || service_err.is_bucket_already_exists()
                {
                    Ok(())
                } else {
                    Err(Self::backend_error("create_bucket", service_err))
                }
            }
        }
    }

    #[instrument(skip(self, data, metadata))]
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        content_type: &str,
        metadata: HashMap<String, String>,
    ) -> Result<()> {
        let mut request = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(data));

        for (k, v) in metadata {
            request = request.metadata(k, v);
        }

        request
            .send()
            .await
            .map_err(|e| Self::backend_error("put_object", aws_sdk_s3::error::DisplayErrorContext(&e)))?;

        debug!(bucket, key, "Put object");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes> {
        let response = match self.client.get_object().bucket(bucket).key(key).send().await {
            Ok(response) => response,
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_no_such_key() {
                    return Err(Error::ResourceNotFound(format!("s3://{}/{}", bucket, key)));
                }
                return Err(Self::backend_error("get_object", service_err));
            }
        };

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| Self::backend_error("get_object body", e))?;
        Ok(data.into_bytes())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                Self::backend_error("delete_object", aws_sdk_s3::error::DisplayErrorContext(&e))
            })?;
        debug!(bucket, key, "Deleted object");
        Ok(())
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix);
            if let Some(token) = &continuation {
                request = request.continuation_token(token);
            }

            let response = request.send().await.map_err(|e| {
                Self::backend_error("list_objects", aws_sdk_s3::error::DisplayErrorContext(&e))
            })?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|object| object.key().map(String::from)),
            );

            if response.is_truncated() == Some(true) {
                continuation = response.next_continuation_token().map(String::from);
            } else {
                break;
            }
        }

        Ok(keys)
    }
}
