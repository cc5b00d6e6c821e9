use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_s3::primitives::ByteStream as AwsByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart as AwsCompletedPart};
use aws_sdk_s3::Client;
use std::env;

use crate::client::{AbortUploadRequest, CompleteUploadRequest, CreatedUpload, UploadPartRequest, UploadedPart};
use crate::{BlobError, BlobResult, Destination, SessionId, StorageClient, UploadReceipt};

/// Connection settings for an S3-compatible service
#[derive(Clone)]
pub struct S3Config {
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Custom endpoint for S3-compatible services (MinIO, RustFS, OSS ...)
    pub endpoint_url: Option<String>,
    pub force_path_style: bool,
}

impl S3Config {
    /// Read `S3_REGION`, `S3_ACCESS_KEY_ID`, `S3_SECRET_ACCESS_KEY` and the
    /// optional `S3_ENDPOINT_URL`. A custom endpoint switches to path-style
    /// addressing.
    pub fn from_env() -> BlobResult<Self> {
        fn get_env(key: &str) -> BlobResult<String> {
            env::var(key).map_err(|_| BlobError::invalid(format!("{} environment variable required", key)))
        }

        let endpoint_url = env::var("S3_ENDPOINT_URL").ok().filter(|url| !url.is_empty());

        Ok(Self {
            region: get_env("S3_REGION")?,
            access_key_id: get_env("S3_ACCESS_KEY_ID")?,
            secret_access_key: get_env("S3_SECRET_ACCESS_KEY")?,
            force_path_style: endpoint_url.is_some(),
            endpoint_url,
        })
    }
}

/// Storage client backed by the AWS SDK
#[derive(Clone)]
pub struct S3StorageClient {
    client: Client,
}

impl S3StorageClient {
    /// Wrap an already configured SDK client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from environment settings
    pub async fn from_env() -> BlobResult<Self> {
        let config = S3Config::from_env()?;
        Ok(Self::from_config(config).await)
    }

    pub async fn from_config(config: S3Config) -> Self {
        let credentials = Credentials::new(
            config.access_key_id,
            config.secret_access_key,
            None,
            None,
            "dog-upload-stream",
        );

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region))
            .credentials_provider(credentials);
        if let Some(endpoint_url) = config.endpoint_url {
            loader = loader.endpoint_url(endpoint_url);
        }
        let aws_config = loader.load().await;

        let client = Client::from_conf(
            aws_sdk_s3::config::Builder::from(&aws_config)
                .force_path_style(config.force_path_style)
                .build(),
        );
        Self { client }
    }

    fn map_aws_error(err: impl std::error::Error + Send + Sync + 'static) -> BlobError {
        BlobError::backend(err)
    }

    fn sdk_part_number(part_number: u32) -> BlobResult<i32> {
        i32::try_from(part_number).map_err(|_| BlobError::invalid(format!("Part number {} out of range", part_number)))
    }
}

#[async_trait]
impl StorageClient for S3StorageClient {
    async fn create_multipart_upload(&self, destination: &Destination) -> BlobResult<CreatedUpload> {
        let mut request = self
            .client
            .create_multipart_upload()
            .bucket(&destination.bucket)
            .key(&destination.key);

        if let Some(content_type) = &destination.content_type {
            request = request.content_type(content_type);
        }

        let output = request.send().await.map_err(Self::map_aws_error)?;
        let upload_id = output
            .upload_id()
            .ok_or_else(|| BlobError::invalid("Create multipart upload response carried no upload id"))?;

        Ok(CreatedUpload {
            session_id: SessionId::from(upload_id),
            destination: destination.clone(),
        })
    }

    async fn upload_part(&self, request: UploadPartRequest) -> BlobResult<UploadedPart> {
        let output = self
            .client
            .upload_part()
            .bucket(&request.destination.bucket)
            .key(&request.destination.key)
            .upload_id(request.session_id.as_str())
            .part_number(Self::sdk_part_number(request.part_number)?)
            .body(AwsByteStream::from(request.body))
            .send()
            .await
            .map_err(Self::map_aws_error)?;

        let etag = output
            .e_tag()
            .ok_or_else(|| BlobError::invalid(format!("Upload of part {} returned no ETag", request.part_number)))?;

        Ok(UploadedPart { etag: etag.to_string() })
    }

    async fn complete_multipart_upload(&self, request: CompleteUploadRequest) -> BlobResult<UploadReceipt> {
        let parts = request
            .parts
            .iter()
            .map(|part| -> BlobResult<AwsCompletedPart> {
                Ok(AwsCompletedPart::builder()
                    .e_tag(&part.etag)
                    .part_number(Self::sdk_part_number(part.part_number)?)
                    .build())
            })
            .collect::<BlobResult<Vec<_>>>()?;
        let part_count = parts.len() as u32;

        let output = self
            .client
            .complete_multipart_upload()
            .bucket(&request.destination.bucket)
            .key(&request.destination.key)
            .upload_id(request.session_id.as_str())
            .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
            .send()
            .await
            .map_err(Self::map_aws_error)?;

        let mut receipt = UploadReceipt::new(request.destination, request.session_id, part_count);
        if let Some(location) = output.location() {
            receipt = receipt.with_location(location);
        }
        if let Some(etag) = output.e_tag() {
            receipt = receipt.with_etag(etag);
        }
        if let Some(version_id) = output.version_id() {
            receipt = receipt.with_version_id(version_id);
        }
        Ok(receipt)
    }

    async fn abort_multipart_upload(&self, request: AbortUploadRequest) -> BlobResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&request.destination.bucket)
            .key(&request.destination.key)
            .upload_id(request.session_id.as_str())
            .send()
            .await
            .map_err(Self::map_aws_error)?;
        Ok(())
    }
}
