//! DigitalOcean Spaces backend
//!
//! Spaces speaks the S3 API, so this is a thin adapter over `aws-sdk-s3`
//! pointed at `https://{region}.digitaloceanspaces.com`.

use std::future::Future;

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{BucketVersioningStatus, ObjectCannedAcl, VersioningConfiguration};
use aws_sdk_s3::Client as S3Client;
use tracing::debug;

use crate::backend::{ListPage, ObjectBackend, PutReceipt, PutRequest, StoredObject};
use crate::error::{ObjectStoreError, Result};
use crate::retry::RetryPolicy;

/// Largest page ListObjects returns
const MAX_KEYS: i32 = 1000;

const HTTP_NOT_FOUND: u16 = 404;
const HTTP_PRECONDITION_FAILED: u16 = 412;

/// Static credentials for a Spaces region
#[derive(Debug, Clone)]
pub struct SpacesCredentials {
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
}

impl SpacesCredentials {
    pub fn endpoint(&self) -> String {
        format!("https://{}.digitaloceanspaces.com", self.region)
    }
}

/// Signing region Spaces requires for CreateBucket, whatever the endpoint
pub const CREATE_BUCKET_REGION: &str = "us-east-1";

/// S3-compatible backend bound to one bucket
pub struct SpacesBackend {
    client: S3Client,
    create_client: S3Client,
    bucket: String,
    creation_wait: RetryPolicy,
}

fn s3_config(credentials: &SpacesCredentials, signing_region: &str) -> aws_sdk_s3::Config {
    aws_sdk_s3::Config::builder()
        .behavior_version(BehaviorVersion::latest())
        .region(Region::new(signing_region.to_string()))
        .endpoint_url(credentials.endpoint())
        .credentials_provider(Credentials::new(
            credentials.access_key.clone(),
            credentials.secret_key.clone(),
            None,
            None,
            "cloudexec",
        ))
        .force_path_style(false)
        .build()
}

impl SpacesBackend {
    pub fn new(credentials: &SpacesCredentials, bucket: impl Into<String>) -> Self {
        Self {
            client: S3Client::from_conf(s3_config(credentials, &credentials.region)),
            create_client: S3Client::from_conf(s3_config(credentials, CREATE_BUCKET_REGION)),
            bucket: bucket.into(),
            creation_wait: RetryPolicy::default(),
        }
    }

    pub fn from_client(client: S3Client, bucket: impl Into<String>) -> Self {
        Self {
            create_client: client.clone(),
            client,
            bucket: bucket.into(),
            creation_wait: RetryPolicy::default(),
        }
    }

    /// How long `create_container` waits for a new bucket to become visible
    pub fn with_creation_wait(mut self, policy: RetryPolicy) -> Self {
        self.creation_wait = policy;
        self
    }

    /// Names of every bucket visible to these credentials
    pub async fn list_buckets(&self) -> Result<Vec<String>> {
        let output = self
            .client
            .list_buckets()
            .send()
            .await
            .map_err(|e| sdk_failure("list-buckets", "*", &e))?;

        Ok(output
            .buckets()
            .iter()
            .filter_map(|b| b.name().map(str::to_string))
            .collect())
    }
}

fn status_of<E>(err: &SdkError<E>) -> Option<u16> {
    err.raw_response().map(|response| response.status().as_u16())
}

fn sdk_failure<E>(operation: &'static str, target: &str, err: &SdkError<E>) -> ObjectStoreError
where
    E: std::error::Error + 'static,
{
    ObjectStoreError::transient(operation, target, DisplayErrorContext(err))
}

/// Run `probe` until it reports true, pausing between attempts per `policy`.
///
/// Errors from `probe` end the wait immediately.
async fn wait_until<F, Fut>(policy: RetryPolicy, mut probe: F) -> Result<bool>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let mut attempt = 1;
    loop {
        if probe().await? {
            return Ok(true);
        }
        if policy.is_last(attempt) {
            return Ok(false);
        }
        tokio::time::sleep(policy.delay_after(attempt)).await;
        attempt += 1;
    }
}

#[async_trait]
impl ObjectBackend for SpacesBackend {
    fn container(&self) -> &str {
        &self.bucket
    }

    async fn container_exists(&self) -> Result<bool> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => Ok(true),
            Err(e) if status_of(&e) == Some(HTTP_NOT_FOUND) => Ok(false),
            Err(e) if e.as_service_error().map_or(false, |s| s.is_not_found()) => Ok(false),
            Err(e) => Err(sdk_failure("head-bucket", &self.bucket, &e)),
        }
    }

    async fn create_container(&self) -> Result<()> {
        self.create_client
            .create_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| sdk_failure("create-bucket", &self.bucket, &e))?;

        let visible = wait_until(self.creation_wait, || self.container_exists()).await?;
        if !visible {
            return Err(ObjectStoreError::transient(
                "head-bucket",
                &self.bucket,
                "bucket not visible after creation",
            ));
        }
        debug!(bucket = %self.bucket, "Bucket created");
        Ok(())
    }

    async fn enable_versioning(&self) -> Result<()> {
        self.client
            .put_bucket_versioning()
            .bucket(&self.bucket)
            .versioning_configuration(
                VersioningConfiguration::builder()
                    .status(BucketVersioningStatus::Enabled)
                    .build(),
            )
            .send()
            .await
            .map_err(|e| sdk_failure("put-bucket-versioning", &self.bucket, &e))?;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<StoredObject> {
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(e) if e.as_service_error().map_or(false, |s| s.is_no_such_key()) => {
                return Err(ObjectStoreError::not_found(key))
            }
            Err(e) if status_of(&e) == Some(HTTP_NOT_FOUND) => {
                return Err(ObjectStoreError::not_found(key))
            }
            Err(e) => return Err(sdk_failure("get", key, &e)),
        };

        let etag = output.e_tag().map(str::to_string);
        let body = output
            .body
            .collect()
            .await
            .map_err(|e| ObjectStoreError::transient("get", key, e))?
            .into_bytes()
            .to_vec();

        debug!(bucket = %self.bucket, key, bytes = body.len(), "Fetched object");
        Ok(StoredObject { body, etag })
    }

    async fn put_object(&self, request: PutRequest) -> Result<PutReceipt> {
        let key = request.key.clone();
        let mut builder = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&request.key)
            .set_if_match(request.if_match)
            .set_content_md5(request.content_md5)
            .set_content_type(request.content_type);

        if !request.body.is_empty() {
            builder = builder
                .body(ByteStream::from(request.body))
                .acl(ObjectCannedAcl::Private);
        }

        match builder.send().await {
            Ok(output) => Ok(PutReceipt {
                etag: output.e_tag().map(str::to_string),
            }),
            Err(e) if status_of(&e) == Some(HTTP_PRECONDITION_FAILED) => {
                Err(ObjectStoreError::PreconditionFailed { key })
            }
            Err(e) => Err(sdk_failure("put", &key, &e)),
        }
    }

    async fn list_page(&self, prefix: &str, marker: Option<&str>) -> Result<ListPage> {
        let mut request = self
            .client
            .list_objects()
            .bucket(&self.bucket)
            .max_keys(MAX_KEYS)
            .set_marker(marker.map(str::to_string));
        if !prefix.is_empty() {
            request = request.prefix(prefix);
        }

        let output = request
            .send()
            .await
            .map_err(|e| sdk_failure("list", prefix, &e))?;

        let keys: Vec<String> = output
            .contents()
            .iter()
            .filter_map(|object| object.key().map(str::to_string))
            .collect();

        // NextMarker is only sent alongside a delimiter; otherwise the last key
        // of the page is the marker.
        let next_marker = if output.is_truncated().unwrap_or(false) {
            output
                .next_marker()
                .map(str::to_string)
                .or_else(|| keys.last().cloned())
        } else {
            None
        };

        Ok(ListPage { keys, next_marker })
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| sdk_failure("delete", key, &e))?;
        Ok(())
    }
}
