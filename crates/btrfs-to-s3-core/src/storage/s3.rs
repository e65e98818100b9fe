use std::io::Read;
use std::path::Path;

use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    CompletedMultipartUpload, CompletedPart, GlacierJobParameters, RestoreRequest,
    ServerSideEncryption, StorageClass, Tier,
};
use aws_sdk_s3::Client;
use tokio::runtime::Runtime;
use tokio_util::io::SyncIoBridge;

use super::{CompletedPartInfo, HeadInfo, ObjectStore, PutOptions};
use crate::error::{B2sError, Result};
use crate::retry::{with_retry, OpError, RetryPolicy};

/// S3 backend driven from synchronous code.
///
/// The store owns a small multi-thread tokio runtime and issues every SDK
/// call through `block_on`; uploader workers block their own OS threads
/// while the runtime drives the I/O. Credentials resolve through the SDK's
/// standard chain (environment, profile, IMDS), never from our config.
pub struct S3Store {
    bucket: String,
    client: Client,
    runtime: Runtime,
    retry: RetryPolicy,
}

impl S3Store {
    pub fn new(region: &str, bucket: &str) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .map_err(|e| B2sError::Storage(format!("failed to build tokio runtime: {e}")))?;
        let config = runtime.block_on(
            aws_config::defaults(BehaviorVersion::latest())
                .region(Region::new(region.to_string()))
                .load(),
        );
        Ok(Self {
            bucket: bucket.to_string(),
            client: Client::new(&config),
            runtime,
            retry: RetryPolicy::default(),
        })
    }

    fn storage_err(e: OpError) -> B2sError {
        B2sError::Storage(e.message)
    }
}

/// Whether the environment carries usable S3 credentials.
pub fn has_ambient_credentials() -> bool {
    if std::env::var("AWS_PROFILE").is_ok_and(|v| !v.is_empty()) {
        return true;
    }
    let access = std::env::var("AWS_ACCESS_KEY_ID").unwrap_or_default();
    let secret = std::env::var("AWS_SECRET_ACCESS_KEY").unwrap_or_default();
    !access.is_empty() && !secret.is_empty()
}

/// Classify an SDK error for the retry loop.
///
/// Timeouts, dispatch failures, and malformed responses are network-level
/// and always transient. Service errors are transient when S3 reports
/// throttling or a server-side (5xx-class) condition.
fn op_error<E, R>(context: &str, err: &SdkError<E, R>) -> OpError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let transient = match err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            true
        }
        SdkError::ServiceError(_) => is_transient_code(err.code()),
        _ => false,
    };
    OpError {
        message: format!("{context}: {}", DisplayErrorContext(err)),
        transient,
    }
}

fn is_transient_code(code: Option<&str>) -> bool {
    matches!(
        code.unwrap_or_default(),
        "SlowDown"
            | "Throttling"
            | "ThrottlingException"
            | "TooManyRequestsException"
            | "RequestTimeout"
            | "RequestTimeoutException"
            | "InternalError"
            | "ServiceUnavailable"
    )
}

impl ObjectStore for S3Store {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        with_retry(&self.retry, &format!("GET {key}"), || {
            self.runtime.block_on(async {
                match self
                    .client
                    .get_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .send()
                    .await
                {
                    Ok(resp) => {
                        let data = resp.body.collect().await.map_err(|e| {
                            OpError::transient(format!("GET {key}: body read: {e}"))
                        })?;
                        Ok(Some(data.into_bytes().to_vec()))
                    }
                    Err(e) => {
                        if let SdkError::ServiceError(ctx) = &e {
                            if ctx.err().is_no_such_key() {
                                return Ok(None);
                            }
                        }
                        Err(op_error(&format!("GET {key}"), &e))
                    }
                }
            })
        })
        .map_err(Self::storage_err)
    }

    fn get_reader(&self, key: &str) -> Result<Box<dyn Read + Send>> {
        let resp = with_retry(&self.retry, &format!("GET {key}"), || {
            self.runtime.block_on(async {
                self.client
                    .get_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .send()
                    .await
                    .map_err(|e| {
                        if let SdkError::ServiceError(ctx) = &e {
                            if ctx.err().is_no_such_key() {
                                return OpError::permanent(format!("missing object {key}"));
                            }
                        }
                        op_error(&format!("GET {key}"), &e)
                    })
            })
        })
        .map_err(Self::storage_err)?;
        let reader =
            SyncIoBridge::new_with_handle(resp.body.into_async_read(), self.runtime.handle().clone());
        Ok(Box::new(reader))
    }

    fn put(&self, key: &str, body: &[u8], opts: &PutOptions) -> Result<Option<String>> {
        with_retry(&self.retry, &format!("PUT {key}"), || {
            self.runtime.block_on(async {
                let mut request = self
                    .client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .body(ByteStream::from(body.to_vec()))
                    .storage_class(StorageClass::from(opts.storage_class.as_str()))
                    .server_side_encryption(ServerSideEncryption::from(opts.sse.as_str()));
                if let Some(content_type) = opts.content_type {
                    request = request.content_type(content_type);
                }
                let resp = request
                    .send()
                    .await
                    .map_err(|e| op_error(&format!("PUT {key}"), &e))?;
                Ok(resp.e_tag().map(str::to_string))
            })
        })
        .map_err(Self::storage_err)
    }

    fn head(&self, key: &str) -> Result<Option<HeadInfo>> {
        with_retry(&self.retry, &format!("HEAD {key}"), || {
            self.runtime.block_on(async {
                match self
                    .client
                    .head_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .send()
                    .await
                {
                    Ok(resp) => Ok(Some(HeadInfo {
                        size: resp.content_length().unwrap_or(0).max(0) as u64,
                        etag: resp.e_tag().map(str::to_string),
                        storage_class: resp.storage_class().map(|c| c.as_str().to_string()),
                        restore: resp.restore().map(str::to_string),
                    })),
                    Err(e) => {
                        if let SdkError::ServiceError(ctx) = &e {
                            if ctx.err().is_not_found() {
                                return Ok(None);
                            }
                        }
                        Err(op_error(&format!("HEAD {key}"), &e))
                    }
                }
            })
        })
        .map_err(Self::storage_err)
    }

    fn create_multipart(&self, key: &str, opts: &PutOptions) -> Result<String> {
        with_retry(&self.retry, &format!("CREATE_MULTIPART {key}"), || {
            self.runtime.block_on(async {
                let resp = self
                    .client
                    .create_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .storage_class(StorageClass::from(opts.storage_class.as_str()))
                    .server_side_encryption(ServerSideEncryption::from(opts.sse.as_str()))
                    .send()
                    .await
                    .map_err(|e| op_error(&format!("CREATE_MULTIPART {key}"), &e))?;
                resp.upload_id()
                    .map(str::to_string)
                    .ok_or_else(|| {
                        OpError::permanent(format!("CREATE_MULTIPART {key}: no upload id returned"))
                    })
            })
        })
        .map_err(Self::storage_err)
    }

    fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: &[u8],
    ) -> Result<String> {
        let op = format!("UPLOAD_PART {key}#{part_number}");
        with_retry(&self.retry, &op, || {
            self.runtime.block_on(async {
                let resp = self
                    .client
                    .upload_part()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .part_number(part_number)
                    .body(ByteStream::from(body.to_vec()))
                    .send()
                    .await
                    .map_err(|e| op_error(&op, &e))?;
                resp.e_tag()
                    .map(str::to_string)
                    .ok_or_else(|| OpError::permanent(format!("{op}: no etag returned")))
            })
        })
        .map_err(Self::storage_err)
    }

    fn upload_part_file(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        path: &Path,
    ) -> Result<String> {
        let op = format!("UPLOAD_PART {key}#{part_number}");
        with_retry(&self.retry, &op, || {
            self.runtime.block_on(async {
                let body = ByteStream::from_path(path)
                    .await
                    .map_err(|e| OpError::permanent(format!("{op}: spool file: {e}")))?;
                let resp = self
                    .client
                    .upload_part()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .part_number(part_number)
                    .body(body)
                    .send()
                    .await
                    .map_err(|e| op_error(&op, &e))?;
                resp.e_tag()
                    .map(str::to_string)
                    .ok_or_else(|| OpError::permanent(format!("{op}: no etag returned")))
            })
        })
        .map_err(Self::storage_err)
    }

    fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPartInfo],
    ) -> Result<Option<String>> {
        let completed: Vec<CompletedPart> = parts
            .iter()
            .map(|p| {
                CompletedPart::builder()
                    .part_number(p.part_number)
                    .e_tag(&p.etag)
                    .build()
            })
            .collect();
        with_retry(&self.retry, &format!("COMPLETE_MULTIPART {key}"), || {
            let completed = completed.clone();
            self.runtime.block_on(async {
                let resp = self
                    .client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(completed))
                            .build(),
                    )
                    .send()
                    .await
                    .map_err(|e| op_error(&format!("COMPLETE_MULTIPART {key}"), &e))?;
                Ok(resp.e_tag().map(str::to_string))
            })
        })
        .map_err(Self::storage_err)
    }

    fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<()> {
        with_retry(&self.retry, &format!("ABORT_MULTIPART {key}"), || {
            self.runtime.block_on(async {
                self.client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .send()
                    .await
                    .map_err(|e| op_error(&format!("ABORT_MULTIPART {key}"), &e))?;
                Ok(())
            })
        })
        .map_err(Self::storage_err)
    }

    fn restore_object(&self, key: &str, tier: &str, days: i32) -> Result<()> {
        with_retry(&self.retry, &format!("RESTORE {key}"), || {
            self.runtime.block_on(async {
                let request = RestoreRequest::builder()
                    .days(days)
                    .glacier_job_parameters(
                        GlacierJobParameters::builder()
                            .tier(Tier::from(tier))
                            .build()
                            .map_err(|e| {
                                OpError::permanent(format!("RESTORE {key}: bad tier: {e}"))
                            })?,
                    )
                    .build();
                match self
                    .client
                    .restore_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .restore_request(request)
                    .send()
                    .await
                {
                    Ok(_) => Ok(()),
                    Err(e) => {
                        // RestoreAlreadyInProgress means a prior run asked
                        // first; polling will observe completion either way.
                        if e.code() == Some("RestoreAlreadyInProgress") {
                            return Ok(());
                        }
                        Err(op_error(&format!("RESTORE {key}"), &e))
                    }
                }
            })
        })
        .map_err(Self::storage_err)
    }
}
