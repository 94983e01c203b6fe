use async_trait::async_trait;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::operation::put_object::PutObjectError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tokio_util::sync::CancellationToken;

use super::{BlobStore, Cas, Record};
use crate::error::StoreError;
use crate::model::WorkflowState;

/// `BlobStore` backed by S3 conditional-write headers (§4.1): `If-None-Match: *` for
/// create-if-absent, `If-Match: <etag>` for compare-and-write. The returned `ETag` becomes the
/// next CAS token. Grounded on the `s3-util` crate's `aws-sdk-s3` client wiring in this codebase
/// lineage.
pub struct S3BlobStore {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3BlobStore {
    pub fn new(client: Client, bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            prefix: prefix.into(),
        }
    }

    fn object_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn get(&self, key: &str, cancel: &CancellationToken) -> Result<Option<Record>, StoreError> {
        let object_key = self.object_key(key);

        let request = self.client.get_object().bucket(&self.bucket).key(&object_key).send();
        let resp = tokio::select! {
            resp = request => resp,
            _ = cancel.cancelled() => return Err(StoreError::Cancelled),
        };

        let output = match resp {
            Ok(output) => output,
            Err(SdkError::ServiceError(e)) if matches!(e.err(), GetObjectError::NoSuchKey(_)) => {
                return Ok(None);
            }
            Err(err) => return Err(StoreError::Backend(err.to_string())),
        };

        let etag = output
            .e_tag()
            .ok_or_else(|| StoreError::Backend("s3 object missing etag".into()))?
            .to_string();

        let bytes = tokio::select! {
            collected = output.body.collect() => collected.map_err(|err| StoreError::Backend(err.to_string()))?.into_bytes(),
            _ = cancel.cancelled() => return Err(StoreError::Cancelled),
        };

        let state: WorkflowState = serde_json::from_slice(&bytes)
            .map_err(|err| StoreError::Serialization(err.to_string()))?;

        Ok(Some(Record {
            rev: state.rev,
            state,
            cas: etag,
        }))
    }

    async fn put(
        &self,
        key: &str,
        state: &WorkflowState,
        cas: Option<&Cas>,
        cancel: &CancellationToken,
    ) -> Result<u64, StoreError> {
        let object_key = self.object_key(key);

        let body = serde_json::to_vec(state).map_err(|err| StoreError::Serialization(err.to_string()))?;

        let mut req = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .body(ByteStream::from(body));

        req = match cas {
            None => req.if_none_match("*"),
            Some(etag) => req.if_match(etag),
        };

        let result = tokio::select! {
            result = req.send() => result,
            _ = cancel.cancelled() => return Err(StoreError::Cancelled),
        };

        match result {
            Ok(_) => Ok(state.rev + 1),
            Err(SdkError::ServiceError(e)) if is_precondition_failed(e.err()) => {
                Err(StoreError::Conflict { key: key.to_string() })
            }
            Err(err) => Err(StoreError::Backend(err.to_string())),
        }
    }
}

fn is_precondition_failed(err: &PutObjectError) -> bool {
    // S3 reports conditional-write failures as a generic "PreconditionFailed" HTTP 412, which
    // the smithy-generated error type surfaces as an unmodeled/unknown variant rather than a
    // dedicated enum case.
    err.meta().code() == Some("PreconditionFailed")
}
