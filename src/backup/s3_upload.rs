// dumpship/src/backup/s3_upload.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::error::DisplayErrorContext;
use s3::primitives::ByteStream;
use s3::types::{CompletedMultipartUpload, CompletedPart};
use std::future::Future;
use std::io;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use super::capture::{DumpArtifact, FileDump, LiveDump};
use super::sink::Location;
use crate::config::ObjectStoreTarget;
use crate::errors::{BackupError, UploadError};

/// Multipart part size. Also the threshold under which a single PutObject is used.
pub const PART_SIZE: usize = 8 * 1024 * 1024;

fn sdk_error(context: &str, err: impl std::error::Error) -> UploadError {
    UploadError::Transport(format!("{}: {}", context, DisplayErrorContext(err)))
}

/// Cancellation wins when both sides are ready.
async fn until_cancelled<F: Future>(
    cancel: &CancellationToken,
    fut: F,
) -> Result<F::Output, UploadError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(UploadError::Cancelled),
        out = fut => Ok(out),
    }
}

/// Reads until `buf` holds `limit` bytes or the reader is exhausted. Returns `true` on EOF.
pub async fn fill_part<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    limit: usize,
) -> io::Result<bool> {
    buf.clear();
    while buf.len() < limit {
        let remaining = (limit - buf.len()) as u64;
        if (&mut *reader).take(remaining).read_buf(buf).await? == 0 {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn object_key(prefix: Option<&str>, name: &str) -> String {
    match prefix.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
        Some(prefix) => format!("{}/{}", prefix, name),
        None => name.to_string(),
    }
}

/// Public URL of an object, path-style for custom endpoints and virtual-hosted for AWS.
pub fn object_url(target: &ObjectStoreTarget, key: &str) -> String {
    match &target.endpoint {
        Some(endpoint) => format!("{}/{}/{}", endpoint, target.bucket, key),
        None => format!(
            "https://{}.s3.{}.amazonaws.com/{}",
            target.bucket, target.region, key
        ),
    }
}

/// A part accepted by the store, as needed to complete the upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedPart {
    pub part_number: i32,
    pub e_tag: String,
}

/// The S3 calls the backend makes.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStoreApi: Send + Sync {
    async fn head_bucket(&self, bucket: &str) -> Result<(), UploadError>;

    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), UploadError>;

    async fn put_file(&self, bucket: &str, key: &str, path: &Path) -> Result<(), UploadError>;

    /// Returns the upload id.
    async fn create_multipart_upload(&self, bucket: &str, key: &str) -> Result<String, UploadError>;

    /// Returns the part's ETag.
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Vec<u8>,
    ) -> Result<String, UploadError>;

    /// Returns the object location the store reported, if any.
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<UploadedPart>,
    ) -> Result<Option<String>, UploadError>;

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), UploadError>;
}

/// `ObjectStoreApi` over the AWS SDK client.
pub struct S3Client {
    client: s3::Client,
}

impl S3Client {
    pub async fn connect(target: &ObjectStoreTarget) -> Self {
        let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .region(Region::new(target.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                &target.access_key_id,
                &target.secret_key,
                None,
                None,
                "Static",
            ));
        if let Some(endpoint) = &target.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        let conf = s3::config::Builder::from(&sdk_config)
            .force_path_style(target.force_path_style)
            .build();
        S3Client {
            client: s3::Client::from_conf(conf),
        }
    }
}

#[async_trait]
impl ObjectStoreApi for S3Client {
    async fn head_bucket(&self, bucket: &str) -> Result<(), UploadError> {
        self.client
            .head_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| sdk_error(&format!("bucket {} is not accessible", bucket), e))?;
        Ok(())
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), UploadError> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| {
                sdk_error(
                    &format!("failed to upload to bucket {} with key {}", bucket, key),
                    e,
                )
            })?;
        Ok(())
    }

    async fn put_file(&self, bucket: &str, key: &str, path: &Path) -> Result<(), UploadError> {
        let body = ByteStream::from_path(path).await.map_err(|e| {
            UploadError::Transport(format!("failed to open {}: {}", path.display(), e))
        })?;
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                sdk_error(
                    &format!("failed to upload {} to bucket {}", path.display(), bucket),
                    e,
                )
            })?;
        Ok(())
    }

    async fn create_multipart_upload(&self, bucket: &str, key: &str) -> Result<String, UploadError> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| sdk_error("failed to start multipart upload", e))?;
        created
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| UploadError::Transport("multipart upload has no id".to_string()))
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Vec<u8>,
    ) -> Result<String, UploadError> {
        let output = self
            .client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| sdk_error(&format!("failed to upload part {}", part_number), e))?;
        Ok(output.e_tag().unwrap_or_default().to_string())
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<UploadedPart>,
    ) -> Result<Option<String>, UploadError> {
        let parts = parts
            .into_iter()
            .map(|part| {
                CompletedPart::builder()
                    .e_tag(part.e_tag)
                    .part_number(part.part_number)
                    .build()
            })
            .collect();
        let output = self
            .client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| sdk_error("failed to complete multipart upload", e))?;
        Ok(output.location().map(str::to_string))
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), UploadError> {
        self.client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| sdk_error("failed to abort multipart upload", e))?;
        Ok(())
    }
}

/// Bytes read so far, held until the dump's exit status says they may be committed.
enum Staged {
    Single(Vec<u8>),
    Multipart {
        upload_id: String,
        parts: Vec<UploadedPart>,
    },
}

/// S3-compatible object storage backend.
pub struct ObjectStoreBackend {
    api: Box<dyn ObjectStoreApi>,
    target: ObjectStoreTarget,
    part_size: usize,
}

impl ObjectStoreBackend {
    pub fn new(api: Box<dyn ObjectStoreApi>, target: ObjectStoreTarget) -> Self {
        ObjectStoreBackend {
            api,
            target,
            part_size: PART_SIZE,
        }
    }

    pub async fn connect(target: ObjectStoreTarget) -> Self {
        let client = S3Client::connect(&target).await;
        ObjectStoreBackend::new(Box::new(client), target)
    }

    #[cfg(test)]
    fn with_part_size(mut self, part_size: usize) -> Self {
        self.part_size = part_size;
        self
    }

    pub fn describe(&self) -> String {
        match &self.target.endpoint {
            Some(endpoint) => format!("bucket {} at {}", self.target.bucket, endpoint),
            None => format!("bucket {} in {}", self.target.bucket, self.target.region),
        }
    }

    /// Confirms the bucket is reachable before a dump is started.
    pub async fn preflight(&self) -> Result<(), UploadError> {
        debug!(bucket = %self.target.bucket, "Checking object storage bucket");
        self.api.head_bucket(&self.target.bucket).await?;
        info!(bucket = %self.target.bucket, "Target bucket is accessible");
        Ok(())
    }

    pub async fn deliver(
        &self,
        artifact: DumpArtifact,
        cancel: &CancellationToken,
    ) -> Result<Location, BackupError> {
        let key = object_key(self.target.prefix.as_deref(), artifact.name());
        info!(bucket = %self.target.bucket, key = %key, "Uploading backup to object storage");

        let reported = match artifact {
            DumpArtifact::File(file) => self.deliver_file(&key, file, cancel).await?,
            DumpArtifact::Stream(live) => self.deliver_stream(&key, live, cancel).await?,
        };

        let location = reported.unwrap_or_else(|| object_url(&self.target, &key));
        info!(location = %location, "Successfully uploaded backup to object storage");
        Ok(Location::new(location))
    }

    async fn deliver_file(
        &self,
        key: &str,
        file: FileDump,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, UploadError> {
        if file.len <= self.part_size as u64 {
            until_cancelled(cancel, self.api.put_file(&self.target.bucket, key, &file.path))
                .await??;
            return Ok(None);
        }

        let mut reader = tokio::fs::File::open(&file.path).await?;
        let staged = self.stage(key, &mut reader, cancel).await?;
        self.commit(key, staged).await
    }

    async fn deliver_stream(
        &self,
        key: &str,
        mut live: LiveDump,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, BackupError> {
        let staged = match self.stage(key, live.reader(), cancel).await {
            Ok(staged) => staged,
            Err(e) => {
                live.terminate().await;
                return Err(e.into());
            }
        };

        // The exit status decides whether the staged bytes become an object.
        if let Err(e) = live.finish().await {
            self.discard(key, staged).await;
            return Err(e);
        }
        Ok(self.commit(key, staged).await?)
    }

    async fn stage<R: AsyncRead + Unpin>(
        &self,
        key: &str,
        reader: &mut R,
        cancel: &CancellationToken,
    ) -> Result<Staged, UploadError> {
        let mut first = Vec::with_capacity(self.part_size);
        if until_cancelled(cancel, fill_part(reader, &mut first, self.part_size)).await?? {
            debug!(bytes = first.len(), "Dump fits in a single request");
            return Ok(Staged::Single(first));
        }

        let upload_id = self
            .api
            .create_multipart_upload(&self.target.bucket, key)
            .await?;
        match self.send_parts(key, &upload_id, reader, first, cancel).await {
            Ok(parts) => Ok(Staged::Multipart { upload_id, parts }),
            Err(e) => {
                self.abort(key, &upload_id).await;
                Err(e)
            }
        }
    }

    async fn send_parts<R: AsyncRead + Unpin>(
        &self,
        key: &str,
        upload_id: &str,
        reader: &mut R,
        mut buf: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<Vec<UploadedPart>, UploadError> {
        let mut parts = Vec::new();
        let mut eof = false;
        loop {
            let part_number = parts.len() as i32 + 1;
            let bytes = buf.len();
            let e_tag = until_cancelled(
                cancel,
                self.api.upload_part(
                    &self.target.bucket,
                    key,
                    upload_id,
                    part_number,
                    std::mem::take(&mut buf),
                ),
            )
            .await??;
            debug!(part_number, bytes, "Uploaded part");
            parts.push(UploadedPart { part_number, e_tag });

            if eof {
                break;
            }
            buf = Vec::with_capacity(self.part_size);
            eof = until_cancelled(cancel, fill_part(reader, &mut buf, self.part_size)).await??;
            if buf.is_empty() {
                break;
            }
        }
        Ok(parts)
    }

    /// Makes the staged bytes visible under `key`. Returns the location S3 reported, if any.
    async fn commit(&self, key: &str, staged: Staged) -> Result<Option<String>, UploadError> {
        match staged {
            Staged::Single(bytes) => {
                self.api.put_object(&self.target.bucket, key, bytes).await?;
                Ok(None)
            }
            Staged::Multipart { upload_id, parts } => {
                let count = parts.len();
                match self
                    .api
                    .complete_multipart_upload(&self.target.bucket, key, &upload_id, parts)
                    .await
                {
                    Ok(location) => {
                        debug!(parts = count, "Completed multipart upload");
                        Ok(location)
                    }
                    Err(e) => {
                        self.abort(key, &upload_id).await;
                        Err(e)
                    }
                }
            }
        }
    }

    async fn discard(&self, key: &str, staged: Staged) {
        if let Staged::Multipart { upload_id, .. } = staged {
            self.abort(key, &upload_id).await;
        }
    }

    async fn abort(&self, key: &str, upload_id: &str) {
        warn!(key = %key, "Aborting multipart upload");
        if let Err(e) = self
            .api
            .abort_multipart_upload(&self.target.bucket, key, upload_id)
            .await
        {
            warn!(error = %e, "Failed to abort multipart upload");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(endpoint: Option<&str>) -> ObjectStoreTarget {
        ObjectStoreTarget {
            endpoint: endpoint.map(str::to_string),
            bucket: "backups".into(),
            region: "eu-west-1".into(),
            access_key_id: "AKIA".into(),
            secret_key: "secret".into(),
            prefix: None,
            force_path_style: false,
            streaming: None,
        }
    }

    #[tokio::test]
    async fn test_fill_part_splits_reader_into_parts() -> anyhow::Result<()> {
        let data: Vec<u8> = (0..25u8).collect();
        let mut reader = data.as_slice();
        let mut buf = Vec::new();

        assert!(!fill_part(&mut reader, &mut buf, 10).await?);
        assert_eq!(buf, (0..10u8).collect::<Vec<_>>());
        assert!(!fill_part(&mut reader, &mut buf, 10).await?);
        assert_eq!(buf.len(), 10);
        assert!(fill_part(&mut reader, &mut buf, 10).await?);
        assert_eq!(buf, (20..25u8).collect::<Vec<_>>());
        assert!(fill_part(&mut reader, &mut buf, 10).await?);
        assert!(buf.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_fill_part_exact_multiple_reports_eof_on_next_read() -> anyhow::Result<()> {
        let data = [7u8; 8];
        let mut reader = &data[..];
        let mut buf = Vec::new();
        assert!(!fill_part(&mut reader, &mut buf, 8).await?);
        assert_eq!(buf.len(), 8);
        assert!(fill_part(&mut reader, &mut buf, 8).await?);
        assert!(buf.is_empty());
        Ok(())
    }

    #[test]
    fn test_object_key_joins_prefix() {
        assert_eq!(object_key(None, "dump-all.backup"), "dump-all.backup");
        assert_eq!(object_key(Some("pg/"), "dump-all.backup"), "pg/dump-all.backup");
        assert_eq!(object_key(Some("/"), "dump-all.backup"), "dump-all.backup");
    }

    #[test]
    fn test_object_url_for_custom_endpoint_and_aws() {
        assert_eq!(
            object_url(&target(Some("https://fra1.digitaloceanspaces.com")), "k.backup"),
            "https://fra1.digitaloceanspaces.com/backups/k.backup"
        );
        assert_eq!(
            object_url(&target(None), "k.backup"),
            "https://backups.s3.eu-west-1.amazonaws.com/k.backup"
        );
    }

    #[tokio::test]
    async fn test_preflight_reports_inaccessible_bucket() {
        let mut api = MockObjectStoreApi::new();
        api.expect_head_bucket()
            .withf(|bucket| bucket == "backups")
            .times(1)
            .returning(|_| Err(UploadError::Transport("403 Forbidden".into())));

        let backend = ObjectStoreBackend::new(Box::new(api), target(None));
        assert!(matches!(
            backend.preflight().await,
            Err(UploadError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_small_file_is_sent_in_one_request() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("dump-app.backup");
        std::fs::write(&path, b"0123456789")?;

        let mut api = MockObjectStoreApi::new();
        api.expect_put_file()
            .withf(|bucket, key, _| bucket == "backups" && key == "dump-app.backup")
            .times(1)
            .returning(|_, _, _| Ok(()));
        api.expect_create_multipart_upload().times(0);

        let backend = ObjectStoreBackend::new(Box::new(api), target(None));
        let artifact = DumpArtifact::File(FileDump {
            name: "dump-app.backup".into(),
            path,
            len: 10,
        });
        let location = backend.deliver(artifact, &CancellationToken::new()).await?;
        assert_eq!(
            location.as_str(),
            "https://backups.s3.eu-west-1.amazonaws.com/dump-app.backup"
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_large_file_goes_multipart_in_order() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("dump-app.backup");
        std::fs::write(&path, b"0123456789")?;

        let mut api = MockObjectStoreApi::new();
        api.expect_put_file().times(0);
        api.expect_create_multipart_upload()
            .times(1)
            .returning(|_, _| Ok("upload-1".to_string()));
        api.expect_upload_part()
            .withf(|_, _, upload_id, _, body| upload_id == "upload-1" && body.len() <= 4)
            .times(3)
            .returning(|_, _, _, part_number, _| Ok(format!("etag-{}", part_number)));
        api.expect_complete_multipart_upload()
            .withf(|_, _, upload_id, parts| {
                upload_id == "upload-1"
                    && parts.iter().map(|p| p.part_number).collect::<Vec<_>>() == vec![1, 2, 3]
                    && parts[2].e_tag == "etag-3"
            })
            .times(1)
            .returning(|_, _, _, _| Ok(Some("https://store/backups/dump-app.backup".into())));
        api.expect_abort_multipart_upload().times(0);

        let backend = ObjectStoreBackend::new(Box::new(api), target(None)).with_part_size(4);
        let artifact = DumpArtifact::File(FileDump {
            name: "dump-app.backup".into(),
            path,
            len: 10,
        });
        let location = backend.deliver(artifact, &CancellationToken::new()).await?;
        assert_eq!(location.as_str(), "https://store/backups/dump-app.backup");
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_completion_aborts_the_upload() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("dump-app.backup");
        std::fs::write(&path, b"0123456789")?;

        let mut api = MockObjectStoreApi::new();
        api.expect_create_multipart_upload()
            .returning(|_, _| Ok("upload-1".to_string()));
        api.expect_upload_part()
            .returning(|_, _, _, n, _| Ok(format!("etag-{}", n)));
        api.expect_complete_multipart_upload()
            .times(1)
            .returning(|_, _, _, _| Err(UploadError::Transport("InvalidPart".into())));
        api.expect_abort_multipart_upload()
            .withf(|_, _, upload_id| upload_id == "upload-1")
            .times(1)
            .returning(|_, _, _| Ok(()));

        let backend = ObjectStoreBackend::new(Box::new(api), target(None)).with_part_size(4);
        let artifact = DumpArtifact::File(FileDump {
            name: "dump-app.backup".into(),
            path,
            len: 10,
        });
        let result = backend.deliver(artifact, &CancellationToken::new()).await;
        assert!(matches!(result, Err(BackupError::Upload(UploadError::Transport(_)))));
        Ok(())
    }

    #[cfg(unix)]
    mod streaming {
        use super::*;
        use crate::backup::capture::start_stream;
        use crate::backup::db_dump::{DumpOutput, ProcessSpec};

        fn live(script: &str) -> anyhow::Result<DumpArtifact> {
            let spec = ProcessSpec {
                program: "sh".into(),
                args: vec!["-c".into(), script.into()],
                env: Vec::new(),
                output: DumpOutput::Stdout,
            };
            Ok(DumpArtifact::Stream(start_stream(&spec, "dump-all.backup".into())?))
        }

        #[tokio::test]
        async fn test_clean_stream_completes_multipart_upload() -> anyhow::Result<()> {
            let mut api = MockObjectStoreApi::new();
            api.expect_create_multipart_upload()
                .times(1)
                .returning(|_, _| Ok("upload-1".to_string()));
            api.expect_upload_part()
                .times(3)
                .returning(|_, _, _, n, _| Ok(format!("etag-{}", n)));
            api.expect_complete_multipart_upload()
                .withf(|_, key, _, parts| key == "dump-all.backup" && parts.len() == 3)
                .times(1)
                .returning(|_, _, _, _| Ok(None));
            api.expect_abort_multipart_upload().times(0);

            let backend = ObjectStoreBackend::new(Box::new(api), target(None)).with_part_size(4);
            let location = backend
                .deliver(live("printf abcdefghij")?, &CancellationToken::new())
                .await?;
            assert_eq!(
                location.as_str(),
                "https://backups.s3.eu-west-1.amazonaws.com/dump-all.backup"
            );
            Ok(())
        }

        #[tokio::test]
        async fn test_short_clean_stream_is_one_put() -> anyhow::Result<()> {
            let mut api = MockObjectStoreApi::new();
            api.expect_create_multipart_upload().times(0);
            api.expect_put_object()
                .withf(|_, _, body| body == b"ab")
                .times(1)
                .returning(|_, _, _| Ok(()));

            let backend = ObjectStoreBackend::new(Box::new(api), target(None)).with_part_size(4);
            backend
                .deliver(live("printf ab")?, &CancellationToken::new())
                .await?;
            Ok(())
        }

        #[tokio::test]
        async fn test_non_zero_exit_after_parts_aborts_instead_of_completing() -> anyhow::Result<()> {
            let mut api = MockObjectStoreApi::new();
            api.expect_create_multipart_upload()
                .times(1)
                .returning(|_, _| Ok("upload-1".to_string()));
            api.expect_upload_part()
                .returning(|_, _, _, n, _| Ok(format!("etag-{}", n)));
            api.expect_complete_multipart_upload().times(0);
            api.expect_put_object().times(0);
            api.expect_abort_multipart_upload()
                .withf(|_, _, upload_id| upload_id == "upload-1")
                .times(1)
                .returning(|_, _, _| Ok(()));

            let backend = ObjectStoreBackend::new(Box::new(api), target(None)).with_part_size(4);
            let result = backend
                .deliver(
                    live("printf abcdefghij; echo 'pg_dumpall: error: query failed' >&2; exit 2")?,
                    &CancellationToken::new(),
                )
                .await;
            match result {
                Err(BackupError::CapturePartialFailure {
                    exit_code,
                    stderr_tail,
                }) => {
                    assert_eq!(exit_code, Some(2));
                    assert!(stderr_tail.contains("query failed"));
                }
                other => panic!("expected CapturePartialFailure, got {:?}", other),
            }
            Ok(())
        }

        #[tokio::test]
        async fn test_non_zero_exit_of_short_stream_writes_nothing() -> anyhow::Result<()> {
            let mut api = MockObjectStoreApi::new();
            api.expect_create_multipart_upload().times(0);
            api.expect_put_object().times(0);

            let backend = ObjectStoreBackend::new(Box::new(api), target(None)).with_part_size(4);
            let result = backend
                .deliver(live("printf ab; exit 1")?, &CancellationToken::new())
                .await;
            assert!(matches!(
                result,
                Err(BackupError::CapturePartialFailure { exit_code: Some(1), .. })
            ));
            Ok(())
        }

        #[cfg(target_os = "linux")]
        #[tokio::test]
        async fn test_cancellation_aborts_upload_and_kills_dump() -> anyhow::Result<()> {
            let dir = tempfile::tempdir()?;
            let pid_file = dir.path().join("pid");
            let cancel = CancellationToken::new();

            let mut api = MockObjectStoreApi::new();
            api.expect_create_multipart_upload()
                .times(1)
                .returning(|_, _| Ok("upload-1".to_string()));
            let on_first_part = cancel.clone();
            api.expect_upload_part().returning(move |_, _, _, n, _| {
                on_first_part.cancel();
                Ok(format!("etag-{}", n))
            });
            api.expect_complete_multipart_upload().times(0);
            api.expect_abort_multipart_upload()
                .times(1)
                .returning(|_, _, _| Ok(()));

            let backend = ObjectStoreBackend::new(Box::new(api), target(None)).with_part_size(4);
            let script = format!(
                "echo $$ > '{}'; printf abcdefgh; exec sleep 30",
                pid_file.display()
            );
            let result = backend.deliver(live(&script)?, &cancel).await;

            match result {
                Err(e) => assert!(e.is_cancelled(), "expected cancellation, got {:?}", e),
                Ok(location) => panic!("expected cancellation, got {}", location),
            }
            let pid = std::fs::read_to_string(&pid_file)?;
            assert!(!Path::new(&format!("/proc/{}", pid.trim())).exists());
            Ok(())
        }
    }
}
