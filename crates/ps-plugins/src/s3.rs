//! Object-storage sink: one multipart upload per object, each object a
//! valid pcap file.
//!
//! Records accumulate in a buffer; every `upload_chunk_size` bytes become
//! one part. An upload is completed when it reaches 10 000 parts or
//! `total_file_size` bytes, when the sink has been idle for the upload
//! timeout, or on shutdown. Object keys come from a strftime-style
//! template evaluated at upload creation.

use std::future::Future;
use std::time::Duration;

use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, ObjectCannedAcl};
use ps_config::S3PluginConfig;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::PluginError;

/// Hard cap on parts per multipart upload, fixed by the protocol.
pub const MAX_PARTS: usize = 10_000;

/// Object-storage operations the sink needs, injectable for tests.
pub trait ObjectStore: Send + Sync + 'static {
    fn create_upload(
        &self,
        bucket: &str,
        key: &str,
        acl: Option<&str>,
    ) -> impl Future<Output = Result<String, PluginError>> + Send;

    fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Vec<u8>,
    ) -> impl Future<Output = Result<String, PluginError>> + Send;

    fn complete_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[(i32, String)],
    ) -> impl Future<Output = Result<(), PluginError>> + Send;
}

/// Store backed by the AWS SDK.
pub struct AwsObjectStore {
    client: aws_sdk_s3::Client,
}

impl AwsObjectStore {
    pub async fn new(region: String) -> Self {
        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region))
            .load()
            .await;
        Self {
            client: aws_sdk_s3::Client::new(&sdk_config),
        }
    }
}

impl ObjectStore for AwsObjectStore {
    fn create_upload(
        &self,
        bucket: &str,
        key: &str,
        acl: Option<&str>,
    ) -> impl Future<Output = Result<String, PluginError>> + Send {
        let mut request = self.client.create_multipart_upload().bucket(bucket).key(key);
        if let Some(acl) = acl {
            request = request.acl(ObjectCannedAcl::from(acl));
        }
        async move {
            let output = request
                .send()
                .await
                .map_err(|e| PluginError::S3(e.to_string()))?;
            output
                .upload_id()
                .map(str::to_string)
                .ok_or_else(|| PluginError::S3("missing upload id".to_string()))
        }
    }

    fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Vec<u8>,
    ) -> impl Future<Output = Result<String, PluginError>> + Send {
        let request = self
            .client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(data));
        async move {
            let output = request
                .send()
                .await
                .map_err(|e| PluginError::S3(e.to_string()))?;
            Ok(output.e_tag().unwrap_or_default().to_string())
        }
    }

    fn complete_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[(i32, String)],
    ) -> impl Future<Output = Result<(), PluginError>> + Send {
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(
                parts
                    .iter()
                    .map(|(number, etag)| {
                        CompletedPart::builder()
                            .part_number(*number)
                            .e_tag(etag.clone())
                            .build()
                    })
                    .collect(),
            ))
            .build();
        let request = self
            .client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed);
        async move {
            request
                .send()
                .await
                .map_err(|e| PluginError::S3(e.to_string()))?;
            Ok(())
        }
    }
}

struct MultipartUpload {
    key: String,
    upload_id: String,
    parts: Vec<(i32, String)>,
    buffer: Vec<u8>,
    total_data_sent: u64,
}

pub struct S3Plugin<S: ObjectStore> {
    store: S,
    bucket: String,
    key_format: String,
    canned_acl: Option<String>,
    total_file_size: u64,
    upload_chunk_size: u64,
    upload_timeout: Duration,
    file_header: Vec<u8>,
}

impl<S: ObjectStore> S3Plugin<S> {
    pub fn new(store: S, config: &S3PluginConfig, file_header: Vec<u8>) -> Self {
        Self {
            store,
            bucket: config.bucket.clone(),
            key_format: config.key_format.clone(),
            canned_acl: config.canned_acl.clone(),
            total_file_size: config.total_file_size,
            upload_chunk_size: config.upload_chunk_size,
            upload_timeout: Duration::from_secs(config.upload_timeout_secs),
            file_header,
        }
    }

    /// Spawn the sink task and return its input queue and join handle.
    pub fn start(
        self,
        stop: CancellationToken,
    ) -> (mpsc::Sender<Vec<u8>>, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(crate::PLUGIN_QUEUE_LEN);
        let task = tokio::spawn(self.run(rx, stop));
        (tx, task)
    }

    async fn run(self, mut rx: mpsc::Receiver<Vec<u8>>, stop: CancellationToken) {
        let mut upload: Option<MultipartUpload> = None;

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(self.upload_timeout) => {
                    // Idle flush. The next chunk opens a fresh upload.
                    if let Some(current) = upload.take() {
                        log::info!("Upload timeout expired. Flushing");
                        if let Err(e) = self.complete_upload(current).await {
                            log::error!("error completing multipart upload, stopping: {}", e);
                            return;
                        }
                    }
                }
                chunk = rx.recv() => match chunk {
                    Some(chunk) => {
                        if !self.handle_chunk(&mut upload, chunk).await {
                            return;
                        }
                    }
                    None => break,
                },
            }
        }

        if let Some(current) = upload.take() {
            if let Err(e) = self.complete_upload(current).await {
                log::error!("error completing multipart upload on shutdown: {}", e);
            }
        }
    }

    /// Returns false when the sink must stop.
    async fn handle_chunk(&self, upload: &mut Option<MultipartUpload>, chunk: Vec<u8>) -> bool {
        if upload.is_none() {
            match self.create_upload().await {
                Ok(created) => *upload = Some(created),
                Err(e) => {
                    log::error!("error creating multipart upload, stopping: {}", e);
                    return false;
                }
            }
        }
        let Some(current) = upload.as_mut() else {
            return false;
        };

        current.buffer.extend_from_slice(&chunk);
        if current.buffer.len() as u64 >= self.upload_chunk_size {
            if let Err(e) = self.flush_part(current).await {
                log::error!("error uploading part: {}", e);
            }
        }

        if current.parts.len() >= MAX_PARTS || current.total_data_sent >= self.total_file_size {
            if let Some(finished) = upload.take() {
                if let Err(e) = self.complete_upload(finished).await {
                    log::error!("error completing multipart upload, stopping: {}", e);
                    return false;
                }
            }
        }
        true
    }

    async fn create_upload(&self) -> Result<MultipartUpload, PluginError> {
        let key = chrono::Local::now().format(&self.key_format).to_string();
        let upload_id = self
            .store
            .create_upload(&self.bucket, &key, self.canned_acl.as_deref())
            .await?;
        // Every object starts as a valid pcap file.
        let mut buffer = Vec::with_capacity(self.upload_chunk_size as usize);
        buffer.extend_from_slice(&self.file_header);
        Ok(MultipartUpload {
            key,
            upload_id,
            parts: Vec::new(),
            buffer,
            total_data_sent: 0,
        })
    }

    async fn flush_part(&self, upload: &mut MultipartUpload) -> Result<(), PluginError> {
        if upload.buffer.is_empty() {
            return Ok(());
        }
        let part_number = upload.parts.len() as i32 + 1;
        let data = std::mem::take(&mut upload.buffer);
        let len = data.len() as u64;
        let etag = self
            .store
            .upload_part(&self.bucket, &upload.key, &upload.upload_id, part_number, data)
            .await?;
        upload.parts.push((part_number, etag));
        upload.total_data_sent += len;
        Ok(())
    }

    async fn complete_upload(&self, mut upload: MultipartUpload) -> Result<(), PluginError> {
        self.flush_part(&mut upload).await?;
        self.store
            .complete_upload(&self.bucket, &upload.key, &upload.upload_id, &upload.parts)
            .await?;
        log::info!(
            "Completed multipart upload of {} bytes to {}",
            upload.total_data_sent,
            upload.key
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct MockState {
        uploads_created: AtomicUsize,
        parts: Mutex<Vec<(String, i32, Vec<u8>)>>,
        completed: Mutex<Vec<(String, Vec<(i32, String)>)>>,
    }

    #[derive(Clone, Default)]
    struct MockStore(Arc<MockState>);

    impl ObjectStore for MockStore {
        fn create_upload(
            &self,
            _bucket: &str,
            _key: &str,
            _acl: Option<&str>,
        ) -> impl Future<Output = Result<String, PluginError>> + Send {
            let n = self.0.uploads_created.fetch_add(1, Ordering::SeqCst);
            async move { Ok(format!("upload-{}", n)) }
        }

        fn upload_part(
            &self,
            _bucket: &str,
            _key: &str,
            upload_id: &str,
            part_number: i32,
            data: Vec<u8>,
        ) -> impl Future<Output = Result<String, PluginError>> + Send {
            self.0
                .parts
                .lock()
                .unwrap()
                .push((upload_id.to_string(), part_number, data));
            async move { Ok(format!("etag-{}", part_number)) }
        }

        fn complete_upload(
            &self,
            _bucket: &str,
            _key: &str,
            upload_id: &str,
            parts: &[(i32, String)],
        ) -> impl Future<Output = Result<(), PluginError>> + Send {
            self.0
                .completed
                .lock()
                .unwrap()
                .push((upload_id.to_string(), parts.to_vec()));
            async { Ok(()) }
        }
    }

    fn plugin(store: MockStore, chunk_size: u64, total_size: u64) -> S3Plugin<MockStore> {
        let config = S3PluginConfig {
            bucket: "pcap".to_string(),
            region: "eu-west-1".to_string(),
            total_file_size: total_size,
            upload_chunk_size: chunk_size,
            upload_timeout_secs: 3600,
            canned_acl: None,
            key_format: "%Y-%m-%d-%H-%S".to_string(),
        };
        S3Plugin::new(store, &config, b"PCAP".to_vec())
    }

    #[tokio::test]
    async fn test_parts_are_uploaded_at_chunk_size() {
        let store = MockStore::default();
        let state = Arc::clone(&store.0);
        let plugin = plugin(store, 16, 1_000_000);

        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(plugin.run(rx, CancellationToken::new()));

        // Header (4) + 12 bytes = 16: exactly one part.
        tx.send(vec![0xaa; 12]).await.unwrap();
        tx.send(vec![0xbb; 4]).await.unwrap();
        drop(tx);
        task.await.unwrap();

        let parts = state.parts.lock().unwrap();
        // First part at the chunk boundary, second from the shutdown flush.
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].1, 1);
        assert_eq!(parts[0].2.len(), 16);
        assert_eq!(&parts[0].2[..4], b"PCAP");
        assert_eq!(parts[1].1, 2);
        assert_eq!(parts[1].2, vec![0xbb; 4]);

        let completed = state.completed.lock().unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].1.len(), 2);
    }

    #[tokio::test]
    async fn test_upload_rotates_at_total_file_size() {
        let store = MockStore::default();
        let state = Arc::clone(&store.0);
        let plugin = plugin(store, 8, 16);

        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(plugin.run(rx, CancellationToken::new()));

        // 4-byte header + 12 bytes crosses both the chunk size and the
        // total file size, completing the first upload.
        tx.send(vec![0x11; 12]).await.unwrap();
        tx.send(vec![0x22; 2]).await.unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(state.uploads_created.load(Ordering::SeqCst), 2);
        let completed = state.completed.lock().unwrap();
        assert_eq!(completed.len(), 2);
        assert_eq!(completed[0].0, "upload-0");
        assert_eq!(completed[1].0, "upload-1");
    }

    #[tokio::test]
    async fn test_sum_of_parts_equals_total_data_sent() {
        let store = MockStore::default();
        let state = Arc::clone(&store.0);
        let plugin = plugin(store, 8, 1_000_000);

        let (tx, rx) = mpsc::channel(64);
        let task = tokio::spawn(plugin.run(rx, CancellationToken::new()));
        for _ in 0..10 {
            tx.send(vec![0x33; 8]).await.unwrap();
        }
        drop(tx);
        task.await.unwrap();

        let parts = state.parts.lock().unwrap();
        let uploaded: usize = parts.iter().map(|(_, _, data)| data.len()).sum();
        // Header + ten 8-byte chunks, nothing lost or duplicated.
        assert_eq!(uploaded, 4 + 80);
        assert!(parts.len() <= MAX_PARTS);
    }

    #[tokio::test]
    async fn test_cancellation_flushes_the_buffer() {
        let store = MockStore::default();
        let state = Arc::clone(&store.0);
        let plugin = plugin(store, 1024, 1_000_000);

        let stop = CancellationToken::new();
        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(plugin.run(rx, stop.clone()));

        tx.send(vec![0x44; 10]).await.unwrap();
        // Let the chunk land before cancelling.
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.cancel();
        task.await.unwrap();

        let completed = state.completed.lock().unwrap();
        assert_eq!(completed.len(), 1);
        let parts = state.parts.lock().unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].2.len(), 14);
    }
}
