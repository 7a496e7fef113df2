//! Chunked, resumable transfer of large objects
//!
//! Content at or below the small-upload limit moves in one read and one
//! write. Anything larger is split into fixed-size inclusive byte ranges
//! `[offset, min(offset + chunk_size - 1, total - 1)]`, each read from the
//! source and written to the sink independently, so a failed chunk is
//! retried on its own without resending earlier ones.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, trace};

use crate::config::TransferConfig;
use crate::error::{MigrationError, Result};
use crate::graph::{encode_segment, GraphClient};
use crate::rate_limiter::ServiceClass;

/// Payloads up to this size use a single-shot upload
pub const SMALL_UPLOAD_LIMIT: u64 = 4 * 1024 * 1024;

/// Default upload session chunk size
pub const DEFAULT_CHUNK_SIZE: u64 = 10 * 1024 * 1024;

/// Inclusive byte range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

#[allow(clippy::len_without_is_empty)]
impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `Content-Range` value for an upload of `total_size` bytes
    pub fn content_range(&self, total_size: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total_size)
    }

    /// `Range` request header value
    pub fn range_header(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// Split `[0, total_size)` into contiguous chunks of at most `chunk_size` bytes
pub fn chunk_ranges(total_size: u64, chunk_size: u64) -> Vec<ByteRange> {
    if total_size == 0 {
        return Vec::new();
    }
    let chunk_size = if chunk_size == 0 { total_size } else { chunk_size };

    let mut ranges = Vec::with_capacity(total_size.div_ceil(chunk_size) as usize);
    let mut offset = 0;
    while offset < total_size {
        let end = (offset + chunk_size - 1).min(total_size - 1);
        ranges.push(ByteRange::new(offset, end));
        offset = end + 1;
    }
    ranges
}

/// Where content is read from
#[async_trait]
pub trait ChunkSource: Send + Sync {
    /// Declared size of the content
    fn total_size(&self) -> u64;

    /// Read one range, or the whole content when `range` is `None`
    async fn read(&self, range: Option<ByteRange>) -> Result<Bytes>;
}

/// Where content is written to
#[async_trait]
pub trait ChunkSink: Send {
    /// Write content small enough for a single request
    async fn put_small(&mut self, content: Bytes) -> Result<()>;

    /// Open a session for `total_size` bytes
    async fn begin(&mut self, total_size: u64) -> Result<()>;

    /// Write one range of an open session
    async fn put_chunk(&mut self, range: ByteRange, total_size: u64, chunk: Bytes) -> Result<()>;

    /// Complete the session
    async fn finish(&mut self) -> Result<()>;
}

/// Drives a source-to-sink copy, chunked above the small-upload limit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkedTransfer {
    pub small_upload_limit: u64,
    pub chunk_size: u64,
}

impl Default for ChunkedTransfer {
    fn default() -> Self {
        Self {
            small_upload_limit: SMALL_UPLOAD_LIMIT,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl From<&TransferConfig> for ChunkedTransfer {
    fn from(config: &TransferConfig) -> Self {
        Self {
            small_upload_limit: config.small_upload_limit_bytes,
            chunk_size: config.chunk_size_bytes,
        }
    }
}

impl ChunkedTransfer {
    /// Copy `source` into `sink`, returning the number of bytes written
    pub async fn transfer(&self, source: &dyn ChunkSource, sink: &mut dyn ChunkSink) -> Result<u64> {
        let total_size = source.total_size();

        if total_size <= self.small_upload_limit {
            let content = source.read(None).await?;
            let written = content.len() as u64;
            sink.put_small(content).await?;
            trace!("Single-shot transfer of {} bytes", written);
            return Ok(written);
        }

        sink.begin(total_size).await?;

        let ranges = chunk_ranges(total_size, self.chunk_size);
        debug!(
            "Chunked transfer of {} bytes in {} chunks",
            total_size,
            ranges.len()
        );

        let mut offset = 0u64;
        for range in ranges {
            let chunk = source.read(Some(range)).await?;
            if chunk.len() as u64 != range.len() {
                return Err(MigrationError::InvalidResponse(format!(
                    "Source returned {} bytes for range {}-{}",
                    chunk.len(),
                    range.start,
                    range.end
                )));
            }
            sink.put_chunk(range, total_size, chunk).await?;
            offset = range.end + 1;
        }

        if offset != total_size {
            return Err(MigrationError::StateError(format!(
                "Transfer stopped at offset {} of {}",
                offset, total_size
            )));
        }

        sink.finish().await?;
        Ok(total_size)
    }
}

/// Content of a drive item in the source tenant
pub struct DriveItemSource {
    client: Arc<GraphClient>,
    content_path: String,
    size: u64,
}

impl DriveItemSource {
    pub fn new(client: Arc<GraphClient>, drive_id: &str, item_id: &str, size: u64) -> Self {
        Self {
            client,
            content_path: format!("/drives/{}/items/{}/content", drive_id, item_id),
            size,
        }
    }
}

#[async_trait]
impl ChunkSource for DriveItemSource {
    fn total_size(&self) -> u64 {
        self.size
    }

    async fn read(&self, range: Option<ByteRange>) -> Result<Bytes> {
        self.client
            .download(ServiceClass::Files, &self.content_path, range)
            .await
    }
}

/// Upload into a destination drive folder through an upload session
///
/// Existing files of the same name are replaced.
pub struct UploadSessionSink {
    client: Arc<GraphClient>,
    item_path: String,
    upload_url: Option<String>,
    last_status: Option<u16>,
    /// Drive item returned by the completing request
    pub created: Option<Value>,
}

impl UploadSessionSink {
    pub fn new(client: Arc<GraphClient>, drive_id: &str, parent_id: &str, name: &str) -> Self {
        Self {
            client,
            item_path: format!(
                "/drives/{}/items/{}:/{}:",
                drive_id,
                parent_id,
                encode_segment(name)
            ),
            upload_url: None,
            last_status: None,
            created: None,
        }
    }
}

#[async_trait]
impl ChunkSink for UploadSessionSink {
    async fn put_small(&mut self, content: Bytes) -> Result<()> {
        let path = format!(
            "{}/content?@microsoft.graph.conflictBehavior=replace",
            self.item_path
        );
        let created: Value = self
            .client
            .put_content(ServiceClass::Files, &path, content)
            .await?;
        self.created = Some(created);
        Ok(())
    }

    async fn begin(&mut self, total_size: u64) -> Result<()> {
        let path = format!("{}/createUploadSession", self.item_path);
        let body = json!({
            "item": { "@microsoft.graph.conflictBehavior": "replace" }
        });
        let session: Value = self.client.post_json(ServiceClass::Files, &path, &body).await?;
        let upload_url = session["uploadUrl"].as_str().ok_or_else(|| {
            MigrationError::InvalidResponse("Upload session without uploadUrl".to_string())
        })?;
        debug!("Opened upload session for {} bytes", total_size);
        self.upload_url = Some(upload_url.to_string());
        Ok(())
    }

    async fn put_chunk(&mut self, range: ByteRange, total_size: u64, chunk: Bytes) -> Result<()> {
        let upload_url = self
            .upload_url
            .as_deref()
            .ok_or_else(|| MigrationError::StateError("Upload session not started".to_string()))?;

        let response = self
            .client
            .put_chunk(ServiceClass::Files, upload_url, range, total_size, chunk)
            .await?;
        self.last_status = Some(response.status);
        if response.status == 200 || response.status == 201 {
            self.created = response.json().ok();
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        match self.last_status {
            Some(200) | Some(201) => Ok(()),
            other => Err(MigrationError::StateError(format!(
                "Upload session did not complete (last status {:?})",
                other
            ))),
        }
    }
}
