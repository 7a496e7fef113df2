//! Chunked uploads and downloads through the Graph client

mod common;

use async_trait::async_trait;
use bytes::Bytes;
use common::*;
use serde_json::json;
use tenant_migrator::error::{MigrationError, Result};
use tenant_migrator::transfer::{
    ByteRange, ChunkSink, ChunkSource, ChunkedTransfer, DriveItemSource, UploadSessionSink,
};

const MB: u64 = 1024 * 1024;
const SESSION_URL: &str = "https://upload.test/sessions/s-1";

struct PatternSource {
    size: u64,
}

impl PatternSource {
    fn byte_at(offset: u64) -> u8 {
        (offset % 251) as u8
    }
}

#[async_trait]
impl ChunkSource for PatternSource {
    fn total_size(&self) -> u64 {
        self.size
    }

    async fn read(&self, range: Option<ByteRange>) -> Result<Bytes> {
        let range = range.unwrap_or(ByteRange::new(0, self.size - 1));
        Ok((range.start..=range.end).map(Self::byte_at).collect::<Vec<u8>>().into())
    }
}

fn script_session(graph: &FakeGraph) {
    graph.json(
        "POST",
        "/drives/drive-b/items/root:/big.bin:/createUploadSession",
        200,
        &json!({ "uploadUrl": SESSION_URL }),
    );
}

#[tokio::test]
async fn test_large_upload_writes_contiguous_chunks() {
    let graph = FakeGraph::new();
    script_session(&graph);
    graph.json("PUT", SESSION_URL, 202, &json!({ "nextExpectedRanges": ["10485760-"] }));
    graph.json("PUT", SESSION_URL, 202, &json!({ "nextExpectedRanges": ["20971520-"] }));
    graph.json("PUT", SESSION_URL, 201, &json!({ "id": "new-item", "name": "big.bin" }));

    let client = graph_client("tenant-b", graph.clone());
    let mut sink = UploadSessionSink::new(client, "drive-b", "root", "big.bin");
    let transfer = ChunkedTransfer {
        small_upload_limit: 4 * MB,
        chunk_size: 10 * MB,
    };

    let written = transfer
        .transfer(&PatternSource { size: 25 * MB }, &mut sink)
        .await
        .unwrap();

    assert_eq!(written, 25 * MB);
    assert_eq!(sink.created.as_ref().unwrap()["id"], "new-item");

    let puts: Vec<_> = graph
        .requests()
        .into_iter()
        .filter(|r| r.method == "PUT")
        .collect();
    assert_eq!(puts.len(), 3);

    let ranges: Vec<_> = puts.iter().map(|r| r.header("Content-Range").unwrap().to_string()).collect();
    assert_eq!(
        ranges,
        vec![
            "bytes 0-10485759/26214400",
            "bytes 10485760-20971519/26214400",
            "bytes 20971520-26214399/26214400",
        ]
    );
    assert_eq!(puts[2].body.as_ref().unwrap().len() as u64, 5 * MB);
    assert_eq!(puts[1].body.as_ref().unwrap()[0], PatternSource::byte_at(10 * MB));

    // Session URLs are pre-authorized
    assert!(puts.iter().all(|r| r.header("Authorization").is_none()));
}

#[tokio::test]
async fn test_unfinished_session_is_an_error() {
    let graph = FakeGraph::new();
    script_session(&graph);
    graph.json("PUT", SESSION_URL, 202, &json!({ "nextExpectedRanges": ["0-"] }));

    let client = graph_client("tenant-b", graph.clone());
    let mut sink = UploadSessionSink::new(client, "drive-b", "root", "big.bin");
    let transfer = ChunkedTransfer {
        small_upload_limit: MB,
        chunk_size: 2 * MB,
    };

    let err = transfer
        .transfer(&PatternSource { size: 3 * MB }, &mut sink)
        .await
        .unwrap_err();

    assert!(matches!(err, MigrationError::StateError(_)));
}

#[tokio::test]
async fn test_small_upload_is_single_put() {
    let graph = FakeGraph::new();
    graph.json(
        "PUT",
        "/drives/drive-b/items/root:/notes.txt:/content?@microsoft.graph.conflictBehavior=replace",
        201,
        &json!({ "id": "small-item" }),
    );

    let client = graph_client("tenant-b", graph.clone());
    let mut sink = UploadSessionSink::new(client, "drive-b", "root", "notes.txt");

    let written = ChunkedTransfer::default()
        .transfer(&PatternSource { size: 1024 }, &mut sink)
        .await
        .unwrap();

    assert_eq!(written, 1024);
    assert_eq!(sink.created.as_ref().unwrap()["id"], "small-item");
    assert_eq!(graph.requests().len(), 1);
    assert_eq!(graph.requests()[0].header("Authorization"), Some("Bearer test-token"));
}

#[tokio::test]
async fn test_download_follows_redirect_without_token() {
    let graph = FakeGraph::new();
    graph.respond_with(
        "GET",
        "/drives/drive-a/items/item-1/content",
        302,
        vec![("Location".to_string(), "https://download.test/blob/item-1".to_string())],
        Bytes::new(),
    );
    graph.respond("GET", "https://download.test/blob/item-1", 200, Bytes::from_static(b"0123456789"));

    let source = DriveItemSource::new(graph_client("tenant-a", graph.clone()), "drive-a", "item-1", 10);
    let content = source.read(Some(ByteRange::new(0, 9))).await.unwrap();

    assert_eq!(&content[..], b"0123456789");
    let requests = graph.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].header("Range"), Some("bytes=0-9"));
    assert_eq!(requests[1].header("Range"), Some("bytes=0-9"));
    assert!(requests[1].header("Authorization").is_none());
}
