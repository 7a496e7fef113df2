//! Common test utilities and fixtures
#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tenant_migrator::auth::StaticToken;
use tenant_migrator::checkpoint::{CheckpointScope, CheckpointStore, MemoryCheckpointStore};
use tenant_migrator::client::{RetryPolicy, RetryingClient};
use tenant_migrator::control::RunControl;
use tenant_migrator::error::Result;
use tenant_migrator::graph::{GraphClient, GraphRequest, GraphResponse, GraphTransport};
use tenant_migrator::job::JobOptions;
use tenant_migrator::rate_limiter::TenantRateLimiter;
use tenant_migrator::snapshot::SnapshotStore;
use tenant_migrator::transfer::{ByteRange, ChunkedTransfer};
use tenant_migrator::workload::{Destination, ProgressTracker, WorkloadContext};

pub const BASE_URL: &str = "https://graph.test/v1.0";

/// Absolute URL for a Graph path, the way next links arrive
pub fn graph_url(path: &str) -> String {
    format!("{}{}", BASE_URL, path)
}

/// A request as the fake transport saw it
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub method: String,
    /// Path below the API base, or the full URL for foreign hosts
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

impl SeenRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

type Hook = Box<dyn Fn() + Send + Sync>;

/// Scripted Graph endpoint keyed by method and path
///
/// A route answers with its queued responses in order; the last one is
/// repeated. Unscripted requests get a 404.
#[derive(Default)]
pub struct FakeGraph {
    routes: Mutex<HashMap<(String, String), VecDeque<GraphResponse>>>,
    hooks: Mutex<HashMap<String, Hook>>,
    seen: Mutex<Vec<SeenRequest>>,
    fired: Mutex<HashSet<String>>,
}

impl FakeGraph {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, method: &str, path: &str, status: u16, body: Bytes) {
        self.respond_with(method, path, status, Vec::new(), body);
    }

    pub fn respond_with(&self, method: &str, path: &str, status: u16, headers: Vec<(String, String)>, body: Bytes) {
        self.routes
            .lock()
            .unwrap()
            .entry((method.to_string(), path.to_string()))
            .or_default()
            .push_back(GraphResponse { status, headers, body });
    }

    pub fn json(&self, method: &str, path: &str, status: u16, body: &Value) {
        self.respond(method, path, status, Bytes::from(body.to_string()));
    }

    pub fn get(&self, path: &str, body: &Value) {
        self.json("GET", path, 200, body);
    }

    /// Run `hook` the first time `path` is requested
    pub fn on_request(&self, path: &str, hook: impl Fn() + Send + Sync + 'static) {
        self.hooks.lock().unwrap().insert(path.to_string(), Box::new(hook));
    }

    pub fn requests(&self) -> Vec<SeenRequest> {
        self.seen.lock().unwrap().clone()
    }

    pub fn requested(&self, method: &str, path: &str) -> usize {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.method == method && r.path == path)
            .count()
    }
}

#[async_trait]
impl GraphTransport for FakeGraph {
    async fn send(&self, request: GraphRequest) -> Result<GraphResponse> {
        let path = request
            .url
            .strip_prefix(BASE_URL)
            .unwrap_or(&request.url)
            .to_string();
        let method = request.method.as_str().to_string();

        self.seen.lock().unwrap().push(SeenRequest {
            method: method.clone(),
            path: path.clone(),
            headers: request.headers.clone(),
            body: request.body.clone(),
        });

        if self.fired.lock().unwrap().insert(path.clone()) {
            if let Some(hook) = self.hooks.lock().unwrap().get(&path) {
                hook();
            }
        }

        let mut routes = self.routes.lock().unwrap();
        let response = match routes.get_mut(&(method, path)) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };
        Ok(response.unwrap_or_else(|| GraphResponse {
            status: 404,
            headers: Vec::new(),
            body: Bytes::from_static(br#"{"error":{"code":"itemNotFound","message":"not scripted"}}"#),
        }))
    }
}

/// Client for `tenant` over the fake, without real backoff delays
pub fn graph_client(tenant: &str, graph: Arc<FakeGraph>) -> Arc<GraphClient> {
    graph_client_with_limiter(tenant, graph, TenantRateLimiter::new())
}

/// Client for `tenant` charging its requests to `limiter`
pub fn graph_client_with_limiter(
    tenant: &str,
    graph: Arc<FakeGraph>,
    limiter: TenantRateLimiter,
) -> Arc<GraphClient> {
    Arc::new(GraphClient::new(
        tenant,
        BASE_URL,
        Arc::new(StaticToken::new("test-token")),
        graph,
        RetryingClient::new(limiter, RetryPolicy::new(2, Duration::from_millis(1))),
    ))
}

/// Body of a recorded request as JSON
pub fn json_body(request: &SeenRequest) -> Value {
    request
        .body
        .as_ref()
        .map(|body| serde_json::from_slice(body).unwrap())
        .unwrap_or(Value::Null)
}

/// Snapshot kept in memory
#[derive(Default)]
pub struct MemorySnapshot {
    pub documents: Mutex<HashMap<String, Value>>,
    pub objects: Mutex<HashMap<String, Vec<u8>>>,
    pub tombstones: Mutex<Vec<String>>,
}

impl MemorySnapshot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn document_count(&self) -> usize {
        self.documents.lock().unwrap().len()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshot {
    async fn put_document(&self, path: &str, document: &Value) -> Result<()> {
        self.documents
            .lock()
            .unwrap()
            .insert(path.to_string(), document.clone());
        Ok(())
    }

    async fn put_object(&self, path: &str, content: Bytes) -> Result<()> {
        self.objects
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_vec());
        Ok(())
    }

    async fn begin_object(&self, path: &str, total_size: u64) -> Result<()> {
        self.objects
            .lock()
            .unwrap()
            .insert(path.to_string(), vec![0; total_size as usize]);
        Ok(())
    }

    async fn write_range(&self, path: &str, range: ByteRange, chunk: Bytes) -> Result<()> {
        let mut objects = self.objects.lock().unwrap();
        let object = objects.entry(path.to_string()).or_default();
        object[range.start as usize..=range.end as usize].copy_from_slice(&chunk);
        Ok(())
    }

    async fn finish_object(&self, _path: &str) -> Result<()> {
        Ok(())
    }

    async fn record_tombstone(&self, path: &str) -> Result<()> {
        self.tombstones.lock().unwrap().push(path.to_string());
        Ok(())
    }
}

/// Backup context reading from `source` into `snapshot`
pub fn backup_context(
    job_id: &str,
    source: Arc<GraphClient>,
    snapshot: Arc<MemorySnapshot>,
    checkpoints: Arc<MemoryCheckpointStore>,
    control: RunControl,
) -> WorkloadContext {
    WorkloadContext {
        job_id: job_id.to_string(),
        source,
        destination: Destination::Snapshot(snapshot),
        checkpoints: CheckpointScope::new(checkpoints as Arc<dyn CheckpointStore>, job_id),
        control,
        transfer: ChunkedTransfer::default(),
        options: JobOptions::default(),
        teams_message_delay: Duration::ZERO,
        progress: Arc::new(ProgressTracker::new()),
    }
}

/// Migration context reading from `source` and writing into `destination`
pub fn migration_context(
    job_id: &str,
    source: Arc<GraphClient>,
    destination: Arc<GraphClient>,
    checkpoints: Arc<MemoryCheckpointStore>,
    control: RunControl,
) -> WorkloadContext {
    WorkloadContext {
        job_id: job_id.to_string(),
        source,
        destination: Destination::Tenant(destination),
        checkpoints: CheckpointScope::new(checkpoints as Arc<dyn CheckpointStore>, job_id),
        control,
        transfer: ChunkedTransfer::default(),
        options: JobOptions::default(),
        teams_message_delay: Duration::ZERO,
        progress: Arc::new(ProgressTracker::new()),
    }
}
