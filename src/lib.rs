//! Tenant Migrator
//!
//! A migration and backup engine for cloud tenant workloads. It copies mail,
//! OneDrive files, SharePoint sites and Teams content from a source tenant
//! into a destination tenant, or into a snapshot on local storage, through
//! the Microsoft Graph API.
//!
//! # Overview
//!
//! - **Rate limiting**: per-tenant, per-service-class token buckets shared by
//!   every job talking to the same tenant
//! - **Retries**: 429 responses wait for `Retry-After`, 5xx responses back
//!   off exponentially, everything else fails at once
//! - **Pagination**: page-link and delta enumeration with a checkpoint after
//!   every page, so a redelivered job resumes where it stopped
//! - **Workloads**: one processor per workload kind, reporting item
//!   failures without aborting the workload
//! - **Chunked transfer**: upload sessions with fixed-size byte ranges for
//!   large files
//! - **Jobs**: a runner that sequences workloads and writes the terminal
//!   status, and a worker pool consuming the job queue
//!
//! # Example Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use tenant_migrator::cli::{self, ProgressReporter, Services};
//! use tenant_migrator::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml".as_ref()).await?;
//!     let services = Services::new(config);
//!
//!     let message = cli::load_message("job.json".as_ref()).await?;
//!     let outcome = cli::run_job(&services, message, Arc::new(ProgressReporter::new())).await?;
//!     println!("{} items, {} failed", outcome.processed_items, outcome.failed_items);
//!     Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! - [`rate_limiter`] - Token buckets keyed by tenant and service class
//! - [`client`] - Retry policy and failure classification
//! - [`graph`] - HTTP transport and the per-tenant Graph client
//! - [`auth`] - Client-credentials tokens and credential resolution
//! - [`paginator`] - Page-link and delta enumeration
//! - [`checkpoint`] - Resume cursors per job, workload and subject
//! - [`control`] - Cooperative pause and cancel
//! - [`transfer`] - Chunked uploads
//! - [`snapshot`] - Backup storage
//! - [`workload`] - Mail, files, sites and teams processors
//! - [`job`] - Job messages, states and outcomes
//! - [`store`] - Job records
//! - [`queue`] - Job delivery and stop signals
//! - [`runner`] - Runs one job
//! - [`worker`] - Worker pool over the queue
//! - [`cli`] - Command-line interface
//! - [`config`] - Configuration management
//! - [`error`] - Error types and result aliases

pub mod auth;
pub mod checkpoint;
pub mod cli;
pub mod client;
pub mod config;
pub mod control;
pub mod error;
pub mod graph;
pub mod job;
pub mod paginator;
pub mod queue;
pub mod rate_limiter;
pub mod runner;
pub mod snapshot;
pub mod store;
pub mod transfer;
pub mod worker;
pub mod workload;

// Re-export commonly used types for convenience
pub use error::{MigrationError, Result};

pub use config::Config;

pub use rate_limiter::{Quota, ServiceClass, TenantRateLimiter};

pub use client::{RetryPolicy, RetryingClient};

pub use graph::{GraphClient, GraphTransport};

pub use paginator::{DeltaPaginator, Paginator};

pub use checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};

pub use control::{RunControl, StopReason};

pub use transfer::ChunkedTransfer;

pub use job::{FailurePolicy, JobKind, JobMessage, JobOutcome, JobStatus};

pub use workload::{WorkloadKind, WorkloadProcessor, WorkloadResult};

pub use runner::JobRunner;

pub use worker::WorkerPool;
