//! Cooperative pause/cancel signalling for a running job
//!
//! A [`RunControl`] is handed down through every traversal. Processors check
//! it at page and workload boundaries only; an item transfer already in
//! flight always runs to completion or natural failure.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{MigrationError, Result};

/// Why a run stopped before finishing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Paused,
    Cancelled,
}

const RUNNING: u8 = 0;
const PAUSED: u8 = 1;
const CANCELLED: u8 = 2;

/// Cancellation context for one job run
///
/// Clones share state. The first stop request wins; later ones do not
/// change the recorded reason.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    token: CancellationToken,
    reason: Arc<AtomicU8>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    fn stop(&self, reason: u8) {
        let _ = self
            .reason
            .compare_exchange(RUNNING, reason, Ordering::SeqCst, Ordering::SeqCst);
        self.token.cancel();
    }

    /// Ask the run to stop at the next boundary so it can be resumed later
    pub fn pause(&self) {
        self.stop(PAUSED);
    }

    /// Ask the run to stop at the next boundary for good
    pub fn cancel(&self) {
        self.stop(CANCELLED);
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        match self.reason.load(Ordering::SeqCst) {
            PAUSED => Some(StopReason::Paused),
            CANCELLED => Some(StopReason::Cancelled),
            _ => None,
        }
    }

    /// Boundary check: `Err(Cancelled)` once a stop was requested
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_stopped() {
            Err(MigrationError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves when a stop is requested
    pub async fn stopped(&self) {
        self.token.cancelled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_running_by_default() {
        let control = RunControl::new();
        assert!(!control.is_stopped());
        assert_eq!(control.stop_reason(), None);
        assert!(control.checkpoint().is_ok());
    }

    #[test]
    fn test_first_reason_wins() {
        let control = RunControl::new();
        let shared = control.clone();

        shared.pause();
        control.cancel();

        assert!(control.is_stopped());
        assert_eq!(control.stop_reason(), Some(StopReason::Paused));
        assert!(matches!(control.checkpoint(), Err(MigrationError::Cancelled)));
    }

    #[tokio::test]
    async fn test_stopped_wakes_waiters() {
        let control = RunControl::new();
        let waiter = control.clone();
        let handle = tokio::spawn(async move { waiter.stopped().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        control.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(control.stop_reason(), Some(StopReason::Cancelled));
    }
}
