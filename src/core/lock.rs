// src/core/lock.rs

//! Advisory named lock coordinating controller replicas. At most one live
//! lease exists per (vo, label, component) triple; leases expire on their own
//! after the time limit, which is the only cancellation signal a replica
//! gets. Critical sections acquire immediately before and release immediately
//! after.

use crate::core::errors::QueueFillError;
use crate::core::taskbuffer::{LockRequest, TaskBuffer};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Component tag shared by every queue-filler replica.
pub const LOCK_COMPONENT: &str = "AtlasQueueFillerWatchDog.preassign";
/// Lease time limit; a replica sleeping past this has lost exclusion.
pub const LOCK_TIME_LIMIT: Duration = Duration::from_secs(120); // 2 minutes

pub struct LockManager {
    buffer: Arc<dyn TaskBuffer>,
    vo: String,
    pid: String,
}

impl LockManager {
    pub fn new(buffer: Arc<dyn TaskBuffer>, vo: &str, pid: &str) -> Self {
        Self {
            buffer,
            vo: vo.to_string(),
            pid: pid.to_string(),
        }
    }

    fn request(&self, prod_source_label: &str) -> LockRequest {
        LockRequest {
            vo: self.vo.clone(),
            prod_source_label: prod_source_label.to_string(),
            component: LOCK_COMPONENT.to_string(),
            pid: self.pid.clone(),
            time_limit: LOCK_TIME_LIMIT,
        }
    }

    /// Tries to take the lock for a label; `false` while another replica
    /// holds a live lease.
    pub async fn acquire(&self, prod_source_label: &str) -> Result<bool, QueueFillError> {
        self.buffer.lock_process(&self.request(prod_source_label)).await
    }

    /// Releases the lock. Failures are logged and swallowed; the lease
    /// expires on its own anyway.
    pub async fn release(&self, prod_source_label: &str) {
        if let Err(e) = self
            .buffer
            .unlock_process(&self.request(prod_source_label))
            .await
        {
            warn!(
                "Failed to release process lock for label '{}': {}",
                prod_source_label, e
            );
        }
    }
}
