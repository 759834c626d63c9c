// src/core/cache.rs

//! Durable key/value cache holding the preassigned-task map and the task
//! blacklist. Payloads are versioned JSON envelopes; writes replace the whole
//! map and rely on the advisory lock for linearizability.

use crate::core::errors::QueueFillError;
use crate::core::taskbuffer::TaskBuffer;
use crate::core::types::{BlacklistMap, PreassignedMap, TaskId};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Main cache key shared by all queue-filler replicas.
pub const CACHE_MAIN_KEY: &str = "AtlasQueueFillerWatchDog";
/// Sub key of the preassigned-task map.
pub const SUB_KEY_PREASSIGNED: &str = "PreassignedTasks";
/// Sub key of the blacklisted-task map.
pub const SUB_KEY_BLACKLISTED: &str = "BlacklistedTasks";

/// Current payload schema version. Unknown versions are rejected on load
/// rather than silently migrated.
pub const CACHE_SCHEMA_VERSION: u32 = 1;

/// Wire format shared by both cached maps.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u32,
    entries: IndexMap<String, Vec<TaskId>>,
}

/// Typed access to the two cached maps.
pub struct PreassignCache {
    buffer: Arc<dyn TaskBuffer>,
}

impl PreassignCache {
    pub fn new(buffer: Arc<dyn TaskBuffer>) -> Self {
        Self { buffer }
    }

    async fn load(&self, sub_key: &str) -> Result<IndexMap<String, Vec<TaskId>>, QueueFillError> {
        match self.buffer.get_cache(CACHE_MAIN_KEY, sub_key).await? {
            None => Ok(IndexMap::new()),
            Some(data) => {
                let envelope: Envelope = serde_json::from_str(&data)?;
                if envelope.version != CACHE_SCHEMA_VERSION {
                    return Err(QueueFillError::CacheSchemaVersion(envelope.version));
                }
                Ok(envelope.entries)
            }
        }
    }

    async fn store(
        &self,
        sub_key: &str,
        entries: &IndexMap<String, Vec<TaskId>>,
    ) -> Result<(), QueueFillError> {
        let envelope = Envelope {
            version: CACHE_SCHEMA_VERSION,
            entries: entries.clone(),
        };
        let data = serde_json::to_string(&envelope)?;
        self.buffer
            .update_cache(CACHE_MAIN_KEY, sub_key, &data)
            .await
    }

    /// The preassigned-task map; a cache miss is an empty map.
    pub async fn load_preassigned(&self) -> Result<PreassignedMap, QueueFillError> {
        self.load(SUB_KEY_PREASSIGNED).await
    }

    pub async fn store_preassigned(&self, map: &PreassignedMap) -> Result<(), QueueFillError> {
        self.store(SUB_KEY_PREASSIGNED, map).await
    }

    /// The blacklist; a cache miss is an empty map.
    pub async fn load_blacklist(&self) -> Result<BlacklistMap, QueueFillError> {
        self.load(SUB_KEY_BLACKLISTED).await
    }

    pub async fn store_blacklist(&self, map: &BlacklistMap) -> Result<(), QueueFillError> {
        self.store(SUB_KEY_BLACKLISTED, map).await
    }
}
