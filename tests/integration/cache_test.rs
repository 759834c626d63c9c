// tests/integration/cache_test.rs

//! Cache payload round-trip and schema-version handling.

use super::test_helpers::{FleetState, MemoryTaskBuffer};
use indexmap::IndexMap;
use queuefill::core::cache::{
    CACHE_MAIN_KEY, PreassignCache, SUB_KEY_BLACKLISTED, SUB_KEY_PREASSIGNED,
};
use queuefill::core::errors::QueueFillError;
use queuefill::core::taskbuffer::TaskBuffer;

#[tokio::test]
async fn cache_miss_is_an_empty_map() {
    let buffer = MemoryTaskBuffer::new(FleetState::default());
    let cache = PreassignCache::new(buffer);
    assert!(cache.load_preassigned().await.unwrap().is_empty());
    assert!(cache.load_blacklist().await.unwrap().is_empty());
}

#[tokio::test]
async fn preassigned_map_round_trips() {
    let buffer = MemoryTaskBuffer::new(FleetState::default());
    let cache = PreassignCache::new(buffer.clone());

    let mut map = IndexMap::new();
    map.insert("SITE_A|SCORE".to_string(), vec![42, 43]);
    map.insert("SITE_B|MCORE".to_string(), vec![7]);
    cache.store_preassigned(&map).await.unwrap();

    let loaded = cache.load_preassigned().await.unwrap();
    assert_eq!(loaded, map);
    // Entry order survives the round trip.
    let keys: Vec<&String> = loaded.keys().collect();
    assert_eq!(keys, vec!["SITE_A|SCORE", "SITE_B|MCORE"]);
}

#[tokio::test]
async fn blacklist_round_trips() {
    let buffer = MemoryTaskBuffer::new(FleetState::default());
    let cache = PreassignCache::new(buffer.clone());

    let mut blacklist = IndexMap::new();
    blacklist.insert("1700000000".to_string(), vec![1, 2, 3]);
    cache.store_blacklist(&blacklist).await.unwrap();
    assert_eq!(cache.load_blacklist().await.unwrap(), blacklist);
}

#[tokio::test]
async fn unknown_schema_version_is_rejected() {
    let buffer = MemoryTaskBuffer::new(FleetState::default());
    buffer
        .update_cache(
            CACHE_MAIN_KEY,
            SUB_KEY_PREASSIGNED,
            r#"{"version":99,"entries":{}}"#,
        )
        .await
        .unwrap();
    let cache = PreassignCache::new(buffer);
    assert_eq!(
        cache.load_preassigned().await.unwrap_err(),
        QueueFillError::CacheSchemaVersion(99)
    );
}

#[tokio::test]
async fn malformed_payload_is_an_error() {
    let buffer = MemoryTaskBuffer::new(FleetState::default());
    buffer
        .update_cache(CACHE_MAIN_KEY, SUB_KEY_BLACKLISTED, "not json")
        .await
        .unwrap();
    let cache = PreassignCache::new(buffer);
    assert!(matches!(
        cache.load_blacklist().await.unwrap_err(),
        QueueFillError::CachePayload(_)
    ));
}
