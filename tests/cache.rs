//! Cache Integration Tests
//!
//! LRU eviction order, TTL expiry and the unlimited-capacity mode of the
//! in-memory cache.

use std::time::Duration;

use conductor::{CacheProvider, MemoryCache};
use serde_json::json;

#[test]
fn test_lru_evicts_least_recently_written() {
    let cache = MemoryCache::new(2);

    cache.write("a", json!(1), None);
    cache.write("b", json!(2), None);
    cache.write("c", json!(3), None);

    assert_eq!(cache.read("a"), None);
    assert_eq!(cache.read("b"), Some(json!(2)));
    assert_eq!(cache.read("c"), Some(json!(3)));
    assert_eq!(cache.len(), 2);
    assert_eq!(cache.stats().evictions, 1);
}

#[test]
fn test_read_refreshes_recency() {
    let cache = MemoryCache::new(2);

    cache.write("a", json!(1), None);
    cache.write("b", json!(2), None);
    assert_eq!(cache.read("a"), Some(json!(1)));
    cache.write("c", json!(3), None);

    assert_eq!(cache.read("a"), Some(json!(1)));
    assert_eq!(cache.read("b"), None);
    assert_eq!(cache.read("c"), Some(json!(3)));
}

#[test]
fn test_zero_capacity_is_unlimited() {
    let cache = MemoryCache::new(0);

    for i in 0..500 {
        cache.write(&format!("key:{}", i), json!(i), None);
    }

    assert_eq!(cache.len(), 500);
    assert_eq!(cache.read("key:0"), Some(json!(0)));
    assert_eq!(cache.stats().evictions, 0);
}

#[tokio::test(start_paused = true)]
async fn test_ttl_expiry() {
    let cache = MemoryCache::unbounded();
    cache.write("session", json!("token"), Some(Duration::from_millis(10)));
    cache.write("profile", json!({ "name": "Ada" }), None);

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(cache.read("session"), Some(json!("token")));

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(cache.read("session"), None);
    assert_eq!(cache.read("profile"), Some(json!({ "name": "Ada" })));
}

#[tokio::test(start_paused = true)]
async fn test_default_ttl_and_sweep() {
    let cache = MemoryCache::unbounded().with_default_ttl(Some(Duration::from_millis(50)));
    cache.write("a", json!(1), None);
    cache.write("b", json!(2), None);
    cache.write("pinned", json!(3), Some(Duration::from_secs(60)));

    tokio::time::sleep(Duration::from_millis(51)).await;

    assert_eq!(cache.evict_expired(), 2);
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.read("pinned"), Some(json!(3)));
}

#[tokio::test(start_paused = true)]
async fn test_unrepresentable_ttl_never_expires() {
    let cache = MemoryCache::unbounded();
    cache.write("forever", json!(1), Some(Duration::MAX));

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(cache.read("forever"), Some(json!(1)));
    assert_eq!(cache.evict_expired(), 0);
}

#[test]
fn test_invalid_pattern_is_rejected() {
    let cache = MemoryCache::unbounded();
    cache.write("user:1", json!(1), None);

    assert!(cache.delete_pattern("user:[").is_err());
    assert_eq!(cache.len(), 1);
}
