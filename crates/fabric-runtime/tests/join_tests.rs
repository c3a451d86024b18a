//! Tests for joins across registered streams

use fabric_runtime::{
    record, Cache, FabricError, Filters, JoinEngine, JoinRequest, JoinSpec, MemoryCache,
    MemorySource, Record, StreamExecutor, StreamRegistry, Value,
};
use std::sync::Arc;
use std::time::Duration;

struct Fixture {
    users: Arc<MemorySource>,
    posts: Arc<MemorySource>,
    cache: Arc<MemoryCache>,
    engine: JoinEngine,
}

fn fixture() -> Fixture {
    let users = Arc::new(MemorySource::new(
        "users",
        vec![
            record! { "id" => 1i64, "name" => "A" },
            record! { "id" => 2i64, "name" => "B" },
        ],
    ));
    let posts = Arc::new(MemorySource::new(
        "posts",
        vec![record! { "id" => 10i64, "user_id" => 1i64, "title" => "P1" }],
    ));
    let registry = Arc::new(StreamRegistry::new());
    registry.register("users", users.clone(), 100).unwrap();
    registry.register("posts", posts.clone(), 100).unwrap();

    let cache = Arc::new(MemoryCache::new());
    let engine = JoinEngine::new(StreamExecutor::new(registry)).with_cache(cache.clone());
    Fixture {
        users,
        posts,
        cache,
        engine,
    }
}

#[tokio::test]
async fn test_left_join_users_posts() {
    let fx = fixture();
    let request = JoinRequest::new("users", "posts", JoinSpec::left("id", "user_id"));
    let joined = fx.engine.join(&request).await.unwrap();

    assert_eq!(
        joined,
        vec![
            record! { "id" => 1i64, "name" => "A", "title" => "P1" },
            record! { "id" => 2i64, "name" => "B", "title" => Value::Null },
        ]
    );
}

#[tokio::test]
async fn test_per_side_filters() {
    let fx = fixture();
    let mut only_b = Filters::new();
    only_b.insert("name".to_string(), Value::from("B"));

    let request = JoinRequest::new("users", "posts", JoinSpec::left("id", "user_id"))
        .primary_filters(only_b);
    let joined = fx.engine.join(&request).await.unwrap();
    assert_eq!(joined.len(), 1);
    assert_eq!(joined[0].get_str("name"), Some("B"));
    assert!(joined[0].is_null("title"));
}

#[tokio::test]
async fn test_transform_applies_to_every_merged_record() {
    let fx = fixture();
    let request = JoinRequest::new("users", "posts", JoinSpec::left("id", "user_id")).transform(
        |r: Record| {
            let has_post = !r.is_null("title");
            r.without_field("title").with_field("has_post", has_post)
        },
    );
    let joined = fx.engine.join(&request).await.unwrap();
    let flags: Vec<Option<bool>> = joined.iter().map(|r| r.get_bool("has_post")).collect();
    assert_eq!(flags, vec![Some(true), Some(false)]);
    assert!(joined.iter().all(|r| !r.contains_key("title")));
}

#[tokio::test]
async fn test_cached_join_skips_sources() {
    let fx = fixture();
    let request = JoinRequest::new("users", "posts", JoinSpec::inner("id", "user_id"))
        .cache_ttl(Duration::from_secs(60));

    let first = fx.engine.join(&request).await.unwrap();
    fx.users.set_records(vec![]);
    let second = fx.engine.join(&request).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(fx.users.fetch_count(), 1);
    assert_eq!(fx.posts.fetch_count(), 1);
    assert_eq!(fx.cache.len(), 1);
}

#[tokio::test]
async fn test_cache_entry_expires() {
    let fx = fixture();
    let request = JoinRequest::new("users", "posts", JoinSpec::inner("id", "user_id"))
        .cache_ttl(Duration::from_millis(20));

    fx.engine.join(&request).await.unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;
    fx.engine.join(&request).await.unwrap();
    assert_eq!(fx.users.fetch_count(), 2);
}

#[tokio::test]
async fn test_different_filters_use_different_cache_entries() {
    let fx = fixture();
    let spec = JoinSpec::left("id", "user_id");
    let mut only_a = Filters::new();
    only_a.insert("name".to_string(), Value::from("A"));

    let all = JoinRequest::new("users", "posts", spec.clone()).cache_ttl(Duration::from_secs(60));
    let some = all.clone().primary_filters(only_a);

    assert_eq!(fx.engine.join(&all).await.unwrap().len(), 2);
    assert_eq!(fx.engine.join(&some).await.unwrap().len(), 1);
    assert_eq!(fx.cache.len(), 2);
}

#[tokio::test]
async fn test_without_ttl_nothing_is_cached() {
    let fx = fixture();
    let request = JoinRequest::new("users", "posts", JoinSpec::full("id", "user_id"));
    fx.engine.join(&request).await.unwrap();
    fx.engine.join(&request).await.unwrap();
    assert!(fx.cache.is_empty());
    assert_eq!(fx.users.fetch_count(), 2);
}

#[tokio::test]
async fn test_result_with_nan_is_not_cached() {
    let fx = fixture();
    fx.users.set_records(vec![
        record! { "id" => 1i64, "name" => "A", "score" => f64::NAN },
    ]);
    let request = JoinRequest::new("users", "posts", JoinSpec::inner("id", "user_id"))
        .cache_ttl(Duration::from_secs(60));

    fx.engine.join(&request).await.unwrap();
    let second = fx.engine.join(&request).await.unwrap();

    assert!(second[0].get_float("score").unwrap().is_nan());
    assert!(fx.cache.is_empty());
    assert_eq!(fx.users.fetch_count(), 2);
}

#[tokio::test]
async fn test_corrupt_cache_entry_is_an_error() {
    let fx = fixture();
    let request = JoinRequest::new("users", "posts", JoinSpec::inner("id", "user_id"))
        .cache_ttl(Duration::from_secs(60));
    fx.cache
        .set(&request.cache_key(), b"{not json", None)
        .await
        .unwrap();

    let err = fx.engine.join(&request).await.unwrap_err();
    assert!(matches!(err, FabricError::Cache(_)));
}

#[tokio::test]
async fn test_invalid_spec_fails_before_fetching() {
    let fx = fixture();
    let request = JoinRequest::new("users", "posts", JoinSpec::inner("", "user_id"));
    let err = fx.engine.join(&request).await.unwrap_err();
    assert!(matches!(err, FabricError::InvalidJoinSpec(_)));
    assert_eq!(fx.users.fetch_count(), 0);
}

#[tokio::test]
async fn test_failing_side_propagates() {
    let fx = fixture();
    fx.posts.set_failing(true);
    let request = JoinRequest::new("users", "posts", JoinSpec::left("id", "user_id"));
    let err = fx.engine.join(&request).await.unwrap_err();
    assert_eq!(err.stream_id(), Some("posts"));
}

#[tokio::test]
async fn test_unknown_stream() {
    let fx = fixture();
    let request = JoinRequest::new("users", "comments", JoinSpec::left("id", "user_id"));
    let err = fx.engine.join(&request).await.unwrap_err();
    assert!(matches!(err, FabricError::UnknownStream(ref id) if id == "comments"));
}
