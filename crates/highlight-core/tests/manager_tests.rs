//! End-to-end tests for the highlight manager, driven through its public
//! handle against an in-memory store.

use std::sync::Arc;
use std::time::Duration;

use highlight_config::AppConfig;
use highlight_core::{
    HighlightManager, ManagerError, MemoryStore, SubscriptionStore, TriggerKind,
};
use highlight_test_utils::config::TestConfigBuilder;
use highlight_test_utils::fixtures::{self, GUILD};
use highlight_test_utils::tracing_setup;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

async fn start(store: &Arc<MemoryStore>) -> HighlightManager {
    HighlightManager::start(AppConfig::default(), store.clone())
        .await
        .unwrap()
}

#[test_log::test(tokio::test)]
async fn test_message_highlights_both_kinds() {
    let store = fixtures::store(fixtures::sample_guild());
    let manager = start(&store).await;

    let highlights = manager
        .submit_message(GUILD, "dave", "m1", "I love Rust and crabs")
        .await
        .unwrap();

    assert!(highlights.complete);
    assert_eq!(highlights.message_id, "m1");
    assert_eq!(highlights.words.matched_user_ids, vec!["alice", "bob"]);
    for result in &highlights.words.results {
        assert_eq!(result.trigger, "rust");
        assert_eq!(result.parsed_content, "I love **Rust** and crabs");
    }
    assert_eq!(highlights.patterns.matched_user_ids, vec!["alice"]);
    assert_eq!(
        highlights.patterns.results[0].parsed_content,
        "I love Rust and **crabs**"
    );

    manager.destroy().await;
}

#[tokio::test]
async fn test_author_never_highlighted() {
    let store = fixtures::store(fixtures::sample_guild());
    let manager = start(&store).await;

    let highlights = manager
        .submit_message(GUILD, "alice", "m1", "rust crab")
        .await
        .unwrap();

    assert_eq!(highlights.words.matched_user_ids, vec!["bob"]);
    assert!(highlights.patterns.is_empty());
}

#[tokio::test]
async fn test_phrase_trigger() {
    let store = fixtures::store(fixtures::sample_guild());
    let manager = start(&store).await;

    let highlights = manager
        .submit_message(GUILD, "dave", "m1", "the Borrow Checker strikes")
        .await
        .unwrap();

    let (kind, result) = highlights.results().next().unwrap();
    assert_eq!(kind, TriggerKind::Word);
    assert_eq!(result.member_id, "bob");
    assert_eq!(result.parsed_content, "the **Borrow Checker** strikes");
}

#[tokio::test]
async fn test_other_guild_sees_nothing() {
    let store = fixtures::store(fixtures::sample_guild());
    let manager = start(&store).await;

    let highlights = manager
        .submit_message("elsewhere", "dave", "m1", "rust crabs")
        .await
        .unwrap();

    assert!(highlights.complete);
    assert!(highlights.is_empty());
}

#[test_log::test(tokio::test)]
async fn test_invalid_pattern_deleted_from_store() {
    let store = fixtures::store(fixtures::sample_guild());
    let manager = start(&store).await;

    manager
        .submit_message(GUILD, "dave", "m1", "anything")
        .await
        .unwrap();

    let deleted = fixtures::wait_for(Duration::from_secs(2), || {
        !store
            .subscriptions()
            .unwrap()
            .iter()
            .any(|s| s.user_id == "carol")
    })
    .await;
    assert!(deleted, "broken pattern should be removed from the store");
}

#[tokio::test]
async fn test_validate_pattern() {
    let store = fixtures::store(Vec::new());
    let manager = start(&store).await;

    assert!(manager.validate_pattern("(?i)cr[a]bs?").await.unwrap());
    assert!(!manager.validate_pattern("[unclosed").await.unwrap());
    assert!(manager.validate_pattern("re:\\d+").await.unwrap());
}

#[tokio::test]
async fn test_oversized_pattern_rejected() {
    let config = TestConfigBuilder::new().size_limit(64).build();
    let manager = HighlightManager::start(config, fixtures::store(Vec::new()))
        .await
        .unwrap();

    assert!(!manager.validate_pattern("\\w{500}").await.unwrap());
}

#[tokio::test]
async fn test_update_cache_for_guild_picks_up_store_changes() {
    let store = fixtures::store(fixtures::sample_guild());
    let manager = start(&store).await;

    store
        .upsert(fixtures::word(GUILD, "erin", "ferris"))
        .unwrap();
    manager.update_cache_for_guild(GUILD).await.unwrap();

    let highlights = manager
        .submit_message(GUILD, "dave", "m1", "hello Ferris")
        .await
        .unwrap();
    assert_eq!(highlights.words.matched_user_ids, vec!["erin"]);
}

#[tokio::test]
async fn test_update_all_caches_drops_removed_subscriptions() {
    let store = fixtures::store(fixtures::sample_guild());
    let manager = start(&store).await;

    store.delete_trigger(GUILD, "bob", "rust").await.unwrap();
    manager.update_all_caches().await.unwrap();

    let highlights = manager
        .submit_message(GUILD, "dave", "m1", "rust")
        .await
        .unwrap();
    assert_eq!(highlights.words.matched_user_ids, vec!["alice"]);
}

#[tokio::test]
async fn test_subscribe_user_merges_without_store() {
    let store = fixtures::store(Vec::new());
    let manager = start(&store).await;

    manager
        .subscribe_user(&fixtures::word(GUILD, "frank", "tokio"))
        .unwrap();
    manager
        .subscribe_user(&fixtures::pattern(GUILD, "frank", "t.kio"))
        .unwrap();

    let highlights = manager
        .submit_message(GUILD, "dave", "m1", "tokio rocks")
        .await
        .unwrap();
    // Words and patterns deduplicate independently.
    assert_eq!(highlights.words.matched_user_ids, vec!["frank"]);
    assert_eq!(highlights.patterns.matched_user_ids, vec!["frank"]);
}

#[tokio::test]
async fn test_remove_trigger_for_user() {
    let store = fixtures::store(fixtures::sample_guild());
    let manager = start(&store).await;

    manager
        .remove_trigger_for_user(GUILD, "bob", "rust")
        .unwrap();
    manager
        .remove_trigger_for_user(GUILD, "alice", "cr[a]bs?")
        .unwrap();

    let highlights = manager
        .submit_message(GUILD, "dave", "m1", "rust crabs")
        .await
        .unwrap();
    assert_eq!(highlights.words.matched_user_ids, vec!["alice"]);
    assert!(highlights.patterns.is_empty());
}

#[tokio::test]
async fn test_concurrent_submissions_of_same_message() {
    let store = fixtures::store(fixtures::sample_guild());
    let manager = start(&store).await;

    let (first, second) = tokio::join!(
        manager.submit_message(GUILD, "dave", "m1", "rust"),
        manager.submit_message(GUILD, "dave", "m1", "rust"),
    );
    assert_eq!(first.unwrap(), second.unwrap());
}

#[tokio::test]
async fn test_status_reports_units() {
    let store = fixtures::store(Vec::new());
    let manager = start(&store).await;

    let status = manager.status().await.unwrap();
    assert_eq!(status.workers.len(), 2);
    for kind in TriggerKind::ALL {
        assert_eq!(status.worker(kind).unwrap().generation, 1);
    }
    assert_eq!(status.pending_scans, 0);
    assert_eq!(status.pending_validations, 0);
}

#[tokio::test]
async fn test_destroy_is_idempotent_and_final() {
    let store = fixtures::store(fixtures::sample_guild());
    let manager = start(&store).await;

    manager.destroy().await;
    manager.destroy().await;

    let result = manager.submit_message(GUILD, "dave", "m1", "rust").await;
    assert!(matches!(result, Err(ManagerError::ShuttingDown)));
    assert!(matches!(
        manager.validate_pattern("a+").await,
        Err(ManagerError::ShuttingDown)
    ));
    assert!(matches!(
        manager.update_all_caches().await,
        Err(ManagerError::ShuttingDown)
    ));
}

#[tokio::test]
async fn test_start_from_subscriptions_file() {
    tracing_setup::init_test_tracing();
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("subscriptions.toml");
    tokio::fs::write(
        &path,
        r#"
            [[subscriptions]]
            guild_id = "g1"
            user_id = "u1"
            words = ["ferris"]
            patterns = ["re:(?i)CRAB"]
        "#,
    )
    .await
    .unwrap();

    let store = Arc::new(MemoryStore::load(&path).await.unwrap());
    let config = TestConfigBuilder::new()
        .store_path(&path.to_string_lossy())
        .build();
    let manager = HighlightManager::start(config, store).await.unwrap();

    let highlights = manager
        .submit_message("g1", "u2", "m1", "Ferris the crab")
        .await
        .unwrap();
    assert_eq!(highlights.words.results[0].trigger, "ferris");
    assert_eq!(highlights.patterns.results[0].trigger, "CRAB");
    assert_eq!(
        highlights.patterns.results[0].parsed_content,
        "Ferris the **crab**"
    );
}
