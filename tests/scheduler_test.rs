//! 账号池调度与限流冷却测试

use api_relay::config::RateLimitConfig;
use api_relay::key_pool::{AccountPool, RateLimitState, RateLimitTracker, SelectionCriteria};
use api_relay::types::{AccountRecord, Credential, Platform, RecordKind};
use axum::http::HeaderMap;
use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;
use std::collections::HashMap;
use std::sync::Arc;

fn record(id: &str) -> AccountRecord {
    AccountRecord {
        id: id.to_string(),
        name: String::new(),
        platform: Platform::Anthropic,
        kind: RecordKind::ApiKey,
        base_url: None,
        credential: Credential::ApiKey {
            api_key: format!("sk-{id}"),
        },
        proxy_id: None,
        group_ids: vec![],
        supported_models: vec![],
        schedulable: true,
        rate_limited_until: None,
        last_error: None,
        deleted: false,
    }
}

async fn pool_with(ids: &[&str]) -> Arc<AccountPool> {
    let pool = Arc::new(AccountPool::new());
    pool.load(ids.iter().map(|id| record(id)).collect(), vec![])
        .await
        .unwrap();
    pool
}

fn criteria() -> SelectionCriteria {
    SelectionCriteria::new("req", Platform::Anthropic)
}

#[tokio::test]
async fn test_lru_rotation_with_id_tiebreak() {
    let pool = pool_with(&["c", "a", "b"]).await;
    let mut picked = Vec::new();
    for _ in 0..6 {
        let selection = pool
            .select_and_mark_used(&criteria(), Utc::now())
            .await
            .unwrap();
        picked.push(selection.account.id);
    }
    assert_eq!(picked, ["a", "b", "c", "a", "b", "c"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_selection_spreads_evenly() {
    let pool = pool_with(&["a", "b", "c", "d"]).await;
    let tasks: Vec<_> = (0..40)
        .map(|_| {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                pool.select_and_mark_used(&criteria(), Utc::now())
                    .await
                    .unwrap()
                    .account
                    .id
            })
        })
        .collect();

    let mut counts: HashMap<String, usize> = HashMap::new();
    for task in tasks {
        *counts.entry(task.await.unwrap()).or_default() += 1;
    }
    assert_eq!(counts.len(), 4);
    assert!(counts.values().all(|count| *count == 10), "{counts:?}");
}

#[tokio::test]
async fn test_excluded_and_rate_limited_accounts_are_skipped() {
    let pool = pool_with(&["a", "b"]).await;
    let now = Utc::now();
    pool.set_rate_limited("a", now + Duration::minutes(5))
        .await
        .unwrap();

    let mut criteria = criteria();
    assert_eq!(
        pool.select_and_mark_used(&criteria, now)
            .await
            .unwrap()
            .account
            .id,
        "b"
    );
    criteria.exclude.insert("b".to_string());
    assert!(pool.select_and_mark_used(&criteria, now).await.is_err());

    // 冷却到期后惰性恢复
    let later = now + Duration::minutes(6);
    criteria.exclude.clear();
    assert_eq!(
        pool.select_and_mark_used(&criteria, later)
            .await
            .unwrap()
            .account
            .id,
        "a"
    );
}

#[tokio::test]
async fn test_tracker_cooldown_and_admin_clear() {
    let pool = pool_with(&["a"]).await;
    let tracker = RateLimitTracker::new(Arc::clone(&pool), RateLimitConfig::default());
    let now = Utc::now();

    let mut headers = HeaderMap::new();
    headers.insert("retry-after", "30".parse().unwrap());
    let until = tracker
        .observe("req", "a", 429, &headers, b"", now)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(until, now + Duration::seconds(30));
    assert_eq!(
        tracker.state("a", now).await.unwrap(),
        RateLimitState::RateLimited { until }
    );
    assert_eq!(
        tracker.state("a", until).await.unwrap(),
        RateLimitState::Healthy
    );

    assert!(
        tracker
            .observe("req", "a", 500, &HeaderMap::new(), b"oops", now)
            .await
            .unwrap()
            .is_none()
    );

    tracker.clear("a").await.unwrap();
    assert_eq!(tracker.state("a", now).await.unwrap(), RateLimitState::Healthy);
}

#[tokio::test]
async fn test_model_capability_and_group_filtering() {
    let pool = Arc::new(AccountPool::new());
    let mut haiku_only = record("haiku");
    haiku_only.supported_models = vec!["claude-haiku-*".to_string()];
    let mut grouped = record("grouped");
    grouped.group_ids = vec![7];
    pool.load(vec![haiku_only, grouped], vec![]).await.unwrap();

    let sonnet = criteria().with_model("claude-sonnet-4-5-20250929");
    assert!(pool.select_and_mark_used(&sonnet, Utc::now()).await.is_err());

    let sonnet_in_group = sonnet.with_group(Some(7));
    assert_eq!(
        pool.select_and_mark_used(&sonnet_in_group, Utc::now())
            .await
            .unwrap()
            .account
            .id,
        "grouped"
    );
}

#[tokio::test]
async fn test_short_name_capability_matches_upstream_model() {
    let pool = Arc::new(AccountPool::new());
    let mut opus = record("opus");
    opus.supported_models = vec!["claude-opus-4-5".to_string()];
    pool.load(vec![opus], vec![]).await.unwrap();

    let criteria = criteria().with_model("claude-opus-4-5-20251101");
    assert_eq!(
        pool.select_and_mark_used(&criteria, Utc::now())
            .await
            .unwrap()
            .account
            .id,
        "opus"
    );

    let other = SelectionCriteria::new("req", Platform::Anthropic).with_model("claude-sonnet-4-5-20250929");
    assert!(pool.select_and_mark_used(&other, Utc::now()).await.is_err());
}
