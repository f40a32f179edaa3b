use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

use jgrants_sync::config;
use jgrants_sync::db::{self, ContentFields};
use jgrants_sync::enrich::{
    BackendError, Enricher, EnrichmentOutcome, SkipReason, TextBackend,
};
use jgrants_sync::model::{ContentStatus, Taxonomy};
use jgrants_sync::taxonomy;

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    taxonomy::install_defaults(&pool).await.unwrap();
    pool
}

fn ai_config(max_requests: usize, window_minutes: u64) -> config::Ai {
    let cfg: config::Config = serde_yaml::from_str(config::example()).unwrap();
    let mut ai = cfg.ai;
    ai.rate_limit = config::RateLimit {
        max_requests,
        window_minutes,
    };
    ai
}

async fn insert_record(pool: &sqlx::SqlitePool, external_id: &str, title: &str) -> i64 {
    let fields = ContentFields {
        external_id: external_id.to_string(),
        title: title.to_string(),
        organization: "中小企業庁".to_string(),
        purpose: "販路開拓".to_string(),
        target: "小規模事業者".to_string(),
        max_amount: 3_000_000,
        grant_status: "active".to_string(),
        ..Default::default()
    };
    db::insert_content(pool, &fields, ContentStatus::Draft, "")
        .await
        .unwrap()
}

#[derive(Clone, Default)]
struct FakeBackend {
    responses: Arc<Mutex<VecDeque<Result<String, BackendError>>>>,
    calls: Arc<Mutex<Vec<(String, String)>>>,
}

impl FakeBackend {
    fn with_responses(responses: Vec<Result<String, BackendError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            ..Default::default()
        }
    }

    async fn call_count(&self) -> usize {
        self.calls.lock().await.len()
    }

    async fn prompts(&self) -> Vec<String> {
        self.calls
            .lock()
            .await
            .iter()
            .map(|(_, prompt)| prompt.clone())
            .collect()
    }
}

#[async_trait]
impl TextBackend for FakeBackend {
    async fn generate(
        &self,
        system: &str,
        prompt: &str,
        _max_tokens: u32,
    ) -> Result<String, BackendError> {
        self.calls
            .lock()
            .await
            .push((system.to_string(), prompt.to_string()));
        self.responses
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Ok("生成テキスト".to_string()))
    }
}

#[tokio::test]
async fn enrich_fills_empty_title_and_always_replaces_excerpt() {
    let pool = setup_pool().await;
    let id = insert_record(&pool, "e1", "").await;

    let backend = FakeBackend::with_responses(vec![
        Ok("<strong>小規模事業者必見</strong>の持続化補助金ガイド".to_string()),
        Ok("最大300万円を支援する補助金です。".to_string()),
        Ok("<h2>概要</h2><p>本文です。</p>".to_string()),
        Ok("創業・起業".to_string()),
        Ok("全国".to_string()),
    ]);
    let enricher = Enricher::new(Arc::new(backend.clone()), ai_config(10, 10));

    let outcome = enricher.enrich(&pool, id).await.unwrap();
    let EnrichmentOutcome::Applied(result) = outcome else {
        panic!("expected applied outcome");
    };
    assert!(result.titled);
    assert!(result.excerpted);
    assert!(result.bodied);
    assert!(result.categorized);

    let record = db::get_content(&pool, id).await.unwrap();
    assert_eq!(record.title, "小規模事業者必見の持続化補助金ガイド");
    assert_eq!(record.excerpt, "最大300万円を支援する補助金です。");
    assert_eq!(record.body, "<h2>概要</h2><p>本文です。</p>");
    assert!(record.ai_generated_at.is_some());

    let categories = db::term_names_for_content(&pool, id, Taxonomy::Category)
        .await
        .unwrap();
    assert_eq!(categories, vec!["創業・起業".to_string()]);
}

#[tokio::test]
async fn existing_title_is_never_replaced() {
    let pool = setup_pool().await;
    let id = insert_record(&pool, "e2", "手で付けたタイトル").await;

    let backend = FakeBackend::default();
    let enricher = Enricher::new(Arc::new(backend.clone()), ai_config(10, 10));
    let outcome = enricher.enrich(&pool, id).await.unwrap();

    let EnrichmentOutcome::Applied(result) = outcome else {
        panic!("expected applied outcome");
    };
    assert!(!result.titled);

    let record = db::get_content(&pool, id).await.unwrap();
    assert_eq!(record.title, "手で付けたタイトル");

    // No title prompt went out: excerpt, body, category, region only.
    assert_eq!(backend.call_count().await, 4);
}

#[tokio::test]
async fn generated_title_is_stripped_and_capped() {
    let pool = setup_pool().await;
    let id = insert_record(&pool, "e3", "").await;

    let long_title = format!("<h1>{}</h1>", "あ".repeat(150));
    let backend = FakeBackend::with_responses(vec![Ok(long_title)]);
    let enricher = Enricher::new(Arc::new(backend), ai_config(10, 10));
    enricher.enrich(&pool, id).await.unwrap();

    let record = db::get_content(&pool, id).await.unwrap();
    assert_eq!(record.title.chars().count(), 100);
    assert!(!record.title.contains('<'));
}

#[tokio::test]
async fn body_is_sanitized_before_storage() {
    let pool = setup_pool().await;
    let id = insert_record(&pool, "e4", "タイトルあり").await;

    let backend = FakeBackend::with_responses(vec![
        Ok("要約".to_string()),
        Ok("<h2>概要</h2><script>alert(1)</script><p onclick=\"x\">説明</p>".to_string()),
    ]);
    let enricher = Enricher::new(Arc::new(backend), ai_config(10, 10));
    enricher.enrich(&pool, id).await.unwrap();

    let record = db::get_content(&pool, id).await.unwrap();
    assert_eq!(record.body, "<h2>概要</h2><p>説明</p>");
}

#[tokio::test]
async fn third_call_in_full_window_is_skipped() {
    let pool = setup_pool().await;
    let first = insert_record(&pool, "r1", "一").await;
    let second = insert_record(&pool, "r2", "二").await;
    let third = insert_record(&pool, "r3", "三").await;

    let backend = FakeBackend::default();
    let enricher = Enricher::new(Arc::new(backend.clone()), ai_config(2, 3));

    assert!(matches!(
        enricher.enrich(&pool, first).await.unwrap(),
        EnrichmentOutcome::Applied(_)
    ));
    assert!(matches!(
        enricher.enrich(&pool, second).await.unwrap(),
        EnrichmentOutcome::Applied(_)
    ));

    let calls_before = backend.call_count().await;
    let outcome = enricher.enrich(&pool, third).await.unwrap();
    assert_eq!(
        outcome,
        EnrichmentOutcome::Skipped(SkipReason::RateLimited)
    );
    // Not queued, not retried: the backend never saw the third record.
    assert_eq!(backend.call_count().await, calls_before);

    let record = db::get_content(&pool, third).await.unwrap();
    assert!(record.ai_generated_at.is_none());
}

#[tokio::test]
async fn fresh_record_is_skipped_without_consuming_quota() {
    let pool = setup_pool().await;
    let fresh = insert_record(&pool, "f1", "新鮮").await;
    let stale = insert_record(&pool, "f2", "古株").await;
    db::mark_ai_generated(&pool, fresh, Utc::now() - Duration::hours(1))
        .await
        .unwrap();

    let backend = FakeBackend::default();
    // One request slot total: if the fresh skip consumed it, the second
    // record could not be enriched.
    let enricher = Enricher::new(Arc::new(backend.clone()), ai_config(1, 10));

    let outcome = enricher.enrich(&pool, fresh).await.unwrap();
    assert_eq!(
        outcome,
        EnrichmentOutcome::Skipped(SkipReason::RecentlyGenerated)
    );
    assert_eq!(backend.call_count().await, 0);

    assert!(matches!(
        enricher.enrich(&pool, stale).await.unwrap(),
        EnrichmentOutcome::Applied(_)
    ));
}

#[tokio::test]
async fn proposed_category_is_created_once_and_reused() {
    let pool = setup_pool().await;
    let first = insert_record(&pool, "c1", "一件目").await;
    let second = insert_record(&pool, "c2", "二件目").await;

    let mut responses: Vec<Result<String, BackendError>> = Vec::new();
    for _ in 0..2 {
        responses.push(Ok("要約".to_string()));
        responses.push(Ok("<p>本文</p>".to_string()));
        responses.push(Ok("宇宙開発".to_string()));
        responses.push(Ok("全国".to_string()));
    }
    let backend = FakeBackend::with_responses(responses);
    let enricher = Enricher::new(Arc::new(backend), ai_config(10, 10));

    enricher.enrich(&pool, first).await.unwrap();
    enricher.enrich(&pool, second).await.unwrap();

    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM terms WHERE taxonomy = 'grant_category' AND name = '宇宙開発'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(count, 1);

    for id in [first, second] {
        let names = db::term_names_for_content(&pool, id, Taxonomy::Category)
            .await
            .unwrap();
        assert_eq!(names, vec!["宇宙開発".to_string()]);
    }
}

#[tokio::test]
async fn region_answers_are_filtered_to_canonical_names() {
    let pool = setup_pool().await;
    let id = insert_record(&pool, "g1", "地域対象").await;

    let backend = FakeBackend::with_responses(vec![
        Ok("要約".to_string()),
        Ok("本文".to_string()),
        Ok("その他".to_string()),
        Ok("東京都, 謎の県, 大阪府".to_string()),
    ]);
    let enricher = Enricher::new(Arc::new(backend), ai_config(10, 10));
    let outcome = enricher.enrich(&pool, id).await.unwrap();

    let EnrichmentOutcome::Applied(result) = outcome else {
        panic!("expected applied outcome");
    };
    assert!(result.regioned);

    let names = db::term_names_for_content(&pool, id, Taxonomy::Prefecture)
        .await
        .unwrap();
    assert_eq!(names, vec!["大阪府".to_string(), "東京都".to_string()]);
}

#[tokio::test]
async fn unusable_region_answer_defaults_to_nationwide() {
    let pool = setup_pool().await;
    let id = insert_record(&pool, "g2", "地域不明").await;

    let backend = FakeBackend::with_responses(vec![
        Ok("要約".to_string()),
        Ok("本文".to_string()),
        Ok("その他".to_string()),
        Ok("対象地域は不明です".to_string()),
    ]);
    let enricher = Enricher::new(Arc::new(backend), ai_config(10, 10));
    let outcome = enricher.enrich(&pool, id).await.unwrap();

    let EnrichmentOutcome::Applied(result) = outcome else {
        panic!("expected applied outcome");
    };
    assert!(!result.regioned);

    let names = db::term_names_for_content(&pool, id, Taxonomy::Prefecture)
        .await
        .unwrap();
    assert_eq!(names, vec![taxonomy::NATIONWIDE.to_string()]);
}

#[tokio::test]
async fn existing_prefectures_skip_the_backend() {
    let pool = setup_pool().await;
    let id = insert_record(&pool, "g3", "地域確定済み").await;
    let term = db::get_or_create_term(&pool, Taxonomy::Prefecture, "北海道", "", None)
        .await
        .unwrap();
    db::replace_term_assignments(&pool, id, Taxonomy::Prefecture, &[term])
        .await
        .unwrap();

    let backend = FakeBackend::default();
    let enricher = Enricher::new(Arc::new(backend.clone()), ai_config(10, 10));
    enricher.enrich(&pool, id).await.unwrap();

    // Excerpt, body, category; no region prompt.
    assert_eq!(backend.call_count().await, 3);
    for prompt in backend.prompts().await {
        assert!(!prompt.contains("都道府県リスト"));
    }

    let names = db::term_names_for_content(&pool, id, Taxonomy::Prefecture)
        .await
        .unwrap();
    assert_eq!(names, vec!["北海道".to_string()]);
}

#[tokio::test]
async fn backend_failure_soft_fails_each_step() {
    let pool = setup_pool().await;
    let id = insert_record(&pool, "b1", "").await;

    let backend = FakeBackend::with_responses(vec![
        Err(BackendError::Api("quota exceeded".to_string())),
        Err(BackendError::Api("quota exceeded".to_string())),
        Err(BackendError::Transport("timeout".to_string())),
        Err(BackendError::Api("quota exceeded".to_string())),
        Err(BackendError::Transport("timeout".to_string())),
    ]);
    let enricher = Enricher::new(Arc::new(backend), ai_config(10, 10));

    let outcome = enricher.enrich(&pool, id).await.unwrap();
    let EnrichmentOutcome::Applied(result) = outcome else {
        panic!("expected applied outcome");
    };
    assert!(!result.any());

    let record = db::get_content(&pool, id).await.unwrap();
    assert_eq!(record.title, "");
    assert_eq!(record.excerpt, "");
    assert_eq!(record.body, "");
    assert!(record.ai_generated_at.is_none());

    // The failed steps still fall back to the catch-all terms.
    let categories = db::term_names_for_content(&pool, id, Taxonomy::Category)
        .await
        .unwrap();
    assert_eq!(categories, vec![taxonomy::FALLBACK_CATEGORY.to_string()]);
    let prefectures = db::term_names_for_content(&pool, id, Taxonomy::Prefecture)
        .await
        .unwrap();
    assert_eq!(prefectures, vec![taxonomy::NATIONWIDE.to_string()]);
}

#[tokio::test]
async fn batch_enrich_counts_success_failed_skipped() {
    let pool = setup_pool().await;
    let fresh = insert_record(&pool, "m1", "既生成").await;
    let ok = insert_record(&pool, "m2", "成功する").await;
    let failing = insert_record(&pool, "m3", "失敗する").await;
    db::mark_ai_generated(&pool, fresh, Utc::now()).await.unwrap();

    // `ok` consumes four successful responses, then `failing` sees errors
    // for every step.
    let mut responses: Vec<Result<String, BackendError>> = vec![
        Ok("要約".to_string()),
        Ok("本文".to_string()),
        Ok("その他".to_string()),
        Ok("全国".to_string()),
    ];
    responses.extend((0..4).map(|_| Err(BackendError::Api("down".to_string()))));
    let backend = FakeBackend::with_responses(responses);
    let enricher = Enricher::new(Arc::new(backend), ai_config(10, 10));

    let outcome = enricher
        .batch_enrich(&pool, &[fresh, ok, failing], 2, 0)
        .await;
    assert_eq!(outcome.success, 1);
    assert_eq!(outcome.failed, 1);
    assert_eq!(outcome.skipped, 1);
}
