//! AI content enrichment: generated titles, excerpts, long-form articles,
//! and taxonomy suggestions for synced grants.
//!
//! Every backend call sits behind a sliding-window rate limiter and a
//! freshness guard; individual generation steps fail soft so one bad
//! response never aborts a sync run.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, Url};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config;
use crate::db::{self, ContentRecord, Pool};
use crate::model::Taxonomy;
use crate::taxonomy::{self, FALLBACK_CATEGORY, NATIONWIDE};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("no API key configured")]
    NoApiKey,
    #[error("backend request failed: {0}")]
    Transport(String),
    #[error("backend error: {0}")]
    Api(String),
}

/// Single synchronous text-generation call. One request per step, bounded
/// output, fixed sampling; implementations must not stream.
#[async_trait]
pub trait TextBackend: Send + Sync {
    async fn generate(
        &self,
        system: &str,
        prompt: &str,
        max_tokens: u32,
    ) -> Result<String, BackendError>;
}

#[derive(Clone)]
pub struct OpenAiBackend {
    http: Client,
    base_url: Url,
    api_key: String,
    model: String,
}

impl fmt::Debug for OpenAiBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiBackend")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl OpenAiBackend {
    pub fn from_config(cfg: &config::Ai) -> anyhow::Result<Self> {
        let base_url = Url::parse(&cfg.base_url)?;
        let http = Client::builder()
            .user_agent("jgrants-sync/0.1")
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            base_url,
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
        })
    }
}

#[async_trait]
impl TextBackend for OpenAiBackend {
    async fn generate(
        &self,
        system: &str,
        prompt: &str,
        max_tokens: u32,
    ) -> Result<String, BackendError> {
        if self.api_key.trim().is_empty() {
            return Err(BackendError::NoApiKey);
        }

        let endpoint = self
            .base_url
            .join("chat/completions")
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": prompt},
            ],
            "max_tokens": max_tokens,
            "temperature": 0.7,
            "top_p": 0.9,
        });

        let res = self
            .http
            .post(endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        let payload: Value = res
            .json()
            .await
            .map_err(|e| BackendError::Transport(format!("invalid backend response: {e}")))?;

        if let Some(message) = payload
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
        {
            return Err(BackendError::Api(message.to_string()));
        }

        payload
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| BackendError::Api("response carried no content".to_string()))
    }
}

/// Sliding window of request timestamps: at most `max_requests` within the
/// trailing `window`. Refusal is final for the caller; nothing is queued.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    stamps: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            stamps: VecDeque::new(),
        }
    }

    pub fn try_acquire(&mut self) -> bool {
        let now = Instant::now();
        while let Some(front) = self.stamps.front() {
            if now.duration_since(*front) >= self.window {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
        if self.stamps.len() >= self.max_requests {
            return false;
        }
        self.stamps.push_back(now);
        true
    }
}

/// Why an enrichment call did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    RateLimited,
    RecentlyGenerated,
}

/// Which steps actually landed content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnrichmentResult {
    pub titled: bool,
    pub excerpted: bool,
    pub bodied: bool,
    pub categorized: bool,
    pub regioned: bool,
}

impl EnrichmentResult {
    pub fn any(&self) -> bool {
        self.titled || self.excerpted || self.bodied || self.categorized || self.regioned
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrichmentOutcome {
    Skipped(SkipReason),
    Applied(EnrichmentResult),
}

/// Counters for a batch-enrichment pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
}

const TITLE_SYSTEM: &str = "あなたは補助金情報のSEOスペシャリストです。検索エンジンで上位表示され、ユーザーがクリックしたくなるタイトルを作成してください。";
const EXCERPT_SYSTEM: &str =
    "あなたは補助金情報を簡潔にまとめる専門家です。事業者が最も知りたい情報を優先的に含めてください。";
const BODY_SYSTEM: &str = "あなたは補助金申請のコンサルタントです。申請を検討している事業者に対して、分かりやすく実用的な情報を提供してください。専門用語は必要に応じて説明を加えてください。";
const CATEGORY_SYSTEM: &str =
    "あなたは補助金の分類専門家です。補助金の内容を正確に分析し、最も適切なカテゴリを判定してください。";
const REGION_SYSTEM: &str =
    "あなたは日本の地理と行政区分の専門家です。補助金の対象地域を正確に判定してください。";

const DEFAULT_TITLE_PROMPT: &str = "以下の補助金情報から、SEOに最適化された魅力的なタイトルを生成してください。タイトルは60文字以内で、キーワードを含め、クリック率が高くなるようにしてください。補助金名: {grant_name}, 実施機関: {organization}, 最大支援額: {max_amount}, 対象: {target}, 締切: {deadline}";
const DEFAULT_EXCERPT_PROMPT: &str =
    "以下の補助金情報から、重要なポイントを150文字以内で簡潔にまとめてください。";
const DEFAULT_BODY_PROMPT: &str = "以下の補助金情報から、事業者に役立つ詳細な解説記事を生成してください。見出しは以下の構成で作成してください: 1.概要, 2.対象者・条件, 3.支援内容, 4.申請のポイント, 5.注意事項, 6.まとめ";

pub struct Enricher {
    backend: Arc<dyn TextBackend>,
    limiter: Mutex<RateLimiter>,
    cfg: config::Ai,
}

impl Enricher {
    pub fn new(backend: Arc<dyn TextBackend>, cfg: config::Ai) -> Self {
        let limiter = RateLimiter::new(
            cfg.rate_limit.max_requests,
            Duration::from_secs(cfg.rate_limit.window_minutes * 60),
        );
        Self {
            backend,
            limiter: Mutex::new(limiter),
            cfg,
        }
    }

    pub fn from_config(cfg: &config::Ai) -> anyhow::Result<Self> {
        let backend = Arc::new(OpenAiBackend::from_config(cfg)?);
        Ok(Self::new(backend, cfg.clone()))
    }

    /// Enrich one content record using the configured step toggles.
    pub async fn enrich(&self, pool: &Pool, content_id: i64) -> anyhow::Result<EnrichmentOutcome> {
        self.enrich_with(pool, content_id, self.cfg.steps).await
    }

    /// Enrich one content record with explicit step selection.
    pub async fn enrich_with(
        &self,
        pool: &Pool,
        content_id: i64,
        steps: config::Steps,
    ) -> anyhow::Result<EnrichmentOutcome> {
        let record = db::get_content(pool, content_id).await?;

        // Freshness wins over the rate limiter: a fresh record never
        // consumes a request slot.
        if let Some(at) = record.ai_generated_at {
            let age = Utc::now() - at;
            if age < ChronoDuration::hours(self.cfg.regenerate_after_hours) {
                debug!(content_id, "enrichment skipped; content is fresh");
                return Ok(EnrichmentOutcome::Skipped(SkipReason::RecentlyGenerated));
            }
        }

        if !self.limiter.lock().await.try_acquire() {
            info!(content_id, "enrichment skipped; rate limit window is full");
            return Ok(EnrichmentOutcome::Skipped(SkipReason::RateLimited));
        }

        let mut result = EnrichmentResult::default();

        if steps.title && record.title.trim().is_empty() {
            match self.generate_title(&record).await {
                Ok(title) if !title.is_empty() => {
                    db::update_generated_title(pool, content_id, &title).await?;
                    result.titled = true;
                }
                Ok(_) => {}
                Err(err) => warn!(content_id, ?err, "title generation failed"),
            }
        }

        if steps.excerpt {
            match self.generate_excerpt(&record).await {
                Ok(excerpt) if !excerpt.is_empty() => {
                    db::update_generated_excerpt(pool, content_id, &excerpt).await?;
                    result.excerpted = true;
                }
                Ok(_) => {}
                Err(err) => warn!(content_id, ?err, "excerpt generation failed"),
            }
        }

        if steps.body {
            match self.generate_body(&record).await {
                Ok(body) if !body.is_empty() => {
                    db::update_generated_body(pool, content_id, &body).await?;
                    result.bodied = true;
                }
                Ok(_) => {}
                Err(err) => warn!(content_id, ?err, "body generation failed"),
            }
        }

        if steps.category {
            match self.categorize(pool, &record).await {
                Ok(applied) => result.categorized = applied,
                Err(err) => warn!(content_id, ?err, "categorization failed"),
            }
        }

        if steps.region {
            match self.extract_region(pool, &record).await {
                Ok(applied) => result.regioned = applied,
                Err(err) => warn!(content_id, ?err, "region extraction failed"),
            }
        }

        if result.any() {
            db::mark_ai_generated(pool, content_id, Utc::now()).await?;
        }
        Ok(EnrichmentOutcome::Applied(result))
    }

    /// Enrich a list of records in fixed-size groups, strictly sequentially.
    /// The per-item delay and the longer between-group pause keep us inside
    /// upstream per-minute quotas.
    pub async fn batch_enrich(
        &self,
        pool: &Pool,
        content_ids: &[i64],
        batch_size: usize,
        delay_secs: u64,
    ) -> BatchOutcome {
        let batch_size = batch_size.max(1);
        let mut outcome = BatchOutcome::default();

        let groups: Vec<&[i64]> = content_ids.chunks(batch_size).collect();
        for (group_index, group) in groups.iter().enumerate() {
            for (item_index, content_id) in group.iter().enumerate() {
                match self.enrich(pool, *content_id).await {
                    Ok(EnrichmentOutcome::Applied(result)) if result.any() => {
                        outcome.success += 1;
                    }
                    Ok(EnrichmentOutcome::Applied(_)) => outcome.failed += 1,
                    Ok(EnrichmentOutcome::Skipped(_)) => outcome.skipped += 1,
                    Err(err) => {
                        warn!(content_id, ?err, "batch enrichment item failed");
                        outcome.failed += 1;
                    }
                }
                if delay_secs > 0 && item_index + 1 < group.len() {
                    tokio::time::sleep(Duration::from_secs(delay_secs)).await;
                }
            }
            if delay_secs > 0 && group_index + 1 < groups.len() {
                tokio::time::sleep(Duration::from_secs(delay_secs * 2)).await;
            }
        }
        outcome
    }

    async fn generate_title(&self, record: &ContentRecord) -> Result<String, BackendError> {
        let template = non_empty(&self.cfg.prompts.title).unwrap_or(DEFAULT_TITLE_PROMPT);
        let prompt = fill_template(template, record);
        let response = self
            .backend
            .generate(TITLE_SYSTEM, &prompt, self.cfg.max_tokens)
            .await?;
        Ok(truncate_chars(strip_tags(&response).trim(), 100))
    }

    async fn generate_excerpt(&self, record: &ContentRecord) -> Result<String, BackendError> {
        let template = non_empty(&self.cfg.prompts.excerpt).unwrap_or(DEFAULT_EXCERPT_PROMPT);
        let prompt = format!("{}\n\n{}", template, format_record_for_prompt(record));
        let response = self
            .backend
            .generate(EXCERPT_SYSTEM, &prompt, self.cfg.max_tokens)
            .await?;
        Ok(truncate_chars(strip_tags(&response).trim(), 200))
    }

    async fn generate_body(&self, record: &ContentRecord) -> Result<String, BackendError> {
        let template = non_empty(&self.cfg.prompts.body).unwrap_or(DEFAULT_BODY_PROMPT);
        let prompt = format!(
            "{}\n\n{}\n\nHTMLタグ（h2, h3, p, ul, li, strong, table等）を使用して、読みやすく構造化された記事を作成してください。",
            template,
            format_record_for_prompt(record)
        );
        let response = self
            .backend
            .generate(BODY_SYSTEM, &prompt, self.cfg.body_max_tokens)
            .await?;
        Ok(sanitize_html(&response).trim().to_string())
    }

    /// Ask the backend to pick (or mint) a category. Known names are matched
    /// loosely; an unknown answer becomes a brand-new term. Failure falls
    /// back to the catch-all category.
    async fn categorize(&self, pool: &Pool, record: &ContentRecord) -> anyhow::Result<bool> {
        let known = db::term_names(pool, Taxonomy::Category).await?;
        let prompt = format!(
            "以下の補助金情報を分析し、最も適切なカテゴリを1つ選んでください。\n選択可能なカテゴリ: {}\n\n{}\n\n選択したカテゴリ名のみを回答してください。",
            known.join(", "),
            format_record_for_prompt(record)
        );

        let answer = match self
            .backend
            .generate(CATEGORY_SYSTEM, &prompt, self.cfg.max_tokens)
            .await
        {
            Ok(answer) => strip_tags(&answer).trim().to_string(),
            Err(err) => {
                warn!(?err, "category generation failed; using fallback");
                self.assign_category(pool, record.id, FALLBACK_CATEGORY)
                    .await?;
                return Ok(false);
            }
        };

        if answer.is_empty() {
            self.assign_category(pool, record.id, FALLBACK_CATEGORY)
                .await?;
            return Ok(false);
        }

        let matched = known
            .iter()
            .find(|name| {
                name.as_str() == answer || name.contains(&answer) || answer.contains(name.as_str())
            })
            .cloned()
            .unwrap_or(answer);
        self.assign_category(pool, record.id, &matched).await?;
        Ok(true)
    }

    async fn assign_category(&self, pool: &Pool, content_id: i64, name: &str) -> anyhow::Result<()> {
        let term_id = db::get_or_create_term(pool, Taxonomy::Category, name, "", None).await?;
        db::replace_term_assignments(pool, content_id, Taxonomy::Category, &[term_id]).await
    }

    /// Extract target prefectures. Records that already carry prefecture
    /// assignments keep them without a backend call; an unparseable answer
    /// defaults to the nationwide sentinel.
    async fn extract_region(&self, pool: &Pool, record: &ContentRecord) -> anyhow::Result<bool> {
        let existing = db::term_names_for_content(pool, record.id, Taxonomy::Prefecture).await?;
        if !existing.is_empty() {
            debug!(content_id = record.id, "prefectures already assigned");
            return Ok(false);
        }

        let canonical = taxonomy::canonical_prefectures();
        let prompt = format!(
            "以下の補助金情報から、対象となる都道府県を特定してください。\n複数の都道府県が対象の場合は、カンマ区切りで全て列挙してください。\n全国が対象の場合は「全国」と回答してください。\n都道府県リスト: {}\n\n{}\n\n都道府県名のみを回答してください。",
            canonical.join(", "),
            format_record_for_prompt(record)
        );

        let names: Vec<String> = match self
            .backend
            .generate(REGION_SYSTEM, &prompt, self.cfg.max_tokens)
            .await
        {
            Ok(answer) => answer
                .split([',', '、', '，'])
                .map(str::trim)
                .filter(|name| canonical.contains(name))
                .map(str::to_string)
                .collect(),
            Err(err) => {
                warn!(?err, "region generation failed; using fallback");
                Vec::new()
            }
        };

        let (names, applied) = if names.is_empty() {
            (vec![NATIONWIDE.to_string()], false)
        } else {
            (names, true)
        };

        let mut term_ids = Vec::with_capacity(names.len());
        for name in &names {
            term_ids.push(db::get_or_create_term(pool, Taxonomy::Prefecture, name, "", None).await?);
        }
        db::replace_term_assignments(pool, record.id, Taxonomy::Prefecture, &term_ids).await?;
        Ok(applied)
    }
}

fn non_empty(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

/// Substitute the named placeholders a template may carry.
pub fn fill_template(template: &str, record: &ContentRecord) -> String {
    let max_amount = if record.max_amount > 0 {
        format!("最大{}円", group_digits(record.max_amount))
    } else {
        String::new()
    };
    let deadline = record
        .deadline
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_default();

    template
        .replace("{grant_name}", &record.title)
        .replace("{organization}", &record.organization)
        .replace("{max_amount}", &max_amount)
        .replace("{target}", &record.target)
        .replace("{deadline}", &deadline)
}

/// Render the grant fields shared by the summary/body/classification prompts.
fn format_record_for_prompt(record: &ContentRecord) -> String {
    let mut out = String::from("補助金情報:\n");
    out.push_str(&format!("補助金名: {}\n", fallback(&record.title)));
    out.push_str(&format!("実施機関: {}\n", fallback(&record.organization)));
    out.push_str(&format!("目的: {}\n", fallback(&record.purpose)));
    out.push_str(&format!("対象者: {}\n", fallback(&record.target)));
    if record.max_amount > 0 {
        out.push_str(&format!("最大支援額: {}円\n", group_digits(record.max_amount)));
    }
    if record.min_amount > 0 {
        out.push_str(&format!("最小支援額: {}円\n", group_digits(record.min_amount)));
    }
    if !record.subsidy_rate.is_empty() {
        out.push_str(&format!("補助率: {}\n", record.subsidy_rate));
    }
    if let Some(deadline) = record.deadline {
        out.push_str(&format!("締切日: {}\n", deadline.format("%Y-%m-%d")));
    }
    if let Some(start) = record.application_start {
        out.push_str(&format!("申請開始日: {}\n", start.format("%Y-%m-%d")));
    }
    out
}

fn fallback(s: &str) -> &str {
    if s.trim().is_empty() {
        "N/A"
    } else {
        s
    }
}

fn group_digits(amount: i64) -> String {
    let digits = amount.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    grouped
}

static ANY_TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").expect("valid tag regex"));
static BLOCKED_CONTENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(script|style)\b[^>]*>.*?</(script|style)>").expect("valid block regex")
});
static TAG_PARTS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^<\s*(/?)\s*([a-zA-Z][a-zA-Z0-9]*)([^>]*)>$").expect("valid parts regex")
});
static CLASS_ATTR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"class\s*=\s*["']([^"'<>]*)["']"#).expect("valid class regex"));

const ALLOWED_TAGS: &[&str] = &[
    "h2", "h3", "h4", "p", "ul", "ol", "li", "strong", "em", "br", "table", "thead", "tbody",
    "tr", "th", "td", "div", "span",
];
const CLASS_ALLOWED_TAGS: &[&str] = &["table", "div", "span"];

/// Remove all markup, collapsing the text content.
pub fn strip_tags(input: &str) -> String {
    ANY_TAG_RE.replace_all(input, "").into_owned()
}

/// Cap a string at `max` characters (not bytes).
pub fn truncate_chars(input: &str, max: usize) -> String {
    input.chars().take(max).collect()
}

/// Allow-list HTML sanitizer for generated article bodies. Unknown tags are
/// dropped while their text content survives; attributes are stripped except
/// `class` on the tags that may carry one.
pub fn sanitize_html(input: &str) -> String {
    let without_blocked = BLOCKED_CONTENT_RE.replace_all(input, "");
    ANY_TAG_RE
        .replace_all(&without_blocked, |caps: &regex::Captures<'_>| {
            rewrite_tag(&caps[0])
        })
        .into_owned()
}

fn rewrite_tag(tag: &str) -> String {
    let Some(parts) = TAG_PARTS_RE.captures(tag) else {
        return String::new();
    };
    let closing = &parts[1] == "/";
    let name = parts[2].to_ascii_lowercase();
    if !ALLOWED_TAGS.contains(&name.as_str()) {
        return String::new();
    }
    if closing {
        return format!("</{name}>");
    }
    if CLASS_ALLOWED_TAGS.contains(&name.as_str()) {
        if let Some(class) = CLASS_ATTR_RE.captures(&parts[3]) {
            return format!(r#"<{name} class="{}">"#, &class[1]);
        }
    }
    format!("<{name}>")
}
