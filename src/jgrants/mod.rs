//! Client for the public jGrants subsidy search API, plus the normalization
//! that turns its heterogeneous payloads into canonical [`Grant`] records.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::model::{Grant, GrantStatus};
use crate::taxonomy::{self, FALLBACK_CATEGORY, NATIONWIDE};

pub mod model;

use model::{RawSubsidy, SubsidiesResponse};

#[derive(Debug, Error)]
pub enum SourceError {
    /// Malformed caller input; rejected before any network activity.
    #[error("invalid query: {0}")]
    InvalidQuery(&'static str),
    /// Transport failure, non-2xx response, or undecodable payload.
    #[error("subsidy source unavailable: {0}")]
    Unavailable(String),
}

/// Search parameters accepted by the subsidies endpoint.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub keyword: String,
    pub sort: String,
    pub order: String,
    /// "1" restricts to currently-accepting subsidies, "0" returns all.
    pub acceptance: String,
    pub use_purpose: Option<String>,
    pub industry: Option<String>,
    pub target_number_of_employees: Option<String>,
    pub target_area_search: Option<String>,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            keyword: "補助金".to_string(),
            sort: "created_date".to_string(),
            order: "DESC".to_string(),
            acceptance: "1".to_string(),
            use_purpose: None,
            industry: None,
            target_number_of_employees: None,
            target_area_search: None,
        }
    }
}

impl SearchQuery {
    pub fn validate(&self) -> Result<(), SourceError> {
        if self.keyword.chars().count() < 2 {
            return Err(SourceError::InvalidQuery(
                "keyword must be at least 2 characters",
            ));
        }
        Ok(())
    }

    fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("keyword", self.keyword.clone()),
            ("sort", self.sort.clone()),
            ("order", self.order.clone()),
            ("acceptance", self.acceptance.clone()),
        ];
        if let Some(v) = self.use_purpose.as_ref().filter(|v| !v.is_empty()) {
            pairs.push(("use_purpose", v.clone()));
        }
        if let Some(v) = self.industry.as_ref().filter(|v| !v.is_empty()) {
            pairs.push(("industry", v.clone()));
        }
        if let Some(v) = self
            .target_number_of_employees
            .as_ref()
            .filter(|v| !v.is_empty())
        {
            pairs.push(("target_number_of_employees", v.clone()));
        }
        if let Some(v) = self.target_area_search.as_ref().filter(|v| !v.is_empty()) {
            pairs.push(("target_area_search", v.clone()));
        }
        pairs
    }
}

/// Abstraction over the subsidy source so the sync engine can be driven by
/// fakes in tests.
#[async_trait]
pub trait SubsidySource: Send + Sync {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<Grant>, SourceError>;
    async fn get_by_id(&self, external_id: &str) -> Result<Option<Grant>, SourceError>;
}

#[derive(Clone)]
pub struct JGrantsClient {
    http: Client,
    base_url: Url,
}

impl fmt::Debug for JGrantsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JGrantsClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl JGrantsClient {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let base_url = Url::parse(base_url).context("invalid source base URL")?;
        let http = Client::builder()
            .user_agent("jgrants-sync/0.1")
            .timeout(timeout)
            .build()
            .context("building source HTTP client")?;
        Ok(Self { http, base_url })
    }

    pub fn build_search_request(&self, query: &SearchQuery) -> Result<reqwest::Request, SourceError> {
        let endpoint = self
            .base_url
            .join("subsidies")
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;
        self.http
            .get(endpoint)
            .query(&query.query_pairs())
            .header("Accept", "application/json")
            .build()
            .map_err(|e| SourceError::Unavailable(e.to_string()))
    }

    async fn execute(&self, request: reqwest::Request) -> Result<SubsidiesResponse, SourceError> {
        let res = self
            .http
            .execute(request)
            .await
            .map_err(|e| SourceError::Unavailable(format!("request failed: {e}")))?;

        if res.status() == StatusCode::NOT_FOUND {
            return Ok(SubsidiesResponse::default());
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            warn!(%status, "subsidy API error: {}", body);
            return Err(SourceError::Unavailable(format!(
                "source returned status {status}"
            )));
        }

        let body = res
            .text()
            .await
            .map_err(|e| SourceError::Unavailable(format!("reading response: {e}")))?;
        serde_json::from_str(&body)
            .map_err(|e| SourceError::Unavailable(format!("invalid JSON response: {e}")))
    }

    /// Issue a minimal search to verify the source is reachable. Returns the
    /// number of records the probe could see.
    pub async fn test_connection(&self) -> Result<usize, SourceError> {
        let query = SearchQuery::default();
        let grants = self.search_inner(&query).await?;
        Ok(grants.len())
    }

    async fn search_inner(&self, query: &SearchQuery) -> Result<Vec<Grant>, SourceError> {
        query.validate()?;
        let request = self.build_search_request(query)?;
        let response = self.execute(request).await?;
        let now = Utc::now();
        Ok(response
            .result
            .into_iter()
            .filter_map(|raw| normalize(raw, now))
            .collect())
    }
}

#[async_trait]
impl SubsidySource for JGrantsClient {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<Grant>, SourceError> {
        self.search_inner(query).await
    }

    async fn get_by_id(&self, external_id: &str) -> Result<Option<Grant>, SourceError> {
        if external_id.trim().is_empty() {
            return Err(SourceError::InvalidQuery("external id must be non-empty"));
        }
        let endpoint = self
            .base_url
            .join(&format!("subsidies/id/{external_id}"))
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;
        let request = self
            .http
            .get(endpoint)
            .header("Accept", "application/json")
            .build()
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;
        let response = self.execute(request).await?;
        let now = Utc::now();
        Ok(response
            .result
            .into_iter()
            .find_map(|raw| normalize(raw, now)))
    }
}

/// Ordered keyword→category fallback table. First match wins; consulted only
/// when the source carries no explicit category. The AI categorization path,
/// when enabled, may override the result later.
const KEYWORD_CATEGORIES: &[(&str, &str)] = &[
    ("デジタル", "IT・デジタル化"),
    ("DX", "IT・デジタル化"),
    ("IT", "IT・デジタル化"),
    ("システム", "IT・デジタル化"),
    ("設備", "設備投資・機械導入"),
    ("機械", "設備投資・機械導入"),
    ("研究開発", "研究開発・技術開発"),
    ("技術開発", "研究開発・技術開発"),
    ("研究", "研究開発・技術開発"),
    ("人材", "人材育成・雇用"),
    ("雇用", "人材育成・雇用"),
    ("採用", "人材育成・雇用"),
    ("創業", "創業・起業"),
    ("起業", "創業・起業"),
    ("スタートアップ", "創業・起業"),
    ("海外", "海外展開・輸出"),
    ("輸出", "海外展開・輸出"),
    ("省エネ", "環境・エネルギー"),
    ("脱炭素", "環境・エネルギー"),
    ("環境", "環境・エネルギー"),
    ("エネルギー", "環境・エネルギー"),
    ("観光", "地域振興・観光"),
    ("地域", "地域振興・観光"),
    ("農業", "農林水産業"),
    ("林業", "農林水産業"),
    ("漁業", "農林水産業"),
    ("水産", "農林水産業"),
    ("医療", "医療・福祉・介護"),
    ("福祉", "医療・福祉・介護"),
    ("介護", "医療・福祉・介護"),
    ("災害", "災害対策・BCP"),
    ("防災", "災害対策・BCP"),
    ("BCP", "災害対策・BCP"),
];

/// Map a raw subsidy into the canonical shape. Records without a stable id
/// cannot be matched against the store and are dropped.
pub fn normalize(raw: RawSubsidy, now: DateTime<Utc>) -> Option<Grant> {
    let external_id = raw.id.trim().to_string();
    if external_id.is_empty() {
        return None;
    }

    let title = raw
        .title
        .or(raw.name)
        .unwrap_or_default()
        .trim()
        .to_string();
    let description = raw.detail.unwrap_or_default();
    let purpose = raw.use_purpose.unwrap_or_default();
    let application_start = raw
        .acceptance_start_datetime
        .as_deref()
        .and_then(normalize_datetime);
    let deadline = raw
        .acceptance_end_datetime
        .as_deref()
        .and_then(normalize_datetime);

    let category = match raw.category.filter(|c| !c.trim().is_empty()) {
        Some(c) => c.trim().to_string(),
        None => infer_category(&format!("{title} {purpose} {description}")).to_string(),
    };

    let target_area = raw.target_area_search.unwrap_or_default();

    Some(Grant {
        external_id,
        title,
        description,
        organization: raw.organization.unwrap_or_default(),
        purpose,
        target: raw.target_search.unwrap_or_default(),
        max_amount: raw.subsidy_max_limit.as_ref().map_or(0, amount_value),
        min_amount: raw.subsidy_min_limit.as_ref().map_or(0, amount_value),
        subsidy_rate: raw.subsidy_rate.unwrap_or_default(),
        application_start,
        deadline,
        status: derive_status(now, application_start, deadline),
        category,
        prefectures: expand_prefectures(&target_area),
        industry: raw.industry.unwrap_or_default(),
        target_area,
        target_employee_band: raw.target_number_of_employees.unwrap_or_default(),
        official_url: raw.front_subsidy_detail_page_url.unwrap_or_default(),
    })
}

/// Derive the recruitment status from the application window. A passed
/// deadline wins over a not-yet-open start; no window means active.
pub fn derive_status(
    now: DateTime<Utc>,
    application_start: Option<DateTime<Utc>>,
    deadline: Option<DateTime<Utc>>,
) -> GrantStatus {
    if let Some(deadline) = deadline {
        if deadline < now {
            return GrantStatus::Closed;
        }
    }
    if let Some(start) = application_start {
        if start > now {
            return GrantStatus::Upcoming;
        }
    }
    GrantStatus::Active
}

static AMOUNT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([0-9][0-9,]*(?:\.[0-9]+)?)\s*(億|万|千)?").expect("valid amount regex")
});

/// Parse an amount string, with or without a Japanese unit word, into yen.
/// `"1,000万円"` → 10_000_000; bare digits pass through; anything
/// unrecognized is 0 (unknown).
pub fn parse_amount(input: &str) -> i64 {
    let Some(caps) = AMOUNT_RE.captures(input) else {
        return 0;
    };
    let digits = caps[1].replace(',', "");
    let Ok(base) = digits.parse::<f64>() else {
        return 0;
    };
    let multiplier = match caps.get(2).map(|m| m.as_str()) {
        Some("億") => 100_000_000.0,
        Some("万") => 10_000.0,
        Some("千") => 1_000.0,
        _ => 1.0,
    };
    let amount = base * multiplier;
    if amount.is_finite() && amount > 0.0 {
        amount.round() as i64
    } else {
        0
    }
}

fn amount_value(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.round() as i64))
            .unwrap_or(0)
            .max(0),
        Value::String(s) => parse_amount(s),
        _ => 0,
    }
}

static JP_DATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{4})年(\d{1,2})月(\d{1,2})日").expect("valid date regex"));

/// Normalize the source's mixed timestamp formats to UTC. Accepts RFC 3339,
/// naive datetimes, and the date-only / Japanese-text forms seen in the
/// wild; date-only values become midnight UTC.
pub fn normalize_datetime(input: &str) -> Option<DateTime<Utc>> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(input, fmt) {
            return Some(naive.and_utc());
        }
    }
    for fmt in ["%Y-%m-%d", "%Y/%m/%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(input, fmt) {
            return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
        }
    }
    if let Some(caps) = JP_DATE_RE.captures(input) {
        let year = caps[1].parse().ok()?;
        let month = caps[2].parse().ok()?;
        let day = caps[3].parse().ok()?;
        return NaiveDate::from_ymd_opt(year, month, day)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|naive| naive.and_utc());
    }
    None
}

/// Expand a source area string into a canonical prefecture set. Named
/// regions expand to their member prefectures; an empty or unrecognized
/// area defaults to the nationwide sentinel.
pub fn expand_prefectures(target_area: &str) -> BTreeSet<String> {
    let mut prefectures = BTreeSet::new();
    let canonical: BTreeSet<&str> = taxonomy::canonical_prefectures().into_iter().collect();

    for token in target_area.split(['、', '，', ',', '／', '/']) {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        if token == NATIONWIDE {
            prefectures.insert(NATIONWIDE.to_string());
            continue;
        }
        if canonical.contains(token) {
            prefectures.insert(token.to_string());
            continue;
        }
        let region = token.strip_suffix("地方").unwrap_or(token);
        if let Some(members) = taxonomy::region_members(region) {
            prefectures.extend(members.iter().map(|(name, _)| name.to_string()));
        }
    }

    if prefectures.is_empty() {
        prefectures.insert(NATIONWIDE.to_string());
    }
    prefectures
}

/// First matching keyword decides the category; table order is significant.
pub fn infer_category(text: &str) -> &'static str {
    KEYWORD_CATEGORIES
        .iter()
        .find(|(keyword, _)| text.contains(keyword))
        .map(|(_, category)| *category)
        .unwrap_or(FALLBACK_CATEGORY)
}
