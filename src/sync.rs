//! Sync engine: fetch → match-existing → create/update → enrich → tag → log.
//!
//! One logical thread of control per run. Batches are processed strictly
//! sequentially with a pause in between, and at most one run may be active
//! per deployment (enforced through a named lock row in the store).

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{info, instrument, warn};

use crate::config;
use crate::db::{self, ContentFields, Pool, StoreStatistics};
use crate::enrich::{Enricher, EnrichmentOutcome};
use crate::jgrants::{SearchQuery, SourceError, SubsidySource};
use crate::model::{ContentStatus, Grant, GrantStatus, RunStats, RunStatus, SyncRun, Taxonomy};
use crate::taxonomy;

pub const SYNC_LOCK_NAME: &str = "sync";

/// A crashed run may leave the lock row behind; locks older than this are
/// treated as abandoned.
const LOCK_STALE_AFTER_HOURS: i64 = 2;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("a sync run is already in progress")]
    AlreadyRunning,
    #[error("subsidy {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Caller-supplied overrides, merged onto the persisted defaults once per
/// run. Downstream code only ever sees the resolved [`RunParams`].
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub keyword: Option<String>,
    pub sort: Option<String>,
    pub order: Option<String>,
    pub acceptance: Option<String>,
    pub max_import_count: Option<usize>,
    pub batch_size: Option<usize>,
    pub batch_delay_seconds: Option<u64>,
    pub generate_ai: Option<bool>,
    pub update_existing: Option<bool>,
    pub auto_publish: Option<bool>,
    pub force_body_update: bool,
    pub use_purpose: Option<String>,
    pub industry: Option<String>,
    pub target_number_of_employees: Option<String>,
    pub target_area_search: Option<String>,
}

/// Effective parameters for one run.
#[derive(Debug, Clone)]
pub struct RunParams {
    pub query: SearchQuery,
    pub max_import_count: usize,
    pub batch_size: usize,
    pub batch_delay: Duration,
    pub generate_ai: bool,
    pub update_existing: bool,
    pub auto_publish: bool,
    pub force_body_update: bool,
}

impl RunParams {
    pub fn resolve(cfg: &config::Config, overrides: &RunOverrides) -> Self {
        let query = SearchQuery {
            keyword: overrides
                .keyword
                .clone()
                .unwrap_or_else(|| cfg.sync.keyword.clone()),
            sort: overrides.sort.clone().unwrap_or_else(|| cfg.sync.sort.clone()),
            order: overrides
                .order
                .clone()
                .unwrap_or_else(|| cfg.sync.order.clone()),
            acceptance: overrides
                .acceptance
                .clone()
                .unwrap_or_else(|| cfg.sync.acceptance.clone()),
            use_purpose: overrides.use_purpose.clone(),
            industry: overrides.industry.clone(),
            target_number_of_employees: overrides.target_number_of_employees.clone(),
            target_area_search: overrides.target_area_search.clone(),
        };
        Self {
            query,
            max_import_count: overrides
                .max_import_count
                .unwrap_or(cfg.sync.max_import_count),
            batch_size: overrides.batch_size.unwrap_or(cfg.sync.batch_size).max(1),
            batch_delay: Duration::from_secs(
                overrides
                    .batch_delay_seconds
                    .unwrap_or(cfg.sync.batch_delay_seconds),
            ),
            generate_ai: overrides.generate_ai.unwrap_or(cfg.ai.enabled),
            update_existing: overrides.update_existing.unwrap_or(cfg.sync.update_existing),
            auto_publish: overrides.auto_publish.unwrap_or(cfg.sync.auto_publish),
            force_body_update: overrides.force_body_update,
        }
    }
}

/// What happened to one grant during processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Created(i64),
    Updated(i64),
    Skipped(i64),
}

impl ItemOutcome {
    pub fn content_id(&self) -> i64 {
        match self {
            ItemOutcome::Created(id) | ItemOutcome::Updated(id) | ItemOutcome::Skipped(id) => *id,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemOutcome::Created(_) => "created",
            ItemOutcome::Updated(_) => "updated",
            ItemOutcome::Skipped(_) => "skipped",
        }
    }
}

pub struct SyncEngine {
    pool: Pool,
    source: Arc<dyn SubsidySource>,
    enricher: Option<Arc<Enricher>>,
    config: config::Config,
}

impl SyncEngine {
    pub fn new(
        pool: Pool,
        source: Arc<dyn SubsidySource>,
        enricher: Option<Arc<Enricher>>,
        config: config::Config,
    ) -> Self {
        Self {
            pool,
            source,
            enricher,
            config,
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Run one full sync. Exactly one ledger entry transitions from
    /// in-progress to a terminal state, whatever happens after the lock is
    /// taken.
    #[instrument(skip_all)]
    pub async fn run_sync(&self, overrides: &RunOverrides) -> Result<RunStats, SyncError> {
        let params = RunParams::resolve(&self.config, overrides);
        params.query.validate()?;

        let acquired = db::try_acquire_sync_lock(
            &self.pool,
            SYNC_LOCK_NAME,
            ChronoDuration::hours(LOCK_STALE_AFTER_HOURS),
        )
        .await?;
        if !acquired {
            return Err(SyncError::AlreadyRunning);
        }

        let outcome = self.run_locked(&params).await;
        if let Err(err) = db::release_sync_lock(&self.pool, SYNC_LOCK_NAME).await {
            warn!(?err, "failed to release sync lock");
        }
        outcome
    }

    async fn run_locked(&self, params: &RunParams) -> Result<RunStats, SyncError> {
        let run_id = db::start_sync_run(&self.pool).await?;

        let mut grants = match self.source.search(&params.query).await {
            Ok(grants) => grants,
            Err(err) => {
                db::complete_sync_run(
                    &self.pool,
                    run_id,
                    &RunStats::default(),
                    RunStatus::Error,
                    Some(&err.to_string()),
                )
                .await?;
                return Err(err.into());
            }
        };

        // The API has no server-side cap; truncate here, preserving the
        // source order. `fetched` reports the processed count.
        grants.truncate(params.max_import_count);
        let mut stats = RunStats {
            fetched: grants.len() as i64,
            ..Default::default()
        };

        let chunks: Vec<&[Grant]> = grants.chunks(params.batch_size).collect();
        for (index, chunk) in chunks.iter().enumerate() {
            for grant in *chunk {
                match self.process_grant(grant, params).await {
                    Ok((outcome, ai_generated)) => {
                        match outcome {
                            ItemOutcome::Created(_) => stats.created += 1,
                            ItemOutcome::Updated(_) => stats.updated += 1,
                            ItemOutcome::Skipped(_) => {}
                        }
                        if ai_generated {
                            stats.ai_generated += 1;
                        }
                    }
                    Err(err) => {
                        warn!(external_id = %grant.external_id, ?err, "failed to process grant");
                        stats.errors += 1;
                    }
                }
            }
            if index + 1 < chunks.len() && !params.batch_delay.is_zero() {
                sleep(params.batch_delay).await;
            }
        }

        db::complete_sync_run(&self.pool, run_id, &stats, RunStatus::Success, None).await?;
        info!(
            fetched = stats.fetched,
            created = stats.created,
            updated = stats.updated,
            errors = stats.errors,
            ai_generated = stats.ai_generated,
            "sync run finished"
        );
        Ok(stats)
    }

    /// Import a single subsidy by its external id, outside of any batch.
    /// Identity matching makes this safe to repeat.
    #[instrument(skip_all)]
    pub async fn import_by_id(
        &self,
        external_id: &str,
        overrides: &RunOverrides,
    ) -> Result<ItemOutcome, SyncError> {
        let params = RunParams::resolve(&self.config, overrides);
        let grant = self
            .source
            .get_by_id(external_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(external_id.to_string()))?;
        let (outcome, _) = self.process_grant(&grant, &params).await?;
        Ok(outcome)
    }

    /// Apply one grant to the store and return what happened plus whether
    /// any enrichment step landed.
    async fn process_grant(
        &self,
        grant: &Grant,
        params: &RunParams,
    ) -> anyhow::Result<(ItemOutcome, bool)> {
        let existing = db::find_content_by_external_id(&self.pool, &grant.external_id).await?;
        let fields = content_fields_from(grant);

        let outcome = match existing {
            None => {
                let status = if params.auto_publish {
                    ContentStatus::Published
                } else {
                    ContentStatus::Draft
                };
                let id =
                    db::insert_content(&self.pool, &fields, status, &grant.description).await?;
                self.assign_taxonomies(id, grant).await?;
                ItemOutcome::Created(id)
            }
            Some(record) if params.update_existing => {
                let body = (record.body.trim().is_empty() || params.force_body_update)
                    .then_some(grant.description.as_str());
                db::update_content(&self.pool, record.id, &fields, body).await?;
                if grant.status == GrantStatus::Closed {
                    db::expire_content(&self.pool, record.id).await?;
                }
                self.assign_taxonomies(record.id, grant).await?;
                ItemOutcome::Updated(record.id)
            }
            Some(record) => ItemOutcome::Skipped(record.id),
        };

        let mut ai_generated = false;
        if params.generate_ai && !matches!(outcome, ItemOutcome::Skipped(_)) {
            if let Some(enricher) = &self.enricher {
                match enricher.enrich(&self.pool, outcome.content_id()).await {
                    Ok(EnrichmentOutcome::Applied(result)) if result.any() => ai_generated = true,
                    Ok(_) => {}
                    // Enrichment trouble never fails the item.
                    Err(err) => {
                        warn!(external_id = %grant.external_id, ?err, "enrichment failed")
                    }
                }
            }
        }

        Ok((outcome, ai_generated))
    }

    /// Category, prefectures, and industry targets are get-or-create; the
    /// amount-range set is closed, so an unknown bucket is never minted.
    async fn assign_taxonomies(&self, content_id: i64, grant: &Grant) -> anyhow::Result<()> {
        if !grant.category.trim().is_empty() {
            let term_id =
                db::get_or_create_term(&self.pool, Taxonomy::Category, grant.category.trim(), "", None)
                    .await?;
            db::replace_term_assignments(&self.pool, content_id, Taxonomy::Category, &[term_id])
                .await?;
        }

        if !grant.prefectures.is_empty() {
            let mut term_ids = Vec::with_capacity(grant.prefectures.len());
            for name in &grant.prefectures {
                term_ids.push(
                    db::get_or_create_term(&self.pool, Taxonomy::Prefecture, name, "", None).await?,
                );
            }
            db::replace_term_assignments(&self.pool, content_id, Taxonomy::Prefecture, &term_ids)
                .await?;
        }

        let industries: Vec<&str> = grant
            .industry
            .split('、')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if !industries.is_empty() {
            let mut term_ids = Vec::with_capacity(industries.len());
            for industry in industries {
                term_ids.push(
                    db::get_or_create_term(&self.pool, Taxonomy::Target, industry, "", None).await?,
                );
            }
            db::replace_term_assignments(&self.pool, content_id, Taxonomy::Target, &term_ids)
                .await?;
        }

        if let Some(range) = taxonomy::amount_range_name(grant.max_amount) {
            if let Some(term_id) = db::find_term(&self.pool, Taxonomy::AmountRange, range).await? {
                db::replace_term_assignments(
                    &self.pool,
                    content_id,
                    Taxonomy::AmountRange,
                    &[term_id],
                )
                .await?;
            }
        }

        Ok(())
    }

    /// Expire published records whose deadline has passed. Pure local-store
    /// operation; runs independently of sync.
    #[instrument(skip_all)]
    pub async fn check_deadlines(&self) -> anyhow::Result<usize> {
        let ids = db::published_active_past_deadline(&self.pool, Utc::now()).await?;
        for id in &ids {
            db::expire_content(&self.pool, *id).await?;
        }
        if !ids.is_empty() {
            info!(expired = ids.len(), "deadline sweep expired records");
        }
        Ok(ids.len())
    }

    /// Delete records that have sat in `expired` for longer than `days`.
    /// Irreversible; the count is logged but no ledger entry is written.
    #[instrument(skip_all)]
    pub async fn cleanup_expired(&self, days: i64) -> anyhow::Result<usize> {
        let cutoff = Utc::now() - ChronoDuration::days(days);
        let ids = db::expired_content_older_than(&self.pool, cutoff).await?;
        for id in &ids {
            db::delete_content(&self.pool, *id).await?;
        }
        if !ids.is_empty() {
            info!(deleted = ids.len(), days, "retention sweep removed old records");
        }
        Ok(ids.len())
    }

    /// Ledger history, most recent first. Total: an empty store yields an
    /// empty list.
    pub async fn history(&self, limit: i64) -> anyhow::Result<Vec<SyncRun>> {
        db::sync_history(&self.pool, limit).await
    }

    pub async fn statistics(&self) -> anyhow::Result<StoreStatistics> {
        db::store_statistics(&self.pool).await
    }
}

fn content_fields_from(grant: &Grant) -> ContentFields {
    ContentFields {
        external_id: grant.external_id.clone(),
        title: grant.title.clone(),
        description: grant.description.clone(),
        organization: grant.organization.clone(),
        purpose: grant.purpose.clone(),
        target: grant.target.clone(),
        max_amount: grant.max_amount,
        min_amount: grant.min_amount,
        subsidy_rate: grant.subsidy_rate.clone(),
        industry: grant.industry.clone(),
        target_area: grant.target_area.clone(),
        target_employees: grant.target_employee_band.clone(),
        official_url: grant.official_url.clone(),
        grant_status: grant.status.as_str().to_string(),
        application_start: grant.application_start,
        deadline: grant.deadline,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> config::Config {
        serde_yaml::from_str(config::example()).unwrap()
    }

    #[test]
    fn resolve_uses_config_defaults() {
        let cfg = sample_config();
        let params = RunParams::resolve(&cfg, &RunOverrides::default());
        assert_eq!(params.query.keyword, "補助金");
        assert_eq!(params.max_import_count, 50);
        assert_eq!(params.batch_size, 10);
        assert!(params.generate_ai);
        assert!(params.update_existing);
        assert!(!params.auto_publish);
    }

    #[test]
    fn resolve_applies_overrides() {
        let cfg = sample_config();
        let overrides = RunOverrides {
            keyword: Some("ものづくり".into()),
            max_import_count: Some(5),
            batch_size: Some(0),
            generate_ai: Some(false),
            auto_publish: Some(true),
            industry: Some("製造業".into()),
            ..Default::default()
        };
        let params = RunParams::resolve(&cfg, &overrides);
        assert_eq!(params.query.keyword, "ものづくり");
        assert_eq!(params.max_import_count, 5);
        // A nonsensical zero batch size is clamped rather than dividing by zero.
        assert_eq!(params.batch_size, 1);
        assert!(!params.generate_ai);
        assert!(params.auto_publish);
        assert_eq!(params.query.industry.as_deref(), Some("製造業"));
    }

    #[test]
    fn item_outcome_accessors() {
        assert_eq!(ItemOutcome::Created(3).content_id(), 3);
        assert_eq!(ItemOutcome::Updated(4).as_str(), "updated");
        assert_eq!(ItemOutcome::Skipped(5).as_str(), "skipped");
    }
}
