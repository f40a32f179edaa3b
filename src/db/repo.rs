use super::model::{ContentFields, ContentRecord, StoreStatistics};
use crate::model::{ContentStatus, RunStats, RunStatus, SyncRun, Taxonomy};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, SqlitePool};
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the
/// parent directory exists. Leaves in-memory URLs untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match path_part.strip_prefix("~/") {
        Some(rest) => match std::env::var("HOME") {
            Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
            Err(_) => path_part.to_string(),
        },
        None => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = format!("sqlite://{expanded_path}");
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

const CONTENT_COLUMNS: &str = "id, external_id, status, title, body, excerpt, description, \
     organization, purpose, target, max_amount, min_amount, subsidy_rate, industry, \
     target_area, target_employees, official_url, grant_status, application_start, \
     deadline, ai_generated_at, last_synced_at, updated_at";

#[instrument(skip_all)]
pub async fn find_content_by_external_id(
    pool: &Pool,
    external_id: &str,
) -> Result<Option<ContentRecord>> {
    if external_id.trim().is_empty() {
        return Ok(None);
    }
    let record = sqlx::query_as::<_, ContentRecord>(&format!(
        "SELECT {CONTENT_COLUMNS} FROM contents WHERE external_id = ?"
    ))
    .bind(external_id)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

#[instrument(skip_all)]
pub async fn get_content(pool: &Pool, id: i64) -> Result<ContentRecord> {
    let record = sqlx::query_as::<_, ContentRecord>(&format!(
        "SELECT {CONTENT_COLUMNS} FROM contents WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    record.ok_or_else(|| anyhow!("content {} not found", id))
}

#[instrument(skip_all)]
pub async fn insert_content(
    pool: &Pool,
    fields: &ContentFields,
    status: ContentStatus,
    body: &str,
) -> Result<i64> {
    let now = Utc::now();
    let rec = sqlx::query(
        "INSERT INTO contents (external_id, status, title, body, description, organization, \
         purpose, target, max_amount, min_amount, subsidy_rate, industry, target_area, \
         target_employees, official_url, grant_status, application_start, deadline, \
         last_synced_at, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(&fields.external_id)
    .bind(status.as_str())
    .bind(&fields.title)
    .bind(body)
    .bind(&fields.description)
    .bind(&fields.organization)
    .bind(&fields.purpose)
    .bind(&fields.target)
    .bind(fields.max_amount)
    .bind(fields.min_amount)
    .bind(&fields.subsidy_rate)
    .bind(&fields.industry)
    .bind(&fields.target_area)
    .bind(&fields.target_employees)
    .bind(&fields.official_url)
    .bind(&fields.grant_status)
    .bind(fields.application_start)
    .bind(fields.deadline)
    .bind(now)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await?;
    Ok(rec.get::<i64, _>("id"))
}

/// Refresh title and metadata for an existing record. The body is only
/// rewritten when `body` is Some (empty body or forced update upstream).
#[instrument(skip_all)]
pub async fn update_content(
    pool: &Pool,
    id: i64,
    fields: &ContentFields,
    body: Option<&str>,
) -> Result<()> {
    let now = Utc::now();
    sqlx::query(
        "UPDATE contents SET title = ?, description = ?, organization = ?, purpose = ?, \
         target = ?, max_amount = ?, min_amount = ?, subsidy_rate = ?, industry = ?, \
         target_area = ?, target_employees = ?, official_url = ?, grant_status = ?, \
         application_start = ?, deadline = ?, last_synced_at = ?, updated_at = ? \
         WHERE id = ?",
    )
    .bind(&fields.title)
    .bind(&fields.description)
    .bind(&fields.organization)
    .bind(&fields.purpose)
    .bind(&fields.target)
    .bind(fields.max_amount)
    .bind(fields.min_amount)
    .bind(&fields.subsidy_rate)
    .bind(&fields.industry)
    .bind(&fields.target_area)
    .bind(&fields.target_employees)
    .bind(&fields.official_url)
    .bind(&fields.grant_status)
    .bind(fields.application_start)
    .bind(fields.deadline)
    .bind(now)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;

    if let Some(body) = body {
        sqlx::query("UPDATE contents SET body = ? WHERE id = ?")
            .bind(body)
            .bind(id)
            .execute(pool)
            .await?;
    }
    Ok(())
}

#[instrument(skip_all)]
pub async fn set_content_status(pool: &Pool, id: i64, status: ContentStatus) -> Result<()> {
    sqlx::query("UPDATE contents SET status = ?, updated_at = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Transition a record whose deadline has passed: content expires and the
/// grant status is pinned to closed.
#[instrument(skip_all)]
pub async fn expire_content(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE contents SET status = 'expired', grant_status = 'closed', updated_at = ? \
         WHERE id = ?",
    )
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn update_generated_title(pool: &Pool, id: i64, title: &str) -> Result<()> {
    sqlx::query("UPDATE contents SET title = ?, updated_at = ? WHERE id = ?")
        .bind(title)
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn update_generated_excerpt(pool: &Pool, id: i64, excerpt: &str) -> Result<()> {
    sqlx::query("UPDATE contents SET excerpt = ?, updated_at = ? WHERE id = ?")
        .bind(excerpt)
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn update_generated_body(pool: &Pool, id: i64, body: &str) -> Result<()> {
    sqlx::query("UPDATE contents SET body = ?, updated_at = ? WHERE id = ?")
        .bind(body)
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn mark_ai_generated(pool: &Pool, id: i64, at: DateTime<Utc>) -> Result<()> {
    sqlx::query("UPDATE contents SET ai_generated_at = ? WHERE id = ?")
        .bind(at)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn delete_content(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM content_terms WHERE content_id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    sqlx::query("DELETE FROM contents WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Published records still marked active whose deadline has passed.
#[instrument(skip_all)]
pub async fn published_active_past_deadline(pool: &Pool, now: DateTime<Utc>) -> Result<Vec<i64>> {
    let ids = sqlx::query_scalar::<_, i64>(
        "SELECT id FROM contents WHERE status = 'published' AND grant_status = 'active' \
         AND deadline IS NOT NULL AND datetime(deadline) < datetime(?) ORDER BY id",
    )
    .bind(now)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

/// Expired records untouched since the cutoff; candidates for deletion.
#[instrument(skip_all)]
pub async fn expired_content_older_than(pool: &Pool, cutoff: DateTime<Utc>) -> Result<Vec<i64>> {
    let ids = sqlx::query_scalar::<_, i64>(
        "SELECT id FROM contents WHERE status = 'expired' \
         AND datetime(updated_at) < datetime(?) ORDER BY id",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

#[instrument(skip_all)]
pub async fn get_or_create_term(
    pool: &Pool,
    taxonomy: Taxonomy,
    name: &str,
    slug: &str,
    parent_id: Option<i64>,
) -> Result<i64> {
    if let Some(id) =
        sqlx::query_scalar::<_, i64>("SELECT id FROM terms WHERE taxonomy = ? AND name = ?")
            .bind(taxonomy.as_str())
            .bind(name)
            .fetch_optional(pool)
            .await?
    {
        return Ok(id);
    }

    let rec = sqlx::query(
        "INSERT INTO terms (taxonomy, name, slug, parent_id) VALUES (?, ?, ?, ?) RETURNING id",
    )
    .bind(taxonomy.as_str())
    .bind(name)
    .bind(slug)
    .bind(parent_id)
    .fetch_one(pool)
    .await?;
    Ok(rec.get::<i64, _>("id"))
}

#[instrument(skip_all)]
pub async fn find_term(pool: &Pool, taxonomy: Taxonomy, name: &str) -> Result<Option<i64>> {
    let id = sqlx::query_scalar::<_, i64>("SELECT id FROM terms WHERE taxonomy = ? AND name = ?")
        .bind(taxonomy.as_str())
        .bind(name)
        .fetch_optional(pool)
        .await?;
    Ok(id)
}

/// Replace the full assignment set for one taxonomy on one record.
#[instrument(skip_all)]
pub async fn replace_term_assignments(
    pool: &Pool,
    content_id: i64,
    taxonomy: Taxonomy,
    term_ids: &[i64],
) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM content_terms WHERE content_id = ? AND taxonomy = ?")
        .bind(content_id)
        .bind(taxonomy.as_str())
        .execute(&mut *tx)
        .await?;
    for term_id in term_ids {
        sqlx::query(
            "INSERT OR IGNORE INTO content_terms (content_id, term_id, taxonomy) VALUES (?, ?, ?)",
        )
        .bind(content_id)
        .bind(term_id)
        .bind(taxonomy.as_str())
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn term_names_for_content(
    pool: &Pool,
    content_id: i64,
    taxonomy: Taxonomy,
) -> Result<Vec<String>> {
    let names = sqlx::query_scalar::<_, String>(
        "SELECT t.name FROM terms t JOIN content_terms ct ON ct.term_id = t.id \
         WHERE ct.content_id = ? AND ct.taxonomy = ? ORDER BY t.name",
    )
    .bind(content_id)
    .bind(taxonomy.as_str())
    .fetch_all(pool)
    .await?;
    Ok(names)
}

#[instrument(skip_all)]
pub async fn term_names(pool: &Pool, taxonomy: Taxonomy) -> Result<Vec<String>> {
    let names =
        sqlx::query_scalar::<_, String>("SELECT name FROM terms WHERE taxonomy = ? ORDER BY id")
            .bind(taxonomy.as_str())
            .fetch_all(pool)
            .await?;
    Ok(names)
}

#[instrument(skip_all)]
pub async fn start_sync_run(pool: &Pool) -> Result<i64> {
    let rec = sqlx::query("INSERT INTO sync_runs (started_at, status) VALUES (?, ?) RETURNING id")
        .bind(Utc::now())
        .bind(RunStatus::InProgress.as_str())
        .fetch_one(pool)
        .await?;
    Ok(rec.get::<i64, _>("id"))
}

/// Close a ledger entry. Only an in-progress row can transition; a second
/// completion is a no-op, keeping terminal rows immutable.
#[instrument(skip_all)]
pub async fn complete_sync_run(
    pool: &Pool,
    run_id: i64,
    stats: &RunStats,
    status: RunStatus,
    error_message: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE sync_runs SET finished_at = ?, status = ?, fetched = ?, created_count = ?, \
         updated_count = ?, error_count = ?, ai_generated = ?, error_message = ? \
         WHERE id = ? AND status = 'in_progress'",
    )
    .bind(Utc::now())
    .bind(status.as_str())
    .bind(stats.fetched)
    .bind(stats.created)
    .bind(stats.updated)
    .bind(stats.errors)
    .bind(stats.ai_generated)
    .bind(error_message)
    .bind(run_id)
    .execute(pool)
    .await?;
    Ok(())
}

fn sync_run_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<SyncRun> {
    let status_str: String = row.get("status");
    let status = RunStatus::parse(&status_str)
        .ok_or_else(|| anyhow!("sync run has unknown status {}", status_str))?;
    Ok(SyncRun {
        id: row.get("id"),
        started_at: row.get("started_at"),
        finished_at: row.try_get("finished_at").ok(),
        status,
        stats: RunStats {
            fetched: row.get("fetched"),
            created: row.get("created_count"),
            updated: row.get("updated_count"),
            errors: row.get("error_count"),
            ai_generated: row.get("ai_generated"),
        },
        error_message: row
            .try_get::<Option<String>, _>("error_message")
            .ok()
            .flatten()
            .filter(|s| !s.is_empty()),
    })
}

/// Recent runs, most recent first. An empty ledger yields an empty list.
#[instrument(skip_all)]
pub async fn sync_history(pool: &Pool, limit: i64) -> Result<Vec<SyncRun>> {
    let rows = sqlx::query(
        "SELECT id, started_at, finished_at, status, fetched, created_count, updated_count, \
         error_count, ai_generated, error_message FROM sync_runs \
         ORDER BY datetime(started_at) DESC, id DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.iter().map(sync_run_from_row).collect()
}

#[instrument(skip_all)]
pub async fn store_statistics(pool: &Pool) -> Result<StoreStatistics> {
    let total_content: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM contents WHERE status IN ('draft', 'published')",
    )
    .fetch_one(pool)
    .await?;
    let active_content: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM contents WHERE status = 'published' AND grant_status = 'active'",
    )
    .fetch_one(pool)
    .await?;

    let midnight = Utc::now()
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight is a valid time")
        .and_utc();
    let runs_today: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM sync_runs WHERE datetime(started_at) >= datetime(?)")
            .bind(midnight)
            .fetch_one(pool)
            .await?;

    let last_run = sync_history(pool, 1).await?.into_iter().next();

    Ok(StoreStatistics {
        total_content,
        active_content,
        runs_today,
        last_run,
    })
}

/// Take the named run lock. Returns false when another run holds it; a lock
/// older than `stale_after` is treated as abandoned and taken over.
#[instrument(skip_all)]
pub async fn try_acquire_sync_lock(
    pool: &Pool,
    name: &str,
    stale_after: Duration,
) -> Result<bool> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;
    let held: Option<DateTime<Utc>> =
        sqlx::query_scalar("SELECT acquired_at FROM sync_locks WHERE name = ?")
            .bind(name)
            .fetch_optional(&mut *tx)
            .await?;

    match held {
        Some(acquired_at) if now - acquired_at < stale_after => Ok(false),
        Some(_) => {
            sqlx::query("UPDATE sync_locks SET acquired_at = ? WHERE name = ?")
                .bind(now)
                .bind(name)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(true)
        }
        None => {
            sqlx::query("INSERT INTO sync_locks (name, acquired_at) VALUES (?, ?)")
                .bind(name)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(true)
        }
    }
}

#[instrument(skip_all)]
pub async fn release_sync_lock(pool: &Pool, name: &str) -> Result<()> {
    sqlx::query("DELETE FROM sync_locks WHERE name = ?")
        .bind(name)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_pool() -> Pool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn sample_fields(external_id: &str) -> ContentFields {
        ContentFields {
            external_id: external_id.to_string(),
            title: "ものづくり補助金".to_string(),
            description: "設備投資を支援".to_string(),
            organization: "中小企業庁".to_string(),
            max_amount: 10_000_000,
            grant_status: "active".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn content_roundtrip_by_external_id() {
        let pool = setup_pool().await;
        assert!(find_content_by_external_id(&pool, "a0001")
            .await
            .unwrap()
            .is_none());

        let id = insert_content(&pool, &sample_fields("a0001"), ContentStatus::Draft, "本文")
            .await
            .unwrap();
        let found = find_content_by_external_id(&pool, "a0001")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, id);
        assert_eq!(found.title, "ものづくり補助金");
        assert_eq!(found.body, "本文");
        assert_eq!(found.content_status(), Some(ContentStatus::Draft));
    }

    #[tokio::test]
    async fn duplicate_external_id_rejected() {
        let pool = setup_pool().await;
        insert_content(&pool, &sample_fields("dup"), ContentStatus::Draft, "")
            .await
            .unwrap();
        let err = insert_content(&pool, &sample_fields("dup"), ContentStatus::Draft, "").await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn update_keeps_body_unless_requested() {
        let pool = setup_pool().await;
        let id = insert_content(&pool, &sample_fields("a0002"), ContentStatus::Draft, "古い本文")
            .await
            .unwrap();

        let mut fields = sample_fields("a0002");
        fields.title = "新タイトル".to_string();
        update_content(&pool, id, &fields, None).await.unwrap();
        let rec = get_content(&pool, id).await.unwrap();
        assert_eq!(rec.title, "新タイトル");
        assert_eq!(rec.body, "古い本文");

        update_content(&pool, id, &fields, Some("新しい本文"))
            .await
            .unwrap();
        let rec = get_content(&pool, id).await.unwrap();
        assert_eq!(rec.body, "新しい本文");
    }

    #[tokio::test]
    async fn term_get_or_create_is_idempotent() {
        let pool = setup_pool().await;
        let first = get_or_create_term(&pool, Taxonomy::Category, "新カテゴリ", "", None)
            .await
            .unwrap();
        let second = get_or_create_term(&pool, Taxonomy::Category, "新カテゴリ", "", None)
            .await
            .unwrap();
        assert_eq!(first, second);

        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM terms WHERE taxonomy = 'grant_category'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn assignments_replace_per_taxonomy() {
        let pool = setup_pool().await;
        let content = insert_content(&pool, &sample_fields("a0003"), ContentStatus::Draft, "")
            .await
            .unwrap();
        let t1 = get_or_create_term(&pool, Taxonomy::Prefecture, "東京都", "tokyo", None)
            .await
            .unwrap();
        let t2 = get_or_create_term(&pool, Taxonomy::Prefecture, "大阪府", "osaka", None)
            .await
            .unwrap();

        replace_term_assignments(&pool, content, Taxonomy::Prefecture, &[t1])
            .await
            .unwrap();
        replace_term_assignments(&pool, content, Taxonomy::Prefecture, &[t2])
            .await
            .unwrap();

        let names = term_names_for_content(&pool, content, Taxonomy::Prefecture)
            .await
            .unwrap();
        assert_eq!(names, vec!["大阪府".to_string()]);
    }

    #[tokio::test]
    async fn ledger_terminal_update_is_final() {
        let pool = setup_pool().await;
        let run_id = start_sync_run(&pool).await.unwrap();

        let stats = RunStats {
            fetched: 3,
            created: 1,
            updated: 1,
            errors: 0,
            ai_generated: 0,
        };
        complete_sync_run(&pool, run_id, &stats, RunStatus::Success, None)
            .await
            .unwrap();

        // A second completion must not overwrite the terminal row.
        let other = RunStats::default();
        complete_sync_run(&pool, run_id, &other, RunStatus::Error, Some("late"))
            .await
            .unwrap();

        let history = sync_history(&pool, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, RunStatus::Success);
        assert_eq!(history[0].stats.fetched, 3);
        assert!(history[0].error_message.is_none());
    }

    #[tokio::test]
    async fn statistics_on_empty_store() {
        let pool = setup_pool().await;
        let stats = store_statistics(&pool).await.unwrap();
        assert_eq!(stats.total_content, 0);
        assert_eq!(stats.active_content, 0);
        assert_eq!(stats.runs_today, 0);
        assert!(stats.last_run.is_none());
    }

    #[tokio::test]
    async fn sync_lock_refuses_second_holder() {
        let pool = setup_pool().await;
        assert!(try_acquire_sync_lock(&pool, "sync", Duration::hours(2))
            .await
            .unwrap());
        assert!(!try_acquire_sync_lock(&pool, "sync", Duration::hours(2))
            .await
            .unwrap());

        release_sync_lock(&pool, "sync").await.unwrap();
        assert!(try_acquire_sync_lock(&pool, "sync", Duration::hours(2))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn stale_sync_lock_is_taken_over() {
        let pool = setup_pool().await;
        let old = Utc::now() - Duration::hours(5);
        sqlx::query("INSERT INTO sync_locks (name, acquired_at) VALUES ('sync', ?)")
            .bind(old)
            .execute(&pool)
            .await
            .unwrap();

        assert!(try_acquire_sync_lock(&pool, "sync", Duration::hours(2))
            .await
            .unwrap());
    }
}
