//! Database entity and view models used by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use crate::model::{ContentStatus, GrantStatus, SyncRun};
use chrono::{DateTime, Utc};

/// Full content row as stored. Status columns stay as raw strings here;
/// use the typed accessors when deciding behavior.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ContentRecord {
    pub id: i64,
    pub external_id: String,
    pub status: String,
    pub title: String,
    pub body: String,
    pub excerpt: String,
    pub description: String,
    pub organization: String,
    pub purpose: String,
    pub target: String,
    pub max_amount: i64,
    pub min_amount: i64,
    pub subsidy_rate: String,
    pub industry: String,
    pub target_area: String,
    pub target_employees: String,
    pub official_url: String,
    pub grant_status: String,
    pub application_start: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
    pub ai_generated_at: Option<DateTime<Utc>>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ContentRecord {
    pub fn content_status(&self) -> Option<ContentStatus> {
        ContentStatus::parse(&self.status)
    }

    pub fn grant_status(&self) -> Option<GrantStatus> {
        GrantStatus::parse(&self.grant_status)
    }
}

/// Field bundle written on create and refreshed on every matching sync.
#[derive(Debug, Clone, Default)]
pub struct ContentFields {
    pub external_id: String,
    pub title: String,
    pub description: String,
    pub organization: String,
    pub purpose: String,
    pub target: String,
    pub max_amount: i64,
    pub min_amount: i64,
    pub subsidy_rate: String,
    pub industry: String,
    pub target_area: String,
    pub target_employees: String,
    pub official_url: String,
    pub grant_status: String,
    pub application_start: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
}

/// Dashboard counters derived from the store and the ledger.
#[derive(Debug, Clone, Default)]
pub struct StoreStatistics {
    pub total_content: i64,
    pub active_content: i64,
    pub runs_today: i64,
    pub last_run: Option<SyncRun>,
}
