use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Recruitment status of a grant, derived from its application window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum GrantStatus {
    Active,
    Upcoming,
    Closed,
}

impl GrantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantStatus::Active => "active",
            GrantStatus::Upcoming => "upcoming",
            GrantStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(GrantStatus::Active),
            "upcoming" => Some(GrantStatus::Upcoming),
            "closed" | "expired" => Some(GrantStatus::Closed),
            _ => None,
        }
    }
}

/// Publication state of a local content record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ContentStatus {
    Draft,
    Published,
    Expired,
}

impl ContentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentStatus::Draft => "draft",
            ContentStatus::Published => "published",
            ContentStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(ContentStatus::Draft),
            "published" => Some(ContentStatus::Published),
            "expired" => Some(ContentStatus::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RunStatus {
    InProgress,
    Success,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::InProgress => "in_progress",
            RunStatus::Success => "success",
            RunStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(RunStatus::InProgress),
            "success" => Some(RunStatus::Success),
            "error" => Some(RunStatus::Error),
            _ => None,
        }
    }
}

/// Categorical dimensions a content record can be tagged with.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Taxonomy {
    Category,
    Prefecture,
    Target,
    AmountRange,
}

impl Taxonomy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Taxonomy::Category => "grant_category",
            Taxonomy::Prefecture => "prefecture",
            Taxonomy::Target => "grant_target",
            Taxonomy::AmountRange => "amount_range",
        }
    }
}

/// Canonical grant record after source normalization.
///
/// `external_id` is the stable key used for matching against the local
/// store; the pipeline never creates two records for the same id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Grant {
    pub external_id: String,
    pub title: String,
    pub description: String,
    pub organization: String,
    pub purpose: String,
    pub target: String,
    pub max_amount: i64,
    pub min_amount: i64,
    pub subsidy_rate: String,
    pub application_start: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
    pub status: GrantStatus,
    pub category: String,
    pub prefectures: BTreeSet<String>,
    pub industry: String,
    pub target_area: String,
    pub target_employee_band: String,
    pub official_url: String,
}

/// Aggregate counters reported for one sync run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunStats {
    pub fetched: i64,
    pub created: i64,
    pub updated: i64,
    pub errors: i64,
    pub ai_generated: i64,
}

/// One row of the sync ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub stats: RunStats,
    pub error_message: Option<String>,
}
