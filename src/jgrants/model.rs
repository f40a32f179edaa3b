//! Raw response shapes for the subsidy API.
//!
//! Field names follow the public exp endpoint; aliases absorb the older
//! authenticated deployment's spellings so a payload from either contract
//! decodes into the same struct. Fallback precedence between fields
//! (e.g. `title` over `name`) is applied during normalization, not here.

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubsidiesResponse {
    #[serde(default, alias = "subsidies", alias = "items")]
    pub result: Vec<RawSubsidy>,
    #[serde(default)]
    pub metadata: Option<ResponseMetadata>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseMetadata {
    #[serde(default)]
    pub resultset: Option<Resultset>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Resultset {
    #[serde(default)]
    pub count: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawSubsidy {
    #[serde(default, alias = "subsidy_id")]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, alias = "description", alias = "summary")]
    pub detail: Option<String>,
    #[serde(default, alias = "provider")]
    pub organization: Option<String>,
    #[serde(default, alias = "purpose")]
    pub use_purpose: Option<String>,
    #[serde(default, alias = "target", alias = "eligible_entities")]
    pub target_search: Option<String>,
    #[serde(default, alias = "max_amount", alias = "maximum_amount")]
    pub subsidy_max_limit: Option<Value>,
    #[serde(default, alias = "min_amount", alias = "minimum_amount")]
    pub subsidy_min_limit: Option<Value>,
    #[serde(default, alias = "rate")]
    pub subsidy_rate: Option<String>,
    #[serde(default, alias = "application_start", alias = "start_date")]
    pub acceptance_start_datetime: Option<String>,
    #[serde(default, alias = "deadline", alias = "application_deadline")]
    pub acceptance_end_datetime: Option<String>,
    #[serde(default, alias = "field")]
    pub category: Option<String>,
    #[serde(default, alias = "prefecture", alias = "region")]
    pub target_area_search: Option<String>,
    #[serde(default)]
    pub industry: Option<String>,
    #[serde(default)]
    pub target_number_of_employees: Option<String>,
    #[serde(default, alias = "official_url", alias = "url")]
    pub front_subsidy_detail_page_url: Option<String>,
}
