//! Canonical taxonomy term tables and their idempotent installation.
//!
//! Term names are case-sensitive exact keys. The seed lists here are the
//! deployment defaults; the sync and enrichment paths are free to mint new
//! category/prefecture/target terms at runtime, while the amount-range set
//! is closed and only ever looked up.

use crate::model::Taxonomy;
use anyhow::Result;
use sqlx::SqlitePool;

/// Sentinel region meaning "applies everywhere".
pub const NATIONWIDE: &str = "全国";

pub const DEFAULT_CATEGORIES: &[(&str, &str)] = &[
    ("IT・デジタル化", "it-digital"),
    ("設備投資・機械導入", "equipment"),
    ("研究開発・技術開発", "rd"),
    ("人材育成・雇用", "hr"),
    ("創業・起業", "startup"),
    ("海外展開・輸出", "overseas"),
    ("環境・エネルギー", "environment"),
    ("地域振興・観光", "regional"),
    ("農林水産業", "agriculture"),
    ("医療・福祉・介護", "medical"),
    ("災害対策・BCP", "disaster"),
    ("その他", "other"),
];

pub const FALLBACK_CATEGORY: &str = "その他";

/// Region groupings with their member prefectures. Region names double as
/// parent terms and as expandable area names in source data.
pub const REGIONS: &[(&str, &[(&str, &str)])] = &[
    (
        "北海道・東北",
        &[
            ("北海道", "hokkaido"),
            ("青森県", "aomori"),
            ("岩手県", "iwate"),
            ("宮城県", "miyagi"),
            ("秋田県", "akita"),
            ("山形県", "yamagata"),
            ("福島県", "fukushima"),
        ],
    ),
    (
        "関東",
        &[
            ("茨城県", "ibaraki"),
            ("栃木県", "tochigi"),
            ("群馬県", "gunma"),
            ("埼玉県", "saitama"),
            ("千葉県", "chiba"),
            ("東京都", "tokyo"),
            ("神奈川県", "kanagawa"),
        ],
    ),
    (
        "中部",
        &[
            ("新潟県", "niigata"),
            ("富山県", "toyama"),
            ("石川県", "ishikawa"),
            ("福井県", "fukui"),
            ("山梨県", "yamanashi"),
            ("長野県", "nagano"),
            ("岐阜県", "gifu"),
            ("静岡県", "shizuoka"),
            ("愛知県", "aichi"),
        ],
    ),
    (
        "近畿",
        &[
            ("三重県", "mie"),
            ("滋賀県", "shiga"),
            ("京都府", "kyoto"),
            ("大阪府", "osaka"),
            ("兵庫県", "hyogo"),
            ("奈良県", "nara"),
            ("和歌山県", "wakayama"),
        ],
    ),
    (
        "中国",
        &[
            ("鳥取県", "tottori"),
            ("島根県", "shimane"),
            ("岡山県", "okayama"),
            ("広島県", "hiroshima"),
            ("山口県", "yamaguchi"),
        ],
    ),
    (
        "四国",
        &[
            ("徳島県", "tokushima"),
            ("香川県", "kagawa"),
            ("愛媛県", "ehime"),
            ("高知県", "kochi"),
        ],
    ),
    (
        "九州・沖縄",
        &[
            ("福岡県", "fukuoka"),
            ("佐賀県", "saga"),
            ("長崎県", "nagasaki"),
            ("熊本県", "kumamoto"),
            ("大分県", "oita"),
            ("宮崎県", "miyazaki"),
            ("鹿児島県", "kagoshima"),
            ("沖縄県", "okinawa"),
        ],
    ),
];

pub const DEFAULT_TARGETS: &[(&str, &str)] = &[
    ("中小企業", "sme"),
    ("小規模事業者", "small-business"),
    ("個人事業主", "sole-proprietor"),
    ("スタートアップ", "startup"),
    ("製造業", "manufacturing"),
    ("サービス業", "service"),
    ("小売業", "retail"),
    ("卸売業", "wholesale"),
    ("NPO法人", "npo"),
    ("組合", "union"),
    ("農業者", "farmer"),
    ("漁業者", "fisherman"),
    ("林業者", "forester"),
];

/// Amount-range buckets: (exclusive upper bound in yen, name, slug).
/// Boundaries are inclusive-low: an amount equal to a bound falls into the
/// next bucket up. The final entry is the unbounded catch-all.
pub const AMOUNT_RANGES: &[(i64, &str, &str)] = &[
    (1_000_000, "〜100万円", "under-1m"),
    (5_000_000, "100万円〜500万円", "1m-5m"),
    (10_000_000, "500万円〜1000万円", "5m-10m"),
    (30_000_000, "1000万円〜3000万円", "10m-30m"),
    (50_000_000, "3000万円〜5000万円", "30m-50m"),
    (100_000_000, "5000万円〜1億円", "50m-100m"),
    (i64::MAX, "1億円以上", "over-100m"),
];

/// Resolve the amount-range bucket for a maximum grant amount.
/// Returns None for zero/unknown amounts, which carry no bucket.
pub fn amount_range_name(max_amount: i64) -> Option<&'static str> {
    if max_amount <= 0 {
        return None;
    }
    AMOUNT_RANGES
        .iter()
        .find(|(bound, _, _)| max_amount < *bound)
        .map(|(_, name, _)| *name)
}

/// All canonical prefecture names, nationwide sentinel first.
pub fn canonical_prefectures() -> Vec<&'static str> {
    let mut names = vec![NATIONWIDE];
    for (_, prefectures) in REGIONS {
        names.extend(prefectures.iter().map(|(name, _)| *name));
    }
    names
}

/// Look up the member prefectures of a named region, if any.
pub fn region_members(region: &str) -> Option<&'static [(&'static str, &'static str)]> {
    REGIONS
        .iter()
        .find(|(name, _)| *name == region)
        .map(|(_, prefectures)| *prefectures)
}

/// Install the default term sets. Safe to call on every startup: existing
/// terms are left untouched.
pub async fn install_defaults(pool: &SqlitePool) -> Result<()> {
    for (name, slug) in DEFAULT_CATEGORIES {
        crate::db::get_or_create_term(pool, Taxonomy::Category, name, slug, None).await?;
    }

    crate::db::get_or_create_term(pool, Taxonomy::Prefecture, NATIONWIDE, "nationwide", None)
        .await?;
    for (region, prefectures) in REGIONS {
        let parent_id =
            crate::db::get_or_create_term(pool, Taxonomy::Prefecture, region, "", None).await?;
        for (name, slug) in *prefectures {
            crate::db::get_or_create_term(pool, Taxonomy::Prefecture, name, slug, Some(parent_id))
                .await?;
        }
    }

    for (name, slug) in DEFAULT_TARGETS {
        crate::db::get_or_create_term(pool, Taxonomy::Target, name, slug, None).await?;
    }

    for (_, name, slug) in AMOUNT_RANGES {
        crate::db::get_or_create_term(pool, Taxonomy::AmountRange, name, slug, None).await?;
    }

    Ok(())
}
