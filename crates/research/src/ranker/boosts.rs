//! Deterministic score multipliers and the ranking order

use chrono::NaiveDate;
use quarry_common::config::RankingConfig;
use quarry_common::models::SourceCandidate;
use std::cmp::Ordering;

const RECENT_DAYS: i64 = 365;
const MODERATELY_RECENT_DAYS: i64 = 3 * 365;

/// Age-based multiplier relative to `as_of`. Undated sources get 1.0.
pub fn recency(config: &RankingConfig, published: Option<NaiveDate>, as_of: NaiveDate) -> f32 {
    let Some(published) = published else {
        return 1.0;
    };

    // Future dates count as brand new
    let age_days = (as_of - published).num_days().max(0);
    if age_days < RECENT_DAYS {
        config.recent_boost.max(1.0)
    } else if age_days < MODERATELY_RECENT_DAYS {
        config.moderately_recent_boost.max(1.0)
    } else {
        1.0
    }
}

/// Raw score times credibility and recency multipliers
pub fn boosted(config: &RankingConfig, candidate: &SourceCandidate, raw: f32, as_of: NaiveDate) -> f32 {
    raw * config.credibility(candidate.source_type) * recency(config, candidate.published_date, as_of)
}

/// Total order used for ranking: boosted score descending, then newer
/// first (undated last), then source credibility rank, then key.
pub fn compare(a: &SourceCandidate, b: &SourceCandidate) -> Ordering {
    b.score()
        .total_cmp(&a.score())
        .then_with(|| match (a.published_date, b.published_date) {
            (Some(x), Some(y)) => y.cmp(&x),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| {
            b.source_type
                .credibility_rank()
                .cmp(&a.source_type.credibility_rank())
        })
        .then_with(|| a.key().cmp(&b.key()))
}
