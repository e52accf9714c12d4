//! Tier selection
//!
//! Fixed segment tiers take precedence, then time tiers from the oldest age
//! down. A time tier matches a segment whose end time is more than the tier's
//! age in the past.

use std::time::Duration;

use tessera_core::{Result, SegmentMetadata, TierConfig, TierSelector};

/// A tier with its parsed age
#[derive(Debug, Clone)]
pub struct SortedTier {
    pub config: TierConfig,
    pub age: Option<Duration>,
}

impl SortedTier {
    pub fn name(&self) -> &str {
        &self.config.name
    }

    fn matches(&self, segment: &SegmentMetadata, now_ms: i64) -> bool {
        match (&self.config.selector, self.age) {
            (TierSelector::Fixed { segments }, _) => segments.iter().any(|s| *s == segment.name),
            (TierSelector::Time { .. }, Some(age)) => segment
                .end_time_ms
                .is_some_and(|end| now_ms.saturating_sub(end) > age.as_millis() as i64),
            (TierSelector::Time { .. }, None) => false,
        }
    }
}

/// Order tiers by precedence
pub fn sort_tiers(tiers: &[TierConfig]) -> Result<Vec<SortedTier>> {
    let mut sorted = tiers
        .iter()
        .map(|config| {
            Ok(SortedTier {
                age: config.segment_age()?,
                config: config.clone(),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    // Stable: fixed tiers keep their configured order
    sorted.sort_by(|a, b| match (a.age, b.age) {
        (None, None) => std::cmp::Ordering::Equal,
        (None, Some(_)) => std::cmp::Ordering::Less,
        (Some(_), None) => std::cmp::Ordering::Greater,
        (Some(x), Some(y)) => y.cmp(&x),
    });
    Ok(sorted)
}

/// First tier a segment belongs to, if any
pub fn select_tier<'a>(sorted: &'a [SortedTier], segment: &SegmentMetadata, now_ms: i64) -> Option<&'a SortedTier> {
    sorted.iter().find(|tier| tier.matches(segment, now_ms))
}
