//! Recency decay for search scoring.

use chrono::{DateTime, Utc};
use mnemo_core::time::parse_ts;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Exponential attenuation by age: `0.5 ^ (days_elapsed / half_life)`.
/// A half-life of 0 disables decay (factor exactly 1). Timestamps that
/// fail to parse also yield 1 so the raw score survives.
pub fn decay_factor(updated_at: &str, now: DateTime<Utc>, half_life_days: f64) -> f32 {
    if half_life_days <= 0.0 {
        return 1.0;
    }
    let Some(updated) = parse_ts(updated_at) else {
        return 1.0;
    };
    let days_elapsed = (now - updated).num_seconds() as f64 / SECONDS_PER_DAY;
    if days_elapsed <= 0.0 {
        return 1.0;
    }
    0.5f64.powf(days_elapsed / half_life_days) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use mnemo_core::time::format_ts;

    #[test]
    fn halves_per_half_life() {
        let now = Utc::now();
        let thirty_days_ago = format_ts(now - Duration::days(30));
        let factor = decay_factor(&thirty_days_ago, now, 30.0);
        assert!((factor - 0.5).abs() < 1e-3);
    }

    #[test]
    fn monotonically_non_increasing_in_age() {
        let now = Utc::now();
        let mut last = f32::INFINITY;
        for days in [0, 1, 7, 30, 90, 365] {
            let ts = format_ts(now - Duration::days(days));
            let factor = decay_factor(&ts, now, 30.0);
            assert!(factor <= last);
            last = factor;
        }
    }

    #[test]
    fn zero_half_life_disables_decay() {
        let now = Utc::now();
        let old = format_ts(now - Duration::days(10_000));
        assert_eq!(decay_factor(&old, now, 0.0), 1.0);
    }

    #[test]
    fn unparseable_timestamp_keeps_score() {
        assert_eq!(decay_factor("not a date", Utc::now(), 30.0), 1.0);
    }
}
