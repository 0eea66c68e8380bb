//! Half-open time windows in Unix milliseconds

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ChargebackError, Result};

/// Half-open interval `[start, end)` in Unix milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: i64,
    pub end: i64,
}

impl TimeRange {
    /// Create a range, rejecting empty or inverted windows
    pub fn new(start: i64, end: i64) -> Result<Self> {
        if start >= end {
            return Err(ChargebackError::Validation(format!(
                "time range must satisfy start < end, got [{start}, {end})"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn from_datetimes(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        Self::new(start.timestamp_millis(), end.timestamp_millis())
    }

    pub fn duration_ms(&self) -> i64 {
        self.end - self.start
    }

    pub fn contains(&self, ts: i64) -> bool {
        ts >= self.start && ts < self.end
    }

    /// Intersection of two ranges, if non-empty
    pub fn overlap(&self, other: &TimeRange) -> Option<TimeRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then_some(TimeRange { start, end })
    }

    /// Widen the range outward to multiples of `width_ms`
    pub fn aligned(&self, width_ms: i64) -> TimeRange {
        TimeRange {
            start: align_down(self.start, width_ms),
            end: align_up(self.end, width_ms),
        }
    }

    /// Aligned slots of `width_ms` that intersect this range, in order
    pub fn slots(&self, width_ms: i64) -> Vec<TimeRange> {
        let aligned = self.aligned(width_ms);
        let mut slots = Vec::with_capacity((aligned.duration_ms() / width_ms) as usize);
        let mut cursor = aligned.start;
        while cursor < aligned.end {
            slots.push(TimeRange {
                start: cursor,
                end: cursor + width_ms,
            });
            cursor += width_ms;
        }
        slots
    }

    pub fn start_datetime(&self) -> DateTime<Utc> {
        to_datetime(self.start)
    }

    pub fn end_datetime(&self) -> DateTime<Utc> {
        to_datetime(self.end)
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            self.start_datetime().to_rfc3339(),
            self.end_datetime().to_rfc3339()
        )
    }
}

/// Round `ts` down to a multiple of `width_ms` (epoch aligned)
pub fn align_down(ts: i64, width_ms: i64) -> i64 {
    ts.div_euclid(width_ms) * width_ms
}

/// Round `ts` up to a multiple of `width_ms` (epoch aligned)
pub fn align_up(ts: i64, width_ms: i64) -> i64 {
    let down = align_down(ts, width_ms);
    if down == ts {
        ts
    } else {
        down + width_ms
    }
}

fn to_datetime(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ts)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HOUR_MS;

    #[test]
    fn test_rejects_empty_range() {
        assert!(TimeRange::new(10, 10).is_err());
        assert!(TimeRange::new(10, 5).is_err());
        assert!(TimeRange::new(5, 10).is_ok());
    }

    #[test]
    fn test_overlap() {
        let a = TimeRange::new(0, 100).unwrap();
        let b = TimeRange::new(50, 150).unwrap();
        let c = TimeRange::new(100, 200).unwrap();

        assert_eq!(a.overlap(&b), Some(TimeRange { start: 50, end: 100 }));
        assert_eq!(a.overlap(&c), None);
    }

    #[test]
    fn test_alignment() {
        assert_eq!(align_down(-1, HOUR_MS), -HOUR_MS);
        assert_eq!(align_down(HOUR_MS + 1, HOUR_MS), HOUR_MS);
        assert_eq!(align_up(HOUR_MS + 1, HOUR_MS), 2 * HOUR_MS);
        assert_eq!(align_up(HOUR_MS, HOUR_MS), HOUR_MS);
    }

    #[test]
    fn test_slots_cover_partial_edges() {
        let range = TimeRange::new(HOUR_MS / 2, 2 * HOUR_MS + 1).unwrap();
        let slots = range.slots(HOUR_MS);

        assert_eq!(slots.len(), 3);
        assert_eq!(slots[0].start, 0);
        assert_eq!(slots[2].end, 3 * HOUR_MS);
    }

    #[test]
    fn test_display_is_rfc3339() {
        let range = TimeRange::new(0, HOUR_MS).unwrap();
        assert_eq!(
            range.to_string(),
            "[1970-01-01T00:00:00+00:00, 1970-01-01T01:00:00+00:00)"
        );
    }
}
