use chrono::{Datelike, NaiveDate};

use crate::model::*;

// ── Slot generation ───────────────────────────────────────────────
//
// Deterministic and stateless: the candidate sequence for a date is a
// pure function of the config and blocks, regenerated on every call.
// Existing bookings never influence generation — they only annotate.

/// Raw generator output for one date, before conflict annotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DayPlan {
    /// The whole date is unbookable (bank holiday).
    Blocked { reason: &'static str },
    /// Candidate start minutes, ordered, plus the effective duration.
    Open { starts: Vec<MinuteOfDay>, duration_min: u32 },
}

/// Candidate start times for `date`. Steps through each configured
/// window emitting starts while the whole appointment still fits:
/// `t + duration <= window.end`, advancing `t += step + buffer`.
/// Trial slots step by their full duration, so long bookings never
/// overlap; interview slots are back-to-back before buffer.
pub fn generate(
    date: NaiveDate,
    kind: BookingKind,
    link_duration_override: Option<u32>,
    config: &AvailabilityConfig,
    blocks: &BookingBlocks,
) -> DayPlan {
    if blocks.bank_holidays.contains(&date) {
        return DayPlan::Blocked { reason: "holiday" };
    }

    let day = config.schedule.day(date.weekday());
    if !day.enabled || day.windows.is_empty() {
        return DayPlan::Open { starts: Vec::new(), duration_min: 0 };
    }

    let duration = kind.resolve_duration(link_duration_override, config) as MinuteOfDay;
    let step = duration;
    let buffer = config.buffer_min as MinuteOfDay;

    let mut starts = Vec::new();
    for window in &day.windows {
        let mut t = window.start;
        while t + duration <= window.end {
            starts.push(t);
            t += step + buffer;
        }
    }

    DayPlan::Open { starts, duration_min: duration as u32 }
}

/// Does `[start, start+duration)` intersect the lunch window?
/// Standard half-open overlap test.
pub fn in_lunch_block(
    start: MinuteOfDay,
    duration_min: u32,
    lunch: Option<&DayWindow>,
) -> bool {
    match lunch {
        Some(window) => window.overlaps_minutes(start, start + duration_min as MinuteOfDay),
        None => false,
    }
}
