use crate::limits::{MAX_VALID_TIMESTAMP_MS, MIN_VALID_TIMESTAMP_MS};
use crate::model::*;

use super::EngineError;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before 1970")
        .as_millis() as Ms
}

pub(crate) fn validate_instant(at: Ms) -> Result<(), EngineError> {
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&at) {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

// ── Conflict tests ────────────────────────────────────────────────
//
// Two flavors, per the booking contract:
//  - listing: the candidate slot is padded by the buffer on both sides
//    and tested against each open interview's raw interval;
//  - commit: raw against raw. The stored interval never includes the
//    buffer, so the invariant after commit is raw non-overlap.

/// Listing-time advisory test.
pub fn buffered_conflict(slot: &Span, buffer_ms: Ms, day: &DayBook) -> bool {
    let padded = slot.padded(buffer_ms);
    day.interviews
        .iter()
        .filter(|i| i.status.is_open())
        .any(|i| padded.overlaps(&i.span()))
}

/// Commit-time authoritative test. Runs under the day write lock.
pub fn commit_conflict(span: &Span, day: &DayBook) -> Result<(), EngineError> {
    for interview in &day.interviews {
        if interview.status.is_open() && span.overlaps(&interview.span()) {
            return Err(EngineError::Conflict);
        }
    }
    Ok(())
}

/// Coarse day-level signal for the availability summary: a date counts
/// as fully booked once its open-interview count reaches the fixed
/// threshold. Deliberately not a per-slot capacity computation.
pub fn day_fully_booked(day: &DayBook) -> bool {
    day.open_count() >= FULLY_BOOKED_THRESHOLD
}

/// Annotate generated starts with availability and the single displayed
/// reason. Check order is fixed: notice, then conflict, then lunch;
/// the first failing check wins.
pub fn annotate(
    starts: &[MinuteOfDay],
    duration_min: u32,
    date: chrono::NaiveDate,
    config: &AvailabilityConfig,
    lunch: Option<&DayWindow>,
    day: &DayBook,
    now: Ms,
    offset_min: i32,
) -> Vec<Slot> {
    let buffer_ms = (config.buffer_min as Ms) * MINUTE_MS;
    let notice_floor = now + (config.min_notice_hours as Ms) * HOUR_MS;

    starts
        .iter()
        .map(|&start_minute| {
            let start = instant_at(date, start_minute, offset_min);
            let span = Span::new(start, start + (duration_min as Ms) * MINUTE_MS);

            let reason = if start < notice_floor {
                Some(SlotReason::TooShortNotice)
            } else if buffered_conflict(&span, buffer_ms, day) {
                Some(SlotReason::AlreadyBooked)
            } else if super::slots::in_lunch_block(start_minute, duration_min, lunch) {
                Some(SlotReason::Lunch)
            } else {
                None
            };

            Slot { start_minute, available: reason.is_none(), reason }
        })
        .collect()
}
