use chrono::{Days, NaiveDate};
use ulid::Ulid;

use crate::model::*;

use super::conflict::{annotate, day_fully_booked};
use super::slots::{generate, DayPlan};
use super::{Engine, EngineError};

impl Engine {
    /// Stored config for a kind, or the documented defaults. Listing
    /// must keep working when nothing was ever configured.
    pub async fn config_for(&self, kind: BookingKind) -> AvailabilityConfig {
        self.configs.read().await.get(&kind).cloned().unwrap_or_default()
    }

    pub async fn blocks_snapshot(&self) -> BookingBlocks {
        self.blocks.read().await.clone()
    }

    /// The first caller-facing read: config subset plus the day-level
    /// calendar shape over the advance-booking window.
    pub async fn availability_summary(
        &self,
        secret: &str,
        now: Ms,
    ) -> Result<AvailabilitySummary, EngineError> {
        let grant = self.validate_token(secret, now).await?;
        let config = self.config_for(grant.kind).await;
        let blocks = self.blocks_snapshot().await;

        let today = local_date(now, self.offset_min);
        let mut fully_booked_dates = Vec::new();
        let mut blocked_dates = Vec::new();

        for offset in 0..=config.advance_booking_days {
            let Some(date) = today.checked_add_days(Days::new(offset as u64)) else {
                break;
            };
            if blocks.bank_holidays.contains(&date) {
                blocked_dates.push(date);
                continue;
            }
            let day = self.days.get(&date).map(|e| e.value().clone());
            if let Some(day) = day {
                let guard = day.read().await;
                if day_fully_booked(&guard) {
                    fully_booked_dates.push(date);
                }
            }
        }

        Ok(AvailabilitySummary {
            kind: grant.kind,
            first_name: grant.first_name,
            schedule: config.schedule.clone(),
            slot_duration_min: config.slot_duration_min,
            buffer_min: config.buffer_min,
            advance_booking_days: config.advance_booking_days,
            min_notice_hours: config.min_notice_hours,
            fully_booked_dates,
            blocked_dates,
            lunch: blocks.lunch,
        })
    }

    /// Annotated slot listing for one date. Advisory only — whatever
    /// this says, the commit section re-decides at submit time.
    pub async fn time_slots(
        &self,
        secret: &str,
        date: NaiveDate,
        now: Ms,
    ) -> Result<DaySlots, EngineError> {
        let grant = self.validate_token(secret, now).await?;
        let config = self.config_for(grant.kind).await;
        let blocks = self.blocks_snapshot().await;

        // grant.duration_min is already resolved, so feeding it back as
        // the override is a no-op for trials and exact for interviews.
        let plan = generate(date, grant.kind, Some(grant.duration_min), &config, &blocks);
        let (starts, duration_min) = match plan {
            DayPlan::Blocked { reason } => return Ok(DaySlots::Blocked { reason }),
            DayPlan::Open { starts, duration_min } => (starts, duration_min),
        };
        if starts.is_empty() {
            return Ok(DaySlots::Open { slots: Vec::new() });
        }

        // Read-only: never materialize a DayBook just to list against it.
        let day = self.days.get(&date).map(|e| e.value().clone());
        let slots = match day {
            Some(day) => {
                let guard = day.read().await;
                annotate(
                    &starts,
                    duration_min,
                    date,
                    &config,
                    blocks.lunch.as_ref(),
                    &guard,
                    now,
                    self.offset_min,
                )
            }
            None => annotate(
                &starts,
                duration_min,
                date,
                &config,
                blocks.lunch.as_ref(),
                &DayBook::new(date),
                now,
                self.offset_min,
            ),
        };
        Ok(DaySlots::Open { slots })
    }

    // ── Operator reads ───────────────────────────────────────────

    pub async fn interviews_on(&self, date: NaiveDate) -> Vec<Interview> {
        match self.days.get(&date).map(|e| e.value().clone()) {
            Some(day) => day.read().await.interviews.clone(),
            None => Vec::new(),
        }
    }

    pub async fn interviews_for(&self, candidate_id: Ulid) -> Vec<Interview> {
        let day_handles: Vec<_> = self.days.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for day in day_handles {
            let guard = day.read().await;
            out.extend(
                guard.interviews.iter().filter(|i| i.candidate_id == candidate_id).cloned(),
            );
        }
        out.sort_by_key(|i| i.scheduled_at);
        out
    }

    pub async fn get_interview(&self, id: Ulid) -> Option<Interview> {
        let date = self.interview_day.get(&id).map(|e| *e.value())?;
        let day = self.days.get(&date).map(|e| e.value().clone())?;
        let guard = day.read().await;
        guard.get(id).cloned()
    }

    pub async fn get_link(&self, id: Ulid) -> Option<BookingLink> {
        let link = self.link_handle(&id)?;
        let guard = link.read().await;
        Some(guard.clone())
    }

    pub async fn get_candidate(&self, id: Ulid) -> Option<Candidate> {
        let candidate = self.candidate_handle(&id)?;
        let guard = candidate.read().await;
        Some(guard.clone())
    }
}
