use chrono::NaiveDate;
use tracing::warn;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{commit_conflict, validate_instant};
use super::{confirmation_code, slots, Engine, EngineError};

impl Engine {
    // ── Candidate directory ──────────────────────────────────────

    pub async fn upsert_candidate(
        &self,
        id: Ulid,
        first_name: String,
        status: CandidateStatus,
    ) -> Result<(), EngineError> {
        if first_name.is_empty() {
            return Err(EngineError::InvalidInput("first_name must not be empty"));
        }
        if first_name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("first_name too long"));
        }
        if self.candidates.len() >= MAX_CANDIDATES_PER_TENANT
            && !self.candidates.contains_key(&id)
        {
            return Err(EngineError::LimitExceeded("too many candidates"));
        }

        let event = Event::CandidateUpserted { id, first_name: first_name.clone(), status };
        self.wal_append(&event).await?;
        self.candidates.insert(
            id,
            std::sync::Arc::new(tokio::sync::RwLock::new(Candidate { id, first_name, status })),
        );
        self.notify.send(&event);

        if status.is_terminal() {
            self.close_out_interviews(id, status).await?;
        }
        Ok(())
    }

    /// Explicit status set — the operator surface and the hook the
    /// reactive rule hangs off: entering a terminal status immediately
    /// resolves the candidate's lapsed interviews and cancels the ones
    /// still on the calendar.
    pub async fn set_candidate_status(
        &self,
        id: Ulid,
        status: CandidateStatus,
        reason: Option<String>,
    ) -> Result<(), EngineError> {
        let candidate = self.candidate_handle(&id).ok_or(EngineError::NotFound(id))?;
        {
            let mut guard = candidate.write().await;
            if guard.status == status {
                return Ok(());
            }
            let event = Event::CandidateStatusChanged { id, status, reason };
            self.wal_append(&event).await?;
            guard.status = status;
            self.notify.send(&event);
        }

        if status.is_terminal() {
            self.close_out_interviews(id, status).await?;
        }
        Ok(())
    }

    /// Forward-only advance used by booking commits and the lapsed
    /// sweep. A pipeline that already moved further (or terminated) is
    /// left alone; returns whether anything changed.
    pub(super) async fn advance_candidate(
        &self,
        id: Ulid,
        target: CandidateStatus,
    ) -> Result<bool, EngineError> {
        let candidate = self.candidate_handle(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = candidate.write().await;
        if guard.status.is_terminal() || target.rank() <= guard.status.rank() {
            return Ok(false);
        }
        let event = Event::CandidateStatusChanged { id, status: target, reason: None };
        self.wal_append(&event).await?;
        guard.status = target;
        self.notify.send(&event);
        Ok(true)
    }

    /// Reactive companion to the lapsed sweep: close every interview a
    /// now-terminal candidate still has in flight.
    async fn close_out_interviews(
        &self,
        candidate_id: Ulid,
        candidate_status: CandidateStatus,
    ) -> Result<(), EngineError> {
        let day_handles: Vec<_> = self.days.iter().map(|e| e.value().clone()).collect();
        for day in day_handles {
            let mut guard = day.write().await;
            let targets: Vec<(Ulid, InterviewStatus)> = guard
                .interviews
                .iter()
                .filter(|i| i.candidate_id == candidate_id)
                .filter_map(|i| match i.status {
                    InterviewStatus::Lapsed => Some((i.id, InterviewStatus::Resolved)),
                    s if s.is_open() => Some((i.id, InterviewStatus::Cancelled)),
                    _ => None,
                })
                .collect();

            for (interview_id, new_status) in targets {
                let reason = match new_status {
                    InterviewStatus::Resolved => format!(
                        "auto-resolved: candidate status is {}",
                        candidate_status.as_str()
                    ),
                    _ => format!("cancelled: candidate status is {}", candidate_status.as_str()),
                };
                let event = Event::InterviewStatusChanged {
                    id: interview_id,
                    status: new_status,
                    reason: Some(reason.clone()),
                    rescheduled_at: None,
                };
                self.wal_append(&event).await?;
                if let Some(interview) = guard.get_mut(interview_id) {
                    interview.status = new_status;
                    interview.notes = Some(reason);
                }
                self.notify.send(&event);
            }
        }
        Ok(())
    }

    // ── Configuration ────────────────────────────────────────────

    pub async fn set_schedule(
        &self,
        kind: BookingKind,
        config: AvailabilityConfig,
    ) -> Result<(), EngineError> {
        config.validate().map_err(EngineError::InvalidInput)?;
        let event = Event::ScheduleUpdated { kind, config: config.clone() };
        self.wal_append(&event).await?;
        self.configs.write().await.insert(kind, config);
        self.notify.send(&event);
        Ok(())
    }

    pub async fn set_blocks(&self, blocks: BookingBlocks) -> Result<(), EngineError> {
        if let Some(lunch) = &blocks.lunch
            && lunch.start >= lunch.end {
                return Err(EngineError::InvalidInput("lunch start must be before end"));
            }
        let event = Event::BlocksUpdated { blocks: blocks.clone() };
        self.wal_append(&event).await?;
        *self.blocks.write().await = blocks;
        self.notify.send(&event);
        Ok(())
    }

    // ── The booking transaction ──────────────────────────────────

    /// Book one slot against a link. Steps 1–4 (duration resolution,
    /// holiday/lunch re-check, past check, advisory conflict scan) are
    /// UX; the locked section at the end is the actual double-booking
    /// and link-reuse boundary.
    pub async fn submit_booking(
        &self,
        secret: &str,
        date: NaiveDate,
        time: &str,
        now: Ms,
    ) -> Result<BookingReceipt, EngineError> {
        let minute =
            parse_hhmm(time).ok_or(EngineError::InvalidInput("time must be HH:MM"))?;

        let grant = self.validate_token(secret, now).await?;
        let duration_min = grant.duration_min;

        let blocks = self.blocks.read().await.clone();
        if blocks.bank_holidays.contains(&date) {
            return Err(EngineError::BlockedHoliday);
        }
        if slots::in_lunch_block(minute, duration_min, blocks.lunch.as_ref()) {
            return Err(EngineError::BlockedLunch);
        }

        let start = instant_at(date, minute, self.offset_min);
        validate_instant(start)?;
        if start < now {
            return Err(EngineError::InThePast);
        }
        let span = Span::new(start, start + (duration_min as Ms) * MINUTE_MS);

        // Advisory pass under a read lock; a clean result here can still
        // lose the race below.
        {
            let day = self.day_handle(date);
            let guard = day.read().await;
            commit_conflict(&span, &guard)?;
        }

        // Commit section. Lock order: link, then day.
        let link = self
            .link_handle(&grant.link_id)
            .ok_or(EngineError::InvalidToken)?;
        let mut link_guard = link.write().await;
        if link_guard.status != LinkStatus::Active || link_guard.exhausted() {
            return Err(EngineError::InvalidToken);
        }

        let day = self.day_handle(date);
        let mut day_guard = day.write().await;
        if day_guard.interviews.len() >= MAX_INTERVIEWS_PER_DAY {
            return Err(EngineError::LimitExceeded("too many interviews on this day"));
        }
        commit_conflict(&span, &day_guard)?;

        let interview_id = Ulid::new();
        let code = confirmation_code();
        let booked = Event::InterviewBooked {
            id: interview_id,
            candidate_id: grant.candidate_id,
            kind: grant.kind,
            scheduled_at: start,
            duration_min,
            confirmation_code: code.clone(),
        };
        let consumed = Event::LinkConsumed { id: link_guard.id };
        self.wal_append(&booked).await?;
        self.wal_append(&consumed).await?;

        day_guard.insert(Interview {
            id: interview_id,
            candidate_id: grant.candidate_id,
            kind: grant.kind,
            scheduled_at: start,
            duration_min,
            status: InterviewStatus::Scheduled,
            confirmation_code: code.clone(),
            notes: None,
        });
        self.interview_day.insert(interview_id, date);
        link_guard.use_count += 1;
        if link_guard.exhausted() {
            link_guard.status = LinkStatus::Used;
        }
        self.notify.send(&booked);
        self.notify.send(&consumed);
        drop(day_guard);
        drop(link_guard);

        // Best-effort pipeline advance; the booking stands either way.
        let target = CandidateStatus::scheduled_state(grant.kind);
        if let Err(e) = self.advance_candidate(grant.candidate_id, target).await {
            warn!("status advance after booking {interview_id} failed: {e}");
        }

        metrics::counter!(crate::observability::BOOKINGS_COMMITTED_TOTAL).increment(1);
        Ok(BookingReceipt { interview_id, confirmation_code: code })
    }

    // ── Manual resolution ────────────────────────────────────────

    /// Operator resolution of a lapsed interview: reschedule (needs a
    /// new instant, re-checked for conflicts), or force one of the
    /// terminal outcomes.
    pub async fn resolve_interview(
        &self,
        id: Ulid,
        resolution: Resolution,
        notes: Option<String>,
        new_at: Option<Ms>,
        now: Ms,
    ) -> Result<InterviewStatus, EngineError> {
        if notes.as_deref().is_some_and(|n| n.len() > MAX_NOTES_LEN) {
            return Err(EngineError::LimitExceeded("notes too long"));
        }
        let date = self
            .interview_day
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(id))?;

        match resolution {
            Resolution::Rescheduled => {
                let new_at =
                    new_at.ok_or(EngineError::InvalidInput("reschedule requires a new time"))?;
                validate_instant(new_at)?;
                if new_at < now {
                    return Err(EngineError::InThePast);
                }
                self.reschedule(id, date, new_at, notes).await
            }
            Resolution::Completed | Resolution::Cancelled | Resolution::NoShow => {
                let status = match resolution {
                    Resolution::Completed => InterviewStatus::Completed,
                    Resolution::Cancelled => InterviewStatus::Cancelled,
                    _ => InterviewStatus::NoShow,
                };
                let day = self.day_handle(date);
                let mut guard = day.write().await;
                let interview = guard.get(id).ok_or(EngineError::NotFound(id))?;
                if interview.status != InterviewStatus::Lapsed {
                    return Err(EngineError::InvalidInput("interview is not lapsed"));
                }
                let event = Event::InterviewStatusChanged {
                    id,
                    status,
                    reason: notes.clone(),
                    rescheduled_at: None,
                };
                self.wal_append(&event).await?;
                if let Some(interview) = guard.get_mut(id) {
                    interview.status = status;
                    if notes.is_some() {
                        interview.notes = notes;
                    }
                }
                self.notify.send(&event);
                Ok(status)
            }
        }
    }

    async fn reschedule(
        &self,
        id: Ulid,
        old_date: NaiveDate,
        new_at: Ms,
        notes: Option<String>,
    ) -> Result<InterviewStatus, EngineError> {
        let new_date = local_date(new_at, self.offset_min);
        let old_day = self.day_handle(old_date);
        let new_day = self.day_handle(new_date);

        // Same day: one lock. Different days: chronological order.
        let (mut old_guard, mut new_guard) = if old_date == new_date {
            (old_day.write().await, None)
        } else if old_date < new_date {
            let o = old_day.write().await;
            let n = new_day.write().await;
            (o, Some(n))
        } else {
            let n = new_day.write().await;
            let o = old_day.write().await;
            (o, Some(n))
        };

        let interview = old_guard.get(id).ok_or(EngineError::NotFound(id))?;
        if interview.status != InterviewStatus::Lapsed {
            return Err(EngineError::InvalidInput("interview is not lapsed"));
        }
        let duration_min = interview.duration_min;
        let span = Span::new(new_at, new_at + (duration_min as Ms) * MINUTE_MS);
        match &new_guard {
            Some(n) => commit_conflict(&span, n)?,
            None => commit_conflict(&span, &old_guard)?,
        }

        let event = Event::InterviewStatusChanged {
            id,
            status: InterviewStatus::Scheduled,
            reason: notes.clone(),
            rescheduled_at: Some(new_at),
        };
        self.wal_append(&event).await?;

        let mut interview = old_guard.remove(id).expect("interview present under lock");
        interview.scheduled_at = new_at;
        interview.status = InterviewStatus::Scheduled;
        if notes.is_some() {
            interview.notes = notes;
        }
        match new_guard.as_mut() {
            Some(n) => n.insert(interview),
            None => old_guard.insert(interview),
        }
        self.interview_day.insert(id, new_date);
        self.notify.send(&event);
        Ok(InterviewStatus::Scheduled)
    }
}
