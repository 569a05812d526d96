use tracing::{debug, warn};
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

/// How long a past-dated interview may sit unresolved before the sweep
/// stops assuming it happened and parks it as lapsed.
const OPTIMISTIC_COMPLETION_WINDOW_MS: Ms = 48 * HOUR_MS;

/// What one sweep run did. Re-running immediately must report all
/// zeros: every record only ever moves forward.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub completed: u64,
    pub lapsed: u64,
    pub resolved: u64,
    pub expired_links: u64,
    pub withdrawn: u64,
}

impl SweepReport {
    pub fn transitions(&self) -> u64 {
        self.completed + self.lapsed + self.resolved + self.expired_links + self.withdrawn
    }
}

impl Engine {
    /// Walk every open interview whose time has passed and drive it one
    /// step through the lifecycle machine:
    ///   candidate closed or moved past the appointment → resolved;
    ///   under 48h elapsed → optimistically completed (+ forward-only
    ///   pipeline advance);
    ///   otherwise → lapsed, awaiting resolution.
    pub async fn sweep_lapsed_interviews(&self, now: Ms) -> Result<SweepReport, EngineError> {
        let mut report = SweepReport::default();

        // Snapshot candidates first; each is then re-checked under its
        // day's write lock, so a booking landing mid-sweep is safe.
        let mut overdue: Vec<(Ulid, chrono::NaiveDate)> = Vec::new();
        for entry in self.days.iter() {
            if let Ok(guard) = entry.value().try_read() {
                for interview in &guard.interviews {
                    if interview.status.is_open() && interview.scheduled_at < now {
                        overdue.push((interview.id, guard.date));
                    }
                }
            }
        }

        for (id, date) in overdue {
            let Some(day) = self.days.get(&date).map(|e| e.value().clone()) else {
                continue;
            };
            let mut guard = day.write().await;
            let Some(interview) = guard.get(id) else { continue };
            // Re-check: another sweep or the reactive rule got here first
            if !interview.status.is_open() || interview.scheduled_at >= now {
                debug!("sweep skip {id}: already transitioned");
                continue;
            }

            let kind = interview.kind;
            let scheduled_at = interview.scheduled_at;
            let candidate_id = interview.candidate_id;

            let candidate_status = match self.candidate_handle(&candidate_id) {
                Some(c) => c.read().await.status,
                None => {
                    warn!("sweep: interview {id} has no candidate record");
                    continue;
                }
            };

            let holding = CandidateStatus::scheduled_state(kind);
            let (status, reason) = if candidate_status.is_terminal()
                || candidate_status.rank() > holding.rank()
            {
                // Never happened and never will, but nothing is wrong.
                (
                    InterviewStatus::Resolved,
                    Some(format!(
                        "auto-resolved: candidate status is {}",
                        candidate_status.as_str()
                    )),
                )
            } else if now - scheduled_at < OPTIMISTIC_COMPLETION_WINDOW_MS {
                (InterviewStatus::Completed, None)
            } else {
                (InterviewStatus::Lapsed, None)
            };

            let event = Event::InterviewStatusChanged {
                id,
                status,
                reason: reason.clone(),
                rescheduled_at: None,
            };
            self.wal_append(&event).await?;
            if let Some(interview) = guard.get_mut(id) {
                interview.status = status;
                if reason.is_some() {
                    interview.notes = reason;
                }
            }
            self.notify.send(&event);
            drop(guard);

            match status {
                InterviewStatus::Completed => {
                    report.completed += 1;
                    metrics::counter!(crate::observability::SWEEP_INTERVIEWS_COMPLETED_TOTAL)
                        .increment(1);
                    let target = CandidateStatus::completed_state(kind);
                    if let Err(e) = self.advance_candidate(candidate_id, target).await {
                        warn!("status advance after auto-completing {id} failed: {e}");
                    }
                }
                InterviewStatus::Lapsed => {
                    report.lapsed += 1;
                    metrics::counter!(crate::observability::SWEEP_INTERVIEWS_LAPSED_TOTAL)
                        .increment(1);
                }
                _ => {
                    report.resolved += 1;
                    metrics::counter!(crate::observability::SWEEP_INTERVIEWS_RESOLVED_TOTAL)
                        .increment(1);
                }
            }
        }

        Ok(report)
    }

    /// Expire overdue active links, and withdraw candidates who were
    /// invited but never booked. The invitation-side cousin of the
    /// interview sweep.
    pub async fn sweep_expired_links(&self, now: Ms) -> Result<SweepReport, EngineError> {
        let mut report = SweepReport::default();

        let candidates: Vec<Ulid> = self
            .links
            .iter()
            .filter_map(|entry| {
                entry.value().try_read().ok().and_then(|l| {
                    (l.status == LinkStatus::Active && l.expires_at <= now).then_some(l.id)
                })
            })
            .collect();

        for link_id in candidates {
            let Some(link) = self.link_handle(&link_id) else { continue };
            let mut guard = link.write().await;
            // Re-check under the lock; a concurrent validation may have
            // expired it already.
            if guard.status != LinkStatus::Active || guard.expires_at > now {
                debug!("link sweep skip {link_id}: already transitioned");
                continue;
            }

            let event = Event::LinkExpired { id: link_id };
            self.wal_append(&event).await?;
            guard.status = LinkStatus::Expired;
            self.notify.send(&event);
            let candidate_id = guard.candidate_id;
            drop(guard);

            report.expired_links += 1;
            metrics::counter!(crate::observability::SWEEP_LINKS_EXPIRED_TOTAL).increment(1);

            let waiting = match self.candidate_handle(&candidate_id) {
                Some(c) => c.read().await.status.is_waiting_to_book(),
                None => false,
            };
            if waiting {
                let reason = Some("withdrawn: booking link expired without use".to_string());
                match self
                    .set_candidate_status(candidate_id, CandidateStatus::Withdrawn, reason)
                    .await
                {
                    Ok(()) => {
                        report.withdrawn += 1;
                        metrics::counter!(
                            crate::observability::SWEEP_CANDIDATES_WITHDRAWN_TOTAL
                        )
                        .increment(1);
                    }
                    Err(e) => warn!("withdraw after link {link_id} expiry failed: {e}"),
                }
            }
        }

        Ok(report)
    }
}
