mod booking;
mod conflict;
mod error;
mod links;
mod queries;
mod slots;
mod sweeps;

pub use conflict::now_ms;
pub use error::EngineError;
pub use slots::{generate, DayPlan};
pub use sweeps::SweepReport;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use rand::Rng;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedDayBook = Arc<RwLock<DayBook>>;
pub type SharedLink = Arc<RwLock<BookingLink>>;
pub type SharedCandidate = Arc<RwLock<Candidate>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group
/// commit: block for the first append, drain whatever else is already
/// queued, one fsync for the whole batch, then answer every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── Engine ───────────────────────────────────────────────

/// One tenant's booking state: candidate directory slice, booking
/// links, and the per-day interview calendar, all WAL-backed.
///
/// Lock order, where more than one is held: link → day; two days in
/// chronological order; candidate locks never held across the others.
pub struct Engine {
    pub(super) days: DashMap<NaiveDate, SharedDayBook>,
    pub(super) links: DashMap<Ulid, SharedLink>,
    pub(super) candidates: DashMap<Ulid, SharedCandidate>,
    /// token hash → link id, for O(1) validation lookups.
    pub(super) token_index: DashMap<TokenHash, Ulid>,
    /// interview id → the date its DayBook lives under.
    pub(super) interview_day: DashMap<Ulid, NaiveDate>,
    pub(super) configs: RwLock<HashMap<BookingKind, AvailabilityConfig>>,
    pub(super) blocks: RwLock<BookingBlocks>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) offset_min: i32,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, offset_min: i32) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            days: DashMap::new(),
            links: DashMap::new(),
            candidates: DashMap::new(),
            token_index: DashMap::new(),
            interview_day: DashMap::new(),
            configs: RwLock::new(HashMap::new()),
            blocks: RwLock::new(BookingBlocks::default()),
            wal_tx,
            notify,
            offset_min,
        };

        // Replay — we're the sole owner of every Arc here, so try_write
        // always succeeds instantly. Never block_on inside an async
        // context (engines are created lazily per tenant).
        for event in &events {
            engine.apply_replay(event);
        }

        Ok(engine)
    }

    /// Apply one event to in-memory state. Only used during startup
    /// replay and therefore free of contention; the live paths mutate
    /// under their own locks.
    fn apply_replay(&self, event: &Event) {
        match event {
            Event::CandidateUpserted { id, first_name, status } => {
                let candidate =
                    Candidate { id: *id, first_name: first_name.clone(), status: *status };
                self.candidates.insert(*id, Arc::new(RwLock::new(candidate)));
            }
            Event::CandidateStatusChanged { id, status, .. } => {
                if let Some(entry) = self.candidates.get(id) {
                    let mut guard =
                        entry.value().try_write().expect("replay: uncontended write");
                    guard.status = *status;
                }
            }
            Event::ScheduleUpdated { kind, config } => {
                self.configs
                    .try_write()
                    .expect("replay: uncontended write")
                    .insert(*kind, config.clone());
            }
            Event::BlocksUpdated { blocks } => {
                *self.blocks.try_write().expect("replay: uncontended write") = blocks.clone();
            }
            Event::LinkCreated {
                id,
                token_hash,
                candidate_id,
                kind,
                duration_min,
                job,
                branch,
                expires_at,
                max_uses,
            } => {
                let link = BookingLink {
                    id: *id,
                    token_hash: *token_hash,
                    candidate_id: *candidate_id,
                    kind: *kind,
                    duration_min: *duration_min,
                    job: job.clone(),
                    branch: branch.clone(),
                    status: LinkStatus::Active,
                    expires_at: *expires_at,
                    max_uses: *max_uses,
                    use_count: 0,
                };
                self.token_index.insert(*token_hash, *id);
                self.links.insert(*id, Arc::new(RwLock::new(link)));
            }
            Event::LinkConsumed { id } => {
                if let Some(entry) = self.links.get(id) {
                    let mut guard =
                        entry.value().try_write().expect("replay: uncontended write");
                    guard.use_count += 1;
                    if guard.exhausted() {
                        guard.status = LinkStatus::Used;
                    }
                }
            }
            Event::LinkExpired { id } => {
                if let Some(entry) = self.links.get(id) {
                    entry.value().try_write().expect("replay: uncontended write").status =
                        LinkStatus::Expired;
                }
            }
            Event::LinkRevoked { id } => {
                if let Some(entry) = self.links.get(id) {
                    entry.value().try_write().expect("replay: uncontended write").status =
                        LinkStatus::Revoked;
                }
            }
            Event::InterviewBooked {
                id,
                candidate_id,
                kind,
                scheduled_at,
                duration_min,
                confirmation_code,
            } => {
                let interview = Interview {
                    id: *id,
                    candidate_id: *candidate_id,
                    kind: *kind,
                    scheduled_at: *scheduled_at,
                    duration_min: *duration_min,
                    status: InterviewStatus::Scheduled,
                    confirmation_code: confirmation_code.clone(),
                    notes: None,
                };
                let date = local_date(*scheduled_at, self.offset_min);
                let day = self.day_handle(date);
                day.try_write().expect("replay: uncontended write").insert(interview);
                self.interview_day.insert(*id, date);
            }
            Event::InterviewStatusChanged { id, status, reason, rescheduled_at } => {
                let Some(date) = self.interview_day.get(id).map(|e| *e.value()) else {
                    return;
                };
                let Some(day) = self.days.get(&date).map(|e| e.value().clone()) else {
                    return;
                };
                let mut guard = day.try_write().expect("replay: uncontended write");
                if let Some(new_at) = rescheduled_at {
                    if let Some(mut interview) = guard.remove(*id) {
                        interview.scheduled_at = *new_at;
                        interview.status = *status;
                        if reason.is_some() {
                            interview.notes = reason.clone();
                        }
                        drop(guard);
                        let new_date = local_date(*new_at, self.offset_min);
                        let new_day = self.day_handle(new_date);
                        new_day
                            .try_write()
                            .expect("replay: uncontended write")
                            .insert(interview);
                        self.interview_day.insert(*id, new_date);
                    }
                } else if let Some(interview) = guard.get_mut(*id) {
                    interview.status = *status;
                    if reason.is_some() {
                        interview.notes = reason.clone();
                    }
                }
            }
        }
    }

    /// Write an event to the WAL via the group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { event: event.clone(), response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub(super) fn day_handle(&self, date: NaiveDate) -> SharedDayBook {
        self.days
            .entry(date)
            .or_insert_with(|| Arc::new(RwLock::new(DayBook::new(date))))
            .value()
            .clone()
    }

    pub(super) fn link_handle(&self, id: &Ulid) -> Option<SharedLink> {
        self.links.get(id).map(|e| e.value().clone())
    }

    pub(super) fn candidate_handle(&self, id: &Ulid) -> Option<SharedCandidate> {
        self.candidates.get(id).map(|e| e.value().clone())
    }

    pub fn offset_min(&self) -> i32 {
        self.offset_min
    }

    /// Compact the WAL down to the events needed to recreate current
    /// state. Links replay as a creation followed by their consumed
    /// uses and final status, interviews as a booking plus their last
    /// transition.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        {
            let configs = self.configs.read().await;
            for (kind, config) in configs.iter() {
                events.push(Event::ScheduleUpdated { kind: *kind, config: config.clone() });
            }
        }
        {
            let blocks = self.blocks.read().await;
            if *blocks != BookingBlocks::default() {
                events.push(Event::BlocksUpdated { blocks: blocks.clone() });
            }
        }

        for entry in self.candidates.iter() {
            let guard = entry.value().try_read().expect("compact: uncontended read");
            events.push(Event::CandidateUpserted {
                id: guard.id,
                first_name: guard.first_name.clone(),
                status: guard.status,
            });
        }

        for entry in self.links.iter() {
            let guard = entry.value().try_read().expect("compact: uncontended read");
            events.push(Event::LinkCreated {
                id: guard.id,
                token_hash: guard.token_hash,
                candidate_id: guard.candidate_id,
                kind: guard.kind,
                duration_min: guard.duration_min,
                job: guard.job.clone(),
                branch: guard.branch.clone(),
                expires_at: guard.expires_at,
                max_uses: guard.max_uses,
            });
            for _ in 0..guard.use_count {
                events.push(Event::LinkConsumed { id: guard.id });
            }
            match guard.status {
                LinkStatus::Expired => events.push(Event::LinkExpired { id: guard.id }),
                LinkStatus::Revoked => events.push(Event::LinkRevoked { id: guard.id }),
                // Active is implied; Used falls out of the consumed count
                LinkStatus::Active | LinkStatus::Used => {}
            }
        }

        for entry in self.days.iter() {
            let guard = entry.value().try_read().expect("compact: uncontended read");
            for interview in &guard.interviews {
                events.push(Event::InterviewBooked {
                    id: interview.id,
                    candidate_id: interview.candidate_id,
                    kind: interview.kind,
                    scheduled_at: interview.scheduled_at,
                    duration_min: interview.duration_min,
                    confirmation_code: interview.confirmation_code.clone(),
                });
                if interview.status != InterviewStatus::Scheduled {
                    events.push(Event::InterviewStatusChanged {
                        id: interview.id,
                        status: interview.status,
                        reason: interview.notes.clone(),
                        rescheduled_at: None,
                    });
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Human-readable confirmation code: two letters, four digits.
/// Collision-tolerant by design — it is never used as a key.
pub(super) fn confirmation_code() -> String {
    let mut rng = rand::thread_rng();
    let letters: String = (0..2).map(|_| rng.gen_range(b'A'..=b'Z') as char).collect();
    let digits: u32 = rng.gen_range(0..10_000);
    format!("{letters}{digits:04}")
}
