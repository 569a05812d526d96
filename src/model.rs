use std::collections::BTreeSet;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Timelike, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only instant type.
pub type Ms = i64;

/// Minutes since local midnight.
pub type MinuteOfDay = i32;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 3_600_000;

/// Fixed duration for trial bookings, in minutes. Interviews take theirs
/// from config or the link override.
pub const TRIAL_DURATION_MIN: u32 = 240;

/// Open-interview count at which a whole day is reported as fully booked.
pub const FULLY_BOOKED_THRESHOLD: usize = 8;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// The same interval widened by `buffer` on both sides. Used only for
    /// the advisory listing-time conflict test, never stored.
    pub fn padded(&self, buffer: Ms) -> Span {
        Span::new(self.start - buffer, self.end + buffer)
    }
}

// ── Wall-clock conversion ────────────────────────────────────────
//
// The engine runs in one configured fixed offset from UTC. All civil
// math (weekday, date boundaries, "HH:MM") goes through these.

pub fn local_civil(at: Ms, offset_min: i32) -> NaiveDateTime {
    let utc = DateTime::from_timestamp_millis(at)
        .unwrap_or_else(|| DateTime::from_timestamp_millis(0).unwrap());
    (utc + Duration::minutes(offset_min as i64)).naive_utc()
}

pub fn local_date(at: Ms, offset_min: i32) -> NaiveDate {
    local_civil(at, offset_min).date()
}

pub fn local_minute(at: Ms, offset_min: i32) -> MinuteOfDay {
    let t = local_civil(at, offset_min).time();
    (t.hour() * 60 + t.minute()) as MinuteOfDay
}

/// Instant of `date` at `minute` past local midnight.
pub fn instant_at(date: NaiveDate, minute: MinuteOfDay, offset_min: i32) -> Ms {
    let midnight = date.and_hms_opt(0, 0, 0).expect("midnight is valid");
    midnight.and_utc().timestamp_millis() + (minute as Ms) * MINUTE_MS
        - (offset_min as Ms) * MINUTE_MS
}

/// Parse `"HH:MM"` into minutes-of-day. Rejects out-of-range fields.
pub fn parse_hhmm(s: &str) -> Option<MinuteOfDay> {
    let (h, m) = s.split_once(':')?;
    if h.len() != 2 || m.len() != 2 {
        return None;
    }
    let h: i32 = h.parse().ok()?;
    let m: i32 = m.parse().ok()?;
    if !(0..24).contains(&h) || !(0..60).contains(&m) {
        return None;
    }
    Some(h * 60 + m)
}

pub fn format_hhmm(minute: MinuteOfDay) -> String {
    format!("{:02}:{:02}", minute / 60, minute % 60)
}

// ── Booking kinds ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingKind {
    Interview,
    Trial,
}

impl BookingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingKind::Interview => "interview",
            BookingKind::Trial => "trial",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "interview" => Some(BookingKind::Interview),
            "trial" => Some(BookingKind::Trial),
            _ => None,
        }
    }

    /// Effective appointment length. Trials are always 240 minutes; the
    /// link override and config only apply to interviews.
    pub fn resolve_duration(&self, link_override: Option<u32>, config: &AvailabilityConfig) -> u32 {
        match self {
            BookingKind::Trial => TRIAL_DURATION_MIN,
            BookingKind::Interview => link_override.unwrap_or(config.slot_duration_min),
        }
    }
}

// ── Availability configuration ───────────────────────────────────

/// One bookable window within a day, half-open over minutes-of-day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayWindow {
    pub start: MinuteOfDay,
    pub end: MinuteOfDay,
}

impl DayWindow {
    pub fn overlaps_minutes(&self, start: MinuteOfDay, end: MinuteOfDay) -> bool {
        start < self.end && self.start < end
    }
}

// Windows travel as {"start": "09:00", "end": "17:00"} on the wire and
// in the WAL, so (de)serialization goes through the HH:MM form.
impl Serialize for DayWindow {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Raw {
            start: String,
            end: String,
        }
        Raw {
            start: format_hhmm(self.start),
            end: format_hhmm(self.end),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DayWindow {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            start: String,
            end: String,
        }
        let raw = Raw::deserialize(deserializer)?;
        let start = parse_hhmm(&raw.start)
            .ok_or_else(|| serde::de::Error::custom(format!("bad time: {}", raw.start)))?;
        let end = parse_hhmm(&raw.end)
            .ok_or_else(|| serde::de::Error::custom(format!("bad time: {}", raw.end)))?;
        Ok(DayWindow { start, end })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaySchedule {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub windows: Vec<DayWindow>,
}

impl DaySchedule {
    pub fn open(windows: Vec<DayWindow>) -> Self {
        Self { enabled: true, windows }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeekSchedule {
    #[serde(default)]
    pub monday: DaySchedule,
    #[serde(default)]
    pub tuesday: DaySchedule,
    #[serde(default)]
    pub wednesday: DaySchedule,
    #[serde(default)]
    pub thursday: DaySchedule,
    #[serde(default)]
    pub friday: DaySchedule,
    #[serde(default)]
    pub saturday: DaySchedule,
    #[serde(default)]
    pub sunday: DaySchedule,
}

impl WeekSchedule {
    pub fn day(&self, weekday: Weekday) -> &DaySchedule {
        match weekday {
            Weekday::Mon => &self.monday,
            Weekday::Tue => &self.tuesday,
            Weekday::Wed => &self.wednesday,
            Weekday::Thu => &self.thursday,
            Weekday::Fri => &self.friday,
            Weekday::Sat => &self.saturday,
            Weekday::Sun => &self.sunday,
        }
    }

    pub fn days(&self) -> [&DaySchedule; 7] {
        [
            &self.monday,
            &self.tuesday,
            &self.wednesday,
            &self.thursday,
            &self.friday,
            &self.saturday,
            &self.sunday,
        ]
    }

    /// Monday through Friday, 09:00–17:00.
    pub fn weekdays_nine_to_five() -> Self {
        let open = || DaySchedule::open(vec![DayWindow { start: 9 * 60, end: 17 * 60 }]);
        Self {
            monday: open(),
            tuesday: open(),
            wednesday: open(),
            thursday: open(),
            friday: open(),
            saturday: DaySchedule::default(),
            sunday: DaySchedule::default(),
        }
    }
}

fn default_slot_duration() -> u32 {
    30
}
fn default_buffer() -> u32 {
    15
}
fn default_advance_days() -> u32 {
    30
}
fn default_min_notice_hours() -> u32 {
    24
}

/// Recruiter-configured availability for one booking kind. Every field
/// has a fixed fallback so listing keeps working with no stored config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityConfig {
    #[serde(default = "WeekSchedule::weekdays_nine_to_five")]
    pub schedule: WeekSchedule,
    #[serde(default = "default_slot_duration")]
    pub slot_duration_min: u32,
    #[serde(default = "default_buffer")]
    pub buffer_min: u32,
    #[serde(default = "default_advance_days")]
    pub advance_booking_days: u32,
    #[serde(default = "default_min_notice_hours")]
    pub min_notice_hours: u32,
}

impl Default for AvailabilityConfig {
    fn default() -> Self {
        Self {
            schedule: WeekSchedule::weekdays_nine_to_five(),
            slot_duration_min: default_slot_duration(),
            buffer_min: default_buffer(),
            advance_booking_days: default_advance_days(),
            min_notice_hours: default_min_notice_hours(),
        }
    }
}

impl AvailabilityConfig {
    /// Config-write validation: positive slot duration; per-day windows
    /// well-formed, ordered, and non-overlapping.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.slot_duration_min == 0 {
            return Err("slot duration must be positive");
        }
        for day in self.schedule.days() {
            let mut prev_end: MinuteOfDay = -1;
            for w in &day.windows {
                if w.start >= w.end {
                    return Err("window start must be before end");
                }
                if w.start < prev_end {
                    return Err("windows within a day must not overlap");
                }
                prev_end = w.end;
            }
        }
        Ok(())
    }
}

/// Tenant-wide blocks shared by both booking kinds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingBlocks {
    #[serde(default)]
    pub bank_holidays: BTreeSet<NaiveDate>,
    #[serde(default)]
    pub lunch: Option<DayWindow>,
}

// ── Candidate directory slice ────────────────────────────────────

/// Pipeline position, strictly ordered; status only moves forward
/// except for the explicit terminal exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStatus {
    InviteSent,
    InterviewScheduled,
    InterviewComplete,
    TrialInviteSent,
    TrialScheduled,
    TrialComplete,
    Offered,
    Hired,
    Rejected,
    Withdrawn,
}

impl CandidateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateStatus::InviteSent => "invite_sent",
            CandidateStatus::InterviewScheduled => "interview_scheduled",
            CandidateStatus::InterviewComplete => "interview_complete",
            CandidateStatus::TrialInviteSent => "trial_invite_sent",
            CandidateStatus::TrialScheduled => "trial_scheduled",
            CandidateStatus::TrialComplete => "trial_complete",
            CandidateStatus::Offered => "offered",
            CandidateStatus::Hired => "hired",
            CandidateStatus::Rejected => "rejected",
            CandidateStatus::Withdrawn => "withdrawn",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "invite_sent" => CandidateStatus::InviteSent,
            "interview_scheduled" => CandidateStatus::InterviewScheduled,
            "interview_complete" => CandidateStatus::InterviewComplete,
            "trial_invite_sent" => CandidateStatus::TrialInviteSent,
            "trial_scheduled" => CandidateStatus::TrialScheduled,
            "trial_complete" => CandidateStatus::TrialComplete,
            "offered" => CandidateStatus::Offered,
            "hired" => CandidateStatus::Hired,
            "rejected" => CandidateStatus::Rejected,
            "withdrawn" => CandidateStatus::Withdrawn,
            _ => return None,
        })
    }

    /// Position in the forward pipeline. Terminal exits sort last so a
    /// forward-only advance can never resurrect a closed candidate.
    pub fn rank(&self) -> u8 {
        match self {
            CandidateStatus::InviteSent => 0,
            CandidateStatus::InterviewScheduled => 1,
            CandidateStatus::InterviewComplete => 2,
            CandidateStatus::TrialInviteSent => 3,
            CandidateStatus::TrialScheduled => 4,
            CandidateStatus::TrialComplete => 5,
            CandidateStatus::Offered => 6,
            CandidateStatus::Hired => 7,
            CandidateStatus::Rejected => 8,
            CandidateStatus::Withdrawn => 9,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CandidateStatus::Hired | CandidateStatus::Rejected | CandidateStatus::Withdrawn
        )
    }

    /// Still holding an unredeemed booking link.
    pub fn is_waiting_to_book(&self) -> bool {
        matches!(self, CandidateStatus::InviteSent | CandidateStatus::TrialInviteSent)
    }

    /// The holding state a candidate sits in while this appointment kind
    /// is on the calendar.
    pub fn scheduled_state(kind: BookingKind) -> Self {
        match kind {
            BookingKind::Interview => CandidateStatus::InterviewScheduled,
            BookingKind::Trial => CandidateStatus::TrialScheduled,
        }
    }

    pub fn completed_state(kind: BookingKind) -> Self {
        match kind {
            BookingKind::Interview => CandidateStatus::InterviewComplete,
            BookingKind::Trial => CandidateStatus::TrialComplete,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: Ulid,
    pub first_name: String,
    pub status: CandidateStatus,
}

// ── Booking links ────────────────────────────────────────────────

pub type TokenHash = [u8; 32];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Active,
    Used,
    Expired,
    Revoked,
}

impl LinkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkStatus::Active => "active",
            LinkStatus::Used => "used",
            LinkStatus::Expired => "expired",
            LinkStatus::Revoked => "revoked",
        }
    }
}

/// Capability granting one candidate the right to self-schedule one
/// appointment kind. Identified by the hash of a secret the caller was
/// handed exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingLink {
    pub id: Ulid,
    pub token_hash: TokenHash,
    pub candidate_id: Ulid,
    pub kind: BookingKind,
    pub duration_min: Option<u32>,
    pub job: Option<String>,
    pub branch: Option<String>,
    pub status: LinkStatus,
    pub expires_at: Ms,
    pub max_uses: u32,
    pub use_count: u32,
}

impl BookingLink {
    pub fn exhausted(&self) -> bool {
        self.use_count >= self.max_uses
    }
}

// ── Interviews ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterviewStatus {
    Scheduled,
    Confirmed,
    Completed,
    Cancelled,
    NoShow,
    Lapsed,
    Resolved,
}

impl InterviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterviewStatus::Scheduled => "scheduled",
            InterviewStatus::Confirmed => "confirmed",
            InterviewStatus::Completed => "completed",
            InterviewStatus::Cancelled => "cancelled",
            InterviewStatus::NoShow => "no_show",
            InterviewStatus::Lapsed => "lapsed",
            InterviewStatus::Resolved => "resolved",
        }
    }

    /// Still occupying its slot on the calendar.
    pub fn is_open(&self) -> bool {
        matches!(self, InterviewStatus::Scheduled | InterviewStatus::Confirmed)
    }
}

/// Operator resolution for a lapsed interview.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Rescheduled,
    Completed,
    Cancelled,
    NoShow,
}

impl Resolution {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "rescheduled" => Resolution::Rescheduled,
            "completed" => Resolution::Completed,
            "cancelled" => Resolution::Cancelled,
            "no_show" => Resolution::NoShow,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interview {
    pub id: Ulid,
    pub candidate_id: Ulid,
    pub kind: BookingKind,
    pub scheduled_at: Ms,
    pub duration_min: u32,
    pub status: InterviewStatus,
    pub confirmation_code: String,
    pub notes: Option<String>,
}

impl Interview {
    /// Raw booked interval. Buffer is applied by the conflict test only.
    pub fn span(&self) -> Span {
        Span::new(
            self.scheduled_at,
            self.scheduled_at + (self.duration_min as Ms) * MINUTE_MS,
        )
    }
}

/// All interviews that start on one local calendar date, sorted by
/// start time. The per-day write lock around this is the serialization
/// unit for booking commits.
#[derive(Debug, Clone)]
pub struct DayBook {
    pub date: NaiveDate,
    pub interviews: Vec<Interview>,
}

impl DayBook {
    pub fn new(date: NaiveDate) -> Self {
        Self { date, interviews: Vec::new() }
    }

    /// Insert keeping sort order by scheduled_at.
    pub fn insert(&mut self, interview: Interview) {
        let pos = self
            .interviews
            .partition_point(|i| i.scheduled_at <= interview.scheduled_at);
        self.interviews.insert(pos, interview);
    }

    pub fn get(&self, id: Ulid) -> Option<&Interview> {
        self.interviews.iter().find(|i| i.id == id)
    }

    pub fn get_mut(&mut self, id: Ulid) -> Option<&mut Interview> {
        self.interviews.iter_mut().find(|i| i.id == id)
    }

    pub fn remove(&mut self, id: Ulid) -> Option<Interview> {
        let pos = self.interviews.iter().position(|i| i.id == id)?;
        Some(self.interviews.remove(pos))
    }

    pub fn open_count(&self) -> usize {
        self.interviews.iter().filter(|i| i.status.is_open()).count()
    }
}

// ── WAL events ───────────────────────────────────────────────────

/// The event types — flat, no nesting. This is the WAL record format
/// and the notification payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    CandidateUpserted {
        id: Ulid,
        first_name: String,
        status: CandidateStatus,
    },
    CandidateStatusChanged {
        id: Ulid,
        status: CandidateStatus,
        reason: Option<String>,
    },
    ScheduleUpdated {
        kind: BookingKind,
        config: AvailabilityConfig,
    },
    BlocksUpdated {
        blocks: BookingBlocks,
    },
    LinkCreated {
        id: Ulid,
        token_hash: TokenHash,
        candidate_id: Ulid,
        kind: BookingKind,
        duration_min: Option<u32>,
        job: Option<String>,
        branch: Option<String>,
        expires_at: Ms,
        max_uses: u32,
    },
    LinkConsumed {
        id: Ulid,
    },
    LinkExpired {
        id: Ulid,
    },
    LinkRevoked {
        id: Ulid,
    },
    InterviewBooked {
        id: Ulid,
        candidate_id: Ulid,
        kind: BookingKind,
        scheduled_at: Ms,
        duration_min: u32,
        confirmation_code: String,
    },
    InterviewStatusChanged {
        id: Ulid,
        status: InterviewStatus,
        reason: Option<String>,
        rescheduled_at: Option<Ms>,
    },
}

impl Event {
    /// Candidate a notification about this event should be addressed to.
    pub fn candidate_id(&self) -> Option<Ulid> {
        match self {
            Event::CandidateUpserted { id, .. } | Event::CandidateStatusChanged { id, .. } => {
                Some(*id)
            }
            Event::LinkCreated { candidate_id, .. }
            | Event::InterviewBooked { candidate_id, .. } => Some(*candidate_id),
            _ => None,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotReason {
    TooShortNotice,
    AlreadyBooked,
    Lunch,
}

impl SlotReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotReason::TooShortNotice => "too short notice",
            SlotReason::AlreadyBooked => "already booked",
            SlotReason::Lunch => "lunch",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub start_minute: MinuteOfDay,
    pub available: bool,
    pub reason: Option<SlotReason>,
}

/// Slot listing for one date: either a fully blocked day or the
/// annotated candidate slots (possibly empty).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaySlots {
    Blocked { reason: &'static str },
    Open { slots: Vec<Slot> },
}

/// What a validated token exposes to the public booking surface —
/// minimized; never the hash, never the full candidate record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkGrant {
    pub link_id: Ulid,
    pub candidate_id: Ulid,
    pub first_name: String,
    pub kind: BookingKind,
    pub duration_min: u32,
    pub job: Option<String>,
    pub branch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingReceipt {
    pub interview_id: Ulid,
    pub confirmation_code: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AvailabilitySummary {
    pub kind: BookingKind,
    pub first_name: String,
    pub schedule: WeekSchedule,
    pub slot_duration_min: u32,
    pub buffer_min: u32,
    pub advance_booking_days: u32,
    pub min_notice_hours: u32,
    pub fully_booked_dates: Vec<NaiveDate>,
    pub blocked_dates: Vec<NaiveDate>,
    pub lunch: Option<DayWindow>,
}
