use std::fmt;
use std::str::FromStr;

use chrono::{Days, Duration, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::device::DeviceId;
use crate::limits::ATTENDANCE_WINDOW_MINUTES;

pub const MINUTES_PER_DAY: u32 = 1440;

/// Offsets tried when comparing windows on the circular day.
const DAY_SHIFTS: [i64; 3] = [-(MINUTES_PER_DAY as i64), 0, MINUTES_PER_DAY as i64];

// ── Interval arithmetic ──────────────────────────────────────────

/// Minutes since midnight, always `< 1440`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeOfDay(u16);

impl TimeOfDay {
    pub fn from_hm(hour: u32, minute: u32) -> Result<Self, ParseError> {
        if hour > 23 || minute > 59 {
            return Err(ParseError::TimeOfDay(format!("{hour}:{minute}")));
        }
        Ok(Self((hour * 60 + minute) as u16))
    }

    /// Parse `"HH:MM"` (a single-digit hour is accepted).
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let bad = || ParseError::TimeOfDay(s.to_string());
        let (h, m) = s.trim().split_once(':').ok_or_else(bad)?;
        if h.is_empty() || h.len() > 2 || m.len() != 2 {
            return Err(bad());
        }
        let hour: u32 = h.parse().map_err(|_| bad())?;
        let minute: u32 = m.parse().map_err(|_| bad())?;
        Self::from_hm(hour, minute).map_err(|_| bad())
    }

    /// The comparable scalar: minutes since midnight.
    pub fn minutes(self) -> u32 {
        self.0 as u32
    }

    pub fn to_naive_time(self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.minutes() / 60, self.minutes() % 60, 0)
            .unwrap_or(NaiveTime::MIN)
    }

    pub fn on(self, date: NaiveDate) -> NaiveDateTime {
        date.and_time(self.to_naive_time())
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

impl FromStr for TimeOfDay {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Half-open time-of-day window `[start, end)` on a single date.
/// `end < start` means the window runs past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Window {
    pub start: TimeOfDay,
    pub end: TimeOfDay,
}

impl Window {
    pub fn new(start: TimeOfDay, end: TimeOfDay) -> Result<Self, ParseError> {
        if start == end {
            return Err(ParseError::EmptyWindow(start));
        }
        Ok(Self { start, end })
    }

    pub fn parse(start: &str, end: &str) -> Result<Self, ParseError> {
        Self::new(TimeOfDay::parse(start)?, TimeOfDay::parse(end)?)
    }

    pub fn wraps(&self) -> bool {
        self.end < self.start
    }

    /// Scalar bounds, with the end pushed past 1440 for windows that wrap.
    pub fn bounds(&self) -> (i64, i64) {
        let start = self.start.minutes() as i64;
        let mut end = self.end.minutes() as i64;
        if end < start {
            end += MINUTES_PER_DAY as i64;
        }
        (start, end)
    }

    pub fn duration_minutes(&self) -> i64 {
        let (start, end) = self.bounds();
        end - start
    }

    /// True if the windows share at least one minute. Back-to-back windows don't.
    pub fn overlaps(&self, other: &Window) -> bool {
        let (a_start, a_end) = self.bounds();
        let (b_start, b_end) = other.bounds();
        DAY_SHIFTS
            .iter()
            .any(|shift| a_start < b_end + shift && b_start + shift < a_end)
    }

    /// True if `inner` lies entirely within `self`. A window contains itself.
    pub fn contains(&self, inner: &Window) -> bool {
        let (o_start, o_end) = self.bounds();
        let (i_start, i_end) = inner.bounds();
        DAY_SHIFTS
            .iter()
            .any(|shift| i_start + shift >= o_start && i_end + shift <= o_end)
    }

    pub fn starts_at(&self, date: NaiveDate) -> NaiveDateTime {
        self.start.on(date)
    }

    pub fn ends_at(&self, date: NaiveDate) -> NaiveDateTime {
        self.starts_at(date) + Duration::minutes(self.duration_minutes())
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

pub fn parse_date(s: &str) -> Result<NaiveDate, ParseError> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|_| ParseError::Date(s.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid time of day {0:?}, expected HH:MM")]
    TimeOfDay(String),
    #[error("invalid date {0:?}, expected YYYY-MM-DD")]
    Date(String),
    #[error("empty window: start and end are both {0}")]
    EmptyWindow(TimeOfDay),
    #[error("unknown status {0:?}")]
    Status(String),
    #[error("invalid device id {0:?}")]
    Device(String),
    #[error("status {status} disagrees with current break ({has_break})")]
    BreakMismatch { status: BookingStatus, has_break: bool },
}

// ── Seats ────────────────────────────────────────────────────────

/// Cached occupancy projection. Bookings are the source of truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeatStatus {
    Available,
    Occupied,
    Maintenance,
    OnBreak,
}

impl SeatStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeatStatus::Available => "available",
            SeatStatus::Occupied => "occupied",
            SeatStatus::Maintenance => "maintenance",
            SeatStatus::OnBreak => "on-break",
        }
    }
}

impl fmt::Display for SeatStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seat {
    pub id: Ulid,
    pub building: String,
    pub floor: String,
    pub section: String,
    pub number: String,
}

/// Seat filter used by listings and the availability projection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeatFilter {
    pub building: Option<String>,
    pub floor: Option<String>,
    pub section: Option<String>,
}

impl SeatFilter {
    pub fn matches(&self, seat: &Seat) -> bool {
        self.building.as_ref().is_none_or(|b| *b == seat.building)
            && self.floor.as_ref().is_none_or(|f| *f == seat.floor)
            && self.section.as_ref().is_none_or(|s| *s == seat.section)
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveBreak {
    pub window: Window,
    pub started_at: NaiveDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosedBreak {
    pub window: Window,
    pub taken_at: NaiveDateTime,
}

/// Closed breaks in the order they ended. Entries are never edited.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BreakLog(Vec<ClosedBreak>);

impl BreakLog {
    pub(crate) fn push(&mut self, entry: ClosedBreak) {
        self.0.push(entry);
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClosedBreak> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn overlapping(&self, window: &Window) -> Option<&ClosedBreak> {
        self.0.iter().find(|b| b.window.overlaps(window))
    }
}

impl FromIterator<ClosedBreak> for BreakLog {
    fn from_iter<I: IntoIterator<Item = ClosedBreak>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Where a booking is in its lifecycle. The active break lives inside
/// `OnBreak`, so status and break can't disagree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingState {
    Pending,
    Confirmed,
    OnBreak(ActiveBreak),
    Cancelled { reason: Option<String> },
    Completed,
}

/// Flat status as stored and shown on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    OnBreak,
    Cancelled,
    Completed,
    /// Reserved. Nothing transitions into it.
    Expired,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::OnBreak => "on-break",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Completed => "completed",
            BookingStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BookingStatus::Pending),
            "confirmed" => Ok(BookingStatus::Confirmed),
            "on-break" => Ok(BookingStatus::OnBreak),
            "cancelled" => Ok(BookingStatus::Cancelled),
            "completed" => Ok(BookingStatus::Completed),
            "expired" => Ok(BookingStatus::Expired),
            other => Err(ParseError::Status(other.to_string())),
        }
    }
}

impl BookingState {
    pub fn status(&self) -> BookingStatus {
        match self {
            BookingState::Pending => BookingStatus::Pending,
            BookingState::Confirmed => BookingStatus::Confirmed,
            BookingState::OnBreak(_) => BookingStatus::OnBreak,
            BookingState::Cancelled { .. } => BookingStatus::Cancelled,
            BookingState::Completed => BookingStatus::Completed,
        }
    }

    /// Pending, confirmed or on break.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            BookingState::Pending | BookingState::Confirmed | BookingState::OnBreak(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Booking {
    pub id: Ulid,
    pub seat_id: Ulid,
    pub member_id: String,
    pub device_id: DeviceId,
    pub date: NaiveDate,
    pub window: Window,
    pub state: BookingState,
    pub attendance_confirmed_at: Option<NaiveDateTime>,
    pub breaks: BreakLog,
    pub created_at: NaiveDateTime,
    pub completed_at: Option<NaiveDateTime>,
    pub cancelled_at: Option<NaiveDateTime>,
}

impl Booking {
    pub fn status(&self) -> BookingStatus {
        self.state.status()
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn current_break(&self) -> Option<&ActiveBreak> {
        match &self.state {
            BookingState::OnBreak(active) => Some(active),
            _ => None,
        }
    }

    pub fn attendance_confirmed(&self) -> bool {
        self.attendance_confirmed_at.is_some()
    }

    pub fn cancellation_reason(&self) -> Option<&str> {
        match &self.state {
            BookingState::Cancelled { reason } => reason.as_deref(),
            _ => None,
        }
    }

    pub fn starts_at(&self) -> NaiveDateTime {
        self.window.starts_at(self.date)
    }

    /// Wall-clock end of the slot; the following day for windows that wrap.
    pub fn ends_at(&self) -> NaiveDateTime {
        self.window.ends_at(self.date)
    }

    /// Last instant at which attendance may still be confirmed.
    pub fn attendance_deadline(&self) -> NaiveDateTime {
        self.starts_at() + Duration::minutes(ATTENDANCE_WINDOW_MINUTES)
    }

    /// Wall-clock end of a break taken during this booking. A break that
    /// starts before the booking's own start time-of-day sits after midnight.
    pub fn break_ends_at(&self, window: &Window) -> NaiveDateTime {
        let date = if window.start < self.window.start {
            self.date.checked_add_days(Days::new(1)).unwrap_or(self.date)
        } else {
            self.date
        };
        window.ends_at(date)
    }
}

/// A seat and every booking ever made on it, sorted by `(date, start)`.
#[derive(Debug, Clone)]
pub struct SeatState {
    pub seat: Seat,
    pub status: SeatStatus,
    pub bookings: Vec<Booking>,
}

impl SeatState {
    pub fn new(seat: Seat) -> Self {
        Self {
            seat,
            status: SeatStatus::Available,
            bookings: Vec::new(),
        }
    }

    pub fn id(&self) -> Ulid {
        self.seat.id
    }

    /// Insert booking maintaining sort order by (date, start).
    pub fn insert_booking(&mut self, booking: Booking) {
        let key = (booking.date, booking.window.start);
        let pos = self
            .bookings
            .binary_search_by_key(&key, |b| (b.date, b.window.start))
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    pub fn booking_mut(&mut self, id: &Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == *id)
    }

    /// Active bookings on `date`.
    pub fn active_on(&self, date: NaiveDate) -> impl Iterator<Item = &Booking> {
        let from = self.bookings.partition_point(|b| b.date < date);
        self.bookings[from..]
            .iter()
            .take_while(move |b| b.date == date)
            .filter(|b| b.is_active())
    }

    /// Flip the cached status. Maintenance is only lifted explicitly.
    pub fn project_status(&mut self, status: SeatStatus) {
        if self.status != SeatStatus::Maintenance {
            self.status = status;
        }
    }
}

// ── WAL events ───────────────────────────────────────────────────

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SeatCreated {
        seat: Seat,
    },
    SeatStatusChanged {
        seat_id: Ulid,
        status: SeatStatus,
    },
    BookingCreated {
        id: Ulid,
        seat_id: Ulid,
        member_id: String,
        device_id: DeviceId,
        date: NaiveDate,
        window: Window,
        created_at: NaiveDateTime,
    },
    AttendanceConfirmed {
        id: Ulid,
        seat_id: Ulid,
        at: NaiveDateTime,
    },
    BreakStarted {
        id: Ulid,
        seat_id: Ulid,
        window: Window,
        started_at: NaiveDateTime,
    },
    BreakEnded {
        id: Ulid,
        seat_id: Ulid,
        forced: bool,
    },
    BookingCancelled {
        id: Ulid,
        seat_id: Ulid,
        reason: Option<String>,
        at: NaiveDateTime,
    },
    BookingCompleted {
        id: Ulid,
        seat_id: Ulid,
        at: NaiveDateTime,
    },
    /// Full snapshot written by compaction.
    BookingRestored {
        row: BookingRow,
    },
}

impl Event {
    /// The seat an event applies to.
    pub fn seat_id(&self) -> Ulid {
        match self {
            Event::SeatCreated { seat } => seat.id,
            Event::BookingRestored { row } => row.seat_id,
            Event::SeatStatusChanged { seat_id, .. }
            | Event::BookingCreated { seat_id, .. }
            | Event::AttendanceConfirmed { seat_id, .. }
            | Event::BreakStarted { seat_id, .. }
            | Event::BreakEnded { seat_id, .. }
            | Event::BookingCancelled { seat_id, .. }
            | Event::BookingCompleted { seat_id, .. } => *seat_id,
        }
    }
}

// ── Legacy row shape ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentBreakRecord {
    pub start_time: String,
    pub end_time: String,
    pub started_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakRecord {
    pub start_time: String,
    pub end_time: String,
    pub taken_at: NaiveDateTime,
}

/// A booking flattened to `status` + `currentBreak`, the shape used in the
/// WAL snapshot and on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingRow {
    pub id: Ulid,
    pub seat_id: Ulid,
    pub member_id: String,
    pub device_id: String,
    pub date: NaiveDate,
    pub start_time: String,
    pub end_time: String,
    pub status: BookingStatus,
    pub attendance_confirmed: bool,
    pub attendance_confirmed_at: Option<NaiveDateTime>,
    pub current_break: Option<CurrentBreakRecord>,
    pub breaks: Vec<BreakRecord>,
    pub cancellation_reason: Option<String>,
    pub created_at: NaiveDateTime,
    pub completed_at: Option<NaiveDateTime>,
    pub cancelled_at: Option<NaiveDateTime>,
}

impl From<&Booking> for BookingRow {
    fn from(b: &Booking) -> Self {
        BookingRow {
            id: b.id,
            seat_id: b.seat_id,
            member_id: b.member_id.clone(),
            device_id: b.device_id.as_str().to_string(),
            date: b.date,
            start_time: b.window.start.to_string(),
            end_time: b.window.end.to_string(),
            status: b.status(),
            attendance_confirmed: b.attendance_confirmed(),
            attendance_confirmed_at: b.attendance_confirmed_at,
            current_break: b.current_break().map(|active| CurrentBreakRecord {
                start_time: active.window.start.to_string(),
                end_time: active.window.end.to_string(),
                started_at: active.started_at,
            }),
            breaks: b
                .breaks
                .iter()
                .map(|closed| BreakRecord {
                    start_time: closed.window.start.to_string(),
                    end_time: closed.window.end.to_string(),
                    taken_at: closed.taken_at,
                })
                .collect(),
            cancellation_reason: b.cancellation_reason().map(str::to_string),
            created_at: b.created_at,
            completed_at: b.completed_at,
            cancelled_at: b.cancelled_at,
        }
    }
}

impl TryFrom<BookingRow> for Booking {
    type Error = ParseError;

    fn try_from(row: BookingRow) -> Result<Self, Self::Error> {
        let has_break = row.current_break.is_some();
        let state = match (row.status, row.current_break) {
            (BookingStatus::Pending, None) => BookingState::Pending,
            (BookingStatus::Confirmed, None) => BookingState::Confirmed,
            (BookingStatus::OnBreak, Some(cb)) => BookingState::OnBreak(ActiveBreak {
                window: Window::parse(&cb.start_time, &cb.end_time)?,
                started_at: cb.started_at,
            }),
            (BookingStatus::Cancelled, None) => BookingState::Cancelled {
                reason: row.cancellation_reason,
            },
            (BookingStatus::Completed, None) => BookingState::Completed,
            (status, _) => return Err(ParseError::BreakMismatch { status, has_break }),
        };
        let breaks = row
            .breaks
            .iter()
            .map(|r| {
                Ok(ClosedBreak {
                    window: Window::parse(&r.start_time, &r.end_time)?,
                    taken_at: r.taken_at,
                })
            })
            .collect::<Result<BreakLog, ParseError>>()?;
        let device_id = DeviceId::parse(&row.device_id)
            .map_err(|_| ParseError::Device(row.device_id.clone()))?;

        Ok(Booking {
            id: row.id,
            seat_id: row.seat_id,
            member_id: row.member_id,
            device_id,
            date: row.date,
            window: Window::parse(&row.start_time, &row.end_time)?,
            state,
            attendance_confirmed_at: row.attendance_confirmed_at,
            breaks,
            created_at: row.created_at,
            completed_at: row.completed_at,
            cancelled_at: row.cancelled_at,
        })
    }
}

// ── Query result types ───────────────────────────────────────────

/// How a seat looks for a requested window. Mirrors the booking seat check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeatAnnotation {
    Available,
    AvailableInBreak,
    Booked,
    OnBreakUnavailable,
    Maintenance,
}

impl SeatAnnotation {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeatAnnotation::Available => "available",
            SeatAnnotation::AvailableInBreak => "available-in-break",
            SeatAnnotation::Booked => "booked",
            SeatAnnotation::OnBreakUnavailable => "on-break-unavailable",
            SeatAnnotation::Maintenance => "maintenance",
        }
    }

    pub fn is_bookable(&self) -> bool {
        matches!(self, SeatAnnotation::Available | SeatAnnotation::AvailableInBreak)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeatAvailability {
    pub seat: Seat,
    pub status: SeatStatus,
    pub annotation: Option<SeatAnnotation>,
}
