use chrono::NaiveDateTime;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::error::ErrorCategory;
use super::EngineError;

pub(crate) fn now_local() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

/// How one existing booking bears on a requested window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SeatVerdict {
    Clear,
    /// The booking is on break and the break covers the whole request.
    ClearInBreak,
    Blocked { by: Ulid, on_break: bool },
}

/// The seat predicate. Booking and the availability projection both go
/// through here so they can't drift apart.
pub(crate) fn seat_verdict(existing: &Booking, request: &Window) -> SeatVerdict {
    let on_break = existing.current_break();
    if let Some(active) = on_break
        && active.window.contains(request)
    {
        return SeatVerdict::ClearInBreak;
    }
    if existing.window.overlaps(request) {
        return SeatVerdict::Blocked {
            by: existing.id,
            on_break: on_break.is_some(),
        };
    }
    SeatVerdict::Clear
}

/// Seat pass: first blocking booking wins.
pub(crate) fn check_seat(rs: &SeatState, date: chrono::NaiveDate, window: &Window) -> Result<(), EngineError> {
    if rs.status == SeatStatus::Maintenance {
        return Err(EngineError::SeatUnderMaintenance(rs.id()));
    }
    for existing in rs.active_on(date) {
        if let SeatVerdict::Blocked { by, .. } = seat_verdict(existing, window) {
            return Err(EngineError::SeatConflict(by));
        }
    }
    Ok(())
}

pub(crate) fn validate_text(field: &str, value: &str, max: usize) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::Validation(format!("{field} is required")));
    }
    if value.len() > max {
        return Err(EngineError::LimitExceeded("field too long"));
    }
    Ok(())
}

pub(crate) fn validate_seat(seat: &Seat) -> Result<(), EngineError> {
    validate_text("building", &seat.building, MAX_SEAT_FIELD_LEN)?;
    validate_text("floor", &seat.floor, MAX_SEAT_FIELD_LEN)?;
    validate_text("section", &seat.section, MAX_SEAT_FIELD_LEN)?;
    validate_text("number", &seat.number, MAX_SEAT_FIELD_LEN)
}

pub(crate) fn validate_reason(reason: Option<&str>) -> Result<(), EngineError> {
    match reason {
        Some(r) if r.len() > MAX_REASON_LEN => Err(EngineError::LimitExceeded("reason too long")),
        _ => Ok(()),
    }
}

/// Count a rejected request against the guard that fired.
pub(crate) fn record_rejection(err: &EngineError) {
    if let ErrorCategory::Conflict(rule) = err.category() {
        metrics::counter!(crate::observability::BOOKING_REJECTIONS_TOTAL, "rule" => rule.as_str())
            .increment(1);
    }
}
