use chrono::NaiveDateTime;
use ulid::Ulid;

use crate::device::DeviceError;
use crate::model::{BookingStatus, ParseError};

/// Which guard rejected a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictRule {
    DeviceOverlap,
    SeatOverlap,
    SeatMaintenance,
    BreakOutsideBooking,
    BreakConflict,
    BreakOverlapsHistory,
    BreakInUse,
    InvalidTransition,
    NotPresent,
    AttendanceWindow,
}

impl ConflictRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictRule::DeviceOverlap => "device_overlap",
            ConflictRule::SeatOverlap => "seat_overlap",
            ConflictRule::SeatMaintenance => "seat_maintenance",
            ConflictRule::BreakOutsideBooking => "break_outside_booking",
            ConflictRule::BreakConflict => "break_conflict",
            ConflictRule::BreakOverlapsHistory => "break_overlaps_history",
            ConflictRule::BreakInUse => "break_in_use",
            ConflictRule::InvalidTransition => "invalid_transition",
            ConflictRule::NotPresent => "not_present",
            ConflictRule::AttendanceWindow => "attendance_window",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    Conflict(ConflictRule),
    NotFound,
    Forbidden,
    Storage,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Invalid(#[from] ParseError),
    #[error("invalid device: {0}")]
    Device(#[from] DeviceError),
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("device already booked (booking {0})")]
    DeviceConflict(Ulid),
    #[error("seat already booked (booking {0})")]
    SeatConflict(Ulid),
    #[error("seat {0} is under maintenance")]
    SeatUnderMaintenance(Ulid),
    #[error("break must lie within the booking window")]
    BreakOutsideBooking,
    #[error("break would split booking {0}")]
    BreakConflict(Ulid),
    #[error("break overlaps an earlier break")]
    BreakOverlapsHistory,
    #[error("seat is in use by booking {0} during the break")]
    BreakInUse(Ulid),
    #[error("booking {id} is {status}, cannot {op}")]
    InvalidTransition {
        id: Ulid,
        status: BookingStatus,
        op: &'static str,
    },
    #[error("member is not present")]
    NotPresent,
    #[error("attendance window closed at {deadline}")]
    AttendanceWindowElapsed { deadline: NaiveDateTime },
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("booking {0} belongs to another member")]
    Forbidden(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    pub fn category(&self) -> ErrorCategory {
        use ConflictRule::*;
        match self {
            EngineError::Invalid(_)
            | EngineError::Device(_)
            | EngineError::Validation(_)
            | EngineError::AlreadyExists(_)
            | EngineError::LimitExceeded(_) => ErrorCategory::Validation,
            EngineError::DeviceConflict(_) => ErrorCategory::Conflict(DeviceOverlap),
            EngineError::SeatConflict(_) => ErrorCategory::Conflict(SeatOverlap),
            EngineError::SeatUnderMaintenance(_) => ErrorCategory::Conflict(SeatMaintenance),
            EngineError::BreakOutsideBooking => ErrorCategory::Conflict(BreakOutsideBooking),
            EngineError::BreakConflict(_) => ErrorCategory::Conflict(BreakConflict),
            EngineError::BreakOverlapsHistory => ErrorCategory::Conflict(BreakOverlapsHistory),
            EngineError::BreakInUse(_) => ErrorCategory::Conflict(BreakInUse),
            EngineError::InvalidTransition { .. } => ErrorCategory::Conflict(InvalidTransition),
            EngineError::NotPresent => ErrorCategory::Conflict(NotPresent),
            EngineError::AttendanceWindowElapsed { .. } => {
                ErrorCategory::Conflict(AttendanceWindow)
            }
            EngineError::NotFound(_) => ErrorCategory::NotFound,
            EngineError::Forbidden(_) => ErrorCategory::Forbidden,
            EngineError::WalError(_) => ErrorCategory::Storage,
        }
    }
}
