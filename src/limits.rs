//! Hard limits and fixed deadlines.

/// Attendance must be confirmed within this many minutes of the slot start.
pub const ATTENDANCE_WINDOW_MINUTES: i64 = 20;

/// Default period of the expiration sweep.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;

pub const MAX_SEATS_PER_SITE: usize = 100_000;
pub const MAX_BOOKINGS_PER_SEAT: usize = 100_000;
pub const MAX_BREAKS_PER_BOOKING: usize = 64;

pub const MAX_SEAT_FIELD_LEN: usize = 128;
pub const MAX_MEMBER_ID_LEN: usize = 256;
pub const MAX_DEVICE_ID_LEN: usize = 256;
pub const MAX_REASON_LEN: usize = 1024;

pub const MAX_SITES: usize = 1024;
pub const MAX_SITE_NAME_LEN: usize = 256;

/// Reason stamped on bookings cancelled for missing the attendance window.
pub const NO_SHOW_REASON: &str = "attendance not confirmed";
