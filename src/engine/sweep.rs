use chrono::NaiveDateTime;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::limits::NO_SHOW_REASON;
use crate::model::*;

use super::{Engine, EngineError, SharedSeatState};

/// What the sweeper does to a booking that has run past one of its deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The slot has ended.
    Complete,
    /// Attendance never confirmed.
    NoShow,
    /// The break ran past its end without being closed.
    CloseBreak,
}

impl Transition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transition::Complete => "complete",
            Transition::NoShow => "no_show",
            Transition::CloseBreak => "close_break",
        }
    }
}

/// The single transition due for `booking` at `now`, highest priority first.
pub fn due_transition(booking: &Booking, now: NaiveDateTime) -> Option<Transition> {
    if !booking.is_active() {
        return None;
    }
    if now > booking.ends_at() {
        return Some(Transition::Complete);
    }
    match &booking.state {
        BookingState::Pending if now > booking.attendance_deadline() => Some(Transition::NoShow),
        BookingState::OnBreak(active) if now > booking.break_ends_at(&active.window) => {
            Some(Transition::CloseBreak)
        }
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub completed: usize,
    pub no_shows: usize,
    pub breaks_closed: usize,
    pub failed: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn record(&mut self, transition: Transition) {
        match transition {
            Transition::Complete => self.completed += 1,
            Transition::NoShow => self.no_shows += 1,
            Transition::CloseBreak => self.breaks_closed += 1,
        }
    }
}

impl Engine {
    /// Apply every due transition across the site.
    pub async fn sweep(&self, now: NaiveDateTime) -> SweepReport {
        let seats: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        self.sweep_seats(&seats, now).await
    }

    /// Sweep a chosen set of seats. Candidates are collected under read
    /// locks and re-checked under the write lock.
    pub(super) async fn sweep_seats(
        &self,
        seats: &[SharedSeatState],
        now: NaiveDateTime,
    ) -> SweepReport {
        let mut candidates = Vec::new();
        for rs in seats {
            let guard = rs.read().await;
            candidates.extend(
                guard
                    .bookings
                    .iter()
                    .filter(|b| due_transition(b, now).is_some())
                    .map(|b| (b.seat_id, b.id)),
            );
        }
        self.apply_sweep(candidates, now).await
    }

    /// Sweep only the bookings of one member.
    pub async fn sweep_member(&self, member_id: &str, now: NaiveDateTime) -> SweepReport {
        let mut candidates = Vec::new();
        for booking_id in self.index.member_bookings(member_id) {
            let Some(seat_id) = self.seat_for_booking(&booking_id) else {
                continue;
            };
            let Some(rs) = self.get_seat(&seat_id) else {
                continue;
            };
            let guard = rs.read().await;
            if guard
                .booking(&booking_id)
                .is_some_and(|b| due_transition(b, now).is_some())
            {
                candidates.push((seat_id, booking_id));
            }
        }
        self.apply_sweep(candidates, now).await
    }

    /// Check one booking right away, e.g. after a late attendance attempt.
    pub async fn sweep_booking(
        &self,
        booking_id: Ulid,
        now: NaiveDateTime,
    ) -> Result<Option<Transition>, EngineError> {
        let seat_id = self
            .seat_for_booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        self.sweep_one(seat_id, booking_id, now).await
    }

    async fn apply_sweep(&self, candidates: Vec<(Ulid, Ulid)>, now: NaiveDateTime) -> SweepReport {
        let mut report = SweepReport::default();
        for (seat_id, booking_id) in candidates {
            match self.sweep_one(seat_id, booking_id, now).await {
                Ok(Some(transition)) => report.record(transition),
                Ok(None) => {}
                Err(e) => {
                    warn!("sweep failed for booking {booking_id}: {e}");
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Re-read the booking under the seat lock and apply whatever is due now.
    async fn sweep_one(
        &self,
        seat_id: Ulid,
        booking_id: Ulid,
        now: NaiveDateTime,
    ) -> Result<Option<Transition>, EngineError> {
        let rs = self.get_seat(&seat_id).ok_or(EngineError::NotFound(seat_id))?;
        let mut guard = rs.write().await;
        self.settle_booking(&mut guard, booking_id, now).await
    }

    /// Bring every booking on an already write-locked seat up to `now`.
    pub(super) async fn settle_seat(
        &self,
        rs: &mut SeatState,
        now: NaiveDateTime,
    ) -> Result<SweepReport, EngineError> {
        let due: Vec<Ulid> = rs
            .bookings
            .iter()
            .filter(|b| due_transition(b, now).is_some())
            .map(|b| b.id)
            .collect();
        let mut report = SweepReport::default();
        for booking_id in due {
            if let Some(transition) = self.settle_booking(rs, booking_id, now).await? {
                report.record(transition);
            }
        }
        Ok(report)
    }

    async fn settle_booking(
        &self,
        rs: &mut SeatState,
        booking_id: Ulid,
        now: NaiveDateTime,
    ) -> Result<Option<Transition>, EngineError> {
        let seat_id = rs.id();
        let booking = rs
            .booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let Some(transition) = due_transition(booking, now) else {
            debug!("sweep: booking {booking_id} no longer due");
            return Ok(None);
        };

        let event = match transition {
            Transition::Complete => Event::BookingCompleted {
                id: booking_id,
                seat_id,
                at: now,
            },
            Transition::NoShow => Event::BookingCancelled {
                id: booking_id,
                seat_id,
                reason: Some(NO_SHOW_REASON.to_string()),
                at: now,
            },
            Transition::CloseBreak => Event::BreakEnded {
                id: booking_id,
                seat_id,
                forced: true,
            },
        };
        self.persist_and_apply(rs, &event).await?;
        metrics::counter!(
            crate::observability::SWEEP_TRANSITIONS_TOTAL,
            "transition" => transition.as_str()
        )
        .increment(1);
        Ok(Some(transition))
    }
}
