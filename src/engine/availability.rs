use chrono::{NaiveDate, NaiveDateTime};

use crate::model::*;

use super::conflict::{seat_verdict, SeatVerdict};
use super::Engine;

/// Annotate a seat for a requested window. Folds the same per-booking
/// verdicts the seat pass uses, so a seat reported bookable here is one
/// `book` would accept (device pass aside).
pub(crate) fn annotate(rs: &SeatState, date: NaiveDate, window: &Window) -> SeatAnnotation {
    if rs.status == SeatStatus::Maintenance {
        return SeatAnnotation::Maintenance;
    }
    let mut in_break = false;
    let mut blocked = None;
    for existing in rs.active_on(date) {
        match seat_verdict(existing, window) {
            SeatVerdict::Clear => {}
            SeatVerdict::ClearInBreak => in_break = true,
            SeatVerdict::Blocked { on_break, .. } => {
                blocked = Some(blocked.unwrap_or(false) || on_break);
            }
        }
    }
    match blocked {
        Some(true) => SeatAnnotation::OnBreakUnavailable,
        Some(false) => SeatAnnotation::Booked,
        None if in_break => SeatAnnotation::AvailableInBreak,
        None => SeatAnnotation::Available,
    }
}

impl Engine {
    /// Seats matching `filter`, ordered by building, floor, section, number.
    /// With a slot, each seat is annotated for it; without one only the
    /// cached status is reported. Overdue bookings are settled first.
    pub async fn seat_availability(
        &self,
        filter: &SeatFilter,
        slot: Option<(NaiveDate, Window)>,
        now: NaiveDateTime,
    ) -> Vec<SeatAvailability> {
        let seats: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut matching = Vec::new();
        for rs in seats {
            if filter.matches(&rs.read().await.seat) {
                matching.push(rs);
            }
        }
        self.sweep_seats(&matching, now).await;

        let mut out = Vec::new();
        for rs in matching {
            let guard = rs.read().await;
            out.push(SeatAvailability {
                seat: guard.seat.clone(),
                status: guard.status,
                annotation: slot.map(|(date, window)| annotate(&guard, date, &window)),
            });
        }
        out.sort_by(|a, b| {
            (&a.seat.building, &a.seat.floor, &a.seat.section, &a.seat.number).cmp(&(
                &b.seat.building,
                &b.seat.floor,
                &b.seat.section,
                &b.seat.number,
            ))
        });
        out
    }
}
