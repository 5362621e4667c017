use chrono::{NaiveDate, NaiveDateTime};
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    /// The booking as last stored. Callers that need it current sweep first.
    pub async fn get_booking(&self, booking_id: &Ulid) -> Result<Booking, EngineError> {
        let seat_id = self
            .seat_for_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let rs = self.get_seat(&seat_id).ok_or(EngineError::NotFound(seat_id))?;
        let guard = rs.read().await;
        guard
            .booking(booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(*booking_id))
    }

    /// Every booking a member has made, in `(date, start)` order.
    pub async fn list_member_bookings(&self, member_id: &str) -> Vec<Booking> {
        let mut out = Vec::new();
        for booking_id in self.index.member_bookings(member_id) {
            if let Ok(booking) = self.get_booking(&booking_id).await {
                out.push(booking);
            }
        }
        out.sort_by_key(|b| (b.date, b.window.start));
        out
    }

    /// A seat's schedule as of `now`, optionally narrowed to one date.
    pub async fn bookings_for_seat(
        &self,
        seat_id: &Ulid,
        date: Option<NaiveDate>,
        now: NaiveDateTime,
    ) -> Result<Vec<Booking>, EngineError> {
        let rs = self.get_seat(seat_id).ok_or(EngineError::NotFound(*seat_id))?;
        self.sweep_seats(std::slice::from_ref(&rs), now).await;
        let guard = rs.read().await;
        Ok(guard
            .bookings
            .iter()
            .filter(|b| date.is_none_or(|d| b.date == d))
            .cloned()
            .collect())
    }

    pub async fn get_seat_state(&self, seat_id: &Ulid) -> Result<(Seat, SeatStatus), EngineError> {
        let rs = self.get_seat(seat_id).ok_or(EngineError::NotFound(*seat_id))?;
        let guard = rs.read().await;
        Ok((guard.seat.clone(), guard.status))
    }
}
