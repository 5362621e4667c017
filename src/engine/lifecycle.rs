use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use tokio::sync::{oneshot, OwnedRwLockReadGuard, RwLock};
use tracing::info;
use ulid::Ulid;

use crate::device::DeviceId;
use crate::limits::*;
use crate::model::*;

use super::conflict::{check_seat, record_rejection, validate_reason, validate_seat, validate_text};
use super::{owned_booking, Engine, EngineError, WalCommand};

/// A request to hold a seat for a window on one date.
#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub id: Ulid,
    pub seat_id: Ulid,
    pub member_id: String,
    pub device_id: DeviceId,
    pub date: NaiveDate,
    pub window: Window,
}

impl Engine {
    pub async fn create_seat(&self, seat: Seat) -> Result<(), EngineError> {
        validate_seat(&seat)?;
        let _gate = self.seat_gate.lock().await;
        if self.state.len() >= MAX_SEATS_PER_SITE {
            return Err(EngineError::LimitExceeded("too many seats"));
        }
        if self.state.contains_key(&seat.id) {
            return Err(EngineError::AlreadyExists(seat.id));
        }

        let event = Event::SeatCreated { seat: seat.clone() };
        self.wal_append(&event).await?;
        let id = seat.id;
        self.state.insert(id, Arc::new(RwLock::new(SeatState::new(seat))));
        info!("seat {id} created");
        Ok(())
    }

    /// Put a seat under maintenance, or lift it. Lifting restores `occupied`
    /// if the seat still has active bookings, `available` otherwise.
    pub async fn set_maintenance(&self, seat_id: Ulid, on: bool) -> Result<SeatStatus, EngineError> {
        let rs = self.get_seat(&seat_id).ok_or(EngineError::NotFound(seat_id))?;
        let mut guard = rs.write().await;
        let status = if on {
            SeatStatus::Maintenance
        } else if guard.status != SeatStatus::Maintenance {
            return Ok(guard.status);
        } else if guard.bookings.iter().any(Booking::is_active) {
            SeatStatus::Occupied
        } else {
            SeatStatus::Available
        };
        if guard.status == status {
            return Ok(status);
        }
        let event = Event::SeatStatusChanged { seat_id, status };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(status)
    }

    /// Resolve the request and create a `pending` booking.
    ///
    /// Device pass first, then the seat pass; both run under the seat's
    /// write lock, so two requests for the same seat can't both succeed.
    /// Anything already overdue is settled first, so a lapsed booking
    /// never blocks a new one.
    pub async fn book(&self, req: BookingRequest, now: NaiveDateTime) -> Result<Booking, EngineError> {
        self.book_inner(req, now).await.inspect_err(record_rejection)
    }

    async fn book_inner(&self, req: BookingRequest, now: NaiveDateTime) -> Result<Booking, EngineError> {
        validate_text("member id", &req.member_id, MAX_MEMBER_ID_LEN)?;
        if req.window.ends_at(req.date) <= now {
            return Err(EngineError::Validation(format!(
                "window {} on {} has already ended",
                req.window, req.date
            )));
        }
        if self.seat_for_booking(&req.id).is_some() {
            return Err(EngineError::AlreadyExists(req.id));
        }

        let rs = self
            .get_seat(&req.seat_id)
            .ok_or(EngineError::NotFound(req.seat_id))?;

        // Overdue bookings on this device give it back before the device pass.
        let mut settled = None;
        while let Some(existing) = self.index.device_overlap(&req.device_id, req.date, &req.window) {
            if settled == Some(existing) {
                break;
            }
            settled = Some(existing);
            if !matches!(self.sweep_booking(existing, now).await, Ok(Some(_))) {
                break;
            }
        }

        let mut guard = rs.write().await;
        self.settle_seat(&mut guard, now).await?;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_SEAT {
            return Err(EngineError::LimitExceeded("too many bookings on seat"));
        }

        if let Some(existing) = self.index.device_overlap(&req.device_id, req.date, &req.window) {
            return Err(EngineError::DeviceConflict(existing));
        }
        check_seat(&guard, req.date, &req.window)?;

        let event = Event::BookingCreated {
            id: req.id,
            seat_id: req.seat_id,
            member_id: req.member_id,
            device_id: req.device_id,
            date: req.date,
            window: req.window,
            created_at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        guard
            .booking(&req.id)
            .cloned()
            .ok_or(EngineError::NotFound(req.id))
    }

    /// `pending → confirmed`. Past the deadline the booking is left alone;
    /// callers follow up with [`Engine::sweep_booking`].
    pub async fn confirm_attendance(
        &self,
        booking_id: Ulid,
        member_id: &str,
        present: bool,
        now: NaiveDateTime,
    ) -> Result<Booking, EngineError> {
        let result = async {
            let mut guard = self.resolve_booking_write(&booking_id).await?;
            let booking = owned_booking(&guard, &booking_id, member_id)?;
            if booking.state != BookingState::Pending {
                return Err(EngineError::InvalidTransition {
                    id: booking_id,
                    status: booking.status(),
                    op: "confirm attendance",
                });
            }
            if !present {
                return Err(EngineError::NotPresent);
            }
            let deadline = booking.attendance_deadline();
            if now > deadline {
                return Err(EngineError::AttendanceWindowElapsed { deadline });
            }

            let event = Event::AttendanceConfirmed {
                id: booking_id,
                seat_id: booking.seat_id,
                at: now,
            };
            self.persist_and_apply(&mut guard, &event).await?;
            snapshot(&guard, booking_id)
        }
        .await;
        result.inspect_err(record_rejection)
    }

    /// `confirmed → on-break`. The break window becomes bookable by others.
    pub async fn start_break(
        &self,
        booking_id: Ulid,
        member_id: &str,
        window: Window,
        now: NaiveDateTime,
    ) -> Result<Booking, EngineError> {
        let result = async {
            let mut guard = self.resolve_booking_write(&booking_id).await?;
            let booking = owned_booking(&guard, &booking_id, member_id)?;
            if booking.state != BookingState::Confirmed {
                return Err(EngineError::InvalidTransition {
                    id: booking_id,
                    status: booking.status(),
                    op: "start a break",
                });
            }
            if booking.breaks.len() >= MAX_BREAKS_PER_BOOKING {
                return Err(EngineError::LimitExceeded("too many breaks"));
            }
            if !booking.window.contains(&window) {
                return Err(EngineError::BreakOutsideBooking);
            }
            // Someone already booked into an earlier break: the new break must
            // cover their slot completely or it would cut it in two.
            let split = guard
                .active_on(booking.date)
                .filter(|other| other.id != booking_id)
                .filter(|other| {
                    matches!(other.state, BookingState::Pending | BookingState::Confirmed)
                })
                .find(|other| other.window.overlaps(&window) && !window.contains(&other.window));
            if let Some(other) = split {
                return Err(EngineError::BreakConflict(other.id));
            }
            if booking.breaks.overlapping(&window).is_some() {
                return Err(EngineError::BreakOverlapsHistory);
            }

            let event = Event::BreakStarted {
                id: booking_id,
                seat_id: booking.seat_id,
                window,
                started_at: now,
            };
            self.persist_and_apply(&mut guard, &event).await?;
            snapshot(&guard, booking_id)
        }
        .await;
        result.inspect_err(record_rejection)
    }

    /// `on-break → confirmed`. Refused while someone who booked into the break
    /// is still using the seat.
    pub async fn end_break(
        &self,
        booking_id: Ulid,
        member_id: &str,
        now: NaiveDateTime,
    ) -> Result<Booking, EngineError> {
        let result = async {
            let mut guard = self.resolve_booking_write(&booking_id).await?;
            let booking = owned_booking(&guard, &booking_id, member_id)?;
            let Some(active) = booking.current_break() else {
                return Err(EngineError::InvalidTransition {
                    id: booking_id,
                    status: booking.status(),
                    op: "end a break",
                });
            };
            let in_use = guard
                .active_on(booking.date)
                .filter(|other| other.id != booking_id)
                .filter(|other| {
                    matches!(other.state, BookingState::Pending | BookingState::Confirmed)
                })
                .find(|other| active.window.contains(&other.window) && other.ends_at() > now);
            if let Some(other) = in_use {
                return Err(EngineError::BreakInUse(other.id));
            }

            let event = Event::BreakEnded {
                id: booking_id,
                seat_id: booking.seat_id,
                forced: false,
            };
            self.persist_and_apply(&mut guard, &event).await?;
            snapshot(&guard, booking_id)
        }
        .await;
        result.inspect_err(record_rejection)
    }

    /// Cancel an active booking. The seat is flipped back to `available`.
    pub async fn cancel(
        &self,
        booking_id: Ulid,
        member_id: &str,
        reason: Option<String>,
        now: NaiveDateTime,
    ) -> Result<Booking, EngineError> {
        let result = async {
            validate_reason(reason.as_deref())?;
            let mut guard = self.resolve_booking_write(&booking_id).await?;
            let booking = owned_booking(&guard, &booking_id, member_id)?;
            if !booking.is_active() {
                return Err(EngineError::InvalidTransition {
                    id: booking_id,
                    status: booking.status(),
                    op: "cancel",
                });
            }

            let event = Event::BookingCancelled {
                id: booking_id,
                seat_id: booking.seat_id,
                reason,
                at: now,
            };
            self.persist_and_apply(&mut guard, &event).await?;
            snapshot(&guard, booking_id)
        }
        .await;
        result.inspect_err(record_rejection)
    }

    /// Rewrite the WAL as one snapshot per seat.
    ///
    /// Every seat's read lock is held until the writer has swapped files, so
    /// no mutation can slip in between snapshot and swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.seat_gate.lock().await;
        let seats: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();

        let mut guards: Vec<OwnedRwLockReadGuard<SeatState>> = Vec::with_capacity(seats.len());
        for rs in seats {
            guards.push(rs.read_owned().await);
        }

        let mut events = Vec::new();
        for rs in &guards {
            events.push(Event::SeatCreated {
                seat: rs.seat.clone(),
            });
            for booking in &rs.bookings {
                events.push(Event::BookingRestored {
                    row: BookingRow::from(booking),
                });
            }
            events.push(Event::SeatStatusChanged {
                seat_id: rs.id(),
                status: rs.status,
            });
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

fn snapshot(rs: &SeatState, booking_id: Ulid) -> Result<Booking, EngineError> {
    rs.booking(&booking_id)
        .cloned()
        .ok_or(EngineError::NotFound(booking_id))
}
