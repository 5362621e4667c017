mod availability;
mod conflict;
mod error;
mod lifecycle;
mod queries;
mod store;
mod sweep;
#[cfg(test)]
mod tests;

pub use error::{ConflictRule, EngineError, ErrorCategory};
pub use lifecycle::BookingRequest;
pub use store::{DeviceSlot, Indexes};
pub use sweep::{due_transition, SweepReport, Transition};

pub(crate) use conflict::now_local;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use tracing::warn;
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedSeatState = Arc<RwLock<SeatState>>;

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

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for {} events: {e}", batch.len());
    }
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
    // Flush even after an append error so half-buffered bytes don't leak
    // into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
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
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// Booking engine for one site: seat states behind per-seat locks, the
/// cross-seat indexes, and the WAL writer handle.
pub struct Engine {
    pub state: DashMap<Ulid, SharedSeatState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) index: Indexes,
    /// Serializes seat creation against compaction snapshots.
    pub(super) seat_gate: Mutex<()>,
}

/// Apply an event to a seat the caller already holds the write lock on.
fn apply_to_seat(rs: &mut SeatState, event: &Event, index: &Indexes) {
    match event {
        Event::SeatStatusChanged { status, .. } => rs.status = *status,
        Event::BookingCreated {
            id,
            seat_id,
            member_id,
            device_id,
            date,
            window,
            created_at,
        } => {
            let booking = Booking {
                id: *id,
                seat_id: *seat_id,
                member_id: member_id.clone(),
                device_id: device_id.clone(),
                date: *date,
                window: *window,
                state: BookingState::Pending,
                attendance_confirmed_at: None,
                breaks: BreakLog::default(),
                created_at: *created_at,
                completed_at: None,
                cancelled_at: None,
            };
            index.track(&booking);
            rs.insert_booking(booking);
            rs.project_status(SeatStatus::Occupied);
        }
        Event::AttendanceConfirmed { id, at, .. } => {
            if let Some(b) = rs.booking_mut(id) {
                b.state = BookingState::Confirmed;
                b.attendance_confirmed_at = Some(*at);
            }
        }
        Event::BreakStarted {
            id,
            window,
            started_at,
            ..
        } => {
            if let Some(b) = rs.booking_mut(id) {
                b.state = BookingState::OnBreak(ActiveBreak {
                    window: *window,
                    started_at: *started_at,
                });
                rs.project_status(SeatStatus::OnBreak);
            }
        }
        Event::BreakEnded { id, .. } => {
            if let Some(b) = rs.booking_mut(id) {
                close_break(b);
                b.state = BookingState::Confirmed;
                rs.project_status(SeatStatus::Occupied);
            }
        }
        Event::BookingCancelled { id, reason, at, .. } => {
            if let Some(b) = rs.booking_mut(id) {
                close_break(b);
                b.state = BookingState::Cancelled {
                    reason: reason.clone(),
                };
                b.cancelled_at = Some(*at);
                index.release_device(&b.device_id, id);
                rs.project_status(SeatStatus::Available);
            }
        }
        Event::BookingCompleted { id, at, .. } => {
            if let Some(b) = rs.booking_mut(id) {
                close_break(b);
                b.state = BookingState::Completed;
                b.completed_at = Some(*at);
                index.release_device(&b.device_id, id);
                rs.project_status(SeatStatus::Available);
            }
        }
        Event::BookingRestored { row } => match Booking::try_from(row.clone()) {
            Ok(booking) => {
                index.track(&booking);
                rs.insert_booking(booking);
            }
            Err(e) => warn!("skipping unreadable booking {}: {e}", row.id),
        },
        // Seat creation is handled at the DashMap level.
        Event::SeatCreated { .. } => {}
    }
}

/// Move an active break into the booking's history.
fn close_break(b: &mut Booking) {
    if let BookingState::OnBreak(active) = &b.state {
        let closed = ClosedBreak {
            window: active.window,
            taken_at: active.started_at,
        };
        b.breaks.push(closed);
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let replay = Wal::replay(&wal_path)?;
        if replay.discarded_tail {
            warn!("{}: discarded torn or corrupt WAL tail", wal_path.display());
        }
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            index: Indexes::new(),
            seat_gate: Mutex::new(()),
        };

        // Sole owner of these Arcs during replay, so try_write never contends.
        // blocking_write would panic here since this may run inside a runtime.
        for event in &replay.events {
            match event {
                Event::SeatCreated { seat } => {
                    let rs = SeatState::new(seat.clone());
                    engine.state.insert(seat.id, Arc::new(RwLock::new(rs)));
                }
                other => {
                    let Some(rs) = engine.get_seat(&other.seat_id()) else {
                        warn!("replay: event for unknown seat {}", other.seat_id());
                        continue;
                    };
                    match rs.try_write() {
                        Ok(mut guard) => apply_to_seat(&mut guard, other, &engine.index),
                        Err(_) => warn!("replay: seat {} locked", other.seat_id()),
                    }
                }
            }
        }

        tracing::info!(
            "{}: replayed {} events into {} seats",
            wal_path.display(),
            replay.events.len(),
            engine.state.len()
        );
        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_seat(&self, id: &Ulid) -> Option<SharedSeatState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn seat_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.index.seat_for_booking(booking_id)
    }

    /// WAL-append, apply, notify. The record only changes once the WAL has it.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut SeatState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_seat(rs, event, &self.index);
        self.notify.publish(event);
        Ok(())
    }

    /// Lookup booking → seat, acquire the seat's write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<SeatState>, EngineError> {
        let seat_id = self
            .seat_for_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let rs = self.get_seat(&seat_id).ok_or(EngineError::NotFound(seat_id))?;
        Ok(rs.write_owned().await)
    }
}

/// The booking, provided `member_id` owns it.
pub(super) fn owned_booking<'a>(
    rs: &'a SeatState,
    booking_id: &Ulid,
    member_id: &str,
) -> Result<&'a Booking, EngineError> {
    let booking = rs
        .booking(booking_id)
        .ok_or(EngineError::NotFound(*booking_id))?;
    if booking.member_id != member_id {
        return Err(EngineError::Forbidden(*booking_id));
    }
    Ok(booking)
}
