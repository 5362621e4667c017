use super::availability::annotate;
use super::conflict::check_seat;
use super::*;
use crate::device::DeviceId;
use crate::limits::NO_SHOW_REASON;
use crate::notify::NotificationKind;

use chrono::{NaiveDate, NaiveDateTime};

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()
}

fn at(h: u32, m: u32) -> NaiveDateTime {
    day().and_hms_opt(h, m, 0).unwrap()
}

fn w(start: &str, end: &str) -> Window {
    Window::parse(start, end).unwrap()
}

fn dev(id: &str) -> DeviceId {
    DeviceId::parse(id).unwrap()
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("seatd_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn new_engine(name: &str) -> Engine {
    Engine::new(test_wal_path(name), Arc::new(NotifyHub::new())).unwrap()
}

async fn add_seat(engine: &Engine, number: &str) -> Ulid {
    let id = Ulid::new();
    engine
        .create_seat(Seat {
            id,
            building: "Main".into(),
            floor: "2".into(),
            section: "quiet".into(),
            number: number.into(),
        })
        .await
        .unwrap();
    id
}

fn request(seat_id: Ulid, member: &str, device: &str, window: Window) -> BookingRequest {
    BookingRequest {
        id: Ulid::new(),
        seat_id,
        member_id: member.into(),
        device_id: dev(device),
        date: day(),
        window,
    }
}

async fn seat_status(engine: &Engine, seat_id: Ulid) -> SeatStatus {
    engine.get_seat_state(&seat_id).await.unwrap().1
}

// ── Booking creation ─────────────────────────────────────

#[tokio::test]
async fn book_creates_pending_and_occupies_seat() {
    let engine = new_engine("book_pending.wal");
    let seat = add_seat(&engine, "1").await;

    let booking = engine
        .book(request(seat, "alice", "abc", w("10:00", "12:00")), at(9, 0))
        .await
        .unwrap();
    assert_eq!(booking.status(), BookingStatus::Pending);
    assert!(!booking.attendance_confirmed());
    assert_eq!(booking.device_id, dev("abc"));
    assert_eq!(booking.created_at, at(9, 0));
    assert_eq!(seat_status(&engine, seat).await, SeatStatus::Occupied);
}

#[tokio::test]
async fn book_unknown_seat_is_not_found() {
    let engine = new_engine("book_unknown_seat.wal");
    let err = engine
        .book(request(Ulid::new(), "alice", "abc", w("10:00", "12:00")), at(9, 0))
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::NotFound);
}

#[tokio::test]
async fn book_rejects_window_already_over() {
    let engine = new_engine("book_past.wal");
    let seat = add_seat(&engine, "1").await;
    let err = engine
        .book(request(seat, "alice", "abc", w("08:00", "09:00")), at(9, 0))
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Validation);
}

#[tokio::test]
async fn book_rejects_duplicate_id() {
    let engine = new_engine("book_dup.wal");
    let seat = add_seat(&engine, "1").await;
    let req = request(seat, "alice", "abc", w("10:00", "11:00"));
    engine.book(req.clone(), at(9, 0)).await.unwrap();

    let mut again = req;
    again.window = w("14:00", "15:00");
    let err = engine.book(again, at(9, 0)).await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(_)));
}

#[tokio::test]
async fn device_exclusive_across_accounts() {
    let engine = new_engine("device_exclusive.wal");
    let s1 = add_seat(&engine, "1").await;
    let s2 = add_seat(&engine, "2").await;

    let first = engine
        .book(request(s1, "alice", "D", w("13:00", "15:00")), at(9, 0))
        .await
        .unwrap();
    engine
        .confirm_attendance(first.id, "alice", true, at(13, 5))
        .await
        .unwrap();

    let err = engine
        .book(request(s2, "bob", "D", w("14:00", "16:00")), at(13, 10))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::DeviceConflict(id) if id == first.id));
    assert_eq!(err.category(), ErrorCategory::Conflict(ConflictRule::DeviceOverlap));

    engine
        .book(request(s2, "bob", "D", w("15:00", "17:00")), at(13, 10))
        .await
        .unwrap();
}

#[tokio::test]
async fn device_blocked_by_own_booking_during_its_break() {
    let engine = new_engine("device_during_break.wal");
    let seat = add_seat(&engine, "1").await;
    let first = confirmed_all_day_on(&engine, seat, "alice", "D").await;
    engine
        .start_break(first.id, "alice", w("12:00", "13:00"), at(12, 0))
        .await
        .unwrap();

    // The seat alone would take it: the break covers the request.
    {
        let rs = engine.get_seat(&seat).unwrap();
        let guard = rs.read().await;
        assert!(check_seat(&guard, day(), &w("12:15", "12:45")).is_ok());
    }

    let err = engine
        .book(request(seat, "bob", "D", w("12:15", "12:45")), at(12, 5))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::DeviceConflict(id) if id == first.id));
    assert_eq!(err.category(), ErrorCategory::Conflict(ConflictRule::DeviceOverlap));
}

#[tokio::test]
async fn device_freed_after_cancel() {
    let engine = new_engine("device_freed.wal");
    let s1 = add_seat(&engine, "1").await;
    let s2 = add_seat(&engine, "2").await;

    let first = engine
        .book(request(s1, "alice", "D", w("13:00", "15:00")), at(9, 0))
        .await
        .unwrap();
    engine.cancel(first.id, "alice", None, at(9, 5)).await.unwrap();
    engine
        .book(request(s2, "bob", "D", w("14:00", "16:00")), at(9, 10))
        .await
        .unwrap();
}

#[tokio::test]
async fn seat_overlap_rejected_back_to_back_allowed() {
    let engine = new_engine("seat_overlap.wal");
    let seat = add_seat(&engine, "1").await;
    engine
        .book(request(seat, "alice", "a", w("09:00", "10:00")), at(8, 0))
        .await
        .unwrap();

    let err = engine
        .book(request(seat, "bob", "b", w("09:30", "10:30")), at(8, 0))
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Conflict(ConflictRule::SeatOverlap));

    engine
        .book(request(seat, "bob", "b", w("10:00", "11:00")), at(8, 0))
        .await
        .unwrap();
}

#[tokio::test]
async fn seat_overlap_across_midnight() {
    let engine = new_engine("seat_midnight.wal");
    let seat = add_seat(&engine, "1").await;
    engine
        .book(request(seat, "alice", "a", w("23:00", "01:00")), at(20, 0))
        .await
        .unwrap();
    let err = engine
        .book(request(seat, "bob", "b", w("00:30", "02:00")), at(20, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SeatConflict(_)));
}

#[tokio::test]
async fn other_dates_do_not_conflict() {
    let engine = new_engine("other_dates.wal");
    let seat = add_seat(&engine, "1").await;
    engine
        .book(request(seat, "alice", "a", w("09:00", "17:00")), at(8, 0))
        .await
        .unwrap();
    let mut tomorrow = request(seat, "bob", "b", w("09:00", "17:00"));
    tomorrow.date = day().succ_opt().unwrap();
    engine.book(tomorrow, at(8, 0)).await.unwrap();
}

#[tokio::test]
async fn maintenance_blocks_booking_until_lifted() {
    let engine = new_engine("maintenance.wal");
    let seat = add_seat(&engine, "1").await;

    assert_eq!(
        engine.set_maintenance(seat, true).await.unwrap(),
        SeatStatus::Maintenance
    );
    let err = engine
        .book(request(seat, "alice", "a", w("09:00", "10:00")), at(8, 0))
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Conflict(ConflictRule::SeatMaintenance));

    assert_eq!(
        engine.set_maintenance(seat, false).await.unwrap(),
        SeatStatus::Available
    );
    engine
        .book(request(seat, "alice", "a", w("09:00", "10:00")), at(8, 0))
        .await
        .unwrap();
}

#[tokio::test]
async fn maintenance_survives_booking_churn() {
    let engine = new_engine("maintenance_churn.wal");
    let seat = add_seat(&engine, "1").await;
    let b = engine
        .book(request(seat, "alice", "a", w("09:00", "10:00")), at(8, 0))
        .await
        .unwrap();
    engine.set_maintenance(seat, true).await.unwrap();
    engine.cancel(b.id, "alice", None, at(8, 5)).await.unwrap();
    assert_eq!(seat_status(&engine, seat).await, SeatStatus::Maintenance);
}

// ── Attendance ───────────────────────────────────────────

#[tokio::test]
async fn confirm_attendance_within_window() {
    let engine = new_engine("confirm_ok.wal");
    let seat = add_seat(&engine, "1").await;
    let b = engine
        .book(request(seat, "alice", "a", w("10:00", "12:00")), at(9, 0))
        .await
        .unwrap();

    let confirmed = engine
        .confirm_attendance(b.id, "alice", true, at(10, 20))
        .await
        .unwrap();
    assert_eq!(confirmed.status(), BookingStatus::Confirmed);
    assert_eq!(confirmed.attendance_confirmed_at, Some(at(10, 20)));

    // Only pending bookings can be confirmed.
    let err = engine
        .confirm_attendance(b.id, "alice", true, at(10, 21))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));
}

#[tokio::test]
async fn confirm_attendance_requires_presence() {
    let engine = new_engine("confirm_absent.wal");
    let seat = add_seat(&engine, "1").await;
    let b = engine
        .book(request(seat, "alice", "a", w("10:00", "12:00")), at(9, 0))
        .await
        .unwrap();

    let err = engine
        .confirm_attendance(b.id, "alice", false, at(10, 5))
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Conflict(ConflictRule::NotPresent));
    assert_eq!(
        engine.get_booking(&b.id).await.unwrap().status(),
        BookingStatus::Pending
    );
}

#[tokio::test]
async fn late_confirmation_then_expiration_check_cancels() {
    let engine = new_engine("confirm_late.wal");
    let seat = add_seat(&engine, "1").await;
    let b = engine
        .book(request(seat, "alice", "a", w("10:00", "12:00")), at(9, 0))
        .await
        .unwrap();

    let err = engine
        .confirm_attendance(b.id, "alice", true, at(10, 21))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AttendanceWindowElapsed { deadline } if deadline == at(10, 20)));
    assert_eq!(
        engine.get_booking(&b.id).await.unwrap().status(),
        BookingStatus::Pending
    );

    let transition = engine.sweep_booking(b.id, at(10, 21)).await.unwrap();
    assert_eq!(transition, Some(Transition::NoShow));
    let after = engine.get_booking(&b.id).await.unwrap();
    assert_eq!(after.status(), BookingStatus::Cancelled);
    assert_eq!(after.cancellation_reason(), Some(NO_SHOW_REASON));
    assert_eq!(seat_status(&engine, seat).await, SeatStatus::Available);
}

#[tokio::test]
async fn lapsed_no_show_does_not_block_seat() {
    let engine = new_engine("lapsed_no_show_seat.wal");
    let seat = add_seat(&engine, "1").await;
    let lapsed = engine
        .book(request(seat, "alice", "a", w("10:00", "18:00")), at(9, 0))
        .await
        .unwrap();

    // No sweep has run since the 10:20 deadline.
    let rows = engine
        .seat_availability(&SeatFilter::default(), Some((day(), w("11:00", "12:00"))), at(10, 25))
        .await;
    assert_eq!(rows[0].annotation, Some(SeatAnnotation::Available));

    engine
        .book(request(seat, "bob", "b", w("11:00", "12:00")), at(10, 25))
        .await
        .unwrap();
    let alice = engine.get_booking(&lapsed.id).await.unwrap();
    assert_eq!(alice.status(), BookingStatus::Cancelled);
    assert_eq!(alice.cancellation_reason(), Some(NO_SHOW_REASON));
}

#[tokio::test]
async fn lapsed_no_show_releases_device() {
    let engine = new_engine("lapsed_no_show_device.wal");
    let s1 = add_seat(&engine, "1").await;
    let s2 = add_seat(&engine, "2").await;
    let lapsed = engine
        .book(request(s1, "alice", "D", w("10:00", "12:00")), at(9, 0))
        .await
        .unwrap();

    engine
        .book(request(s2, "bob", "D", w("10:30", "11:30")), at(10, 25))
        .await
        .unwrap();
    assert_eq!(
        engine.get_booking(&lapsed.id).await.unwrap().status(),
        BookingStatus::Cancelled
    );
    assert_eq!(seat_status(&engine, s1).await, SeatStatus::Available);
}

#[tokio::test]
async fn seat_schedule_is_current_when_read() {
    let engine = new_engine("schedule_current.wal");
    let seat = add_seat(&engine, "1").await;
    let b = engine
        .book(request(seat, "alice", "a", w("10:00", "12:00")), at(9, 0))
        .await
        .unwrap();

    let before = engine.bookings_for_seat(&seat, None, at(10, 20)).await.unwrap();
    assert_eq!(before[0].status(), BookingStatus::Pending);

    let after = engine.bookings_for_seat(&seat, None, at(10, 21)).await.unwrap();
    assert_eq!(after[0].id, b.id);
    assert_eq!(after[0].status(), BookingStatus::Cancelled);
}

// ── Breaks ───────────────────────────────────────────────

async fn confirmed_all_day(engine: &Engine, seat: Ulid) -> Booking {
    let b = engine
        .book(request(seat, "alice", "a", w("09:00", "17:00")), at(8, 0))
        .await
        .unwrap();
    engine
        .confirm_attendance(b.id, "alice", true, at(9, 5))
        .await
        .unwrap()
}

#[tokio::test]
async fn break_carve_out() {
    let engine = new_engine("break_carve_out.wal");
    let seat = add_seat(&engine, "1").await;
    let b = confirmed_all_day(&engine, seat).await;

    let on_break = engine
        .start_break(b.id, "alice", w("12:00", "13:00"), at(12, 0))
        .await
        .unwrap();
    assert_eq!(on_break.status(), BookingStatus::OnBreak);
    assert_eq!(on_break.current_break().unwrap().window, w("12:00", "13:00"));
    assert_eq!(seat_status(&engine, seat).await, SeatStatus::OnBreak);

    engine
        .book(request(seat, "bob", "b", w("12:15", "12:45")), at(12, 5))
        .await
        .unwrap();

    let err = engine
        .book(request(seat, "carol", "c", w("11:30", "12:30")), at(12, 5))
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Conflict(ConflictRule::SeatOverlap));
}

#[tokio::test]
async fn break_must_be_inside_booking() {
    let engine = new_engine("break_outside.wal");
    let seat = add_seat(&engine, "1").await;
    let b = confirmed_all_day(&engine, seat).await;

    let err = engine
        .start_break(b.id, "alice", w("16:30", "17:30"), at(16, 30))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::BreakOutsideBooking));
    assert_eq!(
        engine.get_booking(&b.id).await.unwrap().status(),
        BookingStatus::Confirmed
    );
}

#[tokio::test]
async fn break_requires_confirmed() {
    let engine = new_engine("break_pending.wal");
    let seat = add_seat(&engine, "1").await;
    let b = engine
        .book(request(seat, "alice", "a", w("09:00", "17:00")), at(8, 0))
        .await
        .unwrap();
    let err = engine
        .start_break(b.id, "alice", w("12:00", "13:00"), at(8, 30))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidTransition { status: BookingStatus::Pending, .. }
    ));
}

#[tokio::test]
async fn end_break_blocked_while_sublet_in_use() {
    let engine = new_engine("break_in_use.wal");
    let seat = add_seat(&engine, "1").await;
    let b = confirmed_all_day(&engine, seat).await;
    engine
        .start_break(b.id, "alice", w("12:00", "14:00"), at(12, 0))
        .await
        .unwrap();
    let sublet = engine
        .book(request(seat, "bob", "b", w("12:30", "13:30")), at(12, 10))
        .await
        .unwrap();

    let err = engine.end_break(b.id, "alice", at(12, 40)).await.unwrap_err();
    assert!(matches!(err, EngineError::BreakInUse(id) if id == sublet.id));
    assert_eq!(
        engine.get_booking(&b.id).await.unwrap().status(),
        BookingStatus::OnBreak
    );

    // Once the sublet is over the owner may come back.
    let back = engine.end_break(b.id, "alice", at(13, 30)).await.unwrap();
    assert_eq!(back.status(), BookingStatus::Confirmed);
    assert_eq!(back.breaks.len(), 1);
    assert_eq!(seat_status(&engine, seat).await, SeatStatus::Occupied);
}

#[tokio::test]
async fn new_break_cannot_split_sublet_or_reuse_history() {
    let engine = new_engine("break_history.wal");
    let seat = add_seat(&engine, "1").await;
    let b = confirmed_all_day(&engine, seat).await;
    engine
        .start_break(b.id, "alice", w("12:00", "13:00"), at(12, 0))
        .await
        .unwrap();
    let sublet = engine
        .book(request(seat, "bob", "b", w("12:00", "13:00")), at(12, 0))
        .await
        .unwrap();
    engine.end_break(b.id, "alice", at(13, 0)).await.unwrap();

    // Overlaps bob's slot without covering it.
    let err = engine
        .start_break(b.id, "alice", w("11:30", "12:30"), at(13, 5))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::BreakConflict(id) if id == sublet.id));

    // Covers bob's slot but overlaps the earlier break.
    let err = engine
        .start_break(b.id, "alice", w("11:00", "13:30"), at(13, 5))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::BreakOverlapsHistory));

    // A fresh stretch is fine.
    engine
        .start_break(b.id, "alice", w("15:00", "15:30"), at(15, 0))
        .await
        .unwrap();
}

#[tokio::test]
async fn only_owner_can_mutate() {
    let engine = new_engine("owner_only.wal");
    let seat = add_seat(&engine, "1").await;
    let b = engine
        .book(request(seat, "alice", "a", w("09:00", "17:00")), at(8, 0))
        .await
        .unwrap();

    let err = engine.cancel(b.id, "mallory", None, at(8, 5)).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Forbidden);
    let err = engine
        .confirm_attendance(b.id, "mallory", true, at(9, 0))
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Forbidden);

    let err = engine
        .cancel(Ulid::new(), "alice", None, at(8, 5))
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::NotFound);
}

// ── Cancel ───────────────────────────────────────────────

#[tokio::test]
async fn cancel_is_terminal() {
    let engine = new_engine("cancel_terminal.wal");
    let seat = add_seat(&engine, "1").await;
    let b = engine
        .book(request(seat, "alice", "a", w("09:00", "17:00")), at(8, 0))
        .await
        .unwrap();

    let cancelled = engine
        .cancel(b.id, "alice", Some("meeting moved".into()), at(8, 5))
        .await
        .unwrap();
    assert_eq!(cancelled.status(), BookingStatus::Cancelled);
    assert_eq!(cancelled.cancellation_reason(), Some("meeting moved"));
    assert_eq!(cancelled.cancelled_at, Some(at(8, 5)));
    assert_eq!(seat_status(&engine, seat).await, SeatStatus::Available);

    let err = engine.cancel(b.id, "alice", None, at(8, 6)).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidTransition { status: BookingStatus::Cancelled, .. }
    ));
    assert_eq!(
        engine.get_booking(&b.id).await.unwrap().cancellation_reason(),
        Some("meeting moved")
    );
}

#[tokio::test]
async fn cancel_from_every_active_state() {
    let engine = new_engine("cancel_states.wal");
    let seat = add_seat(&engine, "1").await;

    let pending = engine
        .book(request(seat, "alice", "a", w("09:00", "10:00")), at(8, 0))
        .await
        .unwrap();
    engine.cancel(pending.id, "alice", None, at(8, 1)).await.unwrap();

    let confirmed = engine
        .book(request(seat, "alice", "a", w("10:00", "11:00")), at(8, 0))
        .await
        .unwrap();
    engine
        .confirm_attendance(confirmed.id, "alice", true, at(10, 0))
        .await
        .unwrap();
    engine.cancel(confirmed.id, "alice", None, at(10, 1)).await.unwrap();

    let breaking = engine
        .book(request(seat, "alice", "a", w("11:00", "13:00")), at(8, 0))
        .await
        .unwrap();
    engine
        .confirm_attendance(breaking.id, "alice", true, at(11, 0))
        .await
        .unwrap();
    engine
        .start_break(breaking.id, "alice", w("12:00", "12:30"), at(12, 0))
        .await
        .unwrap();
    let cancelled = engine
        .cancel(breaking.id, "alice", None, at(12, 1))
        .await
        .unwrap();
    assert_eq!(cancelled.status(), BookingStatus::Cancelled);
    assert!(cancelled.current_break().is_none());
    assert_eq!(cancelled.breaks.len(), 1);
    assert_eq!(seat_status(&engine, seat).await, SeatStatus::Available);
}

// ── Sweeper ──────────────────────────────────────────────

#[tokio::test]
async fn sweep_completes_no_shows_and_overdue_breaks() {
    let engine = new_engine("sweep_mix.wal");
    let s1 = add_seat(&engine, "1").await;
    let s2 = add_seat(&engine, "2").await;
    let s3 = add_seat(&engine, "3").await;

    // Over by 13:01
    let done = engine
        .book(request(s1, "alice", "a", w("10:00", "13:00")), at(9, 0))
        .await
        .unwrap();
    engine
        .confirm_attendance(done.id, "alice", true, at(10, 0))
        .await
        .unwrap();
    // Never confirmed
    let no_show = engine
        .book(request(s2, "bob", "b", w("12:00", "18:00")), at(9, 0))
        .await
        .unwrap();
    // Break ran over
    let breaker = engine
        .book(request(s3, "carol", "c", w("09:00", "17:00")), at(8, 0))
        .await
        .unwrap();
    engine
        .confirm_attendance(breaker.id, "carol", true, at(9, 0))
        .await
        .unwrap();
    engine
        .start_break(breaker.id, "carol", w("12:00", "13:00"), at(12, 0))
        .await
        .unwrap();

    let report = engine.sweep(at(13, 1)).await;
    assert_eq!(
        report,
        SweepReport {
            completed: 1,
            no_shows: 1,
            breaks_closed: 1,
            failed: 0
        }
    );

    let done = engine.get_booking(&done.id).await.unwrap();
    assert_eq!(done.status(), BookingStatus::Completed);
    assert_eq!(done.completed_at, Some(at(13, 1)));
    assert_eq!(seat_status(&engine, s1).await, SeatStatus::Available);

    let no_show = engine.get_booking(&no_show.id).await.unwrap();
    assert_eq!(no_show.cancellation_reason(), Some(NO_SHOW_REASON));

    let breaker = engine.get_booking(&breaker.id).await.unwrap();
    assert_eq!(breaker.status(), BookingStatus::Confirmed);
    assert_eq!(breaker.breaks.len(), 1);
    assert_eq!(seat_status(&engine, s3).await, SeatStatus::Occupied);
}

#[tokio::test]
async fn sweep_is_idempotent() {
    let engine = new_engine("sweep_idempotent.wal");
    let seat = add_seat(&engine, "1").await;
    let b = confirmed_all_day(&engine, seat).await;
    engine
        .start_break(b.id, "alice", w("12:00", "13:00"), at(12, 0))
        .await
        .unwrap();
    engine
        .book(request(seat, "bob", "b", w("12:15", "12:45")), at(12, 0))
        .await
        .unwrap();

    let first = engine.sweep(at(13, 5)).await;
    assert_eq!(first.breaks_closed, 1);
    assert_eq!(first.completed, 1);
    let snapshot = engine.bookings_for_seat(&seat, Some(day()), at(13, 5)).await.unwrap();

    let second = engine.sweep(at(13, 5)).await;
    assert!(second.is_empty(), "second sweep did work: {second:?}");
    assert_eq!(
        engine.bookings_for_seat(&seat, Some(day()), at(13, 5)).await.unwrap(),
        snapshot
    );
}

#[tokio::test]
async fn completion_beats_break_close() {
    let engine = new_engine("sweep_priority.wal");
    let seat = add_seat(&engine, "1").await;
    let b = engine
        .book(request(seat, "alice", "a", w("09:00", "12:00")), at(8, 0))
        .await
        .unwrap();
    engine
        .confirm_attendance(b.id, "alice", true, at(9, 0))
        .await
        .unwrap();
    engine
        .start_break(b.id, "alice", w("11:00", "12:00"), at(11, 0))
        .await
        .unwrap();

    assert_eq!(
        engine.sweep_booking(b.id, at(12, 30)).await.unwrap(),
        Some(Transition::Complete)
    );
    let b = engine.get_booking(&b.id).await.unwrap();
    assert_eq!(b.status(), BookingStatus::Completed);
    assert!(b.current_break().is_none());
}

#[tokio::test]
async fn sweep_leaves_wrapping_booking_until_next_day() {
    let engine = new_engine("sweep_wrap.wal");
    let seat = add_seat(&engine, "1").await;
    let b = engine
        .book(request(seat, "alice", "a", w("23:00", "01:00")), at(22, 0))
        .await
        .unwrap();
    engine
        .confirm_attendance(b.id, "alice", true, at(23, 0))
        .await
        .unwrap();

    assert!(engine.sweep(at(23, 59)).await.is_empty());
    let after_midnight = day().succ_opt().unwrap().and_hms_opt(1, 1, 0).unwrap();
    assert_eq!(engine.sweep(after_midnight).await.completed, 1);
}

#[tokio::test]
async fn member_sweep_only_touches_that_member() {
    let engine = new_engine("sweep_member.wal");
    let s1 = add_seat(&engine, "1").await;
    let s2 = add_seat(&engine, "2").await;
    let alice = engine
        .book(request(s1, "alice", "a", w("10:00", "11:00")), at(9, 0))
        .await
        .unwrap();
    let bob = engine
        .book(request(s2, "bob", "b", w("10:00", "11:00")), at(9, 0))
        .await
        .unwrap();

    let report = engine.sweep_member("alice", at(11, 30)).await;
    assert_eq!(report.completed, 1);
    assert_eq!(
        engine.get_booking(&alice.id).await.unwrap().status(),
        BookingStatus::Completed
    );
    assert_eq!(
        engine.get_booking(&bob.id).await.unwrap().status(),
        BookingStatus::Pending
    );

    let listed = engine.list_member_bookings("alice").await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, alice.id);
}

#[test]
fn due_transition_priorities() {
    let seat = Ulid::new();
    let mut b = Booking {
        id: Ulid::new(),
        seat_id: seat,
        member_id: "alice".into(),
        device_id: dev("a"),
        date: day(),
        window: w("10:00", "12:00"),
        state: BookingState::Pending,
        attendance_confirmed_at: None,
        breaks: BreakLog::default(),
        created_at: at(9, 0),
        completed_at: None,
        cancelled_at: None,
    };
    assert_eq!(due_transition(&b, at(10, 20)), None);
    assert_eq!(due_transition(&b, at(10, 21)), Some(Transition::NoShow));
    assert_eq!(due_transition(&b, at(12, 1)), Some(Transition::Complete));

    b.state = BookingState::OnBreak(ActiveBreak {
        window: w("10:30", "11:00"),
        started_at: at(10, 30),
    });
    assert_eq!(due_transition(&b, at(11, 0)), None);
    assert_eq!(due_transition(&b, at(11, 1)), Some(Transition::CloseBreak));

    b.state = BookingState::Completed;
    assert_eq!(due_transition(&b, at(23, 0)), None);
}

// ── Availability projection ──────────────────────────────

#[tokio::test]
async fn availability_annotations() {
    let engine = new_engine("availability.wal");
    let free = add_seat(&engine, "1").await;
    let busy = add_seat(&engine, "2").await;
    let broken = add_seat(&engine, "3").await;
    let fixing = add_seat(&engine, "4").await;

    confirmed_all_day_on(&engine, busy, "alice", "a").await;
    let b = confirmed_all_day_on(&engine, broken, "bob", "b").await;
    engine
        .start_break(b.id, "bob", w("12:00", "13:00"), at(12, 0))
        .await
        .unwrap();
    engine.set_maintenance(fixing, true).await.unwrap();

    let filter = SeatFilter::default();
    let rows = engine
        .seat_availability(&filter, Some((day(), w("12:15", "12:45"))), at(12, 15))
        .await;
    let by_id = |id: Ulid| rows.iter().find(|r| r.seat.id == id).unwrap().annotation;
    assert_eq!(by_id(free), Some(SeatAnnotation::Available));
    assert_eq!(by_id(busy), Some(SeatAnnotation::Booked));
    assert_eq!(by_id(broken), Some(SeatAnnotation::AvailableInBreak));
    assert_eq!(by_id(fixing), Some(SeatAnnotation::Maintenance));

    let rows = engine
        .seat_availability(&filter, Some((day(), w("11:30", "12:30"))), at(12, 15))
        .await;
    let by_id = |id: Ulid| rows.iter().find(|r| r.seat.id == id).unwrap().annotation;
    assert_eq!(by_id(broken), Some(SeatAnnotation::OnBreakUnavailable));

    let plain = engine.seat_availability(&filter, None, at(12, 15)).await;
    assert_eq!(plain.len(), 4);
    assert!(plain.iter().all(|r| r.annotation.is_none()));
    let numbers: Vec<_> = plain.iter().map(|r| r.seat.number.as_str()).collect();
    assert_eq!(numbers, vec!["1", "2", "3", "4"]);
}

async fn confirmed_all_day_on(engine: &Engine, seat: Ulid, member: &str, device: &str) -> Booking {
    let b = engine
        .book(request(seat, member, device, w("09:00", "17:00")), at(8, 0))
        .await
        .unwrap();
    engine
        .confirm_attendance(b.id, member, true, at(9, 5))
        .await
        .unwrap()
}

#[tokio::test]
async fn availability_filter_by_location() {
    let engine = new_engine("availability_filter.wal");
    add_seat(&engine, "1").await;
    engine
        .create_seat(Seat {
            id: Ulid::new(),
            building: "Annex".into(),
            floor: "1".into(),
            section: "open".into(),
            number: "7".into(),
        })
        .await
        .unwrap();

    let filter = SeatFilter {
        building: Some("Annex".into()),
        ..Default::default()
    };
    let rows = engine.seat_availability(&filter, None, at(8, 0)).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].seat.number, "7");
}

/// The projector and the seat pass must agree for every probe window.
#[test]
fn projector_and_resolver_agree() {
    let mut rs = SeatState::new(Seat {
        id: Ulid::new(),
        building: "Main".into(),
        floor: "2".into(),
        section: "quiet".into(),
        number: "1".into(),
    });
    let existing = |window: Window, state: BookingState| Booking {
        id: Ulid::new(),
        seat_id: rs.id(),
        member_id: "x".into(),
        device_id: dev("x"),
        date: day(),
        window,
        state,
        attendance_confirmed_at: None,
        breaks: BreakLog::default(),
        created_at: at(0, 0),
        completed_at: None,
        cancelled_at: None,
    };
    let bookings = vec![
        existing(
            w("09:00", "13:00"),
            BookingState::OnBreak(ActiveBreak {
                window: w("10:00", "11:00"),
                started_at: at(10, 0),
            }),
        ),
        existing(w("10:15", "10:45"), BookingState::Pending),
        existing(w("14:00", "15:00"), BookingState::Confirmed),
        existing(w("22:00", "01:00"), BookingState::Confirmed),
        existing(w("16:00", "17:00"), BookingState::Cancelled { reason: None }),
    ];
    for b in bookings {
        rs.insert_booking(b);
    }

    let mut probes = Vec::new();
    for start in (0..24 * 60).step_by(15) {
        for len in [15, 30, 60, 120] {
            let s = TimeOfDay::from_hm(start / 60, start % 60).unwrap();
            let e_min = (start + len) % (24 * 60);
            let e = TimeOfDay::from_hm(e_min / 60, e_min % 60).unwrap();
            probes.push(Window::new(s, e).unwrap());
        }
    }

    for probe in probes {
        let projected = annotate(&rs, day(), &probe).is_bookable();
        let resolved = check_seat(&rs, day(), &probe).is_ok();
        assert_eq!(projected, resolved, "disagree on {probe}");
    }

    rs.status = SeatStatus::Maintenance;
    let probe = w("18:00", "19:00");
    assert!(!annotate(&rs, day(), &probe).is_bookable());
    assert!(check_seat(&rs, day(), &probe).is_err());
}

// ── End to end ───────────────────────────────────────────

#[tokio::test]
async fn end_to_end_break_sublet_and_completion() {
    let engine = new_engine("end_to_end.wal");
    let s1 = add_seat(&engine, "S1").await;

    let b = engine
        .book(request(s1, "alice", "abc", w("10:00", "12:00")), at(9, 30))
        .await
        .unwrap();
    assert_eq!(b.status(), BookingStatus::Pending);

    let b = engine
        .confirm_attendance(b.id, "alice", true, at(10, 5))
        .await
        .unwrap();
    assert_eq!(b.status(), BookingStatus::Confirmed);

    let b = engine
        .start_break(b.id, "alice", w("10:30", "11:00"), at(10, 30))
        .await
        .unwrap();
    assert_eq!(b.status(), BookingStatus::OnBreak);
    assert!(b.current_break().is_some());

    engine
        .book(request(s1, "bob", "xyz", w("10:30", "11:00")), at(10, 31))
        .await
        .unwrap();

    let b = engine.end_break(b.id, "alice", at(11, 0)).await.unwrap();
    assert_eq!(b.status(), BookingStatus::Confirmed);
    let closed: Vec<_> = b.breaks.iter().map(|c| c.window).collect();
    assert_eq!(closed, vec![w("10:30", "11:00")]);

    engine.sweep(at(12, 1)).await;
    let b = engine.get_booking(&b.id).await.unwrap();
    assert_eq!(b.status(), BookingStatus::Completed);
    assert_eq!(seat_status(&engine, s1).await, SeatStatus::Available);
}

// ── Persistence ──────────────────────────────────────────

#[tokio::test]
async fn replay_restores_state() {
    let path = test_wal_path("replay_restore.wal");
    let (seat, booking_id) = {
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap();
        let seat = add_seat(&engine, "1").await;
        let b = confirmed_all_day(&engine, seat).await;
        engine
            .start_break(b.id, "alice", w("12:00", "13:00"), at(12, 0))
            .await
            .unwrap();
        engine.end_break(b.id, "alice", at(13, 0)).await.unwrap();
        engine
            .start_break(b.id, "alice", w("15:00", "15:30"), at(15, 0))
            .await
            .unwrap();
        (seat, b.id)
    };

    let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    let b = engine.get_booking(&booking_id).await.unwrap();
    assert_eq!(b.status(), BookingStatus::OnBreak);
    assert_eq!(b.breaks.len(), 1);
    assert_eq!(b.current_break().unwrap().window, w("15:00", "15:30"));
    assert_eq!(seat_status(&engine, seat).await, SeatStatus::OnBreak);

    // The device index comes back too.
    let other = add_seat(&engine, "2").await;
    let err = engine
        .book(request(other, "zed", "a", w("16:00", "16:30")), at(15, 5))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::DeviceConflict(_)));
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compaction.wal");
    let (seat, kept, gone) = {
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap();
        let seat = add_seat(&engine, "1").await;
        let kept = confirmed_all_day(&engine, seat).await;
        engine
            .start_break(kept.id, "alice", w("12:00", "13:00"), at(12, 0))
            .await
            .unwrap();
        let gone = engine
            .book(request(seat, "bob", "b", w("12:00", "13:00")), at(12, 0))
            .await
            .unwrap();
        engine
            .cancel(gone.id, "bob", Some("changed plans".into()), at(12, 1))
            .await
            .unwrap();
        assert!(engine.wal_appends_since_compact().await > 0);

        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        // Appends after compaction land in the new file.
        engine.end_break(kept.id, "alice", at(13, 0)).await.unwrap();
        (seat, kept.id, gone.id)
    };

    let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    let kept = engine.get_booking(&kept).await.unwrap();
    assert_eq!(kept.status(), BookingStatus::Confirmed);
    assert_eq!(kept.breaks.len(), 1);
    let gone = engine.get_booking(&gone).await.unwrap();
    assert_eq!(gone.cancellation_reason(), Some("changed plans"));
    assert_eq!(seat_status(&engine, seat).await, SeatStatus::Occupied);
}

#[tokio::test]
async fn compaction_keeps_maintenance() {
    let path = test_wal_path("compaction_maintenance.wal");
    let seat = {
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap();
        let seat = add_seat(&engine, "1").await;
        engine.set_maintenance(seat, true).await.unwrap();
        engine.compact_wal().await.unwrap();
        seat
    };
    let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    assert_eq!(seat_status(&engine, seat).await, SeatStatus::Maintenance);
}

// ── Notifications & limits ───────────────────────────────

#[tokio::test]
async fn mutations_publish_notifications() {
    let engine = new_engine("notify.wal");
    let seat = add_seat(&engine, "1").await;
    let mut rx = engine.notify.subscribe(seat);

    let b = engine
        .book(request(seat, "alice", "a", w("10:00", "11:00")), at(9, 0))
        .await
        .unwrap();
    engine.cancel(b.id, "alice", None, at(9, 1)).await.unwrap();

    let kinds: Vec<_> = (0..3).map(|_| rx.try_recv().unwrap().kind).collect();
    assert_eq!(
        kinds,
        vec![
            NotificationKind::Booked,
            NotificationKind::Cancelled,
            NotificationKind::Freed
        ]
    );
}

#[tokio::test]
async fn seat_fields_validated() {
    let engine = new_engine("seat_validation.wal");
    let err = engine
        .create_seat(Seat {
            id: Ulid::new(),
            building: "".into(),
            floor: "1".into(),
            section: "a".into(),
            number: "1".into(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Validation);

    let id = add_seat(&engine, "1").await;
    let dup = engine
        .create_seat(Seat {
            id,
            building: "Main".into(),
            floor: "2".into(),
            section: "quiet".into(),
            number: "1".into(),
        })
        .await
        .unwrap_err();
    assert!(matches!(dup, EngineError::AlreadyExists(_)));
}

#[tokio::test]
async fn failed_guard_leaves_record_untouched() {
    let engine = new_engine("no_partial_writes.wal");
    let seat = add_seat(&engine, "1").await;
    let b = confirmed_all_day(&engine, seat).await;
    let before = engine.get_booking(&b.id).await.unwrap();

    let _ = engine
        .start_break(b.id, "alice", w("08:00", "09:30"), at(8, 0))
        .await
        .unwrap_err();
    let _ = engine.end_break(b.id, "alice", at(10, 0)).await.unwrap_err();
    let _ = engine
        .confirm_attendance(b.id, "alice", true, at(10, 0))
        .await
        .unwrap_err();

    assert_eq!(engine.get_booking(&b.id).await.unwrap(), before);
    assert_eq!(seat_status(&engine, seat).await, SeatStatus::Occupied);
}
