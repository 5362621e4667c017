use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationKind {
    Booked,
    Freed,
    Confirmed,
    Cancelled,
    BreakStarted,
    BreakEnded,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub kind: NotificationKind,
    pub seat_id: Ulid,
    pub booking_id: Ulid,
}

impl Notification {
    /// Notifications implied by a committed event. Seat-level events and
    /// compaction snapshots produce none.
    pub fn from_event(event: &Event) -> Vec<Notification> {
        use NotificationKind::*;
        let (booking_id, kinds) = match event {
            Event::BookingCreated { id, .. } => (*id, vec![Booked]),
            Event::AttendanceConfirmed { id, .. } => (*id, vec![Confirmed]),
            Event::BreakStarted { id, .. } => (*id, vec![BreakStarted]),
            Event::BreakEnded { id, .. } => (*id, vec![BreakEnded]),
            Event::BookingCancelled { id, .. } => (*id, vec![Cancelled, Freed]),
            Event::BookingCompleted { id, .. } => (*id, vec![Completed, Freed]),
            Event::SeatCreated { .. }
            | Event::SeatStatusChanged { .. }
            | Event::BookingRestored { .. } => return Vec::new(),
        };
        let seat_id = event.seat_id();
        kinds
            .into_iter()
            .map(|kind| Notification { kind, seat_id, booking_id })
            .collect()
    }
}

/// Broadcast hub of booking notifications per seat. Fire-and-forget.
///
/// This is the hook for push delivery: an embedding process subscribes
/// through `Engine::notify` and forwards what it receives. Nothing in the
/// server itself listens.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Notification>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to notifications for a seat. Creates the channel if needed.
    pub fn subscribe(&self, seat_id: Ulid) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(seat_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Publish everything an event implies. No-op if nobody is listening.
    pub fn publish(&self, event: &Event) {
        let Some(sender) = self.channels.get(&event.seat_id()) else {
            return;
        };
        for notification in Notification::from_event(event) {
            let _ = sender.send(notification);
        }
    }
}
