use chrono::NaiveDate;
use dashmap::DashMap;
use ulid::Ulid;

use crate::device::DeviceId;
use crate::model::*;

/// An active booking as seen from its device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSlot {
    pub booking_id: Ulid,
    pub date: NaiveDate,
    pub window: Window,
}

/// Cross-seat lookups kept beside the per-seat state.
#[derive(Default)]
pub struct Indexes {
    booking_to_seat: DashMap<Ulid, Ulid>,
    /// Active bookings only.
    device_slots: DashMap<DeviceId, Vec<DeviceSlot>>,
    member_bookings: DashMap<String, Vec<Ulid>>,
}

impl Indexes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seat_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_seat.get(booking_id).map(|e| *e.value())
    }

    pub fn member_bookings(&self, member_id: &str) -> Vec<Ulid> {
        self.member_bookings
            .get(member_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// First active booking by `device` on `date` overlapping `window`.
    pub fn device_overlap(&self, device: &DeviceId, date: NaiveDate, window: &Window) -> Option<Ulid> {
        let slots = self.device_slots.get(device)?;
        slots
            .iter()
            .find(|s| s.date == date && s.window.overlaps(window))
            .map(|s| s.booking_id)
    }

    /// Record a booking. Inactive bookings (restored snapshots) skip the device index.
    pub fn track(&self, booking: &Booking) {
        self.booking_to_seat.insert(booking.id, booking.seat_id);
        self.member_bookings
            .entry(booking.member_id.clone())
            .or_default()
            .push(booking.id);
        if booking.is_active() {
            self.device_slots
                .entry(booking.device_id.clone())
                .or_default()
                .push(DeviceSlot {
                    booking_id: booking.id,
                    date: booking.date,
                    window: booking.window,
                });
        }
    }

    /// Drop a booking from the device index once it leaves the active states.
    pub fn release_device(&self, device: &DeviceId, booking_id: &Ulid) {
        let emptied = match self.device_slots.get_mut(device) {
            Some(mut slots) => {
                slots.retain(|s| s.booking_id != *booking_id);
                slots.is_empty()
            }
            None => false,
        };
        if emptied {
            self.device_slots.remove_if(device, |_, slots| slots.is_empty());
        }
    }
}
