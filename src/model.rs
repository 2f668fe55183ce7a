use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub type RoomId = i64;
pub type HotelId = i64;
pub type UserId = i64;
pub type ReservationId = i64;

/// Half-open overlap test on `[a_from, a_to)` and `[b_from, b_to)`.
///
/// The only definition of "two stays conflict". A checkout on the same day as
/// another guest's check-in does not overlap.
pub fn overlaps(a_from: NaiveDate, a_to: NaiveDate, b_from: NaiveDate, b_to: NaiveDate) -> bool {
    a_from < b_to && a_to > b_from
}

/// A validated stay `[from, to)`, at least one night long.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StayRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl StayRange {
    /// Returns `None` when `from >= to`.
    pub fn new(from: NaiveDate, to: NaiveDate) -> Option<Self> {
        (from < to).then_some(Self { from, to })
    }

    pub fn overlaps(&self, other: &StayRange) -> bool {
        overlaps(self.from, self.to, other.from, other.to)
    }
}

/// One booked unit of a room type. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub room_id: RoomId,
    pub user_id: UserId,
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    /// Price frozen at admission: nightly price at that moment times nights.
    pub total_price: i64,
    pub created_at: DateTime<Utc>,
}

impl Reservation {
    pub fn stay(&self) -> StayRange {
        StayRange {
            from: self.date_from,
            to: self.date_to,
        }
    }
}

/// Live state of one room type: its inventory record plus every reservation
/// currently holding one of its units.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub id: RoomId,
    pub hotel_id: HotelId,
    /// Smallest currency unit, never negative.
    pub nightly_price: i64,
    /// Interchangeable units of this type.
    pub total_units: u32,
    /// Sorted by `date_from`.
    pub reservations: Vec<Reservation>,
}

impl RoomState {
    pub fn new(id: RoomId, hotel_id: HotelId, nightly_price: i64, total_units: u32) -> Self {
        Self {
            id,
            hotel_id,
            nightly_price,
            total_units,
            reservations: Vec::new(),
        }
    }

    pub fn info(&self) -> RoomInfo {
        RoomInfo {
            id: self.id,
            hotel_id: self.hotel_id,
            nightly_price: self.nightly_price,
            total_units: self.total_units,
        }
    }

    /// Insert keeping the list sorted by `date_from`.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.date_from <= reservation.date_from);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove_reservation(&mut self, id: ReservationId) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn reservation(&self, id: ReservationId) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    /// Reservations whose stay overlaps `query`.
    /// Everything from the first reservation starting on or after `query.to` is skipped.
    pub fn overlapping(&self, query: &StayRange) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.date_from < query.to);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.stay().overlaps(query))
    }
}

/// Journal record: one variant per committed state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RoomUpserted {
        id: RoomId,
        hotel_id: HotelId,
        nightly_price: i64,
        total_units: u32,
    },
    /// Cascades to every reservation of the room.
    RoomDeleted {
        id: RoomId,
    },
    ReservationCreated {
        reservation: Reservation,
    },
    ReservationCancelled {
        id: ReservationId,
        room_id: RoomId,
    },
    /// Written at the head of a compacted journal so ids of reservations that
    /// were cancelled before compaction are never handed out again.
    ReservationIdFloor {
        next_id: ReservationId,
    },
}

/// 1-based pagination, as the booking listings expose it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub page: u32,
    pub per_page: u32,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: 10,
        }
    }
}

impl Page {
    pub fn offset(&self) -> usize {
        (self.page.saturating_sub(1) as usize) * self.per_page as usize
    }

    /// Slice one page out of an already ordered list.
    pub fn apply<T>(&self, items: Vec<T>) -> Vec<T> {
        items
            .into_iter()
            .skip(self.offset())
            .take(self.per_page as usize)
            .collect()
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInfo {
    pub id: RoomId,
    pub hotel_id: HotelId,
    pub nightly_price: i64,
    pub total_units: u32,
}

/// A room with units left for the requested stay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailableRoom {
    pub room: RoomInfo,
    pub free_units: u32,
}

/// Occupancy snapshot of one room over one stay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomAvailability {
    pub room_id: RoomId,
    pub total_units: u32,
    pub booked: usize,
    pub free_units: u32,
}
