use std::cmp::Reverse;

use chrono::NaiveDate;

use crate::limits::MAX_PER_PAGE;
use crate::model::*;

use super::availability::{count_booked, snapshot};
use super::{Engine, EngineError, SharedRoomState};

pub(super) fn stay_range(from: NaiveDate, to: NaiveDate) -> Result<StayRange, EngineError> {
    StayRange::new(from, to).ok_or(EngineError::InvalidDateRange { from, to })
}

pub(super) fn check_page(page: Page) -> Result<Page, EngineError> {
    if page.page < 1 {
        return Err(EngineError::InvalidPage("page must be at least 1"));
    }
    if page.per_page < 1 || page.per_page > MAX_PER_PAGE {
        return Err(EngineError::InvalidPage("per_page must be between 1 and 20"));
    }
    Ok(page)
}

/// Newest stays first; ties broken by id, newest first.
fn sort_bookings(bookings: &mut [Reservation]) {
    bookings.sort_by_key(|r| Reverse((r.date_from, r.id)));
}

impl Engine {
    pub async fn get_room(&self, room_id: RoomId) -> Option<RoomInfo> {
        let rs = self.get_room_state(room_id)?;
        let guard = rs.read().await;
        Some(guard.info())
    }

    /// All rooms, or one hotel's, ordered by id.
    pub async fn list_rooms(&self, hotel_id: Option<HotelId>) -> Vec<RoomInfo> {
        let mut rooms = Vec::new();
        for rs in self.room_states(hotel_id) {
            rooms.push(rs.read().await.info());
        }
        rooms
    }

    pub async fn get_reservation(&self, id: ReservationId) -> Option<Reservation> {
        let rs = self.get_room_state(self.room_for_reservation(id)?)?;
        let guard = rs.read().await;
        guard.reservation(id).cloned()
    }

    /// Reservations on `room_id` overlapping `[date_from, date_to)`.
    /// An unknown room has none.
    pub async fn count_booked(
        &self,
        room_id: RoomId,
        date_from: NaiveDate,
        date_to: NaiveDate,
    ) -> Result<usize, EngineError> {
        let stay = stay_range(date_from, date_to)?;
        let Some(rs) = self.get_room_state(room_id) else {
            return Ok(0);
        };
        let guard = rs.read().await;
        Ok(count_booked(&guard, &stay))
    }

    pub async fn room_availability(
        &self,
        room_id: RoomId,
        date_from: NaiveDate,
        date_to: NaiveDate,
    ) -> Result<RoomAvailability, EngineError> {
        let stay = stay_range(date_from, date_to)?;
        let rs = self
            .get_room_state(room_id)
            .ok_or(EngineError::RoomNotFound(room_id))?;
        let guard = rs.read().await;
        Ok(snapshot(&guard, &stay))
    }

    pub async fn list_user_bookings(
        &self,
        user_id: UserId,
        page: Page,
    ) -> Result<Vec<Reservation>, EngineError> {
        let page = check_page(page)?;
        let mut bookings = self.collect_bookings(|r| r.user_id == user_id).await;
        sort_bookings(&mut bookings);
        Ok(page.apply(bookings))
    }

    pub async fn list_all_bookings(&self, page: Page) -> Result<Vec<Reservation>, EngineError> {
        let page = check_page(page)?;
        let mut bookings = self.collect_bookings(|_| true).await;
        sort_bookings(&mut bookings);
        Ok(page.apply(bookings))
    }

    /// Rooms of `hotel_id` with at least one free unit over the whole stay,
    /// ordered by room id. A snapshot: nothing is reserved.
    pub async fn list_available_rooms(
        &self,
        hotel_id: HotelId,
        date_from: NaiveDate,
        date_to: NaiveDate,
        page: Page,
    ) -> Result<Vec<AvailableRoom>, EngineError> {
        let stay = stay_range(date_from, date_to)?;
        let page = check_page(page)?;

        let mut available = Vec::new();
        for rs in self.room_states(Some(hotel_id)) {
            let guard = rs.read().await;
            let snap = snapshot(&guard, &stay);
            if snap.free_units > 0 {
                available.push(AvailableRoom {
                    room: guard.info(),
                    free_units: snap.free_units,
                });
            }
        }
        Ok(page.apply(available))
    }

    /// Shared handles for every room (or one hotel's), ordered by id. Taken
    /// up front so no map shard stays locked across an await.
    fn room_states(&self, hotel_id: Option<HotelId>) -> Vec<SharedRoomState> {
        let ids: Vec<RoomId> = match hotel_id {
            Some(h) => self
                .hotel_rooms
                .get(&h)
                .map(|ids| ids.value().clone())
                .unwrap_or_default(),
            None => {
                let mut ids: Vec<RoomId> = self.rooms.iter().map(|e| *e.key()).collect();
                ids.sort_unstable();
                ids
            }
        };
        ids.into_iter()
            .filter_map(|id| self.get_room_state(id))
            .collect()
    }

    async fn collect_bookings(&self, keep: impl Fn(&Reservation) -> bool) -> Vec<Reservation> {
        let mut bookings = Vec::new();
        for rs in self.room_states(None) {
            let guard = rs.read().await;
            bookings.extend(guard.reservations.iter().filter(|r| keep(r)).cloned());
        }
        bookings
    }
}
