use chrono::{NaiveDate, Utc};

use crate::limits::MAX_RESERVATIONS_PER_ROOM;
use crate::model::*;
use crate::observability;

use super::availability::count_booked;
use super::pricing::total_price;
use super::queries::stay_range;
use super::{Engine, EngineError};

impl Engine {
    /// Admit or reject one booking request.
    ///
    /// The room's write lock is held from the availability count through the
    /// journal append and the insert, so two admissions on one room can never
    /// both observe the last free unit.
    pub async fn create_booking(
        &self,
        room_id: RoomId,
        user_id: UserId,
        date_from: NaiveDate,
        date_to: NaiveDate,
    ) -> Result<Reservation, EngineError> {
        let result = self.admit(room_id, user_id, date_from, date_to).await;
        metrics::counter!(
            observability::ADMISSIONS_TOTAL,
            "outcome" => admission_outcome(&result)
        )
        .increment(1);
        match &result {
            Ok(r) => tracing::info!(
                "booking {} admitted: room {room_id}, user {user_id}, {date_from}..{date_to}, total {}",
                r.id,
                r.total_price
            ),
            Err(e) if e.is_client_error() => {
                tracing::debug!("booking rejected: room {room_id}, user {user_id}: {e}")
            }
            Err(_) => {}
        }
        result
    }

    async fn admit(
        &self,
        room_id: RoomId,
        user_id: UserId,
        date_from: NaiveDate,
        date_to: NaiveDate,
    ) -> Result<Reservation, EngineError> {
        let guard = self.lock_room(room_id).await?;
        let stay = stay_range(date_from, date_to)?;

        if count_booked(&guard, &stay) >= guard.total_units as usize {
            return Err(EngineError::RoomUnavailable {
                room_id,
                total_units: guard.total_units,
            });
        }
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many reservations on room"));
        }

        let reservation = Reservation {
            id: self.allocate_reservation_id(),
            room_id,
            user_id,
            date_from,
            date_to,
            total_price: total_price(guard.nightly_price, date_from, date_to)?,
            created_at: Utc::now(),
        };
        let event = Event::ReservationCreated {
            reservation: reservation.clone(),
        };
        self.persist_and_apply(guard, event).await?;
        Ok(reservation)
    }
}

fn admission_outcome(result: &Result<Reservation, EngineError>) -> &'static str {
    match result {
        Ok(_) => "admitted",
        Err(EngineError::RoomUnavailable { .. }) => "unavailable",
        Err(EngineError::RoomNotFound(_)) => "room_not_found",
        Err(EngineError::InvalidDateRange { .. } | EngineError::InvalidStay(_)) => "invalid",
        Err(EngineError::LimitExceeded(_)) => "limit_exceeded",
        Err(EngineError::Storage(_)) => "storage_error",
        Err(_) => "error",
    }
}
