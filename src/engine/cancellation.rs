use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    /// Cancel a reservation on behalf of `user_id`.
    ///
    /// `Ok(false)` when no such reservation exists (never existed, already
    /// cancelled, or gone with its room). Only the owner may cancel.
    pub async fn cancel_booking(
        &self,
        reservation_id: ReservationId,
        user_id: UserId,
    ) -> Result<bool, EngineError> {
        let Some(room_id) = self.room_for_reservation(reservation_id) else {
            return Ok(false);
        };
        let guard = match self.lock_room(room_id).await {
            Ok(guard) => guard,
            Err(EngineError::RoomNotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };

        // Re-read under the lock: a concurrent cancel may have won.
        let Some(owner) = guard.reservation(reservation_id).map(|r| r.user_id) else {
            return Ok(false);
        };
        if owner != user_id {
            tracing::info!(
                "user {user_id} denied cancelling reservation {reservation_id} owned by {owner}"
            );
            return Err(EngineError::PermissionDenied { reservation_id });
        }

        let event = Event::ReservationCancelled {
            id: reservation_id,
            room_id,
        };
        self.persist_and_apply(guard, event).await?;
        tracing::info!(
            "reservation {reservation_id} on room {room_id} cancelled by user {user_id}"
        );
        Ok(true)
    }
}
