use chrono::NaiveDate;
use thiserror::Error;

use crate::model::{ReservationId, RoomId};

use super::pricing::PricingError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("room not found: {0}")]
    RoomNotFound(RoomId),
    #[error("invalid date range: check-in {from} must be before check-out {to}")]
    InvalidDateRange { from: NaiveDate, to: NaiveDate },
    #[error("invalid stay: {0}")]
    InvalidStay(#[from] PricingError),
    #[error("room {room_id} unavailable: all {total_units} units booked for the requested dates")]
    RoomUnavailable { room_id: RoomId, total_units: u32 },
    #[error("permission denied: reservation {reservation_id} belongs to another user")]
    PermissionDenied { reservation_id: ReservationId },
    #[error("invalid room: {0}")]
    InvalidRoom(&'static str),
    #[error("invalid pagination: {0}")]
    InvalidPage(&'static str),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("storage error: {0}")]
    Storage(String),
}

impl EngineError {
    /// Expected, typed outcomes the caller caused. Everything else is an
    /// infrastructure fault the caller may retry.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, EngineError::Storage(_))
    }
}
