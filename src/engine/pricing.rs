use chrono::NaiveDate;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PricingError {
    #[error("stay must last at least one night, got {nights}")]
    NonPositiveStay { nights: i64 },
    #[error("total price overflows")]
    Overflow,
}

/// Total price of a stay: `nightly_price * nights`.
///
/// Call with the room's price at the moment of booking; the result is frozen
/// into the reservation and never recomputed.
pub fn total_price(
    nightly_price: i64,
    date_from: NaiveDate,
    date_to: NaiveDate,
) -> Result<i64, PricingError> {
    let nights = (date_to - date_from).num_days();
    if nights <= 0 {
        return Err(PricingError::NonPositiveStay { nights });
    }
    nightly_price
        .checked_mul(nights)
        .ok_or(PricingError::Overflow)
}
