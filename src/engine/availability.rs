use crate::model::*;

// ── Availability ─────────────────────────────────────────────────

/// Number of committed reservations on `room` whose stay overlaps `query`.
pub fn count_booked(room: &RoomState, query: &StayRange) -> usize {
    room.overlapping(query).count()
}

/// Units still free over the whole of `query`: `total_units - count_booked`,
/// clamped at zero.
///
/// A snapshot only. Admission must hold the room's write lock between this
/// check and the insert for the answer to stay true.
pub fn free_units(room: &RoomState, query: &StayRange) -> u32 {
    snapshot(room, query).free_units
}

pub fn snapshot(room: &RoomState, query: &StayRange) -> RoomAvailability {
    let booked = count_booked(room, query);
    RoomAvailability {
        room_id: room.id,
        total_units: room.total_units,
        booked,
        free_units: room
            .total_units
            .saturating_sub(u32::try_from(booked).unwrap_or(u32::MAX)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn stay(from: &str, to: &str) -> StayRange {
        StayRange::new(d(from), d(to)).unwrap()
    }

    fn room_with(total_units: u32, stays: &[(&str, &str)]) -> RoomState {
        let mut rs = RoomState::new(1, 1, 100, total_units);
        for (i, (from, to)) in stays.iter().enumerate() {
            rs.insert_reservation(Reservation {
                id: i as ReservationId + 1,
                room_id: 1,
                user_id: 1,
                date_from: d(from),
                date_to: d(to),
                total_price: 0,
                created_at: Utc::now(),
            });
        }
        rs
    }

    #[test]
    fn empty_room_is_fully_free() {
        let rs = room_with(3, &[]);
        let q = stay("2025-03-01", "2025-03-03");
        assert_eq!(count_booked(&rs, &q), 0);
        assert_eq!(free_units(&rs, &q), 3);
    }

    #[test]
    fn free_units_drop_by_one_per_overlapping_booking() {
        let q = stay("2025-03-01", "2025-03-05");
        for n in 0..=4usize {
            let stays: Vec<_> = (0..n).map(|_| ("2025-03-01", "2025-03-05")).collect();
            let rs = room_with(4, &stays);
            assert_eq!(free_units(&rs, &q), 4 - n as u32);
        }
    }

    #[test]
    fn free_units_clamp_at_zero() {
        // More bookings than units can exist after an administrative downsize.
        let rs = room_with(
            1,
            &[("2025-03-01", "2025-03-05"), ("2025-03-02", "2025-03-04")],
        );
        let q = stay("2025-03-01", "2025-03-05");
        assert_eq!(count_booked(&rs, &q), 2);
        assert_eq!(free_units(&rs, &q), 0);
    }

    #[test]
    fn non_overlapping_bookings_ignored() {
        let rs = room_with(
            1,
            &[("2025-02-25", "2025-03-01"), ("2025-03-05", "2025-03-07")],
        );
        let q = stay("2025-03-01", "2025-03-05");
        assert_eq!(free_units(&rs, &q), 1);
    }

    #[test]
    fn count_is_per_overlap_not_per_night() {
        // Two disjoint bookings inside the query both count, even though they
        // never occupy the same night.
        let rs = room_with(
            2,
            &[("2025-03-01", "2025-03-02"), ("2025-03-03", "2025-03-04")],
        );
        let q = stay("2025-03-01", "2025-03-05");
        assert_eq!(count_booked(&rs, &q), 2);
        assert_eq!(free_units(&rs, &q), 0);
    }

    #[test]
    fn zero_unit_room_never_free() {
        let rs = room_with(0, &[]);
        assert_eq!(free_units(&rs, &stay("2025-03-01", "2025-03-02")), 0);
    }

    #[test]
    fn snapshot_reports_all_counts() {
        let rs = room_with(3, &[("2025-03-01", "2025-03-03")]);
        let snap = snapshot(&rs, &stay("2025-03-02", "2025-03-04"));
        assert_eq!(
            snap,
            RoomAvailability {
                room_id: 1,
                total_units: 3,
                booked: 1,
                free_units: 2,
            }
        );
    }
}
