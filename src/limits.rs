// Hard caps on state the engine keeps in memory.

/// Maximum rooms registered at once.
pub const MAX_ROOMS: usize = 100_000;

/// Maximum live reservations on a single room.
pub const MAX_RESERVATIONS_PER_ROOM: usize = 50_000;

/// Largest `per_page` a listing accepts.
pub const MAX_PER_PAGE: u32 = 20;
