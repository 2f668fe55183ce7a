use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};

use crate::limits::MAX_ROOMS;
use crate::model::*;

use super::{commit, wal_append, Engine, EngineError, WalCommand};

impl Engine {
    /// Create a room, or change price and unit count of an existing one.
    ///
    /// Existing reservations keep their frozen price. Lowering `total_units`
    /// below what is already booked is allowed; admissions simply fail until
    /// units free up.
    pub async fn upsert_room(
        &self,
        id: RoomId,
        hotel_id: HotelId,
        nightly_price: i64,
        total_units: u32,
    ) -> Result<RoomInfo, EngineError> {
        if nightly_price < 0 {
            return Err(EngineError::InvalidRoom("nightly price must not be negative"));
        }
        let catalog = self.catalog.clone().lock_owned().await;
        let event = Event::RoomUpserted {
            id,
            hotel_id,
            nightly_price,
            total_units,
        };

        if self.rooms.contains_key(&id) {
            let guard = self.lock_room(id).await?;
            if guard.hotel_id != hotel_id {
                return Err(EngineError::InvalidRoom("room belongs to another hotel"));
            }
            let guard = self.persist_and_apply(guard, event).await?;
            tracing::info!("room {id} updated: price {nightly_price}, units {total_units}");
            return Ok(guard.info());
        }

        if self.rooms.len() >= MAX_ROOMS {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        let wal_tx = self.wal_tx.clone();
        let rooms = self.rooms.clone();
        let hotel_rooms = self.hotel_rooms.clone();
        let info = commit(async move {
            let _catalog = catalog;
            wal_append(&wal_tx, &event).await?;
            let rs = RoomState::new(id, hotel_id, nightly_price, total_units);
            let info = rs.info();
            rooms.insert(id, Arc::new(RwLock::new(rs)));
            let mut hotel = hotel_rooms.entry(hotel_id).or_default();
            if let Err(pos) = hotel.binary_search(&id) {
                hotel.insert(pos, id);
            }
            Ok(info)
        })
        .await?;
        tracing::info!(
            "room {id} created in hotel {hotel_id}: price {nightly_price}, units {total_units}"
        );
        Ok(info)
    }

    /// Remove a room and every reservation on it. Returns how many
    /// reservations went with it.
    pub async fn delete_room(&self, id: RoomId) -> Result<usize, EngineError> {
        let catalog = self.catalog.clone().lock_owned().await;
        let guard = self.lock_room(id).await?;

        let wal_tx = self.wal_tx.clone();
        let rooms = self.rooms.clone();
        let index = self.reservation_to_room.clone();
        let hotel_rooms = self.hotel_rooms.clone();
        let cascaded = commit(async move {
            let _catalog = catalog;
            wal_append(&wal_tx, &Event::RoomDeleted { id }).await?;
            rooms.remove(&id);
            for r in &guard.reservations {
                index.remove(&r.id);
            }
            if let Some(mut hotel) = hotel_rooms.get_mut(&guard.hotel_id) {
                hotel.retain(|r| *r != id);
            }
            hotel_rooms.remove_if(&guard.hotel_id, |_, ids| ids.is_empty());
            Ok(guard.reservations.len())
        })
        .await?;
        tracing::info!("room {id} deleted with {cascaded} reservations");
        Ok(cascaded)
    }

    /// Rewrite the journal as the minimal event list that recreates the
    /// current state.
    ///
    /// Holds the catalog lock and a read lock on every room until the writer
    /// has swapped files, so no append can land between snapshot and swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog.lock().await;

        let mut shared: Vec<(RoomId, _)> = self
            .rooms
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        shared.sort_by_key(|(id, _)| *id);

        let mut guards = Vec::with_capacity(shared.len());
        for (_, rs) in shared {
            guards.push(rs.read_owned().await);
        }

        let mut events = vec![Event::ReservationIdFloor {
            next_id: self.peek_next_reservation_id(),
        }];
        for rs in &guards {
            events.push(Event::RoomUpserted {
                id: rs.id,
                hotel_id: rs.hotel_id,
                nightly_price: rs.nightly_price,
                total_units: rs.total_units,
            });
            events.extend(rs.reservations.iter().map(|r| Event::ReservationCreated {
                reservation: r.clone(),
            }));
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_request(WalCommand::Compact { events, response: tx }, rx)
            .await?
            .map_err(|e| {
                tracing::error!("journal compaction failed: {e}");
                EngineError::Storage(e.to_string())
            })?;
        drop(guards);
        tracing::info!("journal compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        self.wal_request(WalCommand::AppendsSinceCompact { response: tx }, rx)
            .await
            .unwrap_or(0)
    }
}
