mod admission;
mod availability;
mod cancellation;
mod error;
mod mutations;
mod pricing;
mod queries;

pub use availability::{count_booked, free_units, snapshot};
pub use error::EngineError;
pub use pricing::{total_price, PricingError};

use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};

use crate::model::*;
use crate::observability;
use crate::wal::Wal;

pub type SharedRoomState = Arc<RwLock<RoomState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain every Append already queued behind it.
/// 3. One flush_sync for the whole batch, then answer every sender.
///
/// A non-append command ends the batch; it runs after the batch is flushed.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
    tracing::debug!("wal writer stopped");
}

fn commit_batch(wal: &mut Wal, mut batch: Vec<PendingAppend>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, &batch);
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("wal flush of {} events failed: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

/// All or nothing: a failed batch is cut back out of the journal, since
/// every caller in it is told the append failed.
fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if result.is_err()
        && let Err(e) = wal.rollback()
    {
        tracing::error!("journal rollback after failed batch failed: {e}");
    }
    result
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    pub(super) rooms: Arc<DashMap<RoomId, SharedRoomState>>,
    /// Reverse lookup: reservation id → room id.
    pub(super) reservation_to_room: Arc<DashMap<ReservationId, RoomId>>,
    /// Hotel → its room ids, kept sorted.
    pub(super) hotel_rooms: Arc<DashMap<HotelId, Vec<RoomId>>>,
    /// Serializes room creation/deletion and compaction snapshots.
    /// Lock order: catalog, then room locks in ascending id.
    pub(super) catalog: Arc<Mutex<()>>,
    next_reservation_id: AtomicI64,
    wal_tx: mpsc::Sender<WalCommand>,
}

/// Apply a room-scoped event to a locked room.
fn apply_to_room(
    rs: &mut RoomState,
    event: &Event,
    reservation_index: &DashMap<ReservationId, RoomId>,
) {
    match event {
        Event::RoomUpserted {
            nightly_price,
            total_units,
            ..
        } => {
            rs.nightly_price = *nightly_price;
            rs.total_units = *total_units;
        }
        Event::ReservationCreated { reservation } => {
            reservation_index.insert(reservation.id, rs.id);
            rs.insert_reservation(reservation.clone());
        }
        Event::ReservationCancelled { id, .. } => {
            rs.remove_reservation(*id);
            reservation_index.remove(id);
        }
        // Catalog-level events never reach a single room.
        Event::RoomDeleted { .. } | Event::ReservationIdFloor { .. } => {}
    }
}

/// Fold the journal into plain room states. Returns the rooms and the next
/// unused reservation id.
fn replay_events(events: &[Event]) -> (BTreeMap<RoomId, RoomState>, ReservationId) {
    let mut rooms: BTreeMap<RoomId, RoomState> = BTreeMap::new();
    let mut next_id: ReservationId = 1;
    let scratch_index = DashMap::new();

    for event in events {
        match event {
            Event::RoomUpserted {
                id,
                hotel_id,
                nightly_price,
                total_units,
            } => {
                rooms
                    .entry(*id)
                    .and_modify(|rs| apply_to_room(rs, event, &scratch_index))
                    .or_insert_with(|| {
                        RoomState::new(*id, *hotel_id, *nightly_price, *total_units)
                    });
            }
            Event::RoomDeleted { id } => {
                rooms.remove(id);
            }
            Event::ReservationCreated { reservation } => {
                next_id = next_id.max(reservation.id + 1);
                if let Some(rs) = rooms.get_mut(&reservation.room_id) {
                    apply_to_room(rs, event, &scratch_index);
                }
            }
            Event::ReservationCancelled { room_id, .. } => {
                if let Some(rs) = rooms.get_mut(room_id) {
                    apply_to_room(rs, event, &scratch_index);
                }
            }
            Event::ReservationIdFloor { next_id: floor } => {
                next_id = next_id.max(*floor);
            }
        }
    }
    (rooms, next_id)
}

impl Engine {
    /// Replay the journal at `wal_path` and start its writer task.
    /// Must be called from inside a tokio runtime.
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let (events, wal) = Wal::recover(&wal_path)?;
        let (rooms, next_id) = replay_events(&events);
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            rooms: Arc::new(DashMap::new()),
            reservation_to_room: Arc::new(DashMap::new()),
            hotel_rooms: Arc::new(DashMap::new()),
            catalog: Arc::new(Mutex::new(())),
            next_reservation_id: AtomicI64::new(next_id),
            wal_tx,
        };

        let mut reservations = 0usize;
        for (id, rs) in rooms {
            for r in &rs.reservations {
                engine.reservation_to_room.insert(r.id, id);
            }
            reservations += rs.reservations.len();
            engine.hotel_rooms.entry(rs.hotel_id).or_default().push(id);
            engine.rooms.insert(id, Arc::new(RwLock::new(rs)));
        }
        tracing::info!(
            "replayed {} events from {}: {} rooms, {} reservations",
            events.len(),
            wal_path.display(),
            engine.rooms.len(),
            reservations
        );
        Ok(engine)
    }

    /// Journal `event`, then apply it to the locked room. Consumes the guard
    /// and hands it back once both are done.
    pub(super) async fn persist_and_apply(
        &self,
        mut guard: OwnedRwLockWriteGuard<RoomState>,
        event: Event,
    ) -> Result<OwnedRwLockWriteGuard<RoomState>, EngineError> {
        let wal_tx = self.wal_tx.clone();
        let index = self.reservation_to_room.clone();
        commit(async move {
            wal_append(&wal_tx, &event).await?;
            apply_to_room(&mut guard, &event, &index);
            Ok(guard)
        })
        .await
    }

    async fn wal_request<T>(
        &self,
        cmd: WalCommand,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, EngineError> {
        self.wal_tx
            .send(cmd)
            .await
            .map_err(|_| storage_error("WAL writer shut down"))?;
        rx.await
            .map_err(|_| storage_error("WAL writer dropped response"))
    }

    pub(super) fn get_room_state(&self, id: RoomId) -> Option<SharedRoomState> {
        self.rooms.get(&id).map(|e| e.value().clone())
    }

    pub(super) fn room_for_reservation(&self, id: ReservationId) -> Option<RoomId> {
        self.reservation_to_room.get(&id).map(|e| *e.value())
    }

    pub(super) fn allocate_reservation_id(&self) -> ReservationId {
        self.next_reservation_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(super) fn peek_next_reservation_id(&self) -> ReservationId {
        self.next_reservation_id.load(Ordering::Relaxed)
    }

    /// Exclusive lock on a room that is still registered once the lock is
    /// held. A room deleted (or deleted and recreated) while we waited
    /// reports `RoomNotFound`.
    pub(super) async fn lock_room(
        &self,
        id: RoomId,
    ) -> Result<OwnedRwLockWriteGuard<RoomState>, EngineError> {
        let shared = self.get_room_state(id).ok_or(EngineError::RoomNotFound(id))?;
        let guard = shared.clone().write_owned().await;
        let still_registered = self
            .rooms
            .get(&id)
            .is_some_and(|e| Arc::ptr_eq(e.value(), &shared));
        if !still_registered {
            return Err(EngineError::RoomNotFound(id));
        }
        Ok(guard)
    }
}

/// Run a journal append together with the in-memory change it stands for
/// on a task of its own. The caller may stop waiting; the commit still
/// finishes, so the journal and memory never disagree.
pub(super) async fn commit<T, F>(work: F) -> Result<T, EngineError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, EngineError>> + Send + 'static,
{
    tokio::spawn(work)
        .await
        .map_err(|e| storage_error(&format!("commit task failed: {e}")))?
}

/// Write event to WAL via the background group-commit writer.
pub(super) async fn wal_append(
    wal_tx: &mpsc::Sender<WalCommand>,
    event: &Event,
) -> Result<(), EngineError> {
    let (tx, rx) = oneshot::channel();
    wal_tx
        .send(WalCommand::Append {
            event: event.clone(),
            response: tx,
        })
        .await
        .map_err(|_| storage_error("WAL writer shut down"))?;
    rx.await
        .map_err(|_| storage_error("WAL writer dropped response"))?
        .map_err(|e| storage_error(&e.to_string()))
}

fn storage_error(msg: &str) -> EngineError {
    tracing::error!("journal: {msg}");
    EngineError::Storage(msg.to_string())
}
