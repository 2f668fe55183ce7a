use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Largest payload a record may declare. A bigger length word is treated as
/// a torn tail rather than trusted for an allocation.
const MAX_RECORD_LEN: usize = 1 << 20;

/// Frame one event as `[u32 le: payload len][bincode payload][u32 le: crc32]`.
fn write_record(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_RECORD_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "journal record too large"));
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())
}

/// Fill `buf` completely. `Ok(false)` means the file ended first.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Next intact record and its framed size, or `None` at end of file, at a
/// torn tail, or at the first record failing its checksum.
fn read_record(reader: &mut impl Read) -> io::Result<Option<(Event, u64)>> {
    let mut word = [0u8; 4];
    if !read_full(reader, &mut word)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(word) as usize;
    if len > MAX_RECORD_LEN {
        return Ok(None);
    }
    let mut payload = vec![0u8; len];
    if !read_full(reader, &mut payload)? || !read_full(reader, &mut word)? {
        return Ok(None);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    let framed = 8 + payload.len() as u64;
    Ok(bincode::deserialize::<Event>(&payload)
        .ok()
        .map(|event| (event, framed)))
}

/// Append-only journal of engine events.
///
/// Appends are buffered; nothing is durable until `flush_sync` returns.
/// Replay stops at the first torn or corrupt record, so a crash mid-append
/// loses at most the batch that was never acknowledged.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    /// File length as of the last successful `flush_sync`.
    synced_len: u64,
    appends_since_compact: u64,
    appends_since_sync: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = open_append(path)?;
        let synced_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            synced_len,
            appends_since_compact: 0,
            appends_since_sync: 0,
        })
    }

    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        write_record(&mut self.writer, event)?;
        self.appends_since_sync += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        let file = self.writer.get_ref();
        file.sync_all()?;
        self.synced_len = file.metadata()?.len();
        self.appends_since_compact += self.appends_since_sync;
        self.appends_since_sync = 0;
        Ok(())
    }

    /// Drop everything appended since the last successful `flush_sync`,
    /// including bytes the buffer already spilled to the file.
    pub fn rollback(&mut self) -> io::Result<()> {
        let fresh = BufWriter::new(open_append(&self.path)?);
        let (stale, _unwritten) = std::mem::replace(&mut self.writer, fresh).into_parts();
        drop(stale);
        let file = self.writer.get_ref();
        file.set_len(self.synced_len)?;
        file.sync_all()?;
        self.appends_since_sync = 0;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Write a full snapshot to `<journal>.compact` and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(compact_path(path))?);
        for event in events {
            write_record(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the snapshot over the journal and continue appending to it.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        self.flush_sync()?;
        fs::rename(compact_path(&self.path), &self.path)?;
        let file = open_append(&self.path)?;
        self.synced_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Replay, cut off any torn or corrupt tail, and open for appending.
    /// Without the cut, new records would land behind bytes replay never
    /// reads past.
    pub fn recover(path: &Path) -> io::Result<(Vec<Event>, Self)> {
        let (events, valid_len) = scan(path)?;
        if let Ok(meta) = fs::metadata(path)
            && meta.len() > valid_len
        {
            tracing::warn!(
                "journal {}: discarding {} trailing bytes",
                path.display(),
                meta.len() - valid_len
            );
            OpenOptions::new().write(true).open(path)?.set_len(valid_len)?;
        }
        Ok((events, Self::open(path)?))
    }
}

/// Intact events plus the byte length they occupy. A missing file is an
/// empty journal.
fn scan(path: &Path) -> io::Result<(Vec<Event>, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let mut events = Vec::new();
    let mut valid_len = 0u64;
    while let Some((event, framed)) = read_record(&mut reader)? {
        events.push(event);
        valid_len += framed;
    }
    Ok((events, valid_len))
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn compact_path(path: &Path) -> PathBuf {
    path.with_extension("compact")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Reservation;
    use chrono::{DateTime, NaiveDate};

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("innkeeper_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn append(wal: &mut Wal, event: &Event) -> io::Result<()> {
        wal.append_buffered(event)?;
        wal.flush_sync()
    }

    fn compact(wal: &mut Wal, events: &[Event]) -> io::Result<()> {
        Wal::write_compact_file(wal.path(), events)?;
        wal.swap_compact_file()
    }

    fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Ok(scan(path)?.0)
    }

    fn room(id: i64) -> Event {
        Event::RoomUpserted {
            id,
            hotel_id: 1,
            nightly_price: 10_000,
            total_units: 2,
        }
    }

    fn booking(id: i64, room_id: i64) -> Event {
        let d = |s: &str| s.parse::<NaiveDate>().unwrap();
        Event::ReservationCreated {
            reservation: Reservation {
                id,
                room_id,
                user_id: 7,
                date_from: d("2025-03-01"),
                date_to: d("2025-03-03"),
                total_price: 20_000,
                created_at: DateTime::from_timestamp(1_740_000_000, 0).unwrap(),
            },
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let events = vec![
            room(1),
            booking(1, 1),
            Event::ReservationCancelled { id: 1, room_id: 1 },
        ];
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                append(&mut wal, e).unwrap();
            }
        }
        assert_eq!(replay(&path).unwrap(), events);
    }

    #[test]
    fn replay_discards_torn_tail() {
        let path = tmp_path("torn_tail.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            append(&mut wal, &room(1)).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8, 0, 0, 0, 1, 2]).unwrap();
        }
        assert_eq!(replay(&path).unwrap(), vec![room(1)]);
    }

    #[test]
    fn recover_truncates_torn_tail_before_appending() {
        let path = tmp_path("recover_torn.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            append(&mut wal, &room(1)).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[200u8, 0, 0, 0, 7]).unwrap();
        }
        {
            let (events, mut wal) = Wal::recover(&path).unwrap();
            assert_eq!(events, vec![room(1)]);
            append(&mut wal, &room(2)).unwrap();
        }
        assert_eq!(replay(&path).unwrap(), vec![room(1), room(2)]);
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let path = tmp_path("never_written.wal");
        assert!(replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_stops_at_bad_checksum() {
        let path = tmp_path("bad_crc.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            append(&mut wal, &room(1)).unwrap();
        }
        {
            let payload = bincode::serialize(&room(2)).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }
        {
            let mut wal = Wal::open(&path).unwrap();
            append(&mut wal, &room(3)).unwrap();
        }
        // Everything after the corrupt record is unreachable.
        assert_eq!(replay(&path).unwrap(), vec![room(1)]);
    }

    #[test]
    fn compact_shrinks_and_keeps_snapshot() {
        let path = tmp_path("compact_shrinks.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            append(&mut wal, &room(1)).unwrap();
            for id in 1..=20 {
                append(&mut wal, &booking(id, 1)).unwrap();
                append(&mut wal, &Event::ReservationCancelled { id, room_id: 1 }).unwrap();
            }
        }
        let before = fs::metadata(&path).unwrap().len();

        {
            let mut wal = Wal::open(&path).unwrap();
            compact(&mut wal, &[room(1)]).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
        }

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted journal should be smaller: {after} < {before}");
        assert_eq!(replay(&path).unwrap(), vec![room(1)]);
        assert!(!compact_path(&path).exists());
    }

    #[test]
    fn append_after_compact_lands_in_new_file() {
        let path = tmp_path("append_after_compact.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            append(&mut wal, &room(1)).unwrap();
            append(&mut wal, &room(2)).unwrap();
            compact(&mut wal, &[room(1)]).unwrap();
            append(&mut wal, &booking(5, 1)).unwrap();
        }
        assert_eq!(replay(&path).unwrap(), vec![room(1), booking(5, 1)]);
    }

    #[test]
    fn buffered_appends_are_counted_and_flushed_together() {
        let path = tmp_path("buffered.wal");
        let events: Vec<Event> = (1..=5).map(room).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 0);
            wal.flush_sync().unwrap();
            assert_eq!(wal.appends_since_compact(), 5);
        }
        assert_eq!(replay(&path).unwrap(), events);
    }

    #[test]
    fn rollback_discards_unsynced_records() {
        let path = tmp_path("rollback.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            append(&mut wal, &room(1)).unwrap();
            wal.append_buffered(&room(2)).unwrap();
            wal.append_buffered(&room(3)).unwrap();
            wal.rollback().unwrap();
            assert_eq!(wal.appends_since_compact(), 1);
            append(&mut wal, &room(4)).unwrap();
        }
        assert_eq!(replay(&path).unwrap(), vec![room(1), room(4)]);
    }

    #[test]
    fn rollback_truncates_bytes_already_spilled_to_file() {
        let path = tmp_path("rollback_spilled.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            append(&mut wal, &room(1)).unwrap();
            for id in 1..=2000 {
                wal.append_buffered(&booking(id, 1)).unwrap();
            }
            // The buffer spilled part of the batch to disk on its own.
            assert!(fs::metadata(&path).unwrap().len() > 100);
            wal.rollback().unwrap();
        }
        assert_eq!(replay(&path).unwrap(), vec![room(1)]);
    }

    #[test]
    fn oversized_length_word_is_a_torn_tail() {
        let path = tmp_path("oversized_len.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            append(&mut wal, &room(1)).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&u32::MAX.to_le_bytes()).unwrap();
            f.write_all(&[0u8; 16]).unwrap();
        }
        let (events, _wal) = Wal::recover(&path).unwrap();
        assert_eq!(events, vec![room(1)]);
        assert_eq!(fs::metadata(&path).unwrap().len(), scan(&path).unwrap().1);
    }
}
