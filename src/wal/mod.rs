//! In-memory iterable FIFO of pending puts and deletes.
//!
//! Producers append lock-free; the single flusher dequeues from the front.
//! Readers open a cursor that yields entries in append order up to the
//! horizon captured at creation, which is what lets a `get` close the race
//! against a concurrently mutating shard vector: the cursor is opened
//! before the vector snapshot, so any write the shard walk could miss is
//! still in view here.

mod entry;

pub use entry::LogEntry;

use std::ops::Bound;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam_skiplist::SkipMap;

pub struct Wal {
    entries: SkipMap<u64, LogEntry>,
    next_seq: AtomicU64,
    len: AtomicUsize,
}

impl Wal {
    pub fn new() -> Self {
        Self {
            entries: SkipMap::new(),
            next_seq: AtomicU64::new(0),
            len: AtomicUsize::new(0),
        }
    }

    /// Enqueues an entry. Safe to call from any number of threads.
    pub fn append(&self, entry: LogEntry) {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.entries.insert(seq, entry);
        self.len.fetch_add(1, Ordering::SeqCst);
    }

    /// Opens a cursor over the entries appended so far. Entries appended
    /// after creation fall past the horizon and are not observed.
    pub fn cursor(&self) -> WalCursor<'_> {
        WalCursor {
            wal: self,
            next: 0,
            horizon: self.next_seq.load(Ordering::SeqCst),
        }
    }

    /// The oldest pending entry, if any. Only meaningful for the single
    /// consumer.
    pub fn oldest(&self) -> Option<LogEntry> {
        self.entries.front().map(|e| e.value().clone())
    }

    /// Dequeues the oldest entry. Only the single consumer may call this.
    pub fn remove_oldest(&self) {
        if self.entries.pop_front().is_some() {
            self.len.fetch_sub(1, Ordering::SeqCst);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::SeqCst)
    }
}

impl Default for Wal {
    fn default() -> Self {
        Self::new()
    }
}

/// Cursor over a prefix of the log, in append order.
pub struct WalCursor<'a> {
    wal: &'a Wal,
    next: u64,
    horizon: u64,
}

impl Iterator for WalCursor<'_> {
    type Item = LogEntry;

    fn next(&mut self) -> Option<LogEntry> {
        let entry = self.wal.entries.lower_bound(Bound::Included(&self.next))?;
        let seq = *entry.key();
        if seq >= self.horizon {
            return None;
        }
        self.next = seq + 1;
        Some(entry.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinate::Coordinate;

    fn put(key: &[u8], version: u64) -> LogEntry {
        LogEntry::put(
            Coordinate::point(1, 2),
            key.to_vec(),
            vec![b"v".to_vec()],
            version,
        )
    }

    #[test]
    fn test_fifo_order() {
        let wal = Wal::new();
        wal.append(put(b"a", 1));
        wal.append(put(b"b", 2));
        wal.append(put(b"c", 3));

        let keys: Vec<_> = wal.cursor().map(|e| e.key).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_cursor_horizon_excludes_later_appends() {
        let wal = Wal::new();
        wal.append(put(b"a", 1));

        let cursor = wal.cursor();
        wal.append(put(b"b", 2));

        let keys: Vec<_> = cursor.map(|e| e.key).collect();
        assert_eq!(keys, vec![b"a".to_vec()]);

        // A fresh cursor sees both.
        assert_eq!(wal.cursor().count(), 2);
    }

    #[test]
    fn test_consumer_dequeue() {
        let wal = Wal::new();
        assert!(wal.is_empty());
        assert!(wal.oldest().is_none());

        wal.append(put(b"a", 1));
        wal.append(LogEntry::del(
            Coordinate::new(u32::MAX, 7, 0, 0),
            b"b".to_vec(),
        ));
        assert_eq!(wal.len(), 2);

        let oldest = wal.oldest().unwrap();
        assert_eq!(oldest.key, b"a");
        assert!(oldest.is_put());
        wal.remove_oldest();

        let oldest = wal.oldest().unwrap();
        assert_eq!(oldest.key, b"b");
        assert!(!oldest.is_put());
        wal.remove_oldest();

        assert!(wal.is_empty());
        assert_eq!(wal.len(), 0);
    }

    #[test]
    fn test_cursor_skips_dequeued_entries() {
        let wal = Wal::new();
        wal.append(put(b"a", 1));
        wal.append(put(b"b", 2));

        let cursor = wal.cursor();
        wal.remove_oldest();

        // The dequeued entry is gone from the cursor's view, the rest
        // remains in order.
        let keys: Vec<_> = cursor.map(|e| e.key).collect();
        assert_eq!(keys, vec![b"b".to_vec()]);
    }

    #[test]
    fn test_concurrent_appends_all_land() {
        let wal = std::sync::Arc::new(Wal::new());
        let mut handles = Vec::new();
        for t in 0..4 {
            let wal = std::sync::Arc::clone(&wal);
            handles.push(std::thread::spawn(move || {
                for i in 0..100u64 {
                    wal.append(put(format!("{t}-{i}").as_bytes(), i));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(wal.len(), 400);
        assert_eq!(wal.cursor().count(), 400);
    }
}
