//! Partition logs and the lock table.
//!
//! Each partition is an append-only, totally ordered list of transactions.
//! An append declares the client's high-water mark and its lock ids; it is
//! accepted iff no declared write or read lock was last written by a
//! transaction the client has not yet seen.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use waltz_protocol::message::AppendRequest;
use waltz_protocol::ReqId;

/// A committed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub transaction_id: i64,
    pub req_id: ReqId,
    pub header: i32,
    pub data: Bytes,
    pub checksum: i32,
}

/// Result of an append attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Committed as this transaction id.
    Accepted(i64),
    /// Rejected; carries the largest conflicting transaction id.
    LockFailure(i64),
}

#[derive(Default)]
struct Log {
    records: Vec<StoredRecord>,
    /// Lock id -> last transaction that wrote it.
    locks: HashMap<i32, i64>,
}

/// One partition of the log.
pub struct Partition {
    id: i32,
    log: Mutex<Log>,
    high_water_mark: watch::Sender<i64>,
    available: AtomicBool,
    appends_accepted: AtomicU64,
    lock_failures: AtomicU64,
}

impl Partition {
    pub fn new(id: i32) -> Self {
        Self {
            id,
            log: Mutex::new(Log::default()),
            high_water_mark: watch::Sender::new(-1),
            available: AtomicBool::new(true),
            appends_accepted: AtomicU64::new(0),
            lock_failures: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Id of the last committed transaction, -1 when empty.
    pub fn high_water_mark(&self) -> i64 {
        *self.high_water_mark.borrow()
    }

    /// Watches the high-water mark.
    pub fn subscribe(&self) -> watch::Receiver<i64> {
        self.high_water_mark.subscribe()
    }

    /// Applies the lock check and commits the append when it passes.
    pub fn append(&self, request: &AppendRequest) -> AppendOutcome {
        let mut log = self.log.lock();

        let conflict = request
            .write_locks
            .iter()
            .chain(request.read_locks.iter())
            .filter_map(|lock| log.locks.get(lock).copied())
            .filter(|last_writer| *last_writer > request.client_high_water_mark)
            .max();
        if let Some(transaction_id) = conflict {
            self.lock_failures.fetch_add(1, Ordering::Relaxed);
            return AppendOutcome::LockFailure(transaction_id);
        }

        let transaction_id = log.records.len() as i64;
        for lock in &request.write_locks {
            log.locks.insert(*lock, transaction_id);
        }
        log.records.push(StoredRecord {
            transaction_id,
            req_id: request.req_id,
            header: request.header,
            data: request.data.clone(),
            checksum: request.checksum,
        });
        self.high_water_mark.send_replace(transaction_id);
        self.appends_accepted.fetch_add(1, Ordering::Relaxed);
        AppendOutcome::Accepted(transaction_id)
    }

    pub fn record(&self, transaction_id: i64) -> Option<StoredRecord> {
        let index = usize::try_from(transaction_id).ok()?;
        self.log.lock().records.get(index).cloned()
    }

    /// Up to `max` records with ids greater than `after`.
    pub fn records_after(&self, after: i64, max: usize) -> Vec<StoredRecord> {
        let start = usize::try_from(after.saturating_add(1)).unwrap_or(0);
        let log = self.log.lock();
        log.records.iter().skip(start).take(max).cloned().collect()
    }

    pub fn appends_accepted(&self) -> u64 {
        self.appends_accepted.load(Ordering::Relaxed)
    }

    pub fn lock_failures(&self) -> u64 {
        self.lock_failures.load(Ordering::Relaxed)
    }
}

/// All partitions served by one server.
pub struct PartitionSet {
    partitions: Vec<Arc<Partition>>,
}

impl PartitionSet {
    pub fn new(num_partitions: i32) -> Self {
        Self {
            partitions: (0..num_partitions.max(0))
                .map(|id| Arc::new(Partition::new(id)))
                .collect(),
        }
    }

    pub fn get(&self, partition_id: i32) -> Option<&Arc<Partition>> {
        usize::try_from(partition_id)
            .ok()
            .and_then(|index| self.partitions.get(index))
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Partition>> {
        self.partitions.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waltz_protocol::checksum;

    fn append(client_id: i32, hwm: i64, write_locks: Vec<i32>, read_locks: Vec<i32>) -> AppendRequest {
        let data = Bytes::from(hwm.to_be_bytes().to_vec());
        AppendRequest {
            req_id: ReqId::new(client_id, 0, 0),
            client_high_water_mark: hwm,
            write_locks,
            read_locks,
            append_locks: Vec::new(),
            header: 0,
            checksum: checksum::compute(&data),
            data,
        }
    }

    #[test]
    fn test_empty_partition() {
        let partition = Partition::new(3);
        assert_eq!(partition.id(), 3);
        assert_eq!(partition.high_water_mark(), -1);
        assert!(partition.record(0).is_none());
        assert!(partition.records_after(-1, 10).is_empty());
    }

    #[test]
    fn test_write_lock_serializes() {
        let partition = Partition::new(0);

        assert_eq!(partition.append(&append(1, -1, vec![42], vec![])), AppendOutcome::Accepted(0));
        // Second writer has not seen transaction 0.
        assert_eq!(
            partition.append(&append(2, -1, vec![42], vec![])),
            AppendOutcome::LockFailure(0)
        );
        assert_eq!(partition.append(&append(2, 0, vec![42], vec![])), AppendOutcome::Accepted(1));
        assert_eq!(partition.high_water_mark(), 1);
        assert_eq!(partition.appends_accepted(), 2);
        assert_eq!(partition.lock_failures(), 1);
    }

    #[test]
    fn test_read_lock_conflicts_with_writer() {
        let partition = Partition::new(0);
        partition.append(&append(1, -1, vec![7], vec![]));
        partition.append(&append(1, 0, vec![8], vec![]));

        assert_eq!(
            partition.append(&append(2, -1, vec![], vec![7, 8])),
            AppendOutcome::LockFailure(1)
        );
        // Read locks do not update the lock table.
        assert_eq!(partition.append(&append(2, 1, vec![], vec![7])), AppendOutcome::Accepted(2));
        assert_eq!(partition.append(&append(3, 1, vec![7], vec![])), AppendOutcome::Accepted(3));
    }

    #[test]
    fn test_disjoint_locks_do_not_conflict() {
        let partition = Partition::new(0);
        partition.append(&append(1, -1, vec![1], vec![]));
        assert_eq!(partition.append(&append(2, -1, vec![2], vec![])), AppendOutcome::Accepted(1));
    }

    #[test]
    fn test_no_locks_race() {
        let partition = Partition::new(0);
        // Both clients computed their data from the same high-water mark.
        assert_eq!(partition.append(&append(1, -1, vec![], vec![])), AppendOutcome::Accepted(0));
        assert_eq!(partition.append(&append(2, -1, vec![], vec![])), AppendOutcome::Accepted(1));

        let second = partition.record(1).unwrap();
        let value = i64::from_be_bytes(second.data.as_ref().try_into().unwrap());
        assert_ne!(value + 1, second.transaction_id);
    }

    #[test]
    fn test_records_after() {
        let partition = Partition::new(0);
        for hwm in -1..4 {
            partition.append(&append(1, hwm, vec![], vec![]));
        }

        let ids: Vec<i64> = partition
            .records_after(1, 10)
            .iter()
            .map(|r| r.transaction_id)
            .collect();
        assert_eq!(ids, vec![2, 3, 4]);
        assert_eq!(partition.records_after(-1, 2).len(), 2);
        assert_eq!(partition.records_after(-5, 10).len(), 5);
        assert!(partition.records_after(4, 10).is_empty());
    }

    #[tokio::test]
    async fn test_high_water_mark_watch() {
        let partition = Arc::new(Partition::new(0));
        let mut rx = partition.subscribe();

        let writer = partition.clone();
        tokio::spawn(async move {
            writer.append(&append(1, -1, vec![], vec![]));
        });

        rx.wait_for(|hwm| *hwm >= 0).await.unwrap();
        assert_eq!(partition.high_water_mark(), 0);
    }

    #[test]
    fn test_partition_set() {
        let set = PartitionSet::new(3);
        assert_eq!(set.len(), 3);
        assert_eq!(set.get(2).map(|p| p.id()), Some(2));
        assert!(set.get(3).is_none());
        assert!(set.get(-1).is_none());
    }
}
