//! Transactions: how applications build them and how they are delivered back.

use crate::error::ClientError;
use crate::lock::PartitionLocalLock;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use waltz_protocol::checksum;
use waltz_protocol::message::AppendRequest;
use waltz_protocol::ReqId;

/// Converts application values to and from transaction data.
pub trait Serializer<T>: Send + Sync {
    fn serialize(&self, value: &T) -> Result<Vec<u8>, ClientError>;

    fn deserialize(&self, data: &[u8]) -> Result<T, ClientError>;
}

/// Serializes transaction data as JSON.
pub struct JsonSerializer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonSerializer<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Serializer<T> for JsonSerializer<T>
where
    T: Serialize + DeserializeOwned,
{
    fn serialize(&self, value: &T) -> Result<Vec<u8>, ClientError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn deserialize(&self, data: &[u8]) -> Result<T, ClientError> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Collects the parts of one append.
///
/// Created by the client with the partition's current high-water mark; the
/// application fills in data, header and locks from
/// [`TransactionContext::execute`].
#[derive(Debug)]
pub struct TransactionBuilder {
    client_high_water_mark: i64,
    header: i32,
    data: Option<Bytes>,
    write_locks: Vec<i32>,
    read_locks: Vec<i32>,
    append_locks: Vec<i32>,
}

impl TransactionBuilder {
    pub fn new(client_high_water_mark: i64) -> Self {
        Self {
            client_high_water_mark,
            header: 0,
            data: None,
            write_locks: Vec::new(),
            read_locks: Vec::new(),
            append_locks: Vec::new(),
        }
    }

    /// High-water mark the append will be validated against.
    pub fn client_high_water_mark(&self) -> i64 {
        self.client_high_water_mark
    }

    pub fn set_header(&mut self, header: i32) {
        self.header = header;
    }

    pub fn set_transaction_data<T, S>(&mut self, value: &T, serializer: &S) -> Result<(), ClientError>
    where
        S: Serializer<T> + ?Sized,
    {
        self.data = Some(Bytes::from(serializer.serialize(value)?));
        Ok(())
    }

    pub fn set_raw_data(&mut self, data: impl Into<Bytes>) {
        self.data = Some(data.into());
    }

    /// Locks the transaction writes. Conflicts with earlier writers of any of them.
    pub fn set_write_locks<'a>(&mut self, locks: impl IntoIterator<Item = &'a PartitionLocalLock>) {
        self.write_locks = lock_ids(locks);
    }

    /// Locks the transaction read. Conflicts with earlier writers, but does not
    /// make this transaction a writer.
    pub fn set_read_locks<'a>(&mut self, locks: impl IntoIterator<Item = &'a PartitionLocalLock>) {
        self.read_locks = lock_ids(locks);
    }

    /// Append locks are accepted here but cannot be sent to a version 1 server.
    pub fn set_append_locks<'a>(
        &mut self,
        locks: impl IntoIterator<Item = &'a PartitionLocalLock>,
    ) {
        self.append_locks = lock_ids(locks);
    }

    /// Fails unless the transaction has data.
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.data.is_none() {
            return Err(ClientError::InvalidTransaction(
                "transaction data not set".to_string(),
            ));
        }
        Ok(())
    }

    /// Builds the append request, computing the data checksum.
    pub fn into_request(self, req_id: ReqId) -> AppendRequest {
        let data = self.data.unwrap_or_default();
        AppendRequest {
            req_id,
            client_high_water_mark: self.client_high_water_mark,
            write_locks: self.write_locks,
            read_locks: self.read_locks,
            append_locks: self.append_locks,
            header: self.header,
            checksum: checksum::compute(&data),
            data,
        }
    }
}

fn lock_ids<'a>(locks: impl IntoIterator<Item = &'a PartitionLocalLock>) -> Vec<i32> {
    let mut ids: Vec<i32> = locks.into_iter().map(PartitionLocalLock::lock_id).collect();
    ids.sort_unstable();
    ids.dedup();
    ids
}

/// Application logic for one transaction.
///
/// `execute` may run several times: after a lock failure the client waits
/// until it has caught up and calls it again with a fresh builder.
pub trait TransactionContext: Send + Sync {
    /// Partition the transaction goes to.
    fn partition_id(&self, num_partitions: i32) -> i32;

    /// Fills in the builder. Returning `false` abandons the transaction.
    fn execute(&self, builder: &mut TransactionBuilder) -> Result<bool, ClientError>;

    /// Called once with the final outcome.
    fn on_completion(&self, _committed: bool) {}
}

/// A committed transaction delivered to the application.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub transaction_id: i64,
    /// Request id of the append that created the transaction.
    pub req_id: ReqId,
    pub header: i32,
    data: Bytes,
}

impl Transaction {
    pub fn new(transaction_id: i64, req_id: ReqId, header: i32, data: Bytes) -> Self {
        Self {
            transaction_id,
            req_id,
            header,
            data,
        }
    }

    pub fn partition_id(&self) -> i32 {
        self.req_id.partition_id()
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn transaction_data<T, S>(&self, serializer: &S) -> Result<T, ClientError>
    where
        S: Serializer<T> + ?Sized,
    {
        serializer.deserialize(&self.data)
    }
}
