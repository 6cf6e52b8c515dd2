//! Partition-scoped locks.

use std::fmt;

/// A named lock on one partition.
///
/// Locks travel on the wire as 32-bit lock ids; two locks with the same name
/// and id always map to the same lock id. Distinct locks may collide, which
/// only costs a spurious lock failure.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionLocalLock {
    name: String,
    id: i64,
}

impl PartitionLocalLock {
    pub fn new(name: impl Into<String>, id: i64) -> Self {
        Self {
            name: name.into(),
            id,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    /// Wire lock id: CRC32C of the name bytes followed by the big-endian id.
    pub fn lock_id(&self) -> i32 {
        let crc = crc32c::crc32c(self.name.as_bytes());
        crc32c::crc32c_append(crc, &self.id.to_be_bytes()) as i32
    }
}

impl fmt::Display for PartitionLocalLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.id)
    }
}
