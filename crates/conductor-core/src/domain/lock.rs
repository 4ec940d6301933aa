//! Lease lock record.

use serde::{Deserialize, Serialize};

/// A time-bounded mutual-exclusion row.
///
/// The holder owns the key until `expire` (unix seconds) and must renew
/// before then to keep it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseLock {
    pub lock_key: String,
    pub lock_val: String,
    pub held_by: String,
    pub expire: i64,
    pub ctime: i64,
}

impl LeaseLock {
    pub fn is_live(&self, now_secs: i64) -> bool {
        self.expire > now_secs
    }
}
