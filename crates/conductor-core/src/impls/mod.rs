//! Impls - Port の実装
//!
//! - **sqlite**: 1 つの `sqlx` pool 上の task / namespace / lease lock store
//! - **shard**: `AllShards` と lease ベースの `LeaseShardOwnership`

pub mod shard;
pub mod sqlite;

pub use self::shard::{AllShards, LeaseShardOwnership};
