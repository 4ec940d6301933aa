//! Ports - 外部境界の trait 群
//!
//! 各 trait は外部システム（RDB、時計、クラスタの所有権管理）を隠す。
//! 本番では SQLite、テストでは固定 clock に差し替えてワイヤリングできる。

pub mod clock;
pub mod id_generator;
pub mod lock_store;
pub mod namespace_store;
pub mod shard;
pub mod store_error;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::lock_store::LockStore;
pub use self::namespace_store::NamespaceStore;
pub use self::shard::{shard_index, ShardOwnership, DEFAULT_SHARD_COUNT};
pub use self::store_error::StoreError;
pub use self::task_store::TaskStore;
