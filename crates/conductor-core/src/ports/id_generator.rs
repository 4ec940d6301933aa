//! IdGenerator port - ID 生成
//!
//! ID は常にサーバ側で生成し、呼び出し側からは受け取らない。
//! 同じキーで登録が競合することはない。
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース、タイムスタンプは `Clock` から取得

use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use ulid::{Generator, Ulid};

use crate::domain::ids::{NamespaceId, TaskId};
use crate::ports::Clock;

/// IdGenerator は時刻順の ID を生成する
///
/// # ULID の性質
/// - 同一ミリ秒内も含めて生成順にソート可能（keyset scan が依存）
/// - インスタンス間の調整なしで生成できる
pub trait IdGenerator: Send + Sync {
    fn generate_task_id(&self) -> TaskId;

    fn generate_namespace_id(&self) -> NamespaceId;
}

/// 単調増加: clock が止まっても戻っても、1 つの generator が返す ID は
/// 厳密に増加する。
pub struct UlidGenerator<C> {
    clock: C,
    inner: Mutex<Generator>,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            inner: Mutex::new(Generator::new()),
        }
    }

    fn next(&self) -> Ulid {
        let timestamp_ms = self.clock.now_ms().max(0) as u64;
        let at = SystemTime::UNIX_EPOCH + Duration::from_millis(timestamp_ms);
        match self.inner.lock().generate_from_datetime(at) {
            Ok(ulid) => ulid,
            // 1 ミリ秒に 2^80 個。実際には到達しない
            Err(_) => Ulid::from_parts(timestamp_ms, rand::random()),
        }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_task_id(&self) -> TaskId {
        TaskId::from(self.next())
    }

    fn generate_namespace_id(&self) -> NamespaceId {
        NamespaceId::from(self.next())
    }
}
