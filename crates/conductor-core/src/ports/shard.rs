//! ShardOwnership port - このインスタンスが scan してよい task type
//!
//! task type の文字列をハッシュして、キー空間を固定数の shard に分割する。
//! shard の所有者だけがその shard に属する type のタスクを scan / dispatch /
//! expire するので、レプリカ間で二重 dispatch は起きない。

use crate::domain::TaskType;

pub const DEFAULT_SHARD_COUNT: u32 = 1024;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// task type の安定した shard 番号（FNV-1a 64 を `shard_count` で剰余）
///
/// どのインスタンス・どのビルドでも同じ値を返す必要があるため、
/// ランダムシードの `std` hasher は使えない。
pub fn shard_index(task_type: &str, shard_count: u32) -> u32 {
    let hash = task_type.bytes().fold(FNV_OFFSET, |acc, b| {
        (acc ^ u64::from(b)).wrapping_mul(FNV_PRIME)
    });
    (hash % u64::from(shard_count.max(1))) as u32
}

pub trait ShardOwnership: Send + Sync {
    fn shard_count(&self) -> u32;

    fn owns(&self, shard: u32) -> bool;

    fn owns_task_type(&self, task_type: &TaskType) -> bool {
        self.owns(shard_index(task_type.as_str(), self.shard_count()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("resize_image")]
    #[case("send_email")]
    #[case("")]
    #[case("a.very.long.namespaced.task.type.v1")]
    fn shard_index_is_stable_and_in_range(#[case] task_type: &str) {
        let a = shard_index(task_type, DEFAULT_SHARD_COUNT);
        let b = shard_index(task_type, DEFAULT_SHARD_COUNT);
        assert_eq!(a, b);
        assert!(a < DEFAULT_SHARD_COUNT);
    }

    #[test]
    fn known_fnv_vector() {
        // FNV-1a 64 of "a" is 0xaf63dc4c8601ec8c.
        assert_eq!(shard_index("a", u32::MAX), (0xaf63_dc4c_8601_ec8c_u64 % u64::from(u32::MAX)) as u32);
    }

    #[test]
    fn zero_shard_count_is_treated_as_one() {
        assert_eq!(shard_index("anything", 0), 0);
    }
}
