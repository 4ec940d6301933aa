//! ドメイン識別子（型安全な ID）
//!
//! ID は phantom type 付きの `Id<T>` で包んだ ULID:
//! - **時刻順**: タイムスタンプが先頭にあるので、生成順 == ソート順。
//!   pending scan の keyset pagination はこれに依存する。
//! - **型安全**: `NamespaceId` を期待する場所に `TaskId` は渡せない。
//!
//! 保存形式は 26 文字の Crockford 文字列そのもの（`as_key`）で、ULID と同じ順に
//! 辞書順ソートされる。`Display` は人間向けの prefix（`task-`, `ns-`）を付け、
//! `FromStr` はどちらの形式も受け付ける。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// ID 種別ごとの表示 prefix を与える marker trait
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    /// 保存用キー: prefix なしの ULID 文字列（辞書順ソート可能）
    pub fn as_key(&self) -> String {
        self.ulid.to_string()
    }

    /// ID に埋め込まれた unix epoch からのミリ秒
    pub fn timestamp_ms(&self) -> u64 {
        self.ulid.timestamp_ms()
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// ID 文字列が ULID として不正なときのエラー
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed id {input:?}")]
pub struct ParseIdError {
    pub input: String,
}

impl<T: IdMarker> FromStr for Id<T> {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(T::prefix()).unwrap_or(s);
        Ulid::from_string(raw)
            .map(Self::from_ulid)
            .map_err(|_| ParseIdError {
                input: s.to_string(),
            })
    }
}

// ========================================
// Marker 型
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Namespace {}

impl IdMarker for Namespace {
    fn prefix() -> &'static str {
        "ns-"
    }
}

/// Task の識別子
pub type TaskId = Id<Task>;

/// Namespace の識別子
pub type NamespaceId = Id<Namespace>;
