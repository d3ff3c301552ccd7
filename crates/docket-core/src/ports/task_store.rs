//! TaskStore port - タスクの正本（source of truth）
//!
//! Progress Channel が落ちていても、Relay と status 照会はここから状態を復元します。
//!
//! # 設計原則
//! - すべての変更は単一タスク・単一行の `apply` で行う（タスク跨ぎのロックは不要）
//! - 状態遷移の検証は `TaskRecord::apply` が担う（実装ごとの差が出ない）
//! - 終端状態に達したレコードは二度と変わらない

use async_trait::async_trait;

use crate::domain::{OwnerId, TaskId, TaskMutation, TaskRecord, TaskStatus};
use crate::error::StoreError;
use crate::observability::TaskCounts;

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a freshly created record. Fails if the id is already taken.
    async fn insert(&self, record: TaskRecord) -> Result<(), StoreError>;

    async fn get(&self, task_id: TaskId) -> Result<Option<TaskRecord>, StoreError>;

    /// Apply one mutation atomically and return the updated snapshot.
    ///
    /// The mutation either fully applies or leaves the stored record as it was.
    async fn apply(
        &self,
        task_id: TaskId,
        mutation: TaskMutation,
    ) -> Result<TaskRecord, StoreError>;

    /// Tasks created by `owner`, oldest first.
    async fn list_by_owner(&self, owner: &OwnerId) -> Result<Vec<TaskRecord>, StoreError>;

    /// Tasks currently in `status`, oldest first.
    async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<TaskRecord>, StoreError>;

    async fn counts(&self) -> Result<TaskCounts, StoreError>;
}
