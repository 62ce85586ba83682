use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{ConsumeOutcome, GrantFilter, GrantStore};
use crate::context::CallContext;
use crate::error::{Result, StorageError};
use crate::grant::{Grant, GrantKind};

/// 内存 grant 存储
///
/// 适合开发与测试。`consume_once` 在同一个写锁内完成检查与标记。
#[derive(Debug, Default, Clone)]
pub struct InMemoryGrantStore {
    grants: Arc<RwLock<HashMap<String, Grant>>>,
}

impl InMemoryGrantStore {
    /// 创建空存储
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前记录数（包括已过期但尚未清理的）
    pub async fn len(&self) -> usize {
        self.grants.read().await.len()
    }

    /// 是否为空
    pub async fn is_empty(&self) -> bool {
        self.grants.read().await.is_empty()
    }
}

#[async_trait]
impl GrantStore for InMemoryGrantStore {
    async fn store(&self, _ctx: &CallContext, grant: Grant) -> Result<()> {
        if grant.key.is_empty() {
            return Err(StorageError::OperationFailed("grant key is empty".into()).into());
        }
        let mut grants = self.grants.write().await;
        grants.insert(grant.key.clone(), grant);
        Ok(())
    }

    async fn get(&self, _ctx: &CallContext, key: &str) -> Result<Option<Grant>> {
        let grants = self.grants.read().await;
        Ok(grants.get(key).cloned())
    }

    async fn consume_once(
        &self,
        _ctx: &CallContext,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<ConsumeOutcome> {
        let mut grants = self.grants.write().await;
        let Some(grant) = grants.get_mut(key) else {
            return Ok(ConsumeOutcome::NotFound);
        };

        if grant.is_expired(now) {
            return Ok(ConsumeOutcome::NotFound);
        }
        if grant.consumed_time.is_some() {
            return Ok(ConsumeOutcome::AlreadyConsumed);
        }

        grant.consumed_time = Some(now);
        Ok(ConsumeOutcome::Consumed(grant.clone()))
    }

    async fn update(&self, _ctx: &CallContext, grant: Grant) -> Result<bool> {
        let mut grants = self.grants.write().await;
        match grants.get_mut(&grant.key) {
            Some(existing) => {
                *existing = grant;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn compare_and_update(
        &self,
        _ctx: &CallContext,
        expected: &Grant,
        grant: Grant,
    ) -> Result<bool> {
        let mut grants = self.grants.write().await;
        match grants.get_mut(&grant.key) {
            Some(existing) if existing == expected => {
                *existing = grant;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn remove(&self, _ctx: &CallContext, key: &str) -> Result<bool> {
        let mut grants = self.grants.write().await;
        Ok(grants.remove(key).is_some())
    }

    async fn remove_all(&self, _ctx: &CallContext, filter: &GrantFilter) -> Result<usize> {
        if !filter.is_scoped() {
            return Err(StorageError::OperationFailed(
                "remove_all requires a subject or client".into(),
            )
            .into());
        }
        let mut grants = self.grants.write().await;
        let before = grants.len();
        grants.retain(|_, grant| !filter.matches(grant));
        Ok(before - grants.len())
    }

    async fn find(&self, _ctx: &CallContext, filter: &GrantFilter) -> Result<Vec<Grant>> {
        let grants = self.grants.read().await;
        Ok(grants
            .values()
            .filter(|grant| filter.matches(grant))
            .cloned()
            .collect())
    }

    async fn get_by_alias(
        &self,
        _ctx: &CallContext,
        kind: GrantKind,
        alias: &str,
    ) -> Result<Option<Grant>> {
        let grants = self.grants.read().await;
        Ok(grants
            .values()
            .find(|grant| grant.kind() == kind && grant.alias.as_deref() == Some(alias))
            .cloned())
    }

    async fn remove_expired(&self, _ctx: &CallContext, now: DateTime<Utc>) -> Result<usize> {
        let mut grants = self.grants.write().await;
        let before = grants.len();
        grants.retain(|_, grant| !grant.is_expired(now));
        Ok(before - grants.len())
    }
}
