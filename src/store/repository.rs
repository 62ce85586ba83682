use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::{ConsumeOutcome, GrantFilter, GrantStore};
use crate::clock::Clock;
use crate::context::CallContext;
use crate::error::{Result, StorageError};
use crate::grant::{Grant, GrantKind, hash_alias, hash_handle};
use crate::random::generate_handle;

/// 面向 handle 的 grant 仓库
///
/// 调用方只接触交给客户端的原始 handle；仓库负责哈希、惰性过期与调用上下文。
/// 过期的 grant 与从未签发的 grant 表现完全一致。
#[derive(Clone)]
pub struct GrantRepository {
    store: Arc<dyn GrantStore>,
    clock: Arc<dyn Clock>,
}

impl GrantRepository {
    /// 创建仓库
    pub fn new(store: Arc<dyn GrantStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// 注入的时钟
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// 当前时间
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// 保存新 grant，生成并返回交给客户端的 handle
    pub async fn create(&self, ctx: &CallContext, grant: Grant) -> Result<String> {
        let handle = generate_handle()?;
        self.create_with_handle(ctx, &handle, grant).await?;
        Ok(handle)
    }

    /// 以指定 handle 保存 grant（覆盖同 key 的记录）
    pub async fn create_with_handle(
        &self,
        ctx: &CallContext,
        handle: &str,
        mut grant: Grant,
    ) -> Result<()> {
        let kind = grant.kind();
        grant.key = hash_handle(handle, kind);
        debug!(kind = %kind, client_id = %grant.client_id, "storing grant");
        ctx.run(self.store.store(ctx, grant)).await
    }

    /// 以 handle 读取；过期或种类不符返回 `None`
    pub async fn get(
        &self,
        ctx: &CallContext,
        kind: GrantKind,
        handle: &str,
    ) -> Result<Option<Grant>> {
        let key = hash_handle(handle, kind);
        self.get_by_key(ctx, kind, &key).await
    }

    /// 以存储 key 读取
    pub async fn get_by_key(
        &self,
        ctx: &CallContext,
        kind: GrantKind,
        key: &str,
    ) -> Result<Option<Grant>> {
        let grant = ctx.run(self.store.get(ctx, key)).await?;
        Ok(grant.filter(|g| self.is_live(g, kind)))
    }

    /// 以 handle 读取，保留已过期的记录
    ///
    /// 只用于协议要求区分“已过期”与“不存在”的场景（设备码轮询的 `expired_token`）
    pub async fn get_including_expired(
        &self,
        ctx: &CallContext,
        kind: GrantKind,
        handle: &str,
    ) -> Result<Option<Grant>> {
        let key = hash_handle(handle, kind);
        let grant = ctx.run(self.store.get(ctx, &key)).await?;
        Ok(grant.filter(|g| g.kind() == kind))
    }

    /// 原子消费
    pub async fn consume_once(
        &self,
        ctx: &CallContext,
        kind: GrantKind,
        handle: &str,
    ) -> Result<ConsumeOutcome> {
        let key = hash_handle(handle, kind);
        let now = self.now();
        let outcome = ctx.run(self.store.consume_once(ctx, &key, now)).await?;

        match outcome {
            ConsumeOutcome::Consumed(grant) if grant.kind() != kind => {
                debug!(kind = %kind, "consumed grant of unexpected kind");
                Ok(ConsumeOutcome::NotFound)
            }
            other => Ok(other),
        }
    }

    /// 更新已存在的 grant
    pub async fn update(&self, ctx: &CallContext, grant: Grant) -> Result<()> {
        let kind = grant.kind();
        if ctx.run(self.store.update(ctx, grant)).await? {
            Ok(())
        } else {
            Err(StorageError::OperationFailed(format!("{} grant vanished during update", kind)).into())
        }
    }

    /// 仅当记录自 `expected` 读出后未被修改时写入，返回是否写入
    pub async fn compare_and_update(
        &self,
        ctx: &CallContext,
        expected: &Grant,
        grant: Grant,
    ) -> Result<bool> {
        let updated = ctx
            .run(self.store.compare_and_update(ctx, expected, grant))
            .await?;
        if !updated {
            debug!(kind = %expected.kind(), "grant changed concurrently, update skipped");
        }
        Ok(updated)
    }

    /// 以 handle 删除
    pub async fn remove(&self, ctx: &CallContext, kind: GrantKind, handle: &str) -> Result<bool> {
        let key = hash_handle(handle, kind);
        self.remove_by_key(ctx, &key).await
    }

    /// 以存储 key 删除
    pub async fn remove_by_key(&self, ctx: &CallContext, key: &str) -> Result<bool> {
        ctx.run(self.store.remove(ctx, key)).await
    }

    /// 删除某个主体在某个客户端下的全部 grant（跨种类）
    pub async fn remove_all(
        &self,
        ctx: &CallContext,
        subject_id: &str,
        client_id: &str,
    ) -> Result<usize> {
        let filter = GrantFilter::subject_client(subject_id, client_id);
        self.remove_matching(ctx, &filter).await
    }

    /// 按条件批量删除
    pub async fn remove_matching(&self, ctx: &CallContext, filter: &GrantFilter) -> Result<usize> {
        let removed = ctx.run(self.store.remove_all(ctx, filter)).await?;
        debug!(removed, "removed grants");
        Ok(removed)
    }

    /// 查询未过期的 grant
    pub async fn find(&self, ctx: &CallContext, filter: &GrantFilter) -> Result<Vec<Grant>> {
        let now = self.now();
        let grants = ctx.run(self.store.find(ctx, filter)).await?;
        Ok(grants.into_iter().filter(|g| !g.is_expired(now)).collect())
    }

    /// 通过别名读取
    pub async fn get_by_alias(
        &self,
        ctx: &CallContext,
        kind: GrantKind,
        alias: &str,
    ) -> Result<Option<Grant>> {
        let hashed = hash_alias(alias, kind);
        let grant = ctx.run(self.store.get_by_alias(ctx, kind, &hashed)).await?;
        Ok(grant.filter(|g| self.is_live(g, kind)))
    }

    /// 清理过期记录
    pub async fn remove_expired(&self, ctx: &CallContext) -> Result<usize> {
        let now = self.now();
        let removed = ctx.run(self.store.remove_expired(ctx, now)).await?;
        if removed > 0 {
            debug!(removed, "swept expired grants");
        }
        Ok(removed)
    }

    fn is_live(&self, grant: &Grant, kind: GrantKind) -> bool {
        grant.kind() == kind && !grant.is_expired(self.now())
    }
}

impl std::fmt::Debug for GrantRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrantRepository").finish_non_exhaustive()
    }
}
