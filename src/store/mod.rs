//! Grant 存储
//!
//! [`GrantStore`] 是持久化后端需要实现的契约，[`InMemoryGrantStore`] 是参考实现。
//! 验证器不直接使用存储，而是通过 [`GrantRepository`] 访问：它负责生成 handle、
//! 计算 key、按注入的时钟做惰性过期，并用 [`CallContext`] 包裹每一次调用。
//!
//! ## 原子消费
//!
//! `consume_once` 必须在存储层是一个不可分割的操作（条件删除、对 consumed
//! 标记的 CAS、或事务内的读后写），保证同一个 key 的两次并发兑换恰好一次成功。
//! 对可能被多方同时修改的 grant（设备码）使用 `compare_and_update`，
//! 避免用过时的副本覆盖别人的写入。

mod memory;
mod repository;

pub use memory::InMemoryGrantStore;
pub use repository::GrantRepository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::context::CallContext;
use crate::error::Result;
use crate::grant::{Grant, GrantKind};

/// 原子消费的结果
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumeOutcome {
    /// 本次调用成功消费，返回消费后的 grant
    Consumed(Grant),
    /// 已被消费过
    AlreadyConsumed,
    /// 不存在（或已过期）
    NotFound,
}

/// Grant 查询 / 批量删除条件
///
/// 未设置的字段不参与匹配。批量删除至少需要 subject 或 client 之一。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GrantFilter {
    pub subject_id: Option<String>,
    pub client_id: Option<String>,
    pub session_id: Option<String>,
    pub kind: Option<GrantKind>,
}

impl GrantFilter {
    /// 某个主体在某个客户端下的全部 grant
    pub fn subject_client(subject_id: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            subject_id: Some(subject_id.into()),
            client_id: Some(client_id.into()),
            ..Default::default()
        }
    }

    /// 限定种类
    pub fn with_kind(mut self, kind: GrantKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// 限定会话
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// 是否足以安全地用于批量删除
    pub fn is_scoped(&self) -> bool {
        self.subject_id.is_some() || self.client_id.is_some()
    }

    /// grant 是否满足条件
    pub fn matches(&self, grant: &Grant) -> bool {
        fn field_matches(expected: &Option<String>, actual: Option<&str>) -> bool {
            match expected {
                Some(expected) => actual == Some(expected.as_str()),
                None => true,
            }
        }

        field_matches(&self.subject_id, grant.subject_id.as_deref())
            && field_matches(&self.client_id, Some(grant.client_id.as_str()))
            && field_matches(&self.session_id, grant.session_id.as_deref())
            && self.kind.is_none_or(|kind| kind == grant.kind())
    }
}

/// Grant 存储契约
///
/// 所有 key 都已经是哈希后的形式。实现应当把 `ctx` 的取消信号与截止时间
/// 传递给底层客户端；[`GrantRepository`] 也会在外层再包一层 [`CallContext::run`]。
#[async_trait]
pub trait GrantStore: Send + Sync {
    /// 保存 grant（同 key 覆盖）
    async fn store(&self, ctx: &CallContext, grant: Grant) -> Result<()>;

    /// 非破坏性读取
    async fn get(&self, ctx: &CallContext, key: &str) -> Result<Option<Grant>>;

    /// 原子消费
    ///
    /// 不存在或在 `now` 已过期返回 `NotFound`；已有 consumed 时间返回
    /// `AlreadyConsumed`；否则写入 `now` 为消费时间并返回 `Consumed`。
    async fn consume_once(
        &self,
        ctx: &CallContext,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<ConsumeOutcome>;

    /// 替换已存在的 grant；不存在时返回 `false`
    async fn update(&self, ctx: &CallContext, grant: Grant) -> Result<bool>;

    /// 仅当存储中的记录仍等于 `expected` 时替换为 `grant`
    ///
    /// 检查与写入必须是一个不可分割的操作（版本号 CAS、条件写入或事务）。
    /// 记录不存在或已被修改时返回 `false`。
    async fn compare_and_update(
        &self,
        ctx: &CallContext,
        expected: &Grant,
        grant: Grant,
    ) -> Result<bool>;

    /// 删除单个 grant；返回是否存在
    async fn remove(&self, ctx: &CallContext, key: &str) -> Result<bool>;

    /// 跨种类批量删除，返回删除数量
    async fn remove_all(&self, ctx: &CallContext, filter: &GrantFilter) -> Result<usize>;

    /// 查询
    async fn find(&self, ctx: &CallContext, filter: &GrantFilter) -> Result<Vec<Grant>>;

    /// 通过别名查找（设备 user code）
    async fn get_by_alias(
        &self,
        ctx: &CallContext,
        kind: GrantKind,
        alias: &str,
    ) -> Result<Option<Grant>>;

    /// 清理在 `now` 之前过期的 grant，返回删除数量
    async fn remove_expired(&self, ctx: &CallContext, now: DateTime<Utc>) -> Result<usize>;
}
