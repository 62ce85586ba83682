//! 用户资料服务
//!
//! 引擎在每次把 grant 解析到某个主体时都会询问 [`ProfileService::is_active`]；
//! 被停用的主体会让对应的 grant 失效（`invalid_grant`）。

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::client::Client;
use crate::context::CallContext;
use crate::error::Result;

/// 调用 profile 服务的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileCaller {
    AuthorizeEndpoint,
    TokenEndpoint,
    IntrospectionEndpoint,
    DeviceAuthorization,
}

/// 用户资料服务
#[async_trait]
pub trait ProfileService: Send + Sync {
    /// 主体当前是否可用
    async fn is_active(
        &self,
        ctx: &CallContext,
        subject_id: &str,
        client: &Client,
        caller: ProfileCaller,
    ) -> Result<bool>;
}

/// 默认实现：全部主体可用，可以显式停用某些主体
#[derive(Debug, Clone, Default)]
pub struct DefaultProfileService {
    inactive: Arc<RwLock<HashSet<String>>>,
}

impl DefaultProfileService {
    /// 创建
    pub fn new() -> Self {
        Self::default()
    }

    /// 停用主体
    pub async fn deactivate(&self, subject_id: impl Into<String>) {
        self.inactive.write().await.insert(subject_id.into());
    }

    /// 重新启用主体
    pub async fn activate(&self, subject_id: &str) {
        self.inactive.write().await.remove(subject_id);
    }
}

#[async_trait]
impl ProfileService for DefaultProfileService {
    async fn is_active(
        &self,
        _ctx: &CallContext,
        subject_id: &str,
        _client: &Client,
        _caller: ProfileCaller,
    ) -> Result<bool> {
        Ok(!self.inactive.read().await.contains(subject_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deactivate() {
        let profile = DefaultProfileService::new();
        let ctx = CallContext::new();
        let client = Client::default();

        assert!(
            profile
                .is_active(&ctx, "alice", &client, ProfileCaller::TokenEndpoint)
                .await
                .unwrap()
        );
        profile.deactivate("alice").await;
        assert!(
            !profile
                .is_active(&ctx, "alice", &client, ProfileCaller::TokenEndpoint)
                .await
                .unwrap()
        );
        profile.activate("alice").await;
        assert!(
            profile
                .is_active(&ctx, "alice", &client, ProfileCaller::AuthorizeEndpoint)
                .await
                .unwrap()
        );
    }
}
