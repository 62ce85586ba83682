//! 用户会话端口
//!
//! 引擎不关心会话如何被承载（cookie、token、请求头），只通过 [`SessionPort`]
//! 读取当前登录用户。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::CallContext;
use crate::error::Result;

/// 当前登录用户
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSession {
    /// 主体 ID
    pub subject_id: String,
    /// 会话 ID
    pub session_id: String,
    /// 登录时间
    pub auth_time: DateTime<Utc>,
    /// 登录使用的身份提供者（`local` 表示本地登录）
    #[serde(default = "local_idp")]
    pub identity_provider: String,
    /// 认证方式（`pwd`、`mfa` 等）
    #[serde(default)]
    pub amr: Vec<String>,
}

fn local_idp() -> String {
    UserSession::LOCAL_IDP.to_string()
}

impl UserSession {
    /// 本地登录的身份提供者名
    pub const LOCAL_IDP: &'static str = "local";

    /// 创建本地登录会话
    pub fn new(
        subject_id: impl Into<String>,
        session_id: impl Into<String>,
        auth_time: DateTime<Utc>,
    ) -> Self {
        Self {
            subject_id: subject_id.into(),
            session_id: session_id.into(),
            auth_time,
            identity_provider: local_idp(),
            amr: vec!["pwd".to_string()],
        }
    }

    /// 设置身份提供者
    pub fn with_identity_provider(mut self, idp: impl Into<String>) -> Self {
        self.identity_provider = idp.into();
        self
    }
}

/// 当前会话的来源
#[async_trait]
pub trait SessionPort: Send + Sync {
    /// 返回当前会话；未登录返回 `None`
    async fn current_session(&self, ctx: &CallContext) -> Result<Option<UserSession>>;
}

/// 固定会话（测试或已经在外部解析好会话的宿主使用）
#[derive(Debug, Clone, Default)]
pub struct StaticSession(pub Option<UserSession>);

impl StaticSession {
    /// 已登录
    pub fn signed_in(session: UserSession) -> Self {
        Self(Some(session))
    }

    /// 匿名
    pub fn anonymous() -> Self {
        Self(None)
    }
}

#[async_trait]
impl SessionPort for StaticSession {
    async fn current_session(&self, _ctx: &CallContext) -> Result<Option<UserSession>> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_session() {
        let ctx = CallContext::new();
        assert!(
            StaticSession::anonymous()
                .current_session(&ctx)
                .await
                .unwrap()
                .is_none()
        );

        let session = UserSession::new("alice", "sid", Utc::now());
        let port = StaticSession::signed_in(session.clone());
        assert_eq!(port.current_session(&ctx).await.unwrap(), Some(session));
    }

    #[test]
    fn test_default_identity_provider() {
        let json = r#"{"subject_id":"a","session_id":"s","auth_time":"2024-01-01T00:00:00Z"}"#;
        let session: UserSession = serde_json::from_str(json).unwrap();
        assert_eq!(session.identity_provider, UserSession::LOCAL_IDP);
    }
}
