//! 用户 consent 持久化
//!
//! 记住的 consent 以 `UserConsent` grant 保存，handle 由主体与客户端确定，
//! 同一对组合只有一条记录。

use tracing::debug;

use crate::client::Client;
use crate::context::CallContext;
use crate::error::Result;
use crate::grant::{ConsentPayload, Grant, GrantKind, GrantPayload};
use crate::store::GrantRepository;

/// consent 服务
#[derive(Debug, Clone)]
pub struct ConsentService {
    repository: GrantRepository,
    default_lifetime: Option<i64>,
}

impl ConsentService {
    /// 创建服务；`default_lifetime` 在客户端未配置 consent 生命周期时使用
    pub fn new(repository: GrantRepository, default_lifetime: Option<i64>) -> Self {
        Self {
            repository,
            default_lifetime,
        }
    }

    fn handle(subject_id: &str, client_id: &str) -> String {
        format!("{}|{}", subject_id, client_id)
    }

    /// 读取已记住的 consent scope
    pub async fn stored_scopes(
        &self,
        ctx: &CallContext,
        subject_id: &str,
        client_id: &str,
    ) -> Result<Option<Vec<String>>> {
        let grant = self
            .repository
            .get(
                ctx,
                GrantKind::UserConsent,
                &Self::handle(subject_id, client_id),
            )
            .await?;
        Ok(grant.and_then(|g| g.as_consent().map(|c| c.scopes.clone())))
    }

    /// 是否需要向用户展示 consent 页面
    pub async fn requires_consent(
        &self,
        ctx: &CallContext,
        subject_id: &str,
        client: &Client,
        scopes: &[String],
    ) -> Result<bool> {
        if !client.require_consent || scopes.is_empty() {
            return Ok(false);
        }
        if !client.allow_remember_consent {
            return Ok(true);
        }

        let Some(stored) = self
            .stored_scopes(ctx, subject_id, &client.client_id)
            .await?
        else {
            return Ok(true);
        };

        let covered = scopes.iter().all(|s| stored.contains(s));
        debug!(client_id = %client.client_id, covered, "checked stored consent");
        Ok(!covered)
    }

    /// 记住用户的 consent；scope 为空时删除已有记录
    pub async fn remember(
        &self,
        ctx: &CallContext,
        subject_id: &str,
        client: &Client,
        scopes: &[String],
    ) -> Result<()> {
        if !client.allow_remember_consent {
            return Ok(());
        }
        if scopes.is_empty() {
            self.revoke(ctx, subject_id, &client.client_id).await?;
            return Ok(());
        }

        let lifetime = client.consent_lifetime.or(self.default_lifetime);
        let grant = Grant::new(
            GrantPayload::UserConsent(ConsentPayload {
                scopes: scopes.to_vec(),
            }),
            client.client_id.clone(),
            self.repository.now(),
            lifetime,
        )
        .with_subject(subject_id);

        self.repository
            .create_with_handle(ctx, &Self::handle(subject_id, &client.client_id), grant)
            .await
    }

    /// 撤销已记住的 consent
    pub async fn revoke(&self, ctx: &CallContext, subject_id: &str, client_id: &str) -> Result<bool> {
        self.repository
            .remove(
                ctx,
                GrantKind::UserConsent,
                &Self::handle(subject_id, client_id),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::store::InMemoryGrantStore;
    use chrono::Duration;
    use std::sync::Arc;

    fn setup() -> (ConsentService, FixedClock) {
        let clock = FixedClock::at_now();
        let repo = GrantRepository::new(
            Arc::new(InMemoryGrantStore::new()),
            Arc::new(clock.clone()),
        );
        (ConsentService::new(repo, None), clock)
    }

    fn client() -> Client {
        Client {
            client_id: "web".into(),
            require_consent: true,
            consent_lifetime: Some(60),
            ..Default::default()
        }
    }

    fn scopes(s: &str) -> Vec<String> {
        crate::protocol::parse_scopes(s)
    }

    #[tokio::test]
    async fn test_consent_lifecycle() {
        let (service, clock) = setup();
        let ctx = CallContext::new();
        let client = client();

        assert!(
            service
                .requires_consent(&ctx, "alice", &client, &scopes("openid api1"))
                .await
                .unwrap()
        );

        service
            .remember(&ctx, "alice", &client, &scopes("openid api1"))
            .await
            .unwrap();
        assert!(
            !service
                .requires_consent(&ctx, "alice", &client, &scopes("api1"))
                .await
                .unwrap()
        );
        assert!(
            service
                .requires_consent(&ctx, "alice", &client, &scopes("api1 api2"))
                .await
                .unwrap()
        );

        clock.advance(Duration::seconds(61));
        assert!(
            service
                .requires_consent(&ctx, "alice", &client, &scopes("api1"))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_consent_not_required() {
        let (service, _) = setup();
        let ctx = CallContext::new();
        let mut client = client();
        client.require_consent = false;
        assert!(
            !service
                .requires_consent(&ctx, "alice", &client, &scopes("openid"))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_revoke() {
        let (service, _) = setup();
        let ctx = CallContext::new();
        let client = client();
        service
            .remember(&ctx, "alice", &client, &scopes("openid"))
            .await
            .unwrap();
        assert!(service.revoke(&ctx, "alice", "web").await.unwrap());
        assert!(
            service
                .stored_scopes(&ctx, "alice", "web")
                .await
                .unwrap()
                .is_none()
        );
    }
}
