//! 集成测试：撤销、内省与 grant 生命周期

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::*;
use grantrs::audit::{EventSeverity, EventType};
use grantrs::error::StorageError;
use grantrs::introspection::{IntrospectionError, IntrospectionRequest};
use grantrs::revocation::{RevocationOutcome, RevocationRequest};
use grantrs::secret::ParsedSecret;
use grantrs::store::{ConsumeOutcome, GrantFilter};
use grantrs::token_request::TokenRequestParameters;
use grantrs::{CallContext, Error, Grant, GrantKind, GrantStore, OAuthErrorCode, TokenResponse};
use tokio_util::sync::CancellationToken;

async fn web_tokens(h: &Harness) -> TokenResponse {
    let (response, verifier) = h.authorize_code("web", "openid api1 offline_access").await;
    let params = TokenRequestParameters::from_pairs([
        ("grant_type", "authorization_code"),
        ("code", response.code.as_deref().unwrap()),
        ("redirect_uri", REDIRECT_URI),
        ("code_verifier", verifier.as_str()),
    ]);
    h.engine
        .token(&CallContext::new(), &web(), &params)
        .await
        .unwrap()
}

async fn svc_token(h: &Harness) -> String {
    let params = TokenRequestParameters::from_pairs([("grant_type", "client_credentials")]);
    h.engine
        .token(
            &CallContext::new(),
            &ParsedSecret::shared("svc", "svc-secret"),
            &params,
        )
        .await
        .unwrap()
        .access_token
}

/// 只有令牌的持有者可以撤销；他人的撤销请求在协议上成功但记录失败事件
#[tokio::test]
async fn test_revocation_ownership() {
    let h = Harness::new();
    let ctx = CallContext::new();
    let refresh = web_tokens(&h).await.refresh_token.unwrap();
    let request = RevocationRequest::new(&refresh).with_hint("refresh_token");

    let outcome = h
        .engine
        .revoke(&ctx, &ParsedSecret::shared("svc", "svc-secret"), &request)
        .await
        .unwrap();
    assert_eq!(outcome, RevocationOutcome::ClientMismatch(GrantKind::RefreshToken));
    assert!(
        h.engine
            .repository()
            .get(&ctx, GrantKind::RefreshToken, &refresh)
            .await
            .unwrap()
            .is_some()
    );

    let failures = h.audit.get_events_by_type(&EventType::TokenRevocationFailed);
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].client_id.as_deref(), Some("svc"));
    assert!(failures[0].is_failure());

    let outcome = h.engine.revoke(&ctx, &web(), &request).await.unwrap();
    assert!(outcome.is_revoked());
    assert_eq!(h.audit.get_events_by_type(&EventType::TokenRevoked).len(), 1);

    let refresh_params = TokenRequestParameters::from_pairs([
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh.as_str()),
    ]);
    let err = h.engine.token(&ctx, &web(), &refresh_params).await.unwrap_err();
    assert_eq!(err.error, OAuthErrorCode::InvalidGrant);
}

/// 撤销需要客户端认证
#[tokio::test]
async fn test_revocation_requires_authentication() {
    let h = Harness::new();
    let err = h
        .engine
        .revoke(
            &CallContext::new(),
            &ParsedSecret::shared("web", "wrong"),
            &RevocationRequest::new("anything"),
        )
        .await
        .unwrap_err();
    assert_eq!(err.error, OAuthErrorCode::InvalidClient);
}

/// 引用令牌的内省与撤销
#[tokio::test]
async fn test_introspect_and_revoke_reference_token() {
    let h = Harness::new();
    let ctx = CallContext::new();
    let handle = svc_token(&h).await;

    let response = h
        .engine
        .introspect(&ctx, &api(), &IntrospectionRequest::new(&handle))
        .await
        .unwrap();
    assert!(response.active);
    assert_eq!(response.client_id.as_deref(), Some("svc"));
    assert!(response.has_scope("api1"));

    let outcome = h
        .engine
        .revoke(
            &ctx,
            &ParsedSecret::shared("svc", "svc-secret"),
            &RevocationRequest::new(&handle),
        )
        .await
        .unwrap();
    assert_eq!(outcome, RevocationOutcome::Revoked(GrantKind::ReferenceToken));

    let response = h
        .engine
        .introspect(&ctx, &api(), &IntrospectionRequest::new(&handle))
        .await
        .unwrap();
    assert!(!response.active);
    assert_eq!(
        serde_json::to_value(&response).unwrap(),
        serde_json::json!({ "active": false })
    );
}

/// 过期的 grant 与不存在的 grant 无法区分
#[tokio::test]
async fn test_expiry_as_absence() {
    let h = Harness::new();
    let ctx = CallContext::new();
    let handle = svc_token(&h).await;

    h.clock.advance(Duration::seconds(3600));
    let repository = h.engine.repository();
    assert!(
        repository
            .get(&ctx, GrantKind::ReferenceToken, &handle)
            .await
            .unwrap()
            .is_none()
    );
    assert!(matches!(
        repository
            .consume_once(&ctx, GrantKind::ReferenceToken, &handle)
            .await
            .unwrap(),
        ConsumeOutcome::NotFound
    ));
    let response = h
        .engine
        .introspect(&ctx, &api(), &IntrospectionRequest::new(&handle))
        .await
        .unwrap();
    assert!(!response.active);

    let outcome = h
        .engine
        .revoke(
            &ctx,
            &ParsedSecret::shared("svc", "svc-secret"),
            &RevocationRequest::new(&handle),
        )
        .await
        .unwrap();
    assert_eq!(outcome, RevocationOutcome::NotFound);

    // 清理后记录也不存在
    assert_eq!(h.engine.remove_expired(&ctx).await.unwrap(), 1);
}

/// 主体被停用后令牌失效
#[tokio::test]
async fn test_inactive_subject() {
    let h = Harness::new();
    let ctx = CallContext::new();
    let tokens = web_tokens(&h).await;
    h.profile.deactivate("alice").await;

    let params = TokenRequestParameters::from_pairs([
        ("grant_type", "refresh_token"),
        ("refresh_token", tokens.refresh_token.as_deref().unwrap()),
    ]);
    let err = h.engine.token(&ctx, &web(), &params).await.unwrap_err();
    assert_eq!(err.error, OAuthErrorCode::InvalidGrant);

    let response = h
        .engine
        .introspect(
            &ctx,
            &api(),
            &IntrospectionRequest::new(tokens.refresh_token.unwrap()).with_hint("refresh_token"),
        )
        .await
        .unwrap();
    assert!(!response.active);
}

/// 内省调用方认证失败
#[tokio::test]
async fn test_introspection_unauthorized() {
    let h = Harness::new();
    let err = h
        .engine
        .introspect(
            &CallContext::new(),
            &ParsedSecret::shared("api", "wrong"),
            &IntrospectionRequest::new("token"),
        )
        .await
        .unwrap_err();
    assert_eq!(err, IntrospectionError::Unauthorized);

    let failures = h
        .audit
        .get_events_by_type(&EventType::TokenIntrospectionFailed);
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].error.as_deref(), Some("invalid_client"));
}

/// 撤销某主体在某客户端下的全部 grant
#[tokio::test]
async fn test_revoke_all_grants() {
    let h = Harness::new();
    let ctx = CallContext::new();
    web_tokens(&h).await;
    web_tokens(&h).await;

    let filter = GrantFilter::subject_client("alice", "web");
    assert_eq!(h.engine.repository().find(&ctx, &filter).await.unwrap().len(), 2);

    let removed = h.engine.revoke_all_grants(&ctx, "alice", "web").await.unwrap();
    assert_eq!(removed, 2);
    assert!(h.engine.repository().find(&ctx, &filter).await.unwrap().is_empty());

    let events = h.audit.get_events_by_type(&EventType::GrantsRevoked);
    assert_eq!(events[0].details.get("removed").map(String::as_str), Some("2"));
}

/// 总是失败的存储
struct BrokenStore;

fn unavailable<T>() -> grantrs::Result<T> {
    Err(Error::Storage(StorageError::ConnectionFailed(
        "store unavailable".into(),
    )))
}

#[async_trait]
impl GrantStore for BrokenStore {
    async fn store(&self, _ctx: &CallContext, _grant: Grant) -> grantrs::Result<()> {
        unavailable()
    }

    async fn get(&self, _ctx: &CallContext, _key: &str) -> grantrs::Result<Option<Grant>> {
        unavailable()
    }

    async fn consume_once(
        &self,
        _ctx: &CallContext,
        _key: &str,
        _now: DateTime<Utc>,
    ) -> grantrs::Result<ConsumeOutcome> {
        unavailable()
    }

    async fn update(&self, _ctx: &CallContext, _grant: Grant) -> grantrs::Result<bool> {
        unavailable()
    }

    async fn compare_and_update(
        &self,
        _ctx: &CallContext,
        _expected: &Grant,
        _grant: Grant,
    ) -> grantrs::Result<bool> {
        unavailable()
    }

    async fn remove(&self, _ctx: &CallContext, _key: &str) -> grantrs::Result<bool> {
        unavailable()
    }

    async fn remove_all(&self, _ctx: &CallContext, _filter: &GrantFilter) -> grantrs::Result<usize> {
        unavailable()
    }

    async fn find(&self, _ctx: &CallContext, _filter: &GrantFilter) -> grantrs::Result<Vec<Grant>> {
        unavailable()
    }

    async fn get_by_alias(
        &self,
        _ctx: &CallContext,
        _kind: GrantKind,
        _alias: &str,
    ) -> grantrs::Result<Option<Grant>> {
        unavailable()
    }

    async fn remove_expired(&self, _ctx: &CallContext, _now: DateTime<Utc>) -> grantrs::Result<usize> {
        unavailable()
    }
}

/// 存储故障映射为 server_error，不泄露内部信息
#[tokio::test]
async fn test_store_failure_is_server_error() {
    let h = Harness::with_store(Arc::new(BrokenStore));
    let ctx = CallContext::new();

    let params = TokenRequestParameters::from_pairs([("grant_type", "client_credentials")]);
    let err = h
        .engine
        .token(&ctx, &ParsedSecret::shared("svc", "svc-secret"), &params)
        .await
        .unwrap_err();
    assert_eq!(err.error, OAuthErrorCode::ServerError);
    assert!(
        !err.error_description
            .as_deref()
            .unwrap_or_default()
            .contains("unavailable")
    );

    let failures = h.audit.get_failure_events();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].severity, EventSeverity::Error);

    let err = h
        .engine
        .introspect(&ctx, &api(), &IntrospectionRequest::new("token"))
        .await
        .unwrap_err();
    assert!(matches!(err, IntrospectionError::Protocol(e) if e.error == OAuthErrorCode::ServerError));
}

/// 调用方取消后立即失败
#[tokio::test]
async fn test_cancelled_call() {
    let h = Harness::new();
    let token = CancellationToken::new();
    token.cancel();
    let ctx = CallContext::new().with_cancellation(token);

    let params = TokenRequestParameters::from_pairs([("grant_type", "client_credentials")]);
    let err = h
        .engine
        .token(&ctx, &ParsedSecret::shared("svc", "svc-secret"), &params)
        .await
        .unwrap_err();
    assert_eq!(err.error, OAuthErrorCode::ServerError);
}
