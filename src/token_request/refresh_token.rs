//! `refresh_token` 授权

use tracing::warn;

use super::{
    GrantContext, TokenRequestParameters, TokenRequestValidator, ValidatedTokenRequest, bounded,
};
use crate::client::{Client, GrantType};
use crate::context::CallContext;
use crate::grant::{GrantKind, RefreshTokenUsage};
use crate::protocol::OAuthError;
use crate::store::ConsumeOutcome;

impl TokenRequestValidator {
    pub(super) async fn validate_refresh_token(
        &self,
        ctx: &CallContext,
        params: &TokenRequestParameters,
        client: &Client,
    ) -> Result<ValidatedTokenRequest, OAuthError> {
        let handle = bounded(params, "refresh_token", self.lengths.refresh_token)?;
        let requested = self.requested_scopes(params)?;

        let Some(grant) = self
            .repository
            .get(ctx, GrantKind::RefreshToken, handle)
            .await?
        else {
            warn!("refresh token not found");
            return Err(OAuthError::invalid_grant("Invalid refresh token"));
        };

        if grant.client_id != client.client_id {
            warn!(owner = %grant.client_id, "refresh token was issued to a different client");
            return Err(OAuthError::invalid_grant("Invalid refresh token"));
        }
        let Some(payload) = grant.as_refresh_token().cloned() else {
            return Err(OAuthError::invalid_grant("Invalid refresh token"));
        };
        if grant.is_consumed() {
            warn!(version = payload.version, "refresh token has already been used");
            return Err(OAuthError::invalid_grant("Invalid refresh token"));
        }
        if payload.absolute_expiration() <= self.repository.now() {
            return Err(OAuthError::invalid_grant("Refresh token has expired"));
        }

        let original = &payload.access_token.scopes;
        let scopes = match requested {
            Some(requested) => {
                if !requested.iter().all(|s| original.contains(s)) {
                    warn!("refresh request widens the original scope");
                    return Err(OAuthError::invalid_scope(
                        "Requested scope exceeds the original grant",
                    ));
                }
                requested
            }
            None => original.clone(),
        };

        if let Some(subject_id) = &grant.subject_id {
            self.ensure_active(ctx, subject_id, client).await?;
        }

        let resources = self.resolve_scopes(ctx, client, &scopes).await?;

        if payload.usage == RefreshTokenUsage::OneTimeOnly {
            match self
                .repository
                .consume_once(ctx, GrantKind::RefreshToken, handle)
                .await?
            {
                ConsumeOutcome::Consumed(_) => {}
                ConsumeOutcome::AlreadyConsumed | ConsumeOutcome::NotFound => {
                    warn!("refresh token consumed concurrently");
                    return Err(OAuthError::invalid_grant("Invalid refresh token"));
                }
            }
        }

        Ok(ValidatedTokenRequest {
            client: client.clone(),
            grant_type: GrantType::RefreshToken,
            subject_id: grant.subject_id.clone(),
            session_id: grant.session_id.clone(),
            resources,
            confirmation: payload.access_token.confirmation.clone(),
            auth_time: None,
            context: GrantContext::RefreshToken {
                handle: handle.to_string(),
                payload,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::*;
    use crate::grant::Token;
    use crate::issuer::TokenService;
    use crate::issuer::testing::PlainIssuer;
    use crate::protocol::OAuthErrorCode;
    use crate::secret::ClientSecret;
    use chrono::Duration;
    use std::sync::Arc;

    fn client(id: &str, usage: RefreshTokenUsage) -> Client {
        let mut client = Client::builder(id)
            .secret(ClientSecret::shared("secret"))
            .grant_type(GrantType::AuthorizationCode)
            .scopes(["openid", "api1", "api2"])
            .offline_access()
            .build()
            .unwrap();
        client.refresh_token_usage = usage;
        client
    }

    async fn issue(fx: &Fixture, client: &Client) -> String {
        let tokens = TokenService::new(fx.repo.clone(), Arc::new(PlainIssuer), "https://issuer");
        let token = Token::new(
            "https://issuer",
            client.client_id.clone(),
            vec!["openid".into(), "api1".into(), "api2".into(), "offline_access".into()],
            fx.repo.now(),
            3600,
        )
        .with_subject("alice");
        tokens
            .create_refresh_token(&CallContext::new(), client, token)
            .await
            .unwrap()
    }

    fn params(handle: &str, scope: Option<&str>) -> TokenRequestParameters {
        let params = TokenRequestParameters::new()
            .insert("grant_type", "refresh_token")
            .insert("refresh_token", handle);
        match scope {
            Some(scope) => params.insert("scope", scope),
            None => params,
        }
    }

    #[tokio::test]
    async fn test_one_time_only_consumes() {
        let fx = Fixture::new();
        let ctx = CallContext::new();
        let web = client("web", RefreshTokenUsage::OneTimeOnly);
        let handle = issue(&fx, &web).await;

        let validated = fx
            .validator
            .validate(&ctx, &params(&handle, None), &authenticated(web.clone()))
            .await
            .unwrap();
        assert!(validated.wants_refresh_token());
        assert_eq!(validated.subject_id.as_deref(), Some("alice"));

        let err = fx
            .validator
            .validate(&ctx, &params(&handle, None), &authenticated(web))
            .await
            .unwrap_err();
        assert_eq!(err.error, OAuthErrorCode::InvalidGrant);
    }

    #[tokio::test]
    async fn test_reuse_keeps_handle_valid() {
        let fx = Fixture::new();
        let ctx = CallContext::new();
        let web = client("web", RefreshTokenUsage::ReUse);
        let handle = issue(&fx, &web).await;

        for _ in 0..2 {
            fx.validator
                .validate(&ctx, &params(&handle, None), &authenticated(web.clone()))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_scope_narrowing() {
        let fx = Fixture::new();
        let ctx = CallContext::new();
        let web = client("web", RefreshTokenUsage::ReUse);
        let handle = issue(&fx, &web).await;

        let narrowed = fx
            .validator
            .validate(&ctx, &params(&handle, Some("api1")), &authenticated(web.clone()))
            .await
            .unwrap();
        assert_eq!(narrowed.scopes(), vec!["api1"]);
        assert!(narrowed.wants_refresh_token());

        let err = fx
            .validator
            .validate(&ctx, &params(&handle, Some("api1 profile")), &authenticated(web))
            .await
            .unwrap_err();
        assert_eq!(err.error, OAuthErrorCode::InvalidScope);
    }

    #[tokio::test]
    async fn test_client_binding_and_expiry() {
        let fx = Fixture::new();
        let ctx = CallContext::new();
        let web = client("web", RefreshTokenUsage::ReUse);
        let handle = issue(&fx, &web).await;

        let err = fx
            .validator
            .validate(
                &ctx,
                &params(&handle, None),
                &authenticated(client("other", RefreshTokenUsage::ReUse)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.error, OAuthErrorCode::InvalidGrant);

        fx.clock
            .advance(Duration::seconds(web.absolute_refresh_token_lifetime));
        let err = fx
            .validator
            .validate(&ctx, &params(&handle, None), &authenticated(web))
            .await
            .unwrap_err();
        assert_eq!(err.error, OAuthErrorCode::InvalidGrant);
    }

    #[tokio::test]
    async fn test_requires_offline_access() {
        let fx = Fixture::new();
        let mut web = client("web", RefreshTokenUsage::ReUse);
        let handle = issue(&fx, &web).await;
        web.allow_offline_access = false;

        let err = fx
            .validator
            .validate(&CallContext::new(), &params(&handle, None), &authenticated(web))
            .await
            .unwrap_err();
        assert_eq!(err.error, OAuthErrorCode::UnauthorizedClient);
    }
}
