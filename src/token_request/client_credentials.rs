//! `client_credentials` 授权

use tracing::warn;

use super::{GrantContext, TokenRequestParameters, TokenRequestValidator, ValidatedTokenRequest};
use crate::client::{Client, GrantType};
use crate::context::CallContext;
use crate::protocol::OAuthError;

impl TokenRequestValidator {
    pub(super) async fn validate_client_credentials(
        &self,
        ctx: &CallContext,
        params: &TokenRequestParameters,
        client: &Client,
    ) -> Result<ValidatedTokenRequest, OAuthError> {
        let scopes = match self.requested_scopes(params)? {
            Some(scopes) => scopes,
            None => self.resources.allowed_api_scopes(ctx, client).await?,
        };
        if scopes.is_empty() {
            return Err(OAuthError::invalid_scope("No allowed scopes configured for client"));
        }

        let resources = self.resolve_scopes(ctx, client, &scopes).await?;
        if resources.has_identity_scopes() || resources.offline_access {
            warn!("client credentials request for identity scopes");
            return Err(OAuthError::invalid_scope(
                "Client credentials requests only support API scopes",
            ));
        }
        if resources.api_scopes.is_empty() {
            return Err(OAuthError::invalid_scope("No valid API scopes requested"));
        }

        Ok(ValidatedTokenRequest {
            client: client.clone(),
            grant_type: GrantType::ClientCredentials,
            subject_id: None,
            session_id: None,
            resources,
            confirmation: None,
            auth_time: None,
            context: GrantContext::ClientCredentials,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::*;
    use crate::protocol::OAuthErrorCode;
    use crate::secret::ClientSecret;

    fn service_client() -> Client {
        Client::builder("svc")
            .secret(ClientSecret::shared("secret"))
            .grant_type(GrantType::ClientCredentials)
            .scopes(["openid", "api1", "api2"])
            .build()
            .unwrap()
    }

    fn params(scope: Option<&str>) -> TokenRequestParameters {
        let params = TokenRequestParameters::new().insert("grant_type", "client_credentials");
        match scope {
            Some(scope) => params.insert("scope", scope),
            None => params,
        }
    }

    #[tokio::test]
    async fn test_defaults_to_allowed_api_scopes() {
        let fx = Fixture::new();
        let validated = fx
            .validator
            .validate(&CallContext::new(), &params(None), &authenticated(service_client()))
            .await
            .unwrap();
        assert_eq!(validated.scopes(), vec!["api1", "api2"]);
        assert!(validated.subject_id.is_none());
        assert!(!validated.wants_refresh_token());
    }

    #[tokio::test]
    async fn test_narrowed_scope() {
        let fx = Fixture::new();
        let validated = fx
            .validator
            .validate(
                &CallContext::new(),
                &params(Some("api2")),
                &authenticated(service_client()),
            )
            .await
            .unwrap();
        assert_eq!(validated.scopes(), vec!["api2"]);
        assert_eq!(validated.resources.audiences(), vec!["api"]);
    }

    #[tokio::test]
    async fn test_rejects_identity_and_unknown_scopes() {
        let fx = Fixture::new();
        let ctx = CallContext::new();

        for scope in ["openid api1", "api3", "offline_access"] {
            let err = fx
                .validator
                .validate(&ctx, &params(Some(scope)), &authenticated(service_client()))
                .await
                .unwrap_err();
            assert_eq!(err.error, OAuthErrorCode::InvalidScope, "scope {}", scope);
        }
    }
}
