//! `authorization_code` 授权

use tracing::warn;

use super::{
    GrantContext, TokenRequestParameters, TokenRequestValidator, ValidatedTokenRequest, bounded,
};
use crate::client::{Client, GrantType};
use crate::context::CallContext;
use crate::grant::GrantKind;
use crate::pkce::PkceError;
use crate::protocol::OAuthError;
use crate::store::ConsumeOutcome;

impl TokenRequestValidator {
    pub(super) async fn validate_authorization_code(
        &self,
        ctx: &CallContext,
        params: &TokenRequestParameters,
        client: &Client,
    ) -> Result<ValidatedTokenRequest, OAuthError> {
        let code = bounded(params, "code", self.lengths.authorization_code)?;
        let redirect_uri = params.get("redirect_uri");
        if redirect_uri.is_some_and(|uri| uri.len() > self.lengths.redirect_uri) {
            return Err(OAuthError::invalid_request("redirect_uri is too long"));
        }
        let verifier = params.get("code_verifier");
        if verifier.is_some_and(|v| {
            v.len() < self.lengths.code_verifier_min || v.len() > self.lengths.code_verifier_max
        }) {
            return Err(OAuthError::invalid_grant("Invalid code_verifier length"));
        }

        let grant = match self
            .repository
            .consume_once(ctx, GrantKind::AuthorizationCode, code)
            .await?
        {
            ConsumeOutcome::Consumed(grant) => grant,
            ConsumeOutcome::AlreadyConsumed => {
                warn!("authorization code has already been redeemed");
                return Err(OAuthError::invalid_grant("Invalid authorization code"));
            }
            ConsumeOutcome::NotFound => {
                warn!("authorization code not found");
                return Err(OAuthError::invalid_grant("Invalid authorization code"));
            }
        };
        self.repository
            .remove(ctx, GrantKind::AuthorizationCode, code)
            .await?;

        if grant.client_id != client.client_id {
            warn!(
                owner = %grant.client_id,
                "authorization code was issued to a different client"
            );
            return Err(OAuthError::invalid_grant("Invalid authorization code"));
        }
        let Some(payload) = grant.as_authorization_code() else {
            return Err(OAuthError::invalid_grant("Invalid authorization code"));
        };

        if redirect_uri != Some(payload.redirect_uri.as_str()) {
            warn!("redirect_uri does not match the authorization request");
            return Err(OAuthError::unauthorized_client("Invalid redirect_uri"));
        }

        let allow_plain = client.allow_plain_text_pkce && self.pkce.allow_plain_globally;
        match (&payload.code_challenge, verifier) {
            (Some(challenge), Some(verifier)) => {
                challenge
                    .verify(verifier, allow_plain)
                    .map_err(|err| {
                        warn!(reason = %err, "PKCE verification failed");
                        match err {
                            PkceError::PlainNotAllowed => OAuthError::invalid_grant(
                                "code_challenge_method of plain is not allowed",
                            ),
                            PkceError::MalformedVerifier | PkceError::Mismatch => {
                                OAuthError::invalid_grant("Invalid code_verifier")
                            }
                        }
                    })?;
            }
            (Some(_), None) => {
                return Err(OAuthError::invalid_grant("code_verifier is missing"));
            }
            (None, Some(_)) => {
                return Err(OAuthError::invalid_request(
                    "code_verifier supplied but no code_challenge was registered",
                ));
            }
            (None, None) if client.require_pkce => {
                return Err(OAuthError::invalid_grant(
                    "Client requires PKCE but the code has no code_challenge",
                ));
            }
            (None, None) => {}
        }

        let Some(subject_id) = grant.subject_id.clone() else {
            return Err(OAuthError::invalid_grant("Invalid authorization code"));
        };
        self.ensure_active(ctx, &subject_id, client).await?;

        let resources = self
            .resolve_scopes(ctx, client, &payload.requested_scopes)
            .await?;

        Ok(ValidatedTokenRequest {
            client: client.clone(),
            grant_type: GrantType::AuthorizationCode,
            subject_id: Some(subject_id),
            session_id: grant.session_id.clone(),
            resources,
            confirmation: None,
            auth_time: payload.auth_time,
            context: GrantContext::AuthorizationCode(payload.clone()),
        })
    }
}
