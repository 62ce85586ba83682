//! 扩展授权类型

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::{
    GrantContext, GrantValidationResult, TokenRequestParameters, TokenRequestValidator,
    ValidatedTokenRequest,
};
use crate::client::{Client, GrantType};
use crate::context::CallContext;
use crate::error::Result;
use crate::protocol::OAuthError;

/// 自定义授权类型的验证器
#[async_trait]
pub trait ExtensionGrantValidator: Send + Sync {
    /// 处理的 `grant_type` 值
    fn grant_type(&self) -> &str;

    /// 验证请求
    async fn validate(
        &self,
        ctx: &CallContext,
        client: &Client,
        params: &TokenRequestParameters,
    ) -> Result<GrantValidationResult>;
}

/// 按 `grant_type` 索引的扩展验证器
#[derive(Clone, Default)]
pub struct ExtensionGrantRegistry {
    validators: BTreeMap<String, Arc<dyn ExtensionGrantValidator>>,
}

impl ExtensionGrantRegistry {
    /// 创建空注册表
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册验证器；同名的旧验证器被替换
    pub fn register(mut self, validator: Arc<dyn ExtensionGrantValidator>) -> Self {
        self.validators
            .insert(validator.grant_type().to_string(), validator);
        self
    }

    pub fn get(&self, grant_type: &str) -> Option<&Arc<dyn ExtensionGrantValidator>> {
        self.validators.get(grant_type)
    }

    pub fn contains(&self, grant_type: &str) -> bool {
        self.validators.contains_key(grant_type)
    }

    /// 已注册的授权类型
    pub fn grant_types(&self) -> Vec<&str> {
        self.validators.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for ExtensionGrantRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.validators.keys()).finish()
    }
}

impl TokenRequestValidator {
    pub(super) async fn validate_extension(
        &self,
        ctx: &CallContext,
        grant_type: &str,
        params: &TokenRequestParameters,
        client: &Client,
    ) -> std::result::Result<ValidatedTokenRequest, OAuthError> {
        let Some(validator) = self.extensions.get(grant_type).cloned() else {
            return Err(OAuthError::unsupported_grant_type());
        };

        let scopes = self
            .requested_scopes(params)?
            .unwrap_or_else(|| client.allowed_scopes.clone());
        let resources = self.resolve_scopes(ctx, client, &scopes).await?;
        if resources.is_empty() {
            return Err(OAuthError::invalid_scope("No valid scopes requested"));
        }

        let result = ctx.run(validator.validate(ctx, client, params)).await?;
        let (subject_id, claims) = match result {
            GrantValidationResult::Success { subject_id, claims } => (subject_id, claims),
            GrantValidationResult::Error(error) => {
                warn!(error = %error.error, "extension grant rejected");
                return Err(error);
            }
        };

        if let Some(subject_id) = &subject_id {
            self.ensure_active(ctx, subject_id, client).await?;
        }

        Ok(ValidatedTokenRequest {
            client: client.clone(),
            grant_type: GrantType::Extension(grant_type.to_string()),
            auth_time: subject_id.as_ref().map(|_| self.repository.now()),
            subject_id,
            session_id: None,
            resources,
            confirmation: None,
            context: GrantContext::Extension { claims },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::*;
    use crate::protocol::OAuthErrorCode;
    use crate::secret::ClientSecret;

    const TOKEN_EXCHANGE: &str = "urn:ietf:params:oauth:grant-type:token-exchange";

    /// 接受 `subject_token=good:<sub>` 的交换验证器
    struct Exchange;

    #[async_trait]
    impl ExtensionGrantValidator for Exchange {
        fn grant_type(&self) -> &str {
            TOKEN_EXCHANGE
        }

        async fn validate(
            &self,
            _ctx: &CallContext,
            _client: &Client,
            params: &TokenRequestParameters,
        ) -> Result<GrantValidationResult> {
            Ok(match params.get("subject_token") {
                Some(token) => match token.strip_prefix("good:") {
                    Some(subject) => GrantValidationResult::success(subject)
                        .with_claim("act", serde_json::json!({ "sub": "gateway" })),
                    None => GrantValidationResult::error(OAuthError::invalid_grant(
                        "subject_token rejected",
                    )),
                },
                None => GrantValidationResult::error(OAuthError::invalid_request(
                    "subject_token is missing",
                )),
            })
        }
    }

    fn client(grant: &str) -> Client {
        Client::builder("gateway")
            .secret(ClientSecret::shared("secret"))
            .grant_type(GrantType::parse(grant))
            .scopes(["api1"])
            .build()
            .unwrap()
    }

    fn params(subject_token: &str) -> TokenRequestParameters {
        TokenRequestParameters::new()
            .insert("grant_type", TOKEN_EXCHANGE)
            .insert("subject_token", subject_token)
    }

    #[test]
    fn test_registry() {
        let registry = ExtensionGrantRegistry::new().register(Arc::new(Exchange));
        assert!(registry.contains(TOKEN_EXCHANGE));
        assert!(!registry.contains("urn:other"));
        assert_eq!(registry.grant_types(), vec![TOKEN_EXCHANGE]);
    }

    #[tokio::test]
    async fn test_extension_grant() {
        let fx = Fixture::new();
        let ctx = CallContext::new();
        let validator = fx
            .validator
            .clone()
            .with_extensions(ExtensionGrantRegistry::new().register(Arc::new(Exchange)));

        let validated = validator
            .validate(&ctx, &params("good:alice"), &authenticated(client(TOKEN_EXCHANGE)))
            .await
            .unwrap();
        assert_eq!(validated.subject_id.as_deref(), Some("alice"));
        assert_eq!(validated.scopes(), vec!["api1"]);
        assert!(matches!(validated.context, GrantContext::Extension { ref claims } if claims.contains_key("act")));

        let err = validator
            .validate(&ctx, &params("bad"), &authenticated(client(TOKEN_EXCHANGE)))
            .await
            .unwrap_err();
        assert_eq!(err.error, OAuthErrorCode::InvalidGrant);
    }

    #[tokio::test]
    async fn test_registered_but_not_allowed_for_client() {
        let fx = Fixture::new();
        let validator = fx
            .validator
            .clone()
            .with_extensions(ExtensionGrantRegistry::new().register(Arc::new(Exchange)));

        let err = validator
            .validate(
                &CallContext::new(),
                &params("good:alice"),
                &authenticated(client("urn:other")),
            )
            .await
            .unwrap_err();
        assert_eq!(err.error, OAuthErrorCode::UnauthorizedClient);
    }
}
