//! Token 端点请求验证
//!
//! [`TokenRequestValidator`] 在客户端认证之后执行：先做与授权类型无关的检查，
//! 再分派给各授权类型的子模块。所有不透明输入在访问存储之前完成长度检查。

mod authorization_code;
mod client_credentials;
mod device_code;
mod extension;
mod password;
mod refresh_token;
mod response;

pub use device_code::{DeviceFlowThrottler, IntervalThrottler};
pub use extension::{ExtensionGrantRegistry, ExtensionGrantValidator};
pub use password::ResourceOwnerPasswordValidator;
pub use response::TokenResponseGenerator;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::client::{Client, GrantType};
use crate::config::{EngineOptions, InputLengthRestrictions, PkceOptions};
use crate::context::CallContext;
use crate::grant::{AuthorizationCode, DeviceCodePayload, RefreshTokenPayload};
use crate::profile::{ProfileCaller, ProfileService};
use crate::protocol::{OAuthError, parse_scopes};
use crate::resources::{ResourceValidator, Resources};
use crate::secret::AuthenticatedClient;
use crate::store::GrantRepository;

/// Token 请求的表单参数
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenRequestParameters {
    values: HashMap<String, String>,
}

impl TokenRequestParameters {
    /// 创建空参数集
    pub fn new() -> Self {
        Self::default()
    }

    /// 从参数对构建
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// 设置参数
    pub fn insert(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    /// 读取未经裁剪的参数（密码等可能含首尾空白的值）
    pub fn get_raw(&self, name: &str) -> Option<&str> {
        self.values
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// 读取参数；空白值视为缺失
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// 全部参数
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// 密码与扩展授权验证器的结果
#[derive(Debug, Clone, PartialEq)]
pub enum GrantValidationResult {
    Success {
        subject_id: Option<String>,
        claims: BTreeMap<String, Value>,
    },
    Error(OAuthError),
}

impl GrantValidationResult {
    /// 以某个主体的身份成功
    pub fn success(subject_id: impl Into<String>) -> Self {
        GrantValidationResult::Success {
            subject_id: Some(subject_id.into()),
            claims: BTreeMap::new(),
        }
    }

    /// 附加写入访问令牌的声明
    pub fn with_claim(mut self, name: impl Into<String>, value: Value) -> Self {
        if let GrantValidationResult::Success { claims, .. } = &mut self {
            claims.insert(name.into(), value);
        }
        self
    }

    /// 失败
    pub fn error(error: OAuthError) -> Self {
        GrantValidationResult::Error(error)
    }
}

/// 各授权类型验证后携带的数据
#[derive(Debug, Clone, PartialEq)]
pub enum GrantContext {
    AuthorizationCode(AuthorizationCode),
    ClientCredentials,
    Password {
        claims: BTreeMap<String, Value>,
    },
    RefreshToken {
        /// 客户端出示的 handle
        handle: String,
        payload: RefreshTokenPayload,
    },
    DeviceCode(DeviceCodePayload),
    Extension {
        claims: BTreeMap<String, Value>,
    },
}

/// 通过验证的 token 请求
#[derive(Debug, Clone)]
pub struct ValidatedTokenRequest {
    pub client: Client,
    pub grant_type: GrantType,
    pub subject_id: Option<String>,
    pub session_id: Option<String>,
    /// 最终授予的资源
    pub resources: Resources,
    /// mTLS 绑定的 `cnf` 值
    pub confirmation: Option<String>,
    pub auth_time: Option<DateTime<Utc>>,
    pub context: GrantContext,
}

impl ValidatedTokenRequest {
    /// 授予的 scope
    pub fn scopes(&self) -> Vec<String> {
        self.resources.scope_names()
    }

    /// 是否签发刷新令牌
    ///
    /// 刷新令牌请求总是延续刷新链，即使本次请求收窄后的 scope 不含 `offline_access`
    pub fn wants_refresh_token(&self) -> bool {
        match self.grant_type {
            GrantType::ClientCredentials => false,
            GrantType::RefreshToken => true,
            _ => self.resources.offline_access && self.client.allow_offline_access,
        }
    }
}

/// Token 请求验证器
#[derive(Clone)]
pub struct TokenRequestValidator {
    repository: GrantRepository,
    resources: ResourceValidator,
    profile: Arc<dyn ProfileService>,
    password: Option<Arc<dyn ResourceOwnerPasswordValidator>>,
    extensions: ExtensionGrantRegistry,
    throttler: Arc<dyn DeviceFlowThrottler>,
    lengths: InputLengthRestrictions,
    pkce: PkceOptions,
}

impl TokenRequestValidator {
    /// 创建验证器
    pub fn new(
        repository: GrantRepository,
        resources: ResourceValidator,
        profile: Arc<dyn ProfileService>,
        options: &EngineOptions,
    ) -> Self {
        Self {
            repository,
            resources,
            profile,
            password: None,
            extensions: ExtensionGrantRegistry::new(),
            throttler: Arc::new(IntervalThrottler),
            lengths: options.input_lengths.clone(),
            pkce: options.pkce.clone(),
        }
    }

    /// 启用资源所有者密码授权
    pub fn with_password_validator(
        mut self,
        validator: Arc<dyn ResourceOwnerPasswordValidator>,
    ) -> Self {
        self.password = Some(validator);
        self
    }

    /// 设置扩展授权注册表
    pub fn with_extensions(mut self, extensions: ExtensionGrantRegistry) -> Self {
        self.extensions = extensions;
        self
    }

    /// 替换设备流节流策略
    pub fn with_throttler(mut self, throttler: Arc<dyn DeviceFlowThrottler>) -> Self {
        self.throttler = throttler;
        self
    }

    /// grant 仓库
    pub fn repository(&self) -> &GrantRepository {
        &self.repository
    }

    /// 验证 token 请求
    #[instrument(skip_all, fields(client_id = %client.client_id(), grant_type = tracing::field::Empty))]
    pub async fn validate(
        &self,
        ctx: &CallContext,
        params: &TokenRequestParameters,
        client: &AuthenticatedClient,
    ) -> Result<ValidatedTokenRequest, OAuthError> {
        let Some(raw_grant_type) = params.get("grant_type") else {
            warn!("grant_type is missing");
            return Err(OAuthError::unsupported_grant_type());
        };
        if raw_grant_type.len() > self.lengths.grant_type {
            return Err(OAuthError::invalid_request("grant_type is too long"));
        }
        tracing::Span::current().record("grant_type", raw_grant_type);

        let grant_type = GrantType::parse(raw_grant_type);
        if let GrantType::Extension(name) = &grant_type {
            if !self.extensions.contains(name) {
                warn!("unsupported grant type");
                return Err(OAuthError::unsupported_grant_type());
            }
        }
        if matches!(grant_type, GrantType::Implicit | GrantType::Hybrid) {
            return Err(OAuthError::unsupported_grant_type());
        }

        if !self.client_allows(&client.client, &grant_type, raw_grant_type) {
            warn!("client is not allowed to use grant type");
            return Err(OAuthError::unauthorized_client(
                "Client is not allowed to use this grant type",
            ));
        }

        let mut validated = match &grant_type {
            GrantType::AuthorizationCode => {
                self.validate_authorization_code(ctx, params, &client.client)
                    .await?
            }
            GrantType::ClientCredentials => {
                self.validate_client_credentials(ctx, params, &client.client)
                    .await?
            }
            GrantType::Password => self.validate_password(ctx, params, &client.client).await?,
            GrantType::RefreshToken => {
                self.validate_refresh_token(ctx, params, &client.client)
                    .await?
            }
            GrantType::DeviceCode => {
                self.validate_device_code(ctx, params, &client.client)
                    .await?
            }
            GrantType::Extension(name) => {
                self.validate_extension(ctx, name, params, &client.client)
                    .await?
            }
            GrantType::Implicit | GrantType::Hybrid => {
                return Err(OAuthError::unsupported_grant_type());
            }
        };

        if validated.confirmation.is_none() {
            validated.confirmation = client.confirmation.clone();
        }
        debug!(scopes = ?validated.scopes(), "token request validated");
        Ok(validated)
    }

    fn client_allows(&self, client: &Client, grant_type: &GrantType, raw: &str) -> bool {
        match grant_type {
            // 混合流程的客户端在 token 端点兑换授权码
            GrantType::AuthorizationCode => {
                client.allows_grant_type(&GrantType::AuthorizationCode)
                    || client.allows_grant_type(&GrantType::Hybrid)
            }
            _ => client.allows_grant_type_str(raw),
        }
    }

    /// 主体是否可用
    async fn ensure_active(
        &self,
        ctx: &CallContext,
        subject_id: &str,
        client: &Client,
    ) -> Result<(), OAuthError> {
        let active = ctx
            .run(self.profile.is_active(
                ctx,
                subject_id,
                client,
                ProfileCaller::TokenEndpoint,
            ))
            .await?;
        if active {
            Ok(())
        } else {
            warn!("subject is inactive");
            Err(OAuthError::invalid_grant("User is not active"))
        }
    }

    /// 解析一组 scope；有任何无效 scope 时返回 `invalid_scope`
    async fn resolve_scopes(
        &self,
        ctx: &CallContext,
        client: &Client,
        scopes: &[String],
    ) -> Result<Resources, OAuthError> {
        let validation = self.resources.validate(ctx, client, scopes).await?;
        if !validation.succeeded() {
            return Err(OAuthError::invalid_scope(format!(
                "Invalid scopes: {}",
                validation.invalid_scopes.join(" ")
            )));
        }
        Ok(validation.resources)
    }

    /// 读取可选的 `scope` 参数
    fn requested_scopes(
        &self,
        params: &TokenRequestParameters,
    ) -> Result<Option<Vec<String>>, OAuthError> {
        match params.get("scope") {
            None => Ok(None),
            Some(scope) if scope.len() > self.lengths.scope => {
                Err(OAuthError::invalid_request("scope is too long"))
            }
            Some(scope) => Ok(Some(parse_scopes(scope))),
        }
    }
}

impl std::fmt::Debug for TokenRequestValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenRequestValidator")
            .field("password", &self.password.is_some())
            .field("extensions", &self.extensions)
            .field("lengths", &self.lengths)
            .finish_non_exhaustive()
    }
}

/// 检查不透明输入的长度
fn bounded<'a>(
    params: &'a TokenRequestParameters,
    name: &str,
    limit: usize,
) -> Result<&'a str, OAuthError> {
    match params.get(name) {
        None => Err(OAuthError::invalid_request(format!("{} is missing", name))),
        Some(value) if value.len() > limit => {
            Err(OAuthError::invalid_request(format!("{} is too long", name)))
        }
        Some(value) => Ok(value),
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::clock::FixedClock;
    use crate::profile::DefaultProfileService;
    use crate::resources::{ApiResource, ApiScope, IdentityResource, InMemoryResourceStore};
    use crate::secret::AuthenticationMethod;
    use crate::store::InMemoryGrantStore;

    pub(crate) struct Fixture {
        pub clock: FixedClock,
        pub repo: GrantRepository,
        pub profile: Arc<DefaultProfileService>,
        pub validator: TokenRequestValidator,
    }

    impl Fixture {
        pub fn new() -> Self {
            Self::with_store(Arc::new(InMemoryGrantStore::new()))
        }

        pub fn with_store(store: Arc<dyn crate::store::GrantStore>) -> Self {
            let clock = FixedClock::at_now();
            let repo = GrantRepository::new(store, Arc::new(clock.clone()));
            let resources = ResourceValidator::new(Arc::new(InMemoryResourceStore::new(
                [IdentityResource::openid(), IdentityResource::profile()],
                [ApiScope::new("api1"), ApiScope::new("api2")],
                [ApiResource::new("api", ["api1", "api2"])],
            )));
            let profile = Arc::new(DefaultProfileService::new());
            let validator = TokenRequestValidator::new(
                repo.clone(),
                resources,
                profile.clone(),
                &EngineOptions::default(),
            );
            Self {
                clock,
                repo,
                profile,
                validator,
            }
        }
    }

    pub(crate) fn authenticated(client: Client) -> AuthenticatedClient {
        AuthenticatedClient {
            client,
            method: AuthenticationMethod::SharedSecret,
            confirmation: None,
        }
    }
}
