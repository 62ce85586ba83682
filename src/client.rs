//! 客户端注册信息
//!
//! 客户端由外部管理流程创建与更新，引擎只读。[`ClientStore`] 是注册表的
//! 协作者接口，[`InMemoryClientStore`] 是参考实现。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::context::CallContext;
use crate::error::{Error, Result};
use crate::grant::{AccessTokenType, RefreshTokenExpiration, RefreshTokenUsage};
use crate::protocol::constants::{OFFLINE_ACCESS, grant_types};
use crate::secret::ClientSecret;

/// OAuth 授权类型
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum GrantType {
    /// 授权码模式
    AuthorizationCode,
    /// 客户端凭证模式
    ClientCredentials,
    /// 资源所有者密码凭证
    Password,
    /// 刷新令牌
    RefreshToken,
    /// 设备授权（RFC 8628）
    DeviceCode,
    /// 隐式授权
    Implicit,
    /// OIDC 混合流程
    Hybrid,
    /// 扩展授权类型
    Extension(String),
}

impl GrantType {
    /// 协议中的授权类型字符串
    pub fn as_str(&self) -> &str {
        match self {
            GrantType::AuthorizationCode => grant_types::AUTHORIZATION_CODE,
            GrantType::ClientCredentials => grant_types::CLIENT_CREDENTIALS,
            GrantType::Password => grant_types::PASSWORD,
            GrantType::RefreshToken => grant_types::REFRESH_TOKEN,
            GrantType::DeviceCode => grant_types::DEVICE_CODE,
            GrantType::Implicit => grant_types::IMPLICIT,
            GrantType::Hybrid => grant_types::HYBRID,
            GrantType::Extension(name) => name,
        }
    }

    /// 解析授权类型，未知值视为扩展类型
    pub fn parse(s: &str) -> Self {
        match s {
            grant_types::AUTHORIZATION_CODE => GrantType::AuthorizationCode,
            grant_types::CLIENT_CREDENTIALS => GrantType::ClientCredentials,
            grant_types::PASSWORD => GrantType::Password,
            grant_types::REFRESH_TOKEN => GrantType::RefreshToken,
            grant_types::DEVICE_CODE => GrantType::DeviceCode,
            grant_types::IMPLICIT => GrantType::Implicit,
            grant_types::HYBRID => GrantType::Hybrid,
            other => GrantType::Extension(other.to_string()),
        }
    }
}

impl std::fmt::Display for GrantType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for GrantType {
    fn from(s: String) -> Self {
        GrantType::parse(&s)
    }
}

impl From<GrantType> for String {
    fn from(grant_type: GrantType) -> Self {
        grant_type.as_str().to_string()
    }
}

/// 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Client {
    /// 客户端 ID
    pub client_id: String,
    /// 显示名称
    pub client_name: Option<String>,
    /// 是否启用
    pub enabled: bool,

    /// 是否必须出示凭证（公开客户端为 `false`）
    pub require_client_secret: bool,
    /// 凭证列表（支持轮换）
    pub secrets: Vec<ClientSecret>,

    /// 允许的授权类型
    pub allowed_grant_types: Vec<GrantType>,
    /// 注册的重定向 URI（精确匹配）
    pub redirect_uris: Vec<String>,
    /// 允许请求的 scope
    pub allowed_scopes: Vec<String>,

    /// 是否要求 PKCE
    pub require_pkce: bool,
    /// 是否允许 plain PKCE 方法
    pub allow_plain_text_pkce: bool,
    /// 是否允许 `request` 请求对象
    pub allow_request_object: bool,
    /// 是否允许通过浏览器（前端通道）返回访问令牌
    pub allow_access_tokens_via_browser: bool,

    /// 是否需要用户同意
    pub require_consent: bool,
    /// 是否允许记住 consent
    pub allow_remember_consent: bool,
    /// 记住的 consent 有效期（秒）；`None` 表示不过期
    pub consent_lifetime: Option<i64>,

    /// 是否允许 `offline_access`（签发刷新令牌）
    pub allow_offline_access: bool,

    /// 授权码生命周期（秒）
    pub authorization_code_lifetime: i64,
    /// 访问令牌生命周期（秒）
    pub access_token_lifetime: i64,
    /// ID Token 生命周期（秒）
    pub identity_token_lifetime: i64,
    /// 设备码生命周期（秒）
    pub device_code_lifetime: i64,
    /// 刷新令牌绝对生命周期（秒）
    pub absolute_refresh_token_lifetime: i64,
    /// 刷新令牌滑动窗口（秒）
    pub sliding_refresh_token_lifetime: i64,
    /// 刷新令牌使用策略
    pub refresh_token_usage: RefreshTokenUsage,
    /// 刷新令牌过期策略
    pub refresh_token_expiration: RefreshTokenExpiration,

    /// 访问令牌格式
    pub access_token_type: AccessTokenType,
    /// 用户 SSO 会话在本客户端的最大年龄（秒）
    pub user_sso_lifetime: Option<i64>,
    /// 允许的外部身份提供者（空表示不限制）
    pub identity_provider_restrictions: Vec<String>,
    /// 设备流最小轮询间隔（秒），覆盖全局设置
    pub polling_interval: Option<u64>,
}

impl Default for Client {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_name: None,
            enabled: true,
            require_client_secret: true,
            secrets: Vec::new(),
            allowed_grant_types: Vec::new(),
            redirect_uris: Vec::new(),
            allowed_scopes: Vec::new(),
            require_pkce: true,
            allow_plain_text_pkce: false,
            allow_request_object: false,
            allow_access_tokens_via_browser: false,
            require_consent: false,
            allow_remember_consent: true,
            consent_lifetime: None,
            allow_offline_access: false,
            authorization_code_lifetime: 300,
            access_token_lifetime: 3600,
            identity_token_lifetime: 300,
            device_code_lifetime: 300,
            absolute_refresh_token_lifetime: 2_592_000,
            sliding_refresh_token_lifetime: 1_296_000,
            refresh_token_usage: RefreshTokenUsage::OneTimeOnly,
            refresh_token_expiration: RefreshTokenExpiration::Absolute,
            access_token_type: AccessTokenType::Jwt,
            user_sso_lifetime: None,
            identity_provider_restrictions: Vec::new(),
            polling_interval: None,
        }
    }
}

impl Client {
    /// 创建构建器
    pub fn builder(client_id: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(client_id)
    }

    /// 检查是否允许指定的授权类型
    pub fn allows_grant_type(&self, grant_type: &GrantType) -> bool {
        self.allowed_grant_types.contains(grant_type)
    }

    /// 检查是否允许指定的授权类型字符串
    ///
    /// `refresh_token` 由 `allow_offline_access` 控制
    pub fn allows_grant_type_str(&self, grant_type: &str) -> bool {
        if grant_type == grant_types::REFRESH_TOKEN {
            return self.allow_offline_access;
        }
        self.allows_grant_type(&GrantType::parse(grant_type))
    }

    /// 检查重定向 URI 是否精确匹配某个注册值
    pub fn allows_redirect_uri(&self, uri: &str) -> bool {
        self.redirect_uris.iter().any(|allowed| allowed == uri)
    }

    /// 检查是否允许指定 scope
    pub fn allows_scope(&self, scope: &str) -> bool {
        if scope == OFFLINE_ACCESS {
            return self.allow_offline_access;
        }
        self.allowed_scopes.iter().any(|s| s == scope)
    }

    /// 检查身份提供者限制
    pub fn allows_identity_provider(&self, idp: &str) -> bool {
        self.identity_provider_restrictions.is_empty()
            || self.identity_provider_restrictions.iter().any(|p| p == idp)
    }

    /// 禁用客户端
    pub fn disable(&mut self) {
        self.enabled = false;
    }
}

/// 客户端构建器
#[derive(Debug)]
pub struct ClientBuilder {
    client: Client,
}

impl ClientBuilder {
    /// 创建新的构建器
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client: Client {
                client_id: client_id.into(),
                ..Default::default()
            },
        }
    }

    /// 设置名称
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.client.client_name = Some(name.into());
        self
    }

    /// 公开客户端：不需要凭证
    pub fn public(mut self) -> Self {
        self.client.require_client_secret = false;
        self
    }

    /// 添加凭证
    pub fn secret(mut self, secret: ClientSecret) -> Self {
        self.client.secrets.push(secret);
        self
    }

    /// 添加授权类型
    pub fn grant_type(mut self, grant_type: GrantType) -> Self {
        if !self.client.allowed_grant_types.contains(&grant_type) {
            self.client.allowed_grant_types.push(grant_type);
        }
        self
    }

    /// 添加重定向 URI
    pub fn redirect_uri(mut self, uri: impl Into<String>) -> Self {
        self.client.redirect_uris.push(uri.into());
        self
    }

    /// 添加允许的 scope
    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.client.allowed_scopes.push(scope.into());
        self
    }

    /// 设置多个允许的 scope
    pub fn scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.client
            .allowed_scopes
            .extend(scopes.into_iter().map(Into::into));
        self
    }

    /// 设置 PKCE 策略
    pub fn pkce(mut self, require: bool, allow_plain: bool) -> Self {
        self.client.require_pkce = require;
        self.client.allow_plain_text_pkce = allow_plain;
        self
    }

    /// 设置是否需要 consent
    pub fn require_consent(mut self, require: bool) -> Self {
        self.client.require_consent = require;
        self
    }

    /// 允许 `offline_access`
    pub fn offline_access(mut self) -> Self {
        self.client.allow_offline_access = true;
        self
    }

    /// 允许 `request` 请求对象
    pub fn allow_request_object(mut self) -> Self {
        self.client.allow_request_object = true;
        self
    }

    /// 允许通过浏览器返回访问令牌
    pub fn allow_access_tokens_via_browser(mut self) -> Self {
        self.client.allow_access_tokens_via_browser = true;
        self
    }

    /// 设置访问令牌格式
    pub fn access_token_type(mut self, access_token_type: AccessTokenType) -> Self {
        self.client.access_token_type = access_token_type;
        self
    }

    /// 设置授权码生命周期
    pub fn authorization_code_lifetime(mut self, seconds: i64) -> Self {
        self.client.authorization_code_lifetime = seconds;
        self
    }

    /// 设置访问令牌生命周期
    pub fn access_token_lifetime(mut self, seconds: i64) -> Self {
        self.client.access_token_lifetime = seconds;
        self
    }

    /// 设置设备码生命周期与轮询间隔
    pub fn device_flow(mut self, lifetime: i64, polling_interval: Option<u64>) -> Self {
        self.client.device_code_lifetime = lifetime;
        self.client.polling_interval = polling_interval;
        self
    }

    /// 设置 SSO 会话最大年龄
    pub fn user_sso_lifetime(mut self, seconds: i64) -> Self {
        self.client.user_sso_lifetime = Some(seconds);
        self
    }

    /// 添加身份提供者限制
    pub fn identity_provider(mut self, idp: impl Into<String>) -> Self {
        self.client.identity_provider_restrictions.push(idp.into());
        self
    }

    /// 构建客户端
    pub fn build(self) -> Result<Client> {
        let client = self.client;

        if client.client_id.trim().is_empty() {
            return Err(Error::invalid_config("client_id", "client id cannot be empty"));
        }

        for uri in &client.redirect_uris {
            validate_redirect_uri(uri)?;
        }

        if client.require_client_secret && client.secrets.is_empty() {
            return Err(Error::invalid_config(
                "secrets",
                "confidential client needs at least one secret",
            ));
        }

        for (key, value) in [
            ("authorization_code_lifetime", client.authorization_code_lifetime),
            ("access_token_lifetime", client.access_token_lifetime),
            ("device_code_lifetime", client.device_code_lifetime),
            (
                "absolute_refresh_token_lifetime",
                client.absolute_refresh_token_lifetime,
            ),
        ] {
            if value <= 0 {
                return Err(Error::invalid_config(key, "lifetime must be positive"));
            }
        }

        Ok(client)
    }
}

/// 验证重定向 URI 格式
///
/// 必须是绝对 URI 且不含 fragment（RFC 6749 Section 3.1.2）
fn validate_redirect_uri(uri: &str) -> Result<()> {
    let parsed = url::Url::parse(uri)
        .map_err(|e| Error::invalid_config("redirect_uris", format!("{}: {}", uri, e)))?;

    if parsed.fragment().is_some() {
        return Err(Error::invalid_config(
            "redirect_uris",
            format!("{}: redirect URI must not contain a fragment", uri),
        ));
    }

    Ok(())
}

/// 客户端注册表
#[async_trait]
pub trait ClientStore: Send + Sync {
    /// 根据 client_id 查找客户端
    async fn find_client_by_id(&self, ctx: &CallContext, client_id: &str)
    -> Result<Option<Client>>;

    /// 查找已启用的客户端
    async fn find_enabled_client_by_id(
        &self,
        ctx: &CallContext,
        client_id: &str,
    ) -> Result<Option<Client>> {
        Ok(self
            .find_client_by_id(ctx, client_id)
            .await?
            .filter(|client| client.enabled))
    }
}

/// 内存客户端存储实现
#[derive(Debug, Default, Clone)]
pub struct InMemoryClientStore {
    clients: Arc<RwLock<HashMap<String, Client>>>,
}

impl InMemoryClientStore {
    /// 从客户端列表创建
    pub fn new(clients: impl IntoIterator<Item = Client>) -> Self {
        let clients = clients
            .into_iter()
            .map(|c| (c.client_id.clone(), c))
            .collect();
        Self {
            clients: Arc::new(RwLock::new(clients)),
        }
    }

    /// 添加或替换客户端
    pub async fn upsert(&self, client: Client) {
        let mut clients = self.clients.write().await;
        clients.insert(client.client_id.clone(), client);
    }

    /// 删除客户端
    pub async fn remove(&self, client_id: &str) -> bool {
        let mut clients = self.clients.write().await;
        clients.remove(client_id).is_some()
    }
}

#[async_trait]
impl ClientStore for InMemoryClientStore {
    async fn find_client_by_id(
        &self,
        _ctx: &CallContext,
        client_id: &str,
    ) -> Result<Option<Client>> {
        let clients = self.clients.read().await;
        Ok(clients.get(client_id).cloned())
    }
}
