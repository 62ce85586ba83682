//! 资源与 scope 模型
//!
//! scope 分为两类：身份资源（`openid`、`profile` 等，进入 ID Token）与
//! API scope（进入访问令牌）。API 资源把若干 API scope 组织在一起，
//! 并持有内省所用的凭证与允许的签名算法。

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::client::Client;
use crate::context::CallContext;
use crate::error::{ConfigError, Error, Result};
use crate::protocol::constants::{OFFLINE_ACCESS, OPENID};
use crate::secret::ClientSecret;

/// 身份资源
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityResource {
    pub name: String,
    pub enabled: bool,
    /// 用户在 consent 页面不能取消勾选
    pub required: bool,
    /// 关联的用户声明
    #[serde(default)]
    pub user_claims: Vec<String>,
}

impl IdentityResource {
    /// 创建身份资源
    pub fn new(name: impl Into<String>, user_claims: &[&str]) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            required: false,
            user_claims: user_claims.iter().map(|c| c.to_string()).collect(),
        }
    }

    /// 标准 `openid` 资源
    pub fn openid() -> Self {
        Self {
            required: true,
            ..Self::new(OPENID, &["sub"])
        }
    }

    /// 标准 `profile` 资源
    pub fn profile() -> Self {
        Self::new("profile", &["name", "family_name", "given_name", "updated_at"])
    }

    /// 标准 `email` 资源
    pub fn email() -> Self {
        Self::new("email", &["email", "email_verified"])
    }
}

/// API scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiScope {
    pub name: String,
    pub enabled: bool,
    pub required: bool,
    #[serde(default)]
    pub user_claims: Vec<String>,
}

impl ApiScope {
    /// 创建 API scope
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            required: false,
            user_claims: Vec::new(),
        }
    }

    /// 标记为必选
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// API 资源
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResource {
    /// 资源名（访问令牌的受众）
    pub name: String,
    pub enabled: bool,
    /// 包含的 API scope 名
    pub scopes: Vec<String>,
    /// 内省调用方凭证
    #[serde(default)]
    pub api_secrets: Vec<ClientSecret>,
    /// 允许的访问令牌签名算法；空表示不限制
    #[serde(default)]
    pub allowed_access_token_signing_algorithms: Vec<String>,
}

impl ApiResource {
    /// 创建 API 资源
    pub fn new<I, S>(name: impl Into<String>, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            enabled: true,
            scopes: scopes.into_iter().map(Into::into).collect(),
            api_secrets: Vec::new(),
            allowed_access_token_signing_algorithms: Vec::new(),
        }
    }

    /// 添加内省凭证
    pub fn with_secret(mut self, secret: ClientSecret) -> Self {
        self.api_secrets.push(secret);
        self
    }

    /// 设置允许的签名算法
    pub fn with_signing_algorithms(mut self, algorithms: &[&str]) -> Self {
        self.allowed_access_token_signing_algorithms =
            algorithms.iter().map(|a| a.to_string()).collect();
        self
    }
}

/// 一次请求解析出的资源集合
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resources {
    pub identity_resources: Vec<IdentityResource>,
    pub api_scopes: Vec<ApiScope>,
    pub api_resources: Vec<ApiResource>,
    pub offline_access: bool,
}

impl Resources {
    /// 全部 scope 名
    pub fn scope_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .identity_resources
            .iter()
            .map(|r| r.name.clone())
            .chain(self.api_scopes.iter().map(|s| s.name.clone()))
            .collect();
        if self.offline_access {
            names.push(OFFLINE_ACCESS.to_string());
        }
        names
    }

    /// 是否包含身份资源
    pub fn has_identity_scopes(&self) -> bool {
        !self.identity_resources.is_empty()
    }

    /// 是否包含 `openid`
    pub fn has_openid(&self) -> bool {
        self.identity_resources.iter().any(|r| r.name == OPENID)
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.identity_resources.is_empty() && self.api_scopes.is_empty() && !self.offline_access
    }

    /// 必选 scope 名
    pub fn required_scope_names(&self) -> Vec<String> {
        self.identity_resources
            .iter()
            .filter(|r| r.required)
            .map(|r| r.name.clone())
            .chain(
                self.api_scopes
                    .iter()
                    .filter(|s| s.required)
                    .map(|s| s.name.clone()),
            )
            .collect()
    }

    /// 收窄到给定 scope（用于 consent 与刷新时缩小范围）
    pub fn filter(&self, scopes: &[String]) -> Resources {
        let api_scopes: Vec<ApiScope> = self
            .api_scopes
            .iter()
            .filter(|s| scopes.contains(&s.name))
            .cloned()
            .collect();
        let api_resources = self
            .api_resources
            .iter()
            .filter(|r| api_scopes.iter().any(|s| r.scopes.contains(&s.name)))
            .cloned()
            .collect();

        Resources {
            identity_resources: self
                .identity_resources
                .iter()
                .filter(|r| scopes.contains(&r.name))
                .cloned()
                .collect(),
            api_scopes,
            api_resources,
            offline_access: self.offline_access && scopes.iter().any(|s| s == OFFLINE_ACCESS),
        }
    }

    /// 访问令牌受众
    pub fn audiences(&self) -> Vec<String> {
        self.api_resources.iter().map(|r| r.name.clone()).collect()
    }

    /// 所有 API 资源共同允许的签名算法
    pub fn signing_algorithms(&self) -> Result<Vec<String>> {
        find_matching_signing_algorithms(&self.api_resources)
    }
}

/// 求 API 资源允许的签名算法的交集
///
/// 没有资源声明限制时返回空列表（使用默认签名密钥）；存在限制但交集为空时
/// 是配置错误。
///
/// ```rust
/// use grantrs::resources::{ApiResource, find_matching_signing_algorithms};
///
/// let a = ApiResource::new("a", ["a"]).with_signing_algorithms(&["RS256", "ES256"]);
/// let b = ApiResource::new("b", ["b"]).with_signing_algorithms(&["RS256", "PS256"]);
/// assert_eq!(find_matching_signing_algorithms(&[a, b]).unwrap(), vec!["RS256"]);
/// ```
pub fn find_matching_signing_algorithms(resources: &[ApiResource]) -> Result<Vec<String>> {
    let mut restricted = resources
        .iter()
        .filter(|r| !r.allowed_access_token_signing_algorithms.is_empty());

    let Some(first) = restricted.next() else {
        return Ok(Vec::new());
    };

    let mut matching: BTreeSet<&str> = first
        .allowed_access_token_signing_algorithms
        .iter()
        .map(String::as_str)
        .collect();
    for resource in restricted {
        let allowed: BTreeSet<&str> = resource
            .allowed_access_token_signing_algorithms
            .iter()
            .map(String::as_str)
            .collect();
        matching = matching.intersection(&allowed).copied().collect();
    }

    if matching.is_empty() {
        let names: Vec<&str> = resources.iter().map(|r| r.name.as_str()).collect();
        return Err(Error::Config(ConfigError::NoMatchingSigningAlgorithm(
            names.join(", "),
        )));
    }

    Ok(matching.into_iter().map(str::to_string).collect())
}

/// 资源存储
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// 按名称查找身份资源
    async fn find_identity_resources_by_scope_name(
        &self,
        ctx: &CallContext,
        names: &[String],
    ) -> Result<Vec<IdentityResource>>;

    /// 按名称查找 API scope
    async fn find_api_scopes_by_name(
        &self,
        ctx: &CallContext,
        names: &[String],
    ) -> Result<Vec<ApiScope>>;

    /// 查找包含任一 scope 的 API 资源
    async fn find_api_resources_by_scope_name(
        &self,
        ctx: &CallContext,
        names: &[String],
    ) -> Result<Vec<ApiResource>>;

    /// 按资源名查找 API 资源
    async fn find_api_resource_by_name(
        &self,
        ctx: &CallContext,
        name: &str,
    ) -> Result<Option<ApiResource>>;
}

/// 内存资源存储
#[derive(Debug, Default, Clone)]
pub struct InMemoryResourceStore {
    inner: Arc<RwLock<ResourceTables>>,
}

#[derive(Debug, Default)]
struct ResourceTables {
    identity: HashMap<String, IdentityResource>,
    scopes: HashMap<String, ApiScope>,
    apis: HashMap<String, ApiResource>,
}

impl InMemoryResourceStore {
    /// 创建资源存储
    pub fn new(
        identity: impl IntoIterator<Item = IdentityResource>,
        scopes: impl IntoIterator<Item = ApiScope>,
        apis: impl IntoIterator<Item = ApiResource>,
    ) -> Self {
        let tables = ResourceTables {
            identity: identity.into_iter().map(|r| (r.name.clone(), r)).collect(),
            scopes: scopes.into_iter().map(|s| (s.name.clone(), s)).collect(),
            apis: apis.into_iter().map(|a| (a.name.clone(), a)).collect(),
        };
        Self {
            inner: Arc::new(RwLock::new(tables)),
        }
    }
}

#[async_trait]
impl ResourceStore for InMemoryResourceStore {
    async fn find_identity_resources_by_scope_name(
        &self,
        _ctx: &CallContext,
        names: &[String],
    ) -> Result<Vec<IdentityResource>> {
        let tables = self.inner.read().await;
        Ok(names
            .iter()
            .filter_map(|n| tables.identity.get(n).cloned())
            .collect())
    }

    async fn find_api_scopes_by_name(
        &self,
        _ctx: &CallContext,
        names: &[String],
    ) -> Result<Vec<ApiScope>> {
        let tables = self.inner.read().await;
        Ok(names
            .iter()
            .filter_map(|n| tables.scopes.get(n).cloned())
            .collect())
    }

    async fn find_api_resources_by_scope_name(
        &self,
        _ctx: &CallContext,
        names: &[String],
    ) -> Result<Vec<ApiResource>> {
        let tables = self.inner.read().await;
        let mut found: Vec<ApiResource> = tables
            .apis
            .values()
            .filter(|api| api.scopes.iter().any(|s| names.contains(s)))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }

    async fn find_api_resource_by_name(
        &self,
        _ctx: &CallContext,
        name: &str,
    ) -> Result<Option<ApiResource>> {
        let tables = self.inner.read().await;
        Ok(tables.apis.get(name).cloned())
    }
}

/// scope 解析结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceValidation {
    /// 解析成功的资源
    pub resources: Resources,
    /// 未知或客户端不允许的 scope
    pub invalid_scopes: Vec<String>,
}

impl ResourceValidation {
    /// 全部 scope 都有效
    pub fn succeeded(&self) -> bool {
        self.invalid_scopes.is_empty()
    }
}

/// 将请求的 scope 解析为资源，并对照客户端的允许列表
#[derive(Clone)]
pub struct ResourceValidator {
    store: Arc<dyn ResourceStore>,
}

impl ResourceValidator {
    /// 创建验证器
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self { store }
    }

    /// 资源存储
    pub fn store(&self) -> &Arc<dyn ResourceStore> {
        &self.store
    }

    /// 解析并验证 scope
    pub async fn validate(
        &self,
        ctx: &CallContext,
        client: &Client,
        requested: &[String],
    ) -> Result<ResourceValidation> {
        let identity = ctx
            .run(self.store.find_identity_resources_by_scope_name(ctx, requested))
            .await?;
        let api_scopes = ctx
            .run(self.store.find_api_scopes_by_name(ctx, requested))
            .await?;

        let mut result = ResourceValidation::default();
        for scope in requested {
            if scope == OFFLINE_ACCESS {
                if client.allow_offline_access {
                    result.resources.offline_access = true;
                } else {
                    result.invalid_scopes.push(scope.clone());
                }
                continue;
            }

            let allowed = client.allows_scope(scope);
            if let Some(resource) = identity.iter().find(|r| &r.name == scope && r.enabled) {
                if allowed {
                    result.resources.identity_resources.push(resource.clone());
                } else {
                    result.invalid_scopes.push(scope.clone());
                }
            } else if let Some(api_scope) = api_scopes.iter().find(|s| &s.name == scope && s.enabled)
            {
                if allowed {
                    result.resources.api_scopes.push(api_scope.clone());
                } else {
                    result.invalid_scopes.push(scope.clone());
                }
            } else {
                result.invalid_scopes.push(scope.clone());
            }
        }

        if !result.resources.api_scopes.is_empty() {
            let names: Vec<String> = result
                .resources
                .api_scopes
                .iter()
                .map(|s| s.name.clone())
                .collect();
            result.resources.api_resources = ctx
                .run(self.store.find_api_resources_by_scope_name(ctx, &names))
                .await?
                .into_iter()
                .filter(|api| api.enabled)
                .collect();
        }

        if !result.succeeded() {
            debug!(
                client_id = %client.client_id,
                invalid = ?result.invalid_scopes,
                "requested scopes rejected"
            );
        }

        Ok(result)
    }

    /// 客户端被允许的全部 API scope（客户端凭证授权未请求 scope 时使用）
    pub async fn allowed_api_scopes(
        &self,
        ctx: &CallContext,
        client: &Client,
    ) -> Result<Vec<String>> {
        let found = ctx
            .run(self.store.find_api_scopes_by_name(ctx, &client.allowed_scopes))
            .await?;
        Ok(found
            .into_iter()
            .filter(|s| s.enabled)
            .map(|s| s.name)
            .collect())
    }
}

impl std::fmt::Debug for ResourceValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceValidator").finish_non_exhaustive()
    }
}
