//! Grant 数据模型
//!
//! 所有由服务端签发、可撤销的凭证（授权码、引用访问令牌、刷新令牌、设备码、
//! 用户 consent）都是同一个 [`Grant`]：公共信封（key、subject、client、
//! 创建时间、生命周期、消费时间）加上按种类区分的 [`GrantPayload`]。
//!
//! 存储的 key 是 `sha256(handle + ":" + kind)` 的十六进制，交给客户端的原始
//! handle 永远不会落盘；同一 handle 在不同种类下也不会冲突。

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::pkce::PkceCodeChallenge;
use crate::random::hex_encode;

/// Grant 种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantKind {
    /// 授权码
    AuthorizationCode,
    /// 刷新令牌
    RefreshToken,
    /// 引用（不透明）访问令牌
    ReferenceToken,
    /// 设备码
    DeviceCode,
    /// 记住的用户 consent
    UserConsent,
}

impl GrantKind {
    /// 全部种类
    pub const ALL: [GrantKind; 5] = [
        GrantKind::AuthorizationCode,
        GrantKind::RefreshToken,
        GrantKind::ReferenceToken,
        GrantKind::DeviceCode,
        GrantKind::UserConsent,
    ];

    /// 种类字符串（参与 key 哈希）
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantKind::AuthorizationCode => "authorization_code",
            GrantKind::RefreshToken => "refresh_token",
            GrantKind::ReferenceToken => "reference_token",
            GrantKind::DeviceCode => "device_code",
            GrantKind::UserConsent => "user_consent",
        }
    }
}

impl std::fmt::Display for GrantKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 计算 handle 在指定种类下的存储 key
///
/// ```rust
/// use grantrs::grant::{GrantKind, hash_handle};
///
/// let a = hash_handle("abc", GrantKind::AuthorizationCode);
/// let b = hash_handle("abc", GrantKind::RefreshToken);
/// assert_ne!(a, b);
/// assert_eq!(a.len(), 64);
/// ```
pub fn hash_handle(handle: &str, kind: GrantKind) -> String {
    let mut hasher = Sha256::new();
    hasher.update(handle.as_bytes());
    hasher.update(b":");
    hasher.update(kind.as_str().as_bytes());
    hex_encode(&hasher.finalize())
}

/// 计算别名（设备 user code）的存储形式
pub fn hash_alias(alias: &str, kind: GrantKind) -> String {
    hash_handle(&format!("{}:alias", alias), kind)
}

/// 访问令牌格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessTokenType {
    /// 自包含 JWT
    #[default]
    Jwt,
    /// 引用令牌，服务端保存内容，客户端只持有 handle
    Reference,
}

/// 访问令牌的内容
///
/// 由 token 签发者生成；引用令牌与刷新令牌都以它为载荷。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    /// 签发者
    pub issuer: String,
    /// 受众（API 资源名）
    #[serde(default)]
    pub audiences: Vec<String>,
    /// 客户端 ID
    pub client_id: String,
    /// 主体（客户端凭证授权时为空）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
    /// 会话 ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// 授予的 scope
    pub scopes: Vec<String>,
    /// 额外声明
    #[serde(default)]
    pub claims: BTreeMap<String, serde_json::Value>,
    /// 令牌格式
    #[serde(default)]
    pub access_token_type: AccessTokenType,
    /// 签发时间
    pub creation_time: DateTime<Utc>,
    /// 生命周期（秒）
    pub lifetime: i64,
    /// mTLS 证书绑定（`x5t#S256`）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmation: Option<String>,
}

impl Token {
    /// 创建新的令牌内容
    pub fn new(
        issuer: impl Into<String>,
        client_id: impl Into<String>,
        scopes: Vec<String>,
        creation_time: DateTime<Utc>,
        lifetime: i64,
    ) -> Self {
        Self {
            issuer: issuer.into(),
            audiences: Vec::new(),
            client_id: client_id.into(),
            subject_id: None,
            session_id: None,
            scopes,
            claims: BTreeMap::new(),
            access_token_type: AccessTokenType::Jwt,
            creation_time,
            lifetime,
            confirmation: None,
        }
    }

    /// 设置主体
    pub fn with_subject(mut self, subject_id: impl Into<String>) -> Self {
        self.subject_id = Some(subject_id.into());
        self
    }

    /// 设置受众
    pub fn with_audiences(mut self, audiences: Vec<String>) -> Self {
        self.audiences = audiences;
        self
    }

    /// 设置令牌格式
    pub fn with_type(mut self, access_token_type: AccessTokenType) -> Self {
        self.access_token_type = access_token_type;
        self
    }

    /// 添加声明
    pub fn with_claim(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.claims.insert(name.into(), value);
        self
    }

    /// 过期时间
    pub fn expiration(&self) -> DateTime<Utc> {
        self.creation_time + Duration::seconds(self.lifetime)
    }

    /// 是否具有指定 scope
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }
}

/// 授权码载荷
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationCode {
    /// 签发时使用的 redirect URI
    pub redirect_uri: String,
    /// 请求并被授予的 scope
    pub requested_scopes: Vec<String>,
    /// PKCE challenge（签发后不可变）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_challenge: Option<PkceCodeChallenge>,
    /// OIDC nonce
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// 签发时是否向用户展示过 consent 页面
    #[serde(default)]
    pub was_consent_shown: bool,
    /// 用户登录时间
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_time: Option<DateTime<Utc>>,
    /// 是否为 OpenID 请求
    #[serde(default)]
    pub is_openid: bool,
    /// 对 `state` 的哈希（用于 `s_hash`）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_hash: Option<String>,
}

/// 刷新令牌的使用策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshTokenUsage {
    /// 每次使用后轮换为新的 handle
    #[default]
    OneTimeOnly,
    /// handle 保持不变
    ReUse,
}

/// 刷新令牌的过期策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshTokenExpiration {
    /// 从签发时起算的固定生命周期
    #[default]
    Absolute,
    /// 每次使用后延长，但不超过绝对生命周期
    Sliding,
}

/// 刷新令牌载荷
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshTokenPayload {
    /// 绑定的访问令牌内容
    pub access_token: Token,
    /// 轮换版本，每次轮换加一
    pub version: u32,
    /// 使用策略
    pub usage: RefreshTokenUsage,
    /// 过期策略
    pub expiration: RefreshTokenExpiration,
    /// 绝对生命周期上限（秒），从最初签发时起算
    pub absolute_lifetime: i64,
    /// 滑动窗口（秒）
    pub sliding_lifetime: i64,
    /// 整条刷新链最初签发的时间
    pub original_creation_time: DateTime<Utc>,
}

impl RefreshTokenPayload {
    /// 刷新链的绝对过期时间
    pub fn absolute_expiration(&self) -> DateTime<Utc> {
        self.original_creation_time + Duration::seconds(self.absolute_lifetime)
    }
}

/// 设备码载荷
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCodePayload {
    /// 设备请求的 scope
    pub requested_scopes: Vec<String>,
    /// 用户批准的 scope
    #[serde(default)]
    pub authorized_scopes: Vec<String>,
    /// 用户是否已批准
    #[serde(default)]
    pub is_authorized: bool,
    /// 用户是否已拒绝
    #[serde(default)]
    pub denied: bool,
    /// 是否为 OpenID 请求
    #[serde(default)]
    pub is_openid: bool,
    /// 用户登录时间
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_time: Option<DateTime<Utc>>,
    /// 上一次轮询时间（用于无状态限流）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_polled_at: Option<DateTime<Utc>>,
    /// 最小轮询间隔（秒）
    pub interval: u64,
}

/// 用户 consent 载荷
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsentPayload {
    /// 用户同意的 scope
    pub scopes: Vec<String>,
}

/// 按种类区分的载荷
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum GrantPayload {
    AuthorizationCode(AuthorizationCode),
    RefreshToken(RefreshTokenPayload),
    ReferenceToken(Token),
    DeviceCode(DeviceCodePayload),
    UserConsent(ConsentPayload),
}

impl GrantPayload {
    /// 载荷对应的种类
    pub fn kind(&self) -> GrantKind {
        match self {
            GrantPayload::AuthorizationCode(_) => GrantKind::AuthorizationCode,
            GrantPayload::RefreshToken(_) => GrantKind::RefreshToken,
            GrantPayload::ReferenceToken(_) => GrantKind::ReferenceToken,
            GrantPayload::DeviceCode(_) => GrantKind::DeviceCode,
            GrantPayload::UserConsent(_) => GrantKind::UserConsent,
        }
    }
}

/// 持久化的 grant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grant {
    /// 存储 key（handle 的哈希）
    pub key: String,
    /// 主体；客户端凭证与未批准的设备码为空
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
    /// 所属客户端
    pub client_id: String,
    /// 会话 ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// 创建时间
    pub creation_time: DateTime<Utc>,
    /// 生命周期（秒）；`None` 表示永不过期
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lifetime: Option<i64>,
    /// 消费时间
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumed_time: Option<DateTime<Utc>>,
    /// 二级查找键（设备 user code 的哈希）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// 载荷（序列化时带 `kind` 标签）
    #[serde(flatten)]
    pub payload: GrantPayload,
}

impl Grant {
    /// 创建尚未分配 key 的 grant
    pub fn new(
        payload: GrantPayload,
        client_id: impl Into<String>,
        creation_time: DateTime<Utc>,
        lifetime: Option<i64>,
    ) -> Self {
        Self {
            key: String::new(),
            subject_id: None,
            client_id: client_id.into(),
            session_id: None,
            creation_time,
            lifetime,
            consumed_time: None,
            alias: None,
            payload,
        }
    }

    /// 设置主体
    pub fn with_subject(mut self, subject_id: impl Into<String>) -> Self {
        self.subject_id = Some(subject_id.into());
        self
    }

    /// 设置主体（可选）
    pub fn with_optional_subject(mut self, subject_id: Option<String>) -> Self {
        self.subject_id = subject_id;
        self
    }

    /// 设置会话 ID
    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    /// 种类
    pub fn kind(&self) -> GrantKind {
        self.payload.kind()
    }

    /// 过期时间
    pub fn expiration(&self) -> Option<DateTime<Utc>> {
        self.lifetime
            .map(|seconds| self.creation_time + Duration::seconds(seconds))
    }

    /// 在给定时间点是否已过期
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration().is_some_and(|exp| now >= exp)
    }

    /// 是否已被消费
    pub fn is_consumed(&self) -> bool {
        self.consumed_time.is_some()
    }

    /// 剩余有效时间（秒）
    pub fn remaining_lifetime(&self, now: DateTime<Utc>) -> Option<i64> {
        self.expiration().map(|exp| (exp - now).num_seconds().max(0))
    }

    pub fn as_authorization_code(&self) -> Option<&AuthorizationCode> {
        match &self.payload {
            GrantPayload::AuthorizationCode(code) => Some(code),
            _ => None,
        }
    }

    pub fn as_refresh_token(&self) -> Option<&RefreshTokenPayload> {
        match &self.payload {
            GrantPayload::RefreshToken(token) => Some(token),
            _ => None,
        }
    }

    pub fn as_reference_token(&self) -> Option<&Token> {
        match &self.payload {
            GrantPayload::ReferenceToken(token) => Some(token),
            _ => None,
        }
    }

    pub fn as_device_code(&self) -> Option<&DeviceCodePayload> {
        match &self.payload {
            GrantPayload::DeviceCode(device) => Some(device),
            _ => None,
        }
    }

    pub fn as_device_code_mut(&mut self) -> Option<&mut DeviceCodePayload> {
        match &mut self.payload {
            GrantPayload::DeviceCode(device) => Some(device),
            _ => None,
        }
    }

    pub fn as_consent(&self) -> Option<&ConsentPayload> {
        match &self.payload {
            GrantPayload::UserConsent(consent) => Some(consent),
            _ => None,
        }
    }

    /// grant 承载的 scope（无 scope 概念的种类返回空）
    pub fn scopes(&self) -> &[String] {
        match &self.payload {
            GrantPayload::AuthorizationCode(code) => &code.requested_scopes,
            GrantPayload::RefreshToken(token) => &token.access_token.scopes,
            GrantPayload::ReferenceToken(token) => &token.scopes,
            GrantPayload::DeviceCode(device) => {
                if device.is_authorized {
                    &device.authorized_scopes
                } else {
                    &device.requested_scopes
                }
            }
            GrantPayload::UserConsent(consent) => &consent.scopes,
        }
    }
}
