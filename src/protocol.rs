//! OAuth 协议层结构
//!
//! 提供 RFC 6749 定义的错误对象、token 响应以及若干协议常量。
//! 协议错误是普通返回值：验证器返回 `Result<_, OAuthError>`，
//! 只有基础设施故障（[`crate::Error`]）会被映射为 `server_error`。

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// 协议常量
pub mod constants {
    /// `openid` 身份 scope
    pub const OPENID: &str = "openid";
    /// 请求刷新令牌的 scope
    pub const OFFLINE_ACCESS: &str = "offline_access";

    /// 授权类型标识
    pub mod grant_types {
        pub const AUTHORIZATION_CODE: &str = "authorization_code";
        pub const CLIENT_CREDENTIALS: &str = "client_credentials";
        pub const PASSWORD: &str = "password";
        pub const REFRESH_TOKEN: &str = "refresh_token";
        pub const DEVICE_CODE: &str = "urn:ietf:params:oauth:grant-type:device_code";
        pub const IMPLICIT: &str = "implicit";
        pub const HYBRID: &str = "hybrid";
    }

    /// token 类型提示（撤销与内省）
    pub mod token_type_hints {
        pub const ACCESS_TOKEN: &str = "access_token";
        pub const REFRESH_TOKEN: &str = "refresh_token";
    }
}

/// 将空格分隔的 scope 字符串解析为去重后的列表（保持原有顺序）
pub fn parse_scopes(scope: &str) -> Vec<String> {
    let mut scopes: Vec<String> = Vec::new();
    for s in scope.split_whitespace() {
        if !scopes.iter().any(|existing| existing == s) {
            scopes.push(s.to_string());
        }
    }
    scopes
}

/// 将 scope 列表拼接为空格分隔的字符串
pub fn join_scopes(scopes: &[String]) -> String {
    scopes.join(" ")
}

/// OAuth Token 类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TokenType {
    /// Bearer Token
    #[default]
    Bearer,
    /// 持有证明 Token
    DPoP,
}

impl std::fmt::Display for TokenType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenType::Bearer => write!(f, "Bearer"),
            TokenType::DPoP => write!(f, "DPoP"),
        }
    }
}

/// OAuth 2.0 Token 响应
///
/// 符合 RFC 6749 Section 5.1 的 token 响应结构
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    /// 访问令牌
    pub access_token: String,

    /// Token 类型
    pub token_type: TokenType,

    /// 过期时间（秒）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,

    /// 刷新令牌
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// ID Token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,

    /// 授权范围（空格分隔）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl TokenResponse {
    /// 创建新的 Token 响应
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: TokenType::Bearer,
            expires_in: None,
            refresh_token: None,
            id_token: None,
            scope: None,
        }
    }

    /// 设置过期时间
    pub fn with_expires_in(mut self, seconds: u64) -> Self {
        self.expires_in = Some(seconds);
        self
    }

    /// 设置刷新令牌
    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    /// 设置 ID Token
    pub fn with_id_token(mut self, id_token: impl Into<String>) -> Self {
        self.id_token = Some(id_token.into());
        self
    }

    /// 设置授权范围
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }
}

/// OAuth 错误响应
///
/// 符合 RFC 6749 Section 5.2 的错误响应
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthError {
    /// 错误代码
    pub error: OAuthErrorCode,

    /// 错误描述
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,

    /// 错误信息 URI
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_uri: Option<String>,
}

/// OAuth 错误代码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OAuthErrorCode {
    /// 请求缺少必需参数、包含无效参数值、多次包含某参数或格式错误
    InvalidRequest,
    /// 客户端认证失败
    InvalidClient,
    /// 提供的授权许可或刷新令牌无效、已过期、已撤销
    InvalidGrant,
    /// 客户端没有使用此方法请求授权的权限
    UnauthorizedClient,
    /// 授权服务器不支持此授权类型
    UnsupportedGrantType,
    /// 请求的范围无效、未知或格式错误
    InvalidScope,
    /// 授权服务器遇到意外情况
    ServerError,
    /// 授权服务器暂时无法处理请求
    TemporarilyUnavailable,
    /// 访问被拒绝
    AccessDenied,
    /// 不支持的响应类型
    UnsupportedResponseType,
    /// 不支持 `request` 参数
    RequestNotSupported,
    /// `request` 请求对象无效
    InvalidRequestObject,
    /// 需要登录（`prompt=none`）
    LoginRequired,
    /// 需要用户同意（`prompt=none`）
    ConsentRequired,
    /// 需要其他交互（`prompt=none`）
    InteractionRequired,
    /// 设备流：用户尚未完成授权
    AuthorizationPending,
    /// 设备流：轮询过快
    SlowDown,
    /// 设备流：device code 已过期
    ExpiredToken,
}

impl OAuthErrorCode {
    /// 返回协议中的错误代码字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            OAuthErrorCode::InvalidRequest => "invalid_request",
            OAuthErrorCode::InvalidClient => "invalid_client",
            OAuthErrorCode::InvalidGrant => "invalid_grant",
            OAuthErrorCode::UnauthorizedClient => "unauthorized_client",
            OAuthErrorCode::UnsupportedGrantType => "unsupported_grant_type",
            OAuthErrorCode::InvalidScope => "invalid_scope",
            OAuthErrorCode::ServerError => "server_error",
            OAuthErrorCode::TemporarilyUnavailable => "temporarily_unavailable",
            OAuthErrorCode::AccessDenied => "access_denied",
            OAuthErrorCode::UnsupportedResponseType => "unsupported_response_type",
            OAuthErrorCode::RequestNotSupported => "request_not_supported",
            OAuthErrorCode::InvalidRequestObject => "invalid_request_object",
            OAuthErrorCode::LoginRequired => "login_required",
            OAuthErrorCode::ConsentRequired => "consent_required",
            OAuthErrorCode::InteractionRequired => "interaction_required",
            OAuthErrorCode::AuthorizationPending => "authorization_pending",
            OAuthErrorCode::SlowDown => "slow_down",
            OAuthErrorCode::ExpiredToken => "expired_token",
        }
    }
}

impl std::fmt::Display for OAuthErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl OAuthError {
    /// 创建新的 OAuth 错误
    pub fn new(error: OAuthErrorCode) -> Self {
        Self {
            error,
            error_description: None,
            error_uri: None,
        }
    }

    /// 设置错误描述
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.error_description = Some(description.into());
        self
    }

    /// 创建无效请求错误
    pub fn invalid_request(description: impl Into<String>) -> Self {
        Self::new(OAuthErrorCode::InvalidRequest).with_description(description)
    }

    /// 创建无效客户端错误
    pub fn invalid_client(description: impl Into<String>) -> Self {
        Self::new(OAuthErrorCode::InvalidClient).with_description(description)
    }

    /// 创建无效授权错误
    pub fn invalid_grant(description: impl Into<String>) -> Self {
        Self::new(OAuthErrorCode::InvalidGrant).with_description(description)
    }

    /// 创建无效范围错误
    pub fn invalid_scope(description: impl Into<String>) -> Self {
        Self::new(OAuthErrorCode::InvalidScope).with_description(description)
    }

    /// 创建未授权客户端错误
    pub fn unauthorized_client(description: impl Into<String>) -> Self {
        Self::new(OAuthErrorCode::UnauthorizedClient).with_description(description)
    }

    /// 创建不支持的授权类型错误
    pub fn unsupported_grant_type() -> Self {
        Self::new(OAuthErrorCode::UnsupportedGrantType)
            .with_description("The authorization grant type is not supported")
    }

    /// 创建访问被拒绝错误
    pub fn access_denied(description: impl Into<String>) -> Self {
        Self::new(OAuthErrorCode::AccessDenied).with_description(description)
    }

    /// 创建服务器错误（不携带内部细节）
    pub fn server_error() -> Self {
        Self::new(OAuthErrorCode::ServerError)
            .with_description("The authorization server encountered an unexpected condition")
    }

    /// 错误代码字符串
    pub fn code(&self) -> &'static str {
        self.error.as_str()
    }

    /// 是否为指定错误代码
    pub fn is(&self, code: OAuthErrorCode) -> bool {
        self.error == code
    }
}

impl std::fmt::Display for OAuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.error)?;
        if let Some(desc) = &self.error_description {
            write!(f, ": {}", desc)?;
        }
        Ok(())
    }
}

impl std::error::Error for OAuthError {}

impl From<Error> for OAuthError {
    fn from(err: Error) -> Self {
        tracing::error!(error = %err, "infrastructure failure mapped to server_error");
        OAuthError::server_error()
    }
}
