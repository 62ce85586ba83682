//! 授权端点
//!
//! 处理流程：[`AuthorizeRequestValidator`] 校验原始参数，
//! [`InteractionResolver`] 决定是否需要登录或 consent，
//! 最后由 [`AuthorizeResponseGenerator`] 创建授权码或签发令牌。
//!
//! ## 示例
//!
//! ```rust
//! use grantrs::authorize::{AuthorizeRequest, ResponseType};
//!
//! let request = AuthorizeRequest::from_pairs([
//!     ("client_id", "web"),
//!     ("response_type", "code"),
//!     ("redirect_uri", "https://app.example.com/cb"),
//!     ("scope", "openid profile"),
//! ]);
//!
//! assert_eq!(request.client_id.as_deref(), Some("web"));
//! assert_eq!(ResponseType::parse("id_token code"), Some(ResponseType::CodeIdToken));
//! ```

mod interaction;
mod response;
mod validator;

pub use interaction::{
    ConsentResponse, InteractionCustomizer, InteractionOutcome, InteractionResolver,
    InteractionState,
};
pub use response::{AuthorizeRedirect, AuthorizeResponse, AuthorizeResponseGenerator};
pub use validator::{AuthorizeRequestValidator, RequestObjectValidator};

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::client::{Client, GrantType};
use crate::pkce::PkceCodeChallenge;
use crate::protocol::OAuthError;
use crate::resources::Resources;

/// 授权请求的原始参数
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorizeRequest {
    pub client_id: Option<String>,
    pub response_type: Option<String>,
    pub redirect_uri: Option<String>,
    pub scope: Option<String>,
    pub state: Option<String>,
    pub nonce: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub response_mode: Option<String>,
    pub prompt: Option<String>,
    pub max_age: Option<String>,
    pub login_hint: Option<String>,
    pub acr_values: Option<String>,
    pub ui_locales: Option<String>,
    /// 请求对象（JWT）
    pub request: Option<String>,
}

impl AuthorizeRequest {
    /// 从参数对构建，未知参数被忽略
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut request = Self::default();
        for (name, value) in pairs {
            request.set(name.as_ref(), value.into());
        }
        request
    }

    /// 设置单个参数，返回参数名是否被识别
    pub fn set(&mut self, name: &str, value: String) -> bool {
        let slot = match name {
            "client_id" => &mut self.client_id,
            "response_type" => &mut self.response_type,
            "redirect_uri" => &mut self.redirect_uri,
            "scope" => &mut self.scope,
            "state" => &mut self.state,
            "nonce" => &mut self.nonce,
            "code_challenge" => &mut self.code_challenge,
            "code_challenge_method" => &mut self.code_challenge_method,
            "response_mode" => &mut self.response_mode,
            "prompt" => &mut self.prompt,
            "max_age" => &mut self.max_age,
            "login_hint" => &mut self.login_hint,
            "acr_values" => &mut self.acr_values,
            "ui_locales" => &mut self.ui_locales,
            "request" => &mut self.request,
            _ => return false,
        };
        *slot = Some(value);
        true
    }

    /// 移除 `prompt` 中的 `login` 与 `select_account`
    ///
    /// 宿主程序在用户完成登录后用处理过的请求重新提交，避免再次要求登录。
    pub fn remove_login_prompt(&mut self) {
        let Some(prompt) = self.prompt.take() else {
            return;
        };
        let remaining: Vec<&str> = prompt
            .split_whitespace()
            .filter(|p| !matches!(*p, "login" | "select_account"))
            .collect();
        if !remaining.is_empty() {
            self.prompt = Some(remaining.join(" "));
        }
    }

    /// 合并请求对象中的声明，声明优先于查询参数
    pub fn merge(&mut self, claims: HashMap<String, String>) {
        for (name, value) in claims {
            if name != "request" {
                self.set(&name, value);
            }
        }
    }
}

/// 响应类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseType {
    #[serde(rename = "code")]
    Code,
    #[serde(rename = "token")]
    Token,
    #[serde(rename = "id_token")]
    IdToken,
    #[serde(rename = "id_token token")]
    IdTokenToken,
    #[serde(rename = "code id_token")]
    CodeIdToken,
    #[serde(rename = "code token")]
    CodeToken,
    #[serde(rename = "code id_token token")]
    CodeIdTokenToken,
}

impl ResponseType {
    /// 解析响应类型，各值的顺序无关
    pub fn parse(value: &str) -> Option<Self> {
        let mut code = false;
        let mut token = false;
        let mut id_token = false;
        for part in value.split_whitespace() {
            let seen = match part {
                "code" => &mut code,
                "token" => &mut token,
                "id_token" => &mut id_token,
                _ => return None,
            };
            if *seen {
                return None;
            }
            *seen = true;
        }

        match (code, id_token, token) {
            (true, false, false) => Some(ResponseType::Code),
            (false, false, true) => Some(ResponseType::Token),
            (false, true, false) => Some(ResponseType::IdToken),
            (false, true, true) => Some(ResponseType::IdTokenToken),
            (true, true, false) => Some(ResponseType::CodeIdToken),
            (true, false, true) => Some(ResponseType::CodeToken),
            (true, true, true) => Some(ResponseType::CodeIdTokenToken),
            (false, false, false) => None,
        }
    }

    /// 规范形式
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseType::Code => "code",
            ResponseType::Token => "token",
            ResponseType::IdToken => "id_token",
            ResponseType::IdTokenToken => "id_token token",
            ResponseType::CodeIdToken => "code id_token",
            ResponseType::CodeToken => "code token",
            ResponseType::CodeIdTokenToken => "code id_token token",
        }
    }

    /// 对应的授权类型
    pub fn grant_type(&self) -> GrantType {
        match self {
            ResponseType::Code => GrantType::AuthorizationCode,
            ResponseType::Token | ResponseType::IdToken | ResponseType::IdTokenToken => {
                GrantType::Implicit
            }
            ResponseType::CodeIdToken | ResponseType::CodeToken | ResponseType::CodeIdTokenToken => {
                GrantType::Hybrid
            }
        }
    }

    pub fn includes_code(&self) -> bool {
        matches!(
            self,
            ResponseType::Code
                | ResponseType::CodeIdToken
                | ResponseType::CodeToken
                | ResponseType::CodeIdTokenToken
        )
    }

    pub fn includes_access_token(&self) -> bool {
        matches!(
            self,
            ResponseType::Token
                | ResponseType::IdTokenToken
                | ResponseType::CodeToken
                | ResponseType::CodeIdTokenToken
        )
    }

    pub fn includes_id_token(&self) -> bool {
        matches!(
            self,
            ResponseType::IdToken
                | ResponseType::IdTokenToken
                | ResponseType::CodeIdToken
                | ResponseType::CodeIdTokenToken
        )
    }

    /// 是否在前端通道返回令牌
    pub fn returns_tokens(&self) -> bool {
        self.includes_access_token() || self.includes_id_token()
    }

    /// 未指定 `response_mode` 时使用的模式
    pub fn default_response_mode(&self) -> ResponseMode {
        if *self == ResponseType::Code {
            ResponseMode::Query
        } else {
            ResponseMode::Fragment
        }
    }
}

impl std::fmt::Display for ResponseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 响应模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMode {
    Query,
    Fragment,
    FormPost,
}

impl ResponseMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "query" => Some(ResponseMode::Query),
            "fragment" => Some(ResponseMode::Fragment),
            "form_post" => Some(ResponseMode::FormPost),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseMode::Query => "query",
            ResponseMode::Fragment => "fragment",
            ResponseMode::FormPost => "form_post",
        }
    }
}

/// `prompt` 参数的取值
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Prompt {
    None,
    Login,
    Consent,
    SelectAccount,
}

impl Prompt {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(Prompt::None),
            "login" => Some(Prompt::Login),
            "consent" => Some(Prompt::Consent),
            "select_account" => Some(Prompt::SelectAccount),
            _ => None,
        }
    }
}

/// 通过校验的授权请求
#[derive(Debug, Clone)]
pub struct ValidatedAuthorizeRequest {
    pub client: Client,
    /// 合并请求对象后的原始参数
    pub raw: AuthorizeRequest,
    pub response_type: ResponseType,
    pub response_mode: ResponseMode,
    pub redirect_uri: String,
    pub requested_scopes: Vec<String>,
    pub resources: Resources,
    pub state: Option<String>,
    pub nonce: Option<String>,
    pub code_challenge: Option<PkceCodeChallenge>,
    pub prompt: Vec<Prompt>,
    pub max_age: Option<i64>,
    pub login_hint: Option<String>,
    pub acr_values: Vec<String>,
    pub ui_locales: Option<String>,
    pub is_openid: bool,
}

impl ValidatedAuthorizeRequest {
    /// 是否带有指定的 prompt
    pub fn has_prompt(&self, prompt: Prompt) -> bool {
        self.prompt.contains(&prompt)
    }

    /// 用户完成登录后调用，避免 `prompt=login` 造成循环
    pub fn mark_login_completed(&mut self) {
        self.prompt
            .retain(|p| !matches!(p, Prompt::Login | Prompt::SelectAccount));
        self.raw.remove_login_prompt();
    }

    /// 登录完成后重新提交的请求
    ///
    /// `raw` 已经合并了请求对象中的声明，因此去掉 `request` 参数，
    /// 否则重新合并会带回 `prompt=login`。
    pub fn login_return_request(&self) -> AuthorizeRequest {
        let mut request = self.raw.clone();
        request.remove_login_prompt();
        request.request = None;
        request
    }

    /// 用户完成 consent 后调用
    pub fn mark_consent_completed(&mut self) {
        self.prompt.retain(|p| *p != Prompt::Consent);
    }
}

/// 授权请求错误
///
/// `redirectable` 为 `true` 时错误可以经由已验证的 redirect URI 返回给客户端，
/// 否则宿主程序必须直接向用户展示错误。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizeError {
    pub error: OAuthError,
    pub client_id: Option<String>,
    pub redirect_uri: Option<String>,
    pub response_mode: Option<ResponseMode>,
    pub state: Option<String>,
    pub redirectable: bool,
}

impl AuthorizeError {
    /// 不可重定向的错误
    pub fn local(error: OAuthError, client_id: Option<String>) -> Self {
        Self {
            error,
            client_id,
            redirect_uri: None,
            response_mode: None,
            state: None,
            redirectable: false,
        }
    }

    /// 经由请求中的 redirect URI 返回的错误
    pub fn for_request(error: OAuthError, request: &ValidatedAuthorizeRequest) -> Self {
        Self {
            error,
            client_id: Some(request.client.client_id.clone()),
            redirect_uri: Some(request.redirect_uri.clone()),
            response_mode: Some(request.response_mode),
            state: request.state.clone(),
            redirectable: true,
        }
    }
}

impl std::fmt::Display for AuthorizeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl std::error::Error for AuthorizeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_type_parsing() {
        assert_eq!(ResponseType::parse("code"), Some(ResponseType::Code));
        assert_eq!(
            ResponseType::parse("token id_token"),
            Some(ResponseType::IdTokenToken)
        );
        assert_eq!(
            ResponseType::parse("token code id_token"),
            Some(ResponseType::CodeIdTokenToken)
        );
        assert_eq!(ResponseType::parse(""), None);
        assert_eq!(ResponseType::parse("code code"), None);
        assert_eq!(ResponseType::parse("code device"), None);
    }

    #[test]
    fn test_response_type_grant_type() {
        assert_eq!(ResponseType::Code.grant_type(), GrantType::AuthorizationCode);
        assert_eq!(ResponseType::IdToken.grant_type(), GrantType::Implicit);
        assert_eq!(ResponseType::CodeToken.grant_type(), GrantType::Hybrid);
        assert_eq!(ResponseType::Code.default_response_mode(), ResponseMode::Query);
        assert_eq!(
            ResponseType::CodeIdToken.default_response_mode(),
            ResponseMode::Fragment
        );
    }

    #[test]
    fn test_merge_prefers_claims() {
        let mut request = AuthorizeRequest::from_pairs([
            ("client_id", "web"),
            ("scope", "openid"),
            ("unknown", "x"),
        ]);
        let claims = HashMap::from([
            ("scope".to_string(), "openid api1".to_string()),
            ("request".to_string(), "nested".to_string()),
        ]);
        request.merge(claims);
        assert_eq!(request.scope.as_deref(), Some("openid api1"));
        assert!(request.request.is_none());
    }

    #[test]
    fn test_remove_login_prompt() {
        let mut request = AuthorizeRequest::from_pairs([("prompt", "login consent")]);
        request.remove_login_prompt();
        assert_eq!(request.prompt.as_deref(), Some("consent"));

        let mut request = AuthorizeRequest::from_pairs([("prompt", "select_account login")]);
        request.remove_login_prompt();
        assert!(request.prompt.is_none());

        let mut request = AuthorizeRequest::default();
        request.remove_login_prompt();
        assert!(request.prompt.is_none());
    }
}
