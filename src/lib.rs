//! # GrantRS
//!
//! OAuth 2.0 / OpenID Connect 授权服务器的 grant 签发与校验引擎。
//!
//! ## 功能特性
//!
//! - **授权端点**: 请求校验、登录与 consent 交互决策、授权码与隐式响应
//! - **Token 端点**: authorization_code、client_credentials、password、
//!   refresh_token、device_code 以及扩展授权类型
//! - **PKCE**: S256 / plain 校验
//! - **刷新令牌**: 一次性轮换或复用，绝对/滑动过期
//! - **设备授权流**: user code 批准与轮询节流
//! - **撤销与内省**: RFC 7009 / RFC 7662
//! - **审计**: 结果在引擎边界转换为审计事件
//!
//! 引擎本身不保存状态：客户端、资源、grant、会话和签名都通过 trait 注入，
//! 每个协作者调用都经过 [`context::CallContext`]，支持取消与超时。
//!
//! ## Features
//!
//! - `jwt` - 使用 `jsonwebtoken` 内省自包含访问令牌
//! - `full` - 启用所有功能
//!
//! ## PKCE 示例
//!
//! ```rust
//! use grantrs::pkce::{PkceChallenge, PkceMethod, verify_code_verifier};
//!
//! let challenge = PkceChallenge::new(PkceMethod::S256).unwrap();
//! let stored = challenge.to_code_challenge();
//!
//! assert!(stored.verify(challenge.verifier(), false).is_ok());
//! assert!(verify_code_verifier(PkceMethod::Plain, challenge.verifier(), challenge.challenge(), false).is_err());
//! ```
//!
//! ## Token 请求参数
//!
//! ```rust
//! use grantrs::token_request::TokenRequestParameters;
//!
//! let params = TokenRequestParameters::from_pairs([
//!     ("grant_type", "refresh_token"),
//!     ("refresh_token", "abc"),
//! ]);
//! assert_eq!(params.get("grant_type"), Some("refresh_token"));
//! ```

pub mod audit;
pub mod authorize;
pub mod client;
pub mod clock;
pub mod config;
pub mod consent;
pub mod context;
pub mod device;
pub mod engine;
pub mod error;
pub mod grant;
pub mod introspection;
pub mod issuer;
#[cfg(feature = "jwt")]
pub mod jwt;
pub mod pkce;
pub mod profile;
pub mod protocol;
pub mod random;
pub mod resources;
pub mod revocation;
pub mod secret;
pub mod session;
pub mod store;
pub mod token_request;

pub use error::{Error, Result};

// ============================================================================
// 常用类型导出
// ============================================================================

pub use client::{Client, ClientStore, GrantType, InMemoryClientStore};
pub use context::CallContext;
pub use engine::{AuthorizeResult, GrantEngine, GrantEngineBuilder};
pub use grant::{Grant, GrantKind, GrantPayload, Token};
pub use protocol::{OAuthError, OAuthErrorCode, TokenResponse};
pub use store::{GrantRepository, GrantStore, InMemoryGrantStore};

#[cfg(feature = "jwt")]
pub use jwt::JwtAccessTokenVerifier;
