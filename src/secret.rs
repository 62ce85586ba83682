//! 客户端凭证验证
//!
//! 支持共享密钥（存储 SHA-256 / SHA-512 哈希）、X.509 证书指纹、X.509 主题名，
//! 以及 mutual-TLS 通道绑定。一个客户端可以配置多个凭证以便轮换；过期的凭证
//! 会被跳过，只有全部不匹配时才算失败。
//!
//! HTTP 层负责从请求中取出凭证（Basic 认证头、表单字段、TLS 客户端证书），
//! 组装成 [`ParsedSecret`] 交给 [`ClientAuthenticator`]。

use std::sync::Arc;

use base64::{
    Engine,
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use tracing::{debug, instrument, warn};

use crate::client::{Client, ClientStore};
use crate::clock::Clock;
use crate::config::InputLengthRestrictions;
use crate::context::CallContext;
use crate::protocol::OAuthError;
use crate::random::{constant_time_compare_str, hex_encode};
use crate::resources::{ApiResource, ResourceStore};

/// 凭证类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretType {
    /// 共享密钥（存储哈希）
    SharedSecret,
    /// X.509 证书指纹（DER 的 SHA-256 十六进制）
    X509Thumbprint,
    /// X.509 证书主题名
    X509Name,
}

/// 客户端或 API 资源配置的凭证
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSecret {
    #[serde(rename = "type")]
    pub secret_type: SecretType,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<DateTime<Utc>>,
}

impl ClientSecret {
    /// 由明文创建共享密钥（存储 SHA-256 哈希）
    pub fn shared(plain: &str) -> Self {
        Self::hashed(hash_secret_sha256(plain))
    }

    /// 由明文创建共享密钥（存储 SHA-512 哈希）
    pub fn shared_sha512(plain: &str) -> Self {
        Self::hashed(hash_secret_sha512(plain))
    }

    /// 使用已经哈希过的值
    pub fn hashed(value: impl Into<String>) -> Self {
        Self {
            secret_type: SecretType::SharedSecret,
            value: value.into(),
            description: None,
            expiration: None,
        }
    }

    /// 证书指纹
    pub fn x509_thumbprint(thumbprint: impl Into<String>) -> Self {
        Self {
            secret_type: SecretType::X509Thumbprint,
            value: thumbprint.into(),
            description: None,
            expiration: None,
        }
    }

    /// 证书主题名
    pub fn x509_name(subject_name: impl Into<String>) -> Self {
        Self {
            secret_type: SecretType::X509Name,
            value: subject_name.into(),
            description: None,
            expiration: None,
        }
    }

    /// 设置描述
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// 设置过期时间
    pub fn with_expiration(mut self, expiration: DateTime<Utc>) -> Self {
        self.expiration = Some(expiration);
        self
    }

    /// 在给定时间点是否已过期
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration.is_some_and(|exp| exp <= now)
    }
}

/// 计算共享密钥的 SHA-256 哈希（标准 Base64）
pub fn hash_secret_sha256(plain: &str) -> String {
    STANDARD.encode(Sha256::digest(plain.as_bytes()))
}

/// 计算共享密钥的 SHA-512 哈希（标准 Base64）
pub fn hash_secret_sha512(plain: &str) -> String {
    STANDARD.encode(Sha512::digest(plain.as_bytes()))
}

/// mTLS 握手中出示的客户端证书
///
/// 证书解析由 TLS 终结方完成，这里只需要 DER 字节与主题名。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentedCertificate {
    pub der: Vec<u8>,
    pub subject_name: String,
}

impl PresentedCertificate {
    /// 创建
    pub fn new(der: impl Into<Vec<u8>>, subject_name: impl Into<String>) -> Self {
        Self {
            der: der.into(),
            subject_name: subject_name.into(),
        }
    }

    /// SHA-256 指纹（十六进制）
    pub fn thumbprint(&self) -> String {
        hex_encode(&Sha256::digest(&self.der))
    }

    /// `x5t#S256` 确认值（base64url）
    pub fn x5t_s256(&self) -> String {
        URL_SAFE_NO_PAD.encode(Sha256::digest(&self.der))
    }
}

/// 请求中出示的凭证
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretCredential {
    /// 未出示（公开客户端）
    None,
    /// 共享密钥明文
    SharedSecret(String),
    /// mTLS 客户端证书
    X509Certificate(PresentedCertificate),
}

/// 从请求中解析出的凭证
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSecret {
    pub id: String,
    pub credential: SecretCredential,
}

impl ParsedSecret {
    /// 只有 ID（公开客户端）
    pub fn public(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            credential: SecretCredential::None,
        }
    }

    /// ID + 共享密钥
    pub fn shared(id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            credential: SecretCredential::SharedSecret(secret.into()),
        }
    }

    /// ID + mTLS 证书
    pub fn certificate(id: impl Into<String>, certificate: PresentedCertificate) -> Self {
        Self {
            id: id.into(),
            credential: SecretCredential::X509Certificate(certificate),
        }
    }
}

/// 凭证验证成功的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretMatch {
    /// 匹配的凭证描述
    pub description: Option<String>,
    /// mTLS 绑定的 `cnf` 确认值
    pub confirmation: Option<String>,
}

/// 凭证验证器
#[derive(Clone)]
pub struct SecretValidator {
    clock: Arc<dyn Clock>,
}

impl SecretValidator {
    /// 创建验证器
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// 在配置的凭证中查找第一个匹配且未过期的凭证
    ///
    /// `SecretCredential::None` 永远不会匹配，是否允许公开客户端由调用方决定。
    pub fn validate(
        &self,
        secrets: &[ClientSecret],
        presented: &SecretCredential,
    ) -> Option<SecretMatch> {
        let now = self.clock.now();
        let active = || secrets.iter().filter(move |s| !s.is_expired(now));

        match presented {
            SecretCredential::None => None,
            SecretCredential::SharedSecret(plain) => {
                if plain.is_empty() {
                    return None;
                }
                let sha256 = hash_secret_sha256(plain);
                let sha512 = hash_secret_sha512(plain);
                active()
                    .filter(|s| s.secret_type == SecretType::SharedSecret)
                    .find(|s| {
                        constant_time_compare_str(&s.value, &sha256)
                            || constant_time_compare_str(&s.value, &sha512)
                    })
                    .map(|s| SecretMatch {
                        description: s.description.clone(),
                        confirmation: None,
                    })
            }
            SecretCredential::X509Certificate(cert) => {
                let thumbprint = cert.thumbprint();
                active()
                    .find(|s| match s.secret_type {
                        SecretType::X509Thumbprint => s.value.eq_ignore_ascii_case(&thumbprint),
                        SecretType::X509Name => s.value == cert.subject_name,
                        SecretType::SharedSecret => false,
                    })
                    .map(|s| SecretMatch {
                        description: s.description.clone(),
                        confirmation: Some(cert.x5t_s256()),
                    })
            }
        }
    }
}

impl std::fmt::Debug for SecretValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretValidator").finish_non_exhaustive()
    }
}

/// 客户端认证方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthenticationMethod {
    /// 公开客户端，未出示凭证
    None,
    /// 共享密钥
    SharedSecret,
    /// mTLS 证书
    TlsClientAuth,
}

/// 已认证的客户端
#[derive(Debug, Clone)]
pub struct AuthenticatedClient {
    pub client: Client,
    pub method: AuthenticationMethod,
    /// mTLS 绑定的 `x5t#S256`
    pub confirmation: Option<String>,
}

impl AuthenticatedClient {
    /// 客户端 ID
    pub fn client_id(&self) -> &str {
        &self.client.client_id
    }
}

/// 客户端认证：注册表查找 + 凭证验证
#[derive(Clone)]
pub struct ClientAuthenticator {
    clients: Arc<dyn ClientStore>,
    validator: SecretValidator,
    lengths: InputLengthRestrictions,
}

impl ClientAuthenticator {
    /// 创建认证器
    pub fn new(
        clients: Arc<dyn ClientStore>,
        validator: SecretValidator,
        lengths: InputLengthRestrictions,
    ) -> Self {
        Self {
            clients,
            validator,
            lengths,
        }
    }

    /// 认证客户端，失败返回 `invalid_client`
    #[instrument(skip_all, fields(client_id = %parsed.id))]
    pub async fn authenticate(
        &self,
        ctx: &CallContext,
        parsed: &ParsedSecret,
    ) -> Result<AuthenticatedClient, OAuthError> {
        if parsed.id.is_empty() || parsed.id.len() > self.lengths.client_id {
            return Err(OAuthError::invalid_client("Invalid client id"));
        }
        if let SecretCredential::SharedSecret(secret) = &parsed.credential {
            if secret.len() > self.lengths.client_secret {
                return Err(OAuthError::invalid_client("Client secret too long"));
            }
        }

        let Some(client) = ctx
            .run(self.clients.find_enabled_client_by_id(ctx, &parsed.id))
            .await?
        else {
            debug!("unknown or disabled client");
            return Err(OAuthError::invalid_client("Unknown client"));
        };

        if !client.require_client_secret {
            debug!("public client authenticated without secret");
            return Ok(AuthenticatedClient {
                client,
                method: AuthenticationMethod::None,
                confirmation: None,
            });
        }

        let method = match &parsed.credential {
            SecretCredential::None => {
                debug!("confidential client presented no secret");
                return Err(OAuthError::invalid_client("Client secret required"));
            }
            SecretCredential::SharedSecret(_) => AuthenticationMethod::SharedSecret,
            SecretCredential::X509Certificate(_) => AuthenticationMethod::TlsClientAuth,
        };

        match self.validator.validate(&client.secrets, &parsed.credential) {
            Some(found) => {
                debug!(method = ?method, "client authenticated");
                Ok(AuthenticatedClient {
                    client,
                    method,
                    confirmation: found.confirmation,
                })
            }
            None => {
                warn!("client secret validation failed");
                Err(OAuthError::invalid_client("Invalid client credentials"))
            }
        }
    }
}

impl std::fmt::Debug for ClientAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientAuthenticator").finish_non_exhaustive()
    }
}

/// API 资源认证（内省调用方）
#[derive(Clone)]
pub struct ApiResourceAuthenticator {
    resources: Arc<dyn ResourceStore>,
    validator: SecretValidator,
}

impl ApiResourceAuthenticator {
    /// 创建认证器
    pub fn new(resources: Arc<dyn ResourceStore>, validator: SecretValidator) -> Self {
        Self {
            resources,
            validator,
        }
    }

    /// 认证 API 资源，失败返回 `invalid_client`
    #[instrument(skip_all, fields(api = %parsed.id))]
    pub async fn authenticate(
        &self,
        ctx: &CallContext,
        parsed: &ParsedSecret,
    ) -> Result<ApiResource, OAuthError> {
        if parsed.id.is_empty() || parsed.credential == SecretCredential::None {
            return Err(OAuthError::invalid_client("Missing API credentials"));
        }

        let Some(api) = ctx
            .run(self.resources.find_api_resource_by_name(ctx, &parsed.id))
            .await?
            .filter(|api| api.enabled)
        else {
            debug!("unknown API resource");
            return Err(OAuthError::invalid_client("Unknown API resource"));
        };

        if self
            .validator
            .validate(&api.api_secrets, &parsed.credential)
            .is_some()
        {
            Ok(api)
        } else {
            warn!("API secret validation failed");
            Err(OAuthError::invalid_client("Invalid API credentials"))
        }
    }
}

impl std::fmt::Debug for ApiResourceAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiResourceAuthenticator")
            .finish_non_exhaustive()
    }
}
