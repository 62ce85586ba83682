//! PKCE (Proof Key for Code Exchange) 校验
//!
//! 授权端点保存客户端提交的 `code_challenge` 与方法；token 端点用客户端出示的
//! `code_verifier` 重新计算 challenge 并与存储值做常量时间比较。存储的
//! challenge 永远不会被 token 请求中的值替换。
//!
//! ## 示例
//!
//! ```rust
//! use grantrs::pkce::{PkceChallenge, PkceMethod, verify_code_verifier};
//!
//! // 客户端生成 verifier 与 challenge
//! let pkce = PkceChallenge::new(PkceMethod::S256).unwrap();
//!
//! // 服务端在兑换授权码时验证
//! let result = verify_code_verifier(
//!     PkceMethod::S256,
//!     pkce.verifier(),
//!     pkce.challenge(),
//!     false,
//! );
//! assert!(result.is_ok());
//! ```

use std::str::FromStr;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ConfigError, Error, Result};
use crate::random::{constant_time_compare_str, generate_random_bytes};

/// code_challenge / code_verifier 最小长度
pub const CODE_CHALLENGE_MIN_LENGTH: usize = 43;
/// code_challenge / code_verifier 最大长度
pub const CODE_CHALLENGE_MAX_LENGTH: usize = 128;

/// PKCE challenge 方法
///
/// - `Plain`: code_challenge = code_verifier
/// - `S256`: code_challenge = BASE64URL(SHA256(code_verifier))
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PkceMethod {
    /// Plain 方法：challenge = verifier
    ///
    /// 授权请求未携带 `code_challenge_method` 时的默认值
    #[default]
    #[serde(rename = "plain")]
    Plain,

    /// S256 方法：challenge = BASE64URL(SHA256(verifier))
    S256,
}

impl PkceMethod {
    /// 转换为 OAuth 2.0 参数字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            PkceMethod::Plain => "plain",
            PkceMethod::S256 => "S256",
        }
    }
}

impl FromStr for PkceMethod {
    type Err = Error;

    /// 解析协议参数；RFC 7636 中方法名区分大小写
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "plain" => Ok(PkceMethod::Plain),
            "S256" => Ok(PkceMethod::S256),
            _ => Err(Error::Config(ConfigError::InvalidValue {
                key: "code_challenge_method".to_string(),
                message: format!("unsupported PKCE method: {}", s),
            })),
        }
    }
}

impl std::fmt::Display for PkceMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// PKCE 校验失败的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PkceError {
    /// verifier 长度不在 43..=128 或含有非法字符
    MalformedVerifier,
    /// 客户端不允许使用 plain 方法
    PlainNotAllowed,
    /// 重新计算的 challenge 与存储值不一致
    Mismatch,
}

impl std::fmt::Display for PkceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PkceError::MalformedVerifier => write!(f, "malformed code_verifier"),
            PkceError::PlainNotAllowed => write!(f, "plain PKCE method is not allowed"),
            PkceError::Mismatch => write!(f, "code_verifier does not match code_challenge"),
        }
    }
}

impl std::error::Error for PkceError {}

/// 检查 verifier 是否符合 RFC 7636 的格式
///
/// 43-128 个字符，只允许 `[A-Z] / [a-z] / [0-9] / "-" / "." / "_" / "~"`
pub fn is_valid_verifier(verifier: &str) -> bool {
    (CODE_CHALLENGE_MIN_LENGTH..=CODE_CHALLENGE_MAX_LENGTH).contains(&verifier.len())
        && verifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~'))
}

/// 计算 code_challenge
pub fn compute_challenge(verifier: &str, method: PkceMethod) -> String {
    match method {
        PkceMethod::Plain => verifier.to_string(),
        PkceMethod::S256 => {
            let hash = Sha256::digest(verifier.as_bytes());
            URL_SAFE_NO_PAD.encode(hash)
        }
    }
}

/// 服务端校验 code_verifier
///
/// `allow_plain` 为 `false` 时，即使比较本会成功，plain 方法也会被拒绝。
pub fn verify_code_verifier(
    method: PkceMethod,
    verifier: &str,
    challenge: &str,
    allow_plain: bool,
) -> std::result::Result<(), PkceError> {
    if method == PkceMethod::Plain && !allow_plain {
        return Err(PkceError::PlainNotAllowed);
    }

    if !is_valid_verifier(verifier) {
        return Err(PkceError::MalformedVerifier);
    }

    let computed = compute_challenge(verifier, method);

    // 使用常量时间比较防止时序攻击
    if constant_time_compare_str(&computed, challenge) {
        Ok(())
    } else {
        Err(PkceError::Mismatch)
    }
}

/// 与授权码一同保存的 challenge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PkceCodeChallenge {
    /// code_challenge 值
    pub challenge: String,

    /// challenge 方法
    pub method: PkceMethod,
}

impl PkceCodeChallenge {
    /// 创建新的 code challenge
    pub fn new(challenge: impl Into<String>, method: PkceMethod) -> Self {
        Self {
            challenge: challenge.into(),
            method,
        }
    }

    /// 验证 verifier
    pub fn verify(&self, verifier: &str, allow_plain: bool) -> std::result::Result<(), PkceError> {
        verify_code_verifier(self.method, verifier, &self.challenge, allow_plain)
    }
}

/// 客户端侧的 verifier / challenge 对
///
/// 服务端不需要它，主要供测试与演示客户端使用
#[derive(Debug, Clone)]
pub struct PkceChallenge {
    verifier: String,
    challenge: String,
    method: PkceMethod,
}

impl PkceChallenge {
    /// 生成新的随机 verifier（32 字节熵，43 个字符）
    pub fn new(method: PkceMethod) -> Result<Self> {
        let verifier = URL_SAFE_NO_PAD.encode(generate_random_bytes(32)?);
        Self::from_verifier(verifier, method)
    }

    /// 从已有的 verifier 创建 challenge
    pub fn from_verifier(verifier: impl Into<String>, method: PkceMethod) -> Result<Self> {
        let verifier = verifier.into();
        if !is_valid_verifier(&verifier) {
            return Err(Error::Config(ConfigError::InvalidValue {
                key: "code_verifier".to_string(),
                message: "verifier must be 43-128 unreserved characters".to_string(),
            }));
        }

        let challenge = compute_challenge(&verifier, method);
        Ok(Self {
            verifier,
            challenge,
            method,
        })
    }

    /// 获取 code_verifier
    pub fn verifier(&self) -> &str {
        &self.verifier
    }

    /// 获取 code_challenge
    pub fn challenge(&self) -> &str {
        &self.challenge
    }

    /// 获取 challenge 方法
    pub fn method(&self) -> PkceMethod {
        self.method
    }

    /// 转换为服务端存储的 challenge
    pub fn to_code_challenge(&self) -> PkceCodeChallenge {
        PkceCodeChallenge::new(self.challenge.clone(), self.method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn min_verifier() -> String {
        "a".repeat(CODE_CHALLENGE_MIN_LENGTH)
    }

    #[test]
    fn test_s256_round_trip() {
        let pkce = PkceChallenge::new(PkceMethod::S256).unwrap();
        assert_eq!(pkce.challenge().len(), 43);
        assert!(
            verify_code_verifier(PkceMethod::S256, pkce.verifier(), pkce.challenge(), false)
                .is_ok()
        );
    }

    #[test]
    fn test_plain_round_trip() {
        let v = min_verifier();
        assert!(verify_code_verifier(PkceMethod::Plain, &v, &v, true).is_ok());
    }

    #[test]
    fn test_plain_rejected_when_not_allowed() {
        let v = min_verifier();
        assert_eq!(
            verify_code_verifier(PkceMethod::Plain, &v, &v, false),
            Err(PkceError::PlainNotAllowed)
        );
    }

    #[test]
    fn test_wrong_verifier() {
        let pkce = PkceChallenge::from_verifier(min_verifier(), PkceMethod::S256).unwrap();
        let wrong = format!("{}invalid", pkce.verifier());
        assert_eq!(
            verify_code_verifier(PkceMethod::S256, &wrong, pkce.challenge(), false),
            Err(PkceError::Mismatch)
        );
    }

    #[test]
    fn test_known_s256_vector() {
        // RFC 7636 Appendix B
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(
            compute_challenge(verifier, PkceMethod::S256),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn test_malformed_verifier() {
        assert_eq!(
            verify_code_verifier(PkceMethod::S256, "short", "x", false),
            Err(PkceError::MalformedVerifier)
        );
        let invalid = "a".repeat(43) + "!@#";
        assert!(!is_valid_verifier(&invalid));
        assert!(!is_valid_verifier(&"a".repeat(129)));
        assert!(is_valid_verifier(&"a".repeat(128)));
    }

    #[test]
    fn test_method_from_str() {
        assert_eq!("S256".parse::<PkceMethod>().unwrap(), PkceMethod::S256);
        assert_eq!("plain".parse::<PkceMethod>().unwrap(), PkceMethod::Plain);
        assert!("s256".parse::<PkceMethod>().is_err());
        assert!("invalid".parse::<PkceMethod>().is_err());
        assert_eq!(PkceMethod::default(), PkceMethod::Plain);
    }

    #[test]
    fn test_code_challenge_verify() {
        let pkce = PkceChallenge::new(PkceMethod::S256).unwrap();
        let stored = pkce.to_code_challenge();
        assert!(stored.verify(pkce.verifier(), false).is_ok());
        assert!(stored.verify(&min_verifier(), false).is_err());
    }

    #[test]
    fn test_method_serde() {
        assert_eq!(
            serde_json::to_string(&PkceMethod::Plain).unwrap(),
            "\"plain\""
        );
        assert_eq!(serde_json::to_string(&PkceMethod::S256).unwrap(), "\"S256\"");
    }
}
