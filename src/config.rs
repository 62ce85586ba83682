//! 引擎配置
//!
//! [`EngineOptions`] 显式传入每个验证器的构造函数，不存在全局配置。
//! 所有字段都有默认值，宿主程序可以从任意 serde 格式加载：
//!
//! ```rust
//! use grantrs::config::EngineOptions;
//!
//! let options: EngineOptions = serde_json::from_str(r#"{
//!     "issuer": "https://auth.example.com",
//!     "device_flow": { "interval": 10 }
//! }"#).unwrap();
//!
//! assert_eq!(options.device_flow.interval, 10);
//! assert_eq!(options.input_lengths.authorization_code, 100);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::pkce::{CODE_CHALLENGE_MAX_LENGTH, CODE_CHALLENGE_MIN_LENGTH};

/// 引擎选项
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// 签发者标识（写入 token 与内省响应的 `iss`）
    pub issuer: String,

    /// 不透明输入的长度上限，在访问存储之前检查
    pub input_lengths: InputLengthRestrictions,

    /// PKCE 相关设置
    pub pkce: PkceOptions,

    /// 设备授权流设置
    pub device_flow: DeviceFlowOptions,

    /// 客户端未配置 `consent_lifetime` 时，记住的 consent 的有效期（秒）
    ///
    /// 为 `None` 表示不过期
    pub default_consent_lifetime: Option<i64>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            issuer: "https://localhost".to_string(),
            input_lengths: InputLengthRestrictions::default(),
            pkce: PkceOptions::default(),
            device_flow: DeviceFlowOptions::default(),
            default_consent_lifetime: None,
        }
    }
}

impl EngineOptions {
    /// 创建默认配置
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置签发者
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = issuer.into();
        self
    }

    /// 设置设备流选项
    pub fn with_device_flow(mut self, device_flow: DeviceFlowOptions) -> Self {
        self.device_flow = device_flow;
        self
    }

    /// 严格配置：更短的输入限制，禁止 plain PKCE
    pub fn strict() -> Self {
        Self {
            input_lengths: InputLengthRestrictions::strict(),
            pkce: PkceOptions {
                allow_plain_globally: false,
            },
            ..Self::default()
        }
    }

    /// 验证配置是否有效
    pub fn validate(&self) -> Result<()> {
        if self.issuer.trim().is_empty() {
            return Err(Error::invalid_config("issuer", "issuer cannot be empty"));
        }
        self.input_lengths.validate()?;
        self.device_flow.validate()?;
        Ok(())
    }
}

/// 输入长度限制
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InputLengthRestrictions {
    pub client_id: usize,
    pub client_secret: usize,
    pub grant_type: usize,
    pub scope: usize,
    pub redirect_uri: usize,
    pub state: usize,
    pub nonce: usize,
    pub login_hint: usize,
    pub acr_values: usize,
    pub ui_locales: usize,
    pub authorization_code: usize,
    pub refresh_token: usize,
    pub device_code: usize,
    pub user_code: usize,
    pub token_handle: usize,
    /// 自包含 JWT 的长度上限
    pub jwt: usize,
    pub username: usize,
    pub password: usize,
    pub code_challenge_min: usize,
    pub code_challenge_max: usize,
    pub code_verifier_min: usize,
    pub code_verifier_max: usize,
}

impl Default for InputLengthRestrictions {
    fn default() -> Self {
        Self {
            client_id: 100,
            client_secret: 100,
            grant_type: 100,
            scope: 300,
            redirect_uri: 400,
            state: 2000,
            nonce: 300,
            login_hint: 100,
            acr_values: 300,
            ui_locales: 100,
            authorization_code: 100,
            refresh_token: 100,
            device_code: 100,
            user_code: 100,
            token_handle: 100,
            jwt: 51200,
            username: 100,
            password: 100,
            code_challenge_min: CODE_CHALLENGE_MIN_LENGTH,
            code_challenge_max: CODE_CHALLENGE_MAX_LENGTH,
            code_verifier_min: CODE_CHALLENGE_MIN_LENGTH,
            code_verifier_max: CODE_CHALLENGE_MAX_LENGTH,
        }
    }
}

impl InputLengthRestrictions {
    /// 更严格的限制
    pub fn strict() -> Self {
        Self {
            scope: 200,
            redirect_uri: 200,
            state: 500,
            nonce: 100,
            jwt: 8192,
            ..Self::default()
        }
    }

    /// 验证配置是否有效
    pub fn validate(&self) -> Result<()> {
        if self.code_verifier_min < CODE_CHALLENGE_MIN_LENGTH
            || self.code_verifier_max > CODE_CHALLENGE_MAX_LENGTH
            || self.code_verifier_min > self.code_verifier_max
        {
            return Err(Error::invalid_config(
                "input_lengths.code_verifier",
                "code_verifier bounds must lie within 43..=128",
            ));
        }
        if self.code_challenge_min > self.code_challenge_max {
            return Err(Error::invalid_config(
                "input_lengths.code_challenge",
                "minimum exceeds maximum",
            ));
        }
        Ok(())
    }
}

/// PKCE 选项
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PkceOptions {
    /// 为 `false` 时即使客户端允许 plain 也拒绝 plain 方法
    pub allow_plain_globally: bool,
}

impl Default for PkceOptions {
    fn default() -> Self {
        Self {
            allow_plain_globally: true,
        }
    }
}

/// 设备授权流选项
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceFlowOptions {
    /// 默认轮询间隔（秒），客户端未配置时使用
    pub interval: u64,
    /// user code 字符数（不含分隔符）
    pub user_code_length: usize,
    /// 用户输入 user code 的页面
    pub verification_uri: String,
}

impl Default for DeviceFlowOptions {
    fn default() -> Self {
        Self {
            interval: 5,
            user_code_length: 8,
            verification_uri: "https://localhost/device".to_string(),
        }
    }
}

impl DeviceFlowOptions {
    /// 验证配置是否有效
    pub fn validate(&self) -> Result<()> {
        if self.interval == 0 {
            return Err(Error::invalid_config(
                "device_flow.interval",
                "polling interval must be positive",
            ));
        }
        if self.user_code_length < 6 {
            return Err(Error::invalid_config(
                "device_flow.user_code_length",
                "user code must have at least 6 characters",
            ));
        }
        url::Url::parse(&self.verification_uri).map_err(|e| {
            Error::invalid_config("device_flow.verification_uri", e.to_string())
        })?;
        Ok(())
    }
}
