//! 设备授权（RFC 8628）
//!
//! [`DeviceAuthorizationService`] 负责设备授权端点：签发 device code 与
//! user code，并在用户于浏览器中输入 user code 后记录批准或拒绝。
//! 轮询兑换在 [`crate::token_request`] 的 device_code 验证器中完成。

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::client::{Client, GrantType};
use crate::config::{DeviceFlowOptions, InputLengthRestrictions};
use crate::context::CallContext;
use crate::error::{Error, Result};
use crate::grant::{DeviceCodePayload, Grant, GrantKind, GrantPayload, hash_alias};
use crate::protocol::{OAuthError, parse_scopes};
use crate::random::{generate_user_code, normalize_user_code};
use crate::resources::ResourceValidator;
use crate::session::UserSession;
use crate::store::GrantRepository;

/// 生成 user code 时遇到冲突的最大重试次数
const USER_CODE_ATTEMPTS: usize = 5;

/// 批准或拒绝遇到并发修改时的最大重试次数
const DECISION_ATTEMPTS: usize = 3;

/// 设备授权端点的响应
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAuthorizationResponse {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: String,
    pub expires_in: i64,
    pub interval: u64,
}

/// 供 user code 输入页面展示的请求信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRequestInfo {
    pub client_id: String,
    pub requested_scopes: Vec<String>,
}

/// 用户对设备请求的处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceDecision {
    Approved,
    Denied,
    /// user code 不存在或已过期
    NotFound,
    /// 已经批准或拒绝过
    AlreadyDecided,
    /// 批准的 scope 不是请求 scope 的子集
    InvalidScope,
}

/// 设备授权服务
#[derive(Debug, Clone)]
pub struct DeviceAuthorizationService {
    repository: GrantRepository,
    resources: ResourceValidator,
    options: DeviceFlowOptions,
    lengths: InputLengthRestrictions,
}

impl DeviceAuthorizationService {
    /// 创建服务
    pub fn new(
        repository: GrantRepository,
        resources: ResourceValidator,
        options: DeviceFlowOptions,
        lengths: InputLengthRestrictions,
    ) -> Self {
        Self {
            repository,
            resources,
            options,
            lengths,
        }
    }

    /// 处理设备授权请求
    #[instrument(skip_all, fields(client_id = %client.client_id))]
    pub async fn authorize_device(
        &self,
        ctx: &CallContext,
        client: &Client,
        scope: Option<&str>,
    ) -> std::result::Result<DeviceAuthorizationResponse, OAuthError> {
        if !client.allows_grant_type(&GrantType::DeviceCode) {
            return Err(OAuthError::unauthorized_client(
                "Client is not allowed to use the device flow",
            ));
        }

        let requested = match scope {
            Some(scope) if scope.len() > self.lengths.scope => {
                return Err(OAuthError::invalid_request("Scope too long"));
            }
            Some(scope) if !scope.trim().is_empty() => parse_scopes(scope),
            _ => client.allowed_scopes.clone(),
        };

        let validation = self.resources.validate(ctx, client, &requested).await?;
        if !validation.succeeded() {
            return Err(OAuthError::invalid_scope(format!(
                "Invalid scopes: {}",
                validation.invalid_scopes.join(" ")
            )));
        }
        if validation.resources.is_empty() {
            return Err(OAuthError::invalid_scope("No valid scopes requested"));
        }

        let interval = client.polling_interval.unwrap_or(self.options.interval);
        let user_code = self.unused_user_code(ctx).await?;
        let now = self.repository.now();

        let mut grant = Grant::new(
            GrantPayload::DeviceCode(DeviceCodePayload {
                requested_scopes: validation.resources.scope_names(),
                authorized_scopes: Vec::new(),
                is_authorized: false,
                denied: false,
                is_openid: validation.resources.has_openid(),
                auth_time: None,
                last_polled_at: None,
                interval,
            }),
            client.client_id.clone(),
            now,
            Some(client.device_code_lifetime),
        );
        grant.alias = Some(hash_alias(
            &normalize_user_code(&user_code),
            GrantKind::DeviceCode,
        ));

        let device_code = self.repository.create(ctx, grant).await?;
        info!("device authorization issued");

        Ok(DeviceAuthorizationResponse {
            device_code,
            verification_uri_complete: format!(
                "{}?user_code={}",
                self.options.verification_uri, user_code
            ),
            verification_uri: self.options.verification_uri.clone(),
            user_code,
            expires_in: client.device_code_lifetime,
            interval,
        })
    }

    async fn unused_user_code(&self, ctx: &CallContext) -> Result<String> {
        for _ in 0..USER_CODE_ATTEMPTS {
            let code = generate_user_code(self.options.user_code_length)?;
            if self
                .repository
                .get_by_alias(ctx, GrantKind::DeviceCode, &normalize_user_code(&code))
                .await?
                .is_none()
            {
                return Ok(code);
            }
            debug!("user code collision, regenerating");
        }
        Err(Error::internal("could not allocate a unique user code"))
    }

    async fn find_grant(&self, ctx: &CallContext, user_code: &str) -> Result<Option<Grant>> {
        if user_code.is_empty() || user_code.len() > self.lengths.user_code {
            return Ok(None);
        }
        self.repository
            .get_by_alias(ctx, GrantKind::DeviceCode, &normalize_user_code(user_code))
            .await
    }

    /// 查询 user code 对应的请求
    pub async fn find_by_user_code(
        &self,
        ctx: &CallContext,
        user_code: &str,
    ) -> Result<Option<DeviceRequestInfo>> {
        let grant = self.find_grant(ctx, user_code).await?;
        Ok(grant.and_then(|g| {
            g.as_device_code().map(|device| DeviceRequestInfo {
                client_id: g.client_id.clone(),
                requested_scopes: device.requested_scopes.clone(),
            })
        }))
    }

    /// 用户批准设备请求
    ///
    /// `granted_scopes` 为 `None` 时批准全部请求的 scope
    #[instrument(skip_all, fields(subject = %session.subject_id))]
    pub async fn approve(
        &self,
        ctx: &CallContext,
        user_code: &str,
        session: &UserSession,
        granted_scopes: Option<Vec<String>>,
    ) -> Result<DeviceDecision> {
        let decision = self
            .decide(ctx, user_code, |grant| {
                let Some(device) = grant.as_device_code_mut() else {
                    return DeviceDecision::NotFound;
                };
                let granted = granted_scopes
                    .clone()
                    .unwrap_or_else(|| device.requested_scopes.clone());
                if granted.is_empty()
                    || !granted.iter().all(|s| device.requested_scopes.contains(s))
                {
                    warn!("device approval with scopes outside the request");
                    return DeviceDecision::InvalidScope;
                }

                device.is_authorized = true;
                device.authorized_scopes = granted;
                device.auth_time = Some(session.auth_time);
                grant.subject_id = Some(session.subject_id.clone());
                grant.session_id = Some(session.session_id.clone());
                DeviceDecision::Approved
            })
            .await?;

        if decision == DeviceDecision::Approved {
            info!("device request approved");
        }
        Ok(decision)
    }

    /// 用户拒绝设备请求
    pub async fn deny(&self, ctx: &CallContext, user_code: &str) -> Result<DeviceDecision> {
        let decision = self
            .decide(ctx, user_code, |grant| match grant.as_device_code_mut() {
                Some(device) => {
                    device.denied = true;
                    DeviceDecision::Denied
                }
                None => DeviceDecision::NotFound,
            })
            .await?;

        if decision == DeviceDecision::Denied {
            info!("device request denied");
        }
        Ok(decision)
    }

    /// 对尚未决定的设备请求应用决定
    ///
    /// 写入使用 compare-and-update；记录在读出后被轮询等操作修改时重新读取再判断。
    async fn decide<F>(&self, ctx: &CallContext, user_code: &str, mut apply: F) -> Result<DeviceDecision>
    where
        F: FnMut(&mut Grant) -> DeviceDecision,
    {
        for _ in 0..DECISION_ATTEMPTS {
            let Some(current) = self.find_grant(ctx, user_code).await? else {
                return Ok(DeviceDecision::NotFound);
            };
            match current.as_device_code() {
                None => return Ok(DeviceDecision::NotFound),
                Some(device) if device.is_authorized || device.denied => {
                    return Ok(DeviceDecision::AlreadyDecided);
                }
                Some(_) => {}
            }

            let mut grant = current.clone();
            let decision = apply(&mut grant);
            if !matches!(decision, DeviceDecision::Approved | DeviceDecision::Denied) {
                return Ok(decision);
            }
            if self
                .repository
                .compare_and_update(ctx, &current, grant)
                .await?
            {
                return Ok(decision);
            }
            debug!("device request changed while deciding, retrying");
        }
        Err(Error::internal("device request kept changing while deciding"))
    }
}
