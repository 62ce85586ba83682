//! `urn:ietf:params:oauth:grant-type:device_code` 授权（RFC 8628 轮询）

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use super::{
    GrantContext, TokenRequestParameters, TokenRequestValidator, ValidatedTokenRequest, bounded,
};
use crate::client::{Client, GrantType};
use crate::context::CallContext;
use crate::grant::GrantKind;
use crate::protocol::{OAuthError, OAuthErrorCode};
use crate::store::ConsumeOutcome;

/// 设备轮询限流策略
///
/// 无状态：上一次轮询时间保存在设备码 grant 上，由调用方传入
pub trait DeviceFlowThrottler: Send + Sync {
    /// 本次轮询是否过快
    fn should_slow_down(
        &self,
        last_polled_at: Option<DateTime<Utc>>,
        interval: u64,
        now: DateTime<Utc>,
    ) -> bool;
}

/// 按 grant 上记录的最小间隔限流
#[derive(Debug, Clone, Copy, Default)]
pub struct IntervalThrottler;

impl DeviceFlowThrottler for IntervalThrottler {
    fn should_slow_down(
        &self,
        last_polled_at: Option<DateTime<Utc>>,
        interval: u64,
        now: DateTime<Utc>,
    ) -> bool {
        let interval = Duration::seconds(i64::try_from(interval).unwrap_or(i64::MAX / 1000));
        last_polled_at.is_some_and(|last| now < last + interval)
    }
}

impl TokenRequestValidator {
    pub(super) async fn validate_device_code(
        &self,
        ctx: &CallContext,
        params: &TokenRequestParameters,
        client: &Client,
    ) -> Result<ValidatedTokenRequest, OAuthError> {
        let device_code = bounded(params, "device_code", self.lengths.device_code)?;
        if !client.allows_grant_type(&GrantType::DeviceCode) {
            return Err(OAuthError::unauthorized_client(
                "Client is not allowed to use the device flow",
            ));
        }

        let Some(mut grant) = self
            .repository
            .get_including_expired(ctx, GrantKind::DeviceCode, device_code)
            .await?
        else {
            warn!("device code not found");
            return Err(OAuthError::invalid_grant("Invalid device code"));
        };

        let now = self.repository.now();
        if grant.is_expired(now) {
            return Err(OAuthError::new(OAuthErrorCode::ExpiredToken)
                .with_description("The device code has expired"));
        }
        if grant.client_id != client.client_id {
            warn!(owner = %grant.client_id, "device code was issued to a different client");
            return Err(OAuthError::invalid_grant("Invalid device code"));
        }
        if grant.is_consumed() {
            return Err(OAuthError::invalid_grant("Invalid device code"));
        }

        let observed = grant.clone();
        let Some(device) = grant.as_device_code_mut() else {
            return Err(OAuthError::invalid_grant("Invalid device code"));
        };
        let slow_down = self
            .throttler
            .should_slow_down(device.last_polled_at, device.interval, now);
        device.last_polled_at = Some(now);
        let device = device.clone();

        if device.denied {
            return Err(OAuthError::access_denied("The user denied the request"));
        }
        // 只在记录未被修改时写回轮询时间，不覆盖同时发生的批准或拒绝
        if slow_down {
            debug!("device polling too fast");
            self.repository
                .compare_and_update(ctx, &observed, grant)
                .await?;
            return Err(OAuthError::new(OAuthErrorCode::SlowDown));
        }
        if !device.is_authorized {
            self.repository
                .compare_and_update(ctx, &observed, grant)
                .await?;
            return Err(OAuthError::new(OAuthErrorCode::AuthorizationPending));
        }

        match self
            .repository
            .consume_once(ctx, GrantKind::DeviceCode, device_code)
            .await?
        {
            ConsumeOutcome::Consumed(_) => {}
            ConsumeOutcome::AlreadyConsumed | ConsumeOutcome::NotFound => {
                warn!("device code redeemed concurrently");
                return Err(OAuthError::invalid_grant("Invalid device code"));
            }
        }
        self.repository
            .remove(ctx, GrantKind::DeviceCode, device_code)
            .await?;

        let Some(subject_id) = grant.subject_id.clone() else {
            return Err(OAuthError::invalid_grant("Invalid device code"));
        };
        self.ensure_active(ctx, &subject_id, client).await?;

        let resources = self
            .resolve_scopes(ctx, client, &device.authorized_scopes)
            .await?;

        Ok(ValidatedTokenRequest {
            client: client.clone(),
            grant_type: GrantType::DeviceCode,
            subject_id: Some(subject_id),
            session_id: grant.session_id.clone(),
            resources,
            confirmation: None,
            auth_time: device.auth_time,
            context: GrantContext::DeviceCode(device),
        })
    }
}
