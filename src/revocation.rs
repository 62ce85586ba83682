//! Token 撤销 (RFC 7009)
//!
//! 撤销只作用于服务端保存的令牌：引用访问令牌与刷新令牌。撤销刷新令牌时，
//! 同一主体在同一客户端下的引用访问令牌一并删除。
//!
//! 不属于调用方的令牌与不存在的令牌都不会泄露任何信息：协议层面一律成功，
//! 区别只体现在返回的 [`RevocationOutcome`] 上，供审计使用。

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::config::InputLengthRestrictions;
use crate::context::CallContext;
use crate::grant::GrantKind;
use crate::protocol::OAuthError;
use crate::secret::AuthenticatedClient;
use crate::store::{GrantFilter, GrantRepository};

/// 令牌类型提示
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenTypeHint {
    /// 访问令牌
    AccessToken,
    /// 刷新令牌
    RefreshToken,
}

impl TokenTypeHint {
    /// 解析提示；未知值按无提示处理
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "access_token" => Some(TokenTypeHint::AccessToken),
            "refresh_token" => Some(TokenTypeHint::RefreshToken),
            _ => None,
        }
    }

    /// 按提示排列的查找顺序
    pub(crate) fn lookup_order(hint: Option<Self>) -> [GrantKind; 2] {
        match hint {
            Some(TokenTypeHint::RefreshToken) => [GrantKind::RefreshToken, GrantKind::ReferenceToken],
            Some(TokenTypeHint::AccessToken) | None => {
                [GrantKind::ReferenceToken, GrantKind::RefreshToken]
            }
        }
    }
}

/// 撤销请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationRequest {
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type_hint: Option<String>,
}

impl RevocationRequest {
    /// 创建请求
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            token_type_hint: None,
        }
    }

    /// 设置类型提示
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.token_type_hint = Some(hint.into());
        self
    }
}

/// 撤销结果；协议层面三者都是成功
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationOutcome {
    /// 已删除
    Revoked(GrantKind),
    /// 令牌属于其他客户端，未删除
    ClientMismatch(GrantKind),
    /// 没有找到可撤销的令牌
    NotFound,
}

impl RevocationOutcome {
    pub fn is_revoked(&self) -> bool {
        matches!(self, RevocationOutcome::Revoked(_))
    }
}

/// 撤销服务
#[derive(Debug, Clone)]
pub struct RevocationService {
    repository: GrantRepository,
    lengths: InputLengthRestrictions,
}

impl RevocationService {
    /// 创建服务
    pub fn new(repository: GrantRepository, lengths: InputLengthRestrictions) -> Self {
        Self {
            repository,
            lengths,
        }
    }

    /// 撤销令牌
    ///
    /// 只有缺少 `token` 参数（`invalid_request`）与基础设施故障（`server_error`）
    /// 会返回错误
    #[instrument(skip_all, fields(client_id = %client.client_id()))]
    pub async fn revoke(
        &self,
        ctx: &CallContext,
        request: &RevocationRequest,
        client: &AuthenticatedClient,
    ) -> Result<RevocationOutcome, OAuthError> {
        let token = request.token.trim();
        if token.is_empty() {
            return Err(OAuthError::invalid_request("token is missing"));
        }
        if token.len() > self.lengths.token_handle {
            debug!("token longer than any handle, nothing to revoke");
            return Ok(RevocationOutcome::NotFound);
        }

        let hint = request.token_type_hint.as_deref().and_then(TokenTypeHint::parse);
        for kind in TokenTypeHint::lookup_order(hint) {
            let Some(grant) = self.repository.get(ctx, kind, token).await? else {
                continue;
            };

            if grant.client_id != client.client_id() {
                warn!(kind = %kind, owner = %grant.client_id, "revocation by a client that does not own the token");
                return Ok(RevocationOutcome::ClientMismatch(kind));
            }

            self.repository.remove(ctx, kind, token).await?;
            if kind == GrantKind::RefreshToken {
                if let Some(subject_id) = &grant.subject_id {
                    let filter = GrantFilter::subject_client(subject_id, &grant.client_id)
                        .with_kind(GrantKind::ReferenceToken);
                    let removed = self.repository.remove_matching(ctx, &filter).await?;
                    debug!(removed, "removed reference tokens of the revoked refresh token");
                }
            }
            info!(kind = %kind, "token revoked");
            return Ok(RevocationOutcome::Revoked(kind));
        }

        debug!("no matching token to revoke");
        Ok(RevocationOutcome::NotFound)
    }
}
