//! 审计日志模块
//!
//! 引擎内部的验证器只返回结果值；[`crate::engine::GrantEngine`] 在边界上把这些
//! 结果翻译成 [`GrantEvent`] 交给 [`AuditLogger`]。
//!
//! ## 使用示例
//!
//! ```rust
//! use grantrs::audit::{AuditLogger, EventType, GrantEvent, InMemoryAuditLogger};
//!
//! let logger = InMemoryAuditLogger::new();
//! logger.log(GrantEvent::token_issued("web", Some("alice"), "authorization_code"));
//! logger.log(GrantEvent::token_request_failed("web", "authorization_code", "invalid_grant"));
//!
//! assert_eq!(logger.event_count(), 2);
//! assert_eq!(logger.get_events_by_type(&EventType::TokenIssued).len(), 1);
//! assert_eq!(logger.get_failure_events().len(), 1);
//! ```

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 事件严重程度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum EventSeverity {
    /// 一般信息
    #[default]
    Info,
    /// 警告（请求被拒绝）
    Warning,
    /// 错误（基础设施故障）
    Error,
}

impl std::fmt::Display for EventSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventSeverity::Info => write!(f, "INFO"),
            EventSeverity::Warning => write!(f, "WARNING"),
            EventSeverity::Error => write!(f, "ERROR"),
        }
    }
}

/// grant 事件类型
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// 授权端点签发了授权码或令牌
    AuthorizeSucceeded,
    /// 授权请求被拒绝
    AuthorizeFailed,
    /// token 端点签发令牌
    TokenIssued,
    /// token 请求被拒绝
    TokenRequestFailed,
    /// 令牌被撤销
    TokenRevoked,
    /// 撤销请求来自不持有令牌的客户端
    TokenRevocationFailed,
    /// 内省成功（无论令牌是否活跃）
    TokenIntrospected,
    /// 内省调用方认证失败
    TokenIntrospectionFailed,
    /// 撤销某主体在某客户端下的全部 grant
    GrantsRevoked,
    /// 设备授权请求
    DeviceAuthorized,
    /// 自定义事件
    Custom(String),
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::AuthorizeSucceeded => write!(f, "authorize_succeeded"),
            EventType::AuthorizeFailed => write!(f, "authorize_failed"),
            EventType::TokenIssued => write!(f, "token_issued"),
            EventType::TokenRequestFailed => write!(f, "token_request_failed"),
            EventType::TokenRevoked => write!(f, "token_revoked"),
            EventType::TokenRevocationFailed => write!(f, "token_revocation_failed"),
            EventType::TokenIntrospected => write!(f, "token_introspected"),
            EventType::TokenIntrospectionFailed => write!(f, "token_introspection_failed"),
            EventType::GrantsRevoked => write!(f, "grants_revoked"),
            EventType::DeviceAuthorized => write!(f, "device_authorized"),
            EventType::Custom(name) => write!(f, "custom:{}", name),
        }
    }
}

/// 审计事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantEvent {
    /// 事件 ID
    pub id: String,
    pub event_type: EventType,
    pub severity: EventSeverity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
    /// 协议错误代码
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub details: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl GrantEvent {
    /// 创建事件
    pub fn new(event_type: EventType, severity: EventSeverity) -> Self {
        Self {
            id: generate_event_id(),
            event_type,
            severity,
            client_id: None,
            subject_id: None,
            error: None,
            message: None,
            details: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// 创建自定义事件
    pub fn custom(name: impl Into<String>, severity: EventSeverity) -> Self {
        Self::new(EventType::Custom(name.into()), severity)
    }

    pub fn authorize_succeeded(
        client_id: impl Into<String>,
        subject_id: impl Into<String>,
        response_type: impl Into<String>,
    ) -> Self {
        Self::new(EventType::AuthorizeSucceeded, EventSeverity::Info)
            .with_client_id(client_id)
            .with_subject_id(subject_id)
            .with_detail("response_type", response_type)
    }

    pub fn authorize_failed(client_id: Option<String>, error: impl Into<String>) -> Self {
        let mut event = Self::new(EventType::AuthorizeFailed, EventSeverity::Warning)
            .with_error(error);
        event.client_id = client_id;
        event
    }

    pub fn token_issued(
        client_id: impl Into<String>,
        subject_id: Option<&str>,
        grant_type: impl Into<String>,
    ) -> Self {
        let mut event = Self::new(EventType::TokenIssued, EventSeverity::Info)
            .with_client_id(client_id)
            .with_detail("grant_type", grant_type);
        event.subject_id = subject_id.map(str::to_string);
        event
    }

    pub fn token_request_failed(
        client_id: impl Into<String>,
        grant_type: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self::new(EventType::TokenRequestFailed, EventSeverity::Warning)
            .with_client_id(client_id)
            .with_detail("grant_type", grant_type)
            .with_error(error)
    }

    pub fn token_revoked(client_id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self::new(EventType::TokenRevoked, EventSeverity::Info)
            .with_client_id(client_id)
            .with_detail("kind", kind)
    }

    /// 撤销请求来自非持有者
    pub fn token_revocation_failed(client_id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self::new(EventType::TokenRevocationFailed, EventSeverity::Warning)
            .with_client_id(client_id)
            .with_detail("kind", kind)
            .with_message("token belongs to a different client")
    }

    pub fn token_introspected(api: impl Into<String>, active: bool) -> Self {
        Self::new(EventType::TokenIntrospected, EventSeverity::Info)
            .with_detail("api", api)
            .with_detail("active", active.to_string())
    }

    pub fn token_introspection_failed(api: impl Into<String>, error: impl Into<String>) -> Self {
        Self::new(EventType::TokenIntrospectionFailed, EventSeverity::Warning)
            .with_detail("api", api)
            .with_error(error)
    }

    pub fn grants_revoked(
        client_id: impl Into<String>,
        subject_id: impl Into<String>,
        removed: usize,
    ) -> Self {
        Self::new(EventType::GrantsRevoked, EventSeverity::Info)
            .with_client_id(client_id)
            .with_subject_id(subject_id)
            .with_detail("removed", removed.to_string())
    }

    pub fn device_authorized(client_id: impl Into<String>) -> Self {
        Self::new(EventType::DeviceAuthorized, EventSeverity::Info).with_client_id(client_id)
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_subject_id(mut self, subject_id: impl Into<String>) -> Self {
        self.subject_id = Some(subject_id.into());
        self
    }

    /// 设置协议错误代码；`server_error` 提升为 Error 级别
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        let error = error.into();
        if error == "server_error" {
            self.severity = EventSeverity::Error;
        }
        self.error = Some(error);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// 使用注入时钟的时间
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// 事件类型名称
    pub fn event_name(&self) -> String {
        self.event_type.to_string()
    }

    /// 是否为失败事件
    pub fn is_failure(&self) -> bool {
        matches!(
            self.event_type,
            EventType::AuthorizeFailed
                | EventType::TokenRequestFailed
                | EventType::TokenRevocationFailed
                | EventType::TokenIntrospectionFailed
        )
    }
}

fn generate_event_id() -> String {
    use crate::random::{generate_random_bytes, hex_encode};
    format!(
        "evt_{}",
        generate_random_bytes(8)
            .map(|bytes| hex_encode(&bytes))
            .unwrap_or_else(|_| "unknown".to_string())
    )
}

// ============================================================================
// AuditLogger Trait
// ============================================================================

/// 审计日志记录器
pub trait AuditLogger: Send + Sync {
    /// 记录事件
    fn log(&self, event: GrantEvent);
}

// ============================================================================
// InMemoryAuditLogger
// ============================================================================

/// 内存审计日志记录器，用于测试和开发
#[derive(Debug, Default, Clone)]
pub struct InMemoryAuditLogger {
    events: Arc<RwLock<Vec<GrantEvent>>>,
    max_events: Option<usize>,
}

impl InMemoryAuditLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// 最多保留 `max` 个事件，超出时丢弃最旧的
    pub fn with_max_events(max: usize) -> Self {
        Self {
            events: Arc::default(),
            max_events: Some(max),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<GrantEvent>> {
        self.events.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get_events(&self) -> Vec<GrantEvent> {
        self.read().clone()
    }

    pub fn event_count(&self) -> usize {
        self.read().len()
    }

    pub fn get_events_by_client(&self, client_id: &str) -> Vec<GrantEvent> {
        self.read()
            .iter()
            .filter(|e| e.client_id.as_deref() == Some(client_id))
            .cloned()
            .collect()
    }

    pub fn get_events_by_type(&self, event_type: &EventType) -> Vec<GrantEvent> {
        self.read()
            .iter()
            .filter(|e| &e.event_type == event_type)
            .cloned()
            .collect()
    }

    pub fn get_failure_events(&self) -> Vec<GrantEvent> {
        self.read()
            .iter()
            .filter(|e| e.is_failure())
            .cloned()
            .collect()
    }

    /// 按类型统计
    pub fn get_stats(&self) -> HashMap<String, usize> {
        let mut stats = HashMap::new();
        for event in self.read().iter() {
            *stats.entry(event.event_name()).or_insert(0) += 1;
        }
        stats
    }

    pub fn clear(&self) {
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl AuditLogger for InMemoryAuditLogger {
    fn log(&self, event: GrantEvent) {
        let mut events = self.events.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(max) = self.max_events {
            while !events.is_empty() && events.len() >= max {
                events.remove(0);
            }
        }
        events.push(event);
    }
}

// ============================================================================
// TracingAuditLogger / NoOpAuditLogger
// ============================================================================

/// 把事件写入 `tracing`（target 为 `grantrs::audit`）
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditLogger;

impl AuditLogger for TracingAuditLogger {
    fn log(&self, event: GrantEvent) {
        let name = event.event_name();
        let client_id = event.client_id.as_deref().unwrap_or("-");
        let error = event.error.as_deref().unwrap_or("-");
        match event.severity {
            EventSeverity::Info => {
                tracing::info!(target: "grantrs::audit", event = %name, client_id, "grant event")
            }
            EventSeverity::Warning => {
                tracing::warn!(target: "grantrs::audit", event = %name, client_id, error, "grant event")
            }
            EventSeverity::Error => {
                tracing::error!(target: "grantrs::audit", event = %name, client_id, error, "grant event")
            }
        }
    }
}

/// 空操作日志记录器
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpAuditLogger;

impl AuditLogger for NoOpAuditLogger {
    fn log(&self, _event: GrantEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_creation() {
        let event = GrantEvent::token_issued("web", Some("alice"), "authorization_code");
        assert_eq!(event.event_type, EventType::TokenIssued);
        assert_eq!(event.severity, EventSeverity::Info);
        assert_eq!(event.subject_id.as_deref(), Some("alice"));
        assert_eq!(
            event.details.get("grant_type").map(String::as_str),
            Some("authorization_code")
        );
        assert!(event.id.starts_with("evt_"));
        assert!(!event.is_failure());
    }

    #[test]
    fn test_server_error_raises_severity() {
        let event = GrantEvent::token_request_failed("web", "password", "invalid_grant");
        assert_eq!(event.severity, EventSeverity::Warning);

        let event = GrantEvent::token_request_failed("web", "password", "server_error");
        assert_eq!(event.severity, EventSeverity::Error);
        assert!(event.is_failure());
    }

    #[test]
    fn test_in_memory_logger_filters() {
        let logger = InMemoryAuditLogger::new();
        logger.log(GrantEvent::token_issued("web", None, "client_credentials"));
        logger.log(GrantEvent::token_revocation_failed("mallory", "refresh_token"));
        logger.log(GrantEvent::token_revoked("web", "reference_token"));

        assert_eq!(logger.event_count(), 3);
        assert_eq!(logger.get_events_by_client("web").len(), 2);
        assert_eq!(logger.get_failure_events().len(), 1);
        assert_eq!(logger.get_stats().get("token_revoked"), Some(&1));

        logger.clear();
        assert_eq!(logger.event_count(), 0);
    }

    #[test]
    fn test_max_events() {
        let logger = InMemoryAuditLogger::with_max_events(2);
        for client in ["a", "b", "c"] {
            logger.log(GrantEvent::device_authorized(client));
        }
        let events = logger.get_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].client_id.as_deref(), Some("b"));
    }

    #[test]
    fn test_clones_share_events() {
        let logger = InMemoryAuditLogger::new();
        let clone = logger.clone();
        clone.log(GrantEvent::custom("sweep", EventSeverity::Info));
        assert_eq!(logger.event_count(), 1);
    }

    #[test]
    fn test_serialization() {
        let event = GrantEvent::grants_revoked("web", "alice", 3);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "grants_revoked");
        assert_eq!(json["details"]["removed"], "3");
        assert!(json.get("error").is_none());
    }
}
