//! 调用上下文
//!
//! 每一次对存储或外部协作者的调用都携带调用方的取消信号与截止时间。
//! 引擎自身不重试；被取消或超时的调用以 [`Error::Cancelled`] /
//! [`Error::DeadlineExceeded`] 快速失败，在协议边界映射为 `server_error`。

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// 单个请求的调用上下文
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    cancellation: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    /// 创建没有截止时间的上下文
    pub fn new() -> Self {
        Self::default()
    }

    /// 使用调用方提供的取消令牌
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// 设置绝对截止时间
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// 设置相对超时
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// 取消令牌
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// 截止时间
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// 调用方是否已经取消
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// 在取消信号与截止时间的约束下执行一个异步调用
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.cancellation.is_cancelled() {
            return Err(Error::Cancelled);
        }

        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.cancellation.cancelled() => Err(Error::Cancelled),
                    res = tokio::time::timeout_at(deadline, fut) => {
                        res.map_err(|_| Error::DeadlineExceeded)?
                    }
                }
            }
            None => {
                tokio::select! {
                    _ = self.cancellation.cancelled() => Err(Error::Cancelled),
                    res = fut => res,
                }
            }
        }
    }
}
