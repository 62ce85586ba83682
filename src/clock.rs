//! 时钟抽象
//!
//! 所有过期判断都通过同一个可注入的 [`Clock`] 完成，测试中使用 [`FixedClock`]。

use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, RwLock};

/// 当前时间来源
pub trait Clock: Send + Sync {
    /// 返回当前 UTC 时间
    fn now(&self) -> DateTime<Utc>;
}

/// 系统时钟
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// 可手动拨动的时钟
///
/// 克隆体共享同一个时间点。
#[derive(Debug, Clone)]
pub struct FixedClock {
    now: Arc<RwLock<DateTime<Utc>>>,
}

impl FixedClock {
    /// 创建固定在指定时间的时钟
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(RwLock::new(now)),
        }
    }

    /// 创建固定在当前系统时间的时钟
    pub fn at_now() -> Self {
        Self::new(Utc::now())
    }

    /// 设置时间
    pub fn set(&self, now: DateTime<Utc>) {
        match self.now.write() {
            Ok(mut guard) => *guard = now,
            Err(poisoned) => *poisoned.into_inner() = now,
        }
    }

    /// 向前拨动时间
    pub fn advance(&self, by: Duration) {
        let now = self.now();
        self.set(now + by);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// 默认的共享系统时钟
pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock_advance() {
        let start = Utc::now();
        let clock = FixedClock::new(start);
        clock.advance(Duration::seconds(30));
        assert_eq!(clock.now(), start + Duration::seconds(30));
    }

    #[test]
    fn test_fixed_clock_clones_share_time() {
        let clock = FixedClock::at_now();
        let other = clock.clone();
        clock.advance(Duration::minutes(5));
        assert_eq!(clock.now(), other.now());
    }
}
