//! 时钟模块
//!
//! 身份缓存的过期判断全部通过可注入的单调时钟完成，
//! 测试中使用手动推进的时钟，无需真实等待。

use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// 单调时间源
pub trait Clock: Send + Sync {
    /// 返回当前时刻
    fn now(&self) -> Instant;
}

/// 基于 `Instant::now` 的系统时钟
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// 手动推进的时钟
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    /// 以当前真实时刻为起点创建时钟
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    /// 将时钟向前推进
    pub fn advance(&self, duration: Duration) {
        *self.now.lock() += duration;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }
}
