// 进度事件节流器
//
// 控制进度事件的发布频率，避免分片密集完成时的事件风暴
// 基于单调时钟 + CAS，无锁

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 默认节流间隔（毫秒）
pub const DEFAULT_THROTTLE_MS: u64 = 200;

/// 事件节流器
///
/// 典型用法：每次进度变化时调用 `should_emit()`，返回 true 才发布事件；
/// 任务完成时调用 `force_emit()` 保证最终进度一定送达
#[derive(Debug)]
pub struct Throttler {
    /// 上次发布时间（相对基准时刻的毫秒数）
    last_emit_ms: AtomicU64,
    interval_ms: u64,
    epoch: Instant,
}

impl Throttler {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_emit_ms: AtomicU64::new(0),
            interval_ms: interval.as_millis() as u64,
            epoch: Instant::now(),
        }
    }

    pub fn with_millis(interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms))
    }

    /// 是否应当发布事件
    ///
    /// 距上次发布超过节流间隔时返回 true 并记录时间戳；
    /// CAS 失败说明被并发调用者抢先，本次不发布
    pub fn should_emit(&self) -> bool {
        // +1 保证首次调用时与初值 0 有区分
        let now_ms = self.epoch.elapsed().as_millis() as u64 + self.interval_ms + 1;
        let last = self.last_emit_ms.load(Ordering::Relaxed);

        if now_ms.saturating_sub(last) >= self.interval_ms {
            self.last_emit_ms
                .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        } else {
            false
        }
    }

    /// 强制发布（最终进度、完成事件）
    pub fn force_emit(&self) {
        let now_ms = self.epoch.elapsed().as_millis() as u64 + self.interval_ms + 1;
        self.last_emit_ms.store(now_ms, Ordering::Relaxed);
    }

    /// 重置节流状态
    pub fn reset(&self) {
        self.last_emit_ms.store(0, Ordering::Relaxed);
    }
}

impl Default for Throttler {
    fn default() -> Self {
        Self::with_millis(DEFAULT_THROTTLE_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_first_emit_passes() {
        let throttler = Throttler::with_millis(100);
        assert!(throttler.should_emit());
        assert!(!throttler.should_emit());
    }

    #[test]
    fn test_emit_after_interval() {
        let throttler = Throttler::with_millis(30);
        assert!(throttler.should_emit());

        thread::sleep(Duration::from_millis(40));
        assert!(throttler.should_emit());
    }

    #[test]
    fn test_reset_reopens() {
        let throttler = Throttler::with_millis(1000);
        assert!(throttler.should_emit());
        assert!(!throttler.should_emit());

        throttler.reset();
        assert!(throttler.should_emit());
    }
}
