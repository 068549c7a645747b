// 滑动窗口速度估算器
//
// 把 (字节数, 耗时) 样本转换为瞬时速度与平均速度：
// - 短期窗口（最近 N 个样本）：瞬时速度与中位数，避免单次抖动误判
// - EWMA（α=0.85）：长期平均，用于动态超时与自适应分片大小

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// 短期速度窗口默认大小
pub const DEFAULT_WINDOW_SIZE: usize = 7;

/// 窗口最小样本数（低于此数量不产生中位数）
const MIN_WINDOW_SAMPLES: usize = 3;

/// EWMA 平滑系数（旧值权重）
const EWMA_ALPHA: f64 = 0.85;

/// 速度估算器
///
/// 线程安全：窗口用 parking_lot Mutex 保护，EWMA 与累计量用原子存储
/// （f64 以 to_bits 形式存入 AtomicU64）
#[derive(Debug)]
pub struct SpeedEstimator {
    /// 最近 N 个样本的速度（bytes/s）
    window: parking_lot::Mutex<VecDeque<f64>>,
    window_size: usize,
    /// EWMA 平均速度（bytes/s，f64::to_bits 存储）
    ewma_bps: AtomicU64,
    /// 样本计数
    sample_count: AtomicU64,
    /// 累计字节数
    total_bytes: AtomicU64,
}

impl SpeedEstimator {
    pub fn new(window_size: usize) -> Self {
        Self {
            window: parking_lot::Mutex::new(VecDeque::with_capacity(window_size)),
            window_size: window_size.max(1),
            ewma_bps: AtomicU64::new(0f64.to_bits()),
            sample_count: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
        }
    }

    /// 记录一次传输样本
    ///
    /// # 参数
    /// * `bytes` - 本次传输字节数
    /// * `elapsed` - 本次传输耗时
    ///
    /// # 返回
    /// 本次样本的速度（bytes/s）
    pub fn record(&self, bytes: u64, elapsed: Duration) -> f64 {
        let elapsed_secs = elapsed.as_secs_f64();
        if elapsed_secs <= 0.0 {
            return 0.0;
        }
        let speed_bps = bytes as f64 / elapsed_secs;

        // 更新短期窗口
        {
            let mut window = self.window.lock();
            window.push_back(speed_bps);
            if window.len() > self.window_size {
                window.pop_front();
            }
        }

        // 更新 EWMA
        let count = self.sample_count.fetch_add(1, Ordering::SeqCst) + 1;
        let current = f64::from_bits(self.ewma_bps.load(Ordering::SeqCst));
        let new_ewma = if count == 1 {
            speed_bps
        } else {
            current * EWMA_ALPHA + speed_bps * (1.0 - EWMA_ALPHA)
        };
        self.ewma_bps.store(new_ewma.to_bits(), Ordering::SeqCst);

        self.total_bytes.fetch_add(bytes, Ordering::SeqCst);

        speed_bps
    }

    /// 瞬时速度：短期窗口的算术平均（bytes/s），无样本时为 0
    pub fn instant_bps(&self) -> f64 {
        let window = self.window.lock();
        if window.is_empty() {
            return 0.0;
        }
        window.iter().sum::<f64>() / window.len() as f64
    }

    /// 短期窗口中位数（bytes/s），样本不足时为 None
    pub fn window_median(&self) -> Option<f64> {
        let window = self.window.lock();
        if window.len() < MIN_WINDOW_SAMPLES {
            return None;
        }

        let mut speeds: Vec<f64> = window.iter().copied().collect();
        speeds.sort_by(|a, b| a.partial_cmp(b).unwrap());

        let mid = speeds.len() / 2;
        let median = if speeds.len() % 2 == 0 {
            (speeds[mid - 1] + speeds[mid]) / 2.0
        } else {
            speeds[mid]
        };
        Some(median)
    }

    /// 平均速度（EWMA，bytes/s）
    pub fn average_bps(&self) -> f64 {
        f64::from_bits(self.ewma_bps.load(Ordering::SeqCst))
    }

    /// 是否已有样本
    pub fn has_samples(&self) -> bool {
        self.sample_count.load(Ordering::SeqCst) > 0
    }

    /// 累计传输字节数
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::SeqCst)
    }

    /// 清空窗口与统计（任务数变化、带宽重新分配时调用）
    pub fn reset(&self) {
        self.window.lock().clear();
        self.ewma_bps.store(0f64.to_bits(), Ordering::SeqCst);
        self.sample_count.store(0, Ordering::SeqCst);
        self.total_bytes.store(0, Ordering::SeqCst);
    }
}

impl Default for SpeedEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_basic_speed() {
        let estimator = SpeedEstimator::default();

        // 1MB / 1秒 = 1MB/s
        let speed = estimator.record(1024 * 1024, Duration::from_secs(1));
        assert!((speed - 1024.0 * 1024.0).abs() < 1.0);
        assert!((estimator.instant_bps() - 1024.0 * 1024.0).abs() < 1.0);
        assert_eq!(estimator.total_bytes(), 1024 * 1024);
    }

    #[test]
    fn test_zero_elapsed_ignored() {
        let estimator = SpeedEstimator::default();
        assert_eq!(estimator.record(1024, Duration::ZERO), 0.0);
        assert!(!estimator.has_samples());
    }

    #[test]
    fn test_window_rolls_over() {
        let estimator = SpeedEstimator::new(3);

        for i in 1..=5u64 {
            estimator.record(i * 1000, Duration::from_secs(1));
        }

        // 窗口只保留最近 3 个样本：3000, 4000, 5000
        assert!((estimator.instant_bps() - 4000.0).abs() < 1.0);
        assert_eq!(estimator.window_median(), Some(4000.0));
    }

    #[test]
    fn test_median_requires_samples() {
        let estimator = SpeedEstimator::default();
        estimator.record(1000, Duration::from_secs(1));
        assert!(estimator.window_median().is_none());

        estimator.record(2000, Duration::from_secs(1));
        estimator.record(3000, Duration::from_secs(1));
        assert_eq!(estimator.window_median(), Some(2000.0));
    }

    #[test]
    fn test_ewma_follows_samples() {
        let estimator = SpeedEstimator::default();

        estimator.record(1000, Duration::from_secs(1));
        assert!((estimator.average_bps() - 1000.0).abs() < 1.0);

        // 第二个样本按 0.85/0.15 混入
        estimator.record(2000, Duration::from_secs(1));
        let expected = 1000.0 * 0.85 + 2000.0 * 0.15;
        assert!((estimator.average_bps() - expected).abs() < 1.0);
    }

    #[test]
    fn test_reset() {
        let estimator = SpeedEstimator::default();
        estimator.record(1000, Duration::from_secs(1));

        estimator.reset();
        assert_eq!(estimator.instant_bps(), 0.0);
        assert_eq!(estimator.average_bps(), 0.0);
        assert_eq!(estimator.total_bytes(), 0);
    }
}
