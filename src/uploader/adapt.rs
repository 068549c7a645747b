// 网络自适应控制器
//
// 三层推导：
// 1. 连接类型粗映射 -> 基础参数表（分片大小 / 文件并发 / 分片并发 / 超时）
// 2. 实测 downlink 与 RTT 精调（低带宽或高延迟降并发缩分片，反之放大）
// 3. 上传速度历史兜底（历史持续慢速时即使链路报告很快也强制保守）
// 最后全部钳制到用户配置的 min/max 边界
//
// 重算时机：连接变化事件触发，平时按新鲜度窗口惰性重算
// 质量标签 good/fair/poor 由加权评分得出，阈值走配置而非硬编码

use crate::common::SpeedEstimator;
use crate::config::{AdaptationConfig, UploadConfig};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// 连接类型（浏览器 Network Information API 的粗粒度标签等价物）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionKind {
    Slow2g,
    Cell2g,
    Cell3g,
    Cell4g,
    Cell5g,
    Wifi,
    Ethernet,
    Unknown,
}

/// 连接变化信号
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConnectionSignal {
    pub kind: ConnectionKind,
    /// 下行带宽（Mbps）
    pub downlink_mbps: f64,
    /// 往返时延（毫秒）
    pub rtt_ms: u64,
}

/// 网络质量标签
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NetworkQuality {
    Good,
    Fair,
    Poor,
}

impl NetworkQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkQuality::Good => "good",
            NetworkQuality::Fair => "fair",
            NetworkQuality::Poor => "poor",
        }
    }
}

/// 自适应配置输出
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    pub chunk_size: u64,
    pub max_concurrent_files: usize,
    pub max_concurrent_chunks: usize,
    /// 分片请求超时（秒）
    pub timeout_secs: u64,
    pub quality: NetworkQuality,
}

/// 基础参数表条目：(分片大小, 文件并发, 分片并发, 超时秒)
fn base_profile(kind: ConnectionKind, config: &UploadConfig) -> (u64, usize, usize, u64) {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * 1024;
    match kind {
        ConnectionKind::Slow2g => (256 * KB, 1, 1, 180),
        ConnectionKind::Cell2g => (512 * KB, 1, 1, 120),
        ConnectionKind::Cell3g => (MB, 2, 2, 90),
        ConnectionKind::Cell4g => (4 * MB, 3, 4, 60),
        ConnectionKind::Cell5g => (8 * MB, 4, 6, 45),
        ConnectionKind::Wifi => (8 * MB, 4, 6, 45),
        ConnectionKind::Ethernet => (16 * MB, 4, 8, 30),
        ConnectionKind::Unknown => (
            config.chunk_size,
            config.max_concurrent_files,
            config.max_concurrent_chunks,
            config.chunk_timeout_secs,
        ),
    }
}

/// 动态超时的安全系数与范围（按实测速度推导单分片超时）
const TIMEOUT_SAFETY_FACTOR: f64 = 3.0;
const MIN_TIMEOUT_SECS: u64 = 30;
const MAX_TIMEOUT_SECS: u64 = 180;

/// 网络自适应控制器
///
/// 单写者：只有控制器自身改写缓存的自适应配置；
/// 速度历史通过 record_speed 从分片完成路径汇入
#[derive(Debug)]
pub struct NetworkAdaptationController {
    /// 最近一次连接信号
    signal: parking_lot::Mutex<Option<ConnectionSignal>>,
    /// 上传速度历史
    history: SpeedEstimator,
    /// 缓存的自适应配置与计算时刻
    cached: parking_lot::Mutex<Option<(Instant, AdaptiveConfig)>>,
    /// 用户配置边界
    bounds: UploadConfig,
    /// 阈值等调优参数
    tuning: AdaptationConfig,
}

impl NetworkAdaptationController {
    pub fn new(bounds: UploadConfig, tuning: AdaptationConfig) -> Self {
        let history = SpeedEstimator::new(tuning.speed_history_size);
        Self {
            signal: parking_lot::Mutex::new(None),
            history,
            cached: parking_lot::Mutex::new(None),
            bounds,
            tuning,
        }
    }

    /// 连接变化事件：记录信号并立即作废缓存
    pub fn on_connection_change(&self, signal: ConnectionSignal) {
        info!(
            "连接变化: kind={:?}, downlink={:.1} Mbps, rtt={}ms",
            signal.kind, signal.downlink_mbps, signal.rtt_ms
        );
        *self.signal.lock() = Some(signal);
        *self.cached.lock() = None;
    }

    /// 汇入一个上传速度样本
    pub fn record_speed(&self, bytes: u64, elapsed: Duration) {
        self.history.record(bytes, elapsed);
    }

    /// 实测平均速度（bytes/s），无样本时为 None
    pub fn average_speed_bps(&self) -> Option<f64> {
        if self.history.has_samples() {
            Some(self.history.average_bps())
        } else {
            None
        }
    }

    /// 获取自适应配置
    ///
    /// 缓存超过新鲜度窗口时重算，否则直接返回缓存值
    pub fn adaptive_config(&self) -> AdaptiveConfig {
        let freshness = Duration::from_millis(self.tuning.freshness_ms);
        {
            let cached = self.cached.lock();
            if let Some((computed_at, config)) = cached.as_ref() {
                if computed_at.elapsed() < freshness {
                    return *config;
                }
            }
        }

        let config = self.compute();
        *self.cached.lock() = Some((Instant::now(), config));
        config
    }

    /// 实际重算
    fn compute(&self) -> AdaptiveConfig {
        let signal = *self.signal.lock();
        let kind = signal.map(|s| s.kind).unwrap_or(ConnectionKind::Unknown);

        // 1. 基础参数表
        let (mut chunk_size, mut max_files, mut max_chunks, mut timeout_secs) =
            base_profile(kind, &self.bounds);

        // 2. downlink / RTT 精调
        if let Some(signal) = signal {
            if signal.downlink_mbps > 0.0 && signal.downlink_mbps < 1.0 || signal.rtt_ms > 600 {
                max_files = (max_files / 2).max(1);
                max_chunks = (max_chunks / 2).max(1);
                chunk_size /= 2;
                timeout_secs = timeout_secs.saturating_add(30);
            } else if signal.downlink_mbps > 50.0 && signal.rtt_ms < 50 {
                max_chunks += 2;
                chunk_size = chunk_size.saturating_mul(2);
            }
        }

        // 3. 速度历史兜底：历史持续慢速时强制保守参数
        let history_bps = self.average_speed_bps();
        if let Some(bps) = history_bps {
            if (bps as u64) < self.tuning.slow_speed_bps {
                debug!(
                    "历史速度持续偏慢 ({:.0} bytes/s < {})，强制保守参数",
                    bps, self.tuning.slow_speed_bps
                );
                max_files = 1;
                max_chunks = 1;
                chunk_size = self.bounds.min_chunk_size;
            }
            // 动态超时：单分片传输理论耗时 * 安全系数
            if bps > 0.0 {
                let theoretical = chunk_size as f64 / bps;
                timeout_secs = ((theoretical * TIMEOUT_SAFETY_FACTOR) as u64)
                    .clamp(MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS);
            }
        }

        // 4. 钳制到用户配置边界
        chunk_size = chunk_size.clamp(self.bounds.min_chunk_size, self.bounds.max_chunk_size);
        max_files = max_files.clamp(1, self.bounds.max_concurrent_files);
        max_chunks = max_chunks.clamp(1, self.bounds.max_concurrent_chunks);

        let quality = self.quality(signal, history_bps);

        let adaptive = AdaptiveConfig {
            chunk_size,
            max_concurrent_files: max_files,
            max_concurrent_chunks: max_chunks,
            timeout_secs,
            quality,
        };
        debug!(
            "自适应配置重算: kind={:?}, chunk={} bytes, files={}, chunks={}, timeout={}s, quality={}",
            kind, chunk_size, max_files, max_chunks, timeout_secs, quality.as_str()
        );
        adaptive
    }

    /// 加权质量评分（0-100）：连接类型 30% + downlink 30% + RTT 20% + 历史速度 20%
    fn score(&self, signal: Option<ConnectionSignal>, history_bps: Option<f64>) -> u32 {
        let kind_score: f64 = match signal.map(|s| s.kind) {
            Some(ConnectionKind::Slow2g) => 0.0,
            Some(ConnectionKind::Cell2g) => 10.0,
            Some(ConnectionKind::Cell3g) => 40.0,
            Some(ConnectionKind::Cell4g) => 70.0,
            Some(ConnectionKind::Cell5g) => 90.0,
            Some(ConnectionKind::Wifi) => 85.0,
            Some(ConnectionKind::Ethernet) => 100.0,
            Some(ConnectionKind::Unknown) | None => 50.0,
        };

        let downlink_score: f64 = match signal {
            Some(s) if s.downlink_mbps > 0.0 => (s.downlink_mbps / 50.0 * 100.0).min(100.0),
            _ => 50.0,
        };

        let rtt_score: f64 = match signal {
            Some(s) if s.rtt_ms > 0 => {
                // 50ms 以内满分，600ms 以上 0 分
                let clamped = s.rtt_ms.clamp(50, 600) as f64;
                (600.0 - clamped) / 550.0 * 100.0
            }
            _ => 50.0,
        };

        let history_score: f64 = match history_bps {
            Some(bps) => {
                let fast = self.tuning.fast_speed_bps as f64;
                (bps / fast * 100.0).min(100.0)
            }
            None => 50.0,
        };

        (kind_score * 0.3 + downlink_score * 0.3 + rtt_score * 0.2 + history_score * 0.2).round()
            as u32
    }

    fn quality(&self, signal: Option<ConnectionSignal>, history_bps: Option<f64>) -> NetworkQuality {
        let score = self.score(signal, history_bps);
        if score >= self.tuning.good_score {
            NetworkQuality::Good
        } else if score >= self.tuning.fair_score {
            NetworkQuality::Fair
        } else {
            NetworkQuality::Poor
        }
    }

    /// 仅凭一个实时吞吐读数判定质量（调度器速度变化时调用）
    pub fn quality_from_speed(&self, speed_bps: u64) -> NetworkQuality {
        if speed_bps >= self.tuning.fast_speed_bps {
            NetworkQuality::Good
        } else if speed_bps >= self.tuning.slow_speed_bps {
            NetworkQuality::Fair
        } else {
            NetworkQuality::Poor
        }
    }

    /// 重置速度历史（任务数变化、带宽重新分配时）
    pub fn reset_history(&self) {
        self.history.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    fn controller() -> NetworkAdaptationController {
        NetworkAdaptationController::new(UploadConfig::default(), AdaptationConfig::default())
    }

    fn signal(kind: ConnectionKind, downlink_mbps: f64, rtt_ms: u64) -> ConnectionSignal {
        ConnectionSignal {
            kind,
            downlink_mbps,
            rtt_ms,
        }
    }

    #[test]
    fn test_unknown_signal_uses_config_defaults() {
        let ctrl = controller();
        let adaptive = ctrl.adaptive_config();

        let bounds = UploadConfig::default();
        assert_eq!(adaptive.chunk_size, bounds.chunk_size);
        assert_eq!(adaptive.max_concurrent_files, bounds.max_concurrent_files);
        assert_eq!(adaptive.max_concurrent_chunks, bounds.max_concurrent_chunks);
    }

    #[test]
    fn test_slow2g_hits_floor() {
        let ctrl = controller();
        ctrl.on_connection_change(signal(ConnectionKind::Slow2g, 0.05, 2000));

        let adaptive = ctrl.adaptive_config();
        assert_eq!(adaptive.max_concurrent_chunks, 1);
        assert_eq!(adaptive.max_concurrent_files, 1);
        // 基表 256KB 且低带宽再减半，钳回配置下限
        assert_eq!(adaptive.chunk_size, UploadConfig::default().min_chunk_size);
        assert_eq!(adaptive.quality, NetworkQuality::Poor);
    }

    #[test]
    fn test_downlink_drop_triggers_recompute() {
        let ctrl = controller();

        ctrl.on_connection_change(signal(ConnectionKind::Wifi, 100.0, 20));
        let fast = ctrl.adaptive_config();
        assert!(fast.max_concurrent_chunks > 1);

        // 从快链路掉到 slow-2g：连接事件立即作废缓存
        ctrl.on_connection_change(signal(ConnectionKind::Slow2g, 0.05, 2000));
        let slow = ctrl.adaptive_config();

        assert_eq!(slow.max_concurrent_chunks, 1);
        assert_eq!(slow.chunk_size, UploadConfig::default().min_chunk_size);
    }

    #[test]
    fn test_fast_link_expands_within_bounds() {
        let ctrl = controller();
        ctrl.on_connection_change(signal(ConnectionKind::Ethernet, 900.0, 5));

        let adaptive = ctrl.adaptive_config();
        let bounds = UploadConfig::default();
        // 永不超过用户配置上限
        assert!(adaptive.max_concurrent_chunks <= bounds.max_concurrent_chunks);
        assert!(adaptive.max_concurrent_files <= bounds.max_concurrent_files);
        assert!(adaptive.chunk_size <= bounds.max_chunk_size);
        assert_eq!(adaptive.quality, NetworkQuality::Good);
    }

    #[test]
    fn test_slow_history_forces_conservative_despite_fast_link() {
        let ctrl = controller();
        ctrl.on_connection_change(signal(ConnectionKind::Wifi, 100.0, 20));

        // 喂入持续慢速的历史（~10 KB/s）
        for _ in 0..10 {
            ctrl.record_speed(10 * 1024, Duration::from_secs(1));
        }

        let adaptive = ctrl.adaptive_config();
        assert_eq!(adaptive.max_concurrent_chunks, 1);
        assert_eq!(adaptive.max_concurrent_files, 1);
        assert_eq!(adaptive.chunk_size, UploadConfig::default().min_chunk_size);
    }

    #[test]
    fn test_dynamic_timeout_from_history() {
        let ctrl = controller();
        ctrl.on_connection_change(signal(ConnectionKind::Cell4g, 10.0, 100));

        // ~1 MB/s 历史速度，4MB 分片理论 4 秒 * 3 = 12s，钳到最小 30s
        for _ in 0..5 {
            ctrl.record_speed(MB, Duration::from_secs(1));
        }

        let adaptive = ctrl.adaptive_config();
        assert_eq!(adaptive.timeout_secs, 30);
    }

    #[test]
    fn test_quality_from_speed_thresholds() {
        let ctrl = controller();
        let tuning = AdaptationConfig::default();

        assert_eq!(
            ctrl.quality_from_speed(tuning.fast_speed_bps),
            NetworkQuality::Good
        );
        assert_eq!(
            ctrl.quality_from_speed(tuning.slow_speed_bps),
            NetworkQuality::Fair
        );
        assert_eq!(
            ctrl.quality_from_speed(tuning.slow_speed_bps / 2),
            NetworkQuality::Poor
        );
    }

    #[test]
    fn test_cache_freshness_window() {
        let mut tuning = AdaptationConfig::default();
        tuning.freshness_ms = 60_000;
        let ctrl = NetworkAdaptationController::new(UploadConfig::default(), tuning);

        ctrl.on_connection_change(signal(ConnectionKind::Wifi, 100.0, 20));
        let first = ctrl.adaptive_config();

        // 新鲜度窗口内喂入慢速历史，但无连接事件 -> 仍返回缓存值
        for _ in 0..10 {
            ctrl.record_speed(10 * 1024, Duration::from_secs(1));
        }
        let second = ctrl.adaptive_config();
        assert_eq!(first.max_concurrent_chunks, second.max_concurrent_chunks);
    }
}
