//! 公共模块
//!
//! 不依赖引擎其他模块的叶子工具：
//! - 并发闸门（计数信号量 + 槽位池）
//! - 滑动窗口速度估算器
//! - 进度事件节流器
//! - 有界缓存（TTL + LRU）

pub mod cache;
pub mod gate;
pub mod speed;
pub mod throttle;

pub use cache::{BoundedCache, CacheExportEntry, DEFAULT_MAX_ENTRIES, DEFAULT_TTL_SECS};
pub use gate::{ConcurrencyGate, GatePermit, SlotPool};
pub use speed::{SpeedEstimator, DEFAULT_WINDOW_SIZE};
pub use throttle::{Throttler, DEFAULT_THROTTLE_MS};
