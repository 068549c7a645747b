// 上传引擎模块
//
// 组件分层：
// - 叶子：分片模型 / 指纹 / 重试策略 / 取消控制 / 网络自适应
// - 编排：分片传输单元（单文件）与上传调度器（多任务）

pub mod adapt;
pub mod cancel;
pub mod chunk;
pub mod engine;
pub mod fingerprint;
pub mod retry;
pub mod scheduler;
pub mod task;

pub use adapt::{
    AdaptiveConfig, ConnectionKind, ConnectionSignal, NetworkAdaptationController, NetworkQuality,
};
pub use cancel::CancelRegistry;
pub use chunk::{
    chunk_count, optimal_chunk_size, plan_chunks, ChunkInfo, ChunkManager, ChunkSnapshot,
    ChunkStatus,
};
pub use engine::{ChunkTransferUnit, RunOutcome};
pub use fingerprint::{compute_fingerprint, DedupChecker, DedupOutcome, FileFingerprint};
pub use retry::{classify, ErrorClass, ResolvedRetry, RetryDecider, RetryPolicy, RetryStrategy};
pub use scheduler::{UploadScheduler, UploadStats, ValidationError};
pub use task::{FileSource, TaskOptions, TaskPriority, TaskStatus, UploadTask};
