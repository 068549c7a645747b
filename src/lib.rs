// Chunkflow
// 可断点续传的分片上传引擎核心库

// 配置管理模块
pub mod config;

// 公共基础组件（闸门/速度/节流/缓存）
pub mod common;

// 引擎上下文
pub mod context;

// 生命周期事件
pub mod events;

// 日志系统
pub mod logging;

// 传输层
pub mod transport;

// 上传引擎模块
pub mod uploader;

// 导出常用类型
pub use config::{EngineConfig, UploadConfig};
pub use context::UploadContext;
pub use events::{EventBus, UploadEvent};
pub use transport::{HttpTransport, StoredFile, UploadError, UploadTransport};
pub use uploader::{
    ChunkInfo, ChunkStatus, ChunkTransferUnit, ConnectionKind, ConnectionSignal, FileSource,
    NetworkQuality, RetryStrategy, RunOutcome, TaskOptions, TaskPriority, TaskStatus,
    UploadScheduler, UploadStats, UploadTask, ValidationError,
};
