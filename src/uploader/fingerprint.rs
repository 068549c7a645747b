// 文件指纹与秒传检查
//
// 指纹构成：
// 1. 文件完整 MD5 (content_md5)
// 2. 文件前 256KB 的 MD5 (slice_md5)，大文件快速预判用
// 3. 文件大小 + 修改时间
//
// 秒传流程：先查本地缓存标记，再调服务端存在性检查；
// 任一命中即跳过整个分片上传。检查失败不致命，回落到普通上传

use crate::common::BoundedCache;
use crate::transport::{ExistsRequest, StoredFile, UploadTransport};
use crate::uploader::task::FileSource;
use anyhow::{Context, Result};
use md5::Context as Md5Context;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 前 256KB 切片大小
const SLICE_SIZE: usize = 256 * 1024;

/// 读缓冲区大小
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// 文件指纹
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileFingerprint {
    /// 完整内容 MD5
    pub content_md5: String,
    /// 前 256KB MD5
    pub slice_md5: String,
    /// 文件大小
    pub file_size: u64,
    /// 最后修改时间（Unix 毫秒）
    pub modified_ms: i64,
}

impl FileFingerprint {
    /// 缓存/服务端使用的稳定键
    pub fn key(&self) -> String {
        format!("{}-{}", self.content_md5, self.file_size)
    }
}

/// 同步计算指纹（在阻塞线程池或降级的当前线程里执行）
fn compute_fingerprint_sync(path: &Path, modified_ms: i64) -> Result<FileFingerprint> {
    let file = std::fs::File::open(path).with_context(|| format!("无法打开文件: {:?}", path))?;
    let metadata = file.metadata().context("无法获取文件元数据")?;
    let file_size = metadata.len();

    let mut reader = std::io::BufReader::with_capacity(1024 * 1024, file);
    let mut full_hasher = Md5Context::new();
    let mut slice_hasher = Md5Context::new();
    let mut slice_bytes_read = 0usize;
    let mut buffer = [0u8; READ_BUFFER_SIZE];

    loop {
        let bytes_read = reader.read(&mut buffer).context("读取文件失败")?;
        if bytes_read == 0 {
            break;
        }

        full_hasher.consume(&buffer[..bytes_read]);

        if slice_bytes_read < SLICE_SIZE {
            let remaining = SLICE_SIZE - slice_bytes_read;
            let take = bytes_read.min(remaining);
            slice_hasher.consume(&buffer[..take]);
            slice_bytes_read += take;
        }
    }

    let fingerprint = FileFingerprint {
        content_md5: format!("{:x}", full_hasher.compute()),
        slice_md5: format!("{:x}", slice_hasher.compute()),
        file_size,
        modified_ms,
    };

    debug!(
        "指纹计算完成: path={:?}, size={}, content_md5={}",
        path, file_size, fingerprint.content_md5
    );
    Ok(fingerprint)
}

/// 计算文件指纹
///
/// CPU 密集的哈希优先投递到阻塞线程池；线程池投递失败时
/// 优雅降级为当前线程直接计算。计算前后各检查一次取消令牌
/// （哈希本身无法被令牌打断，只能在安全点协作检查）
pub async fn compute_fingerprint(
    file: &FileSource,
    token: &CancellationToken,
) -> Result<FileFingerprint> {
    if token.is_cancelled() {
        anyhow::bail!("指纹计算前任务已取消");
    }

    let path = file.path.clone();
    let modified_ms = file.modified_ms;

    let result = match tokio::task::spawn_blocking({
        let path = path.clone();
        move || compute_fingerprint_sync(&path, modified_ms)
    })
    .await
    {
        Ok(result) => result,
        Err(join_error) => {
            // 阻塞线程池不可用：降级到当前线程
            warn!("哈希线程池投递失败，降级为当前线程计算: {}", join_error);
            compute_fingerprint_sync(&path, modified_ms)
        }
    }?;

    if token.is_cancelled() {
        anyhow::bail!("指纹计算后任务已取消");
    }

    Ok(result)
}

/// 秒传检查结果
#[derive(Debug, Clone)]
pub enum DedupOutcome {
    /// 命中：服务端已有同指纹文件，直接完成
    Hit {
        fingerprint: FileFingerprint,
        stored: Option<StoredFile>,
    },
    /// 未命中：走普通分片上传
    Miss { fingerprint: FileFingerprint },
}

/// 缓存里的秒传标记值
pub const UPLOADED_MARKER: &str = "uploaded";

fn marker_key(fingerprint: &FileFingerprint) -> String {
    format!("dedup:{}", fingerprint.key())
}

/// 秒传检查器
pub struct DedupChecker {
    transport: Arc<dyn UploadTransport>,
    cache: Arc<BoundedCache>,
    /// 是否启用缓存标记
    use_cache: bool,
}

impl DedupChecker {
    pub fn new(transport: Arc<dyn UploadTransport>, cache: Arc<BoundedCache>, use_cache: bool) -> Self {
        Self {
            transport,
            cache,
            use_cache,
        }
    }

    /// 执行秒传检查
    ///
    /// 顺序：缓存标记 -> 服务端存在性检查。
    /// 服务端检查失败按未命中处理（非致命，回落到普通上传）
    pub async fn check(
        &self,
        file: &FileSource,
        token: &CancellationToken,
    ) -> Result<DedupOutcome> {
        let fingerprint = compute_fingerprint(file, token).await?;

        // 1. 本地缓存标记
        if self.use_cache {
            if let Some(value) = self.cache.get(&marker_key(&fingerprint)) {
                if value == serde_json::json!(UPLOADED_MARKER) {
                    info!(
                        "秒传命中（本地缓存标记）: file={}, key={}",
                        file.file_name,
                        fingerprint.key()
                    );
                    return Ok(DedupOutcome::Hit {
                        fingerprint,
                        stored: None,
                    });
                }
            }
        }

        if token.is_cancelled() {
            anyhow::bail!("存在性检查前任务已取消");
        }

        // 2. 服务端存在性检查
        let request = ExistsRequest {
            file_id: fingerprint.key(),
            file_name: file.file_name.clone(),
            file_size: file.size,
        };

        match self.transport.check_exists(request).await {
            Ok(response) if response.exists => {
                info!(
                    "秒传命中（服务端）: file={}, key={}",
                    file.file_name,
                    fingerprint.key()
                );
                self.write_marker(&fingerprint);
                Ok(DedupOutcome::Hit {
                    fingerprint,
                    stored: response.file,
                })
            }
            Ok(_) => Ok(DedupOutcome::Miss { fingerprint }),
            Err(error) => {
                // 检查失败不致命
                warn!(
                    "存在性检查失败，回落到普通上传: file={}, error={}",
                    file.file_name, error
                );
                Ok(DedupOutcome::Miss { fingerprint })
            }
        }
    }

    /// 写入秒传标记（上传成功后也会调用）
    pub fn write_marker(&self, fingerprint: &FileFingerprint) {
        if self.use_cache {
            self.cache
                .put(&marker_key(fingerprint), serde_json::json!(UPLOADED_MARKER));
        }
    }
}
