// 并发闸门
//
// 计数信号量，限制同时进行的分片上传数量：
// - acquire() 挂起等待许可（FIFO 排队，tokio Semaphore 保证）
// - 许可以 RAII 守卫形式持有，任何退出路径（包括错误路径）都自动归还
// - 不内置超时，调用方自行组合取消令牌
//
// 另含分片槽位池：为并发中的分片分配小整数槽位ID，便于日志追踪

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::info;

/// 并发闸门
///
/// 许可数量可在运行时调整（网络自适应控制器调用 resize）：
/// - 扩容：立即补充许可
/// - 缩容：异步逐个回收许可（已发出的许可不受影响，归还后不再复用）
#[derive(Debug)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    limit: AtomicUsize,
}

/// 闸门许可（RAII 守卫）
///
/// Drop 时自动归还许可并唤醒等待队列中最早的等待者
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyGate {
    /// 创建闸门
    ///
    /// # 参数
    /// * `permits` - 初始许可数（至少为 1）
    pub fn new(permits: usize) -> Self {
        let permits = permits.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
            limit: AtomicUsize::new(permits),
        }
    }

    /// 获取一个许可，无可用许可时挂起等待
    ///
    /// 等待者按 FIFO 顺序被唤醒
    pub async fn acquire(&self) -> GatePermit {
        // Semaphore 只有在 close() 后才返回 Err，闸门从不关闭
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("信号量不应被关闭");
        GatePermit { _permit: permit }
    }

    /// 非阻塞尝试获取许可
    pub fn try_acquire(&self) -> Option<GatePermit> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| GatePermit { _permit: permit })
    }

    /// 当前可用许可数
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// 当前许可上限
    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::SeqCst)
    }

    /// 动态调整许可上限
    ///
    /// 缩容时通过异步获取后 forget 的方式逐个回收许可，
    /// 正在使用中的许可不会被打断
    pub fn resize(&self, new_limit: usize) {
        let new_limit = new_limit.max(1);
        let old_limit = self.limit.swap(new_limit, Ordering::SeqCst);

        if new_limit == old_limit {
            return;
        }

        info!("🔧 动态调整并发闸门上限: {} -> {}", old_limit, new_limit);

        if new_limit > old_limit {
            self.semaphore.add_permits(new_limit - old_limit);
        } else {
            for _ in 0..(old_limit - new_limit) {
                let semaphore = self.semaphore.clone();
                tokio::spawn(async move {
                    if let Ok(permit) = semaphore.acquire_owned().await {
                        permit.forget();
                    }
                });
            }
        }
    }
}

/// 分片槽位池
///
/// 为每个正在上传的分片分配一个唯一的槽位ID（1..=max_slots），
/// 分片完成后归还，确保同一时刻每个槽位只有一个分片在使用
#[derive(Debug)]
pub struct SlotPool {
    available: parking_lot::Mutex<Vec<usize>>,
    max_slots: usize,
}

impl SlotPool {
    pub fn new(max_slots: usize) -> Self {
        // 从大到小初始化，pop 时先得到小的槽位
        let slots: Vec<usize> = (1..=max_slots).rev().collect();
        Self {
            available: parking_lot::Mutex::new(slots),
            max_slots,
        }
    }

    /// 取一个空闲槽位，用尽时返回备用ID（max_slots + 1）
    pub fn acquire(&self) -> usize {
        self.available.lock().pop().unwrap_or(self.max_slots + 1)
    }

    /// 归还槽位
    pub fn release(&self, slot_id: usize) {
        if slot_id <= self.max_slots {
            let mut slots = self.available.lock();
            if !slots.contains(&slot_id) {
                slots.push(slot_id);
            }
        }
    }
}
