// 取消控制器
//
// 一等公民的可组合取消令牌（替代循环里查布尔标志的做法）：
// - 每个任务一个父令牌，每个分片从父令牌派生子令牌
// - 取消父令牌会级联取消全部子令牌（组合取消，而非各自独立）
// - 暂停是独立的协作式标志：只拦新分片的发车，不打断在途请求
//
// 取消是协作式而非抢占式：令牌只能打断在途网络调用，
// CPU 密集步骤（哈希、分片构造）必须在安全点自行检查令牌

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// 单个任务的取消状态
#[derive(Debug)]
struct TaskCancelState {
    /// 任务级父令牌
    token: CancellationToken,
    /// 分片级子令牌（chunk index -> token）
    chunk_tokens: DashMap<usize, CancellationToken>,
    /// 暂停标志
    paused: Arc<AtomicBool>,
}

/// 取消控制器
///
/// 按任务 ID 持有取消令牌，任务之下按分片索引嵌套子令牌
#[derive(Debug, Default)]
pub struct CancelRegistry {
    tasks: DashMap<String, TaskCancelState>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册任务，返回任务级令牌
    ///
    /// 重复注册（恢复后再次运行）会替换为新令牌
    pub fn register_task(&self, task_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.tasks.insert(
            task_id.to_string(),
            TaskCancelState {
                token: token.clone(),
                chunk_tokens: DashMap::new(),
                paused: Arc::new(AtomicBool::new(false)),
            },
        );
        debug!("注册任务取消令牌: {}", task_id);
        token
    }

    /// 任务级令牌（未注册时返回 None）
    pub fn task_token(&self, task_id: &str) -> Option<CancellationToken> {
        self.tasks.get(task_id).map(|state| state.token.clone())
    }

    /// 派生分片级子令牌
    ///
    /// 父令牌已取消时派生的子令牌立即处于取消态
    pub fn chunk_token(&self, task_id: &str, chunk_index: usize) -> CancellationToken {
        match self.tasks.get(task_id) {
            Some(state) => {
                let child = state.token.child_token();
                state.chunk_tokens.insert(chunk_index, child.clone());
                child
            }
            None => {
                // 未注册任务：返回已取消的孤儿令牌，调用方会立即停止
                let orphan = CancellationToken::new();
                orphan.cancel();
                orphan
            }
        }
    }

    /// 取消单个分片（不影响任务和兄弟分片）
    pub fn cancel_chunk(&self, task_id: &str, chunk_index: usize) {
        if let Some(state) = self.tasks.get(task_id) {
            if let Some(token) = state.chunk_tokens.get(&chunk_index) {
                token.cancel();
                debug!("取消分片: task={}, chunk=#{}", task_id, chunk_index);
            }
        }
    }

    /// 取消任务：父令牌级联取消全部子令牌
    pub fn cancel_task(&self, task_id: &str) {
        if let Some(state) = self.tasks.get(task_id) {
            state.token.cancel();
            info!("取消任务（级联取消 {} 个分片令牌）: {}", state.chunk_tokens.len(), task_id);
        }
    }

    /// 任务是否已取消
    pub fn is_cancelled(&self, task_id: &str) -> bool {
        self.tasks
            .get(task_id)
            .map(|state| state.token.is_cancelled())
            .unwrap_or(false)
    }

    /// 暂停任务（协作式：传输单元在安全点检查后停止发车）
    pub fn pause(&self, task_id: &str) {
        if let Some(state) = self.tasks.get(task_id) {
            state.paused.store(true, Ordering::SeqCst);
            info!("暂停任务: {}", task_id);
        }
    }

    /// 恢复任务
    pub fn resume(&self, task_id: &str) {
        if let Some(state) = self.tasks.get(task_id) {
            state.paused.store(false, Ordering::SeqCst);
            info!("恢复任务: {}", task_id);
        }
    }

    /// 任务是否处于暂停
    pub fn is_paused(&self, task_id: &str) -> bool {
        self.tasks
            .get(task_id)
            .map(|state| state.paused.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// 暂停标志的共享引用（传输单元持有，避免每次查表）
    pub fn paused_flag(&self, task_id: &str) -> Option<Arc<AtomicBool>> {
        self.tasks.get(task_id).map(|state| state.paused.clone())
    }

    /// 移除任务的取消状态（任务终结后清理）
    pub fn remove_task(&self, task_id: &str) {
        self.tasks.remove(task_id);
        debug!("清理任务取消状态: {}", task_id);
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_cancel() {
        let registry = CancelRegistry::new();
        let token = registry.register_task("t1");

        assert!(!token.is_cancelled());
        registry.cancel_task("t1");
        assert!(token.is_cancelled());
        assert!(registry.is_cancelled("t1"));
    }

    #[test]
    fn test_parent_cancels_all_children() {
        let registry = CancelRegistry::new();
        registry.register_task("t1");

        let c0 = registry.chunk_token("t1", 0);
        let c1 = registry.chunk_token("t1", 1);
        let c2 = registry.chunk_token("t1", 2);

        registry.cancel_task("t1");

        assert!(c0.is_cancelled());
        assert!(c1.is_cancelled());
        assert!(c2.is_cancelled());
    }

    #[test]
    fn test_chunk_cancel_does_not_affect_siblings() {
        let registry = CancelRegistry::new();
        let parent = registry.register_task("t1");

        let c0 = registry.chunk_token("t1", 0);
        let c1 = registry.chunk_token("t1", 1);

        registry.cancel_chunk("t1", 0);

        assert!(c0.is_cancelled());
        assert!(!c1.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn test_orphan_chunk_token_already_cancelled() {
        let registry = CancelRegistry::new();
        let orphan = registry.chunk_token("missing", 0);
        assert!(orphan.is_cancelled());
    }

    #[test]
    fn test_pause_resume() {
        let registry = CancelRegistry::new();
        registry.register_task("t1");

        assert!(!registry.is_paused("t1"));
        registry.pause("t1");
        assert!(registry.is_paused("t1"));

        // 暂停不等于取消
        assert!(!registry.is_cancelled("t1"));

        registry.resume("t1");
        assert!(!registry.is_paused("t1"));
    }

    #[test]
    fn test_reregister_replaces_token() {
        let registry = CancelRegistry::new();
        let first = registry.register_task("t1");
        registry.cancel_task("t1");
        assert!(first.is_cancelled());

        // 恢复后重新注册，新令牌未取消
        let second = registry.register_task("t1");
        assert!(!second.is_cancelled());
        assert!(!registry.is_cancelled("t1"));
    }

    #[test]
    fn test_remove_task() {
        let registry = CancelRegistry::new();
        registry.register_task("t1");
        assert_eq!(registry.task_count(), 1);

        registry.remove_task("t1");
        assert_eq!(registry.task_count(), 0);
        assert!(registry.task_token("t1").is_none());
    }

    #[tokio::test]
    async fn test_cancelled_future_fires() {
        let registry = CancelRegistry::new();
        registry.register_task("t1");
        let child = registry.chunk_token("t1", 0);

        let wait = tokio::spawn(async move {
            child.cancelled().await;
            true
        });

        registry.cancel_task("t1");
        assert!(wait.await.unwrap());
    }
}
